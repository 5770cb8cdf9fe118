use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use concord_core::{EnvelopeId, InstanceId};
use concord_store::Document;

use crate::error::BusError;

/// A typed message payload.
///
/// `MESSAGE_TYPE` is stored beside the JSON so listeners can dispatch by it;
/// keep it stable across releases.
pub trait Message: Serialize + DeserializeOwned + Send + 'static {
    const MESSAGE_TYPE: &'static str;
}

/// One message addressed to one queue.
///
/// While `reserved`, exactly one consumer (`reserver`) owns the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: EnvelopeId,
    pub message_type: String,
    pub payload: serde_json::Value,
    pub exchange: String,
    pub queue: String,
    pub created_at: DateTime<Utc>,
    pub reserved: bool,
    pub reserved_time: Option<DateTime<Utc>>,
    pub reserver: Option<InstanceId>,
}

impl Document for MessageEnvelope {
    const COLLECTION: &'static str = "envelopes";

    fn key(&self) -> String {
        self.id.to_string()
    }
}

impl MessageEnvelope {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        message_type: impl Into<String>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EnvelopeId::new(),
            message_type: message_type.into(),
            payload,
            exchange: exchange.into(),
            queue: queue.into(),
            created_at: now,
            reserved: false,
            reserved_time: None,
            reserver: None,
        }
    }

    pub fn from_message<M: Message>(
        exchange: &str,
        queue: &str,
        message: &M,
        now: DateTime<Utc>,
    ) -> Result<Self, BusError> {
        let payload = serde_json::to_value(message)?;
        Ok(Self::new(exchange, queue, M::MESSAGE_TYPE, payload, now))
    }

    /// Decode the payload as `M`, checking the type tag first.
    pub fn decode<M: Message>(&self) -> Result<M, BusError> {
        if self.message_type != M::MESSAGE_TYPE {
            return Err(BusError::TypeMismatch {
                expected: M::MESSAGE_TYPE.to_string(),
                found: self.message_type.clone(),
            });
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn is_for(&self, exchange: &str, queue: &str) -> bool {
        self.exchange == exchange && self.queue == queue
    }

    pub fn is_reserved_by(&self, reserver: InstanceId) -> bool {
        self.reserved && self.reserver == Some(reserver)
    }

    pub fn reserve(&mut self, reserver: InstanceId, now: DateTime<Utc>) {
        self.reserved = true;
        self.reserved_time = Some(now);
        self.reserver = Some(reserver);
    }

    pub fn clear_reservation(&mut self) {
        self.reserved = false;
        self.reserved_time = None;
        self.reserver = None;
    }

    /// Reserved for longer than `limit` as of `now`.
    pub fn reservation_expired(&self, now: DateTime<Utc>, limit: Duration) -> bool {
        let limit = chrono::Duration::from_std(limit).unwrap_or(chrono::Duration::MAX);
        match self.reserved_time {
            Some(at) if self.reserved => now.signed_duration_since(at) > limit,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        order: u32,
    }

    impl Message for OrderPlaced {
        const MESSAGE_TYPE: &'static str = "orders.placed";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderShipped {
        order: u32,
    }

    impl Message for OrderShipped {
        const MESSAGE_TYPE: &'static str = "orders.shipped";
    }

    #[test]
    fn payload_keeps_its_type_tag() {
        let env = MessageEnvelope::from_message("ex", "q", &OrderPlaced { order: 7 }, Utc::now())
            .unwrap();
        assert_eq!(env.message_type, "orders.placed");
        assert_eq!(env.decode::<OrderPlaced>().unwrap(), OrderPlaced { order: 7 });
        assert!(matches!(
            env.decode::<OrderShipped>(),
            Err(BusError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn reservation_lifecycle() {
        let now = Utc::now();
        let consumer = InstanceId::new();
        let mut env = MessageEnvelope::new("ex", "q", "t", serde_json::json!(null), now);
        assert!(!env.reservation_expired(now, Duration::ZERO));

        env.reserve(consumer, now);
        assert!(env.is_reserved_by(consumer));
        assert!(!env.is_reserved_by(InstanceId::new()));
        assert!(!env.reservation_expired(now, Duration::from_secs(60)));
        assert!(env.reservation_expired(
            now + chrono::Duration::seconds(61),
            Duration::from_secs(60)
        ));

        env.clear_reservation();
        assert!(!env.reserved);
        assert!(env.reserver.is_none());
    }
}
