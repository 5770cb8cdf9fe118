//! Publish-to-handler flows across topology, outbox, inbox and listener.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use concord_bus::{
    BusConfig, BusError, ExchangeKind, ExpiredReservationPolicy, HandlerRegistry, Message,
    MessageBus, Outcome,
};
use concord_core::{AlertKind, InMemoryAlertSink, ManualClock, Route};
use concord_store::InMemoryStoreProvider;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct InvoiceIssued {
    number: u32,
}

impl Message for InvoiceIssued {
    const MESSAGE_TYPE: &'static str = "billing.invoice_issued";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PaymentFailed {
    number: u32,
}

impl Message for PaymentFailed {
    const MESSAGE_TYPE: &'static str = "billing.payment_failed";
}

struct Harness {
    bus: MessageBus,
    clock: Arc<ManualClock>,
    alerts: Arc<InMemoryAlertSink>,
}

impl Harness {
    fn new(config: BusConfig) -> Self {
        let clock = Arc::new(ManualClock::starting_now());
        let alerts = Arc::new(InMemoryAlertSink::new());
        let bus = MessageBus::new(
            InMemoryStoreProvider::arc(),
            Route::new("billing").unwrap(),
            config,
        )
        .unwrap()
        .with_clock(clock.clone())
        .with_alerts(alerts.clone());
        Self { bus, clock, alerts }
    }

    fn fast() -> Self {
        Self::new(
            BusConfig::default()
                .with_poll_interval(Duration::from_millis(10))
                .with_listen_wait(Duration::from_millis(50))
                .with_housekeeping_probability(0.0),
        )
    }

    fn publish(&self, exchange: &str, key: &str, number: u32) -> usize {
        let publisher = self.bus.publisher();
        let n = publisher.publish(exchange, key, &InvoiceIssued { number }).unwrap();
        publisher.send().unwrap();
        self.clock.advance(chrono::Duration::milliseconds(1));
        n
    }
}

fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}

#[test]
fn routed_publish_reaches_every_matching_queue() {
    let h = Harness::fast();
    let topology = h.bus.topology();
    let exchange = topology.declare_exchange("invoices", ExchangeKind::Topic).unwrap();
    exchange.declare_queue("ledger", ["invoice.#"]).unwrap();
    exchange.declare_queue("mailer", ["invoice.issued.*"]).unwrap();
    exchange.declare_queue("audit", ["payment.#"]).unwrap();

    assert_eq!(h.publish("invoices", "invoice.issued.eu", 1), 2);
    assert_eq!(h.publish("invoices", "invoice.voided", 2), 1);

    let drain = |queue: &str| -> Vec<u32> {
        let inbox = h.bus.inbox("invoices", queue).unwrap();
        inbox
            .poll()
            .iter()
            .map(|e| e.decode::<InvoiceIssued>().unwrap().number)
            .collect()
    };
    assert_eq!(drain("ledger"), [1, 2]);
    assert_eq!(drain("mailer"), [1]);
    assert!(drain("audit").is_empty());
}

#[test]
fn publishing_to_an_undeclared_exchange_fails() {
    let h = Harness::fast();
    let result = h.bus.publisher().publish("nowhere", "k", &InvoiceIssued { number: 1 });
    assert!(matches!(result, Err(BusError::UnknownExchange(_))));
}

#[test]
fn listener_dispatches_by_type_and_acknowledges() {
    let h = Harness::fast();
    let exchange = h.bus.topology().declare_exchange("billing", ExchangeKind::Fanout).unwrap();
    exchange.declare_queue("worker", Vec::<String>::new()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let registry = HandlerRegistry::new().register::<InvoiceIssued, _>({
        let seen = seen.clone();
        move |msg, delivery| {
            seen.lock().unwrap().push(msg.number);
            delivery.acknowledge();
        }
    });

    let listener = h.bus.listener("billing", "worker").unwrap();
    listener.listen(registry);
    for n in 1..=3 {
        h.publish("billing", "", n);
    }

    assert!(eventually(|| seen.lock().unwrap().len() == 3));
    listener.stop();
    assert!(!listener.is_listening());

    let mut numbers = seen.lock().unwrap().clone();
    numbers.sort();
    assert_eq!(numbers, [1, 2, 3]);
    assert!(h.bus.inbox("billing", "worker").unwrap().poll().is_empty());
}

#[test]
fn settlement_outcomes() {
    let h = Harness::fast();
    let exchange = h.bus.topology().declare_exchange("billing", ExchangeKind::Direct).unwrap();
    exchange.declare_queue("q", ["k"]).unwrap();

    let publisher = h.bus.publisher();
    publisher.publish("billing", "k", &PaymentFailed { number: 1 }).unwrap();
    publisher.send().unwrap();

    let inbox = h.bus.inbox("billing", "q").unwrap();
    let env = inbox.reserve_next().unwrap();

    // Unknown type: dropped and acknowledged.
    let empty = HandlerRegistry::new();
    assert_eq!(empty.dispatch(&inbox, h.alerts.as_ref(), &env), Outcome::Dropped);
    assert!(inbox.reserve_next().is_none());

    publisher.publish("billing", "k", &PaymentFailed { number: 2 }).unwrap();
    publisher.send().unwrap();
    let env = inbox.reserve_next().unwrap();

    // Unsettled: abandoned and reservable again.
    let lazy = HandlerRegistry::new().register::<PaymentFailed, _>(|_, _| {});
    assert_eq!(lazy.dispatch(&inbox, h.alerts.as_ref(), &env), Outcome::Abandoned);
    let env = inbox.reserve_next().unwrap();

    // Rejected: alert then delete.
    let strict = HandlerRegistry::new().register::<PaymentFailed, _>(|_, delivery| {
        assert!(delivery.reject("card declined"));
        assert!(!delivery.acknowledge());
    });
    assert_eq!(strict.dispatch(&inbox, h.alerts.as_ref(), &env), Outcome::Rejected);
    assert!(inbox.reserve_next().is_none());

    let rejected = h.alerts.of_kind(AlertKind::MessageRejected);
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].get("reason"), Some("card declined"));
}

#[test]
fn panicking_handler_is_alerted_and_redelivered() {
    let h = Harness::fast();
    let exchange = h.bus.topology().declare_exchange("billing", ExchangeKind::Fanout).unwrap();
    exchange.declare_queue("q", Vec::<String>::new()).unwrap();
    h.publish("billing", "", 9);

    let attempts = Arc::new(AtomicUsize::new(0));
    let registry = HandlerRegistry::new().register::<InvoiceIssued, _>({
        let attempts = attempts.clone();
        move |_, delivery| {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first delivery explodes");
            }
            delivery.acknowledge();
        }
    });

    let listener = h.bus.listener("billing", "q").unwrap();
    listener.listen(registry);
    assert!(eventually(|| attempts.load(Ordering::SeqCst) >= 2));
    drop(listener);

    let failures = h.alerts.of_kind(AlertKind::ListenerFailure);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].get("reason"), Some("first delivery explodes"));
    assert!(h.bus.inbox("billing", "q").unwrap().poll().is_empty());
}

#[test]
fn competing_consumers_never_share_a_reservation() {
    let h = Harness::fast();
    let exchange = h.bus.topology().declare_exchange("billing", ExchangeKind::Fanout).unwrap();
    exchange.declare_queue("q", Vec::<String>::new()).unwrap();

    let publisher = h.bus.publisher();
    for number in 0..60 {
        publisher.publish("billing", "", &InvoiceIssued { number }).unwrap();
    }
    publisher.send().unwrap();

    let taken: Vec<Vec<u32>> = thread::scope(|scope| {
        let joins: Vec<_> = (0..4)
            .map(|_| {
                let inbox = h.bus.inbox("billing", "q").unwrap();
                scope.spawn(move || {
                    let mut mine = Vec::new();
                    while let Some(env) = inbox.reserve_next() {
                        mine.push(env.decode::<InvoiceIssued>().unwrap().number);
                        inbox.acknowledge(&env).unwrap();
                    }
                    mine
                })
            })
            .collect();
        joins.into_iter().map(|j| j.join().unwrap()).collect()
    });

    let all: Vec<u32> = taken.into_iter().flatten().collect();
    let unique: HashSet<u32> = all.iter().copied().collect();
    assert_eq!(all.len(), unique.len(), "a message was delivered twice");
    assert_eq!(all.len(), 60, "a message was lost");
    assert_eq!(unique, (0..60).collect::<HashSet<u32>>());
    assert!(h.bus.inbox("billing", "q").unwrap().poll().is_empty());
}

#[test]
fn crashed_consumer_message_is_redelivered_after_housekeeping() {
    let h = Harness::new(
        BusConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_housekeeping_probability(0.0)
            .with_expired_reservations(ExpiredReservationPolicy::Redeliver),
    );
    let exchange = h.bus.topology().declare_exchange("billing", ExchangeKind::Fanout).unwrap();
    exchange.declare_queue("q", Vec::<String>::new()).unwrap();
    h.publish("billing", "", 5);

    {
        let crashed = h.bus.inbox("billing", "q").unwrap();
        assert!(crashed.reserve_next().is_some());
        // Dropped without acknowledging.
    }

    let survivor = h.bus.inbox("billing", "q").unwrap();
    assert!(survivor.wait_for_messages(Duration::from_millis(30)).is_empty());

    h.clock.advance(chrono::Duration::hours(23));
    assert_eq!(survivor.housekeep().unwrap(), 0);
    assert!(survivor.reserve_next().is_none());

    h.clock.advance(chrono::Duration::hours(2));
    // An empty poll housekeeps before returning.
    assert!(survivor.poll().is_empty());
    let redelivered = survivor.reserve_next().unwrap();
    assert_eq!(redelivered.decode::<InvoiceIssued>().unwrap().number, 5);
}
