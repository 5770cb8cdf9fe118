//! Exchanges, queues and bindings.
//!
//! An exchange is one document listing its queues and each queue's bound
//! routing-key patterns. Every mutation is a read-modify-write retried on
//! optimistic conflicts, so concurrent declarations converge.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use concord_core::RetryPolicy;
use concord_core::error::validate_name;
use concord_core::retry;
use concord_store::{Document, RoutedStore};

use crate::error::BusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeKind {
    /// A queue matches when one of its patterns equals the routing key.
    Direct,
    /// Every queue matches.
    Fanout,
    /// Dot-separated words; `*` matches one word, `#` zero or more.
    Topic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDeclaration {
    pub name: String,
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageExchangeDeclaration {
    pub name: String,
    pub kind: ExchangeKind,
    pub queues: Vec<QueueDeclaration>,
}

impl Document for MessageExchangeDeclaration {
    const COLLECTION: &'static str = "exchanges";

    fn key(&self) -> String {
        self.name.clone()
    }
}

impl MessageExchangeDeclaration {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            queues: Vec::new(),
        }
    }

    /// Add the queue, or replace its patterns if already declared.
    pub fn upsert_queue(&mut self, name: &str, patterns: Vec<String>) {
        match self.queues.iter_mut().find(|q| q.name == name) {
            Some(queue) => queue.patterns = patterns,
            None => self.queues.push(QueueDeclaration {
                name: name.to_string(),
                patterns,
            }),
        }
    }

    pub fn remove_queue(&mut self, name: &str) -> bool {
        let before = self.queues.len();
        self.queues.retain(|q| q.name != name);
        self.queues.len() != before
    }

    /// Queues a message with `routing_key` is delivered to, in declaration order.
    pub fn matching_queues(&self, routing_key: &str) -> Vec<&QueueDeclaration> {
        self.queues
            .iter()
            .filter(|q| match self.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => q.patterns.iter().any(|p| p == routing_key),
                ExchangeKind::Topic => q.patterns.iter().any(|p| topic_matches(p, routing_key)),
            })
            .collect()
    }
}

/// Topic-style match of a dot-separated routing key against a pattern.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    // matched[j]: the pattern words consumed so far match key[..j].
    let mut matched = vec![false; key.len() + 1];
    matched[0] = true;
    for &word in pattern {
        let mut next = vec![false; key.len() + 1];
        for j in 0..=key.len() {
            next[j] = match word {
                "#" => matched[j] || (j > 0 && next[j - 1]),
                _ => j > 0 && matched[j - 1] && (word == "*" || word == key[j - 1]),
            };
        }
        matched = next;
    }
    matched[key.len()]
}

/// Declares and inspects the routing topology of one route.
#[derive(Debug, Clone)]
pub struct Topology {
    store: RoutedStore,
    retry: RetryPolicy,
}

impl Topology {
    pub fn new(store: RoutedStore, attempts: u32) -> Self {
        Self {
            store,
            retry: RetryPolicy::backoff(
                attempts,
                std::time::Duration::from_millis(5),
                std::time::Duration::from_millis(200),
            ),
        }
    }

    /// Create the exchange, or update its kind if it already exists.
    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<Exchange, BusError> {
        validate_name("exchange", name)?;
        retry::on_conflict(&self.retry, |_| -> Result<(), BusError> {
            let mut session = self.store.session()?;
            let declaration = match session.load::<MessageExchangeDeclaration>(name)? {
                Some(existing) if existing.kind == kind => return Ok(()),
                Some(mut existing) => {
                    existing.kind = kind;
                    existing
                }
                None => MessageExchangeDeclaration::new(name, kind),
            };
            session.store(&declaration)?;
            session.save_changes()?;
            Ok(())
        })?;
        info!(exchange = name, kind = ?kind, "exchange declared");
        Ok(self.specify_exchange(name))
    }

    /// Returns true if the exchange existed.
    pub fn delete_exchange(&self, name: &str) -> Result<bool, BusError> {
        let existed = retry::on_conflict(&self.retry, |_| -> Result<bool, BusError> {
            let mut session = self.store.session()?;
            if session.load::<MessageExchangeDeclaration>(name)?.is_none() {
                return Ok(false);
            }
            session.delete::<MessageExchangeDeclaration>(name);
            session.save_changes()?;
            Ok(true)
        })?;
        if existed {
            info!(exchange = name, "exchange deleted");
        }
        Ok(existed)
    }

    /// Handle to an exchange by name. No store access happens until it is used.
    pub fn specify_exchange(&self, name: &str) -> Exchange {
        Exchange {
            name: name.to_string(),
            store: self.store.clone(),
            retry: self.retry,
        }
    }

    pub fn exchange(&self, name: &str) -> Result<Option<MessageExchangeDeclaration>, BusError> {
        Ok(self.store.session()?.load(name)?)
    }

    pub fn exchanges(&self) -> Result<Vec<MessageExchangeDeclaration>, BusError> {
        Ok(self.store.session()?.query(|_: &MessageExchangeDeclaration| true)?)
    }
}

/// Queue-level operations on one exchange.
#[derive(Debug, Clone)]
pub struct Exchange {
    name: String,
    store: RoutedStore,
    retry: RetryPolicy,
}

impl Exchange {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind `queue` with `patterns`, replacing any earlier binding.
    pub fn declare_queue<I, S>(&self, queue: &str, patterns: I) -> Result<(), BusError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        validate_name("queue", queue)?;
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        self.modify(|declaration| {
            declaration.upsert_queue(queue, patterns.clone());
            true
        })?;
        info!(exchange = %self.name, queue, patterns = ?patterns, "queue declared");
        Ok(())
    }

    /// Returns true if the queue was bound.
    pub fn delete_queue(&self, queue: &str) -> Result<bool, BusError> {
        let removed = self.modify(|declaration| declaration.remove_queue(queue))?;
        if removed {
            info!(exchange = %self.name, queue, "queue deleted");
        }
        Ok(removed)
    }

    pub fn queues(&self) -> Result<Vec<QueueDeclaration>, BusError> {
        let mut session = self.store.session()?;
        match session.load::<MessageExchangeDeclaration>(&self.name)? {
            Some(declaration) => Ok(declaration.queues),
            None => Err(BusError::UnknownExchange(self.name.clone())),
        }
    }

    /// Apply `change` to the stored declaration; it returns whether anything changed.
    fn modify<F>(&self, change: F) -> Result<bool, BusError>
    where
        F: Fn(&mut MessageExchangeDeclaration) -> bool,
    {
        let changed = retry::on_conflict(&self.retry, |attempt| -> Result<bool, BusError> {
            if attempt > 1 {
                debug!(exchange = %self.name, attempt, "topology write raced; retrying");
            }
            let mut session = self.store.session()?;
            let Some(mut declaration) = session.load::<MessageExchangeDeclaration>(&self.name)?
            else {
                return Err(BusError::UnknownExchange(self.name.clone()));
            };
            if !change(&mut declaration) {
                return Ok(false);
            }
            session.store(&declaration)?;
            session.save_changes()?;
            Ok(true)
        })?;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::Route;
    use concord_store::InMemoryStoreProvider;
    use proptest::prelude::*;

    fn topology() -> Topology {
        let store = RoutedStore::new(InMemoryStoreProvider::arc(), Route::new("t").unwrap());
        Topology::new(store, 5)
    }

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("orders.#", "orders.created.eu"));
        assert!(topic_matches("#.eu", "orders.created.eu"));
        assert!(topic_matches("*.created.#", "invoices.created"));
        assert!(!topic_matches("orders.created", "orders.deleted"));
        assert!(topic_matches("#", ""));
    }

    #[test]
    fn many_hash_words_match_quickly() {
        let pattern = format!("{}z", "#.".repeat(40));
        let key = format!("{}b", "a.".repeat(60));
        let started = std::time::Instant::now();
        assert!(!topic_matches(&pattern, &key));
        assert!(topic_matches(&pattern, &format!("{key}.z")));
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn direct_and_fanout_routing() {
        let mut direct = MessageExchangeDeclaration::new("d", ExchangeKind::Direct);
        direct.upsert_queue("a", vec!["red".into()]);
        direct.upsert_queue("b", vec!["red".into(), "blue".into()]);
        direct.upsert_queue("c", vec![]);

        let names = |decl: &MessageExchangeDeclaration, key: &str| -> Vec<String> {
            decl.matching_queues(key).iter().map(|q| q.name.clone()).collect()
        };
        assert_eq!(names(&direct, "red"), ["a", "b"]);
        assert_eq!(names(&direct, "blue"), ["b"]);
        assert!(names(&direct, "green").is_empty());

        let mut fanout = direct.clone();
        fanout.kind = ExchangeKind::Fanout;
        assert_eq!(names(&fanout, "anything"), ["a", "b", "c"]);
    }

    #[test]
    fn declarations_are_idempotent_and_replace_patterns() {
        let topology = topology();
        let exchange = topology.declare_exchange("orders", ExchangeKind::Direct).unwrap();
        exchange.declare_queue("billing", ["created"]).unwrap();
        exchange.declare_queue("billing", ["created", "paid"]).unwrap();
        topology.declare_exchange("orders", ExchangeKind::Direct).unwrap();

        let queues = exchange.queues().unwrap();
        assert_eq!(queues.len(), 1);
        assert_eq!(queues[0].patterns, ["created", "paid"]);
    }

    #[test]
    fn redeclaring_with_another_kind_updates_it() {
        let topology = topology();
        topology.declare_exchange("orders", ExchangeKind::Direct).unwrap();
        topology.declare_exchange("orders", ExchangeKind::Fanout).unwrap();
        let declaration = topology.exchange("orders").unwrap().unwrap();
        assert_eq!(declaration.kind, ExchangeKind::Fanout);
    }

    #[test]
    fn queue_operations_need_a_declared_exchange() {
        let topology = topology();
        let ghost = topology.specify_exchange("ghost");
        assert!(matches!(
            ghost.declare_queue("q", ["k"]),
            Err(BusError::UnknownExchange(_))
        ));
        assert!(!topology.delete_exchange("ghost").unwrap());
    }

    #[test]
    fn delete_queue_and_exchange() {
        let topology = topology();
        let exchange = topology.declare_exchange("orders", ExchangeKind::Fanout).unwrap();
        exchange.declare_queue("a", Vec::<String>::new()).unwrap();
        exchange.declare_queue("b", Vec::<String>::new()).unwrap();

        assert!(exchange.delete_queue("a").unwrap());
        assert!(!exchange.delete_queue("a").unwrap());
        assert_eq!(exchange.queues().unwrap().len(), 1);

        assert!(topology.delete_exchange("orders").unwrap());
        assert!(topology.exchanges().unwrap().is_empty());
    }

    #[test]
    fn concurrent_queue_declarations_all_land() {
        let topology = topology();
        let exchange = topology.declare_exchange("orders", ExchangeKind::Fanout).unwrap();

        std::thread::scope(|scope| {
            for i in 0..6 {
                let exchange = exchange.clone();
                scope.spawn(move || exchange.declare_queue(&format!("q{i}"), ["k"]).unwrap());
            }
        });

        assert_eq!(exchange.queues().unwrap().len(), 6);
    }

    fn word() -> impl Strategy<Value = String> {
        "[a-c]{1,2}"
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: a pattern without wildcards matches exactly itself, and
        /// replacing any word with `*` or the whole tail with `#` still matches.
        #[test]
        fn topic_routing_is_consistent(words in prop::collection::vec(word(), 1..5), idx in 0usize..5) {
            let key = words.join(".");
            prop_assert!(topic_matches(&key, &key));

            let i = idx % words.len();
            let mut starred = words.clone();
            starred[i] = "*".to_string();
            prop_assert!(topic_matches(&starred.join("."), &key));

            let mut hashed: Vec<String> = words[..i].to_vec();
            hashed.push("#".to_string());
            prop_assert!(topic_matches(&hashed.join("."), &key));

            let longer = format!("{key}.x");
            prop_assert!(!topic_matches(&key, &longer));
        }
    }
}
