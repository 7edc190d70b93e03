use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use tracing::debug;

use crate::message::Message;
use crate::{Error, Result};

/// Seed used by the broker when it computes partition routes; the client
/// must match it so both sides agree on `partitions[hash % n]`.
pub const ROUTING_HASH_SEED: u32 = 104_729;

/// Extracts the routing key from a message. Returning `None` (or an empty
/// string) fails the send with [`Error::RoutingKeyMissing`].
pub type RoutingKeyExtractor = Arc<dyn Fn(&Message) -> Option<String> + Send + Sync>;

/// Maps a message onto the partitions of a super-stream.
#[derive(Clone)]
pub enum RoutingStrategy {
    /// MurmurHash3-x86-32 over the extracted key, modulo the ordered
    /// partition list. Always selects exactly one partition.
    Hash { extractor: RoutingKeyExtractor },

    /// Exact-match lookup of the extracted key in a routing table. Unknown
    /// keys route to no partition.
    Key {
        extractor: RoutingKeyExtractor,
        routes: HashMap<String, Vec<String>>,
    },
}

impl RoutingStrategy {
    pub fn hash(extractor: RoutingKeyExtractor) -> Self {
        RoutingStrategy::Hash { extractor }
    }

    /// Hash strategy keyed on the message-id property.
    pub fn hash_by_message_id() -> Self {
        RoutingStrategy::Hash {
            extractor: Arc::new(|message| message.message_id().map(str::to_string)),
        }
    }

    pub fn key(extractor: RoutingKeyExtractor, routes: HashMap<String, Vec<String>>) -> Self {
        RoutingStrategy::Key { extractor, routes }
    }

    /// Computes the destination partitions for `message`.
    ///
    /// Pure and deterministic. An empty partition list yields an empty
    /// result; the producer layer turns that into a per-send error.
    pub fn route(&self, message: &Message, partitions: &[String]) -> Result<Vec<String>> {
        if partitions.is_empty() {
            return Ok(Vec::new());
        }

        let key = self.extract_key(message)?;
        match self {
            RoutingStrategy::Hash { .. } => {
                let hash = hash_key(&key)?;
                let index = hash as usize % partitions.len();
                debug!(key = %key, hash, index, "hash routed");
                Ok(vec![partitions[index].clone()])
            }
            RoutingStrategy::Key { routes, .. } => {
                Ok(routes.get(&key).cloned().unwrap_or_default())
            }
        }
    }

    /// Runs the extractor, rejecting missing or empty keys.
    pub fn extract_key(&self, message: &Message) -> Result<String> {
        let (RoutingStrategy::Hash { extractor } | RoutingStrategy::Key { extractor, .. }) = self;
        extractor(message)
            .filter(|key| !key.is_empty())
            .ok_or(Error::RoutingKeyMissing)
    }
}

fn hash_key(key: &str) -> Result<u32> {
    let hash = murmur3::murmur3_32(&mut Cursor::new(key.as_bytes()), ROUTING_HASH_SEED)?;
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partitions() -> Vec<String> {
        vec![
            "invoices-0".to_string(),
            "invoices-1".to_string(),
            "invoices-2".to_string(),
        ]
    }

    fn message(id: &str) -> Message {
        Message::new("body").with_message_id(id)
    }

    #[test]
    fn test_hash_routing_matches_broker_mapping() {
        // The broker computes the same murmur3 route for its own partition
        // queries, so these assignments are fixed.
        let strategy = RoutingStrategy::hash_by_message_id();
        let partitions = partitions();

        let expected = [
            ("hello1", "invoices-1"),
            ("hello2", "invoices-0"),
            ("hello3", "invoices-1"),
            ("hello4", "invoices-2"),
            ("hello5", "invoices-0"),
            ("hello6", "invoices-2"),
            ("hello7", "invoices-0"),
            ("hello8", "invoices-1"),
            ("hello9", "invoices-0"),
            ("hello10", "invoices-2"),
            ("hello88", "invoices-1"),
        ];

        for (key, partition) in expected {
            let routed = strategy.route(&message(key), &partitions).unwrap();
            assert_eq!(routed, vec![partition.to_string()], "key {key}");
        }
    }

    #[test]
    fn test_hash_routing_is_deterministic() {
        let strategy = RoutingStrategy::hash_by_message_id();
        let partitions = partitions();
        let first = strategy.route(&message("order-42"), &partitions).unwrap();
        let second = strategy.route(&message("order-42"), &partitions).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_hash_distribution_for_twenty_keys() {
        let strategy = RoutingStrategy::hash_by_message_id();
        let partitions = partitions();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for i in 0..20 {
            let routed = strategy
                .route(&message(&format!("hello{i}")), &partitions)
                .unwrap();
            *counts.entry(routed[0].clone()).or_default() += 1;
        }

        assert_eq!(counts["invoices-0"], 9);
        assert_eq!(counts["invoices-1"], 7);
        assert_eq!(counts["invoices-2"], 4);
    }

    #[test]
    fn test_missing_key_fails() {
        let strategy = RoutingStrategy::hash_by_message_id();
        let no_id = Message::new("body");
        let err = strategy.route(&no_id, &partitions()).unwrap_err();
        assert!(matches!(err, Error::RoutingKeyMissing));

        let empty_id = Message::new("body").with_message_id("");
        let err = strategy.route(&empty_id, &partitions()).unwrap_err();
        assert!(matches!(err, Error::RoutingKeyMissing));
    }

    #[test]
    fn test_empty_partition_list_routes_nowhere() {
        let strategy = RoutingStrategy::hash_by_message_id();
        let routed = strategy.route(&message("hello1"), &[]).unwrap();
        assert!(routed.is_empty());
    }

    #[test]
    fn test_key_routing_table_lookup() {
        let mut routes = HashMap::new();
        routes.insert("amer".to_string(), vec!["invoices-0".to_string()]);
        routes.insert(
            "emea".to_string(),
            vec!["invoices-1".to_string(), "invoices-2".to_string()],
        );
        let strategy = RoutingStrategy::key(
            Arc::new(|m: &Message| m.message_id().map(str::to_string)),
            routes,
        );
        let partitions = partitions();

        assert_eq!(
            strategy.route(&message("amer"), &partitions).unwrap(),
            vec!["invoices-0".to_string()]
        );
        assert_eq!(
            strategy.route(&message("emea"), &partitions).unwrap(),
            vec!["invoices-1".to_string(), "invoices-2".to_string()]
        );
    }

    #[test]
    fn test_key_routing_unknown_key_routes_nowhere() {
        let strategy = RoutingStrategy::key(
            Arc::new(|m: &Message| m.message_id().map(str::to_string)),
            HashMap::new(),
        );
        let routed = strategy.route(&message("apac"), &partitions()).unwrap();
        assert!(routed.is_empty());
    }
}
