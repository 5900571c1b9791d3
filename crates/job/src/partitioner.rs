use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Routing decision for one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Deliver to the sink at this index in sorted-partition order.
    To(usize),
    /// Deliver a copy to every sink.
    All,
}

/// Pure function from a row key to a destination partition.
///
/// Partitioners are carried inside the stage record, so every variant is a
/// serializable value rather than code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartitionerSpec {
    /// Hash of the key modulo the destination count.
    HashKey,
    /// A fixed key list; each key routes to its position in the list. Keys
    /// outside the list fall back to hashing.
    FiniteKey {
        /// The known key universe, in partition order.
        keys: Vec<String>,
    },
    /// Every destination receives a copy.
    Broadcast,
}

impl PartitionerSpec {
    /// Route a key across `sinks` destinations (sorted-partition order).
    pub fn route(&self, key: &str, sinks: usize) -> Route {
        match self {
            PartitionerSpec::HashKey => Route::To(hash_index(key, sinks)),
            PartitionerSpec::FiniteKey { keys } => match keys.iter().position(|k| k == key) {
                Some(index) => Route::To(index % sinks.max(1)),
                None => Route::To(hash_index(key, sinks)),
            },
            PartitionerSpec::Broadcast => Route::All,
        }
    }
}

fn hash_index(key: &str, sinks: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % sinks.max(1) as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_routing_is_stable_and_in_range() {
        let spec = PartitionerSpec::HashKey;
        for key in ["a", "b", "c", "d"] {
            let first = spec.route(key, 4);
            assert_eq!(first, spec.route(key, 4));
            match first {
                Route::To(index) => assert!(index < 4),
                Route::All => panic!("hash routing must target one sink"),
            }
        }
    }

    #[test]
    fn finite_key_routes_by_position() {
        let spec = PartitionerSpec::FiniteKey {
            keys: vec!["0".to_string(), "1".to_string()],
        };
        assert_eq!(spec.route("0", 2), Route::To(0));
        assert_eq!(spec.route("1", 2), Route::To(1));
    }

    #[test]
    fn broadcast_targets_all_sinks() {
        assert_eq!(PartitionerSpec::Broadcast.route("anything", 3), Route::All);
    }
}
