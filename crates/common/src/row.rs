use serde::{Deserialize, Serialize};

/// One routed record: an opaque byte payload plus the key the partitioner
/// routes on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    /// Routing key consumed by the stage's output partitioner.
    pub key: String,
    /// Opaque payload bytes; the framework never inspects them.
    pub value: Vec<u8>,
}

impl Row {
    /// Build a row from a key and payload.
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}
