use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use rowmill_common::generate_id;

/// Role of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Submits jobs and tracks their progress.
    Master,
    /// Executes tasks and serves data streams.
    Worker,
}

impl NodeType {
    fn id_prefix(self) -> &'static str {
        match self {
            NodeType::Master => "M",
            NodeType::Worker => "W",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::Master => write!(f, "master"),
            NodeType::Worker => write!(f, "worker"),
        }
    }
}

/// One cluster member. The record lives at `nodes/<id>` in the coordinator
/// for exactly as long as its liveness lease is refreshed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Stable node identifier, generated at construction.
    pub id: String,
    /// Advertised host:port peers dial to reach this node.
    pub host: String,
    /// Node role.
    #[serde(rename = "type")]
    pub typ: NodeType,
    /// Opaque labels attached by configuration.
    #[serde(default)]
    pub tag: HashMap<String, String>,
}

impl Node {
    /// Build a node descriptor with a freshly generated id.
    pub fn new(host: impl Into<String>, typ: NodeType) -> Self {
        Self {
            id: generate_id(typ.id_prefix()),
            host: host.into(),
            typ,
            tag: HashMap::new(),
        }
    }
}
