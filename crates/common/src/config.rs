use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Worker process configuration shared across server and executor layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerOptions {
    /// Bind address for the worker RPC server.
    pub listen_host: String,
    /// Host registered for peers. When it ends in the port separator with an
    /// empty port, the OS-assigned listen port is substituted at startup.
    pub advertised_host: String,
    /// Opaque labels attached to the node record.
    #[serde(default)]
    pub node_tags: HashMap<String, String>,
    /// Input-side knobs.
    #[serde(default)]
    pub input: InputOptions,
    /// Output-side knobs.
    #[serde(default)]
    pub output: OutputOptions,
    /// Node manager knobs.
    #[serde(default)]
    pub node_manager: NodeManagerOptions,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0:7466".to_string(),
            advertised_host: "localhost:7466".to_string(),
            node_tags: HashMap::new(),
            input: InputOptions::default(),
            output: OutputOptions::default(),
            node_manager: NodeManagerOptions::default(),
        }
    }
}

/// Input-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputOptions {
    /// Per-task input queue capacity, in row batches. Trades memory for
    /// smoothing of bursty producers.
    pub queue_length: usize,
    /// RPC frame decode ceiling in bytes.
    pub max_recv_size: usize,
}

impl Default for InputOptions {
    fn default() -> Self {
        Self {
            queue_length: 1000,
            max_recv_size: 500 * 1024 * 1024,
        }
    }
}

/// Output-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputOptions {
    /// Rows accumulated per destination before a framed batch is flushed.
    pub buffer_length: usize,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            buffer_length: 1000,
        }
    }
}

/// Node manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeManagerOptions {
    /// Timeout for dialing a peer host.
    pub connect_timeout: Duration,
    /// Interval for refreshing this node's liveness lease. A node that stops
    /// refreshing disappears from discovery within one interval.
    pub liveness_probe_interval: Duration,
    /// Timeout applied to one liveness refresh round-trip.
    pub liveness_probe_timeout: Duration,
    /// Path to a PEM CA certificate for server-authenticated TLS channels.
    /// Absence implies insecure mode with a prominent log warning.
    #[serde(default)]
    pub tls_cert_path: Option<String>,
    /// Server name override used during TLS verification.
    #[serde(default)]
    pub tls_cert_server_name: Option<String>,
}

impl Default for NodeManagerOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            liveness_probe_interval: Duration::from_secs(10),
            liveness_probe_timeout: Duration::from_secs(3),
            tls_cert_path: None,
            tls_cert_server_name: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let opt = WorkerOptions::default();
        assert!(opt.input.queue_length > 0);
        assert!(opt.output.buffer_length > 0);
        assert!(opt.node_manager.liveness_probe_timeout <= opt.node_manager.liveness_probe_interval);
        assert!(opt.node_manager.tls_cert_path.is_none());
    }
}
