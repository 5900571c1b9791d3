//! Coordinator key-value contract used by every cluster-facing crate.
//!
//! Contract:
//! - a strongly-consistent KV with prefix scans, prefix watches, atomic
//!   counters, and multi-op transactions;
//! - leases: a TTL handle attachable to keys; keys bound to an expired lease
//!   disappear from reads and scans;
//! - implementations are shared behind `Arc<dyn Coordinator>`.
//!
//! The in-memory implementation in [`mem`] backs tests and single-process
//! deployments; production backends plug in behind the same trait.

pub mod mem;

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use rowmill_common::{MillError, Result};

pub use mem::MemCoordinator;

/// A coordinator-granted TTL handle. Keys written under a lease disappear
/// when the lease expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(pub u64);

/// One scanned key-value entry.
#[derive(Debug, Clone)]
pub struct RawItem {
    /// Full key of the entry.
    pub key: String,
    /// Stored JSON value.
    pub value: Value,
}

impl RawItem {
    /// Decode the stored value into a concrete record.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.value.clone())
            .map_err(|e| MillError::Internal(format!("decode {}: {e}", self.key)))
    }
}

/// One modification event observed by a prefix watch.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// A key under the watched prefix was written.
    Put(RawItem),
    /// A key under the watched prefix was deleted (or its lease expired).
    Delete(String),
}

/// One operation inside a transaction.
#[derive(Debug, Clone)]
pub enum TxnOp {
    /// Write a key.
    Put {
        /// Target key.
        key: String,
        /// JSON value to store.
        value: Value,
    },
    /// Atomically increment the counter stored at a key.
    IncrementCounter {
        /// Counter key.
        key: String,
    },
    /// Delete all keys under a prefix.
    Delete {
        /// Key prefix.
        prefix: String,
    },
}

/// An atomic multi-op transaction. All operations apply, or none do.
#[derive(Debug, Clone, Default)]
pub struct Txn {
    ops: Vec<TxnOp>,
}

impl Txn {
    /// Start an empty transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a put of a serializable record.
    pub fn put<T: Serialize>(mut self, key: impl Into<String>, value: &T) -> Result<Self> {
        let value = serde_json::to_value(value)
            .map_err(|e| MillError::Internal(format!("encode txn value: {e}")))?;
        self.ops.push(TxnOp::Put {
            key: key.into(),
            value,
        });
        Ok(self)
    }

    /// Append a counter increment.
    pub fn increment_counter(mut self, key: impl Into<String>) -> Self {
        self.ops.push(TxnOp::IncrementCounter { key: key.into() });
        self
    }

    /// Append a prefix delete.
    pub fn delete(mut self, prefix: impl Into<String>) -> Self {
        self.ops.push(TxnOp::Delete {
            prefix: prefix.into(),
        });
        self
    }

    /// Operations in application order.
    pub fn ops(&self) -> &[TxnOp] {
        &self.ops
    }
}

/// Key-value surface of the coordinator.
#[async_trait]
pub trait KV: Send + Sync {
    /// Write a key, optionally bound to a lease.
    async fn put(&self, key: &str, value: Value, lease: Option<LeaseId>) -> Result<()>;

    /// Read a key. Fails with [`MillError::NotFound`] on miss.
    async fn get(&self, key: &str) -> Result<Value>;

    /// List all live entries under a prefix, in key order.
    async fn scan(&self, prefix: &str) -> Result<Vec<RawItem>>;

    /// Delete all keys under a prefix; returns the number removed.
    async fn delete(&self, prefix: &str) -> Result<i64>;

    /// Subscribe to modification events for keys under a prefix.
    async fn watch(&self, prefix: &str) -> mpsc::UnboundedReceiver<WatchEvent>;

    /// Atomically increment the counter at a key; returns the new value.
    async fn increment_counter(&self, key: &str) -> Result<i64>;

    /// Read a counter; absent counters read as zero.
    async fn read_counter(&self, key: &str) -> Result<i64>;

    /// Apply a transaction atomically.
    async fn commit(&self, txn: Txn) -> Result<()>;
}

/// Full coordinator surface: KV plus lease management.
#[async_trait]
pub trait Coordinator: KV {
    /// Create a lease with the given TTL.
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Extend a lease by its original TTL from now.
    async fn keep_alive(&self, lease: LeaseId) -> Result<()>;

    /// Release all resources held by the coordinator client.
    async fn close(&self) -> Result<()>;
}

/// Read a key and decode it into a concrete record.
pub async fn get_as<T: DeserializeOwned>(crd: &dyn Coordinator, key: &str) -> Result<T> {
    let value = crd.get(key).await?;
    serde_json::from_value(value).map_err(|e| MillError::Internal(format!("decode {key}: {e}")))
}

/// Encode a record and write it, optionally under a lease.
pub async fn put_as<T: Serialize>(
    crd: &dyn Coordinator,
    key: &str,
    value: &T,
    lease: Option<LeaseId>,
) -> Result<()> {
    let value =
        serde_json::to_value(value).map_err(|e| MillError::Internal(format!("encode {key}: {e}")))?;
    crd.put(key, value, lease).await
}
