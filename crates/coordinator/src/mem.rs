//! In-memory coordinator used by tests and single-process deployments.
//!
//! Semantics match the contract in the crate root: leases expire lazily on
//! the next read/write after their deadline, watches deliver puts and
//! deletes for a prefix, and transactions apply under one lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use rowmill_common::{MillError, Result};

use crate::{Coordinator, LeaseId, RawItem, Txn, TxnOp, WatchEvent, KV};

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct Lease {
    expires_at: Instant,
    ttl: Duration,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct State {
    kv: BTreeMap<String, Entry>,
    leases: HashMap<u64, Lease>,
    next_lease: u64,
    watchers: Vec<Watcher>,
}

impl State {
    /// Drop entries whose lease deadline has passed, notifying watchers.
    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .leases
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return;
        }
        for id in &expired {
            self.leases.remove(id);
        }
        let dead: Vec<String> = self
            .kv
            .iter()
            .filter(|(_, e)| matches!(e.lease, Some(LeaseId(id)) if expired.contains(&id)))
            .map(|(k, _)| k.clone())
            .collect();
        for key in dead {
            self.kv.remove(&key);
            self.notify(WatchEvent::Delete(key));
        }
    }

    fn notify(&mut self, event: WatchEvent) {
        let key = match &event {
            WatchEvent::Put(item) => item.key.as_str(),
            WatchEvent::Delete(key) => key.as_str(),
        };
        self.watchers
            .retain(|w| !key.starts_with(&w.prefix) || w.tx.send(event.clone()).is_ok());
    }

    fn put(&mut self, key: &str, value: Value, lease: Option<LeaseId>) -> Result<()> {
        if let Some(LeaseId(id)) = lease {
            if !self.leases.contains_key(&id) {
                return Err(MillError::LeaseDenied(format!("unknown lease {id}")));
            }
        }
        self.kv.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                lease,
            },
        );
        self.notify(WatchEvent::Put(RawItem {
            key: key.to_string(),
            value,
        }));
        Ok(())
    }

    fn increment(&mut self, key: &str) -> Result<i64> {
        let next = match self.kv.get(key) {
            None => 1,
            Some(entry) => {
                entry
                    .value
                    .as_i64()
                    .ok_or_else(|| MillError::InvalidArgument(format!("{key} is not a counter")))?
                    + 1
            }
        };
        self.put(key, Value::from(next), None)?;
        Ok(next)
    }

    fn delete(&mut self, prefix: &str) -> i64 {
        let dead: Vec<String> = self
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        let count = dead.len() as i64;
        for key in dead {
            self.kv.remove(&key);
            self.notify(WatchEvent::Delete(key));
        }
        count
    }
}

/// In-memory [`Coordinator`] implementation.
#[derive(Clone, Default)]
pub struct MemCoordinator {
    state: Arc<Mutex<State>>,
}

impl MemCoordinator {
    /// Create an empty coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.purge_expired(Instant::now());
        state
    }
}

#[async_trait]
impl KV for MemCoordinator {
    async fn put(&self, key: &str, value: Value, lease: Option<LeaseId>) -> Result<()> {
        self.lock().put(key, value, lease)
    }

    async fn get(&self, key: &str) -> Result<Value> {
        self.lock()
            .kv
            .get(key)
            .map(|e| e.value.clone())
            .ok_or_else(|| MillError::NotFound(key.to_string()))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<RawItem>> {
        let state = self.lock();
        Ok(state
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| RawItem {
                key: k.clone(),
                value: e.value.clone(),
            })
            .collect())
    }

    async fn delete(&self, prefix: &str) -> Result<i64> {
        Ok(self.lock().delete(prefix))
    }

    async fn watch(&self, prefix: &str) -> mpsc::UnboundedReceiver<WatchEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        rx
    }

    async fn increment_counter(&self, key: &str) -> Result<i64> {
        self.lock().increment(key)
    }

    async fn read_counter(&self, key: &str) -> Result<i64> {
        let state = self.lock();
        match state.kv.get(key) {
            None => Ok(0),
            Some(entry) => entry
                .value
                .as_i64()
                .ok_or_else(|| MillError::InvalidArgument(format!("{key} is not a counter"))),
        }
    }

    async fn commit(&self, txn: Txn) -> Result<()> {
        let mut state = self.lock();
        // Validate counter shapes up front so a failing op leaves no partial writes.
        for op in txn.ops() {
            if let TxnOp::IncrementCounter { key } = op {
                if let Some(entry) = state.kv.get(key) {
                    if entry.value.as_i64().is_none() {
                        return Err(MillError::InvalidArgument(format!("{key} is not a counter")));
                    }
                }
            }
        }
        for op in txn.ops() {
            match op {
                TxnOp::Put { key, value } => state.put(key, value.clone(), None)?,
                TxnOp::IncrementCounter { key } => {
                    state.increment(key)?;
                }
                TxnOp::Delete { prefix } => {
                    state.delete(prefix);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Coordinator for MemCoordinator {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let mut state = self.lock();
        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(
            id,
            Lease {
                expires_at: Instant::now() + ttl,
                ttl,
            },
        );
        Ok(LeaseId(id))
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.lock();
        let entry = state
            .leases
            .get_mut(&lease.0)
            .ok_or_else(|| MillError::LeaseDenied(format!("unknown lease {}", lease.0)))?;
        entry.expires_at = Instant::now() + entry.ttl;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.lock();
        state.watchers.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{get_as, put_as};

    #[tokio::test]
    async fn put_get_scan_delete() {
        let crd = MemCoordinator::new();
        put_as(&crd, "nodes/a", &"host-a", None).await.expect("put");
        put_as(&crd, "nodes/b", &"host-b", None).await.expect("put");
        put_as(&crd, "jobs/j1", &"job", None).await.expect("put");

        let host: String = get_as(&crd, "nodes/a").await.expect("get");
        assert_eq!(host, "host-a");

        let nodes = crd.scan("nodes/").await.expect("scan");
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].key, "nodes/a");

        let removed = crd.delete("nodes/").await.expect("delete");
        assert_eq!(removed, 2);
        assert!(matches!(
            crd.get("nodes/a").await,
            Err(MillError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn leased_keys_expire_and_keep_alive_extends() {
        let crd = MemCoordinator::new();
        let lease = crd
            .grant_lease(Duration::from_millis(50))
            .await
            .expect("lease");
        put_as(&crd, "nodes/w1", &"w1", Some(lease))
            .await
            .expect("put");

        crd.keep_alive(lease).await.expect("keep alive");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(crd.get("nodes/w1").await.is_ok());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(
            crd.get("nodes/w1").await,
            Err(MillError::NotFound(_))
        ));
        assert!(crd.scan("nodes/").await.expect("scan").is_empty());
    }

    #[tokio::test]
    async fn transaction_applies_puts_and_counters() {
        let crd = MemCoordinator::new();
        let txn = Txn::new()
            .put("tasks/j/s/0", &"task")
            .expect("encode")
            .increment_counter("status/stages/j/s/totalTasks")
            .increment_counter("status/stages/j/s/totalTasks");
        crd.commit(txn).await.expect("commit");

        assert_eq!(
            crd.read_counter("status/stages/j/s/totalTasks")
                .await
                .expect("read"),
            2
        );
    }

    #[tokio::test]
    async fn watch_sees_puts_under_prefix() {
        let crd = MemCoordinator::new();
        let mut rx = crd.watch("errors/jobs/j1").await;
        put_as(&crd, "errors/jobs/j1/1", &"boom", None)
            .await
            .expect("put");
        put_as(&crd, "errors/jobs/j2/1", &"other", None)
            .await
            .expect("put");

        match rx.recv().await.expect("event") {
            WatchEvent::Put(item) => assert_eq!(item.key, "errors/jobs/j1/1"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }
}
