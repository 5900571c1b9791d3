//! User transform contract and the name-to-factory registry.
//!
//! Dispatch RPCs name functions by identifier; workers reconstruct the
//! concrete transform through a registered factory, handing it the stage's
//! opaque parameter value.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use rowmill_common::{Result, Row};

use crate::context::TaskContext;

/// Lazy finite sequence of input rows handed to a transform.
pub type RowStream<'a> = BoxStream<'a, Row>;

/// Emission capability bound to the task's output writer.
#[async_trait]
pub trait Emit: Send {
    /// Emit one row toward the stage's downstream partitions. Suspends when
    /// the destination buffer is applying back-pressure.
    async fn emit(&mut self, row: Row) -> Result<()>;
}

/// One user transformation over a partition's row stream.
#[async_trait]
pub trait Transform: Send + Sync {
    /// Drain `input`, emit output rows, and return when done. Every await
    /// point is a cancellation point.
    async fn apply(
        &self,
        ctx: &TaskContext,
        input: RowStream<'_>,
        emit: &mut dyn Emit,
    ) -> Result<()>;
}

/// Factory contract reconstructing transforms from dispatch payloads.
pub trait TransformFactory: Send + Sync {
    /// Stable function name used by `Stage::function`.
    fn name(&self) -> &str;

    /// Build a transform instance from the stage's parameter value.
    fn build(&self, params: &Value) -> Result<Box<dyn Transform>>;
}

/// Registry of transform factories.
#[derive(Default)]
pub struct TransformRegistry {
    inner: RwLock<HashMap<String, Arc<dyn TransformFactory>>>,
}

impl std::fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.inner.read().map(|m| m.len()).unwrap_or_default();
        f.debug_struct("TransformRegistry")
            .field("factories", &count)
            .finish()
    }
}

impl TransformRegistry {
    /// Register or replace a factory.
    ///
    /// Returns `true` when an existing factory with the same name was replaced.
    pub fn register(&self, factory: Arc<dyn TransformFactory>) -> bool {
        self.inner
            .write()
            .expect("transform registry lock poisoned")
            .insert(factory.name().to_string(), factory)
            .is_some()
    }

    /// Deregister a factory by name.
    pub fn deregister(&self, name: &str) -> bool {
        self.inner
            .write()
            .expect("transform registry lock poisoned")
            .remove(name)
            .is_some()
    }

    /// Fetch a factory by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn TransformFactory>> {
        self.inner
            .read()
            .expect("transform registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// List registered function names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names = self
            .inner
            .read()
            .expect("transform registry lock poisoned")
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        names.sort();
        names
    }
}

fn global_registry() -> &'static Arc<TransformRegistry> {
    static REGISTRY: OnceLock<Arc<TransformRegistry>> = OnceLock::new();
    REGISTRY.get_or_init(|| Arc::new(TransformRegistry::default()))
}

/// Return the global transform registry shared by worker runtimes.
pub fn global_transform_registry() -> Arc<TransformRegistry> {
    Arc::clone(global_registry())
}

/// Register a factory in the global transform registry.
pub fn register_global_transform_factory(factory: Arc<dyn TransformFactory>) -> bool {
    global_registry().register(factory)
}

/// Deregister a factory from the global transform registry.
pub fn deregister_global_transform_factory(name: &str) -> bool {
    global_registry().deregister(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    struct Identity;

    #[async_trait]
    impl Transform for Identity {
        async fn apply(
            &self,
            _ctx: &TaskContext,
            mut input: RowStream<'_>,
            emit: &mut dyn Emit,
        ) -> Result<()> {
            while let Some(row) = input.next().await {
                emit.emit(row).await?;
            }
            Ok(())
        }
    }

    struct IdentityFactory;

    impl TransformFactory for IdentityFactory {
        fn name(&self) -> &str {
            "identity"
        }

        fn build(&self, _params: &Value) -> Result<Box<dyn Transform>> {
            Ok(Box::new(Identity))
        }
    }

    #[test]
    fn registry_resolves_by_name() {
        let registry = TransformRegistry::default();
        assert!(!registry.register(Arc::new(IdentityFactory)));
        assert!(registry.register(Arc::new(IdentityFactory)));
        assert!(registry.get("identity").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["identity".to_string()]);
        assert!(registry.deregister("identity"));
        assert!(!registry.deregister("identity"));
    }
}
