//! Durable persistence of plans, statuses and scheduler state
//!
//! [`PlanStorageDriver`] is the seam the executor and trackers talk to.
//! [`StoreStorageDriver`] is the reference implementation over any
//! hierarchical [`CoordinationStore`]:
//!
//! ```text
//! <namespace>/plans/<plan-id>
//! <namespace>/statuses/<plan-id>
//! <namespace>/scheduler_state
//! <namespace>/operations/<step-id>     (StoreDriverFactory)
//! ```

pub mod fs;
pub mod memory;

pub use fs::FsStore;
pub use memory::MemoryStore;

use crate::codec::{self, OperationCodec};
use crate::error::StorageError;
use crate::ids::{PlanId, StepId};
use crate::operation::{OperationDriver, OperationDriverFactory, StepScope};
use crate::plan::Plan;
use crate::scheduler::SchedulerState;
use crate::status::PlanStatus;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Durable persistence used by the executor and its trackers
///
/// Every save returns only once the write is durable. Failures are reported,
/// never retried.
#[async_trait::async_trait]
pub trait PlanStorageDriver: Send + Sync {
    /// Persist the latest status of a plan
    async fn save_status_for_plan(&self, status: &PlanStatus) -> Result<(), StorageError>;

    /// Persist a frozen plan
    async fn save_plan(&self, plan: &Plan) -> Result<(), StorageError>;

    /// Drop a plan and its status; missing entries are not an error
    async fn forget_plan(&self, id: PlanId) -> Result<(), StorageError>;

    /// Persist admission queues and running set
    async fn save_scheduler_state(&self, state: &SchedulerState) -> Result<(), StorageError>;

    /// Last saved scheduler state
    async fn load_scheduler_state(&self) -> Result<Option<SchedulerState>, StorageError>;

    /// Every stored plan
    async fn load_plans(&self) -> Result<HashMap<PlanId, Plan>, StorageError>;

    /// One stored plan
    async fn try_load_plan(&self, id: PlanId) -> Result<Option<Plan>, StorageError>;

    /// Last saved status of one plan
    async fn try_load_plan_status(&self, id: PlanId) -> Result<Option<PlanStatus>, StorageError>;
}

/// Hierarchical durable key space
///
/// Paths are `/`-separated and absolute. `put` is durable on return and a
/// `get` after a `put` observes it.
#[async_trait::async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Read a blob
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Create or replace a blob
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), StorageError>;

    /// Names of the direct children of `path`, sorted
    async fn children(&self, path: &str) -> Result<Vec<String>, StorageError>;

    /// Remove a blob; missing paths are not an error
    async fn delete(&self, path: &str) -> Result<(), StorageError>;
}

/// Check a store path and split it into segments
pub(crate) fn segments(path: &str) -> Result<Vec<&str>, StorageError> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(StorageError::InvalidPath(path.to_string()));
    };
    if rest.is_empty() {
        return Ok(Vec::new());
    }
    let parts: Vec<&str> = rest.split('/').collect();
    if parts.iter().any(|p| p.is_empty() || *p == "." || *p == "..") {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    Ok(parts)
}

/// Normalize a namespace prefix to `""` or `/a/b`
fn normalize_namespace(namespace: &str) -> Result<String, StorageError> {
    let trimmed = namespace.trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    let prefixed = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    };
    segments(&prefixed)?;
    Ok(prefixed)
}

/// Reference [`PlanStorageDriver`] over a [`CoordinationStore`]
pub struct StoreStorageDriver<S> {
    store: Arc<S>,
    codec: OperationCodec,
    namespace: String,
}

impl<S: CoordinationStore> StoreStorageDriver<S> {
    /// Driver rooted at `/`
    pub fn new(store: Arc<S>, codec: OperationCodec) -> Self {
        Self {
            store,
            codec,
            namespace: String::new(),
        }
    }

    /// Driver rooted at `namespace`, one per executor
    pub fn with_namespace(
        store: Arc<S>,
        codec: OperationCodec,
        namespace: &str,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            store,
            codec,
            namespace: normalize_namespace(namespace)?,
        })
    }

    /// Underlying store
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn plans_dir(&self) -> String {
        format!("{}/plans", self.namespace)
    }

    fn plan_path(&self, id: PlanId) -> String {
        format!("{}/plans/{id}", self.namespace)
    }

    fn status_path(&self, id: PlanId) -> String {
        format!("{}/statuses/{id}", self.namespace)
    }

    fn scheduler_path(&self) -> String {
        format!("{}/scheduler_state", self.namespace)
    }
}

#[async_trait::async_trait]
impl<S: CoordinationStore> PlanStorageDriver for StoreStorageDriver<S> {
    async fn save_status_for_plan(&self, status: &PlanStatus) -> Result<(), StorageError> {
        let bytes = codec::encode_status(status)?;
        self.store.put(&self.status_path(status.plan_id()), bytes).await
    }

    async fn save_plan(&self, plan: &Plan) -> Result<(), StorageError> {
        let bytes = codec::encode_plan(plan)?;
        self.store.put(&self.plan_path(plan.id()), bytes).await
    }

    async fn forget_plan(&self, id: PlanId) -> Result<(), StorageError> {
        self.store.delete(&self.plan_path(id)).await?;
        self.store.delete(&self.status_path(id)).await
    }

    async fn save_scheduler_state(&self, state: &SchedulerState) -> Result<(), StorageError> {
        let bytes = codec::encode_scheduler_state(state)?;
        self.store.put(&self.scheduler_path(), bytes).await
    }

    async fn load_scheduler_state(&self) -> Result<Option<SchedulerState>, StorageError> {
        match self.store.get(&self.scheduler_path()).await? {
            Some(bytes) => Ok(Some(codec::decode_scheduler_state(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn load_plans(&self) -> Result<HashMap<PlanId, Plan>, StorageError> {
        let mut plans = HashMap::new();
        for name in self.store.children(&self.plans_dir()).await? {
            let path = format!("{}/{name}", self.plans_dir());
            let Some(bytes) = self.store.get(&path).await? else {
                continue;
            };
            let plan = codec::decode_plan(&bytes, &self.codec)?;
            plans.insert(plan.id(), plan);
        }
        tracing::debug!(count = plans.len(), "loaded stored plans");
        Ok(plans)
    }

    async fn try_load_plan(&self, id: PlanId) -> Result<Option<Plan>, StorageError> {
        match self.store.get(&self.plan_path(id)).await? {
            Some(bytes) => Ok(Some(codec::decode_plan(&bytes, &self.codec)?)),
            None => Ok(None),
        }
    }

    async fn try_load_plan_status(&self, id: PlanId) -> Result<Option<PlanStatus>, StorageError> {
        match self.store.get(&self.status_path(id)).await? {
            Some(bytes) => Ok(Some(codec::decode_status(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// [`OperationDriverFactory`] persisting checkpoints next to the plans
pub struct StoreDriverFactory<S> {
    store: Arc<S>,
    namespace: String,
}

impl<S: CoordinationStore> StoreDriverFactory<S> {
    /// Factory rooted at `/`
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            namespace: String::new(),
        }
    }

    /// Factory rooted at `namespace`
    pub fn with_namespace(store: Arc<S>, namespace: &str) -> Result<Self, StorageError> {
        Ok(Self {
            store,
            namespace: normalize_namespace(namespace)?,
        })
    }
}

impl<S: CoordinationStore> OperationDriverFactory for StoreDriverFactory<S> {
    fn make_driver(&self, plan_id: PlanId, step_id: StepId) -> Arc<dyn OperationDriver> {
        Arc::new(StoreOperationDriver {
            store: Arc::clone(&self.store),
            path: format!("{}/operations/{step_id}", self.namespace),
            scope: StepScope { plan_id, step_id },
        })
    }
}

struct StoreOperationDriver<S> {
    store: Arc<S>,
    path: String,
    scope: StepScope,
}

#[async_trait::async_trait]
impl<S: CoordinationStore> OperationDriver for StoreOperationDriver<S> {
    async fn save(&self, value: Value) -> Result<(), StorageError> {
        let bytes = codec::encode_checkpoint(&value)?;
        self.store.put(&self.path, bytes).await
    }

    async fn load(&self) -> Result<Option<Value>, StorageError> {
        match self.store.get(&self.path).await? {
            Some(bytes) => Ok(Some(codec::decode_checkpoint(&bytes)?)),
            None => Ok(None),
        }
    }

    fn info(&self, message: &str) {
        self.scope.info(message);
    }

    fn error(&self, message: &str) {
        self.scope.error(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanBuilder;
    use crate::testing::NoopOp;
    use pretty_assertions::assert_eq;

    fn driver(store: &Arc<MemoryStore>, namespace: &str) -> StoreStorageDriver<MemoryStore> {
        let codec = OperationCodec::new().with::<NoopOp>(NoopOp::KIND);
        StoreStorageDriver::with_namespace(Arc::clone(store), codec, namespace).unwrap()
    }

    #[test]
    fn test_segments_validation() {
        assert_eq!(segments("/a/b").unwrap(), vec!["a", "b"]);
        assert!(segments("/").unwrap().is_empty());
        assert!(segments("a/b").is_err());
        assert!(segments("/a//b").is_err());
        assert!(segments("/a/../b").is_err());
    }

    #[test]
    fn test_namespace_normalization() {
        assert_eq!(normalize_namespace("").unwrap(), "");
        assert_eq!(normalize_namespace("/").unwrap(), "");
        assert_eq!(normalize_namespace("exec-1").unwrap(), "/exec-1");
        assert_eq!(normalize_namespace("/svc/exec-1/").unwrap(), "/svc/exec-1");
        assert!(normalize_namespace("/svc/../x").is_err());
    }

    #[tokio::test]
    async fn test_layout_under_namespace() {
        let store = Arc::new(MemoryStore::new());
        let driver = driver(&store, "svc");
        let mut builder = PlanBuilder::new();
        builder.step(NoopOp::locking(["A"]));
        let plan = builder.freeze().unwrap();

        driver.save_plan(&plan).await.unwrap();
        driver.save_status_for_plan(&PlanStatus::new(&plan)).await.unwrap();
        driver.save_scheduler_state(&SchedulerState::new()).await.unwrap();

        assert!(store.get(&format!("/svc/plans/{}", plan.id())).await.unwrap().is_some());
        assert!(store.get(&format!("/svc/statuses/{}", plan.id())).await.unwrap().is_some());
        assert!(store.get("/svc/scheduler_state").await.unwrap().is_some());
        assert!(store.get("/scheduler_state").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let store = Arc::new(MemoryStore::new());
        let first = driver(&store, "exec-1");
        let second = driver(&store, "exec-2");
        let plan = PlanBuilder::new().freeze().unwrap();

        first.save_plan(&plan).await.unwrap();
        assert_eq!(first.load_plans().await.unwrap().len(), 1);
        assert!(second.load_plans().await.unwrap().is_empty());
        assert!(second.load_scheduler_state().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_forget_plan_removes_plan_and_status() {
        let store = Arc::new(MemoryStore::new());
        let driver = driver(&store, "");
        let plan = PlanBuilder::new().freeze().unwrap();
        driver.save_plan(&plan).await.unwrap();
        driver.save_status_for_plan(&PlanStatus::new(&plan)).await.unwrap();

        assert!(driver.try_load_plan(plan.id()).await.unwrap().is_some());
        driver.forget_plan(plan.id()).await.unwrap();
        assert!(driver.load_plans().await.unwrap().is_empty());
        assert!(driver.try_load_plan(plan.id()).await.unwrap().is_none());
        assert!(driver.try_load_plan_status(plan.id()).await.unwrap().is_none());

        // Forgetting twice is fine
        driver.forget_plan(plan.id()).await.unwrap();
    }

    #[tokio::test]
    async fn test_store_checkpoints() {
        let store = Arc::new(MemoryStore::new());
        let factory = StoreDriverFactory::new(Arc::clone(&store));
        let step = StepId::new();
        let driver = factory.make_driver(PlanId::new(), step);

        driver.save(Value::from(7)).await.unwrap();
        assert_eq!(driver.load().await.unwrap(), Some(Value::from(7)));
        assert!(store.get(&format!("/operations/{step}")).await.unwrap().is_some());
    }
}
