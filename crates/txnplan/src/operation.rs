//! Operation contract
//!
//! Operations are the caller-supplied units of work inside a plan:
//! - a forward action (`do_action`)
//! - its inverse (`unravel`)
//! - the resource names it may touch (`locked_tasks`)
//!
//! Each step gets an `OperationDriver` for durable checkpoints and
//! step-scoped diagnostics. A restarted engine may call `do_action` again for
//! a step that was running at crash time, so implementations either load
//! their checkpoint and continue, or are naturally idempotent.

use crate::error::{CodecError, StorageError};
use crate::ids::{PlanId, StepId};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Opaque capability handed to every operation
///
/// Wraps whatever the embedding scheduler uses to mutate cluster state.
/// Operations recover the concrete type with [`ResourceRegistry::get`].
#[derive(Clone, Default)]
pub struct ResourceRegistry {
    inner: Option<Arc<dyn Any + Send + Sync>>,
}

impl ResourceRegistry {
    /// Wrap a registry value
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    /// Wrap a shared registry value
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self {
            inner: Some(value),
        }
    }

    /// Registry for operations that never touch cluster state
    #[inline]
    #[must_use]
    pub fn empty() -> Self {
        Self { inner: None }
    }

    /// Borrow the wrapped value as `T`
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.inner.as_deref()?.downcast_ref::<T>()
    }
}

impl fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("present", &self.inner.is_some())
            .finish()
    }
}

/// A unit of work with a forward action and an inverse
///
/// `locked_tasks` is a correctness contract: under-declaring lets
/// conflicting plans run concurrently, over-declaring serializes plans that
/// could have run in parallel.
#[async_trait::async_trait]
pub trait Operation: Send + Sync + 'static {
    /// Perform the forward work
    ///
    /// When the plan rolls back, the future is dropped at its next await
    /// and `unravel` runs only after that. Work moved off the task (for
    /// example with `spawn_blocking`) is not stopped by the drop: await it
    /// inside this future or make it observe cancellation itself.
    async fn do_action(
        &self,
        registry: &ResourceRegistry,
        driver: &dyn OperationDriver,
    ) -> anyhow::Result<()>;

    /// Undo the forward work, possibly from partial progress
    async fn unravel(
        &self,
        registry: &ResourceRegistry,
        driver: &dyn OperationDriver,
    ) -> anyhow::Result<()>;

    /// Resource names this operation may touch
    fn locked_tasks(&self) -> BTreeSet<String>;

    /// Wire identity used to pick a decoder
    fn kind(&self) -> &'static str;

    /// Wire body, decoded by the decoder registered for `kind()`
    fn payload(&self) -> Result<Value, CodecError>;
}

/// Per-step checkpoint and diagnostics façade
///
/// Not safe for concurrent calls for the same step; an operation owns its
/// driver for the duration of one `do_action` or `unravel`.
#[async_trait::async_trait]
pub trait OperationDriver: Send + Sync {
    /// Durably replace the step's checkpoint; returns once durable
    async fn save(&self, value: Value) -> Result<(), StorageError>;

    /// Last saved checkpoint, if any
    async fn load(&self) -> Result<Option<Value>, StorageError>;

    /// Step-scoped informational message
    fn info(&self, message: &str);

    /// Step-scoped error message
    fn error(&self, message: &str);
}

impl dyn OperationDriver + '_ {
    /// Save a typed checkpoint
    pub async fn save_as<T: Serialize + Sync + ?Sized>(&self, value: &T) -> Result<(), StorageError> {
        let value = serde_json::to_value(value).map_err(CodecError::from)?;
        self.save(value).await
    }

    /// Load a typed checkpoint
    pub async fn load_as<T: DeserializeOwned>(&self) -> Result<Option<T>, StorageError> {
        match self.load().await? {
            Some(value) => Ok(Some(serde_json::from_value(value).map_err(CodecError::from)?)),
            None => Ok(None),
        }
    }
}

/// Builds the driver for one step
pub trait OperationDriverFactory: Send + Sync {
    /// Create the driver for `step_id` of `plan_id`
    fn make_driver(&self, plan_id: PlanId, step_id: StepId) -> Arc<dyn OperationDriver>;
}

/// Step identity attached to diagnostics
#[derive(Debug, Clone, Copy)]
pub struct StepScope {
    /// Owning plan
    pub plan_id: PlanId,
    /// Step
    pub step_id: StepId,
}

impl StepScope {
    /// Emit an info event tagged with the step
    pub fn info(&self, message: &str) {
        tracing::info!(plan_id = %self.plan_id, step_id = %self.step_id, "{message}");
    }

    /// Emit an error event tagged with the step
    pub fn error(&self, message: &str) {
        tracing::error!(plan_id = %self.plan_id, step_id = %self.step_id, "{message}");
    }
}

/// In-process checkpoint storage
///
/// Checkpoints live as long as the factory. Useful for tests and for
/// embedders whose operations are naturally idempotent.
#[derive(Debug, Clone, Default)]
pub struct MemoryDriverFactory {
    checkpoints: Arc<RwLock<HashMap<StepId, Value>>>,
}

impl MemoryDriverFactory {
    /// Create an empty factory
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current checkpoint of a step
    pub fn checkpoint(&self, step_id: StepId) -> Option<Value> {
        self.checkpoints.read().get(&step_id).cloned()
    }
}

impl OperationDriverFactory for MemoryDriverFactory {
    fn make_driver(&self, plan_id: PlanId, step_id: StepId) -> Arc<dyn OperationDriver> {
        Arc::new(MemoryDriver {
            scope: StepScope { plan_id, step_id },
            checkpoints: Arc::clone(&self.checkpoints),
        })
    }
}

struct MemoryDriver {
    scope: StepScope,
    checkpoints: Arc<RwLock<HashMap<StepId, Value>>>,
}

#[async_trait::async_trait]
impl OperationDriver for MemoryDriver {
    async fn save(&self, value: Value) -> Result<(), StorageError> {
        self.checkpoints.write().insert(self.scope.step_id, value);
        Ok(())
    }

    async fn load(&self) -> Result<Option<Value>, StorageError> {
        Ok(self.checkpoints.read().get(&self.scope.step_id).cloned())
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
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Progress {
        launched: u32,
    }

    #[test]
    fn test_registry_downcast() {
        let registry = ResourceRegistry::new(42u64);
        assert_eq!(registry.get::<u64>(), Some(&42));
        assert!(registry.get::<String>().is_none());
        assert!(ResourceRegistry::empty().get::<u64>().is_none());
    }

    #[tokio::test]
    async fn test_memory_driver_replaces_checkpoint() {
        let factory = MemoryDriverFactory::new();
        let step = StepId::new();
        let driver = factory.make_driver(PlanId::new(), step);

        assert!(driver.load().await.unwrap().is_none());

        driver.save_as(&Progress { launched: 1 }).await.unwrap();
        driver.save_as(&Progress { launched: 3 }).await.unwrap();

        let loaded: Option<Progress> = driver.load_as().await.unwrap();
        assert_eq!(loaded, Some(Progress { launched: 3 }));
        assert_eq!(factory.checkpoint(step), Some(serde_json::json!({ "launched": 3 })));
    }

    #[tokio::test]
    async fn test_memory_driver_is_scoped_per_step() {
        let factory = MemoryDriverFactory::new();
        let plan = PlanId::new();
        let a = factory.make_driver(plan, StepId::new());
        let b = factory.make_driver(plan, StepId::new());

        a.save(Value::from("a")).await.unwrap();
        assert!(b.load().await.unwrap().is_none());
    }
}
