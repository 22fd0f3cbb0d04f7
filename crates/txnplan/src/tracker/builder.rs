//! Tracker Builder

use super::{PlanTracker, TrackerInner};
use crate::error::StatusError;
use crate::listener::SharedListener;
use crate::operation::{MemoryDriverFactory, OperationDriverFactory, ResourceRegistry};
use crate::plan::Plan;
use crate::pool::WorkerPool;
use crate::status::PlanStatus;
use crate::storage::PlanStorageDriver;
use std::sync::Arc;

/// Builder for [`PlanTracker`]
///
/// Usage:
/// ```rust,ignore
/// let tracker = PlanTracker::builder(plan)
///     .with_registry(registry)
///     .with_storage(storage)
///     .with_listener(Arc::new(LoggingListener))
///     .build()?;
/// tracker.resume_execution().await;
/// ```
pub struct TrackerBuilder {
    plan: Arc<Plan>,
    registry: ResourceRegistry,
    drivers: Option<Arc<dyn OperationDriverFactory>>,
    storage: Option<Arc<dyn PlanStorageDriver>>,
    pool: Option<WorkerPool>,
    listeners: Vec<SharedListener>,
    status: Option<PlanStatus>,
}

impl TrackerBuilder {
    pub(super) fn new(plan: Arc<Plan>) -> Self {
        Self {
            plan,
            registry: ResourceRegistry::empty(),
            drivers: None,
            storage: None,
            pool: None,
            listeners: Vec::new(),
            status: None,
        }
    }

    /// Capability handed to every operation
    #[must_use]
    pub fn with_registry(mut self, registry: ResourceRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Checkpoint driver factory (default: in-memory)
    #[must_use]
    pub fn with_driver_factory(mut self, drivers: Arc<dyn OperationDriverFactory>) -> Self {
        self.drivers = Some(drivers);
        self
    }

    /// Persist every status transition through `storage`
    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn PlanStorageDriver>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Shared worker pool (default: a private pool sized from the default config)
    #[must_use]
    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Add one listener
    #[must_use]
    pub fn with_listener(mut self, listener: SharedListener) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Add listeners, notified in order
    #[must_use]
    pub fn with_listeners(mut self, listeners: impl IntoIterator<Item = SharedListener>) -> Self {
        self.listeners.extend(listeners);
        self
    }

    /// Start from a restored status instead of a fresh one
    #[must_use]
    pub fn with_status(mut self, status: PlanStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Build the tracker; nothing runs until `resume_execution`
    pub fn build(self) -> Result<PlanTracker, StatusError> {
        let status = match self.status {
            Some(status) if status.plan_id() != self.plan.id() => {
                return Err(StatusError::PlanMismatch {
                    expected: self.plan.id(),
                    found: status.plan_id(),
                });
            }
            Some(status) => status,
            None => PlanStatus::new(&self.plan),
        };

        let inner = TrackerInner::new(
            self.plan,
            status,
            self.registry,
            self.drivers
                .unwrap_or_else(|| Arc::new(MemoryDriverFactory::new())),
            self.storage,
            self.pool.unwrap_or_default(),
            self.listeners,
        );
        Ok(PlanTracker {
            inner: Arc::new(inner),
        })
    }
}
