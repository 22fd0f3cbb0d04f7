//! Plan Executor
//!
//! Admits plans so that no two plans sharing a resource name ever run at
//! once.
//!
//! # Coordinator
//!
//! All admission state lives in one coordinator behind one async mutex:
//! - the scheduler state (per-resource FIFO queues and running set)
//! - the live tracker index
//! - whether the executor has been initialized
//!
//! Submission, reload and every scheduling pass run inside it. Trackers
//! report plan end through an internal listener that only spawns a new
//! scheduling pass, so no tracker ever waits on the coordinator.

use crate::codec::OperationCodec;
use crate::config::ExecutorConfig;
use crate::error::{ExecutorError, StorageError};
use crate::ids::PlanId;
use crate::listener::{PlanListener, SharedListener};
use crate::operation::{MemoryDriverFactory, OperationDriverFactory, ResourceRegistry};
use crate::plan::Plan;
use crate::pool::{PoolStats, WorkerPool};
use crate::scheduler::SchedulerState;
use crate::status::PlanStatus;
use crate::storage::{MemoryStore, PlanStorageDriver, StoreStorageDriver};
use crate::tracker::PlanTracker;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Weak};

/// Admits and runs plans over shared resources
#[derive(Clone)]
pub struct PlanExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    registry: ResourceRegistry,
    drivers: Arc<dyn OperationDriverFactory>,
    storage: Arc<dyn PlanStorageDriver>,
    pool: WorkerPool,
    forget_finished: bool,
    coordinator: tokio::sync::Mutex<Coordinator>,
}

#[derive(Default)]
struct Coordinator {
    state: SchedulerState,
    live: HashMap<PlanId, LivePlan>,
    initialized: bool,
}

struct LivePlan {
    tracker: PlanTracker,
    footprint: BTreeSet<String>,
}

impl PlanExecutor {
    /// Start building an executor
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::default()
    }

    /// Submit a frozen plan
    ///
    /// The plan is persisted, queued on every resource it affects and run as
    /// soon as it heads all of those queues. `listeners` observe this plan
    /// only.
    pub async fn submit_plan(
        &self,
        plan: Plan,
        listeners: Vec<SharedListener>,
    ) -> Result<PlanId, ExecutorError> {
        let inner = &self.inner;
        let id = plan.id();
        let mut coordinator = inner.coordinator.lock().await;
        coordinator.initialized = true;
        if coordinator.live.contains_key(&id) {
            return Err(ExecutorError::DuplicatePlan(id));
        }

        inner.storage.save_plan(&plan).await?;
        let live = inner.track(plan, listeners, None)?;
        let resources = live.footprint.len();
        let mut candidate = coordinator.state.clone();
        candidate.enqueue(id, &live.footprint);
        coordinator.live.insert(id, live);

        if let Err(e) = inner.schedule_locked(&mut coordinator, candidate, true).await {
            coordinator.live.remove(&id);
            if let Err(forget) = inner.storage.forget_plan(id).await {
                tracing::warn!(plan_id = %id, error = %forget, "could not drop rejected plan");
            }
            return Err(e.into());
        }
        tracing::info!(plan_id = %id, resources, "plan submitted");
        Ok(id)
    }

    /// Rebuild admission state and trackers after a restart
    ///
    /// Allowed once, before any submission. Plans already admitted resume
    /// from their stored status; queued plans wait for admission as usual.
    pub async fn reload_from_storage(
        &self,
        listeners: Vec<SharedListener>,
    ) -> Result<(), ExecutorError> {
        let inner = &self.inner;
        let mut coordinator = inner.coordinator.lock().await;
        if coordinator.initialized {
            return Err(ExecutorError::AlreadyInitialized);
        }
        coordinator.initialized = true;

        let stored = inner.storage.load_scheduler_state().await?.unwrap_or_default();
        let referenced: BTreeSet<PlanId> = stored
            .queued_plans()
            .into_iter()
            .chain(stored.running().iter().copied())
            .collect();

        // Only plans the scheduler still references are decoded
        let mut plans = HashMap::new();
        let mut missing = BTreeSet::new();
        for &id in &referenced {
            match inner.storage.try_load_plan(id).await? {
                Some(plan) => {
                    plans.insert(id, plan);
                }
                None => {
                    tracing::warn!(plan_id = %id, "stored scheduler state names an unknown plan, dropping it");
                    missing.insert(id);
                }
            }
        }

        let queues: BTreeMap<String, VecDeque<PlanId>> = stored
            .queues()
            .iter()
            .map(|(resource, queue)| {
                let kept = queue.iter().copied().filter(|id| !missing.contains(id)).collect();
                (resource.clone(), kept)
            })
            .collect();
        let running: BTreeSet<PlanId> = stored
            .running()
            .iter()
            .copied()
            .filter(|id| !missing.contains(id))
            .collect();
        let state = SchedulerState::from_parts(queues, running);

        for (id, plan) in plans {
            let status = inner.storage.try_load_plan_status(id).await?;
            let live = inner.track(plan, listeners.clone(), status)?;
            coordinator.live.insert(id, live);
        }
        tracing::info!(
            plans = coordinator.live.len(),
            running = state.running().len(),
            dropped = missing.len(),
            "reloaded executor state"
        );

        let resumed: Vec<PlanTracker> = state
            .running()
            .iter()
            .filter_map(|id| coordinator.live.get(id))
            .map(|live| live.tracker.clone())
            .collect();
        coordinator.state = state;
        for tracker in resumed {
            tracker.resume_execution().await;
        }

        let candidate = coordinator.state.clone();
        inner.schedule_locked(&mut coordinator, candidate, true).await?;
        Ok(())
    }

    /// Copy of the current admission state
    pub async fn scheduler_state(&self) -> SchedulerState {
        self.inner.coordinator.lock().await.state.clone()
    }

    /// Tracker of a live plan
    pub async fn tracker(&self, id: PlanId) -> Option<PlanTracker> {
        let coordinator = self.inner.coordinator.lock().await;
        coordinator.live.get(&id).map(|live| live.tracker.clone())
    }

    /// IDs of plans not yet evicted after completion
    pub async fn live_plans(&self) -> Vec<PlanId> {
        let coordinator = self.inner.coordinator.lock().await;
        let mut ids: Vec<PlanId> = coordinator.live.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Run a scheduling pass now
    pub async fn schedule(&self) -> Result<(), StorageError> {
        self.inner.schedule().await
    }

    /// Worker pool statistics
    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }
}

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("pool", &self.inner.pool.stats())
            .finish_non_exhaustive()
    }
}

impl ExecutorInner {
    fn track(
        self: &Arc<Self>,
        plan: Plan,
        listeners: Vec<SharedListener>,
        status: Option<PlanStatus>,
    ) -> Result<LivePlan, ExecutorError> {
        let footprint = plan.affected_task_names();
        let scheduling: SharedListener = Arc::new(SchedulingListener {
            executor: Arc::downgrade(self),
        });
        let mut builder = PlanTracker::builder(plan)
            .with_registry(self.registry.clone())
            .with_driver_factory(Arc::clone(&self.drivers))
            .with_storage(Arc::clone(&self.storage))
            .with_pool(self.pool.clone())
            .with_listeners(listeners)
            .with_listener(scheduling);
        if let Some(status) = status {
            builder = builder.with_status(status);
        }
        Ok(LivePlan {
            tracker: builder.build()?,
            footprint,
        })
    }

    async fn schedule(self: &Arc<Self>) -> Result<(), StorageError> {
        let mut coordinator = self.coordinator.lock().await;
        let candidate = coordinator.state.clone();
        self.schedule_locked(&mut coordinator, candidate, false).await
    }

    /// One scheduling pass over `state`, a copy of the committed state
    ///
    /// 1. pop completed plans off every queue head, evicting plans that are
    ///    no longer queued anywhere
    /// 2. admit every plan heading all of its queues, plus plans with no
    ///    resources at all
    /// 3. persist the new state, commit it, then start the admitted plans
    ///
    /// If the save fails the committed state and the live index are left
    /// as they were.
    async fn schedule_locked(
        &self,
        coordinator: &mut Coordinator,
        mut state: SchedulerState,
        dirty: bool,
    ) -> Result<(), StorageError> {
        let live = &coordinator.live;
        let evicted = state.prune(|id| live.get(&id).map_or(true, |p| p.tracker.is_complete()));

        let mut ready = state.ready_plans(|id| live.get(&id).map(|p| p.footprint.clone()));
        ready.extend(
            live.iter()
                .filter(|(id, p)| {
                    p.footprint.is_empty() && !state.is_running(**id) && !evicted.contains(*id)
                })
                .map(|(id, _)| *id),
        );
        for id in &ready {
            state.mark_running(*id);
        }

        if dirty || !evicted.is_empty() || !ready.is_empty() {
            self.storage.save_scheduler_state(&state).await?;
        }
        coordinator.state = state;

        for id in &evicted {
            coordinator.live.remove(id);
            tracing::debug!(plan_id = %id, "evicted completed plan");
            if self.forget_finished {
                if let Err(e) = self.storage.forget_plan(*id).await {
                    tracing::warn!(plan_id = %id, error = %e, "could not drop finished plan from storage");
                }
            }
        }

        for id in ready {
            if let Some(p) = coordinator.live.get(&id) {
                tracing::info!(plan_id = %id, "plan admitted");
                p.tracker.resume_execution().await;
            }
        }
        Ok(())
    }
}

/// Re-runs scheduling whenever one of the executor's plans ends
struct SchedulingListener {
    executor: Weak<ExecutorInner>,
}

impl PlanListener for SchedulingListener {
    fn plan_ended(&self, plan: &Plan, _status: &PlanStatus, _succeeded: bool) {
        let Some(executor) = self.executor.upgrade() else {
            return;
        };
        let plan_id = plan.id();
        tokio::spawn(async move {
            if let Err(e) = executor.schedule().await {
                tracing::error!(plan_id = %plan_id, error = %e, "scheduling after plan end failed");
            }
        });
    }
}

/// Builder for [`PlanExecutor`]
#[derive(Default)]
pub struct ExecutorBuilder {
    registry: ResourceRegistry,
    drivers: Option<Arc<dyn OperationDriverFactory>>,
    storage: Option<Arc<dyn PlanStorageDriver>>,
    config: ExecutorConfig,
}

impl ExecutorBuilder {
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

    /// Durable storage (default: a private in-memory store)
    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn PlanStorageDriver>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Executor configuration
    #[must_use]
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration and build
    pub fn build(self) -> Result<PlanExecutor, ExecutorError> {
        self.config.validate()?;
        let storage = self.storage.unwrap_or_else(|| {
            Arc::new(StoreStorageDriver::new(
                Arc::new(MemoryStore::new()),
                OperationCodec::new(),
            ))
        });
        let drivers = self
            .drivers
            .unwrap_or_else(|| Arc::new(MemoryDriverFactory::new()));

        tracing::debug!(max_concurrent_steps = self.config.max_concurrent_steps, "executor built");
        Ok(PlanExecutor {
            inner: Arc::new(ExecutorInner {
                registry: self.registry,
                drivers,
                storage,
                pool: WorkerPool::from_config(&self.config),
                forget_finished: self.config.forget_finished_plans,
                coordinator: tokio::sync::Mutex::new(Coordinator::default()),
            }),
        })
    }
}
