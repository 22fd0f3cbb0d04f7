//! Testing utilities for the txnplan workspace
//!
//! Shared fixtures for integration tests:
//! - `World`: shared log, gates and overlap detection, handed to operations
//!   through the `ResourceRegistry`
//! - `LogOp`: a serializable operation driven by the `World`
//! - `RecordingListener`: records lifecycle events and lets tests wait for
//!   plan ends
//! - `FaultyStorage`: a storage driver that fails on demand
//! - `Harness`: an executor wired to an in-memory store

#![allow(missing_docs)]

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use txnplan::{
    CodecError, ExecutorConfig, MemoryStore, Operation, OperationCodec, OperationDriver, Plan,
    PlanExecutor, PlanId, PlanListener, PlanStatus, PlanStorageDriver, ResourceRegistry,
    SchedulerState, SharedListener, Step, StepId, StorageError, StoreDriverFactory,
    StoreStorageDriver,
};

/// Shared state observed and driven by [`LogOp`]
#[derive(Debug, Default)]
pub struct World {
    log: Mutex<Vec<String>>,
    blocked: Mutex<HashSet<String>>,
    released: Notify,
    active: Mutex<HashMap<String, usize>>,
    overlaps: Mutex<Vec<String>>,
}

impl World {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn registry(self: &Arc<Self>) -> ResourceRegistry {
        ResourceRegistry::from_arc(Arc::clone(self))
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn push(&self, entry: String) {
        self.log.lock().push(entry);
    }

    /// Make `do:<name>` wait until [`release`](Self::release)
    pub fn block(&self, name: &str) {
        self.blocked.lock().insert(name.to_string());
    }

    pub fn release(&self, name: &str) {
        self.blocked.lock().remove(name);
        self.released.notify_waiters();
    }

    /// Resources that were ever held by two operations at once
    pub fn overlaps(&self) -> Vec<String> {
        self.overlaps.lock().clone()
    }

    async fn wait_until_released(&self, name: &str) {
        loop {
            let notified = self.released.notified();
            if !self.blocked.lock().contains(name) {
                return;
            }
            notified.await;
        }
    }

    fn enter(&self, resources: &BTreeSet<String>) {
        let mut active = self.active.lock();
        for resource in resources {
            let count = active.entry(resource.clone()).or_default();
            *count += 1;
            if *count > 1 {
                self.overlaps.lock().push(resource.clone());
            }
        }
    }

    fn leave(&self, resources: &BTreeSet<String>) {
        let mut active = self.active.lock();
        for resource in resources {
            if let Some(count) = active.get_mut(resource) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Wait until `entry` shows up in the log
    pub async fn wait_for_entry(&self, entry: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.log.lock().iter().any(|e| e == entry) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        false
    }
}

/// Checkpoint written by [`LogOp`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempts {
    pub runs: u32,
}

/// Serializable operation that logs to the registry's [`World`]
///
/// `do_action` logs `do:<name>`, `unravel` logs `undo:<name>`. Every run
/// bumps an [`Attempts`] checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogOp {
    pub name: String,
    #[serde(default)]
    pub locks: BTreeSet<String>,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub fail: bool,
    #[serde(default)]
    pub fail_unravel: bool,
    #[serde(default)]
    pub panic: bool,
}

impl LogOp {
    pub const KIND: &'static str = "log";

    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn locking<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.locks.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn delayed(mut self, millis: u64) -> Self {
        self.delay_ms = millis;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn failing_unravel(mut self) -> Self {
        self.fail_unravel = true;
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panic = true;
        self
    }
}

#[async_trait::async_trait]
impl Operation for LogOp {
    async fn do_action(
        &self,
        registry: &ResourceRegistry,
        driver: &dyn OperationDriver,
    ) -> anyhow::Result<()> {
        let world = registry
            .get::<World>()
            .ok_or_else(|| anyhow::anyhow!("registry does not hold a World"))?;

        let attempts: Attempts = driver.load_as().await?.unwrap_or_default();
        driver
            .save_as(&Attempts {
                runs: attempts.runs + 1,
            })
            .await?;

        world.enter(&self.locks);
        world.push(format!("start:{}", self.name));
        world.wait_until_released(&self.name).await;
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        world.push(format!("do:{}", self.name));
        world.leave(&self.locks);

        if self.panic {
            panic!("{} panicked", self.name);
        }
        if self.fail {
            driver.error(&format!("{} failing on purpose", self.name));
            anyhow::bail!("{} failed", self.name);
        }
        Ok(())
    }

    async fn unravel(
        &self,
        registry: &ResourceRegistry,
        _driver: &dyn OperationDriver,
    ) -> anyhow::Result<()> {
        let world = registry
            .get::<World>()
            .ok_or_else(|| anyhow::anyhow!("registry does not hold a World"))?;
        world.push(format!("undo:{}", self.name));
        if self.fail_unravel {
            anyhow::bail!("{} could not be undone", self.name);
        }
        Ok(())
    }

    fn locked_tasks(&self) -> BTreeSet<String> {
        self.locks.clone()
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn payload(&self) -> Result<Value, CodecError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Codec knowing every fixture operation
pub fn codec() -> OperationCodec {
    OperationCodec::new().with::<LogOp>(LogOp::KIND)
}

/// One recorded listener callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PlanStarted(PlanId),
    StepBegan(PlanId, StepId),
    StepEnded(PlanId, StepId),
    PlanEnded(PlanId, bool),
}

/// Records every callback in order
#[derive(Debug)]
pub struct RecordingListener {
    events: Mutex<Vec<Event>>,
    ended: watch::Sender<usize>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        let (ended, _) = watch::channel(0);
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            ended,
        })
    }

    pub fn shared(self: &Arc<Self>) -> SharedListener {
        Arc::clone(self) as SharedListener
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Plan ends in the order they were reported
    pub fn ended(&self) -> Vec<(PlanId, bool)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::PlanEnded(id, ok) => Some((*id, *ok)),
                _ => None,
            })
            .collect()
    }

    /// Wait until at least `count` plans have ended
    pub async fn wait_for_ended(&self, count: usize, timeout: Duration) -> bool {
        let mut rx = self.ended.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|n| *n >= count))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl PlanListener for RecordingListener {
    fn plan_started(&self, plan: &Plan, _status: &PlanStatus) {
        self.record(Event::PlanStarted(plan.id()));
    }

    fn step_began(&self, plan: &Plan, _status: &PlanStatus, step: &Step) {
        self.record(Event::StepBegan(plan.id(), step.id()));
    }

    fn step_ended(&self, plan: &Plan, _status: &PlanStatus, step: &Step) {
        self.record(Event::StepEnded(plan.id(), step.id()));
    }

    fn plan_ended(&self, plan: &Plan, _status: &PlanStatus, succeeded: bool) {
        self.record(Event::PlanEnded(plan.id(), succeeded));
        self.ended.send_modify(|n| *n += 1);
    }
}

type StatusFilter = Box<dyn Fn(&PlanStatus) -> bool + Send + Sync>;

/// Storage driver that delegates to a real one until told to fail
pub struct FaultyStorage {
    inner: Arc<dyn PlanStorageDriver>,
    scheduler_failures: AtomicUsize,
    refused_statuses: Mutex<Option<StatusFilter>>,
}

impl FaultyStorage {
    pub fn new(inner: Arc<dyn PlanStorageDriver>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            scheduler_failures: AtomicUsize::new(0),
            refused_statuses: Mutex::new(None),
        })
    }

    /// Fail the next `count` scheduler state saves
    pub fn fail_scheduler_saves(&self, count: usize) {
        self.scheduler_failures.store(count, Ordering::SeqCst);
    }

    /// Scheduler state saves still set to fail
    pub fn pending_scheduler_failures(&self) -> usize {
        self.scheduler_failures.load(Ordering::SeqCst)
    }

    /// Fail every status save matching `filter`
    pub fn refuse_statuses(&self, filter: impl Fn(&PlanStatus) -> bool + Send + Sync + 'static) {
        *self.refused_statuses.lock() = Some(Box::new(filter));
    }

    /// Stop failing
    pub fn heal(&self) {
        self.scheduler_failures.store(0, Ordering::SeqCst);
        *self.refused_statuses.lock() = None;
    }

    fn injected() -> StorageError {
        StorageError::Backend("injected failure".to_string())
    }
}

#[async_trait::async_trait]
impl PlanStorageDriver for FaultyStorage {
    async fn save_status_for_plan(&self, status: &PlanStatus) -> Result<(), StorageError> {
        let refused = self
            .refused_statuses
            .lock()
            .as_ref()
            .is_some_and(|filter| filter(status));
        if refused {
            return Err(Self::injected());
        }
        self.inner.save_status_for_plan(status).await
    }

    async fn save_plan(&self, plan: &Plan) -> Result<(), StorageError> {
        self.inner.save_plan(plan).await
    }

    async fn forget_plan(&self, id: PlanId) -> Result<(), StorageError> {
        self.inner.forget_plan(id).await
    }

    async fn save_scheduler_state(&self, state: &SchedulerState) -> Result<(), StorageError> {
        let fail = self
            .scheduler_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(Self::injected());
        }
        self.inner.save_scheduler_state(state).await
    }

    async fn load_scheduler_state(&self) -> Result<Option<SchedulerState>, StorageError> {
        self.inner.load_scheduler_state().await
    }

    async fn load_plans(&self) -> Result<HashMap<PlanId, Plan>, StorageError> {
        self.inner.load_plans().await
    }

    async fn try_load_plan(&self, id: PlanId) -> Result<Option<Plan>, StorageError> {
        self.inner.try_load_plan(id).await
    }

    async fn try_load_plan_status(&self, id: PlanId) -> Result<Option<PlanStatus>, StorageError> {
        self.inner.try_load_plan_status(id).await
    }
}

/// Executor wired to a shared in-memory store
///
/// The executor writes through `faults`; `storage` reads the same data
/// without fault injection.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub storage: Arc<StoreStorageDriver<MemoryStore>>,
    pub faults: Arc<FaultyStorage>,
    pub world: Arc<World>,
    pub executor: PlanExecutor,
}

impl Harness {
    /// Fresh store, fresh world
    pub fn new(max_concurrent_steps: usize) -> Self {
        Self::over(Arc::new(MemoryStore::new()), World::new(), max_concurrent_steps)
    }

    /// Executor over an existing store, as after a restart
    pub fn over(store: Arc<MemoryStore>, world: Arc<World>, max_concurrent_steps: usize) -> Self {
        let config = ExecutorConfig::new().with_max_concurrent_steps(max_concurrent_steps);
        Self::configured(store, world, config)
    }

    /// Executor over an existing store with an explicit config
    pub fn configured(store: Arc<MemoryStore>, world: Arc<World>, config: ExecutorConfig) -> Self {
        let storage = Arc::new(StoreStorageDriver::new(Arc::clone(&store), codec()));
        let faults = FaultyStorage::new(storage.clone());
        let executor = PlanExecutor::builder()
            .with_registry(world.registry())
            .with_storage(faults.clone())
            .with_driver_factory(Arc::new(StoreDriverFactory::new(Arc::clone(&store))))
            .with_config(config)
            .build()
            .expect("valid executor config");
        Self {
            store,
            storage,
            faults,
            world,
            executor,
        }
    }
}

/// Default wait used by integration tests
pub const WAIT: Duration = Duration::from_secs(5);
