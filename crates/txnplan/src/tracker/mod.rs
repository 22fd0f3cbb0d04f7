//! Plan Tracker
//!
//! Drives one plan: dispatches ready steps to the worker pool, records every
//! transition in a fresh [`PlanStatus`] snapshot, and on the first failure
//! rolls the plan back.
//!
//! # Critical section
//!
//! Every transition runs under one async mutex, held across persistence:
//! compute the next status, save it, publish it, dispatch whatever became
//! ready. Readers take the published `Arc<PlanStatus>` without locking out
//! writers for longer than a pointer swap.
//!
//! # Rollback
//!
//! ```text
//! step fails ─► latch ─► mark rolling_back ─► abort other step tasks
//!                                   │
//!                                   ▼
//!            wait for aborted tasks to stop, then undo running steps,
//!            then completed newest first
//!            (one dedicated task, outside the worker pool)
//! ```
//!
//! The latch is one-shot: later failures are logged and dropped. An `unravel`
//! failure marks the plan crashed and stops the rollback.

pub mod builder;

pub use builder::TrackerBuilder;

use crate::error::{StepFailure, StorageError};
use crate::ids::{PlanId, StepId};
use crate::listener::{PlanListener, SharedListener};
use crate::operation::{OperationDriverFactory, ResourceRegistry};
use crate::plan::Plan;
use crate::pool::WorkerPool;
use crate::status::PlanStatus;
use crate::storage::PlanStorageDriver;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Runs one plan to completion or rollback
///
/// Cheap to clone; clones share the same plan state.
#[derive(Clone)]
pub struct PlanTracker {
    inner: Arc<TrackerInner>,
}

impl PlanTracker {
    /// Start building a tracker for `plan`
    pub fn builder(plan: impl Into<Arc<Plan>>) -> TrackerBuilder {
        TrackerBuilder::new(plan.into())
    }

    /// Tracked plan ID
    #[inline]
    #[must_use]
    pub fn id(&self) -> PlanId {
        self.inner.plan.id()
    }

    /// Tracked plan
    #[inline]
    #[must_use]
    pub fn plan(&self) -> &Arc<Plan> {
        &self.inner.plan
    }

    /// Latest committed status
    pub fn status(&self) -> Arc<PlanStatus> {
        self.inner.snapshot()
    }

    /// Whether the latest status is terminal
    pub fn is_complete(&self) -> bool {
        self.inner.snapshot().is_complete()
    }

    /// Begin (or, after a restart, continue) execution
    ///
    /// Running steps in the status are dispatched again without being
    /// restarted; a status caught mid-rollback resumes its rollback. Calling
    /// this more than once has no effect.
    pub async fn resume_execution(&self) {
        self.inner.resume().await;
    }

    /// Roll the plan back
    ///
    /// No effect on a complete plan. If a rollback is already in progress it
    /// is interrupted before its next undo, which marks the plan crashed.
    pub async fn abort(&self) {
        let inner = &self.inner;
        if inner.snapshot().is_complete() {
            return;
        }
        if let Some(rollback) = inner.begin_rollback(StepFailure::Aborted, None).await {
            inner.launch_rollback(rollback);
        }
    }

    /// Wait for the plan to end; `true` if it succeeded
    pub async fn outcome(&self) -> bool {
        let mut rx = self.inner.outcome.subscribe();
        let succeeded = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).unwrap_or(false),
            Err(_) => false,
        };
        succeeded
    }
}

impl std::fmt::Debug for PlanTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanTracker")
            .field("plan_id", &self.id())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

pub(crate) struct TrackerInner {
    plan: Arc<Plan>,
    registry: ResourceRegistry,
    drivers: Arc<dyn OperationDriverFactory>,
    storage: Option<Arc<dyn PlanStorageDriver>>,
    pool: WorkerPool,
    listeners: Vec<SharedListener>,

    transition: tokio::sync::Mutex<()>,
    status: RwLock<Arc<PlanStatus>>,
    in_flight: Mutex<HashMap<StepId, InFlight>>,

    resumed: AtomicBool,
    rollback_started: AtomicBool,
    rollback_interrupted: AtomicBool,
    ended: AtomicBool,
    outcome: watch::Sender<Option<bool>>,
}

/// A dispatched step task
struct InFlight {
    handle: JoinHandle<()>,
    began: Arc<AtomicBool>,
}

/// Work handed to the rollback task
struct Rollback {
    order: Vec<StepId>,
    cancelled: Vec<(StepId, InFlight)>,
    crashed: bool,
}

/// What a step task does after its transition committed
enum Next {
    Nothing,
    Finished,
    Rollback(Rollback),
}

impl TrackerInner {
    pub(crate) fn new(
        plan: Arc<Plan>,
        status: PlanStatus,
        registry: ResourceRegistry,
        drivers: Arc<dyn OperationDriverFactory>,
        storage: Option<Arc<dyn PlanStorageDriver>>,
        pool: WorkerPool,
        listeners: Vec<SharedListener>,
    ) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            plan,
            registry,
            drivers,
            storage,
            pool,
            listeners,
            transition: tokio::sync::Mutex::new(()),
            status: RwLock::new(Arc::new(status)),
            in_flight: Mutex::new(HashMap::new()),
            resumed: AtomicBool::new(false),
            rollback_started: AtomicBool::new(false),
            rollback_interrupted: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            outcome,
        }
    }

    fn snapshot(&self) -> Arc<PlanStatus> {
        Arc::clone(&self.status.read())
    }

    fn publish(&self, status: PlanStatus) -> Arc<PlanStatus> {
        let status = Arc::new(status);
        *self.status.write() = Arc::clone(&status);
        status
    }

    async fn persist(&self, status: &PlanStatus) -> Result<(), StorageError> {
        match &self.storage {
            Some(storage) => storage.save_status_for_plan(status).await,
            None => Ok(()),
        }
    }

    fn notify(&self, event: impl Fn(&dyn PlanListener)) {
        for listener in &self.listeners {
            event(listener.as_ref());
        }
    }

    async fn resume(self: &Arc<Self>) {
        if self.resumed.swap(true, Ordering::AcqRel) {
            tracing::debug!(plan_id = %self.plan.id(), "tracker already resumed");
            return;
        }

        let status = self.snapshot();
        self.notify(|l| l.plan_started(&self.plan, &status));

        if status.is_complete() {
            self.finish_plan(status.succeeded());
            return;
        }
        if status.is_rolling_back() {
            if !self.rollback_started.swap(true, Ordering::AcqRel) {
                tracing::info!(plan_id = %self.plan.id(), "resuming interrupted rollback");
                self.launch_rollback(Rollback {
                    order: status.undo_order(),
                    cancelled: Vec::new(),
                    crashed: false,
                });
            }
            return;
        }

        let _guard = self.transition.lock().await;
        let status = self.snapshot();
        let mut dispatched = 0;
        {
            let mut in_flight = self.in_flight.lock();
            for &id in status.running() {
                if self.dispatch(&mut in_flight, id, true) {
                    dispatched += 1;
                }
            }
        }
        dispatched += self.dispatch_ready(&status);

        tracing::debug!(
            plan_id = %self.plan.id(),
            dispatched,
            resumed_running = status.running().len(),
            "plan execution resumed"
        );
        if dispatched == 0 && status.is_complete() {
            self.finish_plan(status.succeeded());
        }
    }

    /// Dispatch every pending step whose prerequisites have completed
    ///
    /// Must be called with the transition lock held.
    fn dispatch_ready(self: &Arc<Self>, status: &PlanStatus) -> usize {
        let completed: HashSet<StepId> = status.completed().iter().copied().collect();
        let mut in_flight = self.in_flight.lock();
        let ready: Vec<StepId> = self
            .plan
            .step_ids()
            .filter(|id| status.pending().contains(id) && !in_flight.contains_key(id))
            .filter(|id| {
                self.plan
                    .prerequisites(*id)
                    .iter()
                    .all(|prereq| completed.contains(prereq))
            })
            .collect();

        ready
            .into_iter()
            .filter(|&id| self.dispatch(&mut in_flight, id, false))
            .count()
    }

    fn dispatch(
        self: &Arc<Self>,
        in_flight: &mut HashMap<StepId, InFlight>,
        id: StepId,
        resumed: bool,
    ) -> bool {
        if in_flight.contains_key(&id) {
            return false;
        }
        let inner = Arc::clone(self);
        let began = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&began);
        let handle = self
            .pool
            .spawn(async move { inner.run_step(id, resumed, flag).await });
        in_flight.insert(id, InFlight { handle, began });
        true
    }

    fn forget(&self, id: StepId) {
        self.in_flight.lock().remove(&id);
    }

    async fn run_step(self: Arc<Self>, id: StepId, resumed: bool, began: Arc<AtomicBool>) {
        let Some(step) = self.plan.step(id).cloned() else {
            self.forget(id);
            return;
        };

        if resumed {
            if self.rollback_started.load(Ordering::Acquire) {
                self.forget(id);
                return;
            }
        } else {
            match self.start_step(id).await {
                Ok(true) => {}
                Ok(false) => {
                    self.forget(id);
                    return;
                }
                Err(failure) => {
                    let rollback = self.begin_rollback(failure, Some(id)).await;
                    self.forget(id);
                    if let Some(rollback) = rollback {
                        self.launch_rollback(rollback);
                    }
                    return;
                }
            }
        }

        let snapshot = self.snapshot();
        self.notify(|l| l.step_began(&self.plan, &snapshot, &step));
        began.store(true, Ordering::Release);
        tracing::debug!(plan_id = %self.plan.id(), step_id = %id, resumed, "running step");

        let driver = self.drivers.make_driver(self.plan.id(), id);
        let result = AssertUnwindSafe(step.operation().do_action(&self.registry, driver.as_ref()))
            .catch_unwind()
            .await;
        let outcome = match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(StepFailure::Operation { step: id, source }),
            Err(panic) => Err(StepFailure::Panicked {
                step: id,
                message: panic_message(panic.as_ref()),
            }),
        };

        let next = match outcome {
            Ok(()) => match self.complete_step(id).await {
                Ok(true) => Next::Finished,
                Ok(false) => Next::Nothing,
                Err(failure) => self.rollback_or_nothing(failure, id).await,
            },
            Err(failure) => self.rollback_or_nothing(failure, id).await,
        };

        let ended = self.snapshot();
        self.notify(|l| l.step_ended(&self.plan, &ended, &step));
        self.forget(id);

        match next {
            Next::Nothing => {}
            Next::Finished => self.finish_plan(true),
            Next::Rollback(rollback) => self.launch_rollback(rollback),
        }
    }

    async fn rollback_or_nothing(self: &Arc<Self>, failure: StepFailure, id: StepId) -> Next {
        match self.begin_rollback(failure, Some(id)).await {
            Some(rollback) => Next::Rollback(rollback),
            None => Next::Nothing,
        }
    }

    /// Pending → running; `false` when refused because rollback began
    async fn start_step(&self, id: StepId) -> Result<bool, StepFailure> {
        let _guard = self.transition.lock().await;
        let current = self.snapshot();
        if current.is_rolling_back() {
            return Ok(false);
        }
        let next = current.start_step(id)?;
        self.persist(&next).await?;
        self.publish(next);
        Ok(true)
    }

    /// Running → completed, then dispatch newly ready steps
    ///
    /// Returns whether the plan is now complete. After rollback began the
    /// step stays running so the rollback undoes it.
    async fn complete_step(self: &Arc<Self>, id: StepId) -> Result<bool, StepFailure> {
        let _guard = self.transition.lock().await;
        let current = self.snapshot();
        if current.is_rolling_back() {
            return Ok(false);
        }
        let next = current.finish_step(id)?;
        self.persist(&next).await?;
        let next = self.publish(next);
        self.dispatch_ready(&next);
        Ok(next.is_complete())
    }

    /// Trip the rollback latch
    ///
    /// Returns the rollback work when this call won the latch. The rollback
    /// task is launched separately so the caller's own listeners fire first.
    async fn begin_rollback(
        self: &Arc<Self>,
        failure: StepFailure,
        origin: Option<StepId>,
    ) -> Option<Rollback> {
        let plan_id = self.plan.id();
        if self.rollback_started.swap(true, Ordering::AcqRel) {
            if failure.is_interruption() {
                tracing::warn!(plan_id = %plan_id, "interrupting rollback in progress");
                self.rollback_interrupted.store(true, Ordering::Release);
            } else {
                tracing::warn!(plan_id = %plan_id, error = %failure, "failure during rollback ignored");
            }
            return None;
        }

        if failure.is_interruption() {
            tracing::warn!(plan_id = %plan_id, "plan aborted, rolling back");
        } else {
            tracing::error!(plan_id = %plan_id, error = %failure, "step failed, rolling back");
        }

        let guard = self.transition.lock().await;
        let next = self.snapshot().rollback();
        if let Err(e) = self.persist(&next).await {
            tracing::error!(plan_id = %plan_id, error = %e, "could not persist rollback, marking plan crashed");
            let crashed = next.crash();
            if let Err(e) = self.persist(&crashed).await {
                tracing::error!(plan_id = %plan_id, error = %e, "could not persist crash");
            }
            self.publish(crashed);
            let cancelled = self.cancel_in_flight(origin);
            drop(guard);
            return Some(Rollback {
                order: Vec::new(),
                cancelled,
                crashed: true,
            });
        }
        let next = self.publish(next);
        let cancelled = self.cancel_in_flight(origin);
        drop(guard);
        Some(Rollback {
            order: next.undo_order(),
            cancelled,
            crashed: false,
        })
    }

    /// Abort every dispatched task except `except`
    fn cancel_in_flight(&self, except: Option<StepId>) -> Vec<(StepId, InFlight)> {
        let mut in_flight = self.in_flight.lock();
        in_flight
            .drain()
            .filter(|(id, _)| Some(*id) != except)
            .map(|(id, task)| {
                task.handle.abort();
                (id, task)
            })
            .collect()
    }

    /// Wait until every aborted task has stopped
    ///
    /// A task blocked inside a poll keeps running until it yields, so undo
    /// must not start before this returns. Steps whose forward action was
    /// cut short still get their `step_ended`.
    async fn reap_cancelled(&self, cancelled: Vec<(StepId, InFlight)>) {
        for (id, task) in cancelled {
            match task.handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {
                    if !task.began.load(Ordering::Acquire) {
                        continue;
                    }
                    if let Some(step) = self.plan.step(id) {
                        let status = self.snapshot();
                        self.notify(|l| l.step_ended(&self.plan, &status, step));
                    }
                }
                Err(e) => {
                    tracing::error!(plan_id = %self.plan.id(), step_id = %id, error = %e, "step task failed");
                }
            }
        }
    }

    fn launch_rollback(self: &Arc<Self>, rollback: Rollback) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.run_rollback(rollback).await });
    }

    async fn run_rollback(self: Arc<Self>, rollback: Rollback) {
        let plan_id = self.plan.id();
        let Rollback {
            order,
            cancelled,
            crashed,
        } = rollback;
        self.reap_cancelled(cancelled).await;
        if crashed {
            self.finish_plan(false);
            return;
        }
        tracing::info!(plan_id = %plan_id, steps = order.len(), "rollback started");

        for id in order {
            if self.rollback_interrupted.load(Ordering::Acquire) {
                self.crash("rollback interrupted").await;
                return;
            }
            let Some(step) = self.plan.step(id).cloned() else {
                continue;
            };

            let driver = self.drivers.make_driver(plan_id, id);
            let result = AssertUnwindSafe(step.operation().unravel(&self.registry, driver.as_ref()))
                .catch_unwind()
                .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(plan_id = %plan_id, step_id = %id, error = %format!("{e:#}"), "undo failed");
                    self.crash("undo failed").await;
                    return;
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(plan_id = %plan_id, step_id = %id, panic = %message, "undo panicked");
                    self.crash("undo panicked").await;
                    return;
                }
            }

            if let Err(e) = self.record_undo(id).await {
                tracing::error!(plan_id = %plan_id, step_id = %id, error = %e, "could not record undo");
                self.crash("undo not recorded").await;
                return;
            }
            tracing::debug!(plan_id = %plan_id, step_id = %id, "step rolled back");
        }

        tracing::info!(plan_id = %plan_id, "rollback finished");
        self.finish_plan(false);
    }

    async fn record_undo(&self, id: StepId) -> Result<(), StepFailure> {
        let _guard = self.transition.lock().await;
        let next = self.snapshot().rolled_back_step(id)?;
        self.persist(&next).await?;
        self.publish(next);
        Ok(())
    }

    async fn crash(&self, reason: &str) {
        {
            let _guard = self.transition.lock().await;
            let next = self.snapshot().crash();
            if let Err(e) = self.persist(&next).await {
                tracing::error!(plan_id = %self.plan.id(), error = %e, "could not persist crash");
            }
            self.publish(next);
        }
        tracing::error!(plan_id = %self.plan.id(), reason, "plan crashed");
        self.finish_plan(false);
    }

    fn finish_plan(&self, succeeded: bool) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        let status = self.snapshot();
        tracing::info!(plan_id = %self.plan.id(), succeeded, "plan ended");
        self.notify(|l| l.plan_ended(&self.plan, &status, succeeded));
        self.outcome.send_replace(Some(succeeded));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::OperationCodec;
    use crate::error::StatusError;
    use crate::plan::PlanBuilder;
    use crate::storage::{MemoryStore, StoreStorageDriver};
    use crate::scheduler::SchedulerState;
    use crate::testing::{journal, ScriptedOp};
    use crate::status::StepState;
    use pretty_assertions::assert_eq;

    /// Keeps statuses in memory, refusing the ones matching `refuse`
    struct RefusingStorage {
        refuse: Box<dyn Fn(&PlanStatus) -> bool + Send + Sync>,
        statuses: Mutex<HashMap<PlanId, PlanStatus>>,
    }

    impl RefusingStorage {
        fn new(refuse: impl Fn(&PlanStatus) -> bool + Send + Sync + 'static) -> Self {
            Self {
                refuse: Box::new(refuse),
                statuses: Mutex::new(HashMap::new()),
            }
        }

        fn status(&self, id: PlanId) -> Option<PlanStatus> {
            self.statuses.lock().get(&id).cloned()
        }
    }

    #[async_trait::async_trait]
    impl PlanStorageDriver for RefusingStorage {
        async fn save_status_for_plan(&self, status: &PlanStatus) -> Result<(), StorageError> {
            if (self.refuse)(status) {
                return Err(StorageError::Backend("refused".to_string()));
            }
            self.statuses.lock().insert(status.plan_id(), status.clone());
            Ok(())
        }

        async fn save_plan(&self, _plan: &Plan) -> Result<(), StorageError> {
            Ok(())
        }

        async fn forget_plan(&self, _id: PlanId) -> Result<(), StorageError> {
            Ok(())
        }

        async fn save_scheduler_state(&self, _state: &SchedulerState) -> Result<(), StorageError> {
            Ok(())
        }

        async fn load_scheduler_state(&self) -> Result<Option<SchedulerState>, StorageError> {
            Ok(None)
        }

        async fn load_plans(&self) -> Result<HashMap<PlanId, Plan>, StorageError> {
            Ok(HashMap::new())
        }

        async fn try_load_plan(&self, _id: PlanId) -> Result<Option<Plan>, StorageError> {
            Ok(None)
        }

        async fn try_load_plan_status(&self, id: PlanId) -> Result<Option<PlanStatus>, StorageError> {
            Ok(self.status(id))
        }
    }

    async fn run(plan: Plan) -> (PlanTracker, bool) {
        let tracker = PlanTracker::builder(plan).build().unwrap();
        tracker.resume_execution().await;
        let succeeded = tracker.outcome().await;
        (tracker, succeeded)
    }

    #[tokio::test]
    async fn test_dependencies_run_in_order() {
        let log = journal();
        let mut builder = PlanBuilder::new();
        let a = builder.step(ScriptedOp::new("a", &log).delayed(10));
        let b = builder.step(ScriptedOp::new("b", &log));
        let c = builder.step(ScriptedOp::new("c", &log));
        builder.requires(b, a).unwrap();
        builder.requires(c, b).unwrap();

        let (tracker, succeeded) = run(builder.freeze().unwrap()).await;

        assert!(succeeded);
        assert_eq!(*log.lock(), vec!["do:a", "do:b", "do:c"]);
        assert_eq!(tracker.status().completed(), &[a, b, c]);
    }

    #[tokio::test]
    async fn test_failure_rolls_back_newest_first() {
        let log = journal();
        let mut builder = PlanBuilder::new();
        let a = builder.step(ScriptedOp::new("a", &log));
        let b = builder.step(ScriptedOp::new("b", &log));
        let c = builder.step(ScriptedOp::new("c", &log).failing());
        builder.requires(b, a).unwrap();
        builder.requires(c, b).unwrap();

        let (tracker, succeeded) = run(builder.freeze().unwrap()).await;

        assert!(!succeeded);
        assert_eq!(
            *log.lock(),
            vec!["do:a", "do:b", "do:c", "undo:c", "undo:b", "undo:a"]
        );
        let status = tracker.status();
        assert!(status.is_rolling_back());
        assert!(!status.is_crashed());
        assert_eq!(status.rolled_back(), &[c, b, a]);
        assert!(status.is_complete());
    }

    #[tokio::test]
    async fn test_undo_failure_crashes() {
        let log = journal();
        let mut builder = PlanBuilder::new();
        let a = builder.step(ScriptedOp::new("a", &log));
        let b = builder.step(ScriptedOp::new("b", &log).failing_unravel());
        let c = builder.step(ScriptedOp::new("c", &log).failing());
        builder.requires(b, a).unwrap();
        builder.requires(c, b).unwrap();

        let (tracker, succeeded) = run(builder.freeze().unwrap()).await;

        assert!(!succeeded);
        assert_eq!(*log.lock(), vec!["do:a", "do:b", "do:c", "undo:c", "undo:b"]);
        let status = tracker.status();
        assert!(status.is_crashed());
        assert_eq!(status.rolled_back(), &[c]);
        assert_eq!(status.completed(), &[a, b]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_undo_waits_for_aborted_step_to_stop() {
        let log = journal();
        let mut builder = PlanBuilder::new();
        let slow = builder.step(ScriptedOp::new("slow", &log).blocking(200));
        let bad = builder.step(ScriptedOp::new("bad", &log).delayed(30).failing());

        let (tracker, succeeded) = run(builder.freeze().unwrap()).await;

        assert!(!succeeded);
        let log = log.lock().clone();
        let exit = log.iter().position(|e| e == "exit:slow").unwrap();
        let first_undo = log.iter().position(|e| e.starts_with("undo:")).unwrap();
        assert!(exit < first_undo, "undo ran while do_action was live: {log:?}");
        assert!(!log.contains(&"do:slow".to_string()));
        assert_eq!(tracker.status().state_of(slow), Some(StepState::RolledBack));
        assert_eq!(tracker.status().state_of(bad), Some(StepState::RolledBack));
    }

    #[tokio::test]
    async fn test_rollback_persist_failure_crashes_without_undo() {
        let log = journal();
        let mut builder = PlanBuilder::new();
        let a = builder.step(ScriptedOp::new("a", &log));
        let b = builder.step(ScriptedOp::new("b", &log).failing());
        builder.requires(b, a).unwrap();
        let plan = builder.freeze().unwrap();
        let id = plan.id();

        let storage = Arc::new(RefusingStorage::new(|s| s.is_rolling_back() && !s.is_crashed()));
        let tracker = PlanTracker::builder(plan)
            .with_storage(storage.clone())
            .build()
            .unwrap();
        tracker.resume_execution().await;

        assert!(!tracker.outcome().await);
        assert_eq!(*log.lock(), vec!["do:a", "do:b"]);
        let stored = storage.status(id).unwrap();
        assert!(stored.is_crashed());
        assert!(stored.is_rolling_back());
        assert_eq!(&stored, tracker.status().as_ref());
    }

    #[tokio::test]
    async fn test_empty_plan_succeeds_immediately() {
        let (tracker, succeeded) = run(PlanBuilder::new().freeze().unwrap()).await;
        assert!(succeeded);
        assert!(tracker.is_complete());
    }

    #[tokio::test]
    async fn test_abort_before_start_rolls_back_nothing() {
        let log = journal();
        let mut builder = PlanBuilder::new();
        builder.step(ScriptedOp::new("a", &log));
        let tracker = PlanTracker::builder(builder.freeze().unwrap()).build().unwrap();

        tracker.abort().await;
        assert!(!tracker.outcome().await);
        tracker.resume_execution().await;

        assert!(log.lock().is_empty());
        assert!(tracker.status().is_rolling_back());
    }

    #[tokio::test]
    async fn test_status_for_other_plan_rejected() {
        let plan = PlanBuilder::new().freeze().unwrap();
        let other = PlanBuilder::new().freeze().unwrap();
        let err = PlanTracker::builder(plan)
            .with_status(PlanStatus::new(&other))
            .build()
            .unwrap_err();
        assert!(matches!(err, StatusError::PlanMismatch { .. }));
    }

    #[tokio::test]
    async fn test_transitions_are_persisted() {
        let log = journal();
        let mut builder = PlanBuilder::new();
        let a = builder.step(ScriptedOp::new("a", &log));
        let plan = builder.freeze().unwrap();
        let id = plan.id();

        let storage = Arc::new(StoreStorageDriver::new(
            Arc::new(MemoryStore::new()),
            OperationCodec::new(),
        ));
        let tracker = PlanTracker::builder(plan)
            .with_storage(storage.clone())
            .build()
            .unwrap();
        tracker.resume_execution().await;
        assert!(tracker.outcome().await);

        let stored = storage.try_load_plan_status(id).await.unwrap().unwrap();
        assert_eq!(stored.completed(), &[a]);
        assert_eq!(&stored, tracker.status().as_ref());
    }
}
