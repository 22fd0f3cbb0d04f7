//! Plan lifecycle observers
//!
//! Callbacks fire on tracker tasks after the triggering transition has been
//! committed, always with a complete snapshot. They must return quickly and
//! must not call back into the tracker or executor synchronously; spawn a
//! task for anything heavier.

use crate::plan::{Plan, Step};
use crate::status::PlanStatus;
use std::sync::Arc;

/// Observer of one plan's lifecycle
pub trait PlanListener: Send + Sync {
    /// The tracker began (or resumed) execution
    fn plan_started(&self, _plan: &Plan, _status: &PlanStatus) {}

    /// A step is about to run its forward action
    fn step_began(&self, _plan: &Plan, _status: &PlanStatus, _step: &Step) {}

    /// A step's forward action returned
    fn step_ended(&self, _plan: &Plan, _status: &PlanStatus, _step: &Step) {}

    /// The plan reached a terminal state; fires once per tracker
    fn plan_ended(&self, _plan: &Plan, _status: &PlanStatus, _succeeded: bool) {}
}

/// Shared listener handle
pub type SharedListener = Arc<dyn PlanListener>;

/// Emits one tracing event per callback
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingListener;

impl PlanListener for LoggingListener {
    fn plan_started(&self, plan: &Plan, status: &PlanStatus) {
        tracing::info!(
            plan_id = %plan.id(),
            pending = status.pending().len(),
            running = status.running().len(),
            "plan started"
        );
    }

    fn step_began(&self, plan: &Plan, _status: &PlanStatus, step: &Step) {
        tracing::debug!(plan_id = %plan.id(), step_id = %step.id(), kind = step.operation().kind(), "step began");
    }

    fn step_ended(&self, plan: &Plan, status: &PlanStatus, step: &Step) {
        tracing::debug!(
            plan_id = %plan.id(),
            step_id = %step.id(),
            state = ?status.state_of(step.id()),
            "step ended"
        );
    }

    fn plan_ended(&self, plan: &Plan, status: &PlanStatus, succeeded: bool) {
        if succeeded {
            tracing::info!(plan_id = %plan.id(), steps = status.completed().len(), "plan succeeded");
        } else {
            tracing::warn!(
                plan_id = %plan.id(),
                rolled_back = status.rolled_back().len(),
                crashed = status.is_crashed(),
                "plan failed"
            );
        }
    }
}
