//! Plan progress snapshots
//!
//! `PlanStatus` is an immutable value. Every transition returns a new
//! snapshot and leaves the receiver untouched, so a reader holding an
//! `Arc<PlanStatus>` never observes a half-applied change.
//!
//! Per-step states:
//!
//! ```text
//! Pending -> Running -> Completed
//!               |           |
//!               +-----+-----+
//!                     v
//!                 RolledBack
//! ```

use crate::error::StatusError;
use crate::ids::{PlanId, StepId};
use crate::plan::Plan;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// State of a single step within a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    /// Not started yet
    Pending,
    /// Started, not finished
    Running,
    /// Finished successfully
    Completed,
    /// Undone during rollback
    RolledBack,
}

/// Immutable progress snapshot of one plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStatus {
    plan_id: PlanId,
    pending: BTreeSet<StepId>,
    running: BTreeSet<StepId>,
    completed: Vec<StepId>,
    rolled_back: Vec<StepId>,
    rolling_back: bool,
    crashed: bool,
}

impl PlanStatus {
    /// Fresh status with every step pending
    pub fn new(plan: &Plan) -> Self {
        Self {
            plan_id: plan.id(),
            pending: plan.step_ids().collect(),
            running: BTreeSet::new(),
            completed: Vec::new(),
            rolled_back: Vec::new(),
            rolling_back: false,
            crashed: false,
        }
    }

    /// Owning plan
    #[inline]
    #[must_use]
    pub fn plan_id(&self) -> PlanId {
        self.plan_id
    }

    /// Steps not started yet
    #[inline]
    #[must_use]
    pub fn pending(&self) -> &BTreeSet<StepId> {
        &self.pending
    }

    /// Steps currently running
    #[inline]
    #[must_use]
    pub fn running(&self) -> &BTreeSet<StepId> {
        &self.running
    }

    /// Completed steps, in completion order
    #[inline]
    #[must_use]
    pub fn completed(&self) -> &[StepId] {
        &self.completed
    }

    /// Undone steps, in undo order
    #[inline]
    #[must_use]
    pub fn rolled_back(&self) -> &[StepId] {
        &self.rolled_back
    }

    /// Whether rollback has begun
    #[inline]
    #[must_use]
    pub fn is_rolling_back(&self) -> bool {
        self.rolling_back
    }

    /// Whether an undo failed
    #[inline]
    #[must_use]
    pub fn is_crashed(&self) -> bool {
        self.crashed
    }

    /// State of one step, `None` if it is not part of the plan
    pub fn state_of(&self, id: StepId) -> Option<StepState> {
        if self.pending.contains(&id) {
            Some(StepState::Pending)
        } else if self.running.contains(&id) {
            Some(StepState::Running)
        } else if self.completed.contains(&id) {
            Some(StepState::Completed)
        } else if self.rolled_back.contains(&id) {
            Some(StepState::RolledBack)
        } else {
            None
        }
    }

    /// Pending → running
    pub fn start_step(&self, id: StepId) -> Result<Self, StatusError> {
        if !self.pending.contains(&id) {
            return Err(StatusError::NotPending(id));
        }
        let mut next = self.clone();
        next.pending.remove(&id);
        next.running.insert(id);
        Ok(next)
    }

    /// Running → completed
    pub fn finish_step(&self, id: StepId) -> Result<Self, StatusError> {
        if !self.running.contains(&id) {
            return Err(StatusError::NotRunning(id));
        }
        let mut next = self.clone();
        next.running.remove(&id);
        next.completed.push(id);
        Ok(next)
    }

    /// Running or completed → rolled back
    pub fn rolled_back_step(&self, id: StepId) -> Result<Self, StatusError> {
        let mut next = self.clone();
        if next.running.remove(&id) {
            next.rolled_back.push(id);
            return Ok(next);
        }
        match next.completed.iter().position(|s| *s == id) {
            Some(pos) => {
                next.completed.remove(pos);
                next.rolled_back.push(id);
                Ok(next)
            }
            None => Err(StatusError::NotUndoable(id)),
        }
    }

    /// Mark the plan as rolling back
    #[must_use]
    pub fn rollback(&self) -> Self {
        Self {
            rolling_back: true,
            ..self.clone()
        }
    }

    /// Mark the plan as crashed
    #[must_use]
    pub fn crash(&self) -> Self {
        Self {
            crashed: true,
            ..self.clone()
        }
    }

    /// Steps to undo: every running step, then completed steps newest first
    pub fn undo_order(&self) -> Vec<StepId> {
        self.running
            .iter()
            .copied()
            .chain(self.completed.iter().rev().copied())
            .collect()
    }

    /// Whether the plan has reached a terminal state
    ///
    /// A rolling-back plan is only complete once nothing is left to undo.
    pub fn is_complete(&self) -> bool {
        if self.crashed {
            return true;
        }
        if self.rolling_back {
            self.running.is_empty() && self.completed.is_empty()
        } else {
            self.pending.is_empty() && self.running.is_empty()
        }
    }

    /// Complete without rollback or crash
    pub fn succeeded(&self) -> bool {
        self.is_complete() && !self.rolling_back && !self.crashed
    }
}
