//! Plans and steps
//!
//! A plan is built through a [`PlanBuilder`] and frozen into an immutable
//! [`Plan`]. Freezing consumes the builder, so a frozen plan has no mutating
//! API at all.

pub mod builder;

pub use builder::PlanBuilder;

use crate::ids::{PlanId, StepId};
use crate::operation::Operation;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// One operation with identity inside a plan
///
/// Dependency edges live on the owning [`Plan`], not on the step.
#[derive(Clone)]
pub struct Step {
    id: StepId,
    plan_id: PlanId,
    operation: Arc<dyn Operation>,
}

impl Step {
    pub(crate) fn new(id: StepId, plan_id: PlanId, operation: Arc<dyn Operation>) -> Self {
        Self {
            id,
            plan_id,
            operation,
        }
    }

    /// Step ID
    #[inline]
    #[must_use]
    pub fn id(&self) -> StepId {
        self.id
    }

    /// Owning plan
    #[inline]
    #[must_use]
    pub fn plan_id(&self) -> PlanId {
        self.plan_id
    }

    /// The step's operation
    #[inline]
    #[must_use]
    pub fn operation(&self) -> &Arc<dyn Operation> {
        &self.operation
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("plan_id", &self.plan_id)
            .field("kind", &self.operation.kind())
            .finish()
    }
}

/// A frozen, dependency-ordered set of steps
///
/// Can only be produced by [`PlanBuilder::freeze`] (or by decoding a stored
/// plan, which goes through the same validation).
#[derive(Debug, Clone)]
pub struct Plan {
    pub(crate) id: PlanId,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) steps: Vec<Step>,
    pub(crate) index: HashMap<StepId, usize>,
    pub(crate) prerequisites: HashMap<StepId, Vec<StepId>>,
}

impl Plan {
    /// Plan ID
    #[inline]
    #[must_use]
    pub fn id(&self) -> PlanId {
        self.id
    }

    /// When the plan was built
    #[inline]
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Steps in insertion order
    #[inline]
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Look up a step
    pub fn step(&self, id: StepId) -> Option<&Step> {
        self.index.get(&id).map(|&i| &self.steps[i])
    }

    /// Step IDs in insertion order
    pub fn step_ids(&self) -> impl Iterator<Item = StepId> + '_ {
        self.steps.iter().map(Step::id)
    }

    /// Number of steps
    #[inline]
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Steps that must complete before `id` may start
    pub fn prerequisites(&self, id: StepId) -> &[StepId] {
        self.prerequisites.get(&id).map_or(&[], Vec::as_slice)
    }

    /// Union of every operation's declared resource names
    pub fn affected_task_names(&self) -> BTreeSet<String> {
        self.steps
            .iter()
            .flat_map(|step| step.operation.locked_tasks())
            .collect()
    }
}
