//! Plan Builder
//!
//! The only mutable form of a plan. Steps and dependency edges are added
//! here; `freeze` validates the graph and hands back an immutable [`Plan`].

use crate::error::PlanError;
use crate::ids::{PlanId, StepId};
use crate::operation::Operation;
use crate::plan::{Plan, Step};
use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Builder for frozen plans
///
/// Usage:
/// ```rust,ignore
/// let mut builder = PlanBuilder::new();
/// let launch = builder.step(LaunchOp::new("pod-0"));
/// let verify = builder.step(VerifyOp::new("pod-0"));
/// builder.requires(verify, launch)?;
/// let plan: Plan = builder.freeze()?;
/// ```
#[derive(Debug)]
pub struct PlanBuilder {
    id: PlanId,
    created_at: DateTime<Utc>,
    steps: Vec<Step>,
    index: HashMap<StepId, usize>,
    prerequisites: HashMap<StepId, Vec<StepId>>,
}

impl PlanBuilder {
    /// Start a new plan
    #[must_use]
    pub fn new() -> Self {
        Self::with_identity(PlanId::new(), Utc::now())
    }

    pub(crate) fn with_identity(id: PlanId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at,
            steps: Vec::new(),
            index: HashMap::new(),
            prerequisites: HashMap::new(),
        }
    }

    /// ID the frozen plan will carry
    #[inline]
    #[must_use]
    pub fn id(&self) -> PlanId {
        self.id
    }

    /// Number of steps added so far
    #[inline]
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Add a step running `operation`
    ///
    /// Returns the step ID for use with [`requires`](Self::requires).
    pub fn step(&mut self, operation: impl Operation) -> StepId {
        self.step_arc(Arc::new(operation))
    }

    /// Add a step running a shared operation
    pub fn step_arc(&mut self, operation: Arc<dyn Operation>) -> StepId {
        let id = StepId::new();
        self.insert_step(id, operation);
        id
    }

    pub(crate) fn insert_step(&mut self, id: StepId, operation: Arc<dyn Operation>) {
        self.index.insert(id, self.steps.len());
        self.steps.push(Step::new(id, self.id, operation));
    }

    /// Record that `step` may only start once `prerequisite` has completed
    ///
    /// Repeating an existing edge is a no-op.
    pub fn requires(&mut self, step: StepId, prerequisite: StepId) -> Result<(), PlanError> {
        if !self.index.contains_key(&step) {
            return Err(PlanError::UnknownStep(step));
        }
        if !self.index.contains_key(&prerequisite) {
            return Err(PlanError::UnknownStep(prerequisite));
        }
        if step == prerequisite {
            return Err(PlanError::SelfDependency(step));
        }

        let prereqs = self.prerequisites.entry(step).or_default();
        if !prereqs.contains(&prerequisite) {
            prereqs.push(prerequisite);
        }
        Ok(())
    }

    /// Freeze the plan
    ///
    /// Rejects dependency cycles. Once frozen, the plan cannot be modified.
    pub fn freeze(self) -> Result<Plan, PlanError> {
        let mut graph: DiGraphMap<StepId, ()> = DiGraphMap::new();
        for step in &self.steps {
            graph.add_node(step.id());
        }
        for (step, prereqs) in &self.prerequisites {
            for prereq in prereqs {
                graph.add_edge(*prereq, *step, ());
            }
        }
        if let Err(cycle) = toposort(&graph, None) {
            return Err(PlanError::CycleDetected(cycle.node_id()));
        }

        Ok(Plan {
            id: self.id,
            created_at: self.created_at,
            steps: self.steps,
            index: self.index,
            prerequisites: self.prerequisites,
        })
    }
}

impl Default for PlanBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::NoopOp;

    #[test]
    fn test_builder_creates_steps() {
        let mut builder = PlanBuilder::new();
        let a = builder.step(NoopOp::locking(["A"]));
        let b = builder.step(NoopOp::locking(["B"]));

        assert_ne!(a, b);
        assert_eq!(builder.step_count(), 2);

        let plan_id = builder.id();
        let plan = builder.freeze().unwrap();
        assert_eq!(plan.id(), plan_id);
        assert_eq!(plan.step_ids().collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(plan.step(a).unwrap().plan_id(), plan_id);
    }

    #[test]
    fn test_requires_records_prerequisite() {
        let mut builder = PlanBuilder::new();
        let a = builder.step(NoopOp::default());
        let b = builder.step(NoopOp::default());
        builder.requires(b, a).unwrap();
        builder.requires(b, a).unwrap();

        let plan = builder.freeze().unwrap();
        assert_eq!(plan.prerequisites(b), &[a]);
        assert!(plan.prerequisites(a).is_empty());
    }

    #[test]
    fn test_requires_rejects_unknown_and_self() {
        let mut builder = PlanBuilder::new();
        let a = builder.step(NoopOp::default());
        let stranger = StepId::new();

        assert_eq!(builder.requires(a, stranger), Err(PlanError::UnknownStep(stranger)));
        assert_eq!(builder.requires(stranger, a), Err(PlanError::UnknownStep(stranger)));
        assert_eq!(builder.requires(a, a), Err(PlanError::SelfDependency(a)));
    }

    #[test]
    fn test_freeze_rejects_cycle() {
        let mut builder = PlanBuilder::new();
        let a = builder.step(NoopOp::default());
        let b = builder.step(NoopOp::default());
        let c = builder.step(NoopOp::default());
        builder.requires(b, a).unwrap();
        builder.requires(c, b).unwrap();
        builder.requires(a, c).unwrap();

        assert!(matches!(builder.freeze(), Err(PlanError::CycleDetected(_))));
    }

    #[test]
    fn test_affected_task_names_is_union() {
        let mut builder = PlanBuilder::new();
        builder.step(NoopOp::locking(["pod-0", "pod-1"]));
        builder.step(NoopOp::locking(["pod-1", "pod-2"]));
        let plan = builder.freeze().unwrap();

        let names: Vec<String> = plan.affected_task_names().into_iter().collect();
        assert_eq!(names, vec!["pod-0", "pod-1", "pod-2"]);
    }

    #[test]
    fn test_empty_plan_freezes() {
        let plan = PlanBuilder::new().freeze().unwrap();
        assert_eq!(plan.step_count(), 0);
        assert!(plan.affected_task_names().is_empty());
    }
}
