//! Admission bookkeeping
//!
//! `SchedulerState` holds one FIFO queue of plan IDs per resource name plus
//! the set of plans currently admitted. It is a plain value: the executor
//! owns the only live copy inside its coordinator and persists a clone after
//! every admission.
//!
//! # Admission rule
//!
//! A plan runs only when it is simultaneously at the head of the queue of
//! every resource it affects. Admission is all-or-nothing, so a plan never
//! holds some of its resources while waiting for the rest, and two plans
//! sharing a resource can never wait on each other.

use crate::ids::PlanId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Per-resource admission queues and the running set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerState {
    queues: BTreeMap<String, VecDeque<PlanId>>,
    running: BTreeSet<PlanId>,
}

impl SchedulerState {
    /// Empty state
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from raw parts, dropping empty queues
    pub fn from_parts(
        queues: BTreeMap<String, VecDeque<PlanId>>,
        running: BTreeSet<PlanId>,
    ) -> Self {
        let queues = queues.into_iter().filter(|(_, q)| !q.is_empty()).collect();
        Self { queues, running }
    }

    /// Queues by resource name
    #[inline]
    #[must_use]
    pub fn queues(&self) -> &BTreeMap<String, VecDeque<PlanId>> {
        &self.queues
    }

    /// Admitted plans
    #[inline]
    #[must_use]
    pub fn running(&self) -> &BTreeSet<PlanId> {
        &self.running
    }

    /// Plan at the head of a resource's queue
    pub fn head(&self, resource: &str) -> Option<PlanId> {
        self.queues.get(resource).and_then(|q| q.front().copied())
    }

    /// Whether a plan is admitted
    pub fn is_running(&self, plan: PlanId) -> bool {
        self.running.contains(&plan)
    }

    /// Whether a plan waits in (or heads) any queue
    pub fn is_queued(&self, plan: PlanId) -> bool {
        self.queues.values().any(|q| q.contains(&plan))
    }

    /// Every plan that appears in at least one queue
    pub fn queued_plans(&self) -> BTreeSet<PlanId> {
        self.queues.values().flatten().copied().collect()
    }

    /// Append a plan to the tail of each resource's queue
    pub fn enqueue<'a, I>(&mut self, plan: PlanId, resources: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for resource in resources {
            let queue = self.queues.entry(resource.clone()).or_default();
            tracing::debug!(plan_id = %plan, resource = %resource, depth = queue.len(), "enqueued plan");
            queue.push_back(plan);
        }
    }

    /// Mark a plan as admitted
    pub fn mark_running(&mut self, plan: PlanId) {
        self.running.insert(plan);
    }

    /// Drop completed plans from the head of every queue
    ///
    /// Returns the plans that are no longer referenced anywhere: popped from
    /// their last queue, or running without any queue, and complete. They are
    /// also removed from the running set.
    pub fn prune<F>(&mut self, is_complete: F) -> Vec<PlanId>
    where
        F: Fn(PlanId) -> bool,
    {
        let mut popped = BTreeSet::new();
        for queue in self.queues.values_mut() {
            while let Some(&head) = queue.front() {
                if !is_complete(head) {
                    break;
                }
                queue.pop_front();
                popped.insert(head);
            }
        }
        self.queues.retain(|_, q| !q.is_empty());

        let unqueued_running: Vec<PlanId> = self
            .running
            .iter()
            .copied()
            .filter(|id| !popped.contains(id) && is_complete(*id))
            .collect();
        popped.extend(unqueued_running);

        let evicted: Vec<PlanId> = popped
            .into_iter()
            .filter(|id| !self.is_queued(*id))
            .collect();
        for id in &evicted {
            self.running.remove(id);
        }
        evicted
    }

    /// Queue heads that may be admitted now
    ///
    /// `footprint` returns the resource names a plan affects, or `None` for
    /// plans the caller no longer knows about (those are never admitted).
    pub fn ready_plans<F>(&self, footprint: F) -> Vec<PlanId>
    where
        F: Fn(PlanId) -> Option<BTreeSet<String>>,
    {
        let candidates: BTreeSet<PlanId> = self
            .queues
            .values()
            .filter_map(|q| q.front().copied())
            .filter(|id| !self.running.contains(id))
            .collect();

        candidates
            .into_iter()
            .filter(|&id| {
                footprint(id).is_some_and(|resources| {
                    resources.iter().all(|r| self.head(r) == Some(id))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_enqueue_is_fifo_per_resource() {
        let mut state = SchedulerState::new();
        let p1 = PlanId::new();
        let p2 = PlanId::new();
        state.enqueue(p1, &names(&["A", "B"]));
        state.enqueue(p2, &names(&["A"]));

        assert_eq!(state.head("A"), Some(p1));
        assert_eq!(state.head("B"), Some(p1));
        assert_eq!(state.queues()["A"].len(), 2);
        assert!(state.is_queued(p2));
    }

    #[test]
    fn test_ready_requires_head_of_every_queue() {
        // p1: A,B  p2: A,C  p3: B,C
        let (p1, p2, p3) = (PlanId::new(), PlanId::new(), PlanId::new());
        let footprints: HashMap<PlanId, BTreeSet<String>> = [
            (p1, names(&["A", "B"])),
            (p2, names(&["A", "C"])),
            (p3, names(&["B", "C"])),
        ]
        .into_iter()
        .collect();

        let mut state = SchedulerState::new();
        for id in [p1, p2, p3] {
            state.enqueue(id, &footprints[&id]);
        }

        // p2 heads C but not A; p1 heads both A and B
        let ready = state.ready_plans(|id| footprints.get(&id).cloned());
        assert_eq!(ready, vec![p1]);

        state.mark_running(p1);
        assert!(state.ready_plans(|id| footprints.get(&id).cloned()).is_empty());
    }

    #[test]
    fn test_prune_pops_completed_heads_and_evicts() {
        let (p1, p2) = (PlanId::new(), PlanId::new());
        let mut state = SchedulerState::new();
        state.enqueue(p1, &names(&["A", "B"]));
        state.enqueue(p2, &names(&["B"]));
        state.mark_running(p1);

        let evicted = state.prune(|id| id == p1);
        assert_eq!(evicted, vec![p1]);
        assert!(!state.is_running(p1));
        assert_eq!(state.head("B"), Some(p2));
        assert!(!state.queues().contains_key("A"));
    }

    #[test]
    fn test_prune_keeps_incomplete_heads() {
        let (p1, p2) = (PlanId::new(), PlanId::new());
        let mut state = SchedulerState::new();
        state.enqueue(p1, &names(&["A"]));
        state.enqueue(p2, &names(&["A"]));

        // p2 is complete but stuck behind p1
        assert!(state.prune(|id| id == p2).is_empty());
        assert_eq!(state.queues()["A"].len(), 2);
    }

    #[test]
    fn test_unknown_plans_are_never_ready() {
        let p1 = PlanId::new();
        let mut state = SchedulerState::new();
        state.enqueue(p1, &names(&["A"]));
        assert!(state.ready_plans(|_| None).is_empty());
    }

    #[test]
    fn test_from_parts_drops_empty_queues() {
        let mut queues = BTreeMap::new();
        queues.insert("A".to_string(), VecDeque::new());
        let state = SchedulerState::from_parts(queues, BTreeSet::new());
        assert!(state.queues().is_empty());
    }
}
