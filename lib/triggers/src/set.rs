//! The per-listener-kind trigger index: `OwnerId -> WorkflowId -> [Trigger]`.
//!
//! A [`TriggerSet`] answers "is this firing relevant?" for one trigger kind
//! and is rebuilt whenever the deployed workflow set changes. It holds only
//! the *active* triggers of its kind — a workflow with `Active = false`
//! contributes nothing regardless of its triggers' own active flags, and a
//! trigger whose own active flag is false is likewise excluded even while its
//! workflow is active.

use std::collections::HashMap;
use std::sync::RwLock;

use flowcore_core::{OwnerId, WorkflowId};

use crate::trigger::Trigger;

/// One workflow's contribution to a trigger set: its id, owner, whether the
/// workflow itself is active, and every trigger of this set's kind it
/// declares (regardless of each trigger's own active flag — filtering is the
/// set's job, not the caller's).
#[derive(Debug)]
pub struct TriggerSource {
    /// The owning principal.
    pub owner_id: OwnerId,
    /// The workflow this source describes.
    pub workflow_id: WorkflowId,
    /// Whether the workflow itself is active.
    pub workflow_active: bool,
    /// Every trigger of this set's kind declared by the workflow, in
    /// declaration order, unfiltered by the trigger's own active flag.
    pub triggers: Vec<Box<dyn Trigger>>,
}

impl TriggerSource {
    /// The triggers that would actually be installed into a set: non-empty
    /// only when the workflow itself is active, and further filtered down to
    /// triggers whose own active flag is set.
    fn effective_active_triggers(&self) -> Vec<Box<dyn Trigger>> {
        if !self.workflow_active {
            return Vec::new();
        }
        self.triggers
            .iter()
            .filter(|t| t.active())
            .map(|t| t.clone_box())
            .collect()
    }
}

type Bucket = HashMap<WorkflowId, Vec<Box<dyn Trigger>>>;

/// An in-memory index of the active triggers of one kind, keyed by owner
/// then workflow.
#[derive(Default)]
pub struct TriggerSet {
    index: RwLock<HashMap<OwnerId, Bucket>>,
}

impl TriggerSet {
    /// An empty trigger set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            index: RwLock::new(HashMap::new()),
        }
    }

    /// For each source, replaces the `(OwnerId, WorkflowId)` bucket with its
    /// currently-active triggers of this kind, or removes the entry (pruning
    /// an owner bucket left empty) if there are none.
    pub fn add<'a>(&self, sources: impl IntoIterator<Item = &'a TriggerSource>) {
        let mut index = self.index.write().expect("trigger set lock poisoned");
        for source in sources {
            let active = source.effective_active_triggers();
            let owner_bucket = index.entry(source.owner_id.clone()).or_default();
            if active.is_empty() {
                owner_bucket.remove(&source.workflow_id);
            } else {
                owner_bucket.insert(source.workflow_id.clone(), active);
            }
            if owner_bucket.is_empty() {
                index.remove(&source.owner_id);
            }
        }
    }

    /// True iff the set's bucket for `source`'s owner/workflow holds exactly
    /// the ids of `source`'s currently-active triggers of this kind, in order.
    #[must_use]
    pub fn exists(&self, source: &TriggerSource) -> bool {
        let expected = source.effective_active_triggers();
        let index = self.index.read().expect("trigger set lock poisoned");
        let stored = index
            .get(&source.owner_id)
            .and_then(|bucket| bucket.get(&source.workflow_id));
        match stored {
            None => expected.is_empty(),
            Some(stored) => {
                stored.len() == expected.len()
                    && stored
                        .iter()
                        .zip(expected.iter())
                        .all(|(a, b)| a.id() == b.id())
            }
        }
    }

    /// A read-only snapshot of the full index. Callers must not mutate the
    /// returned triggers; `clone_box` each one if an owned copy is needed.
    #[must_use]
    pub fn active(&self) -> HashMap<OwnerId, Bucket> {
        let index = self.index.read().expect("trigger set lock poisoned");
        index
            .iter()
            .map(|(owner, bucket)| {
                (
                    owner.clone(),
                    bucket
                        .iter()
                        .map(|(wf, triggers)| {
                            (wf.clone(), triggers.iter().map(|t| t.clone_box()).collect())
                        })
                        .collect(),
                )
            })
            .collect()
    }

    /// Advances every indexed trigger that is due at `now` in place (mutating
    /// the stored copy, not a snapshot), returning the `(OwnerId, WorkflowId,
    /// TriggerId)` of each one fired. Used by the cron listener's tick;
    /// manual triggers are never due, so calling this from elsewhere is
    /// harmless.
    ///
    /// Iteration order follows this set's internal map order, which (like
    /// the source system's own map ranges) carries no cross-run guarantee.
    pub fn advance_due(&self, now: chrono::DateTime<chrono::Utc>) -> Vec<(OwnerId, WorkflowId, flowcore_core::TriggerId)> {
        let mut index = self.index.write().expect("trigger set lock poisoned");
        let mut fired = Vec::new();
        for (owner, bucket) in index.iter_mut() {
            for (workflow, triggers) in bucket.iter_mut() {
                for trigger in triggers.iter_mut() {
                    if trigger.is_due(now) {
                        fired.push((owner.clone(), workflow.clone(), trigger.id()));
                        trigger.advance(now);
                    }
                }
            }
        }
        fired
    }

    /// Total number of triggers currently indexed, across all owners and workflows.
    #[must_use]
    pub fn len(&self) -> usize {
        let index = self.index.read().expect("trigger set lock poisoned");
        index.values().map(|bucket| bucket.values().map(Vec::len).sum::<usize>()).sum()
    }

    /// True if the index holds no triggers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::ManualTrigger;

    fn source(owner: &str, workflow_active: bool, trigger_active: bool) -> TriggerSource {
        let mut trigger = ManualTrigger::new();
        trigger.set_active(trigger_active);
        TriggerSource {
            owner_id: OwnerId::new(owner),
            workflow_id: WorkflowId::new(),
            workflow_active,
            triggers: vec![Box::new(trigger)],
        }
    }

    #[test]
    fn add_installs_active_triggers() {
        let set = TriggerSet::new();
        let src = source("alice", true, true);
        set.add([&src]);
        assert_eq!(set.len(), 1);
        assert!(set.exists(&src));
    }

    #[test]
    fn inactive_workflow_contributes_nothing() {
        let set = TriggerSet::new();
        let src = source("alice", false, true);
        set.add([&src]);
        assert!(set.is_empty());
    }

    #[test]
    fn inactive_trigger_excluded_even_if_workflow_active() {
        let set = TriggerSet::new();
        let src = source("alice", true, false);
        set.add([&src]);
        assert!(set.is_empty());
    }

    #[test]
    fn empty_result_prunes_existing_entry_and_owner_bucket() {
        let set = TriggerSet::new();
        let mut src = source("alice", true, true);
        set.add([&src]);
        assert_eq!(set.len(), 1);

        src.triggers.clear();
        set.add([&src]);
        assert!(set.is_empty());
    }

    #[test]
    fn exists_false_when_not_present() {
        let set = TriggerSet::new();
        let src = source("alice", true, true);
        assert!(!set.exists(&src));
    }

    #[test]
    fn advance_due_fires_and_mutates_stored_cron_trigger() {
        use crate::schedule::Periodicity;
        use crate::trigger::CronTrigger;
        use chrono::Utc;

        let now = Utc::now();
        let periodicity = Periodicity::parse("R/PT1H").unwrap();
        let mut trigger = CronTrigger::new(periodicity, now - chrono::Duration::hours(2));
        trigger.set_active(true);
        let src = TriggerSource {
            owner_id: OwnerId::new("alice"),
            workflow_id: WorkflowId::new(),
            workflow_active: true,
            triggers: vec![Box::new(trigger)],
        };

        let set = TriggerSet::new();
        set.add([&src]);

        let fired = set.advance_due(now);
        assert_eq!(fired.len(), 1);
        // second call right after should find nothing due, since advance() moved
        // nextRunStart an hour past `now`.
        assert!(set.advance_due(now).is_empty());
    }
}
