use std::collections::HashMap;

use uuid::Uuid;

use crate::events::JobUpdate;
use crate::jobs::{Job, JobStatus};

/// Minimal description of one store mutation, so the UI adapter can
/// reconcile incrementally instead of re-rendering the whole list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreDelta {
    pub added: Vec<Uuid>,
    pub updated: Vec<Uuid>,
    pub removed: Vec<Uuid>,
}

impl StoreDelta {
    fn added(id: Uuid) -> Self {
        StoreDelta {
            added: vec![id],
            ..StoreDelta::default()
        }
    }

    fn updated(id: Uuid) -> Self {
        StoreDelta {
            updated: vec![id],
            ..StoreDelta::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Ordered in-memory job table. Insertion order is the user-visible list
/// order. Mutated only by the controller task; everyone else gets snapshots.
#[derive(Debug, Default)]
pub struct JobStore {
    order: Vec<Uuid>,
    jobs: HashMap<Uuid, Job>,
}

impl JobStore {
    pub fn insert(&mut self, job: Job) -> StoreDelta {
        let id = job.id;
        if self.jobs.insert(id, job).is_none() {
            self.order.push(id);
        }
        StoreDelta::added(id)
    }

    /// Applies a field update. Terminal jobs are frozen; updates against them
    /// (or unknown ids) return `None`.
    pub fn apply(&mut self, id: Uuid, update: &JobUpdate) -> Option<StoreDelta> {
        let job = self.jobs.get_mut(&id)?;
        if job.status.is_terminal() {
            return None;
        }
        match update {
            JobUpdate::Title(title) => job.title = title.clone(),
            JobUpdate::Status(status) => job.status = status.clone(),
            JobUpdate::Progress(progress) => job.progress = progress.clone(),
        }
        Some(StoreDelta::updated(id))
    }

    /// Records a terminal transition. A completed job always reads 100%.
    pub fn finish(&mut self, id: Uuid, status: JobStatus) -> Option<StoreDelta> {
        let job = self.jobs.get_mut(&id)?;
        if job.status.is_terminal() {
            return None;
        }
        if status == JobStatus::Completed {
            job.progress = "100.0%".to_string();
        }
        job.status = status;
        Some(StoreDelta::updated(id))
    }

    pub fn remove_many(&mut self, ids: &[Uuid]) -> StoreDelta {
        let mut removed = Vec::new();
        for id in ids {
            if self.jobs.remove(id).is_some() {
                removed.push(*id);
            }
        }
        self.order.retain(|id| self.jobs.contains_key(id));
        StoreDelta {
            removed,
            ..StoreDelta::default()
        }
    }

    pub fn get(&self, id: Uuid) -> Option<&Job> {
        self.jobs.get(&id)
    }

    /// Defensive copy in display order.
    pub fn snapshot(&self) -> Vec<Job> {
        self.order
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .cloned()
            .collect()
    }

    pub fn ids_where(&self, predicate: impl Fn(&Job) -> bool) -> Vec<Uuid> {
        self.order
            .iter()
            .filter(|id| self.jobs.get(id).map(&predicate).unwrap_or(false))
            .copied()
            .collect()
    }

    pub fn has_non_terminal(&self) -> bool {
        self.jobs.values().any(|job| !job.status.is_terminal())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
