//! Per-pass change summary
//!
//! The only shared mutable state in a pass. Concurrent node-pool tasks append
//! here; the orchestrator snapshots it into the report.

use std::fmt;
use std::sync::Mutex;

use serde::Serialize;

use crate::tags::ResourceKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Change {
    Created,
    Updated,
    Deleted,
    Unchanged,
    Failed,
}

impl Change {
    pub fn as_str(&self) -> &'static str {
        match self {
            Change::Created => "created",
            Change::Updated => "updated",
            Change::Deleted => "deleted",
            Change::Unchanged => "unchanged",
            Change::Failed => "failed",
        }
    }

    /// Whether this change mutated the provider
    pub fn is_mutation(&self) -> bool {
        matches!(self, Change::Created | Change::Updated | Change::Deleted)
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SummaryEntry {
    #[serde(serialize_with = "kind_str")]
    pub resource: ResourceKind,
    pub name: String,
    pub change: Change,
}

fn kind_str<S: serde::Serializer>(kind: &ResourceKind, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(kind.as_str())
}

#[derive(Debug, Default)]
pub struct Summary {
    entries: Mutex<Vec<SummaryEntry>>,
}

impl Summary {
    pub fn record(&self, resource: ResourceKind, name: impl Into<String>, change: Change) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(SummaryEntry {
                resource,
                name: name.into(),
                change,
            });
    }

    pub fn snapshot(&self) -> Vec<SummaryEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn count(&self, change: Change) -> usize {
        self.snapshot().iter().filter(|e| e.change == change).count()
    }

    pub fn mutations(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|e| e.change.is_mutation())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_only_mutations() {
        let summary = Summary::default();
        summary.record(ResourceKind::Vpc, "vpc-1", Change::Unchanged);
        summary.record(ResourceKind::NodePool, "general", Change::Created);
        summary.record(ResourceKind::NodePool, "old", Change::Deleted);
        summary.record(ResourceKind::NodePool, "gpu", Change::Failed);

        assert_eq!(summary.mutations(), 2);
        assert_eq!(summary.count(Change::Failed), 1);
        assert_eq!(summary.snapshot()[1].name, "general");
    }
}
