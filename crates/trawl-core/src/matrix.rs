use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::config::CollectionPlan;
use crate::types::CellKey;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MatrixError {
    #[error("unknown cell: {work_item}/{identity}")]
    UnknownCell { work_item: String, identity: String },
    #[error("cell already complete: {work_item}/{identity}")]
    CellComplete { work_item: String, identity: String },
    #[error("sequence {sequence} already recorded for {work_item}/{identity}")]
    DuplicateSequence {
        work_item: String,
        identity: String,
        sequence: u32,
    },
}

impl MatrixError {
    fn unknown(key: &CellKey) -> Self {
        Self::UnknownCell {
            work_item: key.work_item.0.clone(),
            identity: key.identity.0.clone(),
        }
    }
}

/// Per-cell completion state.
///
/// `completed` holds the sequence numbers with a durable artifact triple,
/// not a bare count: invalidation removes a specific sequence, so applying
/// the same verdict twice is a no-op, and freed slots are reissued exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetCell {
    pub required: u32,
    pub completed: BTreeSet<u32>,
}

impl TargetCell {
    fn new(required: u32) -> Self {
        Self {
            required,
            completed: BTreeSet::new(),
        }
    }

    pub fn completed_count(&self) -> u32 {
        self.completed.len() as u32
    }

    pub fn remaining(&self) -> u32 {
        self.required.saturating_sub(self.completed_count())
    }

    pub fn is_complete(&self) -> bool {
        self.completed_count() >= self.required
    }

    /// Smallest sequence >= 1 without a completed sample, `None` once full.
    fn next_sequence(&self) -> Option<u32> {
        if self.is_complete() {
            return None;
        }
        (1..).find(|seq| !self.completed.contains(seq))
    }
}

/// The assignment plan: required and completed sample counts for every
/// (work item, identity) pair. Mutated only by completion and invalidation
/// events; callers serialize access.
#[derive(Debug, Clone)]
pub struct TargetMatrix {
    cells: BTreeMap<CellKey, TargetCell>,
}

impl TargetMatrix {
    pub fn new(plan: &CollectionPlan) -> Self {
        let mut cells = BTreeMap::new();
        for item in &plan.work_items {
            for identity in &plan.identities {
                cells.insert(
                    CellKey::new(item.id.clone(), identity.key.clone()),
                    TargetCell::new(plan.samples_per_cell),
                );
            }
        }
        Self { cells }
    }

    pub fn cell(&self, key: &CellKey) -> Option<&TargetCell> {
        self.cells.get(key)
    }

    pub fn contains(&self, key: &CellKey) -> bool {
        self.cells.contains_key(key)
    }

    /// Cells for one identity, in stable work-item order.
    pub fn cells_for_identity<'a>(
        &'a self,
        identity: &'a crate::types::IdentityKey,
    ) -> impl Iterator<Item = (&'a CellKey, &'a TargetCell)> {
        self.cells
            .iter()
            .filter(move |(key, _)| &key.identity == identity)
    }

    pub fn next_sequence(&self, key: &CellKey) -> Option<u32> {
        self.cells.get(key).and_then(TargetCell::next_sequence)
    }

    pub fn record_completion(&mut self, key: &CellKey, sequence: u32) -> Result<(), MatrixError> {
        let cell = self
            .cells
            .get_mut(key)
            .ok_or_else(|| MatrixError::unknown(key))?;
        if cell.completed.contains(&sequence) {
            return Err(MatrixError::DuplicateSequence {
                work_item: key.work_item.0.clone(),
                identity: key.identity.0.clone(),
                sequence,
            });
        }
        if cell.is_complete() {
            return Err(MatrixError::CellComplete {
                work_item: key.work_item.0.clone(),
                identity: key.identity.0.clone(),
            });
        }
        cell.completed.insert(sequence);
        Ok(())
    }

    /// Removes one completed sequence. Idempotent: absent sequences and
    /// unknown cells return false.
    pub fn invalidate(&mut self, key: &CellKey, sequence: u32) -> bool {
        match self.cells.get_mut(key) {
            Some(cell) => cell.completed.remove(&sequence),
            None => false,
        }
    }

    /// Restart-time rebuild from the artifact scan. Counts beyond
    /// `required` are truncated (largest sequences dropped) so the
    /// completed <= required invariant holds regardless of what is on disk.
    pub fn seed(&mut self, counts: &BTreeMap<CellKey, BTreeSet<u32>>) -> u64 {
        let mut seeded = 0u64;
        for (key, sequences) in counts {
            let Some(cell) = self.cells.get_mut(key) else {
                continue;
            };
            cell.completed = sequences
                .iter()
                .copied()
                .take(cell.required as usize)
                .collect();
            seeded += cell.completed.len() as u64;
        }
        seeded
    }

    pub fn is_complete(&self) -> bool {
        self.cells.values().all(TargetCell::is_complete)
    }

    /// (total completed, total required) across all cells.
    pub fn totals(&self) -> (u64, u64) {
        let mut completed = 0u64;
        let mut required = 0u64;
        for cell in self.cells.values() {
            completed += cell.completed_count() as u64;
            required += cell.required as u64;
        }
        (completed, required)
    }

    /// Total remaining samples for one identity across all work items.
    pub fn remaining_for_identity(&self, identity: &crate::types::IdentityKey) -> u32 {
        self.cells_for_identity(identity)
            .map(|(_, cell)| cell.remaining())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollectionPlan;
    use crate::types::{Identity, IdentityKey, WorkItem, WorkItemId};

    fn plan(items: &[&str], relays: &[&str], samples: u32) -> CollectionPlan {
        CollectionPlan {
            work_items: items
                .iter()
                .map(|id| WorkItem {
                    id: WorkItemId(id.to_string()),
                    pages: vec![format!("https://{id}.example/")],
                })
                .collect(),
            identities: relays
                .iter()
                .map(|relay| Identity {
                    key: IdentityKey::for_relay(relay, false),
                    relay: relay.to_string(),
                    daita: false,
                })
                .collect(),
            samples_per_cell: samples,
        }
    }

    fn key(item: &str, relay: &str) -> CellKey {
        CellKey::new(
            WorkItemId(item.to_string()),
            IdentityKey::for_relay(relay, false),
        )
    }

    #[test]
    fn completed_never_exceeds_required() {
        let mut matrix = TargetMatrix::new(&plan(&["x"], &["a"], 2));
        let k = key("x", "a");

        matrix.record_completion(&k, 1).unwrap();
        matrix.record_completion(&k, 2).unwrap();
        let err = matrix.record_completion(&k, 3).unwrap_err();
        assert!(matches!(err, MatrixError::CellComplete { .. }));
        assert_eq!(matrix.totals(), (2, 2));
        assert!(matrix.is_complete());
    }

    #[test]
    fn duplicate_sequence_is_refused() {
        let mut matrix = TargetMatrix::new(&plan(&["x"], &["a"], 3));
        let k = key("x", "a");

        matrix.record_completion(&k, 1).unwrap();
        let err = matrix.record_completion(&k, 1).unwrap_err();
        assert!(matches!(err, MatrixError::DuplicateSequence { .. }));
        assert_eq!(matrix.totals(), (1, 3));
    }

    #[test]
    fn sequence_allocation_reissues_freed_slots() {
        let mut matrix = TargetMatrix::new(&plan(&["x"], &["a"], 3));
        let k = key("x", "a");

        assert_eq!(matrix.next_sequence(&k), Some(1));
        matrix.record_completion(&k, 1).unwrap();
        matrix.record_completion(&k, 2).unwrap();
        assert_eq!(matrix.next_sequence(&k), Some(3));

        assert!(matrix.invalidate(&k, 1));
        assert_eq!(matrix.next_sequence(&k), Some(1));
        // The surviving sample keeps its slot.
        matrix.record_completion(&k, 1).unwrap();
        assert_eq!(matrix.next_sequence(&k), Some(3));
    }

    #[test]
    fn invalidate_is_idempotent() {
        let mut matrix = TargetMatrix::new(&plan(&["x"], &["a"], 2));
        let k = key("x", "a");

        matrix.record_completion(&k, 1).unwrap();
        assert!(matrix.invalidate(&k, 1));
        assert!(!matrix.invalidate(&k, 1));
        assert_eq!(matrix.totals(), (0, 2));
    }

    #[test]
    fn unknown_cell_is_an_error() {
        let mut matrix = TargetMatrix::new(&plan(&["x"], &["a"], 2));
        let err = matrix.record_completion(&key("y", "a"), 1).unwrap_err();
        assert!(matches!(err, MatrixError::UnknownCell { .. }));
        assert!(!matrix.invalidate(&key("y", "a"), 1));
    }

    #[test]
    fn seed_truncates_at_required() {
        let mut matrix = TargetMatrix::new(&plan(&["x"], &["a"], 2));
        let k = key("x", "a");

        let mut counts = BTreeMap::new();
        counts.insert(k.clone(), BTreeSet::from([1, 2, 3]));
        assert_eq!(matrix.seed(&counts), 2);
        assert_eq!(matrix.totals(), (2, 2));
        assert!(matrix.is_complete());
    }

    #[test]
    fn remainder_accounting_per_identity() {
        let mut matrix = TargetMatrix::new(&plan(&["x", "y"], &["a", "b"], 2));
        let a = IdentityKey::for_relay("a", false);

        assert_eq!(matrix.remaining_for_identity(&a), 4);
        matrix.record_completion(&key("x", "a"), 1).unwrap();
        assert_eq!(matrix.remaining_for_identity(&a), 3);
        assert_eq!(matrix.remaining_for_identity(&IdentityKey::for_relay("b", false)), 4);
    }
}
