use std::collections::BTreeMap;

use thiserror::Error;

use crate::types::{CellKey, ClientId, Lease};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("cell {work_item}/{identity} already has an outstanding lease")]
    CellBusy { work_item: String, identity: String },
    #[error("no outstanding lease for {work_item}/{identity}")]
    NoLease { work_item: String, identity: String },
    #[error("lease for {work_item}/{identity} is held by a different client")]
    WrongClient { work_item: String, identity: String },
    #[error("lease for {work_item}/{identity} covers sequence {expected}, not {reported}")]
    WrongSequence {
        work_item: String,
        identity: String,
        expected: u32,
        reported: u32,
    },
}

/// Outstanding (not-yet-completed) cell leases, keyed by cell.
///
/// The map key enforces the exclusivity invariant: two clients can never
/// hold the same uncompleted cell at once.
#[derive(Debug, Default, Clone)]
pub struct AssignmentLedger {
    leases: BTreeMap<CellKey, Lease>,
}

impl AssignmentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_lease(&self, cell: &CellKey) -> bool {
        self.leases.contains_key(cell)
    }

    pub fn outstanding(&self) -> usize {
        self.leases.len()
    }

    pub fn grant(
        &mut self,
        cell: CellKey,
        client: ClientId,
        sequence: u32,
        now_ms: u64,
        ttl_ms: u64,
    ) -> Result<Lease, LedgerError> {
        if self.leases.contains_key(&cell) {
            return Err(LedgerError::CellBusy {
                work_item: cell.work_item.0.clone(),
                identity: cell.identity.0.clone(),
            });
        }
        let lease = Lease {
            cell: cell.clone(),
            client,
            sequence,
            granted_unix_ms: now_ms,
            expires_unix_ms: now_ms.saturating_add(ttl_ms),
        };
        self.leases.insert(cell, lease.clone());
        Ok(lease)
    }

    /// Checks that a completion report matches the outstanding lease
    /// without mutating anything.
    pub fn verify(
        &self,
        cell: &CellKey,
        client: &ClientId,
        sequence: u32,
    ) -> Result<(), LedgerError> {
        let lease = self.leases.get(cell).ok_or_else(|| LedgerError::NoLease {
            work_item: cell.work_item.0.clone(),
            identity: cell.identity.0.clone(),
        })?;
        if &lease.client != client {
            return Err(LedgerError::WrongClient {
                work_item: cell.work_item.0.clone(),
                identity: cell.identity.0.clone(),
            });
        }
        if lease.sequence != sequence {
            return Err(LedgerError::WrongSequence {
                work_item: cell.work_item.0.clone(),
                identity: cell.identity.0.clone(),
                expected: lease.sequence,
                reported: sequence,
            });
        }
        Ok(())
    }

    /// Removes and returns the lease a completion report settles.
    ///
    /// A mismatch on any axis leaves the ledger untouched; the caller maps
    /// every variant to a Conflict and discards the report.
    pub fn complete(
        &mut self,
        cell: &CellKey,
        client: &ClientId,
        sequence: u32,
    ) -> Result<Lease, LedgerError> {
        self.verify(cell, client, sequence)?;
        self.leases.remove(cell).ok_or_else(|| LedgerError::NoLease {
            work_item: cell.work_item.0.clone(),
            identity: cell.identity.0.clone(),
        })
    }

    /// Drops the lease without completing it (inline-rejected report).
    pub fn release(&mut self, cell: &CellKey) -> Option<Lease> {
        self.leases.remove(cell)
    }

    /// Drops every lease held by one client (the client started a new
    /// session; its old claims are dead).
    pub fn release_client(&mut self, client: &ClientId) -> Vec<Lease> {
        let cells: Vec<CellKey> = self
            .leases
            .iter()
            .filter(|(_, lease)| &lease.client == client)
            .map(|(cell, _)| cell.clone())
            .collect();
        cells
            .into_iter()
            .filter_map(|cell| self.leases.remove(&cell))
            .collect()
    }

    /// Periodic scan removing leases past their deadline. Expiry is the
    /// expected recovery path for a stalled client, not an error.
    pub fn sweep_expired(&mut self, now_ms: u64) -> Vec<Lease> {
        let cells: Vec<CellKey> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.is_expired(now_ms))
            .map(|(cell, _)| cell.clone())
            .collect();
        cells
            .into_iter()
            .filter_map(|cell| self.leases.remove(&cell))
            .collect()
    }
}
