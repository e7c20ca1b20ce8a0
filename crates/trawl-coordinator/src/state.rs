use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::info;

use trawl_core::config::CollectionPlan;
use trawl_core::ledger::{AssignmentLedger, LedgerError};
use trawl_core::matrix::{MatrixError, TargetMatrix};
use trawl_core::pool::IdentityPool;
use trawl_core::types::{
    CellKey, CellUnit, ClientId, Identity, IdentityKey, Lease, WorkItem, WorkItemId,
};

#[derive(Debug, Clone, Copy)]
pub struct CollectorConfig {
    /// Work-lease staleness deadline.
    pub lease_ttl_ms: u64,
    /// Visits a client should perform per identity before re-registering.
    pub visit_budget: u32,
    /// Inline gate: captures below this are rejected without recording.
    pub min_capture_bytes: u64,
    /// Inline gate: captures above this are rejected without recording.
    pub max_capture_bytes: u64,
    /// Inline gate: verification images below this are rejected.
    pub min_snapshot_bytes: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: 5 * 60 * 1000,
            visit_budget: 10,
            min_capture_bytes: 30 * 1024,
            max_capture_bytes: 1500 * 1024,
            min_snapshot_bytes: 30 * 1024,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegisterError {
    #[error("no available identities remain")]
    Busy,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkError {
    #[error("identity {0} is not leased to this client")]
    InvalidIdentity(String),
    #[error("no work remaining for identity {0}")]
    NoWorkRemaining(String),
    #[error("intake is paused, retry later")]
    Paused,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReportError {
    #[error("stale report: {0}")]
    Conflict(String),
}

impl From<LedgerError> for ReportError {
    fn from(err: LedgerError) -> Self {
        Self::Conflict(err.to_string())
    }
}

impl From<MatrixError> for ReportError {
    fn from(err: MatrixError) -> Self {
        Self::Conflict(err.to_string())
    }
}

/// Why an otherwise-valid report was not recorded (inline size gate).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    CaptureTooSmall { bytes: u64, min: u64 },
    CaptureTooLarge { bytes: u64, max: u64 },
    SnapshotTooSmall { bytes: u64, min: u64 },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CaptureTooSmall { bytes, min } => {
                write!(f, "capture is {bytes} bytes, below minimum {min}")
            }
            Self::CaptureTooLarge { bytes, max } => {
                write!(f, "capture is {bytes} bytes, above maximum {max}")
            }
            Self::SnapshotTooSmall { bytes, min } => {
                write!(f, "snapshot is {bytes} bytes, below minimum {min}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub completed: u64,
    pub required: u64,
    pub paused: bool,
    pub outstanding_leases: u64,
    pub leased_identities: u64,
    pub clients: u64,
    pub elapsed_secs: u64,
}

/// The coordinator's single owned state object: target matrix, assignment
/// ledger, identity pool, pause flag, and the client registry. Every
/// mutation goes through one `&mut self` method, so putting the whole
/// struct behind one lock gives the single-writer critical section the
/// pause/resume contract depends on.
#[derive(Debug)]
pub struct CollectorState {
    config: CollectorConfig,
    matrix: TargetMatrix,
    ledger: AssignmentLedger,
    pool: IdentityPool,
    work_items: BTreeMap<WorkItemId, WorkItem>,
    clients: BTreeSet<ClientId>,
    paused: bool,
    started_unix_ms: u64,
}

impl CollectorState {
    pub fn new(plan: &CollectionPlan, config: CollectorConfig, now_ms: u64) -> Self {
        Self {
            config,
            matrix: TargetMatrix::new(plan),
            ledger: AssignmentLedger::new(),
            pool: IdentityPool::new(&plan.identities),
            work_items: plan
                .work_items
                .iter()
                .map(|item| (item.id.clone(), item.clone()))
                .collect(),
            clients: BTreeSet::new(),
            paused: false,
            started_unix_ms: now_ms,
        }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Restart-time rebuild: seed completed counts from the artifact scan
    /// instead of trusting any cached number.
    pub fn seed_completed(&mut self, counts: &BTreeMap<CellKey, BTreeSet<u32>>) -> u64 {
        self.matrix.seed(counts)
    }

    /// Leases a free identity to the client for its session. Re-registering
    /// first releases the client's previous identity and any outstanding
    /// work leases; identities with nothing left to collect are never
    /// granted.
    pub fn register(&mut self, client: &ClientId) -> Result<Identity, RegisterError> {
        self.clients.insert(client.clone());

        if let Some(previous) = self.pool.release_client(client) {
            let dropped = self.ledger.release_client(client);
            info!(
                client_id = %client.0,
                identity = %previous.0,
                dropped_leases = dropped.len(),
                "released identity on re-register"
            );
        }

        let mut best: Option<(IdentityKey, u32)> = None;
        for key in self.pool.free_keys() {
            let remaining = self.matrix.remaining_for_identity(key);
            if remaining == 0 {
                continue;
            }
            if best.as_ref().map_or(true, |(_, r)| remaining > *r) {
                best = Some((key.clone(), remaining));
            }
        }
        let Some((key, remaining)) = best else {
            return Err(RegisterError::Busy);
        };
        let Some(identity) = self.pool.get(&key).cloned() else {
            return Err(RegisterError::Busy);
        };
        self.pool.lease(&key, client.clone());
        info!(
            client_id = %client.0,
            identity = %key.0,
            remaining,
            "identity leased"
        );
        Ok(identity)
    }

    /// Deterministic assignment: among this identity's unfinished,
    /// unleased cells, the largest remainder wins; ties break by lexical
    /// work-item order.
    pub fn request_work(
        &mut self,
        client: &ClientId,
        identity: &IdentityKey,
        now_ms: u64,
    ) -> Result<(WorkItem, Lease), WorkError> {
        if self.paused {
            return Err(WorkError::Paused);
        }
        if !self.pool.is_leased_to(identity, client) {
            return Err(WorkError::InvalidIdentity(identity.0.clone()));
        }
        self.clients.insert(client.clone());

        let mut best: Option<(CellKey, u32)> = None;
        for (key, cell) in self.matrix.cells_for_identity(identity) {
            let remaining = cell.remaining();
            if remaining == 0 || self.ledger.has_lease(key) {
                continue;
            }
            // Iteration is in ascending work-item order, so a strict
            // comparison keeps the lexically-smallest item on ties.
            if best.as_ref().map_or(true, |(_, r)| remaining > *r) {
                best = Some((key.clone(), remaining));
            }
        }
        let Some((cell, _)) = best else {
            return Err(WorkError::NoWorkRemaining(identity.0.clone()));
        };

        let Some(sequence) = self.matrix.next_sequence(&cell) else {
            return Err(WorkError::NoWorkRemaining(identity.0.clone()));
        };
        let Some(item) = self.work_items.get(&cell.work_item).cloned() else {
            return Err(WorkError::NoWorkRemaining(identity.0.clone()));
        };
        let Ok(lease) = self.ledger.grant(
            cell.clone(),
            client.clone(),
            sequence,
            now_ms,
            self.config.lease_ttl_ms,
        ) else {
            return Err(WorkError::NoWorkRemaining(identity.0.clone()));
        };
        info!(
            client_id = %client.0,
            identity = %identity.0,
            work_item = %cell.work_item.0,
            sequence,
            expires_unix_ms = lease.expires_unix_ms,
            "work leased"
        );
        Ok((item, lease))
    }

    /// Pre-write check: a matching lease must exist before any artifact
    /// bytes land on disk, so a stale client can never clobber a completed
    /// unit's files.
    pub fn check_report(
        &self,
        client: &ClientId,
        identity: &IdentityKey,
        item: &WorkItemId,
        sequence: u32,
    ) -> Result<(), ReportError> {
        let cell = CellKey::new(item.clone(), identity.clone());
        self.ledger.verify(&cell, client, sequence)?;
        Ok(())
    }

    /// Inline size gate (applied after `check_report`). A failing report is
    /// acknowledged but not recorded: the lease is released and the cell is
    /// immediately reassignable under the same sequence.
    pub fn gate_payload(
        &self,
        capture_bytes: u64,
        snapshot_bytes: u64,
    ) -> Result<(), RejectReason> {
        if capture_bytes < self.config.min_capture_bytes {
            return Err(RejectReason::CaptureTooSmall {
                bytes: capture_bytes,
                min: self.config.min_capture_bytes,
            });
        }
        if capture_bytes > self.config.max_capture_bytes {
            return Err(RejectReason::CaptureTooLarge {
                bytes: capture_bytes,
                max: self.config.max_capture_bytes,
            });
        }
        if snapshot_bytes < self.config.min_snapshot_bytes {
            return Err(RejectReason::SnapshotTooSmall {
                bytes: snapshot_bytes,
                min: self.config.min_snapshot_bytes,
            });
        }
        Ok(())
    }

    /// Releases the lease of a gated-out report without recording anything.
    pub fn reject_report(
        &mut self,
        client: &ClientId,
        identity: &IdentityKey,
        item: &WorkItemId,
        sequence: u32,
        reason: &RejectReason,
    ) {
        let cell = CellKey::new(item.clone(), identity.clone());
        self.ledger.release(&cell);
        info!(
            client_id = %client.0,
            identity = %identity.0,
            work_item = %item.0,
            sequence,
            reason = %reason,
            "report rejected by size gate, cell requeued"
        );
    }

    /// Settles an accepted report: removes the lease and records the
    /// completed sequence. Called after the artifact triple is durable.
    pub fn settle_report(
        &mut self,
        client: &ClientId,
        identity: &IdentityKey,
        item: &WorkItemId,
        sequence: u32,
    ) -> Result<Lease, ReportError> {
        let cell = CellKey::new(item.clone(), identity.clone());
        let lease = self.ledger.complete(&cell, client, sequence)?;
        self.matrix.record_completion(&cell, sequence)?;
        let (completed, required) = self.matrix.totals();
        info!(
            client_id = %client.0,
            identity = %identity.0,
            work_item = %item.0,
            sequence,
            completed,
            required,
            "completion recorded"
        );
        Ok(lease)
    }

    /// Applies a validator verdict. Per-unit removal is idempotent, so a
    /// replayed verdict cannot decrement twice.
    pub fn invalidate(&mut self, units: &[CellUnit]) -> u64 {
        let mut decremented = 0u64;
        for unit in units {
            if self.matrix.invalidate(&unit.cell(), unit.sequence) {
                decremented += 1;
                info!(
                    identity = %unit.identity.0,
                    work_item = %unit.work_item.0,
                    sequence = unit.sequence,
                    "completed sample invalidated"
                );
            }
        }
        decremented
    }

    /// Periodic staleness sweep. Expiry is the normal recovery path for a
    /// crashed or stalled client; the freed cell goes to the next caller.
    pub fn sweep_expired(&mut self, now_ms: u64) -> usize {
        let swept = self.ledger.sweep_expired(now_ms);
        for lease in &swept {
            info!(
                client_id = %lease.client.0,
                identity = %lease.cell.identity.0,
                work_item = %lease.cell.work_item.0,
                sequence = lease.sequence,
                "lease expired, cell requeued"
            );
        }
        swept.len()
    }

    pub fn pause(&mut self) {
        self.paused = true;
        info!("intake paused");
    }

    pub fn resume(&mut self) {
        self.paused = false;
        info!("intake resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_complete(&self) -> bool {
        self.matrix.is_complete()
    }

    pub fn status_snapshot(&self, now_ms: u64) -> StatusSnapshot {
        let (completed, required) = self.matrix.totals();
        StatusSnapshot {
            completed,
            required,
            paused: self.paused,
            outstanding_leases: self.ledger.outstanding() as u64,
            leased_identities: self.pool.leased_count() as u64,
            clients: self.clients.len() as u64,
            elapsed_secs: now_ms.saturating_sub(self.started_unix_ms) / 1000,
        }
    }
}
