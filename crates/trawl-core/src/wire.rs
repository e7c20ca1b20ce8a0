use serde::{Deserialize, Serialize};

use crate::types::{CellUnit, Identity, WorkItem};

/// Bodies of the coordinator's JSON surface, shared with the monitor.
///
/// Divergent outcomes are carried by the HTTP status code; error bodies all
/// use [`ErrorBody`] so callers can branch on status alone.

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub completed: u64,
    pub required: u64,
    pub paused: bool,
    pub outstanding_leases: u64,
    pub leased_identities: u64,
    pub clients: u64,
    pub elapsed_secs: u64,
}

impl StatusResponse {
    pub fn is_complete(&self) -> bool {
        self.completed >= self.required
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub identity: Identity,
    /// Visits the client should perform before re-registering.
    pub visit_budget: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkResponse {
    pub work_item: WorkItem,
    pub sequence: u32,
    pub lease_expires_unix_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub client: String,
    pub identity: String,
    pub work_item: String,
    pub sequence: u32,
    /// Base64 traffic capture (pcap).
    pub capture_b64: String,
    /// Base64 visual-verification image (png).
    pub snapshot_b64: String,
    /// Page-load metadata record, stored verbatim.
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseResponse {
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidateRequest {
    pub units: Vec<CellUnit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidateResponse {
    pub decremented: u64,
}
