use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkItemId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentityKey(pub String);

impl IdentityKey {
    /// Pool key for a relay, with the obfuscation variant as a distinct entry.
    pub fn for_relay(relay: &str, daita: bool) -> Self {
        if daita {
            Self(format!("{relay}+daita"))
        } else {
            Self(relay.to_string())
        }
    }
}

/// A batch of related pages visited as one session under one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    /// Ordered sub-targets, visited contiguously.
    pub pages: Vec<String>,
}

/// One egress path: a relay, optionally with the enhanced-obfuscation mode.
///
/// The enabled and disabled variants of the same relay are distinct pool
/// entries and distinct matrix columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub key: IdentityKey,
    pub relay: String,
    pub daita: bool,
}

/// Matrix key: one (work item, identity) pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellKey {
    pub work_item: WorkItemId,
    pub identity: IdentityKey,
}

impl CellKey {
    pub fn new(work_item: WorkItemId, identity: IdentityKey) -> Self {
        Self {
            work_item,
            identity,
        }
    }
}

/// A time-bounded exclusive claim on a cell by one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub cell: CellKey,
    pub client: ClientId,
    pub sequence: u32,
    pub granted_unix_ms: u64,
    /// Lease expiration timestamp in Unix milliseconds.
    pub expires_unix_ms: u64,
}

impl Lease {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.expires_unix_ms
    }
}

/// One collected (or flagged) sample unit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellUnit {
    pub work_item: WorkItemId,
    pub identity: IdentityKey,
    pub sequence: u32,
}

impl CellUnit {
    pub fn cell(&self) -> CellKey {
        CellKey::new(self.work_item.clone(), self.identity.clone())
    }
}
