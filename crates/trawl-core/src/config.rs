use std::collections::BTreeSet;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::types::{Identity, IdentityKey, WorkItem};

/// Upper bound on the per-cell sample count (exclusive).
pub const MAX_SAMPLES_PER_CELL: u32 = 1000;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("work item list is empty")]
    EmptyWorkItems,
    #[error("identity list is empty")]
    EmptyIdentities,
    #[error("duplicate work item id: {0}")]
    DuplicateWorkItem(String),
    #[error("duplicate identity entry: {0}")]
    DuplicateIdentity(String),
    #[error("work item {item} has no pages")]
    NoPages { item: String },
    #[error("work item {item} page is not http(s): {page}")]
    NonHttpPage { item: String, page: String },
    #[error("samples per cell must be in range 0 < n < {MAX_SAMPLES_PER_CELL}, got {0}")]
    SamplesOutOfRange(u32),
    #[error("key is not a safe path component: {0}")]
    UnsafeKey(String),
}

/// One line of the identity input file.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityEntry {
    pub relay: String,
    #[serde(default)]
    pub daita: bool,
}

/// The static assignment plan, read once at startup and immutable after.
#[derive(Debug, Clone)]
pub struct CollectionPlan {
    pub work_items: Vec<WorkItem>,
    pub identities: Vec<Identity>,
    pub samples_per_cell: u32,
}

impl CollectionPlan {
    /// Loads and validates the plan from its two JSON input files.
    pub fn load(
        work_items_path: &Path,
        identities_path: &Path,
        samples_per_cell: u32,
    ) -> Result<Self, PlanError> {
        let work_items: Vec<WorkItem> = read_json(work_items_path)?;
        let entries: Vec<IdentityEntry> = read_json(identities_path)?;
        let identities = entries
            .into_iter()
            .map(|entry| Identity {
                key: IdentityKey::for_relay(&entry.relay, entry.daita),
                relay: entry.relay,
                daita: entry.daita,
            })
            .collect();
        let plan = Self {
            work_items,
            identities,
            samples_per_cell,
        };
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        if !(1..MAX_SAMPLES_PER_CELL).contains(&self.samples_per_cell) {
            return Err(PlanError::SamplesOutOfRange(self.samples_per_cell));
        }
        if self.work_items.is_empty() {
            return Err(PlanError::EmptyWorkItems);
        }
        if self.identities.is_empty() {
            return Err(PlanError::EmptyIdentities);
        }

        let mut item_ids = BTreeSet::new();
        for item in &self.work_items {
            if !valid_key_component(&item.id.0) {
                return Err(PlanError::UnsafeKey(item.id.0.clone()));
            }
            if !item_ids.insert(item.id.clone()) {
                return Err(PlanError::DuplicateWorkItem(item.id.0.clone()));
            }
            if item.pages.is_empty() {
                return Err(PlanError::NoPages {
                    item: item.id.0.clone(),
                });
            }
            for page in &item.pages {
                if !page.starts_with("http://") && !page.starts_with("https://") {
                    return Err(PlanError::NonHttpPage {
                        item: item.id.0.clone(),
                        page: page.clone(),
                    });
                }
            }
        }

        let mut identity_keys = BTreeSet::new();
        for identity in &self.identities {
            if !valid_key_component(&identity.key.0) {
                return Err(PlanError::UnsafeKey(identity.key.0.clone()));
            }
            if !identity_keys.insert(identity.key.clone()) {
                return Err(PlanError::DuplicateIdentity(identity.key.0.clone()));
            }
        }
        Ok(())
    }

    /// Total samples the plan calls for across all cells.
    pub fn total_required(&self) -> u64 {
        self.samples_per_cell as u64 * self.work_items.len() as u64 * self.identities.len() as u64
    }
}

/// Identity keys and work item ids name artifact directories; keep them to
/// plain path components.
pub fn valid_key_component(value: &str) -> bool {
    if value.trim().is_empty() {
        return false;
    }
    if value.contains('/') || value.contains('\\') {
        return false;
    }
    if value.contains("..") {
        return false;
    }
    true
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, PlanError> {
    let bytes = std::fs::read(path).map_err(|source| PlanError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| PlanError::Parse {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WorkItemId;

    fn item(id: &str, pages: &[&str]) -> WorkItem {
        WorkItem {
            id: WorkItemId(id.to_string()),
            pages: pages.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn identity(relay: &str, daita: bool) -> Identity {
        Identity {
            key: IdentityKey::for_relay(relay, daita),
            relay: relay.to_string(),
            daita,
        }
    }

    fn valid_plan() -> CollectionPlan {
        CollectionPlan {
            work_items: vec![item("site-0", &["https://example.org/"])],
            identities: vec![identity("se-got-wg-001", false), identity("se-got-wg-001", true)],
            samples_per_cell: 10,
        }
    }

    #[test]
    fn valid_plan_passes() {
        valid_plan().validate().unwrap();
        assert_eq!(valid_plan().total_required(), 20);
    }

    #[test]
    fn daita_variant_is_a_distinct_identity() {
        let plan = valid_plan();
        assert_eq!(plan.identities[0].key.0, "se-got-wg-001");
        assert_eq!(plan.identities[1].key.0, "se-got-wg-001+daita");
        plan.validate().unwrap();
    }

    #[test]
    fn duplicate_work_item_is_rejected() {
        let mut plan = valid_plan();
        plan.work_items.push(item("site-0", &["https://other.example/"]));
        assert!(matches!(
            plan.validate().unwrap_err(),
            PlanError::DuplicateWorkItem(_)
        ));
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let mut plan = valid_plan();
        plan.identities.push(identity("se-got-wg-001", true));
        assert!(matches!(
            plan.validate().unwrap_err(),
            PlanError::DuplicateIdentity(_)
        ));
    }

    #[test]
    fn non_http_page_is_rejected() {
        let mut plan = valid_plan();
        plan.work_items.push(item("site-1", &["ftp://example.org/"]));
        assert!(matches!(
            plan.validate().unwrap_err(),
            PlanError::NonHttpPage { .. }
        ));
    }

    #[test]
    fn samples_bounds_are_enforced() {
        let mut plan = valid_plan();
        plan.samples_per_cell = 0;
        assert!(matches!(
            plan.validate().unwrap_err(),
            PlanError::SamplesOutOfRange(0)
        ));
        plan.samples_per_cell = MAX_SAMPLES_PER_CELL;
        assert!(plan.validate().is_err());
        plan.samples_per_cell = MAX_SAMPLES_PER_CELL - 1;
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn path_escaping_keys_are_rejected() {
        let mut plan = valid_plan();
        plan.work_items.push(item("../escape", &["https://example.org/"]));
        assert!(matches!(
            plan.validate().unwrap_err(),
            PlanError::UnsafeKey(_)
        ));
    }
}
