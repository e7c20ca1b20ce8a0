#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod validate;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use thiserror::Error;

use trawl_core::types::{CellKey, CellUnit, IdentityKey, WorkItemId};

/// Traffic capture file extension.
pub const CAPTURE_EXT: &str = "pcap";
/// Visual-verification image extension.
pub const SNAPSHOT_EXT: &str = "png";
/// Visit metadata record extension.
pub const METADATA_EXT: &str = "json";

#[derive(Debug, Error)]
pub enum ArtifactStoreError {
    #[error("invalid key component: {0}")]
    InvalidKey(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The three co-produced files of one completed visit.
#[derive(Debug, Clone, Copy)]
pub struct TripleBytes<'a> {
    pub capture: &'a [u8],
    pub snapshot: &'a [u8],
    pub metadata: &'a [u8],
}

/// Artifact directory layout:
/// `<root>/<identity_key>/<work_item_id>/<sequence>.{pcap,png,json}`.
///
/// One directory per (work item, identity) pair; the three files of a unit
/// share a sequence-numbered base name. The validator and the restart-time
/// matrix rebuild both depend on this naming contract.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cell_dir(
        &self,
        identity: &IdentityKey,
        item: &WorkItemId,
    ) -> Result<PathBuf, ArtifactStoreError> {
        if !valid_key_component(&identity.0) {
            return Err(ArtifactStoreError::InvalidKey(identity.0.clone()));
        }
        if !valid_key_component(&item.0) {
            return Err(ArtifactStoreError::InvalidKey(item.0.clone()));
        }
        Ok(self.root.join(&identity.0).join(&item.0))
    }

    fn unit_path(
        &self,
        unit: &CellUnit,
        ext: &str,
    ) -> Result<PathBuf, ArtifactStoreError> {
        let dir = self.cell_dir(&unit.identity, &unit.work_item)?;
        Ok(dir.join(format!("{}.{ext}", unit.sequence)))
    }

    /// Persists one artifact triple. Each file lands via tmp + rename, so a
    /// crash mid-write leaves either the old content or none; a re-capture
    /// of the same sequence replaces any partial leftovers.
    pub fn write_triple(
        &self,
        unit: &CellUnit,
        triple: TripleBytes<'_>,
    ) -> Result<(), ArtifactStoreError> {
        write_atomic(&self.unit_path(unit, CAPTURE_EXT)?, triple.capture)?;
        write_atomic(&self.unit_path(unit, SNAPSHOT_EXT)?, triple.snapshot)?;
        write_atomic(&self.unit_path(unit, METADATA_EXT)?, triple.metadata)?;
        Ok(())
    }

    /// Deletes whatever files exist for a unit. Returns how many were
    /// removed; absent files are not an error.
    pub fn remove_unit(&self, unit: &CellUnit) -> Result<usize, ArtifactStoreError> {
        let mut removed = 0;
        for ext in [CAPTURE_EXT, SNAPSHOT_EXT, METADATA_EXT] {
            let path = self.unit_path(unit, ext)?;
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(ArtifactStoreError::Io(err)),
            }
        }
        Ok(removed)
    }

    /// Rebuilds completed counts from disk: the sequence numbers per cell
    /// with all three files present. Partial triples are not counted; they
    /// are left for the validator to flag. A missing root is an empty
    /// collection, not an error.
    pub fn scan(&self) -> Result<BTreeMap<CellKey, BTreeSet<u32>>, ArtifactStoreError> {
        let mut completed = BTreeMap::new();
        let identities = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(completed),
            Err(err) => return Err(ArtifactStoreError::Io(err)),
        };
        for identity_entry in identities {
            let identity_entry = identity_entry?;
            if !identity_entry.file_type()?.is_dir() {
                continue;
            }
            let Some(identity) = entry_name(&identity_entry) else {
                continue;
            };
            for item_entry in std::fs::read_dir(identity_entry.path())? {
                let item_entry = item_entry?;
                if !item_entry.file_type()?.is_dir() {
                    continue;
                }
                let Some(item) = entry_name(&item_entry) else {
                    continue;
                };
                let sequences = scan_cell_dir(&item_entry.path())?;
                if sequences.is_empty() {
                    continue;
                }
                completed.insert(
                    CellKey::new(WorkItemId(item.clone()), IdentityKey(identity.clone())),
                    sequences,
                );
            }
        }
        Ok(completed)
    }
}

/// Sequence numbers in one cell directory with a complete triple.
fn scan_cell_dir(dir: &Path) -> Result<BTreeSet<u32>, ArtifactStoreError> {
    let mut by_ext: BTreeMap<&'static str, BTreeSet<u32>> = BTreeMap::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = entry_name(&entry) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        let Some((stem, ext)) = name.rsplit_once('.') else {
            continue;
        };
        let Ok(sequence) = stem.parse::<u32>() else {
            continue;
        };
        for known in [CAPTURE_EXT, SNAPSHOT_EXT, METADATA_EXT] {
            if ext == known {
                by_ext.entry(known).or_default().insert(sequence);
            }
        }
    }
    let mut complete = by_ext.remove(CAPTURE_EXT).unwrap_or_default();
    for ext in [SNAPSHOT_EXT, METADATA_EXT] {
        let present = by_ext.remove(ext).unwrap_or_default();
        complete.retain(|seq| present.contains(seq));
    }
    Ok(complete)
}

fn entry_name(entry: &std::fs::DirEntry) -> Option<String> {
    entry.file_name().to_str().map(|s| s.to_string())
}

fn valid_key_component(value: &str) -> bool {
    trawl_core::config::valid_key_component(value)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ArtifactStoreError> {
    use std::io::Write;

    let parent = path.parent().ok_or_else(|| {
        ArtifactStoreError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "path must have parent",
        ))
    })?;
    std::fs::create_dir_all(parent)?;

    let mut tmp = path.to_path_buf();
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| {
            ArtifactStoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "bad filename",
            ))
        })?;
    tmp.set_file_name(format!("{file_name}.tmp.{}", std::process::id()));

    {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }

    std::fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::PathBuf;

    pub fn temp_root(test_name: &str) -> anyhow::Result<PathBuf> {
        let mut root = std::env::temp_dir();
        let suffix = format!(
            "trawl-artifact-store-{}-{}-{}",
            test_name,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        );
        root.push(suffix);
        std::fs::create_dir_all(&root)?;
        Ok(root)
    }
}
