use std::collections::BTreeMap;
use std::path::Path;

use tracing::{info, warn};

use trawl_core::types::{CellUnit, IdentityKey, WorkItemId};

use crate::{
    ArtifactStore, ArtifactStoreError, CAPTURE_EXT, METADATA_EXT, SNAPSHOT_EXT,
};

/// Structural/size heuristics for one validation pass.
///
/// A unit is kept when its capture size sits inside the absolute window OR
/// inside the ratio band around the per-cell median; it is flagged when it
/// fails both, or when any of its three files is missing.
#[derive(Debug, Clone, Copy)]
pub struct ValidationConfig {
    /// Captures below this are blocked/blank loads.
    pub min_capture_bytes: u64,
    /// Captures above this are captcha or redirect-loop noise.
    pub max_capture_bytes: u64,
    /// Half-width of the relative band: keep sizes within
    /// `[ratio, 2 - ratio] x median`.
    pub band_ratio: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_capture_bytes: 50 * 1024,
            max_capture_bytes: 1500 * 1024,
            band_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidateMode {
    /// Read-only: flag, touch nothing.
    Report,
    /// Flag and delete the flagged files.
    Apply,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlagReason {
    MissingFile { ext: &'static str },
    CaptureOutOfBand { bytes: u64, median_bytes: u64 },
}

impl std::fmt::Display for FlagReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingFile { ext } => write!(f, "missing .{ext} file"),
            Self::CaptureOutOfBand {
                bytes,
                median_bytes,
            } => write!(
                f,
                "capture size {bytes} outside band (cell median {median_bytes})"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlaggedUnit {
    pub unit: CellUnit,
    pub reason: FlagReason,
}

#[derive(Debug, Default)]
struct UnitFiles {
    capture_bytes: Option<u64>,
    snapshot: bool,
    metadata: bool,
}

/// Inspects every artifact triple under the store root and returns the
/// units that fail the heuristic, in stable (cell, sequence) order.
///
/// `Apply` additionally deletes the flagged files, so a second pass over an
/// unchanged tree finds nothing.
pub fn validate(
    store: &ArtifactStore,
    config: &ValidationConfig,
    mode: ValidateMode,
) -> Result<Vec<FlaggedUnit>, ArtifactStoreError> {
    let mut flagged = Vec::new();
    let identities = match std::fs::read_dir(store.root()) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(flagged),
        Err(err) => return Err(ArtifactStoreError::Io(err)),
    };
    let mut identity_names = Vec::new();
    for entry in identities {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = crate::entry_name(&entry) {
                identity_names.push(name);
            }
        }
    }
    identity_names.sort();

    for identity in identity_names {
        let identity_dir = store.root().join(&identity);
        let mut item_names = Vec::new();
        for entry in std::fs::read_dir(&identity_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = crate::entry_name(&entry) {
                    item_names.push(name);
                }
            }
        }
        item_names.sort();

        for item in item_names {
            let units = collect_units(&identity_dir.join(&item))?;
            let median = median_capture_bytes(&units);
            for (sequence, files) in &units {
                let unit = CellUnit {
                    work_item: WorkItemId(item.clone()),
                    identity: IdentityKey(identity.clone()),
                    sequence: *sequence,
                };
                let reason = match flag_unit(files, median, config) {
                    Some(reason) => reason,
                    None => continue,
                };
                warn!(
                    identity = %unit.identity.0,
                    work_item = %unit.work_item.0,
                    sequence = unit.sequence,
                    reason = %reason,
                    "artifact unit flagged"
                );
                if mode == ValidateMode::Apply {
                    let removed = store.remove_unit(&unit)?;
                    info!(
                        identity = %unit.identity.0,
                        work_item = %unit.work_item.0,
                        sequence = unit.sequence,
                        removed_files = removed,
                        "artifact unit pruned"
                    );
                }
                flagged.push(FlaggedUnit { unit, reason });
            }
        }
    }
    Ok(flagged)
}

fn flag_unit(
    files: &UnitFiles,
    median: u64,
    config: &ValidationConfig,
) -> Option<FlagReason> {
    let Some(capture_bytes) = files.capture_bytes else {
        return Some(FlagReason::MissingFile { ext: CAPTURE_EXT });
    };
    if !files.snapshot {
        return Some(FlagReason::MissingFile { ext: SNAPSHOT_EXT });
    }
    if !files.metadata {
        return Some(FlagReason::MissingFile { ext: METADATA_EXT });
    }

    let in_absolute_window =
        (config.min_capture_bytes..=config.max_capture_bytes).contains(&capture_bytes);
    let lo = median as f64 * config.band_ratio;
    let hi = median as f64 * (2.0 - config.band_ratio);
    let in_relative_band = median > 0 && (lo..=hi).contains(&(capture_bytes as f64));
    if in_absolute_window || in_relative_band {
        return None;
    }
    Some(FlagReason::CaptureOutOfBand {
        bytes: capture_bytes,
        median_bytes: median,
    })
}

fn collect_units(dir: &Path) -> Result<BTreeMap<u32, UnitFiles>, ArtifactStoreError> {
    let mut units: BTreeMap<u32, UnitFiles> = BTreeMap::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = crate::entry_name(&entry) else {
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
        let files = units.entry(sequence).or_default();
        match ext {
            CAPTURE_EXT => files.capture_bytes = Some(entry.metadata()?.len()),
            SNAPSHOT_EXT => files.snapshot = true,
            METADATA_EXT => files.metadata = true,
            _ => {}
        }
    }
    Ok(units)
}

fn median_capture_bytes(units: &BTreeMap<u32, UnitFiles>) -> u64 {
    let mut sizes: Vec<u64> = units.values().filter_map(|f| f.capture_bytes).collect();
    if sizes.is_empty() {
        return 0;
    }
    sizes.sort_unstable();
    let mid = sizes.len() / 2;
    if sizes.len() % 2 == 1 {
        sizes[mid]
    } else {
        (sizes[mid - 1] + sizes[mid]) / 2
    }
}
