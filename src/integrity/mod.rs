//! Integrity validation and repair of downloaded chapters
//!
//! - [`validator`] - inspects one unit on disk and scores it
//! - [`repair`] - re-fetches broken pieces or whole units through the queue
//! - [`manager`] - full-library scans, auto-repair and the background schedule

pub mod manager;
pub mod repair;
pub mod validator;

pub use manager::{AutoRepairSummary, CorruptionNotifier, IntegrityManager, LogNotifier};
pub use repair::{RepairEngine, RepairOutcome};
pub use validator::IntegrityValidator;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Follow-up recommended for a validated unit
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    /// Unit is healthy
    #[default]
    None,
    /// Re-fetch only the missing and corrupt pieces
    RedownloadCorrupted,
    /// Discard the unit and queue it again
    RedownloadAll,
    /// Needs a human; never repaired automatically
    ManualCheck,
}

impl RecommendedAction {
    /// Whether the repair engine may act on this without asking
    pub fn is_auto_repairable(self) -> bool {
        matches!(
            self,
            RecommendedAction::RedownloadCorrupted | RecommendedAction::RedownloadAll
        )
    }
}

/// Inspection stages to run
///
/// Stages are independent and additive. The default is the cheap
/// "is it readable" check: file sizes and format headers only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationOptions {
    /// Compare each file's size with the manifest and the minimum piece size
    pub validate_file_size: bool,
    /// Check that each file starts with a known image signature
    pub validate_format: bool,
    /// Hash each file and compare with the manifest checksum
    pub validate_content: bool,
    /// Read the image header and compare dimensions with the manifest
    pub check_dimensions: bool,
    /// Fully decode every image and report unlisted files
    pub deep_scan: bool,
    /// Repair automatically when the result allows it
    pub repair_corrupted: bool,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            validate_file_size: true,
            validate_format: true,
            validate_content: false,
            check_dimensions: false,
            deep_scan: false,
            repair_corrupted: false,
        }
    }
}

impl ValidationOptions {
    /// Size and format only
    pub fn quick() -> Self {
        Self::default()
    }

    /// Every inspection stage, without repair
    pub fn full() -> Self {
        Self {
            validate_file_size: true,
            validate_format: true,
            validate_content: true,
            check_dimensions: true,
            deep_scan: true,
            repair_corrupted: false,
        }
    }

    /// Same stages, with automatic repair enabled
    pub fn with_repair(mut self) -> Self {
        self.repair_corrupted = true;
        self
    }
}

/// Outcome of validating one unit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    /// Owner (title) id
    pub owner_id: String,
    /// Unit (chapter) key
    pub unit_key: String,
    /// No missing or corrupt pieces and a passing score
    pub is_valid: bool,
    /// Composite health, 0-100
    pub integrity_score: u8,
    /// Indices expected but absent
    pub missing_pieces: BTreeSet<u32>,
    /// Indices present but failing an inspection stage
    pub corrupt_pieces: BTreeSet<u32>,
    /// What to do about it
    pub recommended_action: RecommendedAction,
    /// Non-fatal findings
    pub warnings: Vec<String>,
    /// Pieces listed in the manifest
    pub total_pieces: usize,
}

impl ValidationResult {
    /// Key of this unit in an [`IntegrityReport`]
    pub fn unit_id(&self) -> String {
        crate::types::ItemId::for_unit(&self.owner_id, &self.unit_key).0
    }

    /// Union of missing and corrupt indices
    pub fn broken_pieces(&self) -> BTreeSet<u32> {
        self.missing_pieces
            .union(&self.corrupt_pieces)
            .copied()
            .collect()
    }
}

/// Aggregate over many validated units
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    /// Units scanned
    pub total_units: usize,
    /// Units that passed
    pub valid_units: usize,
    /// Units that did not
    pub corrupted_units: usize,
    /// Mean score over scanned units (100 for an empty library)
    pub average_integrity_score: f64,
    /// Per-unit results keyed by `{owner}_{unit}`
    pub per_unit_results: BTreeMap<String, ValidationResult>,
    /// Human-readable follow-ups
    pub recommendations: Vec<String>,
}

impl IntegrityReport {
    /// Build a report from per-unit results
    pub fn from_results(results: impl IntoIterator<Item = ValidationResult>) -> Self {
        let per_unit_results: BTreeMap<String, ValidationResult> =
            results.into_iter().map(|r| (r.unit_id(), r)).collect();

        let total_units = per_unit_results.len();
        let valid_units = per_unit_results.values().filter(|r| r.is_valid).count();
        let average_integrity_score = if total_units == 0 {
            100.0
        } else {
            per_unit_results
                .values()
                .map(|r| f64::from(r.integrity_score))
                .sum::<f64>()
                / total_units as f64
        };

        let count = |action: RecommendedAction| {
            per_unit_results
                .values()
                .filter(|r| r.recommended_action == action)
                .count()
        };
        let mut recommendations = Vec::new();
        let partial = count(RecommendedAction::RedownloadCorrupted);
        if partial > 0 {
            recommendations.push(format!("{} unit(s) need missing or corrupt pages re-downloaded", partial));
        }
        let full = count(RecommendedAction::RedownloadAll);
        if full > 0 {
            recommendations.push(format!("{} unit(s) must be downloaded again", full));
        }
        let manual = count(RecommendedAction::ManualCheck);
        if manual > 0 {
            recommendations.push(format!("{} unit(s) need manual inspection", manual));
        }
        if recommendations.is_empty() {
            recommendations.push("All downloaded units are intact".to_string());
        }

        Self {
            total_units,
            valid_units,
            corrupted_units: total_units - valid_units,
            average_integrity_score,
            per_unit_results,
            recommendations,
        }
    }

    /// Results whose action the repair engine handles
    pub fn repairable(&self) -> impl Iterator<Item = &ValidationResult> {
        self.per_unit_results
            .values()
            .filter(|r| r.recommended_action.is_auto_repairable())
    }
}
