//! Integrity Manager
//!
//! Runs the validator over the whole library in bounded batches, hands
//! repairable results to the [`RepairEngine`], and owns the background
//! validation schedule and the verify-on-complete hook.

use super::{
    IntegrityReport, IntegrityValidator, RecommendedAction, RepairEngine, RepairOutcome,
    ValidationOptions, ValidationResult,
};
use crate::config::IntegrityConfig;
use crate::db::Database;
use crate::error::Result;
use crate::library::ChapterLibrary;
use crate::types::{Event, ItemId};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives background corruption alerts
pub trait CorruptionNotifier: Send + Sync {
    /// `threshold_percent` is the corrupted share of the scanned library
    fn notify_corruption(&self, corrupted: usize, total: usize, threshold_percent: f64);
}

/// Notifier that only logs
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl CorruptionNotifier for LogNotifier {
    fn notify_corruption(&self, corrupted: usize, total: usize, threshold_percent: f64) {
        warn!(
            corrupted,
            total,
            percent = threshold_percent,
            "Background validation found widespread corruption, not repairing automatically"
        );
    }
}

/// What an auto-repair pass did
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoRepairSummary {
    /// The validation the repairs were based on
    pub report: IntegrityReport,
    /// Repair outcome per unit id
    pub repaired: BTreeMap<String, RepairOutcome>,
    /// Units left alone because they need a human
    pub skipped_manual: Vec<String>,
}

/// Coordinates validation and repair across the library
pub struct IntegrityManager {
    validator: IntegrityValidator,
    repair: RepairEngine,
    library: ChapterLibrary,
    db: Arc<Database>,
    config: IntegrityConfig,
    event_tx: broadcast::Sender<Event>,
    notifier: Arc<dyn CorruptionNotifier>,
}

impl IntegrityManager {
    /// Create a manager over a library
    pub fn new(
        library: ChapterLibrary,
        db: Arc<Database>,
        config: IntegrityConfig,
        repair: RepairEngine,
        event_tx: broadcast::Sender<Event>,
        notifier: Arc<dyn CorruptionNotifier>,
    ) -> Self {
        Self {
            validator: IntegrityValidator::new(library.clone(), config.clone()),
            repair,
            library,
            db,
            config,
            event_tx,
            notifier,
        }
    }

    /// The repair engine, for callers that decide on repairs themselves
    pub fn repair_engine(&self) -> &RepairEngine {
        &self.repair
    }

    /// Validate one unit, repairing it when `options.repair_corrupted` is set
    /// and the recommended action allows it
    ///
    /// A failed repair is logged; the validation result is still returned.
    pub async fn validate_unit(
        &self,
        owner_id: &str,
        unit_key: &str,
        options: ValidationOptions,
    ) -> Result<ValidationResult> {
        let result = self.validator.validate_unit(owner_id, unit_key, options).await?;
        self.event_tx
            .send(Event::ValidationComplete {
                owner_id: owner_id.to_string(),
                unit_key: unit_key.to_string(),
                integrity_score: result.integrity_score,
                action: result.recommended_action,
            })
            .ok();

        if options.repair_corrupted && result.recommended_action.is_auto_repairable() {
            if let Err(e) = self
                .repair
                .repair_corrupted_chapter(owner_id, unit_key, &result)
                .await
            {
                warn!(owner_id, unit_key, error = %e, "Repair failed");
            }
        }
        Ok(result)
    }

    /// Validate every stored unit with the default (size and format) checks
    pub async fn validate_all_downloads(&self) -> Result<IntegrityReport> {
        self.validate_all_with(ValidationOptions::default()).await
    }

    /// Validate every stored unit with the given stages
    ///
    /// Units are checked `batch_size` at a time with a pause between batches.
    /// The last-full-validation marker is updated when the scan finishes.
    pub async fn validate_all_with(&self, options: ValidationOptions) -> Result<IntegrityReport> {
        let options = ValidationOptions {
            repair_corrupted: false,
            ..options
        };
        let units = self.library.list_units().await?;
        info!(units = units.len(), "Validating library");

        let mut results = Vec::with_capacity(units.len());
        let mut batches = units.chunks(self.config.batch_size.max(1)).peekable();
        while let Some(batch) = batches.next() {
            let checks = batch.iter().map(|unit| async move {
                match self.validate_unit(&unit.owner_id, &unit.unit_key, options).await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(owner_id = %unit.owner_id, unit_key = %unit.unit_key, error = %e, "Validation failed");
                        unchecked(&unit.owner_id, &unit.unit_key, e.to_string())
                    }
                }
            });
            results.extend(join_all(checks).await);

            if batches.peek().is_some() && !self.config.inter_batch_delay.is_zero() {
                tokio::time::sleep(self.config.inter_batch_delay).await;
            }
        }

        let report = IntegrityReport::from_results(results);
        info!(
            total = report.total_units,
            corrupted = report.corrupted_units,
            average = report.average_integrity_score,
            "Library validation finished"
        );

        if let Err(e) = self
            .db
            .set_last_full_validation(chrono::Utc::now().timestamp_millis())
            .await
        {
            warn!(error = %e, "Failed to record validation time");
        }
        Ok(report)
    }

    /// Validate the library and repair every unit the engine may handle
    ///
    /// Units recommended for manual inspection are skipped.
    pub async fn auto_repair_corrupted_downloads(&self) -> Result<AutoRepairSummary> {
        let report = self.validate_all_downloads().await?;
        Ok(self.repair_report(report).await)
    }

    async fn repair_report(&self, report: IntegrityReport) -> AutoRepairSummary {
        let mut repaired = BTreeMap::new();
        for result in report.repairable() {
            let outcome = match self
                .repair
                .repair_corrupted_chapter(&result.owner_id, &result.unit_key, result)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(unit = %result.unit_id(), error = %e, "Repair failed");
                    RepairOutcome {
                        success: false,
                        repaired_count: 0,
                        errors: vec![e.to_string()],
                    }
                }
            };
            repaired.insert(result.unit_id(), outcome);
        }

        let skipped_manual = report
            .per_unit_results
            .iter()
            .filter(|(_, r)| r.recommended_action == RecommendedAction::ManualCheck)
            .map(|(id, _)| id.clone())
            .collect();

        AutoRepairSummary {
            report,
            repaired,
            skipped_manual,
        }
    }

    /// One scheduled run
    ///
    /// Returns `None` when the last full validation is younger than the
    /// background interval. When more units are corrupted than the notify
    /// threshold allows, the notifier is called and nothing is repaired.
    pub async fn run_background_cycle(&self) -> Result<Option<AutoRepairSummary>> {
        let now = chrono::Utc::now().timestamp_millis();
        let interval_ms = i64::try_from(self.config.background_interval.as_millis()).unwrap_or(i64::MAX);
        let last = match self.db.last_full_validation().await {
            Ok(last) => last,
            Err(e) => {
                // the scan below rewrites the marker
                warn!(error = %e, "Unreadable last validation marker, running full validation");
                None
            }
        };
        if let Some(last) = last {
            if now.saturating_sub(last) < interval_ms {
                debug!(last, "Library validated recently, skipping background run");
                return Ok(None);
            }
        }

        let report = self.validate_all_downloads().await?;
        if report.corrupted_units > self.config.notify_threshold {
            let percent = report.corrupted_units as f64 / report.total_units as f64 * 100.0;
            self.notifier
                .notify_corruption(report.corrupted_units, report.total_units, percent);
            self.event_tx
                .send(Event::CorruptionThresholdExceeded {
                    corrupted: report.corrupted_units,
                    total: report.total_units,
                })
                .ok();
            return Ok(Some(AutoRepairSummary {
                report,
                ..Default::default()
            }));
        }

        Ok(Some(self.repair_report(report).await))
    }

    /// Run [`run_background_cycle`](Self::run_background_cycle) every
    /// `background_interval` until `token` is cancelled
    pub fn spawn_background(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let period = self.config.background_interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    run = self.run_background_cycle() => {
                        if let Err(e) = run {
                            warn!(error = %e, "Background validation failed");
                        }
                    }
                }
            }
            debug!("Background validation stopped");
        })
    }

    /// Quick-validate every unit as it completes and repair it if needed
    ///
    /// A unit still damaged right after a repair is left for manual
    /// inspection instead of being repaired again.
    pub fn spawn_verify_on_complete(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let mut events = self.event_tx.subscribe();
        tokio::spawn(async move {
            let mut repaired_once: HashSet<ItemId> = HashSet::new();

            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => event,
                };
                let item = match event {
                    Ok(Event::Completed { item }) if item.is_unit() => item,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Verify-on-complete lagged behind queue events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let result = match self
                    .validate_unit(&item.owner_id, &item.unit_key, ValidationOptions::quick())
                    .await
                {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(item_id = %item.id, error = %e, "Post-download validation failed");
                        continue;
                    }
                };

                if !result.recommended_action.is_auto_repairable() {
                    repaired_once.remove(&item.id);
                    continue;
                }
                if !repaired_once.insert(item.id.clone()) {
                    warn!(
                        item_id = %item.id,
                        score = result.integrity_score,
                        "Unit still damaged after repair, leaving for manual check"
                    );
                    repaired_once.remove(&item.id);
                    continue;
                }

                let manager = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = manager
                        .repair
                        .repair_corrupted_chapter(&item.owner_id, &item.unit_key, &result)
                        .await
                    {
                        warn!(item_id = %item.id, error = %e, "Post-download repair failed");
                    }
                });
            }
            debug!("Verify-on-complete stopped");
        })
    }
}

/// Result for a unit whose validation could not run at all
fn unchecked(owner_id: &str, unit_key: &str, reason: String) -> ValidationResult {
    ValidationResult {
        owner_id: owner_id.to_string(),
        unit_key: unit_key.to_string(),
        is_valid: false,
        integrity_score: 0,
        missing_pieces: BTreeSet::new(),
        corrupt_pieces: BTreeSet::new(),
        recommended_action: RecommendedAction::ManualCheck,
        warnings: vec![reason],
        total_pieces: 0,
    }
}
