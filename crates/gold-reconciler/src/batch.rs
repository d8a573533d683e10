//! Batch reconciliation
//!
//! Works through a backlog of log entries with bounded concurrency. Entries
//! are grouped by key scope: each group runs one entry at a time in log
//! order, so the newest extraction for a key is the one left in Gold, while
//! different scopes run in parallel.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use gold_core::{EntityId, ExtractionLogFilter, GoldError, LogId, NewExtractionLog, Result};

use crate::identity::derive_entry_key;
use crate::reconciler::{ReconciliationResult, Reconciler, SkipReason};

// ============================================================================
// Statistics
// ============================================================================

/// Outcome counts for a reconciliation run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationStats {
    /// Log entries attempted
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    /// Blocked by a manual lock
    pub skipped_verified: usize,
    /// Left for manual identity resolution
    pub skipped_ambiguous: usize,
    pub malformed: usize,
    /// Storage, conflict or lookup errors
    pub failed: usize,
}

impl ReconciliationStats {
    /// Record one successful reconciliation
    pub fn record(&mut self, result: &ReconciliationResult) {
        self.total += 1;
        match result {
            ReconciliationResult::Created(_) => self.created += 1,
            ReconciliationResult::Updated(_) => self.updated += 1,
            ReconciliationResult::Skipped(SkipReason::ManuallyVerified { .. }) => {
                self.skipped_verified += 1
            }
            ReconciliationResult::Skipped(SkipReason::Ambiguous { .. }) => {
                self.skipped_ambiguous += 1
            }
        }
    }

    /// Record one failed reconciliation
    pub fn record_error(&mut self, error: &GoldError) {
        self.total += 1;
        match error {
            GoldError::MalformedExtraction(_) => self.malformed += 1,
            _ => self.failed += 1,
        }
    }

    /// Entries that reached the Gold layer
    pub fn applied(&self) -> usize {
        self.created + self.updated
    }

    pub fn skipped(&self) -> usize {
        self.skipped_verified + self.skipped_ambiguous
    }

    fn rate(&self, n: usize) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            n as f32 / self.total as f32
        }
    }

    /// Share of entries that created a new entity
    pub fn creation_rate(&self) -> f32 {
        self.rate(self.created)
    }

    /// Share of entries that refreshed an existing entity
    pub fn update_rate(&self) -> f32 {
        self.rate(self.updated)
    }

    /// Share of entries that left Gold untouched
    pub fn skip_rate(&self) -> f32 {
        self.rate(self.skipped())
    }

    /// Merge counts from another run
    pub fn merge(&mut self, other: &ReconciliationStats) {
        self.total += other.total;
        self.created += other.created;
        self.updated += other.updated;
        self.skipped_verified += other.skipped_verified;
        self.skipped_ambiguous += other.skipped_ambiguous;
        self.malformed += other.malformed;
        self.failed += other.failed;
    }
}

// ============================================================================
// Report
// ============================================================================

/// A log entry the batch could not apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub log_id: LogId,
    pub error: String,
    /// Whether re-running this entry later may succeed
    pub retryable: bool,
}

/// A log entry whose key matched several entities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbiguousEntry {
    pub log_id: LogId,
    pub candidates: Vec<EntityId>,
}

/// Submitted records that never reached the extraction log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendFailure {
    /// Position of the first record not appended; it and all later ones are missing
    pub index: usize,
    pub remaining: usize,
    pub error: String,
    pub retryable: bool,
}

/// Result of a batch run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub stats: ReconciliationStats,
    pub ambiguous: Vec<AmbiguousEntry>,
    pub malformed: Vec<BatchFailure>,
    pub failed: Vec<BatchFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unappended: Option<AppendFailure>,
}

impl BatchReport {
    /// Fold one entry's outcome into the report
    pub fn record(&mut self, log_id: LogId, outcome: &Result<ReconciliationResult>) {
        match outcome {
            Ok(result) => {
                self.stats.record(result);
                if let ReconciliationResult::Skipped(SkipReason::Ambiguous { candidates }) = result
                {
                    self.ambiguous.push(AmbiguousEntry {
                        log_id,
                        candidates: candidates.clone(),
                    });
                }
            }
            Err(error) => {
                self.stats.record_error(error);
                let failure = BatchFailure {
                    log_id,
                    error: error.to_string(),
                    retryable: error.is_retryable(),
                };
                if matches!(error, GoldError::MalformedExtraction(_)) {
                    self.malformed.push(failure);
                } else {
                    self.failed.push(failure);
                }
            }
        }
    }

    /// Log ids worth submitting again
    pub fn retryable_ids(&self) -> Vec<LogId> {
        self.failed
            .iter()
            .filter(|f| f.retryable)
            .map(|f| f.log_id)
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.malformed.is_empty() && self.failed.is_empty() && self.unappended.is_none()
    }

    fn sort(&mut self) {
        self.ambiguous.sort_by_key(|a| a.log_id);
        self.malformed.sort_by_key(|f| f.log_id);
        self.failed.sort_by_key(|f| f.log_id);
    }
}

// ============================================================================
// Worker pool
// ============================================================================

type Outcome = (LogId, Result<ReconciliationResult>);

/// Reconciles many log entries with bounded concurrency
pub struct BatchReconciler {
    reconciler: Arc<Reconciler>,
    workers: usize,
}

impl BatchReconciler {
    pub fn new(reconciler: Arc<Reconciler>, workers: usize) -> Self {
        Self {
            reconciler,
            workers: workers.max(1),
        }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Reconcile the given log entries.
    ///
    /// A bad entry never aborts the batch; errors are collected in the report
    /// and nothing is retried here.
    pub async fn run(&self, log_ids: Vec<LogId>) -> BatchReport {
        let (groups, mut outcomes) = self.group_by_scope(log_ids).await;

        let reconciler = &self.reconciler;
        let applied: Vec<Vec<Outcome>> = stream::iter(groups)
            .map(|ids| async move {
                let mut outcomes = Vec::with_capacity(ids.len());
                for log_id in ids {
                    outcomes.push((log_id, reconciler.reconcile_by_id(log_id).await));
                }
                outcomes
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;
        outcomes.extend(applied.into_iter().flatten());

        let mut report = BatchReport::default();
        for (log_id, outcome) in &outcomes {
            match outcome {
                Err(GoldError::MalformedExtraction(reason)) => {
                    warn!(log_id, %reason, "Skipping malformed extraction");
                }
                Err(error) => {
                    warn!(log_id, %error, retryable = error.is_retryable(), "Reconciliation failed");
                }
                Ok(_) => {}
            }
            report.record(*log_id, outcome);
        }
        report.sort();

        info!(
            total = report.stats.total,
            created = report.stats.created,
            updated = report.stats.updated,
            skipped = report.stats.skipped(),
            malformed = report.stats.malformed,
            failed = report.stats.failed,
            "Batch reconciliation finished"
        );
        report
    }

    /// Split log ids into per-scope groups in ascending log order.
    ///
    /// Entries that cannot be read or keyed never reach a group; their
    /// errors are returned as finished outcomes.
    async fn group_by_scope(&self, log_ids: Vec<LogId>) -> (Vec<Vec<LogId>>, Vec<Outcome>) {
        let log = self.reconciler.log_store();
        let scopes: Vec<(LogId, Result<String>)> = stream::iter(log_ids)
            .map(|log_id| async move {
                let scope = log
                    .get(log_id)
                    .await
                    .and_then(|entry| derive_entry_key(&entry))
                    .map(|key| key.lock_scope());
                (log_id, scope)
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        let mut groups: BTreeMap<String, Vec<LogId>> = BTreeMap::new();
        let mut finished = Vec::new();
        for (log_id, scope) in scopes {
            match scope {
                Ok(scope) => groups.entry(scope).or_default().push(log_id),
                Err(error) => finished.push((log_id, Err(error))),
            }
        }

        let groups = groups
            .into_values()
            .map(|mut ids| {
                ids.sort_unstable();
                ids
            })
            .collect();
        (groups, finished)
    }

    /// Append records to the extraction log, then reconcile them.
    ///
    /// Appending stops at the first storage error. Records appended before it
    /// are still reconciled, and the report's `unappended` names where the
    /// caller has to resume.
    pub async fn submit(&self, logs: Vec<NewExtractionLog>) -> BatchReport {
        let store = self.reconciler.log_store();
        let total = logs.len();
        let mut ids: Vec<LogId> = Vec::with_capacity(total);
        let mut unappended = None;

        for (index, log) in logs.into_iter().enumerate() {
            match store.append(log).await {
                Ok(entry) => ids.push(entry.id),
                Err(error) => {
                    warn!(index, remaining = total - index, %error, "Appending extraction records stopped");
                    unappended = Some(AppendFailure {
                        index,
                        remaining: total - index,
                        error: error.to_string(),
                        retryable: error.is_retryable(),
                    });
                    break;
                }
            }
        }

        let mut report = self.run(ids).await;
        report.unappended = unappended;
        report
    }

    /// Reconcile every log entry matching `filter`
    pub async fn run_matching(&self, filter: &ExtractionLogFilter) -> Result<BatchReport> {
        let entries = self.reconciler.log_store().list(filter).await?;
        Ok(self.run(entries.iter().map(|e| e.id).collect()).await)
    }
}
