//! Repository traits for the two layers
//!
//! The extraction log exposes no update or delete operation: entries are
//! immutable at the interface level. The Gold store writes with
//! compare-and-swap on `revision` so concurrent writers are detected.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    EntityId, EntityKind, ExtractionLogEntry, GoldEntity, LogId, NaturalKey, NewExtractionLog,
    NewGoldEntity, Result,
};

// ============================================================================
// Extraction Log (Bronze)
// ============================================================================

/// Search filter for extraction log entries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionLogFilter {
    pub entity_kind: Option<EntityKind>,
    pub source_document_id: Option<String>,
    pub pipeline_version: Option<String>,
    pub min_confidence: Option<f32>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for ExtractionLogFilter {
    fn default() -> Self {
        Self {
            entity_kind: None,
            source_document_id: None,
            pipeline_version: None,
            min_confidence: None,
            created_from: None,
            created_to: None,
            limit: 100,
            offset: 0,
        }
    }
}

impl ExtractionLogFilter {
    /// Filter to a single entity kind
    pub fn for_kind(kind: EntityKind) -> Self {
        Self {
            entity_kind: Some(kind),
            ..Default::default()
        }
    }

    /// Set page size
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Whether an entry passes every criterion (paging excluded)
    pub fn matches(&self, entry: &ExtractionLogEntry) -> bool {
        self.entity_kind.map_or(true, |k| entry.entity_kind == k)
            && self
                .source_document_id
                .as_ref()
                .map_or(true, |d| &entry.source_document_id == d)
            && self
                .pipeline_version
                .as_ref()
                .map_or(true, |v| entry.pipeline_version.as_ref() == Some(v))
            && self.min_confidence.map_or(true, |c| entry.confidence >= c)
            && self.created_from.map_or(true, |t| entry.created_at >= t)
            && self.created_to.map_or(true, |t| entry.created_at <= t)
    }
}

/// Append-only store of extraction attempts
#[async_trait]
pub trait ExtractionLogRepository: Send + Sync {
    /// Record one extraction attempt; assigns a monotonically increasing id
    async fn append(&self, new: NewExtractionLog) -> Result<ExtractionLogEntry>;

    /// Get an entry by id (`NotFound` if absent)
    async fn get(&self, id: LogId) -> Result<ExtractionLogEntry>;

    /// List entries matching the filter, ordered by id
    async fn list(&self, filter: &ExtractionLogFilter) -> Result<Vec<ExtractionLogEntry>>;

    /// Count entries matching the filter (paging ignored)
    async fn count(&self, filter: &ExtractionLogFilter) -> Result<u64>;
}

// ============================================================================
// Gold Entities
// ============================================================================

/// Curated entity store
#[async_trait]
pub trait GoldEntityRepository: Send + Sync {
    /// Get an entity by id (`NotFound` if absent)
    async fn get(&self, id: EntityId) -> Result<GoldEntity>;

    /// Exact natural-key lookup
    async fn find_by_key(&self, key: &NaturalKey) -> Result<Option<GoldEntity>>;

    /// Every entity whose key agrees with `key` at each supplied position
    async fn find_candidates(&self, key: &NaturalKey) -> Result<Vec<GoldEntity>>;

    /// Insert a new entity (`Conflict` if the natural key is taken)
    async fn insert(&self, new: NewGoldEntity) -> Result<GoldEntity>;

    /// Persist `entity` if its revision is still current (`Conflict` otherwise).
    /// Returns the stored entity with the bumped revision.
    async fn update(&self, entity: &GoldEntity) -> Result<GoldEntity>;

    /// List entities, optionally of one kind, ordered by id
    async fn list(&self, kind: Option<EntityKind>) -> Result<Vec<GoldEntity>>;
}

// ============================================================================
// Statistics
// ============================================================================

/// Extraction count for one day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub count: u64,
}

/// Aggregate view of the extraction log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionStatistics {
    pub total_count: u64,
    pub by_entity_kind: BTreeMap<String, u64>,
    pub by_pipeline_version: BTreeMap<String, u64>,
    pub average_confidence: Option<f32>,
    pub confidence_by_pipeline: BTreeMap<String, f32>,
    pub daily_counts: Vec<DailyCount>,
}

impl ExtractionStatistics {
    /// Summarise a set of entries; entries without a pipeline label count as "unknown"
    pub fn from_entries(entries: &[ExtractionLogEntry]) -> Self {
        let mut stats = Self {
            total_count: entries.len() as u64,
            ..Default::default()
        };
        let mut confidence_sums: BTreeMap<String, (f64, u64)> = BTreeMap::new();
        let mut daily: BTreeMap<NaiveDate, u64> = BTreeMap::new();
        let mut total_confidence = 0.0_f64;

        for entry in entries {
            *stats
                .by_entity_kind
                .entry(entry.entity_kind.as_str().to_string())
                .or_default() += 1;

            let pipeline = entry
                .pipeline_version
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            *stats.by_pipeline_version.entry(pipeline.clone()).or_default() += 1;

            let sum = confidence_sums.entry(pipeline).or_default();
            sum.0 += f64::from(entry.confidence);
            sum.1 += 1;
            total_confidence += f64::from(entry.confidence);

            *daily.entry(entry.created_at.date_naive()).or_default() += 1;
        }

        if !entries.is_empty() {
            stats.average_confidence = Some((total_confidence / entries.len() as f64) as f32);
        }
        stats.confidence_by_pipeline = confidence_sums
            .into_iter()
            .map(|(pipeline, (sum, n))| (pipeline, (sum / n as f64) as f32))
            .collect();
        stats.daily_counts = daily
            .into_iter()
            .map(|(date, count)| DailyCount { date, count })
            .collect();

        stats
    }
}
