//! Gold Core - Domain models, traits, and shared types
//!
//! This crate defines the core abstractions used throughout the ledger:
//! - Bronze layer: immutable extraction log entries
//! - Gold layer: curated entities with a manual verification lock
//! - Natural keys and their normalisation
//! - Typed entity variants and the `VerifiableEntity` capability
//! - Common error types
//! - Repository traits with in-memory and PostgreSQL stores
//! - Configuration management

pub mod config;
pub mod entities;
pub mod key;
pub mod memory;
pub mod postgres;
pub mod store;

pub use config::{
    AppConfig, ConfigError, DatabaseConfig, ExtractionConfig, ExtractionStrategy, LoggingConfig,
    ReconcilerConfig,
};
pub use entities::{
    ConferenceMember, ParliamentaryGroupMembership, RoleNameMapping, VerifiableEntity,
};
pub use key::{normalize_text, NaturalKey};
pub use memory::{InMemoryExtractionLog, InMemoryGoldStore};
pub use postgres::PgStore;
pub use store::{
    DailyCount, ExtractionLogFilter, ExtractionLogRepository, ExtractionStatistics,
    GoldEntityRepository,
};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Core error types for ledger operations
#[derive(Error, Debug)]
pub enum GoldError {
    /// Infrastructure failure; the whole operation is safe to retry
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Extraction output lacks the fields its natural key needs
    #[error("Malformed extraction: {0}")]
    MalformedExtraction(String),

    #[error("Ambiguous match for {key}: candidates {candidates:?}")]
    AmbiguousMatch {
        key: String,
        candidates: Vec<EntityId>,
    },

    /// Lost a race against another writer (revision or unique key)
    #[error("Concurrent modification: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GoldError {
    /// Whether blindly retrying the whole operation can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_) | Self::Conflict(_))
    }
}

pub type Result<T> = std::result::Result<T, GoldError>;

/// Identity of an extraction log entry (serial, monotonically increasing)
pub type LogId = i64;

/// Identity of a Gold entity
pub type EntityId = i64;

/// Field name to raw value, ordered so that comparisons and hashes are stable
pub type FieldMap = BTreeMap<String, serde_json::Value>;

// ============================================================================
// Entity Kinds
// ============================================================================

/// Gold entity types the ledger reconciles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    ConferenceMember,
    ParliamentaryGroupMembership,
    RoleNameMapping,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [
        Self::ConferenceMember,
        Self::ParliamentaryGroupMembership,
        Self::RoleNameMapping,
    ];

    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConferenceMember => "conference_member",
            Self::ParliamentaryGroupMembership => "parliamentary_group_membership",
            Self::RoleNameMapping => "role_name_mapping",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = GoldError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "conference_member" => Ok(Self::ConferenceMember),
            "parliamentary_group_membership" | "parliamentary_group_member" => {
                Ok(Self::ParliamentaryGroupMembership)
            }
            "role_name_mapping" => Ok(Self::RoleNameMapping),
            other => Err(GoldError::Validation(format!("unknown entity kind: {other}"))),
        }
    }
}

// ============================================================================
// Bronze Layer: Extraction Log
// ============================================================================

/// One extraction attempt, immutable once written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionLogEntry {
    pub id: LogId,

    /// Entity type the extraction describes
    pub entity_kind: EntityKind,

    /// Reference to the document the fields were extracted from
    pub source_document_id: String,

    /// Raw extraction output
    pub extracted_fields: FieldMap,

    /// Extraction confidence (0.0 - 1.0)
    pub confidence: f32,

    /// Label of the pipeline that produced this entry
    pub pipeline_version: Option<String>,

    pub model_name: Option<String>,
    pub token_count_input: Option<i32>,
    pub token_count_output: Option<i32>,
    pub processing_time_ms: Option<i32>,

    pub created_at: DateTime<Utc>,
}

/// Input for appending an entry to the extraction log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExtractionLog {
    pub entity_kind: EntityKind,
    pub source_document_id: String,
    pub extracted_fields: FieldMap,
    pub confidence: f32,
    #[serde(default)]
    pub pipeline_version: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub token_count_input: Option<i32>,
    #[serde(default)]
    pub token_count_output: Option<i32>,
    #[serde(default)]
    pub processing_time_ms: Option<i32>,
}

impl NewExtractionLog {
    /// Create a new log input
    pub fn new(
        entity_kind: EntityKind,
        source_document_id: impl Into<String>,
        extracted_fields: FieldMap,
        confidence: f32,
    ) -> Self {
        Self {
            entity_kind,
            source_document_id: source_document_id.into(),
            extracted_fields,
            confidence,
            pipeline_version: None,
            model_name: None,
            token_count_input: None,
            token_count_output: None,
            processing_time_ms: None,
        }
    }

    /// Set pipeline version label
    pub fn with_pipeline_version(mut self, version: impl Into<String>) -> Self {
        self.pipeline_version = Some(version.into());
        self
    }

    /// Set pipeline version label unless the record already carries one
    pub fn with_default_pipeline_version(mut self, version: &str) -> Self {
        if self.pipeline_version.is_none() {
            self.pipeline_version = Some(version.to_string());
        }
        self
    }

    /// Set model name
    pub fn with_model_name(mut self, model: impl Into<String>) -> Self {
        self.model_name = Some(model.into());
        self
    }

    /// Confidence clamped into `[0.0, 1.0]`; NaN counts as no confidence.
    pub fn normalized_confidence(&self) -> f32 {
        if self.confidence.is_nan() {
            0.0
        } else {
            self.confidence.clamp(0.0, 1.0)
        }
    }

    /// Materialise the immutable entry once the store has assigned an id
    pub fn into_entry(self, id: LogId, created_at: DateTime<Utc>) -> ExtractionLogEntry {
        let confidence = self.normalized_confidence();
        ExtractionLogEntry {
            id,
            entity_kind: self.entity_kind,
            source_document_id: self.source_document_id,
            extracted_fields: self.extracted_fields,
            confidence,
            pipeline_version: self.pipeline_version,
            model_name: self.model_name,
            token_count_input: self.token_count_input,
            token_count_output: self.token_count_output,
            processing_time_ms: self.processing_time_ms,
            created_at,
        }
    }
}

// ============================================================================
// Gold Layer: Curated Entities
// ============================================================================

/// Lifecycle of a Gold entity; entities are retired, never deleted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    #[default]
    Active,
    Retired,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Retired => "retired",
        }
    }
}

impl std::str::FromStr for LifecycleState {
    type Err = GoldError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "retired" => Ok(Self::Retired),
            other => Err(GoldError::Validation(format!("unknown lifecycle: {other}"))),
        }
    }
}

/// Curated entity representing one real-world fact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldEntity {
    pub id: EntityId,

    pub kind: EntityKind,

    /// Stable identity; unique across the store
    pub natural_key: NaturalKey,

    /// Current authoritative values
    pub fields: FieldMap,

    /// When set, only the manual override path may alter `fields`
    pub is_manually_verified: bool,

    /// Provenance pointer into the extraction log (informational only)
    pub latest_extraction_log_id: Option<LogId>,

    pub lifecycle: LifecycleState,

    /// Bumped on every persisted write; used for compare-and-swap
    pub revision: i64,

    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GoldEntity {
    /// Look up a field value as text
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_str())
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle == LifecycleState::Active
    }
}

impl VerifiableEntity for GoldEntity {
    fn is_manually_verified(&self) -> bool {
        self.is_manually_verified
    }

    fn latest_extraction_log_id(&self) -> Option<LogId> {
        self.latest_extraction_log_id
    }

    fn mark_as_manually_verified(&mut self) {
        if !self.is_manually_verified {
            self.is_manually_verified = true;
            self.verified_at = Some(Utc::now());
        }
    }

    fn update_from_extraction_log(&mut self, log_id: LogId) {
        self.latest_extraction_log_id = Some(log_id);
    }
}

/// Input for inserting a new Gold entity
#[derive(Debug, Clone)]
pub struct NewGoldEntity {
    pub natural_key: NaturalKey,
    pub fields: FieldMap,
    pub is_manually_verified: bool,
    pub latest_extraction_log_id: Option<LogId>,
}

impl NewGoldEntity {
    /// An entity created from an extraction log entry
    pub fn from_extraction(natural_key: NaturalKey, entry: &ExtractionLogEntry) -> Self {
        Self {
            natural_key,
            fields: entry.extracted_fields.clone(),
            is_manually_verified: false,
            latest_extraction_log_id: Some(entry.id),
        }
    }

    /// A hand-created entity with no extraction behind it
    pub fn manual(natural_key: NaturalKey, fields: FieldMap) -> Self {
        Self {
            natural_key,
            fields,
            is_manually_verified: true,
            latest_extraction_log_id: None,
        }
    }

    /// Materialise the entity once the store has assigned an id
    pub fn into_entity(self, id: EntityId, now: DateTime<Utc>) -> GoldEntity {
        GoldEntity {
            id,
            kind: self.natural_key.kind,
            natural_key: self.natural_key,
            fields: self.fields,
            is_manually_verified: self.is_manually_verified,
            latest_extraction_log_id: self.latest_extraction_log_id,
            lifecycle: LifecycleState::Active,
            revision: 0,
            verified_at: self.is_manually_verified.then_some(now),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Build a `FieldMap` from string pairs
pub fn field_map<K, V, I>(pairs: I) -> FieldMap
where
    K: Into<String>,
    V: Into<serde_json::Value>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
