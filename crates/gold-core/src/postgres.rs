//! PostgreSQL store
//!
//! Provides the extraction log and the Gold entity table using SQLx and
//! PostgreSQL. The log table refuses UPDATE and DELETE through a trigger;
//! the entity table carries a unique constraint over the natural key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;

use crate::store::{ExtractionLogFilter, ExtractionLogRepository, GoldEntityRepository};
use crate::{
    DatabaseConfig, EntityId, EntityKind, ExtractionLogEntry, FieldMap, GoldEntity, GoldError,
    LogId, NaturalKey, NewExtractionLog, NewGoldEntity, Result,
};

/// Schema for both layers; every statement is idempotent
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS extraction_logs (
        id BIGSERIAL PRIMARY KEY,
        entity_kind TEXT NOT NULL,
        source_document_id TEXT NOT NULL,
        extracted_fields JSONB NOT NULL,
        confidence REAL NOT NULL CHECK (confidence >= 0 AND confidence <= 1),
        pipeline_version TEXT,
        model_name TEXT,
        token_count_input INTEGER,
        token_count_output INTEGER,
        processing_time_ms INTEGER,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE OR REPLACE FUNCTION extraction_logs_immutable() RETURNS trigger AS $$
    BEGIN
        RAISE EXCEPTION 'extraction_logs is append-only';
    END;
    $$ LANGUAGE plpgsql
    "#,
    "DROP TRIGGER IF EXISTS extraction_logs_no_mutation ON extraction_logs",
    r#"
    CREATE TRIGGER extraction_logs_no_mutation
        BEFORE UPDATE OR DELETE ON extraction_logs
        FOR EACH ROW EXECUTE FUNCTION extraction_logs_immutable()
    "#,
    "REVOKE UPDATE, DELETE ON extraction_logs FROM PUBLIC",
    r#"
    CREATE TABLE IF NOT EXISTS gold_entities (
        id BIGSERIAL PRIMARY KEY,
        entity_kind TEXT NOT NULL,
        key_parts TEXT[] NOT NULL,
        fields JSONB NOT NULL,
        is_manually_verified BOOLEAN NOT NULL DEFAULT FALSE,
        latest_extraction_log_id BIGINT
            REFERENCES extraction_logs(id) ON DELETE SET NULL,
        lifecycle TEXT NOT NULL DEFAULT 'active',
        revision BIGINT NOT NULL DEFAULT 0,
        verified_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT gold_entities_natural_key UNIQUE (entity_kind, key_parts)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_gold_entities_lookup
        ON gold_entities (entity_kind, (key_parts[1]))
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_extraction_logs_kind
        ON extraction_logs (entity_kind, created_at)
    "#,
];

const ENTITY_COLUMNS: &str = "id, entity_kind, key_parts, fields, is_manually_verified, \
     latest_extraction_log_id, lifecycle, revision, verified_at, created_at, updated_at";

const LOG_COLUMNS: &str = "id, entity_kind, source_document_id, extracted_fields, confidence, \
     pipeline_version, model_name, token_count_input, token_count_output, processing_time_ms, \
     created_at";

/// PostgreSQL-backed store for both layers
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new store connection
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .connect(&config.postgres_url)
            .await
            .map_err(|e| {
                GoldError::StorageUnavailable(format!("PostgreSQL connection failed: {e}"))
            })?;

        Ok(Self { pool })
    }

    /// Create from an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables, trigger and indexes if missing
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| storage_error("apply schema", e))?;
        }
        tracing::info!("Ledger schema is up to date");
        Ok(())
    }
}

/// Map a driver error onto the ledger taxonomy
fn storage_error(action: &str, e: sqlx::Error) -> GoldError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            GoldError::Conflict(format!("Failed to {action}: {db}"))
        }
        _ => GoldError::StorageUnavailable(format!("Failed to {action}: {e}")),
    }
}

fn fields_from_json(value: serde_json::Value) -> Result<FieldMap> {
    serde_json::from_value(value)
        .map_err(|e| GoldError::StorageUnavailable(format!("Corrupt field map: {e}")))
}

fn fields_to_json(fields: &FieldMap) -> Result<serde_json::Value> {
    serde_json::to_value(fields).map_err(|e| GoldError::Other(e.into()))
}

/// Extraction log row from database
#[derive(Debug, FromRow)]
struct LogRow {
    id: i64,
    entity_kind: String,
    source_document_id: String,
    extracted_fields: serde_json::Value,
    confidence: f32,
    pipeline_version: Option<String>,
    model_name: Option<String>,
    token_count_input: Option<i32>,
    token_count_output: Option<i32>,
    processing_time_ms: Option<i32>,
    created_at: DateTime<Utc>,
}

impl TryFrom<LogRow> for ExtractionLogEntry {
    type Error = GoldError;

    fn try_from(row: LogRow) -> Result<Self> {
        Ok(ExtractionLogEntry {
            id: row.id,
            entity_kind: row.entity_kind.parse()?,
            source_document_id: row.source_document_id,
            extracted_fields: fields_from_json(row.extracted_fields)?,
            confidence: row.confidence,
            pipeline_version: row.pipeline_version,
            model_name: row.model_name,
            token_count_input: row.token_count_input,
            token_count_output: row.token_count_output,
            processing_time_ms: row.processing_time_ms,
            created_at: row.created_at,
        })
    }
}

/// Gold entity row from database
#[derive(Debug, FromRow)]
struct EntityRow {
    id: i64,
    entity_kind: String,
    key_parts: Vec<String>,
    fields: serde_json::Value,
    is_manually_verified: bool,
    latest_extraction_log_id: Option<i64>,
    lifecycle: String,
    revision: i64,
    verified_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EntityRow> for GoldEntity {
    type Error = GoldError;

    fn try_from(row: EntityRow) -> Result<Self> {
        let kind: EntityKind = row.entity_kind.parse()?;
        Ok(GoldEntity {
            id: row.id,
            kind,
            natural_key: NaturalKey::new(kind, row.key_parts),
            fields: fields_from_json(row.fields)?,
            is_manually_verified: row.is_manually_verified,
            latest_extraction_log_id: row.latest_extraction_log_id,
            lifecycle: row.lifecycle.parse()?,
            revision: row.revision,
            verified_at: row.verified_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl ExtractionLogRepository for PgStore {
    async fn append(&self, new: NewExtractionLog) -> Result<ExtractionLogEntry> {
        let confidence = new.normalized_confidence();
        let fields = fields_to_json(&new.extracted_fields)?;

        let row: LogRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO extraction_logs (
                entity_kind, source_document_id, extracted_fields, confidence,
                pipeline_version, model_name, token_count_input, token_count_output,
                processing_time_ms
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {LOG_COLUMNS}
            "#
        ))
        .bind(new.entity_kind.as_str())
        .bind(&new.source_document_id)
        .bind(&fields)
        .bind(confidence)
        .bind(&new.pipeline_version)
        .bind(&new.model_name)
        .bind(new.token_count_input)
        .bind(new.token_count_output)
        .bind(new.processing_time_ms)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| storage_error("append extraction log", e))?;

        row.try_into()
    }

    async fn get(&self, id: LogId) -> Result<ExtractionLogEntry> {
        let row: Option<LogRow> = sqlx::query_as(&format!(
            "SELECT {LOG_COLUMNS} FROM extraction_logs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("get extraction log", e))?;

        row.ok_or_else(|| GoldError::NotFound(format!("extraction log {id}")))?
            .try_into()
    }

    async fn list(&self, filter: &ExtractionLogFilter) -> Result<Vec<ExtractionLogEntry>> {
        let rows: Vec<LogRow> = sqlx::query_as(&format!(
            r#"
            SELECT {LOG_COLUMNS}
            FROM extraction_logs
            WHERE ($1::TEXT IS NULL OR entity_kind = $1)
              AND ($2::TEXT IS NULL OR source_document_id = $2)
              AND ($3::TEXT IS NULL OR pipeline_version = $3)
              AND ($4::REAL IS NULL OR confidence >= $4)
              AND ($5::TIMESTAMPTZ IS NULL OR created_at >= $5)
              AND ($6::TIMESTAMPTZ IS NULL OR created_at <= $6)
            ORDER BY id
            LIMIT $7 OFFSET $8
            "#
        ))
        .bind(filter.entity_kind.map(|k| k.as_str()))
        .bind(&filter.source_document_id)
        .bind(&filter.pipeline_version)
        .bind(filter.min_confidence)
        .bind(filter.created_from)
        .bind(filter.created_to)
        .bind(filter.limit as i64)
        .bind(filter.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("list extraction logs", e))?;

        rows.into_iter().map(ExtractionLogEntry::try_from).collect()
    }

    async fn count(&self, filter: &ExtractionLogFilter) -> Result<u64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM extraction_logs
            WHERE ($1::TEXT IS NULL OR entity_kind = $1)
              AND ($2::TEXT IS NULL OR source_document_id = $2)
              AND ($3::TEXT IS NULL OR pipeline_version = $3)
              AND ($4::REAL IS NULL OR confidence >= $4)
              AND ($5::TIMESTAMPTZ IS NULL OR created_at >= $5)
              AND ($6::TIMESTAMPTZ IS NULL OR created_at <= $6)
            "#,
        )
        .bind(filter.entity_kind.map(|k| k.as_str()))
        .bind(&filter.source_document_id)
        .bind(&filter.pipeline_version)
        .bind(filter.min_confidence)
        .bind(filter.created_from)
        .bind(filter.created_to)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| storage_error("count extraction logs", e))?;

        Ok(row.0.max(0) as u64)
    }
}

#[async_trait]
impl GoldEntityRepository for PgStore {
    async fn get(&self, id: EntityId) -> Result<GoldEntity> {
        let row: Option<EntityRow> = sqlx::query_as(&format!(
            "SELECT {ENTITY_COLUMNS} FROM gold_entities WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("get entity", e))?;

        row.ok_or_else(|| GoldError::NotFound(format!("entity {id}")))?
            .try_into()
    }

    async fn find_by_key(&self, key: &NaturalKey) -> Result<Option<GoldEntity>> {
        let row: Option<EntityRow> = sqlx::query_as(&format!(
            "SELECT {ENTITY_COLUMNS} FROM gold_entities WHERE entity_kind = $1 AND key_parts = $2"
        ))
        .bind(key.kind.as_str())
        .bind(&key.parts)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("find entity by key", e))?;

        row.map(GoldEntity::try_from).transpose()
    }

    async fn find_candidates(&self, key: &NaturalKey) -> Result<Vec<GoldEntity>> {
        // The first part is required for every kind, so it narrows via the index
        let first = key.parts.first().cloned().unwrap_or_default();
        let rows: Vec<EntityRow> = sqlx::query_as(&format!(
            r#"
            SELECT {ENTITY_COLUMNS}
            FROM gold_entities
            WHERE entity_kind = $1 AND key_parts[1] = $2
            ORDER BY id
            "#
        ))
        .bind(key.kind.as_str())
        .bind(&first)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("find candidate entities", e))?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let entity = GoldEntity::try_from(row)?;
            if key.loosely_matches(&entity.natural_key) {
                candidates.push(entity);
            }
        }
        Ok(candidates)
    }

    async fn insert(&self, new: NewGoldEntity) -> Result<GoldEntity> {
        let fields = fields_to_json(&new.fields)?;

        let row: EntityRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO gold_entities (
                entity_kind, key_parts, fields, is_manually_verified,
                latest_extraction_log_id, verified_at
            ) VALUES ($1, $2, $3, $4, $5, CASE WHEN $4 THEN NOW() END)
            RETURNING {ENTITY_COLUMNS}
            "#
        ))
        .bind(new.natural_key.kind.as_str())
        .bind(&new.natural_key.parts)
        .bind(&fields)
        .bind(new.is_manually_verified)
        .bind(new.latest_extraction_log_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| storage_error("insert entity", e))?;

        row.try_into()
    }

    async fn update(&self, entity: &GoldEntity) -> Result<GoldEntity> {
        let fields = fields_to_json(&entity.fields)?;

        let row: Option<EntityRow> = sqlx::query_as(&format!(
            r#"
            UPDATE gold_entities SET
                fields = $3,
                is_manually_verified = $4,
                latest_extraction_log_id = $5,
                lifecycle = $6,
                verified_at = $7,
                revision = revision + 1,
                updated_at = NOW()
            WHERE id = $1 AND revision = $2
            RETURNING {ENTITY_COLUMNS}
            "#
        ))
        .bind(entity.id)
        .bind(entity.revision)
        .bind(&fields)
        .bind(entity.is_manually_verified)
        .bind(entity.latest_extraction_log_id)
        .bind(entity.lifecycle.as_str())
        .bind(entity.verified_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("update entity", e))?;

        match row {
            Some(row) => row.try_into(),
            None => {
                // Distinguish a missing row from a lost race
                GoldEntityRepository::get(self, entity.id).await?;
                Err(GoldError::Conflict(format!(
                    "entity {} changed since revision {}",
                    entity.id, entity.revision
                )))
            }
        }
    }

    async fn list(&self, kind: Option<EntityKind>) -> Result<Vec<GoldEntity>> {
        let rows: Vec<EntityRow> = sqlx::query_as(&format!(
            r#"
            SELECT {ENTITY_COLUMNS}
            FROM gold_entities
            WHERE ($1::TEXT IS NULL OR entity_kind = $1)
            ORDER BY id
            "#
        ))
        .bind(kind.map(|k| k.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("list entities", e))?;

        rows.into_iter().map(GoldEntity::try_from).collect()
    }
}
