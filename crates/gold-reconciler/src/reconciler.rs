//! Reconciler
//!
//! Turns one extraction log entry into a Gold entity write:
//! derive key → resolve identity → ask the guard → create, overwrite or skip.
//! Every step for one key runs under that key's exclusion scope, and each
//! run is idempotent with respect to the log entry.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use gold_core::{
    EntityId, ExtractionLogEntry, ExtractionLogRepository, GoldEntity, GoldEntityRepository,
    GoldError, LogId, NaturalKey, NewGoldEntity, Result, VerifiableEntity,
};

use crate::guard::{Decision, VerificationGuard};
use crate::identity::{derive_entry_key, IdentityResolver};
use crate::locks::KeyLocks;
use crate::manual::ManualOverride;

/// Why a reconciliation left the Gold layer untouched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// The entity is locked by a human; the log entry is kept regardless
    ManuallyVerified { entity_id: EntityId },
    /// Several entities plausibly match; left for manual resolution
    Ambiguous { candidates: Vec<EntityId> },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ManuallyVerified { .. } => write!(f, "manually_verified"),
            Self::Ambiguous { .. } => write!(f, "ambiguous"),
        }
    }
}

/// Outcome of reconciling one log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ReconciliationResult {
    Created(GoldEntity),
    Updated(GoldEntity),
    Skipped(SkipReason),
}

impl ReconciliationResult {
    /// The entity written (or already reflecting the entry), if any
    pub fn entity(&self) -> Option<&GoldEntity> {
        match self {
            Self::Created(e) | Self::Updated(e) => Some(e),
            Self::Skipped(_) => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }
}

/// Orchestrates Bronze → Gold reconciliation
pub struct Reconciler {
    log: Arc<dyn ExtractionLogRepository>,
    gold: Arc<dyn GoldEntityRepository>,
    resolver: IdentityResolver,
    guard: VerificationGuard,
    locks: Arc<KeyLocks>,
}

impl Reconciler {
    /// Create a reconciler with its own exclusion registry
    pub fn new(log: Arc<dyn ExtractionLogRepository>, gold: Arc<dyn GoldEntityRepository>) -> Self {
        Self::with_locks(log, gold, Arc::new(KeyLocks::new()))
    }

    /// Create a reconciler sharing an exclusion registry with other writers
    pub fn with_locks(
        log: Arc<dyn ExtractionLogRepository>,
        gold: Arc<dyn GoldEntityRepository>,
        locks: Arc<KeyLocks>,
    ) -> Self {
        Self {
            resolver: IdentityResolver::new(Arc::clone(&gold)),
            guard: VerificationGuard::new(),
            log,
            gold,
            locks,
        }
    }

    /// Manual override API sharing this reconciler's store and exclusion
    pub fn manual_override(&self) -> ManualOverride {
        ManualOverride::new(Arc::clone(&self.gold), Arc::clone(&self.locks))
    }

    pub fn log_store(&self) -> &Arc<dyn ExtractionLogRepository> {
        &self.log
    }

    pub fn gold_store(&self) -> &Arc<dyn GoldEntityRepository> {
        &self.gold
    }

    /// Reconcile one log entry.
    ///
    /// The entry is re-read from the log store so provenance always points
    /// at a stored record (`NotFound` otherwise).
    pub async fn reconcile(&self, entry: &ExtractionLogEntry) -> Result<ReconciliationResult> {
        let stored = self.log.get(entry.id).await?;
        self.reconcile_stored(&stored).await
    }

    /// Reconcile the log entry with the given id
    pub async fn reconcile_by_id(&self, log_id: LogId) -> Result<ReconciliationResult> {
        let stored = self.log.get(log_id).await?;
        self.reconcile_stored(&stored).await
    }

    async fn reconcile_stored(&self, entry: &ExtractionLogEntry) -> Result<ReconciliationResult> {
        let key = derive_entry_key(entry)?;
        let _scope = self.locks.acquire(&key.lock_scope()).await;

        let existing = match self.resolver.resolve(&key).await {
            Ok(existing) => existing,
            Err(GoldError::AmbiguousMatch { candidates, .. }) => {
                warn!(
                    log_id = entry.id,
                    key = %key,
                    ?candidates,
                    "Ambiguous natural key, leaving for manual resolution"
                );
                return Ok(ReconciliationResult::Skipped(SkipReason::Ambiguous {
                    candidates,
                }));
            }
            Err(e) => return Err(e),
        };

        let decision = self.guard.authorize(existing.as_ref(), entry.confidence);
        match (decision, existing) {
            (Decision::Create, _) => self.create(key, entry).await,
            (Decision::Overwrite, Some(entity)) => self.overwrite(entity, entry).await,
            (Decision::Reject, Some(entity)) => {
                info!(
                    log_id = entry.id,
                    entity_id = entity.id,
                    "Entity is manually verified, extraction kept in log only"
                );
                Ok(ReconciliationResult::Skipped(SkipReason::ManuallyVerified {
                    entity_id: entity.id,
                }))
            }
            (decision, None) => Err(GoldError::Other(anyhow::anyhow!(
                "guard decided {decision} without an entity for {key}"
            ))),
        }
    }

    async fn create(
        &self,
        key: NaturalKey,
        entry: &ExtractionLogEntry,
    ) -> Result<ReconciliationResult> {
        let created = self
            .gold
            .insert(NewGoldEntity::from_extraction(key, entry))
            .await?;

        info!(
            log_id = entry.id,
            entity_id = created.id,
            kind = %created.kind,
            "Created gold entity"
        );
        Ok(ReconciliationResult::Created(created))
    }

    async fn overwrite(
        &self,
        mut entity: GoldEntity,
        entry: &ExtractionLogEntry,
    ) -> Result<ReconciliationResult> {
        if entity.latest_extraction_log_id == Some(entry.id)
            && entity.fields == entry.extracted_fields
        {
            debug!(
                log_id = entry.id,
                entity_id = entity.id,
                "Entity already reflects this extraction"
            );
            return Ok(ReconciliationResult::Updated(entity));
        }

        // Full replace: values from different runs are never mixed
        entity.fields = entry.extracted_fields.clone();
        entity.update_from_extraction_log(entry.id);
        let saved = self.gold.update(&entity).await?;

        info!(
            log_id = entry.id,
            entity_id = saved.id,
            revision = saved.revision,
            "Updated gold entity from extraction"
        );
        Ok(ReconciliationResult::Updated(saved))
    }
}
