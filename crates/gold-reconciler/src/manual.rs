//! Manual override API
//!
//! The human-facing path into the Gold layer. Every operation here takes the
//! same per-key exclusion as the reconciler, so a manual lock can never be
//! lost to an automated write that read the entity before the lock landed.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use gold_core::{
    EntityId, FieldMap, GoldEntity, GoldEntityRepository, GoldError, LifecycleState, NaturalKey,
    NewGoldEntity, Result, VerifiableEntity,
};

use crate::identity::ensure_edit_keeps_key;
use crate::locks::KeyLocks;

/// Human operations on Gold entities
pub struct ManualOverride {
    gold: Arc<dyn GoldEntityRepository>,
    locks: Arc<KeyLocks>,
}

impl ManualOverride {
    pub fn new(gold: Arc<dyn GoldEntityRepository>, locks: Arc<KeyLocks>) -> Self {
        Self { gold, locks }
    }

    /// Lock an entity against automated writes without touching its fields
    pub async fn mark_verified(&self, id: EntityId) -> Result<GoldEntity> {
        let entity = self
            .locked_update(id, |entity| {
                if entity.is_manually_verified {
                    return Ok(false);
                }
                entity.mark_as_manually_verified();
                Ok(true)
            })
            .await?;

        info!(entity_id = id, "Entity marked as manually verified");
        Ok(entity)
    }

    /// Apply human corrections and lock the entity.
    ///
    /// A `null` value removes the field; any other value replaces it. Edits
    /// that would make the fields disagree with the natural key are rejected
    /// with `Validation` and nothing is written.
    pub async fn apply_manual_edit(&self, id: EntityId, edits: FieldMap) -> Result<GoldEntity> {
        let edited = edits.len();
        let entity = self
            .locked_update(id, move |entity| {
                let before = entity.fields.clone();
                let mut changed = false;
                for (name, value) in edits {
                    changed |= if value.is_null() {
                        entity.fields.remove(&name).is_some()
                    } else {
                        entity.fields.insert(name, value.clone()) != Some(value)
                    };
                }
                ensure_edit_keeps_key(&entity.natural_key, &before, &entity.fields)?;
                if !entity.is_manually_verified {
                    entity.mark_as_manually_verified();
                    changed = true;
                }
                Ok(changed)
            })
            .await?;

        info!(entity_id = id, fields = edited, "Manual edit applied");
        Ok(entity)
    }

    /// Hand an entity back to automated control.
    ///
    /// Nothing is re-reconciled here; the next extraction for the key will
    /// overwrite it.
    pub async fn release_to_automation(&self, id: EntityId) -> Result<GoldEntity> {
        let entity = self
            .locked_update(id, |entity| {
                if !entity.is_manually_verified {
                    return Ok(false);
                }
                entity.is_manually_verified = false;
                entity.verified_at = None;
                Ok(true)
            })
            .await?;

        info!(entity_id = id, "Entity released to automation");
        Ok(entity)
    }

    /// Mark an entity as no longer current.
    ///
    /// Retiring is a human decision, so it also locks the entity: a later
    /// extraction must not silently bring it back.
    pub async fn retire(&self, id: EntityId) -> Result<GoldEntity> {
        let entity = self
            .locked_update(id, |entity| {
                let mut changed = false;
                if entity.lifecycle != LifecycleState::Retired {
                    entity.lifecycle = LifecycleState::Retired;
                    changed = true;
                }
                if !entity.is_manually_verified {
                    entity.mark_as_manually_verified();
                    changed = true;
                }
                Ok(changed)
            })
            .await?;

        info!(entity_id = id, "Entity retired");
        Ok(entity)
    }

    /// Return a retired entity to the active set; it stays verified
    pub async fn reinstate(&self, id: EntityId) -> Result<GoldEntity> {
        let entity = self
            .locked_update(id, |entity| {
                if entity.lifecycle == LifecycleState::Active {
                    return Ok(false);
                }
                entity.lifecycle = LifecycleState::Active;
                Ok(true)
            })
            .await?;

        info!(entity_id = id, "Entity reinstated");
        Ok(entity)
    }

    /// Create an entity by hand; it starts out verified with no provenance
    pub async fn create_entity(&self, key: NaturalKey, fields: FieldMap) -> Result<GoldEntity> {
        if key.is_partial() {
            return Err(GoldError::Validation(format!(
                "hand-created entities need a complete key, got {key}"
            )));
        }

        let _scope = self.locks.acquire(&key.lock_scope()).await;
        if let Some(existing) = self.gold.find_by_key(&key).await? {
            return Err(GoldError::Conflict(format!(
                "{key} already exists as entity {}",
                existing.id
            )));
        }

        let created = self.gold.insert(NewGoldEntity::manual(key, fields)).await?;
        info!(entity_id = created.id, kind = %created.kind, "Entity created manually");
        Ok(created)
    }

    /// Read-modify-write under the entity's key scope.
    ///
    /// `mutate` reports whether anything changed; unchanged entities are
    /// returned without a write.
    async fn locked_update<F>(&self, id: EntityId, mutate: F) -> Result<GoldEntity>
    where
        F: FnOnce(&mut GoldEntity) -> Result<bool>,
    {
        let scope = self.gold.get(id).await?.natural_key.lock_scope();
        let _scope = self.locks.acquire(&scope).await;

        // Re-read under the lock; the first read only located the scope
        let mut entity = self.gold.get(id).await?;
        if !mutate(&mut entity)? {
            debug!(entity_id = id, "Manual operation was a no-op");
            return Ok(entity);
        }

        if entity.is_manually_verified && entity.verified_at.is_none() {
            entity.verified_at = Some(Utc::now());
        }
        self.gold.update(&entity).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gold_core::{field_map, EntityKind, InMemoryGoldStore};
    use serde_json::json;

    fn key() -> NaturalKey {
        NaturalKey::new(
            EntityKind::ConferenceMember,
            vec![
                "yamada taro".into(),
                "budget committee".into(),
                "203rd".into(),
            ],
        )
    }

    async fn setup() -> (ManualOverride, GoldEntity) {
        let gold = Arc::new(InMemoryGoldStore::new());
        let entity = gold
            .insert(NewGoldEntity {
                natural_key: key(),
                fields: field_map([
                    ("person", "Yamada Taro"),
                    ("conference", "Budget Committee"),
                    ("term", "203rd"),
                    ("role", "Member"),
                    ("note", "from minutes"),
                ]),
                is_manually_verified: false,
                latest_extraction_log_id: Some(1),
            })
            .await
            .unwrap();
        (ManualOverride::new(gold, Arc::new(KeyLocks::new())), entity)
    }

    #[tokio::test]
    async fn test_mark_verified_sets_timestamp_once() {
        let (manual, entity) = setup().await;

        let verified = manual.mark_verified(entity.id).await.unwrap();
        assert!(verified.is_manually_verified);
        assert!(verified.verified_at.is_some());
        assert_eq!(verified.fields, entity.fields);

        let again = manual.mark_verified(entity.id).await.unwrap();
        assert_eq!(again.revision, verified.revision);
        assert_eq!(again.verified_at, verified.verified_at);
    }

    #[tokio::test]
    async fn test_manual_edit_sets_and_removes_fields() {
        let (manual, entity) = setup().await;

        let edited = manual
            .apply_manual_edit(
                entity.id,
                field_map([("role", json!("Chair")), ("note", serde_json::Value::Null)]),
            )
            .await
            .unwrap();

        assert_eq!(edited.field_str("role"), Some("Chair"));
        assert!(!edited.fields.contains_key("note"));
        assert!(edited.is_manually_verified);
        assert_eq!(edited.natural_key, entity.natural_key);
        // Provenance is left alone
        assert_eq!(edited.latest_extraction_log_id, Some(1));
    }

    #[tokio::test]
    async fn test_manual_edit_cannot_break_the_key() {
        let (manual, entity) = setup().await;

        for edits in [
            field_map([("person", serde_json::Value::Null)]),
            field_map([("conference", json!("Rules Committee"))]),
            field_map([("role", json!("Chair")), ("term", json!("204th"))]),
        ] {
            let result = manual.apply_manual_edit(entity.id, edits).await;
            assert!(matches!(result, Err(GoldError::Validation(_))));
        }

        // Nothing was written, not even the lock
        let stored = manual.gold.get(entity.id).await.unwrap();
        assert_eq!(stored, entity);

        // Rewriting a key field in another spelling is fine
        let respelled = manual
            .apply_manual_edit(entity.id, field_map([("person", json!("YAMADA  Taro"))]))
            .await
            .unwrap();
        assert_eq!(respelled.field_str("person"), Some("YAMADA  Taro"));
        assert!(respelled.is_manually_verified);
    }

    #[tokio::test]
    async fn test_release_clears_lock() {
        let (manual, entity) = setup().await;
        manual.mark_verified(entity.id).await.unwrap();

        let released = manual.release_to_automation(entity.id).await.unwrap();
        assert!(!released.is_manually_verified);
        assert!(released.verified_at.is_none());
        assert!(released.can_be_updated_by_ai());
    }

    #[tokio::test]
    async fn test_retire_and_reinstate() {
        let (manual, entity) = setup().await;

        let retired = manual.retire(entity.id).await.unwrap();
        assert_eq!(retired.lifecycle, LifecycleState::Retired);
        assert!(retired.is_manually_verified);

        let active = manual.reinstate(entity.id).await.unwrap();
        assert!(active.is_active());
        assert!(active.is_manually_verified);
    }

    #[tokio::test]
    async fn test_unknown_entity_is_not_found() {
        let (manual, _) = setup().await;
        assert!(matches!(
            manual.mark_verified(42).await,
            Err(GoldError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_entity() {
        let (manual, _) = setup().await;

        let duplicate = manual.create_entity(key(), FieldMap::new()).await;
        assert!(matches!(duplicate, Err(GoldError::Conflict(_))));

        let partial = NaturalKey::new(
            EntityKind::ConferenceMember,
            vec!["suzuki hanako".into(), "budget committee".into(), String::new()],
        );
        assert!(matches!(
            manual.create_entity(partial, FieldMap::new()).await,
            Err(GoldError::Validation(_))
        ));

        let fresh = NaturalKey::new(
            EntityKind::ConferenceMember,
            vec![
                "suzuki hanako".into(),
                "budget committee".into(),
                "203rd".into(),
            ],
        );
        let created = manual
            .create_entity(fresh, field_map([("person", "Suzuki Hanako")]))
            .await
            .unwrap();
        assert!(created.is_manually_verified);
        assert_eq!(created.latest_extraction_log_id, None);
    }
}
