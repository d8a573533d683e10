//! In-memory stores
//!
//! Process-local implementations of both repositories. They follow the same
//! contracts as the PostgreSQL store (serial ids, unique natural keys,
//! revision compare-and-swap) and can simulate an outage so callers'
//! `StorageUnavailable` handling can be exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::store::{ExtractionLogFilter, ExtractionLogRepository, GoldEntityRepository};
use crate::{
    EntityId, EntityKind, ExtractionLogEntry, GoldEntity, GoldError, LogId, NaturalKey,
    NewExtractionLog, NewGoldEntity, Result,
};

/// Position of a serial id in a row vector; ids start at 1
fn row_index(id: i64) -> Option<usize> {
    id.checked_sub(1).and_then(|idx| usize::try_from(idx).ok())
}

fn check_available(flag: &AtomicBool, store: &str) -> Result<()> {
    if flag.load(Ordering::SeqCst) {
        Err(GoldError::StorageUnavailable(format!("{store} is offline")))
    } else {
        Ok(())
    }
}

// ============================================================================
// Extraction Log
// ============================================================================

/// Append-only in-memory extraction log
#[derive(Debug, Default)]
pub struct InMemoryExtractionLog {
    entries: RwLock<Vec<ExtractionLogEntry>>,
    offline: AtomicBool,
}

impl InMemoryExtractionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store going down (or coming back)
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExtractionLogRepository for InMemoryExtractionLog {
    async fn append(&self, new: NewExtractionLog) -> Result<ExtractionLogEntry> {
        check_available(&self.offline, "extraction log")?;

        let mut entries = self.entries.write().await;
        // Ids start at 1 and follow insertion order, like a serial column
        let id = entries.len() as LogId + 1;
        let entry = new.into_entry(id, Utc::now());
        entries.push(entry.clone());
        Ok(entry)
    }

    async fn get(&self, id: LogId) -> Result<ExtractionLogEntry> {
        check_available(&self.offline, "extraction log")?;

        let entries = self.entries.read().await;
        row_index(id)
            .and_then(|idx| entries.get(idx))
            .cloned()
            .ok_or_else(|| GoldError::NotFound(format!("extraction log {id}")))
    }

    async fn list(&self, filter: &ExtractionLogFilter) -> Result<Vec<ExtractionLogEntry>> {
        check_available(&self.offline, "extraction log")?;

        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|e| filter.matches(e))
            .skip(filter.offset)
            .take(filter.limit)
            .cloned()
            .collect())
    }

    async fn count(&self, filter: &ExtractionLogFilter) -> Result<u64> {
        check_available(&self.offline, "extraction log")?;

        let entries = self.entries.read().await;
        Ok(entries.iter().filter(|e| filter.matches(e)).count() as u64)
    }
}

// ============================================================================
// Gold Entities
// ============================================================================

#[derive(Debug, Default)]
struct GoldTables {
    rows: Vec<GoldEntity>,
    by_key: HashMap<NaturalKey, usize>,
}

/// In-memory curated entity store
#[derive(Debug, Default)]
pub struct InMemoryGoldStore {
    tables: RwLock<GoldTables>,
    offline: AtomicBool,
}

impl InMemoryGoldStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store going down (or coming back)
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl GoldEntityRepository for InMemoryGoldStore {
    async fn get(&self, id: EntityId) -> Result<GoldEntity> {
        check_available(&self.offline, "gold store")?;

        let tables = self.tables.read().await;
        row_index(id)
            .and_then(|idx| tables.rows.get(idx))
            .cloned()
            .ok_or_else(|| GoldError::NotFound(format!("entity {id}")))
    }

    async fn find_by_key(&self, key: &NaturalKey) -> Result<Option<GoldEntity>> {
        check_available(&self.offline, "gold store")?;

        let tables = self.tables.read().await;
        Ok(tables.by_key.get(key).map(|&idx| tables.rows[idx].clone()))
    }

    async fn find_candidates(&self, key: &NaturalKey) -> Result<Vec<GoldEntity>> {
        check_available(&self.offline, "gold store")?;

        let tables = self.tables.read().await;
        Ok(tables
            .rows
            .iter()
            .filter(|e| key.loosely_matches(&e.natural_key))
            .cloned()
            .collect())
    }

    async fn insert(&self, new: NewGoldEntity) -> Result<GoldEntity> {
        check_available(&self.offline, "gold store")?;

        let mut tables = self.tables.write().await;
        if tables.by_key.contains_key(&new.natural_key) {
            return Err(GoldError::Conflict(format!(
                "natural key {} already exists",
                new.natural_key
            )));
        }

        let idx = tables.rows.len();
        let entity = new.into_entity(idx as EntityId + 1, Utc::now());
        tables.by_key.insert(entity.natural_key.clone(), idx);
        tables.rows.push(entity.clone());
        Ok(entity)
    }

    async fn update(&self, entity: &GoldEntity) -> Result<GoldEntity> {
        check_available(&self.offline, "gold store")?;

        let mut tables = self.tables.write().await;
        let stored = row_index(entity.id)
            .and_then(|idx| tables.rows.get_mut(idx))
            .ok_or_else(|| GoldError::NotFound(format!("entity {}", entity.id)))?;

        if stored.revision != entity.revision {
            return Err(GoldError::Conflict(format!(
                "entity {} is at revision {}, write was based on {}",
                entity.id, stored.revision, entity.revision
            )));
        }
        if stored.natural_key != entity.natural_key {
            return Err(GoldError::Validation(format!(
                "natural key of entity {} cannot change",
                entity.id
            )));
        }

        let mut next = entity.clone();
        next.revision += 1;
        next.updated_at = Utc::now();
        *stored = next.clone();
        Ok(next)
    }

    async fn list(&self, kind: Option<EntityKind>) -> Result<Vec<GoldEntity>> {
        check_available(&self.offline, "gold store")?;

        let tables = self.tables.read().await;
        Ok(tables
            .rows
            .iter()
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_map;

    fn member_key(person: &str, term: &str) -> NaturalKey {
        NaturalKey::new(
            EntityKind::ConferenceMember,
            vec![person.into(), "budget committee".into(), term.into()],
        )
    }

    #[tokio::test]
    async fn test_log_assigns_increasing_ids() {
        let log = InMemoryExtractionLog::new();
        let fields = field_map([("person", "Yamada Taro")]);

        let a = log
            .append(NewExtractionLog::new(EntityKind::ConferenceMember, "doc-1", fields.clone(), 0.9))
            .await
            .unwrap();
        let b = log
            .append(NewExtractionLog::new(EntityKind::ConferenceMember, "doc-2", fields, 0.8))
            .await
            .unwrap();

        assert!(b.id > a.id);
        assert_eq!(log.get(a.id).await.unwrap(), a);
        assert!(matches!(log.get(99).await, Err(GoldError::NotFound(_))));
        assert!(matches!(log.get(0).await, Err(GoldError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_out_of_range_ids_are_not_found() {
        let log = InMemoryExtractionLog::new();
        let gold = InMemoryGoldStore::new();
        log.append(NewExtractionLog::new(EntityKind::ConferenceMember, "doc", field_map([("a", "b")]), 0.5))
            .await
            .unwrap();

        for id in [i64::MIN, -1, 0, i64::MAX] {
            assert!(matches!(log.get(id).await, Err(GoldError::NotFound(_))));
            assert!(matches!(gold.get(id).await, Err(GoldError::NotFound(_))));
        }
    }

    #[tokio::test]
    async fn test_log_list_and_count() {
        let log = InMemoryExtractionLog::new();
        for i in 0..5 {
            let kind = if i % 2 == 0 {
                EntityKind::ConferenceMember
            } else {
                EntityKind::RoleNameMapping
            };
            log.append(NewExtractionLog::new(kind, "doc", field_map([("n", i)]), 0.5))
                .await
                .unwrap();
        }

        let filter = ExtractionLogFilter::for_kind(EntityKind::ConferenceMember);
        assert_eq!(log.count(&filter).await.unwrap(), 3);

        let page = log.list(&filter.clone().with_limit(2)).await.unwrap();
        assert_eq!(page.len(), 2);
        assert!(page[0].id < page[1].id);
    }

    #[tokio::test]
    async fn test_offline_log_is_unavailable() {
        let log = InMemoryExtractionLog::new();
        log.set_offline(true);

        let result = log
            .append(NewExtractionLog::new(EntityKind::ConferenceMember, "doc", field_map([("a", "b")]), 0.5))
            .await;
        assert!(matches!(result, Err(GoldError::StorageUnavailable(_))));

        log.set_offline(false);
        assert_eq!(log.count(&ExtractionLogFilter::default()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_gold_insert_enforces_unique_key() {
        let store = InMemoryGoldStore::new();
        let key = member_key("yamada taro", "203rd");

        store
            .insert(NewGoldEntity::manual(key.clone(), field_map([("role", "chair")])))
            .await
            .unwrap();
        let dup = store.insert(NewGoldEntity::manual(key, Default::default())).await;

        assert!(matches!(dup, Err(GoldError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_gold_update_is_compare_and_swap() {
        let store = InMemoryGoldStore::new();
        let created = store
            .insert(NewGoldEntity::manual(member_key("yamada taro", "203rd"), Default::default()))
            .await
            .unwrap();

        let mut first = created.clone();
        first.fields.insert("role".into(), "chair".into());
        let saved = store.update(&first).await.unwrap();
        assert_eq!(saved.revision, created.revision + 1);

        // A writer still holding the old revision loses
        let mut stale = created;
        stale.fields.insert("role".into(), "member".into());
        assert!(matches!(store.update(&stale).await, Err(GoldError::Conflict(_))));
        assert_eq!(
            store.get(saved.id).await.unwrap().field_str("role"),
            Some("chair")
        );
    }

    #[tokio::test]
    async fn test_gold_candidates() {
        let store = InMemoryGoldStore::new();
        for term in ["202nd", "203rd"] {
            store
                .insert(NewGoldEntity::manual(member_key("yamada taro", term), Default::default()))
                .await
                .unwrap();
        }
        store
            .insert(NewGoldEntity::manual(member_key("suzuki hanako", "203rd"), Default::default()))
            .await
            .unwrap();

        let loose = store.find_candidates(&member_key("yamada taro", "")).await.unwrap();
        assert_eq!(loose.len(), 2);

        let exact = store.find_candidates(&member_key("yamada taro", "203rd")).await.unwrap();
        assert_eq!(exact.len(), 1);
        assert_eq!(store.list(Some(EntityKind::RoleNameMapping)).await.unwrap().len(), 0);
    }
}
