//! Reconciliation Integration Tests
//!
//! End-to-end behaviour of the reconciler, manual override API and batch
//! worker pool against the in-memory stores.

use std::sync::Arc;

use gold_core::{
    field_map, EntityKind, ExtractionLogEntry, ExtractionLogRepository, FieldMap, GoldEntity,
    GoldEntityRepository, GoldError, InMemoryExtractionLog, InMemoryGoldStore, NewExtractionLog,
};
use gold_reconciler::{BatchReconciler, ReconciliationResult, Reconciler, SkipReason};
use proptest::prelude::*;
use serde_json::json;

struct Harness {
    log: Arc<InMemoryExtractionLog>,
    gold: Arc<InMemoryGoldStore>,
    reconciler: Arc<Reconciler>,
}

impl Harness {
    fn new() -> Self {
        let log = Arc::new(InMemoryExtractionLog::new());
        let gold = Arc::new(InMemoryGoldStore::new());
        let reconciler = Arc::new(Reconciler::new(log.clone(), gold.clone()));
        Self {
            log,
            gold,
            reconciler,
        }
    }

    async fn append(&self, kind: EntityKind, fields: FieldMap) -> ExtractionLogEntry {
        self.log
            .append(NewExtractionLog::new(kind, "minutes-2024-05", fields, 0.8))
            .await
            .unwrap()
    }

    async fn member(&self, role: &str) -> ExtractionLogEntry {
        self.append(EntityKind::ConferenceMember, yamada(role)).await
    }
}

fn yamada(role: &str) -> FieldMap {
    field_map([
        ("person", "Yamada Taro"),
        ("conference", "Budget Committee"),
        ("term", "203rd"),
        ("role", role),
    ])
}

fn entity_of(result: &ReconciliationResult) -> GoldEntity {
    result
        .entity()
        .cloned()
        .unwrap_or_else(|| panic!("expected an entity, got {result:?}"))
}

// =============================================================================
// Worked example
// =============================================================================

#[tokio::test]
async fn test_budget_committee_lifecycle() {
    let h = Harness::new();

    let first = h.member("Member").await;
    let created = h.reconciler.reconcile(&first).await.unwrap();
    assert!(matches!(created, ReconciliationResult::Created(_)));
    let id = entity_of(&created).id;

    let second = h.member("Chair").await;
    let updated = h.reconciler.reconcile(&second).await.unwrap();
    assert!(matches!(updated, ReconciliationResult::Updated(_)));
    let entity = entity_of(&updated);
    assert_eq!(entity.id, id);
    assert_eq!(entity.field_str("role"), Some("Chair"));
    assert_eq!(entity.latest_extraction_log_id, Some(second.id));

    h.reconciler.manual_override().mark_verified(id).await.unwrap();

    let third = h.member("Vice Chair").await;
    let skipped = h.reconciler.reconcile(&third).await.unwrap();
    assert_eq!(
        skipped,
        ReconciliationResult::Skipped(SkipReason::ManuallyVerified { entity_id: id })
    );

    let stored = h.gold.get(id).await.unwrap();
    assert_eq!(stored.field_str("role"), Some("Chair"));
    assert_eq!(stored.latest_extraction_log_id, Some(second.id));
    assert_eq!(h.log.get(third.id).await.unwrap(), third);
}

#[tokio::test]
async fn test_differently_written_names_resolve_to_one_entity() {
    let h = Harness::new();
    let a = h
        .append(
            EntityKind::ConferenceMember,
            field_map([
                ("person", "Yamada Taro"),
                ("conference", "Budget Committee"),
                ("term", "203rd"),
            ]),
        )
        .await;
    let b = h
        .append(
            EntityKind::ConferenceMember,
            field_map([
                ("extracted_name", "  YAMADA\u{3000}taro "),
                ("conference_id", "budget   committee"),
                ("term", "203RD"),
            ]),
        )
        .await;

    let first = entity_of(&h.reconciler.reconcile(&a).await.unwrap());
    let second = entity_of(&h.reconciler.reconcile(&b).await.unwrap());
    assert_eq!(first.id, second.id);
    assert_eq!(h.gold.list(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_ambiguous_match_is_never_guessed() {
    let h = Harness::new();
    for term in ["202nd", "203rd"] {
        let entry = h
            .append(
                EntityKind::ParliamentaryGroupMembership,
                field_map([
                    ("person", "Yamada Taro"),
                    ("parliamentary_group", "Group A"),
                    ("term", term),
                ]),
            )
            .await;
        h.reconciler.reconcile(&entry).await.unwrap();
    }
    let before = h.gold.list(None).await.unwrap();

    let loose = h
        .append(
            EntityKind::ParliamentaryGroupMembership,
            field_map([("person", "Yamada Taro"), ("parliamentary_group", "Group A")]),
        )
        .await;
    let result = h.reconciler.reconcile(&loose).await.unwrap();

    let ReconciliationResult::Skipped(SkipReason::Ambiguous { candidates }) = &result else {
        panic!("expected ambiguous skip, got {result:?}");
    };
    assert_eq!(candidates.len(), 2);
    assert_eq!(h.gold.list(None).await.unwrap(), before);
}

#[tokio::test]
async fn test_verified_partial_entity_blocks_full_key_extractions() {
    let h = Harness::new();
    let partial = h
        .append(
            EntityKind::ConferenceMember,
            field_map([
                ("person", "Yamada Taro"),
                ("conference", "Budget Committee"),
                ("role", "Member"),
            ]),
        )
        .await;
    let id = entity_of(&h.reconciler.reconcile(&partial).await.unwrap()).id;
    let locked = h.reconciler.manual_override().mark_verified(id).await.unwrap();

    // The same seat, now with a term
    let full = h.member("Chair").await;
    assert_eq!(
        h.reconciler.reconcile(&full).await.unwrap(),
        ReconciliationResult::Skipped(SkipReason::ManuallyVerified { entity_id: id })
    );

    // Later term-less extractions still find exactly one entity
    let again = h
        .append(
            EntityKind::ConferenceMember,
            field_map([("person", "Yamada Taro"), ("conference", "Budget Committee")]),
        )
        .await;
    assert_eq!(
        h.reconciler.reconcile(&again).await.unwrap(),
        ReconciliationResult::Skipped(SkipReason::ManuallyVerified { entity_id: id })
    );

    let entities = h.gold.list(None).await.unwrap();
    assert_eq!(entities, vec![locked]);
}

#[tokio::test]
async fn test_full_key_refreshes_unverified_partial_entity() {
    let h = Harness::new();
    let partial = h
        .append(
            EntityKind::ConferenceMember,
            field_map([("person", "Yamada Taro"), ("conference", "Budget Committee")]),
        )
        .await;
    let created = entity_of(&h.reconciler.reconcile(&partial).await.unwrap());

    let full = h.member("Chair").await;
    let updated = entity_of(&h.reconciler.reconcile(&full).await.unwrap());

    assert_eq!(updated.id, created.id);
    // The stored key keeps its original shape
    assert_eq!(updated.natural_key, created.natural_key);
    assert_eq!(updated.field_str("role"), Some("Chair"));
    assert_eq!(updated.latest_extraction_log_id, Some(full.id));
    assert_eq!(h.gold.list(None).await.unwrap().len(), 1);
}

// =============================================================================
// Properties
// =============================================================================

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let h = Harness::new();
    let entry = h.member("Member").await;

    let first = entity_of(&h.reconciler.reconcile(&entry).await.unwrap());
    let second = entity_of(&h.reconciler.reconcile(&entry).await.unwrap());
    let third = entity_of(&h.reconciler.reconcile_by_id(entry.id).await.unwrap());

    assert_eq!(first, second);
    assert_eq!(second, third);
    assert_eq!(h.gold.get(first.id).await.unwrap(), first);
}

#[tokio::test]
async fn test_lock_release_round_trip() {
    let h = Harness::new();
    let manual = h.reconciler.manual_override();
    let id = entity_of(&h.reconciler.reconcile(&h.member("Member").await).await.unwrap()).id;

    manual.mark_verified(id).await.unwrap();
    let blocked = h.reconciler.reconcile(&h.member("Chair").await).await.unwrap();
    assert!(blocked.is_skipped());

    manual.release_to_automation(id).await.unwrap();
    let latest = h.member("Secretary").await;
    let refreshed = entity_of(&h.reconciler.reconcile(&latest).await.unwrap());
    assert_eq!(refreshed.field_str("role"), Some("Secretary"));
    assert_eq!(refreshed.latest_extraction_log_id, Some(latest.id));
}

#[tokio::test]
async fn test_manual_edit_survives_later_extractions() {
    let h = Harness::new();
    let manual = h.reconciler.manual_override();
    let id = entity_of(&h.reconciler.reconcile(&h.member("Member").await).await.unwrap()).id;

    let edited = manual
        .apply_manual_edit(id, field_map([("role", json!("Chair"))]))
        .await
        .unwrap();
    assert!(edited.is_manually_verified);

    h.reconciler.reconcile(&h.member("Member").await).await.unwrap();
    assert_eq!(h.gold.get(id).await.unwrap().fields, edited.fields);
}

#[tokio::test]
async fn test_retired_entity_stays_retired() {
    let h = Harness::new();
    let manual = h.reconciler.manual_override();
    let id = entity_of(&h.reconciler.reconcile(&h.member("Member").await).await.unwrap()).id;

    manual.retire(id).await.unwrap();
    let result = h.reconciler.reconcile(&h.member("Chair").await).await.unwrap();
    assert!(result.is_skipped());
    assert!(!h.gold.get(id).await.unwrap().is_active());

    // Released but still retired: automation refreshes fields, not lifecycle
    manual.release_to_automation(id).await.unwrap();
    let refreshed = entity_of(&h.reconciler.reconcile(&h.member("Chair").await).await.unwrap());
    assert_eq!(refreshed.field_str("role"), Some("Chair"));
    assert!(!refreshed.is_active());
}

// =============================================================================
// Failure handling
// =============================================================================

#[tokio::test]
async fn test_batch_skips_malformed_entries() {
    let h = Harness::new();
    let good = h.member("Member").await;
    let bad = h
        .append(
            EntityKind::RoleNameMapping,
            field_map([("role", "議長")]),
        )
        .await;
    let other = h
        .append(
            EntityKind::RoleNameMapping,
            field_map([("role", "議長"), ("person_name", "山田太郎")]),
        )
        .await;

    let batch = BatchReconciler::new(Arc::clone(&h.reconciler), 3);
    let report = batch.run(vec![good.id, bad.id, other.id]).await;

    assert_eq!(report.stats.created, 2);
    assert_eq!(report.stats.malformed, 1);
    assert_eq!(report.malformed[0].log_id, bad.id);
    assert!(report.failed.is_empty());
}

#[tokio::test]
async fn test_storage_outage_is_retryable_and_safe() {
    let h = Harness::new();
    let entry = h.member("Member").await;

    h.gold.set_offline(true);
    let err = h.reconciler.reconcile(&entry).await.unwrap_err();
    assert!(matches!(err, GoldError::StorageUnavailable(_)));
    assert!(err.is_retryable());

    h.log.set_offline(true);
    h.gold.set_offline(false);
    assert!(matches!(
        h.reconciler.reconcile(&entry).await,
        Err(GoldError::StorageUnavailable(_))
    ));

    h.log.set_offline(false);
    let created = h.reconciler.reconcile(&entry).await.unwrap();
    assert!(matches!(created, ReconciliationResult::Created(_)));
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_same_key_creates_one_entity() {
    let h = Harness::new();
    let mut entries = Vec::new();
    for i in 0..16 {
        entries.push(h.member(&format!("Role {i}")).await);
    }

    let mut handles = Vec::new();
    for entry in entries {
        let reconciler = Arc::clone(&h.reconciler);
        handles.push(tokio::spawn(async move { reconciler.reconcile(&entry).await }));
    }

    let mut created = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            ReconciliationResult::Created(_) => created += 1,
            ReconciliationResult::Updated(_) => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(created, 1);
    let entities = h.gold.list(None).await.unwrap();
    assert_eq!(entities.len(), 1);
    assert_eq!(entities[0].revision, 15);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_verification_is_never_lost_to_a_racing_write() {
    let h = Harness::new();
    let id = entity_of(&h.reconciler.reconcile(&h.member("Member").await).await.unwrap()).id;

    let mut entries = Vec::new();
    for i in 0..16 {
        entries.push(h.member(&format!("Role {i}")).await);
    }

    let mut handles = Vec::new();
    for entry in entries {
        let reconciler = Arc::clone(&h.reconciler);
        handles.push(tokio::spawn(async move { reconciler.reconcile(&entry).await }));
    }
    let manual = h.reconciler.manual_override();
    let locked = manual.mark_verified(id).await.unwrap();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // Whatever ran after the lock was rejected
    let stored = h.gold.get(id).await.unwrap();
    assert!(stored.is_manually_verified);
    assert_eq!(stored.fields, locked.fields);
    assert_eq!(stored.revision, locked.revision);
}

// =============================================================================
// Property tests
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Extract(usize),
    Verify,
    Release,
    Edit(usize),
}

const ROLES: &[&str] = &["Member", "Chair", "Vice Chair", "Secretary"];

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..ROLES.len()).prop_map(Op::Extract),
        1 => Just(Op::Verify),
        1 => Just(Op::Release),
        1 => (0..ROLES.len()).prop_map(Op::Edit),
    ]
}

proptest! {
    #[test]
    fn prop_protection_and_freshness(ops in proptest::collection::vec(op_strategy(), 1..24)) {
        tokio_test::block_on(async {
            let h = Harness::new();
            let manual = h.reconciler.manual_override();
            let seed = h.member("Member").await;
            let id = entity_of(&h.reconciler.reconcile(&seed).await.unwrap()).id;

            for op in ops {
                let before = h.gold.get(id).await.unwrap();
                match op {
                    Op::Extract(role) => {
                        let entry = h.member(ROLES[role]).await;
                        let result = h.reconciler.reconcile(&entry).await.unwrap();
                        let after = h.gold.get(id).await.unwrap();

                        if before.is_manually_verified {
                            assert!(result.is_skipped());
                            assert_eq!(after, before);
                        } else {
                            assert_eq!(after.fields, entry.extracted_fields);
                            assert_eq!(after.latest_extraction_log_id, Some(entry.id));
                        }

                        // Re-running the same entry changes nothing
                        h.reconciler.reconcile(&entry).await.unwrap();
                        assert_eq!(h.gold.get(id).await.unwrap(), after);
                    }
                    Op::Verify => {
                        let after = manual.mark_verified(id).await.unwrap();
                        assert!(after.is_manually_verified);
                        assert_eq!(after.fields, before.fields);
                    }
                    Op::Release => {
                        let after = manual.release_to_automation(id).await.unwrap();
                        assert!(!after.is_manually_verified);
                        assert_eq!(after.fields, before.fields);
                    }
                    Op::Edit(role) => {
                        let after = manual
                            .apply_manual_edit(id, field_map([("role", ROLES[role])]))
                            .await
                            .unwrap();
                        assert!(after.is_manually_verified);
                        assert_eq!(after.field_str("role"), Some(ROLES[role]));
                    }
                }
            }
        });
    }

    #[test]
    fn prop_confidence_never_overrides_lock(confidence in -1.0f32..2.0) {
        tokio_test::block_on(async {
            let h = Harness::new();
            let id = entity_of(&h.reconciler.reconcile(&h.member("Member").await).await.unwrap()).id;
            h.reconciler.manual_override().mark_verified(id).await.unwrap();
            let before = h.gold.get(id).await.unwrap();

            let entry = h
                .log
                .append(NewExtractionLog::new(
                    EntityKind::ConferenceMember,
                    "minutes-2024-06",
                    yamada("Chair"),
                    confidence,
                ))
                .await
                .unwrap();
            assert!((0.0..=1.0).contains(&entry.confidence));

            let result = h.reconciler.reconcile(&entry).await.unwrap();
            assert!(result.is_skipped());
            assert_eq!(h.gold.get(id).await.unwrap(), before);
        });
    }
}
