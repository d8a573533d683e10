//! Entity Identity Resolver
//!
//! Natural-key derivation is specific to each Gold entity type: every typed
//! variant declares its key components through `KeyRule`. Resolution then
//! maps a key to at most one stored entity, reporting ambiguity instead of
//! guessing.

use std::sync::Arc;

use gold_core::entities::{
    first_text, CONFERENCE_FIELDS, GROUP_FIELDS, PERSON_FIELDS, PERSON_NAME_FIELDS, ROLE_FIELDS,
    TERM_FIELDS,
};
use gold_core::{
    normalize_text, ConferenceMember, EntityKind, ExtractionLogEntry, FieldMap, GoldEntity,
    GoldEntityRepository, GoldError, NaturalKey, ParliamentaryGroupMembership, Result,
    RoleNameMapping,
};

// ============================================================================
// Derivation Rules
// ============================================================================

/// Where a key component's raw value comes from
#[derive(Debug, Clone, Copy)]
pub enum KeySource {
    /// First non-blank field among the aliases
    Fields(&'static [&'static str]),
    /// The log entry's source document (scopes a fact to one document)
    SourceDocument,
}

/// One position of a natural key
#[derive(Debug, Clone, Copy)]
pub struct KeyComponent {
    pub name: &'static str,
    pub source: KeySource,
    /// Required components lead the key; a missing one makes the extraction malformed
    pub required: bool,
}

/// Natural-key derivation rule of one Gold entity type
pub trait KeyRule {
    const KIND: EntityKind;
    const COMPONENTS: &'static [KeyComponent];

    fn derive(source_document_id: &str, fields: &FieldMap) -> Result<NaturalKey> {
        let mut parts = Vec::with_capacity(Self::COMPONENTS.len());
        let mut missing = Vec::new();

        for component in Self::COMPONENTS {
            let raw = match component.source {
                KeySource::Fields(aliases) => first_text(fields, aliases),
                KeySource::SourceDocument => Some(source_document_id.to_string()),
            };
            let part = raw.map(|r| normalize_text(&r)).unwrap_or_default();
            if part.is_empty() && component.required {
                missing.push(component.name);
            }
            parts.push(part);
        }

        if !missing.is_empty() {
            return Err(GoldError::MalformedExtraction(format!(
                "{} extraction is missing {}",
                Self::KIND,
                missing.join(", ")
            )));
        }
        Ok(NaturalKey::new(Self::KIND, parts))
    }
}

impl KeyRule for ConferenceMember {
    const KIND: EntityKind = EntityKind::ConferenceMember;
    const COMPONENTS: &'static [KeyComponent] = &[
        KeyComponent {
            name: "person",
            source: KeySource::Fields(PERSON_FIELDS),
            required: true,
        },
        KeyComponent {
            name: "conference",
            source: KeySource::Fields(CONFERENCE_FIELDS),
            required: true,
        },
        KeyComponent {
            name: "term",
            source: KeySource::Fields(TERM_FIELDS),
            required: false,
        },
    ];
}

impl KeyRule for ParliamentaryGroupMembership {
    const KIND: EntityKind = EntityKind::ParliamentaryGroupMembership;
    const COMPONENTS: &'static [KeyComponent] = &[
        KeyComponent {
            name: "person",
            source: KeySource::Fields(PERSON_FIELDS),
            required: true,
        },
        KeyComponent {
            name: "parliamentary_group",
            source: KeySource::Fields(GROUP_FIELDS),
            required: true,
        },
        KeyComponent {
            name: "term",
            source: KeySource::Fields(TERM_FIELDS),
            required: false,
        },
    ];
}

impl KeyRule for RoleNameMapping {
    const KIND: EntityKind = EntityKind::RoleNameMapping;
    const COMPONENTS: &'static [KeyComponent] = &[
        KeyComponent {
            name: "document",
            source: KeySource::SourceDocument,
            required: true,
        },
        KeyComponent {
            name: "role",
            source: KeySource::Fields(ROLE_FIELDS),
            required: true,
        },
        KeyComponent {
            name: "person_name",
            source: KeySource::Fields(PERSON_NAME_FIELDS),
            required: true,
        },
    ];
}

/// Derive the natural key for raw extraction output of `kind`
pub fn derive_key(kind: EntityKind, source_document_id: &str, fields: &FieldMap) -> Result<NaturalKey> {
    match kind {
        EntityKind::ConferenceMember => ConferenceMember::derive(source_document_id, fields),
        EntityKind::ParliamentaryGroupMembership => {
            ParliamentaryGroupMembership::derive(source_document_id, fields)
        }
        EntityKind::RoleNameMapping => RoleNameMapping::derive(source_document_id, fields),
    }
}

fn key_components(kind: EntityKind) -> &'static [KeyComponent] {
    match kind {
        EntityKind::ConferenceMember => ConferenceMember::COMPONENTS,
        EntityKind::ParliamentaryGroupMembership => ParliamentaryGroupMembership::COMPONENTS,
        EntityKind::RoleNameMapping => RoleNameMapping::COMPONENTS,
    }
}

/// Check that editing `before` into `after` leaves the fields consistent
/// with `key`.
///
/// A field-sourced component the key supplies may not be moved to a value
/// that disagrees with it; removing every alias counts as such a move.
/// Components the key leaves empty are free to change.
pub fn ensure_edit_keeps_key(key: &NaturalKey, before: &FieldMap, after: &FieldMap) -> Result<()> {
    fn text(fields: &FieldMap, aliases: &[&str]) -> String {
        first_text(fields, aliases)
            .map(|raw| normalize_text(&raw))
            .unwrap_or_default()
    }

    for (component, stored) in key_components(key.kind).iter().zip(&key.parts) {
        let KeySource::Fields(aliases) = component.source else {
            continue;
        };
        if stored.is_empty() {
            continue;
        }
        let edited = text(after, aliases);
        if edited != *stored && edited != text(before, aliases) {
            return Err(GoldError::Validation(format!(
                "edit would change {} of {key}",
                component.name
            )));
        }
    }
    Ok(())
}

/// Derive the natural key a log entry describes
pub fn derive_entry_key(entry: &ExtractionLogEntry) -> Result<NaturalKey> {
    derive_key(
        entry.entity_kind,
        &entry.source_document_id,
        &entry.extracted_fields,
    )
}

// ============================================================================
// Resolver
// ============================================================================

/// Maps natural keys onto stored Gold entities
#[derive(Clone)]
pub struct IdentityResolver {
    gold: Arc<dyn GoldEntityRepository>,
}

impl IdentityResolver {
    pub fn new(gold: Arc<dyn GoldEntityRepository>) -> Self {
        Self { gold }
    }

    /// Resolve a key to its entity, if any.
    ///
    /// Full keys are looked up exactly first; failing that, a stored entity
    /// whose own key was partial and agrees with every part it has is the
    /// same fact recorded with less detail. Partial keys match every entity
    /// that agrees at each supplied position. More than one candidate is an
    /// `AmbiguousMatch`.
    pub async fn resolve(&self, key: &NaturalKey) -> Result<Option<GoldEntity>> {
        let candidates = if key.is_partial() {
            self.gold.find_candidates(key).await?
        } else {
            if let Some(entity) = self.gold.find_by_key(key).await? {
                return Ok(Some(entity));
            }
            let stripped = key.required_only();
            if stripped == *key {
                return Ok(None);
            }
            self.gold
                .find_candidates(&stripped)
                .await?
                .into_iter()
                .filter(|e| e.natural_key.is_partial() && e.natural_key.loosely_matches(key))
                .collect()
        };
        single_candidate(key, candidates)
    }
}

fn single_candidate(key: &NaturalKey, mut candidates: Vec<GoldEntity>) -> Result<Option<GoldEntity>> {
    match candidates.len() {
        0 | 1 => Ok(candidates.pop()),
        _ => Err(GoldError::AmbiguousMatch {
            key: key.to_string(),
            candidates: candidates.iter().map(|e| e.id).collect(),
        }),
    }
}
