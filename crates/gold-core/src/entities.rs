//! Typed Gold entity variants
//!
//! `GoldEntity` is the stored shape shared by every entity type. The structs
//! here are typed views over it for downstream consumers (membership
//! queries, vote/judgment modules). All of them implement
//! `VerifiableEntity`, so one verification guard serves every variant.

use serde::{Deserialize, Serialize};

use crate::{EntityId, EntityKind, FieldMap, GoldEntity, GoldError, LifecycleState, LogId};

/// Field aliases naming the person an extraction is about
pub const PERSON_FIELDS: &[&str] = &["person", "politician_id", "extracted_name", "name"];
pub const CONFERENCE_FIELDS: &[&str] = &["conference", "conference_id"];
pub const GROUP_FIELDS: &[&str] = &["parliamentary_group", "parliamentary_group_id", "group"];
pub const TERM_FIELDS: &[&str] = &["term", "start_date"];
pub const ROLE_FIELDS: &[&str] = &["role", "extracted_role"];
pub const PERSON_NAME_FIELDS: &[&str] = &["person_name", "name", "person"];
pub const PARTY_FIELDS: &[&str] = &["party_name", "extracted_party_name"];

/// Capability shared by every entity a human can lock against automation
pub trait VerifiableEntity {
    fn is_manually_verified(&self) -> bool;

    fn latest_extraction_log_id(&self) -> Option<LogId>;

    /// Lock the entity; later automated writes are refused
    fn mark_as_manually_verified(&mut self);

    /// Move the provenance pointer to `log_id`
    fn update_from_extraction_log(&mut self, log_id: LogId);

    fn can_be_updated_by_ai(&self) -> bool {
        !self.is_manually_verified()
    }
}

/// First alias carrying a non-blank value, rendered as text.
///
/// Strings are returned as written; numbers and booleans use their JSON text.
pub fn first_text(fields: &FieldMap, aliases: &[&str]) -> Option<String> {
    aliases.iter().find_map(|alias| match fields.get(*alias)? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

fn expect_kind(entity: &GoldEntity, kind: EntityKind) -> Result<(), GoldError> {
    if entity.kind == kind {
        Ok(())
    } else {
        Err(GoldError::Validation(format!(
            "entity {} is a {}, not a {}",
            entity.id, entity.kind, kind
        )))
    }
}

fn required_text(entity: &GoldEntity, aliases: &[&str]) -> Result<String, GoldError> {
    first_text(&entity.fields, aliases).ok_or_else(|| {
        GoldError::Validation(format!(
            "entity {} has none of the fields {:?}",
            entity.id, aliases
        ))
    })
}

macro_rules! verifiable_view {
    ($ty:ty) => {
        impl VerifiableEntity for $ty {
            fn is_manually_verified(&self) -> bool {
                self.is_manually_verified
            }

            fn latest_extraction_log_id(&self) -> Option<LogId> {
                self.latest_extraction_log_id
            }

            fn mark_as_manually_verified(&mut self) {
                self.is_manually_verified = true;
            }

            fn update_from_extraction_log(&mut self, log_id: LogId) {
                self.latest_extraction_log_id = Some(log_id);
            }
        }
    };
}

// ============================================================================
// Conference Member
// ============================================================================

/// A politician's seat on a conference (assembly or committee) for one term
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConferenceMember {
    pub entity_id: EntityId,
    pub person: String,
    pub conference: String,
    pub term: Option<String>,
    pub role: Option<String>,
    pub party_name: Option<String>,
    pub is_manually_verified: bool,
    pub latest_extraction_log_id: Option<LogId>,
    pub lifecycle: LifecycleState,
}

impl TryFrom<&GoldEntity> for ConferenceMember {
    type Error = GoldError;

    fn try_from(entity: &GoldEntity) -> Result<Self, Self::Error> {
        expect_kind(entity, EntityKind::ConferenceMember)?;
        Ok(Self {
            entity_id: entity.id,
            person: required_text(entity, PERSON_FIELDS)?,
            conference: required_text(entity, CONFERENCE_FIELDS)?,
            term: first_text(&entity.fields, TERM_FIELDS),
            role: first_text(&entity.fields, ROLE_FIELDS),
            party_name: first_text(&entity.fields, PARTY_FIELDS),
            is_manually_verified: entity.is_manually_verified,
            latest_extraction_log_id: entity.latest_extraction_log_id,
            lifecycle: entity.lifecycle,
        })
    }
}

verifiable_view!(ConferenceMember);

// ============================================================================
// Parliamentary Group Membership
// ============================================================================

/// A politician's membership in a parliamentary group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParliamentaryGroupMembership {
    pub entity_id: EntityId,
    pub person: String,
    pub parliamentary_group: String,
    pub term: Option<String>,
    pub role: Option<String>,
    pub end_date: Option<String>,
    pub is_manually_verified: bool,
    pub latest_extraction_log_id: Option<LogId>,
    pub lifecycle: LifecycleState,
}

impl ParliamentaryGroupMembership {
    /// Whether the membership is current: active lifecycle and no end date
    pub fn is_current(&self) -> bool {
        self.lifecycle == LifecycleState::Active && self.end_date.is_none()
    }
}

impl TryFrom<&GoldEntity> for ParliamentaryGroupMembership {
    type Error = GoldError;

    fn try_from(entity: &GoldEntity) -> Result<Self, Self::Error> {
        expect_kind(entity, EntityKind::ParliamentaryGroupMembership)?;
        Ok(Self {
            entity_id: entity.id,
            person: required_text(entity, PERSON_FIELDS)?,
            parliamentary_group: required_text(entity, GROUP_FIELDS)?,
            term: first_text(&entity.fields, TERM_FIELDS),
            role: first_text(&entity.fields, ROLE_FIELDS),
            end_date: first_text(&entity.fields, &["end_date"]),
            is_manually_verified: entity.is_manually_verified,
            latest_extraction_log_id: entity.latest_extraction_log_id,
            lifecycle: entity.lifecycle,
        })
    }
}

verifiable_view!(ParliamentaryGroupMembership);

// ============================================================================
// Role / Name Mapping
// ============================================================================

/// Which person held which role, within one document (e.g. minutes attendee list)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleNameMapping {
    pub entity_id: EntityId,
    pub role: String,
    pub person_name: String,
    pub is_manually_verified: bool,
    pub latest_extraction_log_id: Option<LogId>,
    pub lifecycle: LifecycleState,
}

impl TryFrom<&GoldEntity> for RoleNameMapping {
    type Error = GoldError;

    fn try_from(entity: &GoldEntity) -> Result<Self, Self::Error> {
        expect_kind(entity, EntityKind::RoleNameMapping)?;
        Ok(Self {
            entity_id: entity.id,
            role: required_text(entity, ROLE_FIELDS)?,
            person_name: required_text(entity, PERSON_NAME_FIELDS)?,
            is_manually_verified: entity.is_manually_verified,
            latest_extraction_log_id: entity.latest_extraction_log_id,
            lifecycle: entity.lifecycle,
        })
    }
}

verifiable_view!(RoleNameMapping);
