//! Verification Guard
//!
//! The single authority on whether an automated write may proceed.
//! Verified entities are locked until a human releases them; unverified
//! entities are always refreshable.

use serde::{Deserialize, Serialize};

use gold_core::VerifiableEntity;

/// Outcome of a write authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// No entity exists for the key yet
    Create,
    /// Entity exists and is under automated control
    Overwrite,
    /// Entity is manually verified
    Reject,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Overwrite => write!(f, "overwrite"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

/// Write policy shared by every `VerifiableEntity` type
#[derive(Debug, Clone, Copy, Default)]
pub struct VerificationGuard;

impl VerificationGuard {
    pub fn new() -> Self {
        Self
    }

    /// Decide whether an extraction with `incoming_confidence` may write.
    ///
    /// Confidence never unlocks a verified entity and never blocks a refresh
    /// of an unverified one.
    pub fn authorize<E>(&self, entity: Option<&E>, incoming_confidence: f32) -> Decision
    where
        E: VerifiableEntity + ?Sized,
    {
        let decision = match entity {
            None => Decision::Create,
            Some(e) if e.can_be_updated_by_ai() => Decision::Overwrite,
            Some(_) => Decision::Reject,
        };

        tracing::trace!(
            %decision,
            confidence = incoming_confidence,
            "verification guard decided"
        );
        decision
    }
}
