//! Natural keys
//!
//! A natural key names one real-world fact independently of the surface
//! text any single extraction used for it. Parts are stored normalised;
//! an empty part means the extraction did not supply that component.

use serde::{Deserialize, Serialize};

use crate::EntityKind;

/// Normalise free text for key comparison.
///
/// Trims, collapses every run of Unicode whitespace (the ideographic space
/// included) into a single ASCII space and lowercases.
pub fn normalize_text(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Stable identity of a Gold entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub kind: EntityKind,
    pub parts: Vec<String>,
}

impl NaturalKey {
    /// Create a key from already-normalised parts
    pub fn new(kind: EntityKind, parts: Vec<String>) -> Self {
        Self { kind, parts }
    }

    /// Number of leading parts every key of this kind must supply
    pub fn required_parts(kind: EntityKind) -> usize {
        match kind {
            EntityKind::ConferenceMember | EntityKind::ParliamentaryGroupMembership => 2,
            EntityKind::RoleNameMapping => 3,
        }
    }

    /// True when at least one qualifying part is missing
    pub fn is_partial(&self) -> bool {
        self.parts.iter().any(String::is_empty)
    }

    /// Whether `other` agrees with this key at every supplied position
    pub fn loosely_matches(&self, other: &NaturalKey) -> bool {
        self.kind == other.kind
            && self.parts.len() == other.parts.len()
            && self
                .parts
                .iter()
                .zip(&other.parts)
                .all(|(mine, theirs)| mine.is_empty() || mine == theirs)
    }

    /// The same key with every qualifying part left out
    pub fn required_only(&self) -> NaturalKey {
        let required = Self::required_parts(self.kind).min(self.parts.len());
        let parts = self
            .parts
            .iter()
            .enumerate()
            .map(|(i, part)| if i < required { part.clone() } else { String::new() })
            .collect();
        NaturalKey::new(self.kind, parts)
    }

    /// Exclusion scope: the kind plus the required parts.
    ///
    /// Every entity a key can resolve to shares this scope, so holding it
    /// serialises all writers that could touch the same entity.
    pub fn lock_scope(&self) -> String {
        let required = Self::required_parts(self.kind).min(self.parts.len());
        let mut scope = String::from(self.kind.as_str());
        for part in &self.parts[..required] {
            scope.push('\u{1f}');
            scope.push_str(part);
        }
        scope
    }
}

impl std::fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(", self.kind)?;
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            if part.is_empty() {
                f.write_str("*")?;
            } else {
                f.write_str(part)?;
            }
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member_key(parts: [&str; 3]) -> NaturalKey {
        NaturalKey::new(
            EntityKind::ConferenceMember,
            parts.iter().map(|p| p.to_string()).collect(),
        )
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Yamada   Taro "), "yamada taro");
        assert_eq!(normalize_text("山田\u{3000}太郎"), "山田 太郎");
        assert_eq!(normalize_text("Budget\tCommittee\n"), "budget committee");
        assert_eq!(normalize_text("   "), "");
    }

    #[test]
    fn test_partial_key_matches_full_keys() {
        let partial = member_key(["yamada taro", "budget committee", ""]);
        let full = member_key(["yamada taro", "budget committee", "203rd"]);
        let other = member_key(["suzuki hanako", "budget committee", "203rd"]);

        assert!(partial.is_partial());
        assert!(!full.is_partial());
        assert!(partial.loosely_matches(&full));
        assert!(!partial.loosely_matches(&other));
        assert!(!full.loosely_matches(&partial));
    }

    #[test]
    fn test_lock_scope_ignores_qualifying_parts() {
        let partial = member_key(["yamada taro", "budget committee", ""]);
        let full = member_key(["yamada taro", "budget committee", "203rd"]);
        assert_eq!(partial.lock_scope(), full.lock_scope());

        let mapping = NaturalKey::new(
            EntityKind::RoleNameMapping,
            vec!["doc-1".into(), "chair".into(), "yamada taro".into()],
        );
        assert_ne!(mapping.lock_scope(), full.lock_scope());
    }

    #[test]
    fn test_required_only_drops_qualifiers() {
        let full = member_key(["yamada taro", "budget committee", "203rd"]);
        let stripped = full.required_only();

        assert_eq!(stripped, member_key(["yamada taro", "budget committee", ""]));
        assert_eq!(stripped.lock_scope(), full.lock_scope());
        assert!(stripped.loosely_matches(&full));
        assert_eq!(stripped.required_only(), stripped);
    }

    #[test]
    fn test_display_marks_missing_parts() {
        let partial = member_key(["yamada taro", "budget committee", ""]);
        assert_eq!(
            partial.to_string(),
            "conference_member(yamada taro, budget committee, *)"
        );
    }
}
