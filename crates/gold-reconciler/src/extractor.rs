//! Extraction capability
//!
//! Field extractors turn a source document into candidate field maps for one
//! entity kind. The strategy is picked once from configuration; callers only
//! see `FieldExtractor`.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use gold_core::{
    EntityKind, ExtractionConfig, ExtractionStrategy, FieldMap, GoldError, NewExtractionLog,
    Result,
};

use crate::llm::LlmFieldExtractor;

// ============================================================================
// Types
// ============================================================================

/// A document handed to an extractor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    /// Identifier recorded as `source_document_id` on log entries
    pub id: String,
    pub text: String,
}

impl SourceDocument {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// One candidate record produced by an extractor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionOutput {
    pub fields: FieldMap,
    pub confidence: f32,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub token_count_input: Option<i32>,
    #[serde(default)]
    pub token_count_output: Option<i32>,
    #[serde(default)]
    pub processing_time_ms: Option<i32>,
}

impl ExtractionOutput {
    pub fn new(fields: FieldMap, confidence: f32) -> Self {
        Self {
            fields,
            confidence,
            model_name: None,
            token_count_input: None,
            token_count_output: None,
            processing_time_ms: None,
        }
    }

    /// Turn the output into an append request for the extraction log
    pub fn into_log(
        self,
        kind: EntityKind,
        document_id: &str,
        pipeline_version: &str,
    ) -> NewExtractionLog {
        let mut log = NewExtractionLog::new(kind, document_id, self.fields, self.confidence)
            .with_pipeline_version(pipeline_version);
        log.model_name = self.model_name;
        log.token_count_input = self.token_count_input;
        log.token_count_output = self.token_count_output;
        log.processing_time_ms = self.processing_time_ms;
        log
    }
}

/// Pluggable extraction strategy
#[async_trait]
pub trait FieldExtractor: Send + Sync {
    /// Extract candidate records of `kind` from `document`
    async fn extract(&self, kind: EntityKind, document: &SourceDocument)
        -> Result<Vec<ExtractionOutput>>;

    /// Name recorded as the log entry's model name when the output has none
    fn name(&self) -> &str;
}

/// Build the extractor selected by configuration
pub fn build_extractor(config: &ExtractionConfig) -> Result<Arc<dyn FieldExtractor>> {
    match config.strategy {
        ExtractionStrategy::RuleBased => Ok(Arc::new(RuleBasedRoleNameExtractor::new())),
        ExtractionStrategy::Llm => Ok(Arc::new(LlmFieldExtractor::from_config(config)?)),
    }
}

// ============================================================================
// Rule-based role/name extraction
// ============================================================================

const HONORIFICS: &[&str] = &["君", "氏", "さん"];
const NAME_SEPARATORS: &[char] = &['、', ',', '，'];

/// Regex-driven extraction of role → person pairs from attendee lists
pub struct RuleBasedRoleNameExtractor {
    /// Line patterns with named groups `role` and `names`, tried in order
    patterns: Vec<(Regex, f32)>,
}

impl RuleBasedRoleNameExtractor {
    pub fn new() -> Self {
        let mut extractor = Self {
            patterns: Vec::new(),
        };
        extractor.init_patterns();
        extractor
    }

    fn init_patterns(&mut self) {
        // 委員長：山田太郎 / Chair: Yamada Taro
        self.add_pattern(
            r"^\s*(?P<role>[^:：()（）\s\d][^:：()（）\d]*?)\s*[:：]\s*(?P<names>.+?)\s*$",
            0.9,
        );
        // 山田太郎（委員長） / Yamada Taro (Chair)
        self.add_pattern(
            r"^\s*(?P<names>[^:：()（）]+?)\s*[(（]\s*(?P<role>[^()（）]+?)\s*[)）]\s*$",
            0.85,
        );
        // 委員長　山田太郎
        self.add_pattern(
            r"^\s*(?P<role>\S*?(?:副委員長|委員長|副議長|議長|委員|理事|大臣|市長|知事|局長|部長|課長))\s+(?P<names>.+?)\s*$",
            0.7,
        );
    }

    fn add_pattern(&mut self, pattern: &str, confidence: f32) {
        if let Ok(regex) = Regex::new(pattern) {
            self.patterns.push((regex, confidence));
        }
    }

    /// Role/name pairs found in `text`, with the confidence of the pattern
    /// that matched. Repeated pairs are reported once.
    pub fn extract_pairs(&self, text: &str) -> Vec<(String, String, f32)> {
        let mut seen = HashSet::new();
        let mut pairs = Vec::new();

        for line in text.lines() {
            let Some((caps, confidence)) = self
                .patterns
                .iter()
                .find_map(|(re, conf)| re.captures(line).map(|c| (c, *conf)))
            else {
                continue;
            };

            let role = caps["role"].trim().to_string();
            for name in caps["names"].split(NAME_SEPARATORS) {
                let name = strip_honorific(name.trim());
                if name.is_empty() || role.is_empty() {
                    continue;
                }
                if seen.insert((role.clone(), name.to_string())) {
                    pairs.push((role.clone(), name.to_string(), confidence));
                }
            }
        }

        pairs
    }
}

impl Default for RuleBasedRoleNameExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn strip_honorific(name: &str) -> &str {
    HONORIFICS
        .iter()
        .find_map(|h| name.strip_suffix(h))
        .map(str::trim_end)
        .unwrap_or(name)
}

#[async_trait]
impl FieldExtractor for RuleBasedRoleNameExtractor {
    async fn extract(
        &self,
        kind: EntityKind,
        document: &SourceDocument,
    ) -> Result<Vec<ExtractionOutput>> {
        if kind != EntityKind::RoleNameMapping {
            return Err(GoldError::Extraction(format!(
                "{} cannot extract {kind}",
                self.name()
            )));
        }

        Ok(self
            .extract_pairs(&document.text)
            .into_iter()
            .map(|(role, name, confidence)| {
                let mut fields = FieldMap::new();
                fields.insert("role".into(), role.into());
                fields.insert("person_name".into(), name.into());
                ExtractionOutput::new(fields, confidence)
            })
            .collect())
    }

    fn name(&self) -> &str {
        "rule-based-role-name"
    }
}
