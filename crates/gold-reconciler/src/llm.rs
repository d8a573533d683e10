//! LLM-backed field extraction
//!
//! Calls an OpenAI-compatible chat completion endpoint and asks for a JSON
//! array of field objects, one per fact found in the document.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use gold_core::{EntityKind, ExtractionConfig, FieldMap, GoldError, Result};

use crate::extractor::{ExtractionOutput, FieldExtractor, SourceDocument};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_CONFIDENCE: f32 = 0.5;

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: i32,
    completion_tokens: i32,
}

// ============================================================================
// Client
// ============================================================================

/// Field extractor backed by a chat completion model
pub struct LlmFieldExtractor {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl LlmFieldExtractor {
    /// Create from config.
    ///
    /// The public OpenAI endpoint needs an API key; self-hosted compatible
    /// endpoints may run without one.
    pub fn from_config(config: &ExtractionConfig) -> Result<Self> {
        let base_url = config.llm_base_url.trim_end_matches('/').to_string();
        if config.llm_api_key.is_none() && base_url == OPENAI_BASE_URL {
            return Err(GoldError::ConfigError(
                "OpenAI API key required for LLM extraction".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GoldError::ConfigError(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key: config.llm_api_key.clone(),
            base_url,
            model: config.llm_model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    async fn complete(&self, prompt: String) -> Result<ChatResponse> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt,
            }],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| GoldError::Extraction(format!("Request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(GoldError::Extraction(format!(
                "LLM endpoint returned {status}: {error_text}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| GoldError::Extraction(format!("Failed to parse response: {e}")))
    }
}

#[async_trait]
impl FieldExtractor for LlmFieldExtractor {
    async fn extract(
        &self,
        kind: EntityKind,
        document: &SourceDocument,
    ) -> Result<Vec<ExtractionOutput>> {
        let started = Instant::now();
        let response = self.complete(build_prompt(kind, &document.text)).await?;
        let elapsed_ms = i32::try_from(started.elapsed().as_millis()).unwrap_or(i32::MAX);

        let content = response
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| GoldError::Extraction("No response generated".to_string()))?;

        let mut outputs = parse_llm_output(content)?;
        for output in &mut outputs {
            output.model_name = Some(self.model.clone());
            output.processing_time_ms = Some(elapsed_ms);
            if let Some(usage) = &response.usage {
                output.token_count_input = Some(usage.prompt_tokens);
                output.token_count_output = Some(usage.completion_tokens);
            }
        }

        debug!(
            document = %document.id,
            kind = %kind,
            records = outputs.len(),
            elapsed_ms,
            "LLM extraction finished"
        );
        Ok(outputs)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Prompt and parsing
// ============================================================================

fn field_instructions(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::ConferenceMember => {
            r#""person" (member name), "conference" (committee or assembly name), "term" (session or term, if stated), "role" (position, if stated)"#
        }
        EntityKind::ParliamentaryGroupMembership => {
            r#""person" (member name), "parliamentary_group" (group name), "term" (start date or term, if stated), "role" (position in the group, if stated)"#
        }
        EntityKind::RoleNameMapping => {
            r#""role" (role or title as written), "person_name" (full name of the person holding it)"#
        }
    }
}

/// Prompt asking for one JSON object per fact of `kind`
pub fn build_prompt(kind: EntityKind, text: &str) -> String {
    format!(
        "Extract every {kind} record from the document below.\n\
         Return only a JSON array. Each element is an object with the fields {fields} \
         and a \"confidence\" number between 0 and 1.\n\
         Omit fields the document does not state. Return [] if nothing is found.\n\n\
         Document:\n{text}",
        fields = field_instructions(kind),
    )
}

/// Parse a model reply into extraction outputs.
///
/// Accepts a bare JSON array or one wrapped in a Markdown code fence.
/// `confidence` is lifted out of each object (default 0.5); non-object
/// elements are ignored.
pub fn parse_llm_output(content: &str) -> Result<Vec<ExtractionOutput>> {
    let body = strip_code_fence(content);
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| GoldError::Extraction(format!("LLM reply is not JSON: {e}")))?;

    let items = match value {
        serde_json::Value::Array(items) => items,
        object @ serde_json::Value::Object(_) => vec![object],
        other => {
            return Err(GoldError::Extraction(format!(
                "expected a JSON array, got {other}"
            )))
        }
    };

    Ok(items
        .into_iter()
        .filter_map(|item| match item {
            serde_json::Value::Object(map) => Some(map),
            _ => None,
        })
        .map(|map| {
            let mut fields: FieldMap = map.into_iter().collect();
            let confidence = fields
                .remove("confidence")
                .and_then(|c| c.as_f64())
                .map_or(DEFAULT_CONFIDENCE, |c| c as f32);
            ExtractionOutput::new(fields, confidence)
        })
        .collect())
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop an optional language tag on the opening fence
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}
