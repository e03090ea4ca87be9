//! Generation capability
//!
//! The scheduler and the decomposer both talk to the model through the
//! `Generator` trait. Each call is independent: one prompt in, one
//! `Generation` out.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

mod error;
mod openai;

pub use error::GenerateError;
pub use openai::OpenAiGenerator;

use crate::config::LlmConfig;

/// Per-call generation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateConfig {
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: Option<String>,
    /// Ask the model for a JSON object
    pub json_mode: bool,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.2,
            system_prompt: None,
            json_mode: true,
        }
    }
}

impl GenerateConfig {
    pub fn from_llm(config: &LlmConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            ..Default::default()
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

/// Result of one generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    /// Free-form status reported by the model; normalised by the caller
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn default_status() -> String {
    "completed".to_string()
}

impl Generation {
    pub fn completed(content: impl Into<String>) -> Self {
        Self {
            status: default_status(),
            content: content.into(),
            notes: None,
            metadata: Map::new(),
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }
}

/// Text generation backend
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str, config: &GenerateConfig) -> Result<Generation, GenerateError>;
}

/// Build the configured generator
pub fn create_generator(config: &LlmConfig) -> Result<Arc<dyn Generator>, GenerateError> {
    debug!(model = %config.model, base_url = %config.base_url, "create_generator: called");
    Ok(Arc::new(OpenAiGenerator::from_config(config)?))
}

/// Strip markdown code fences and surrounding prose from a JSON reply
pub fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        // skip an optional language tag on the fence line
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            return body[..end].trim();
        }
    }
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    }
}

/// Interpret a model reply as a `Generation`
///
/// Replies that are not a JSON object become a completed generation whose
/// content is the raw text. An object without a `content` key is kept whole
/// as the content, which is how decomposition replies come back.
pub fn parse_generation(text: &str) -> Generation {
    let json = extract_json(text);
    match serde_json::from_str::<Value>(json) {
        Ok(Value::Object(map)) => {
            let status = map
                .get("status")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(default_status);
            let content = match map.get("content") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) => String::new(),
                Some(other) => other.to_string(),
                None => json.to_string(),
            };
            let notes = map.get("notes").and_then(Value::as_str).map(str::to_string);
            let metadata = map
                .get("metadata")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            Generation {
                status,
                content,
                notes,
                metadata,
            }
        }
        _ => {
            debug!("parse_generation: reply is not a JSON object, using raw text");
            Generation::completed(text.trim())
        }
    }
}
