//! Data model (spec §3) plus the OpenAI wire DTOs implied by §6.
//!
//! Dynamic JSON values (tool arguments, arbitrary response schemas) are
//! represented with `serde_json::Value` directly rather than a hand-rolled
//! recursive enum — `Value` already is the tagged variant spec §9 asks for,
//! and the teacher leans on it throughout `web/models.rs`.

use serde::{Deserialize, Serialize};

/// A local HTTP service exposing an OpenAI-compatible `/v1/models` and
/// `/v1/chat/completions` API on the loopback interface. Immutable once
/// constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub name: &'static str,
    pub hostname: &'static str,
    pub port: u16,
}

impl Backend {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.hostname, self.port)
    }
}

/// A model surfaced by a discovery cycle on some backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredModel {
    pub display_id: String,
    pub original_id: String,
    pub owned_by: String,
    pub backend_name: String,
    pub base_url: String,
    pub created_epoch: i64,
    pub loaded: bool,
}

impl DiscoveredModel {
    /// `display_id` is `"<original_id> · <backend_name>"` — the
    /// collision-free client-visible id.
    pub fn display_id_for(original_id: &str, backend_name: &str) -> String {
        format!("{original_id} · {backend_name}")
    }
}

/// Capabilities are a function of the model, not the backend; cached by
/// `display_id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    pub vision: bool,
    pub tools: bool,
    pub context_length: Option<u64>,
}

impl ModelCapabilities {
    /// The tag set is derived from the two booleans plus the implicit
    /// `completion` tag, in a fixed order.
    pub fn capability_tags(&self) -> Vec<&'static str> {
        let mut tags = vec!["completion"];
        if self.vision {
            tags.push("vision");
        }
        if self.tools {
            tags.push("tools");
        }
        tags
    }

    pub fn merge_or(&self, other: &ModelCapabilities) -> ModelCapabilities {
        ModelCapabilities {
            vision: self.vision || other.vision,
            tools: self.tools || other.tools,
            context_length: self.context_length.or(other.context_length),
        }
    }
}

/// A registry entry persisted to `~/.afm/mlx-model-registry.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct CachedModelEntry {
    pub id: String,
    pub downloaded_at: i64,
}

/// Chat message role (spec §3 Message).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    Developer,
    User,
    Assistant,
    Tool,
}

/// Either plain text or an array of OpenAI content parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
    Null,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn text(&self) -> String {
        match &self.content {
            Some(MessageContent::Text(s)) => s.clone(),
            Some(MessageContent::Parts(parts)) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.clone()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        }
    }

    pub fn has_image(&self) -> bool {
        matches!(&self.content, Some(MessageContent::Parts(parts))
            if parts.iter().any(|p| matches!(p, ContentPart::ImageUrl { .. })))
    }
}

/// A single parsed or model-native tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// Canonically re-serialized with sorted keys (spec §4.3.4/§4.3.5).
    pub arguments: String,
}

/// Tagged variant sampling config; top_p and top_k are mutually exclusive.
#[derive(Debug, Clone, PartialEq)]
pub enum RandomnessMode {
    Greedy,
    Random,
    TopP(f32),
    TopK(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RandomnessConfig {
    pub mode: RandomnessMode,
    pub seed: Option<u64>,
}

impl Default for RandomnessConfig {
    fn default() -> Self {
        RandomnessConfig {
            mode: RandomnessMode::Random,
            seed: None,
        }
    }
}

/// A chunk the MLX generation pipeline hands to the stop-sequence /
/// tool-streaming layer.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub text: String,
    pub logprobs: Option<Vec<TokenLogprob>>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub counts: Option<GenerationCounts>,
}

#[derive(Debug, Clone)]
pub struct TokenLogprob {
    pub token: String,
    pub logprob: f64,
    pub top_logprobs: Vec<(String, f64)>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GenerationCounts {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Prefix length served from the prompt-cache box, not reprefilled
    /// (spec §8 testable property 2).
    pub cached_tokens: u64,
}

/// Progress callback payload for `ensure_loaded` (spec §4.3.1).
#[derive(Debug, Clone, Serialize)]
pub struct ModelLoadProgress {
    pub stage: &'static str,
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------
// OpenAI wire DTOs (§3.1 supplement — not individually enumerated in
// spec.md but implied by §6's endpoint list).
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub min_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub max_completion_tokens: Option<u32>,
    #[serde(default)]
    pub frequency_penalty: Option<f32>,
    #[serde(default)]
    pub presence_penalty: Option<f32>,
    #[serde(default, alias = "repeat_penalty")]
    pub repetition_penalty: Option<f32>,
    #[serde(default)]
    pub stop: Option<StopSequences>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub tool_choice: Option<serde_json::Value>,
    #[serde(default)]
    pub response_format: Option<ResponseFormat>,
    #[serde(default)]
    pub logprobs: Option<bool>,
    #[serde(default)]
    pub top_logprobs: Option<u32>,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl ChatCompletionRequest {
    pub fn effective_max_tokens(&self) -> Option<u32> {
        self.max_completion_tokens.or(self.max_tokens)
    }

    pub fn stop_strings(&self) -> Vec<String> {
        match &self.stop {
            Some(StopSequences::One(s)) => vec![s.clone()],
            Some(StopSequences::Many(v)) => v.clone(),
            None => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    JsonObject,
    JsonSchema { json_schema: serde_json::Value },
}

#[derive(Debug, Clone, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Timings {
    pub prompt_n: u64,
    pub prompt_ms: f64,
    pub predicted_n: u64,
    pub predicted_ms: f64,
}
