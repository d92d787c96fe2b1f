//! `POST /v1/chat/completions` (spec §6): the three-way request router —
//! foundation / MLX / proxy — and OpenAI response shaping for each path.
//!
//! The SSE framing (channel + `Body::channel()` + `data: <json>\n\n` /
//! `data: [DONE]\n\n`) is grounded on `web/routes/chat.rs::handle_post_chat_stream`.
//! Splitting `<think>...</think>` content into `reasoning_content` as it
//! streams reuses `mlx::stop_machine::StopMachine`'s bounded-rolling-buffer
//! idiom rather than rescanning the whole response on every delta.

use std::sync::Arc;

use hyper::body::Bytes;
use hyper::{Body, Request, Response, StatusCode};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::AfmError;
use crate::foundation::randomness;
use crate::foundation::session::{guided_delta, GuidedDelta};
use crate::mlx::generation::{self, GenerationEvent, GenerationRequest};
use crate::mlx::service::MlxService;
use crate::mlx::templates::ToolCallParser;
use crate::server::request_parsing::parse_json_body;
use crate::server::response_helpers::{json_response, openai_error, sse_response};
use crate::state::AppState;
use crate::types::{ChatCompletionRequest, GenerationCounts, Message, ResponseFormat, Role, TokenLogprob, ToolCall, Usage};

pub async fn handle(req: Request<Body>, state: Arc<AppState>) -> Response<Body> {
    let raw_body: Value = match parse_json_body(req.into_body()).await {
        Ok(v) => v,
        Err(response) => return response,
    };
    let chat_request: ChatCompletionRequest = match serde_json::from_value(raw_body.clone()) {
        Ok(v) => v,
        Err(e) => {
            return openai_error(
                400,
                json!({ "error": { "message": format!("invalid request: {e}"), "type": "invalid_request_error" } }),
            );
        }
    };

    if chat_request.model == "foundation" {
        return handle_foundation(state, chat_request).await;
    }

    let snapshot = state.discovery.snapshot();
    if let Some((discovered, original_id)) = snapshot.backend_for(&chat_request.model) {
        let base_url = discovered.base_url.clone();
        let backend_name = discovered.backend_name.clone();
        let stream = chat_request.stream;
        return handle_proxy(state, raw_body, stream, base_url, backend_name, original_id).await;
    }

    handle_mlx(state, chat_request).await
}

// ---------------------------------------------------------------------
// Foundation path
// ---------------------------------------------------------------------

async fn handle_foundation(state: Arc<AppState>, chat_request: ChatCompletionRequest) -> Response<Body> {
    let randomness_config = randomness::from_request(&chat_request);
    let prompt = render_foundation_prompt(&chat_request.messages);
    let json_schema = match &chat_request.response_format {
        Some(ResponseFormat::JsonSchema { json_schema }) => Some(json_schema.clone()),
        _ => None,
    };
    let prompt_tokens = generation::estimate_tokens(&chat_request.messages);

    if chat_request.stream {
        return stream_foundation(state, prompt, json_schema, randomness_config, prompt_tokens).await;
    }

    let guard = state.foundation_session.lock().await;
    let Some(session) = guard.as_ref() else {
        return openai_error(
            503,
            json!({ "error": { "message": "foundation session not initialized", "type": "service_unavailable" } }),
        );
    };

    let full_content = match &json_schema {
        Some(schema) => match session.respond_guided(&prompt, schema, &randomness_config) {
            Ok(snapshots) => snapshots.into_iter().last().unwrap_or_default(),
            Err(e) => return openai_error(e.status_code(), e.to_openai_body()),
        },
        None => match session.respond(&prompt, &randomness_config) {
            Ok(content) => content,
            Err(e) => return openai_error(e.status_code(), e.to_openai_body()),
        },
    };
    drop(guard);

    let completion_tokens = estimate_text_tokens(&full_content);
    let counts = GenerationCounts {
        prompt_tokens,
        completion_tokens,
        cached_tokens: 0,
    };

    let (visible, reasoning) = split_think_full(&full_content);
    let message = build_message_value(&visible, &reasoning, &[]);
    let response = json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4()),
        "object": "chat.completion",
        "created": epoch_now(),
        "model": "foundation",
        "system_fingerprint": AppState::FOUNDATION_FINGERPRINT,
        "choices": [{ "index": 0, "message": message, "finish_reason": "stop", "logprobs": Value::Null }],
        "usage": usage_value(counts),
    });
    json_response(StatusCode::OK, &response)
}

/// Drives real incremental emission through `PlatformBackend`'s streaming
/// twins (spec §4.4/§9's "coroutine streams… lazy finite sequences"),
/// rather than computing the full response and chopping it into chunks.
/// The session lock is held for the whole call — a single on-device
/// session processes one request at a time anyway (spec §9's
/// process-lifecycle singleton).
async fn stream_foundation(
    state: Arc<AppState>,
    prompt: String,
    json_schema: Option<Value>,
    randomness_config: crate::types::RandomnessConfig,
    prompt_tokens: u64,
) -> Response<Body> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let (mut sender, body) = Body::channel();
    let id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
    let created = epoch_now();

    tokio::spawn(async move {
        let guard = state.foundation_session.lock().await;
        let Some(session) = guard.as_ref() else {
            let chunk = json!({ "error": { "message": "foundation session not initialized", "type": "service_unavailable" } });
            let _ = tx.send(format!("data: {chunk}\n\n"));
            return;
        };

        let mut think_tracker = ThinkTracker::new();
        let mut full_content = String::new();

        let send_delta = |tracker: &mut ThinkTracker, full: &mut String, piece: &str, tx: &mpsc::UnboundedSender<String>| -> bool {
            full.push_str(piece);
            let (visible, reasoning) = tracker.push(piece);
            if visible.is_empty() && reasoning.is_empty() {
                return true;
            }
            let mut delta = serde_json::Map::new();
            if !visible.is_empty() {
                delta.insert("content".to_string(), json!(visible));
            }
            if !reasoning.is_empty() {
                delta.insert("reasoning_content".to_string(), json!(reasoning));
            }
            let chunk = json!({
                "id": id.clone(), "object": "chat.completion.chunk", "created": created,
                "model": "foundation", "system_fingerprint": AppState::FOUNDATION_FINGERPRINT,
                "choices": [{ "index": 0, "delta": Value::Object(delta), "finish_reason": Value::Null }],
            });
            tx.send(format!("data: {chunk}\n\n")).is_ok()
        };

        let result = match &json_schema {
            Some(schema) => {
                let mut previous = String::new();
                session.stream_response_guided(&prompt, schema, &randomness_config, &mut |snapshot: &str| {
                    let delta_text = match guided_delta(&previous, snapshot) {
                        GuidedDelta::Append(text) => text,
                        GuidedDelta::Snapshot(text) => text,
                    };
                    previous = snapshot.to_string();
                    send_delta(&mut think_tracker, &mut full_content, &delta_text, &tx)
                })
            }
            None => session.stream_response(&prompt, &randomness_config, &mut |piece: &str| {
                send_delta(&mut think_tracker, &mut full_content, piece, &tx)
            }),
        };

        match result {
            Ok(()) => {
                let (visible, reasoning) = think_tracker.finish();
                if !visible.is_empty() || !reasoning.is_empty() {
                    let mut delta = serde_json::Map::new();
                    if !visible.is_empty() {
                        delta.insert("content".to_string(), json!(visible));
                    }
                    if !reasoning.is_empty() {
                        delta.insert("reasoning_content".to_string(), json!(reasoning));
                    }
                    let chunk = json!({
                        "id": id.clone(), "object": "chat.completion.chunk", "created": created,
                        "model": "foundation", "system_fingerprint": AppState::FOUNDATION_FINGERPRINT,
                        "choices": [{ "index": 0, "delta": Value::Object(delta), "finish_reason": Value::Null }],
                    });
                    let _ = tx.send(format!("data: {chunk}\n\n"));
                }
                let completion_tokens = estimate_text_tokens(&full_content);
                let counts = GenerationCounts {
                    prompt_tokens,
                    completion_tokens,
                    cached_tokens: 0,
                };
                let finish_chunk = json!({
                    "id": id.clone(), "object": "chat.completion.chunk", "created": created,
                    "model": "foundation", "system_fingerprint": AppState::FOUNDATION_FINGERPRINT,
                    "choices": [{ "index": 0, "delta": {}, "finish_reason": "stop" }],
                    "usage": usage_value(counts),
                });
                let _ = tx.send(format!("data: {finish_chunk}\n\n"));
            }
            Err(e) => {
                let error_chunk = e.to_openai_body();
                let _ = tx.send(format!("data: {error_chunk}\n\n"));
            }
        }
    });

    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if sender.send_data(Bytes::from(line)).await.is_err() {
                break;
            }
        }
        let _ = sender.send_data(Bytes::from("data: [DONE]\n\n")).await;
    });

    sse_response(body)
}

/// Unlike `mlx::generation::render_plain`, the system/developer messages
/// are dropped — the session's own `instructions` already plays that role.
fn render_foundation_prompt(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        let role = match message.role {
            Role::System | Role::Developer => continue,
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        out.push_str(&format!("{role}: {}\n", message.text()));
    }
    out.push_str("assistant:");
    out
}

// ---------------------------------------------------------------------
// Proxy path
// ---------------------------------------------------------------------

async fn handle_proxy(
    state: Arc<AppState>,
    raw_body: Value,
    stream: bool,
    base_url: String,
    backend_name: String,
    original_id: String,
) -> Response<Body> {
    if stream {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let (mut sender, body) = Body::channel();

        tokio::spawn(async move {
            let _ = state
                .proxy
                .proxy_streaming_request(&base_url, &original_id, &backend_name, raw_body, |line| {
                    tx.send(line).is_ok()
                })
                .await;
        });

        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if sender.send_data(Bytes::from(line)).await.is_err() {
                    break;
                }
            }
        });

        sse_response(body)
    } else {
        match state.proxy.proxy_request(&base_url, &original_id, &backend_name, raw_body).await {
            Ok(value) => json_response(StatusCode::OK, &value),
            Err(AfmError::BackendUnreachable(message)) => openai_error(
                502,
                json!({ "error": { "message": message, "type": "backend_unreachable" } }),
            ),
            Err(e) => openai_error(e.status_code(), e.to_openai_body()),
        }
    }
}

// ---------------------------------------------------------------------
// MLX path
// ---------------------------------------------------------------------

async fn handle_mlx(state: Arc<AppState>, chat_request: ChatCompletionRequest) -> Response<Body> {
    if let Err(e) = state.mlx_service.ensure_loaded(&chat_request.model, None).await {
        return openai_error(e.status_code(), e.to_openai_body());
    }

    let model_id = chat_request.model.clone();
    let fingerprint = AppState::mlx_fingerprint(&model_id);
    let schema_properties = collect_schema_properties(chat_request.tools.as_deref().unwrap_or(&[]));
    let want_logprobs = chat_request.logprobs.unwrap_or(false);
    let tool_call_parser_override = state.tool_call_parser_override;
    let fix_tool_args = state.fix_tool_args;

    if chat_request.stream {
        stream_mlx(
            state.mlx_service.clone(),
            chat_request,
            model_id,
            fingerprint,
            tool_call_parser_override,
            fix_tool_args,
            schema_properties,
            want_logprobs,
        )
        .await
    } else {
        let mut content = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut counts = GenerationCounts::default();
        let mut finish_reason = "stop";
        let mut logprob_entries: Vec<TokenLogprob> = Vec::new();

        let request = GenerationRequest {
            chat_request: &chat_request,
            tool_call_parser_override,
            fix_tool_args,
            schema_properties,
            want_logprobs,
        };
        let result = generation::generate(&state.mlx_service, request, |event| {
            match event {
                GenerationEvent::Delta { text, logprobs } => {
                    content.push_str(&text);
                    if let Some(lp) = logprobs {
                        logprob_entries.extend(lp);
                    }
                }
                GenerationEvent::ToolCalls(calls) => tool_calls = calls,
                GenerationEvent::Done { finish_reason: fr, counts: c } => {
                    finish_reason = fr;
                    counts = c;
                }
            }
            true
        })
        .await;

        if let Err(e) = result {
            return openai_error(e.status_code(), e.to_openai_body());
        }

        let (visible, reasoning) = split_think_full(&content);
        let message = build_message_value(&visible, &reasoning, &tool_calls);
        let response = json!({
            "id": format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            "object": "chat.completion",
            "created": epoch_now(),
            "model": model_id,
            "system_fingerprint": fingerprint,
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": finish_reason,
                "logprobs": logprobs_value(&logprob_entries, want_logprobs),
            }],
            "usage": usage_value(counts),
        });
        json_response(StatusCode::OK, &response)
    }
}

#[allow(clippy::too_many_arguments)]
async fn stream_mlx(
    service: Arc<MlxService>,
    chat_request: ChatCompletionRequest,
    model_id: String,
    fingerprint: String,
    tool_call_parser_override: Option<ToolCallParser>,
    fix_tool_args: bool,
    schema_properties: Vec<String>,
    want_logprobs: bool,
) -> Response<Body> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let (mut sender, body) = Body::channel();
    let id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
    let created = epoch_now();

    tokio::spawn(async move {
        let mut think_tracker = ThinkTracker::new();
        let request = GenerationRequest {
            chat_request: &chat_request,
            tool_call_parser_override,
            fix_tool_args,
            schema_properties,
            want_logprobs,
        };

        let result = generation::generate(&service, request, |event| match event {
            GenerationEvent::Delta { text, logprobs } => {
                let (visible, reasoning) = think_tracker.push(&text);
                if visible.is_empty() && reasoning.is_empty() && logprobs.is_none() {
                    return true;
                }
                let mut delta = serde_json::Map::new();
                if !visible.is_empty() {
                    delta.insert("content".to_string(), json!(visible));
                }
                if !reasoning.is_empty() {
                    delta.insert("reasoning_content".to_string(), json!(reasoning));
                }
                let chunk = json!({
                    "id": id.clone(), "object": "chat.completion.chunk", "created": created,
                    "model": model_id.clone(), "system_fingerprint": fingerprint.clone(),
                    "choices": [{
                        "index": 0,
                        "delta": Value::Object(delta),
                        "finish_reason": Value::Null,
                        "logprobs": logprobs.map(|lp| logprobs_value(&lp, true)),
                    }],
                });
                tx.send(format!("data: {chunk}\n\n")).is_ok()
            }
            GenerationEvent::ToolCalls(calls) => {
                let chunk = json!({
                    "id": id.clone(), "object": "chat.completion.chunk", "created": created,
                    "model": model_id.clone(), "system_fingerprint": fingerprint.clone(),
                    "choices": [{ "index": 0, "delta": { "tool_calls": calls }, "finish_reason": Value::Null }],
                });
                tx.send(format!("data: {chunk}\n\n")).is_ok()
            }
            GenerationEvent::Done { finish_reason, counts } => {
                let (visible, reasoning) = think_tracker.finish();
                if !visible.is_empty() || !reasoning.is_empty() {
                    let mut delta = serde_json::Map::new();
                    if !visible.is_empty() {
                        delta.insert("content".to_string(), json!(visible));
                    }
                    if !reasoning.is_empty() {
                        delta.insert("reasoning_content".to_string(), json!(reasoning));
                    }
                    let chunk = json!({
                        "id": id.clone(), "object": "chat.completion.chunk", "created": created,
                        "model": model_id.clone(), "system_fingerprint": fingerprint.clone(),
                        "choices": [{ "index": 0, "delta": Value::Object(delta), "finish_reason": Value::Null }],
                    });
                    if tx.send(format!("data: {chunk}\n\n")).is_err() {
                        return false;
                    }
                }
                let finish_chunk = json!({
                    "id": id.clone(), "object": "chat.completion.chunk", "created": created,
                    "model": model_id.clone(), "system_fingerprint": fingerprint.clone(),
                    "choices": [{ "index": 0, "delta": {}, "finish_reason": finish_reason }],
                    "usage": usage_value(counts),
                });
                let _ = tx.send(format!("data: {finish_chunk}\n\n"));
                true
            }
        })
        .await;

        if let Err(e) = result {
            if !matches!(e, AfmError::Cancelled) {
                let error_chunk = e.to_openai_body();
                let _ = tx.send(format!("data: {error_chunk}\n\n"));
            }
        }
    });

    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if sender.send_data(Bytes::from(line)).await.is_err() {
                break;
            }
        }
        let _ = sender.send_data(Bytes::from("data: [DONE]\n\n")).await;
    });

    sse_response(body)
}

// ---------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------

/// Splits streamed text into visible `content` and `reasoning_content`
/// around `<think>`/`</think>`, tolerating a tag split across chunks —
/// the same bounded rolling-buffer technique as `StopMachine`.
struct ThinkTracker {
    in_think: bool,
    carry: String,
}

impl ThinkTracker {
    fn new() -> Self {
        ThinkTracker {
            in_think: false,
            carry: String::new(),
        }
    }

    fn push(&mut self, text: &str) -> (String, String) {
        self.carry.push_str(text);
        let mut visible = String::new();
        let mut reasoning = String::new();
        loop {
            if self.in_think {
                if let Some(pos) = self.carry.find("</think>") {
                    reasoning.push_str(&self.carry[..pos]);
                    self.carry = self.carry[pos + "</think>".len()..].to_string();
                    self.in_think = false;
                    continue;
                }
                let keep = tag_boundary_tail(&self.carry, "</think>");
                let emit_len = self.carry.len() - keep;
                reasoning.push_str(&self.carry[..emit_len]);
                self.carry = self.carry[emit_len..].to_string();
                break;
            }
            if let Some(pos) = self.carry.find("<think>") {
                visible.push_str(&self.carry[..pos]);
                self.carry = self.carry[pos + "<think>".len()..].to_string();
                self.in_think = true;
                continue;
            }
            let keep = tag_boundary_tail(&self.carry, "<think>");
            let emit_len = self.carry.len() - keep;
            visible.push_str(&self.carry[..emit_len]);
            self.carry = self.carry[emit_len..].to_string();
            break;
        }
        (visible, reasoning)
    }

    /// Flush whatever remains buffered once generation ends.
    fn finish(&mut self) -> (String, String) {
        let remaining = std::mem::take(&mut self.carry);
        if self.in_think {
            (String::new(), remaining)
        } else {
            (remaining, String::new())
        }
    }
}

/// How many trailing bytes of `buffer` could still be a prefix of `tag` —
/// these must stay buffered in case the next chunk completes the tag.
fn tag_boundary_tail(buffer: &str, tag: &str) -> usize {
    let max = tag.len().saturating_sub(1).min(buffer.len());
    for len in (1..=max).rev() {
        if tag.starts_with(&buffer[buffer.len() - len..]) {
            return len;
        }
    }
    0
}

/// Non-streaming variant of the same split, over a complete string.
fn split_think_full(content: &str) -> (String, String) {
    let mut tracker = ThinkTracker::new();
    let (mut visible, mut reasoning) = tracker.push(content);
    let (tail_visible, tail_reasoning) = tracker.finish();
    visible.push_str(&tail_visible);
    reasoning.push_str(&tail_reasoning);
    (visible, reasoning)
}

fn build_message_value(content: &str, reasoning: &str, tool_calls: &[ToolCall]) -> Value {
    let mut message = serde_json::Map::new();
    message.insert("role".to_string(), json!("assistant"));
    message.insert(
        "content".to_string(),
        if content.is_empty() && !tool_calls.is_empty() {
            Value::Null
        } else {
            json!(content)
        },
    );
    if !reasoning.is_empty() {
        message.insert("reasoning_content".to_string(), json!(reasoning));
    }
    if !tool_calls.is_empty() {
        message.insert(
            "tool_calls".to_string(),
            serde_json::to_value(tool_calls).unwrap_or(Value::Null),
        );
    }
    Value::Object(message)
}

fn logprobs_value(entries: &[TokenLogprob], want: bool) -> Value {
    if !want {
        return Value::Null;
    }
    let content: Vec<Value> = entries
        .iter()
        .map(|entry| {
            json!({
                "token": entry.token,
                "logprob": entry.logprob,
                "top_logprobs": entry.top_logprobs.iter()
                    .map(|(token, logprob)| json!({ "token": token, "logprob": logprob }))
                    .collect::<Vec<_>>(),
            })
        })
        .collect();
    json!({ "content": content })
}

fn usage_value(counts: GenerationCounts) -> Value {
    let usage = Usage {
        prompt_tokens: counts.prompt_tokens,
        completion_tokens: counts.completion_tokens,
        total_tokens: counts.prompt_tokens + counts.completion_tokens,
        cached_tokens: if counts.cached_tokens > 0 { Some(counts.cached_tokens) } else { None },
    };
    serde_json::to_value(usage).unwrap_or(Value::Null)
}

/// Property names across every tool's JSON schema, in first-seen order —
/// the lookup table `mlx::arg_remap::remap` matches emitted keys against.
fn collect_schema_properties(tools: &[Value]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for tool in tools {
        let Some(properties) = tool.pointer("/function/parameters/properties").and_then(Value::as_object) else {
            continue;
        };
        for key in properties.keys() {
            if !out.contains(key) {
                out.push(key.clone());
            }
        }
    }
    out
}

fn estimate_text_tokens(text: &str) -> u64 {
    let chars = text.chars().count();
    let words = text.split_whitespace().count();
    (chars as f64 / 4.0).max(words as f64 / 0.75).floor() as u64
}

fn epoch_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageContent;

    #[test]
    fn split_think_full_extracts_reasoning() {
        let (visible, reasoning) = split_think_full("<think>pondering</think>final answer");
        assert_eq!(visible, "final answer");
        assert_eq!(reasoning, "pondering");
    }

    #[test]
    fn split_think_full_handles_unterminated_think() {
        let (visible, reasoning) = split_think_full("before<think>still going");
        assert_eq!(visible, "before");
        assert_eq!(reasoning, "still going");
    }

    #[test]
    fn split_think_full_passes_through_when_absent() {
        let (visible, reasoning) = split_think_full("plain text, no tags");
        assert_eq!(visible, "plain text, no tags");
        assert_eq!(reasoning, "");
    }

    #[test]
    fn think_tracker_splits_tag_across_chunk_boundary() {
        let mut tracker = ThinkTracker::new();
        let mut visible = String::new();
        let mut reasoning = String::new();
        for chunk in ["<th", "ink>planning", "</th", "ink> done"] {
            let (v, r) = tracker.push(chunk);
            visible.push_str(&v);
            reasoning.push_str(&r);
        }
        let (v, r) = tracker.finish();
        visible.push_str(&v);
        reasoning.push_str(&r);
        assert_eq!(visible, " done");
        assert_eq!(reasoning, "planning");
    }

    #[test]
    fn collect_schema_properties_merges_multiple_tools_without_duplicates() {
        let tools = vec![
            json!({"function": {"name": "a", "parameters": {"properties": {"x": {}, "y": {}}}}}),
            json!({"function": {"name": "b", "parameters": {"properties": {"y": {}, "z": {}}}}}),
        ];
        let properties = collect_schema_properties(&tools);
        assert_eq!(properties, vec!["x".to_string(), "y".to_string(), "z".to_string()]);
    }

    #[test]
    fn usage_value_omits_cached_tokens_when_zero() {
        let value = usage_value(GenerationCounts {
            prompt_tokens: 10,
            completion_tokens: 5,
            cached_tokens: 0,
        });
        assert!(value.get("cached_tokens").is_none());
    }

    #[test]
    fn usage_value_reports_cached_tokens_when_present() {
        let value = usage_value(GenerationCounts {
            prompt_tokens: 10,
            completion_tokens: 5,
            cached_tokens: 7,
        });
        assert_eq!(value["cached_tokens"], 7);
    }

    #[test]
    fn render_foundation_prompt_drops_system_messages() {
        let system = Message {
            role: Role::System,
            content: Some(MessageContent::Text("ignored".into())),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        };
        let user = Message {
            role: Role::User,
            content: Some(MessageContent::Text("hi".into())),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        };
        let prompt = render_foundation_prompt(&[system, user]);
        assert!(!prompt.contains("ignored"));
        assert!(prompt.contains("user: hi"));
    }
}
