//! Backend Proxy (spec §4.6): forwards a chat-completion request to a
//! discovered backend, rewriting the body per backend quirks and injecting
//! SSE diagnostics/timing on the way back.
//!
//! No teacher analog exists (the teacher only ever talks to its own
//! in-process model) — grounded on spec §9's "per-backend adapter" design
//! note and on `web/routes/chat.rs::handle_post_chat_stream`'s
//! `data: <json>\n\n` / `data: [DONE]\n\n` SSE framing idiom.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::error::{AfmError, AfmResult};
use crate::gateway::backends::FIXED_BEARER_TOKEN;

const NON_STREAMING_TIMEOUT: Duration = Duration::from_secs(120);
const STREAMING_TIMEOUT: Duration = Duration::from_secs(300);

const OLLAMA_OPTION_KEYS: &[&str] = &[
    "top_k",
    "min_p",
    "repeat_penalty",
    "repeat_last_n",
    "typical_p",
    "mirostat",
    "mirostat_tau",
    "mirostat_eta",
    "num_predict",
    "tfs_z",
];

/// Per-backend adapter (spec §9): a cleaner seam than conditionals
/// sprinkled through the proxy body.
pub trait BackendAdapter: Send + Sync {
    fn rewrite_body(&self, body: Value) -> Value {
        body
    }
    fn post_process_stream_line(&self, line: String) -> String {
        line
    }
}

pub struct DefaultAdapter;
impl BackendAdapter for DefaultAdapter {}

pub struct OllamaAdapter;
impl BackendAdapter for OllamaAdapter {
    fn rewrite_body(&self, mut body: Value) -> Value {
        let Some(object) = body.as_object_mut() else {
            return body;
        };
        let mut options = object
            .remove("options")
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();

        for key in OLLAMA_OPTION_KEYS {
            if let Some(value) = object.remove(*key) {
                options.insert(key.to_string(), value);
            }
        }
        // mirostat* wildcard: any remaining top-level key literally starting
        // with "mirostat" also moves in.
        let mirostat_keys: Vec<String> = object
            .keys()
            .filter(|k| k.starts_with("mirostat"))
            .cloned()
            .collect();
        for key in mirostat_keys {
            if let Some(value) = object.remove(&key) {
                options.insert(key, value);
            }
        }

        if let Some(temperature) = object.get("temperature").cloned() {
            options.insert("temperature".to_string(), temperature);
        }
        if let Some(seed) = object.get("seed").cloned() {
            options.insert("seed".to_string(), seed);
        }

        if !options.is_empty() {
            object.insert("options".to_string(), Value::Object(options));
        }

        if object.get("stream").and_then(Value::as_bool) == Some(true) {
            object.insert(
                "stream_options".to_string(),
                json!({ "include_usage": true }),
            );
        }

        body
    }
}

pub fn adapter_for(backend_name: &str) -> Box<dyn BackendAdapter> {
    if backend_name == "Ollama" {
        Box::new(OllamaAdapter)
    } else {
        Box::new(DefaultAdapter)
    }
}

/// Keep all system messages and the last user message only (spec §4.6,
/// scenario S6).
pub fn strip_history(body: &mut Value) {
    let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) else {
        return;
    };
    let last_user_index = messages
        .iter()
        .rposition(|m| m.get("role").and_then(Value::as_str) == Some("user"));

    let mut kept = Vec::new();
    for (i, message) in messages.iter().enumerate() {
        let is_system = message.get("role").and_then(Value::as_str) == Some("system");
        let is_last_user = Some(i) == last_user_index;
        if is_system || is_last_user {
            kept.push(message.clone());
        }
    }
    *messages = kept;
}

/// Rewrite the outgoing body: replace `model`, optionally strip history,
/// then apply the backend adapter.
pub fn rewrite_body(
    mut body: Value,
    original_model_id: &str,
    adapter: &dyn BackendAdapter,
    should_strip_history: bool,
) -> Value {
    if let Some(object) = body.as_object_mut() {
        object.insert("model".to_string(), json!(original_model_id));
    }
    if should_strip_history {
        strip_history(&mut body);
    }
    adapter.rewrite_body(body)
}

/// Tracks the last model proxied to, to decide the strip-history flag
/// (spec §4.6).
pub struct BackendProxy {
    client: reqwest::Client,
    last_proxied_model: Mutex<Option<String>>,
}

impl Default for BackendProxy {
    fn default() -> Self {
        BackendProxy {
            client: reqwest::Client::new(),
            last_proxied_model: Mutex::new(None),
        }
    }
}

impl BackendProxy {
    pub fn new() -> Self {
        Self::default()
    }

    fn take_strip_history_flag(&self, original_model_id: &str) -> bool {
        let mut guard = self.last_proxied_model.lock().expect("proxy lock poisoned");
        let should_strip = guard.as_deref() != Some(original_model_id);
        *guard = Some(original_model_id.to_string());
        should_strip
    }

    pub async fn proxy_request(
        &self,
        base_url: &str,
        original_model_id: &str,
        backend_name: &str,
        body: Value,
    ) -> AfmResult<Value> {
        let should_strip_history = self.take_strip_history_flag(original_model_id);
        let adapter = adapter_for(backend_name);
        let rewritten = rewrite_body(body, original_model_id, adapter.as_ref(), should_strip_history);

        let url = format!("{base_url}/v1/chat/completions");
        let response = tokio::time::timeout(
            NON_STREAMING_TIMEOUT,
            self.client
                .post(&url)
                .bearer_auth(FIXED_BEARER_TOKEN)
                .json(&rewritten)
                .send(),
        )
        .await
        .map_err(|_| AfmError::BackendUnreachable(format!("{backend_name} timed out")))?
        .map_err(|e| AfmError::BackendUnreachable(format!("{backend_name}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AfmError::BackendUnreachable(format!(
                "{backend_name} returned {status}"
            )));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| AfmError::BackendUnreachable(format!("{backend_name}: malformed response ({e})")))
    }

    /// Streaming proxy (spec §4.6): drives `on_line` with each raw SSE
    /// `data: ...` line (newline-terminated) and returns once `[DONE]` has
    /// been emitted or `on_line` returns `false` (client disconnected).
    pub async fn proxy_streaming_request(
        &self,
        base_url: &str,
        original_model_id: &str,
        backend_name: &str,
        body: Value,
        mut on_line: impl FnMut(String) -> bool,
    ) -> AfmResult<()> {
        let should_strip_history = self.take_strip_history_flag(original_model_id);
        let adapter = adapter_for(backend_name);
        let rewritten = rewrite_body(body, original_model_id, adapter.as_ref(), should_strip_history);

        let url = format!("{base_url}/v1/chat/completions");
        let send_result = tokio::time::timeout(
            STREAMING_TIMEOUT,
            self.client
                .post(&url)
                .bearer_auth(FIXED_BEARER_TOKEN)
                .json(&rewritten)
                .send(),
        )
        .await;

        let response = match send_result {
            Ok(Ok(response)) if response.status().is_success() => response,
            Ok(Ok(response)) => {
                emit_status_diagnostic(response.status().as_u16(), &mut on_line);
                return Ok(());
            }
            Ok(Err(e)) => {
                emit_status_diagnostic(502, &mut on_line);
                return Err(AfmError::BackendUnreachable(format!("{backend_name}: {e}")));
            }
            Err(_) => {
                emit_status_diagnostic(504, &mut on_line);
                return Err(AfmError::BackendUnreachable(format!("{backend_name} timed out")));
            }
        };

        self.stream_with_timing_injection(response, adapter.as_ref(), &mut on_line).await;
        Ok(())
    }

    async fn stream_with_timing_injection(
        &self,
        response: reqwest::Response,
        adapter: &dyn BackendAdapter,
        on_line: &mut impl FnMut(String) -> bool,
    ) {
        use futures_util::StreamExt;

        let stream_start = Instant::now();
        let mut first_token_time: Option<Instant> = None;
        let mut last_data_line: Option<String> = None;
        let mut observed_usage: Option<Value> = None;
        let mut byte_stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = byte_stream.next().await {
            let Ok(bytes) = chunk else { break };
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = buffer.find("\n\n") {
                let raw_event: String = buffer.drain(..pos + 2).collect();
                let Some(data) = raw_event.strip_prefix("data: ").map(|s| s.trim_end()) else {
                    continue;
                };

                if data == "[DONE]" {
                    if let Some(line) = last_data_line.take() {
                        let augmented = inject_timings_if_absent(
                            &line,
                            stream_start,
                            first_token_time,
                            observed_usage.take(),
                        );
                        if !on_line(format!("data: {}\n\n", adapter.post_process_stream_line(augmented))) {
                            return;
                        }
                    }
                    let _ = on_line("data: [DONE]\n\n".to_string());
                    return;
                }

                if first_token_time.is_none() {
                    first_token_time = Some(Instant::now());
                }

                if let Ok(value) = serde_json::from_str::<Value>(data) {
                    if let Some(usage) = value.get("usage") {
                        observed_usage = Some(usage.clone());
                    }
                }

                if let Some(previous) = last_data_line.replace(data.to_string()) {
                    if !on_line(format!("data: {}\n\n", adapter.post_process_stream_line(previous))) {
                        return;
                    }
                }
            }
        }

        if let Some(line) = last_data_line.take() {
            let augmented =
                inject_timings_if_absent(&line, stream_start, first_token_time, observed_usage.take());
            let _ = on_line(format!("data: {}\n\n", adapter.post_process_stream_line(augmented)));
        }
        let _ = on_line("data: [DONE]\n\n".to_string());
    }
}

fn inject_timings_if_absent(
    line: &str,
    stream_start: Instant,
    first_token_time: Option<Instant>,
    usage: Option<Value>,
) -> String {
    let Ok(mut value) = serde_json::from_str::<Value>(line) else {
        return line.to_string();
    };
    let Some(object) = value.as_object_mut() else {
        return line.to_string();
    };
    if object.contains_key("timings") {
        return line.to_string();
    }

    let first_token_time = first_token_time.unwrap_or(stream_start);
    let prompt_ms = first_token_time.saturating_duration_since(stream_start).as_secs_f64() * 1000.0;
    let predicted_ms = Instant::now().saturating_duration_since(first_token_time).as_secs_f64() * 1000.0;

    let (prompt_n, predicted_n) = usage
        .as_ref()
        .map(|u| {
            (
                u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
                u.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
            )
        })
        .unwrap_or((0, 0));

    object.insert(
        "timings".to_string(),
        json!({
            "prompt_n": prompt_n,
            "prompt_ms": prompt_ms,
            "predicted_n": predicted_n,
            "predicted_ms": predicted_ms,
        }),
    );
    serde_json::to_string(&value).unwrap_or_else(|_| line.to_string())
}

/// User-facing explanation for a non-2xx backend status (spec §4.6):
/// emitted as a single SSE content chunk, then a finish chunk, then
/// `[DONE]`.
fn emit_status_diagnostic(status: u16, on_line: &mut impl FnMut(String) -> bool) {
    let message = match status {
        401 | 403 => "The backend rejected the request (authentication/authorization failed).",
        404 => "The requested model was not found on the backend.",
        500..=599 => "The backend encountered an internal error.",
        _ => "The backend returned an unexpected error.",
    };
    let content_chunk = json!({
        "choices": [{ "delta": { "content": message }, "index": 0, "finish_reason": null }]
    });
    let finish_chunk = json!({
        "choices": [{ "delta": {}, "index": 0, "finish_reason": "stop" }]
    });
    if !on_line(format!("data: {content_chunk}\n\n")) {
        return;
    }
    if !on_line(format!("data: {finish_chunk}\n\n")) {
        return;
    }
    let _ = on_line("data: [DONE]\n\n".to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_s6_strip_history_keeps_system_and_last_user() {
        let mut body = json!({
            "model": "x",
            "messages": [
                {"role": "system", "content": "sys"},
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "reply"},
                {"role": "user", "content": "second"},
                {"role": "assistant", "content": "reply2"},
                {"role": "user", "content": "third"},
            ]
        });
        strip_history(&mut body);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"], "third");
    }

    #[test]
    fn ollama_adapter_repacks_sampling_keys() {
        let body = json!({
            "model": "x",
            "top_k": 40,
            "min_p": 0.1,
            "temperature": 0.7,
            "seed": 7,
            "stream": true,
        });
        let rewritten = OllamaAdapter.rewrite_body(body);
        let options = rewritten.get("options").unwrap();
        assert_eq!(options["top_k"], 40);
        assert_eq!(options["min_p"], 0.1);
        assert_eq!(options["temperature"], 0.7);
        assert_eq!(options["seed"], 7);
        assert_eq!(rewritten["stream_options"]["include_usage"], true);
        assert!(rewritten.get("top_k").is_none());
    }

    #[test]
    fn default_adapter_passes_body_through() {
        let body = json!({"model": "x", "top_k": 5});
        let rewritten = DefaultAdapter.rewrite_body(body.clone());
        assert_eq!(rewritten, body);
    }

    #[test]
    fn rewrite_body_replaces_model_id() {
        let body = json!({"model": "display · Backend", "messages": []});
        let rewritten = rewrite_body(body, "original-id", &DefaultAdapter, false);
        assert_eq!(rewritten["model"], "original-id");
    }

    #[test]
    fn strip_history_flag_set_only_on_model_change() {
        let proxy = BackendProxy::new();
        assert!(proxy.take_strip_history_flag("model-a"));
        assert!(!proxy.take_strip_history_flag("model-a"));
        assert!(proxy.take_strip_history_flag("model-b"));
    }

    #[test]
    fn timings_injection_skips_when_already_present() {
        let line = json!({"timings": {"prompt_n": 1}}).to_string();
        let out = inject_timings_if_absent(&line, Instant::now(), None, None);
        assert_eq!(out, line);
    }
}
