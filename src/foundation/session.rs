//! Foundation Session Service (spec §4.4): a thin adapter over a
//! platform-provided on-device language-model session.
//!
//! No platform binding exists in this crate — `PlatformBackend` is the
//! trait a real `FoundationModels` binding would implement, structurally
//! generalized the same way `mlx::container::Container` stands in for a
//! real MLX binding (see `DESIGN.md`). The `Arc<Mutex<Option<T>>>`
//! process-singleton shape is grounded on `web/models.rs::SharedLlamaState`,
//! adapted from "lazily initialized on first chat request" to spec §9's
//! "never auto-initialized on demand" singleton discipline.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::warn;
use tokio::sync::Mutex;

use crate::error::{AfmError, AfmResult};
use crate::types::RandomnessConfig;

const EXPECTED_ADAPTER_EXTENSION: &str = "fmadapter";

/// The platform collaborator this service wraps. A real implementation
/// talks to Apple's on-device FoundationModels framework; `MockBackend`
/// below stands in for it in tests.
pub trait PlatformBackend: Send + Sync {
    fn respond(&self, instructions: &str, prompt: &str, randomness: &RandomnessConfig) -> Result<String, String>;

    /// Streaming twin of `respond`: invokes `on_chunk` with each piece of
    /// text as it becomes available. `on_chunk` returns `false` to request
    /// early cancellation.
    fn stream_response(
        &self,
        instructions: &str,
        prompt: &str,
        randomness: &RandomnessConfig,
        on_chunk: &mut dyn FnMut(&str) -> bool,
    ) -> Result<(), String>;

    fn respond_guided(
        &self,
        instructions: &str,
        prompt: &str,
        schema: &serde_json::Value,
        randomness: &RandomnessConfig,
    ) -> Result<Vec<String>, String>;

    /// Streaming twin of `respond_guided`: invokes `on_chunk` with each
    /// cumulative snapshot as it is produced, same shape as the elements of
    /// `respond_guided`'s returned `Vec` (callers derive deltas via
    /// `guided_delta`).
    fn stream_response_guided(
        &self,
        instructions: &str,
        prompt: &str,
        schema: &serde_json::Value,
        randomness: &RandomnessConfig,
        on_chunk: &mut dyn FnMut(&str) -> bool,
    ) -> Result<(), String>;
}

pub struct FoundationSession {
    instructions: String,
    adapter_path: Option<PathBuf>,
    permissive_guardrails: bool,
    backend: Box<dyn PlatformBackend>,
}

impl FoundationSession {
    /// Construct a session, falling back to the default model (logging a
    /// warning) when `adapter_path` doesn't exist or has the wrong
    /// extension.
    pub fn new(
        instructions: String,
        adapter_path: Option<PathBuf>,
        permissive_guardrails: bool,
        backend: Box<dyn PlatformBackend>,
    ) -> Self {
        let adapter_path = adapter_path.and_then(|path| {
            if is_valid_adapter(&path) {
                Some(path)
            } else {
                warn!(
                    "adapter path {} is missing or has an unexpected extension; falling back to the default model",
                    path.display()
                );
                None
            }
        });
        FoundationSession {
            instructions,
            adapter_path,
            permissive_guardrails,
            backend,
        }
    }

    pub fn has_adapter(&self) -> bool {
        self.adapter_path.is_some()
    }

    pub fn permissive_guardrails(&self) -> bool {
        self.permissive_guardrails
    }

    pub fn respond(&self, prompt: &str, randomness: &RandomnessConfig) -> AfmResult<String> {
        self.backend
            .respond(&self.instructions, prompt, randomness)
            .map_err(|desc| classify_error(&desc))
    }

    /// Streaming twin of `respond`.
    pub fn stream_response(
        &self,
        prompt: &str,
        randomness: &RandomnessConfig,
        on_chunk: &mut dyn FnMut(&str) -> bool,
    ) -> AfmResult<()> {
        self.backend
            .stream_response(&self.instructions, prompt, randomness, on_chunk)
            .map_err(|desc| classify_error(&desc))
    }

    /// Guided generation: returns the raw cumulative snapshots the backend
    /// produced, in order (tests/callers compute deltas via
    /// `guided_delta`).
    pub fn respond_guided(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
        randomness: &RandomnessConfig,
    ) -> AfmResult<Vec<String>> {
        self.backend
            .respond_guided(&self.instructions, prompt, schema, randomness)
            .map_err(|desc| classify_error(&desc))
    }

    /// Streaming twin of `respond_guided`.
    pub fn stream_response_guided(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
        randomness: &RandomnessConfig,
        on_chunk: &mut dyn FnMut(&str) -> bool,
    ) -> AfmResult<()> {
        self.backend
            .stream_response_guided(&self.instructions, prompt, schema, randomness, on_chunk)
            .map_err(|desc| classify_error(&desc))
    }
}

fn is_valid_adapter(path: &Path) -> bool {
    path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(EXPECTED_ADAPTER_EXTENSION)
}

/// Outcome of comparing two consecutive guided-generation snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuidedDelta {
    /// The new snapshot extends the previous one; carries only the new
    /// suffix.
    Append(String),
    /// The new snapshot did not extend the previous one (a non-append
    /// mutation, per spec §9 "rare structural mutation"); carries the full
    /// new snapshot.
    Snapshot(String),
}

/// Compute an append-only delta when `new_snapshot` extends
/// `previous_snapshot`; otherwise emit the full new snapshot (spec §4.4).
pub fn guided_delta(previous_snapshot: &str, new_snapshot: &str) -> GuidedDelta {
    if let Some(suffix) = new_snapshot.strip_prefix(previous_snapshot) {
        GuidedDelta::Append(suffix.to_string())
    } else {
        GuidedDelta::Snapshot(new_snapshot.to_string())
    }
}

/// Pattern-match the platform backend's opaque error description into a
/// typed error (spec §4.4, §9 "contract with the platform"). Unclassified
/// errors propagate verbatim.
pub fn classify_error(description: &str) -> AfmError {
    let lower = description.to_lowercase();
    if lower.contains("context window exceeded") {
        if let Some((provided, maximum)) = extract_token_counts(description) {
            return AfmError::ContextWindowExceeded { provided, maximum };
        }
    }
    if lower.contains("guardrail") || lower.contains("unsafe content") {
        return AfmError::GuardrailViolation {
            reason: description.to_string(),
        };
    }
    AfmError::SessionCreationFailed(description.to_string())
}

/// Extract the first two comma-tolerant integers from the description,
/// interpreted as `(provided, maximum)`.
fn extract_token_counts(description: &str) -> Option<(u64, u64)> {
    let mut numbers = Vec::new();
    let mut current = String::new();
    for ch in description.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
        } else if ch == ',' && !current.is_empty() {
            // comma-tolerant: skip thousands separators mid-number
            continue;
        } else if !current.is_empty() {
            numbers.push(current.clone());
            current.clear();
        }
    }
    if !current.is_empty() {
        numbers.push(current);
    }
    if numbers.len() < 2 {
        return None;
    }
    let provided = numbers[0].parse().ok()?;
    let maximum = numbers[1].parse().ok()?;
    Some((provided, maximum))
}

/// Process-level shared session (spec §9: "model as a process-lifecycle
/// singleton with explicit `initialize()`/`shutdown()` entry points; never
/// auto-initialized on demand").
pub type SharedFoundationSession = Arc<Mutex<Option<FoundationSession>>>;

pub fn shared_slot() -> SharedFoundationSession {
    Arc::new(Mutex::new(None))
}

pub async fn initialize(slot: &SharedFoundationSession, session: FoundationSession, prewarm: bool) {
    if prewarm {
        let _ = session.respond("hello", &RandomnessConfig::default());
    }
    *slot.lock().await = Some(session);
}

pub async fn shutdown(slot: &SharedFoundationSession) {
    *slot.lock().await = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RandomnessMode;

    struct EchoBackend;
    impl PlatformBackend for EchoBackend {
        fn respond(&self, _instructions: &str, prompt: &str, _randomness: &RandomnessConfig) -> Result<String, String> {
            Ok(format!("echo: {prompt}"))
        }
        fn stream_response(
            &self,
            _instructions: &str,
            prompt: &str,
            _randomness: &RandomnessConfig,
            on_chunk: &mut dyn FnMut(&str) -> bool,
        ) -> Result<(), String> {
            for word in format!("echo: {prompt}").split_inclusive(' ') {
                if !on_chunk(word) {
                    break;
                }
            }
            Ok(())
        }
        fn respond_guided(
            &self,
            _instructions: &str,
            _prompt: &str,
            _schema: &serde_json::Value,
            _randomness: &RandomnessConfig,
        ) -> Result<Vec<String>, String> {
            Ok(vec!["{\"a\":1".to_string(), "{\"a\":1}".to_string()])
        }
        fn stream_response_guided(
            &self,
            _instructions: &str,
            _prompt: &str,
            _schema: &serde_json::Value,
            _randomness: &RandomnessConfig,
            on_chunk: &mut dyn FnMut(&str) -> bool,
        ) -> Result<(), String> {
            for snapshot in ["{\"a\":1", "{\"a\":1}"] {
                if !on_chunk(snapshot) {
                    break;
                }
            }
            Ok(())
        }
    }

    struct FailingBackend {
        message: &'static str,
    }
    impl PlatformBackend for FailingBackend {
        fn respond(&self, _instructions: &str, _prompt: &str, _randomness: &RandomnessConfig) -> Result<String, String> {
            Err(self.message.to_string())
        }
        fn stream_response(
            &self,
            _instructions: &str,
            _prompt: &str,
            _randomness: &RandomnessConfig,
            _on_chunk: &mut dyn FnMut(&str) -> bool,
        ) -> Result<(), String> {
            Err(self.message.to_string())
        }
        fn respond_guided(
            &self,
            _instructions: &str,
            _prompt: &str,
            _schema: &serde_json::Value,
            _randomness: &RandomnessConfig,
        ) -> Result<Vec<String>, String> {
            Err(self.message.to_string())
        }
        fn stream_response_guided(
            &self,
            _instructions: &str,
            _prompt: &str,
            _schema: &serde_json::Value,
            _randomness: &RandomnessConfig,
            _on_chunk: &mut dyn FnMut(&str) -> bool,
        ) -> Result<(), String> {
            Err(self.message.to_string())
        }
    }

    #[test]
    fn missing_adapter_falls_back_without_erroring() {
        let session = FoundationSession::new(
            "be helpful".to_string(),
            Some(PathBuf::from("/nonexistent/path.fmadapter")),
            false,
            Box::new(EchoBackend),
        );
        assert!(!session.has_adapter());
    }

    #[test]
    fn respond_propagates_backend_output() {
        let session = FoundationSession::new("be helpful".to_string(), None, false, Box::new(EchoBackend));
        assert_eq!(session.respond("hi", &RandomnessConfig::default()).unwrap(), "echo: hi");
    }

    #[test]
    fn stream_response_delivers_incremental_chunks() {
        let session = FoundationSession::new("be helpful".to_string(), None, false, Box::new(EchoBackend));
        let mut chunks = Vec::new();
        session
            .stream_response("hi", &RandomnessConfig::default(), &mut |chunk| {
                chunks.push(chunk.to_string());
                true
            })
            .unwrap();
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), "echo: hi");
    }

    #[test]
    fn stream_response_guided_delivers_cumulative_snapshots() {
        let session = FoundationSession::new("be helpful".to_string(), None, false, Box::new(EchoBackend));
        let mut snapshots = Vec::new();
        session
            .stream_response_guided(
                "hi",
                &serde_json::json!({}),
                &RandomnessConfig::default(),
                &mut |snapshot| {
                    snapshots.push(snapshot.to_string());
                    true
                },
            )
            .unwrap();
        assert_eq!(snapshots, vec!["{\"a\":1".to_string(), "{\"a\":1}".to_string()]);
    }

    #[test]
    fn failing_backend_stream_errors_are_classified() {
        let session = FoundationSession::new(
            "x".to_string(),
            None,
            false,
            Box::new(FailingBackend {
                message: "guardrail violation: profanity",
            }),
        );
        let err = session
            .stream_response("hi", &RandomnessConfig::default(), &mut |_| true)
            .unwrap_err();
        assert!(matches!(err, AfmError::GuardrailViolation { .. }));
    }

    #[test]
    fn classifies_context_window_exceeded() {
        let err = classify_error("context window exceeded: provided 5,000 tokens, maximum 4,096 allowed");
        match err {
            AfmError::ContextWindowExceeded { provided, maximum } => {
                assert_eq!(provided, 5000);
                assert_eq!(maximum, 4096);
            }
            other => panic!("expected ContextWindowExceeded, got {other:?}"),
        }
    }

    #[test]
    fn classifies_guardrail_violation() {
        let err = classify_error("response blocked by guardrail: unsafe content detected");
        match err {
            AfmError::GuardrailViolation { reason } => assert!(reason.contains("guardrail")),
            other => panic!("expected GuardrailViolation, got {other:?}"),
        }
    }

    #[test]
    fn unclassified_errors_propagate_verbatim() {
        let err = classify_error("the backend fell over for no good reason");
        match err {
            AfmError::SessionCreationFailed(msg) => assert_eq!(msg, "the backend fell over for no good reason"),
            other => panic!("expected SessionCreationFailed, got {other:?}"),
        }
    }

    #[test]
    fn failing_backend_errors_are_classified_through_respond() {
        let session = FoundationSession::new(
            "x".to_string(),
            None,
            false,
            Box::new(FailingBackend {
                message: "guardrail violation: profanity",
            }),
        );
        let err = session.respond("hi", &RandomnessConfig::default()).unwrap_err();
        assert!(matches!(err, AfmError::GuardrailViolation { .. }));
    }

    #[test]
    fn guided_delta_append_case() {
        let delta = guided_delta("{\"a\":1", "{\"a\":1}");
        assert_eq!(delta, GuidedDelta::Append("}".to_string()));
    }

    #[test]
    fn guided_delta_non_append_emits_full_snapshot() {
        let delta = guided_delta("{\"a\":1}", "{\"b\":2}");
        assert_eq!(delta, GuidedDelta::Snapshot("{\"b\":2}".to_string()));
    }

    #[tokio::test]
    async fn shared_slot_starts_empty_and_respects_explicit_lifecycle() {
        let slot = shared_slot();
        assert!(slot.lock().await.is_none());
        let session = FoundationSession::new("x".to_string(), None, false, Box::new(EchoBackend));
        initialize(&slot, session, false).await;
        assert!(slot.lock().await.is_some());
        shutdown(&slot).await;
        assert!(slot.lock().await.is_none());
    }

    #[test]
    fn randomness_mode_unused_import_guard() {
        let _ = RandomnessMode::Greedy;
    }
}
