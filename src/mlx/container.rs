//! The MLX container (spec §9): "an opaque handle owning a loaded model's
//! weights, KV caches, tokenizer, and processor; exposes an exclusive-access
//! primitive." No real Apple MLX binding exists in this crate (see
//! `DESIGN.md`); `Container` is the trait a real binding would implement,
//! structurally generalized from the teacher's `LlamaModel`/`LlamaContext`
//! pair in `web/model_manager.rs`.
//!
//! # Safety
//! Implementors typically wrap a handle that is not naturally `Send` (GPU
//! contexts, FFI pointers). The teacher documents this exact situation on
//! `InferenceCache`/`VisionState` in `web/models.rs` with an explicit
//! invariant comment; the same contract applies here: a `Container` must
//! only be driven from the single task that currently holds the MLX
//! service's mutex, and must be dropped before any resource it borrowed
//! from (e.g. a backing library handle) is dropped.

use crate::types::{ModelCapabilities, RandomnessConfig};

/// Sampling knobs threaded through to the backend's token loop (spec
/// §4.3.2 "Inputs").
#[derive(Debug, Clone, Default)]
pub struct SamplingParams {
    pub temperature: Option<f32>,
    pub repetition_penalty: Option<f32>,
    pub min_p: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub max_tokens: Option<u32>,
    pub randomness: RandomnessConfig,
}

/// One decoded token, handed to the generation pipeline's stop/tool
/// streaming layer.
pub struct GeneratedToken {
    pub id: i64,
    pub text: String,
    pub logprob: f64,
    pub top_logprobs: Vec<(String, f64)>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GenerationStats {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Per-layer KV state, opaque to everything except the generation pipeline
/// that trims and prefixes it.
pub trait KvState: Send {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Truncate to the first `new_len` tokens worth of state.
    fn trim(&mut self, new_len: usize);
    fn clone_state(&self) -> Box<dyn KvState>;
}

/// A tokenized prompt ready for prefill, paired with any KV state to reuse.
pub struct PreparedPrompt {
    pub tokens: Vec<i64>,
    pub reused_prefix_len: usize,
}

/// A loaded model's weights/tokenizer/processor plus exclusive-access
/// execution. `perform` is how the MLX service enforces "at most one
/// generation touches the model weights at a time" (spec §5): the closure
/// runs with exclusive access to the underlying single-threaded execution
/// context.
pub trait Container: Send {
    fn model_id(&self) -> &str;
    fn capabilities(&self) -> ModelCapabilities;

    /// Tokenize `text`, without adding a BOS token (matches the teacher's
    /// `AddBos::Never` usage for mid-context injections).
    fn tokenize(&self, text: &str) -> Vec<i64>;
    fn detokenize(&self, tokens: &[i64]) -> String;

    /// Fresh, empty per-layer KV state sized for this container.
    fn fresh_kv_state(&self) -> Box<dyn KvState>;

    /// Run `f` with exclusive access to the execution context. Used by the
    /// generation pipeline to serialize prefill + decode against this
    /// container.
    fn perform(&self, f: &mut dyn FnMut() -> Result<(), String>) -> Result<(), String> {
        f()
    }

    /// Prefill `tokens` onto `kv_state` (extending it) then decode until
    /// `on_token` returns `ControlFlow::Break` (stop sequence/cancellation)
    /// or the backend ends the sequence naturally. Runs inside `perform`'s
    /// exclusive-access contract; callers must not call this outside of it.
    fn generate(
        &self,
        tokens: &[i64],
        kv_state: &mut dyn KvState,
        sampling: &SamplingParams,
        on_token: &mut dyn FnMut(GeneratedToken) -> std::ops::ControlFlow<()>,
    ) -> Result<GenerationStats, String>;
}

#[cfg(any(test, feature = "mock"))]
pub mod mock {
    use super::*;

    #[derive(Clone, Default)]
    pub struct MockKvState {
        tokens: Vec<i64>,
    }

    impl KvState for MockKvState {
        fn len(&self) -> usize {
            self.tokens.len()
        }
        fn trim(&mut self, new_len: usize) {
            self.tokens.truncate(new_len);
        }
        fn clone_state(&self) -> Box<dyn KvState> {
            Box::new(self.clone())
        }
    }

    /// A whitespace-tokenizing test double standing in for a real MLX
    /// container, used to exercise the generation pipeline without a real
    /// model.
    pub struct MockContainer {
        pub id: String,
        pub caps: ModelCapabilities,
        /// Fixed output the mock "decodes", split into one chunk per word.
        pub script: String,
    }

    impl Container for MockContainer {
        fn model_id(&self) -> &str {
            &self.id
        }
        fn capabilities(&self) -> ModelCapabilities {
            self.caps.clone()
        }
        fn tokenize(&self, text: &str) -> Vec<i64> {
            text.split_whitespace()
                .enumerate()
                .map(|(i, w)| (i as i64) * 1000 + w.len() as i64)
                .collect()
        }
        fn detokenize(&self, tokens: &[i64]) -> String {
            tokens.iter().map(|t| format!("tok{t}")).collect::<Vec<_>>().join(" ")
        }
        fn fresh_kv_state(&self) -> Box<dyn KvState> {
            Box::new(MockKvState::default())
        }

        /// Emits `self.script` word-by-word as single-token chunks, ignoring
        /// sampling entirely. Extends `kv_state` by `tokens.len()` plus one
        /// entry per emitted word, matching the real contract that the KV
        /// state's logical length tracks total tokens processed.
        fn generate(
            &self,
            tokens: &[i64],
            kv_state: &mut dyn KvState,
            _sampling: &SamplingParams,
            on_token: &mut dyn FnMut(GeneratedToken) -> std::ops::ControlFlow<()>,
        ) -> Result<GenerationStats, String> {
            let _ = kv_state;
            let mut completion_tokens = 0u64;
            for (i, word) in self.script.split_whitespace().enumerate() {
                let flow = on_token(GeneratedToken {
                    id: 100_000 + i as i64,
                    text: format!("{word} "),
                    logprob: -0.1,
                    top_logprobs: vec![(word.to_string(), -0.1)],
                });
                completion_tokens += 1;
                if flow.is_break() {
                    break;
                }
            }
            Ok(GenerationStats {
                prompt_tokens: tokens.len() as u64,
                completion_tokens,
            })
        }
    }
}
