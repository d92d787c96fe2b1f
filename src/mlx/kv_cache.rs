//! Prefix KV-cache reuse protocol (spec §4.3.2) and the prompt-cache box
//! (spec §3), the hardest part of the core.
//!
//! Grounded on `web/chat/generation.rs::evaluate_text_prompt`'s
//! longest-common-prefix computation (`zip().take_while()` against
//! `cache.evaluated_tokens`), extended with the 16-token minimum-new-suffix
//! rule spec.md adds on top of the teacher's version.

use crate::mlx::container::KvState;

/// Minimum number of new tokens that must be freshly prefilled even when a
/// longer prefix matches — "re-feeding one token is unstable and can
/// produce immediate end-of-sequence."
pub const MIN_NEW_SUFFIX: usize = 16;

/// Singleton per MLX service. Invariants (spec §3):
/// 1. `valid` implies all three fields are populated.
/// 2. The KV state's logical length equals `len(prompt_tokens)`.
/// 3. Invalidated on every model reload and on every generation error.
pub struct PromptCacheBox {
    prompt_tokens: Vec<i64>,
    kv_state: Option<Box<dyn KvState>>,
    model_id: Option<String>,
    valid: bool,
}

impl Default for PromptCacheBox {
    fn default() -> Self {
        PromptCacheBox {
            prompt_tokens: Vec::new(),
            kv_state: None,
            model_id: None,
            valid: false,
        }
    }
}

/// Outcome of consulting the cache box before a generation.
pub struct ReuseDecision {
    /// Length of the cached prefix that will actually be reused (`p` after
    /// the minimum-new-suffix adjustment).
    pub reused_len: usize,
    /// KV state trimmed to `reused_len`, ready to continue prefill from;
    /// `None` means a fresh state must be allocated.
    pub kv_state: Option<Box<dyn KvState>>,
}

impl PromptCacheBox {
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn model_id(&self) -> Option<&str> {
        self.model_id.as_deref()
    }

    /// Invalidate on model reload or generation error/cancellation — "on
    /// error or cancellation, leave the box untouched" means callers must
    /// *not* call `store` in that path, not that this method does nothing;
    /// `invalidate` is for reload and explicit failure handling.
    pub fn invalidate(&mut self) {
        self.prompt_tokens.clear();
        self.kv_state = None;
        self.model_id = None;
        self.valid = false;
    }

    /// Compute the longest common prefix with the incoming token sequence,
    /// enforce the minimum-new-suffix rule, and (if any prefix survives)
    /// hand back a trimmed clone of the cached KV state. Pure-text inputs
    /// only — the caller is responsible for skipping this when the
    /// request contains images/video.
    pub fn reuse(&self, model_id: &str, incoming_tokens: &[i64]) -> ReuseDecision {
        if !self.valid || self.model_id.as_deref() != Some(model_id) {
            return ReuseDecision {
                reused_len: 0,
                kv_state: None,
            };
        }

        let common_len = self
            .prompt_tokens
            .iter()
            .zip(incoming_tokens.iter())
            .take_while(|(a, b)| a == b)
            .count();

        // The minimum-new-suffix rule only applies when there's a small
        // nonzero amount of new text to feed ("re-feeding one token is
        // unstable"); an exact-match resend has nothing new to feed at all
        // and must reuse the full prefix (spec §8 scenario S2).
        let mut p = common_len;
        let new_suffix = incoming_tokens.len().saturating_sub(p);
        if new_suffix > 0 && new_suffix < MIN_NEW_SUFFIX {
            p = incoming_tokens.len().saturating_sub(MIN_NEW_SUFFIX);
        }

        if p == 0 {
            return ReuseDecision {
                reused_len: 0,
                kv_state: None,
            };
        }

        let mut trimmed = self.kv_state.as_ref().map(|k| k.clone_state());
        if let Some(state) = trimmed.as_mut() {
            state.trim(p);
        }

        ReuseDecision {
            reused_len: p,
            kv_state: trimmed,
        }
    }

    /// Store the final KV state after a *successful* generation, trimmed
    /// back to `len(prompt_tokens)` (i.e. excluding any generated
    /// continuation). Never called on the error/cancellation path.
    pub fn store(&mut self, model_id: String, prompt_tokens: Vec<i64>, mut kv_state: Box<dyn KvState>) {
        kv_state.trim(prompt_tokens.len());
        self.prompt_tokens = prompt_tokens;
        self.kv_state = Some(kv_state);
        self.model_id = Some(model_id);
        self.valid = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sized(usize);
    impl KvState for Sized {
        fn len(&self) -> usize {
            self.0
        }
        fn trim(&mut self, new_len: usize) {
            self.0 = self.0.min(new_len);
        }
        fn clone_state(&self) -> Box<dyn KvState> {
            Box::new(Sized(self.0))
        }
    }

    fn state_of_len(n: usize) -> Box<dyn KvState> {
        Box::new(Sized(n))
    }

    #[test]
    fn empty_box_never_reuses() {
        let box_ = PromptCacheBox::default();
        let decision = box_.reuse("m1", &[1, 2, 3]);
        assert_eq!(decision.reused_len, 0);
        assert!(decision.kv_state.is_none());
    }

    #[test]
    fn reuse_requires_matching_model_id() {
        let mut box_ = PromptCacheBox::default();
        box_.store("m1".into(), vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20], state_of_len(20));
        let decision = box_.reuse("m2", &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21]);
        assert_eq!(decision.reused_len, 0);
    }

    #[test]
    fn reuse_computes_longest_common_prefix() {
        let mut box_ = PromptCacheBox::default();
        let cached: Vec<i64> = (0..30).collect();
        box_.store("m1".into(), cached.clone(), state_of_len(30));

        let mut incoming = cached.clone();
        incoming.extend([999, 998, 997]); // 30 shared + 3 new = below MIN_NEW_SUFFIX
        let decision = box_.reuse("m1", &incoming);
        // p would be 30 but incoming.len() - 16 = 17, so p clamps to 17.
        assert_eq!(decision.reused_len, 17);
    }

    #[test]
    fn reuse_with_plenty_of_new_suffix_keeps_full_prefix() {
        let mut box_ = PromptCacheBox::default();
        let cached: Vec<i64> = (0..10).collect();
        box_.store("m1".into(), cached.clone(), state_of_len(10));

        let mut incoming = cached.clone();
        incoming.extend((100..140).collect::<Vec<_>>()); // 40 new tokens, well above 16
        let decision = box_.reuse("m1", &incoming);
        assert_eq!(decision.reused_len, 10);
        assert!(decision.kv_state.is_some());
    }

    #[test]
    fn exact_match_resend_reuses_the_full_prefix() {
        let mut box_ = PromptCacheBox::default();
        let cached: Vec<i64> = (0..30).collect();
        box_.store("m1".into(), cached.clone(), state_of_len(30));

        let decision = box_.reuse("m1", &cached);
        assert_eq!(decision.reused_len, cached.len());
        assert!(decision.kv_state.is_some());
    }

    #[test]
    fn diverging_prompt_reuses_nothing() {
        let mut box_ = PromptCacheBox::default();
        box_.store("m1".into(), vec![1, 2, 3], state_of_len(3));
        let decision = box_.reuse("m1", &[9, 8, 7, 6, 5, 4, 3, 2, 1, 0, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20]);
        assert_eq!(decision.reused_len, 0);
    }

    #[test]
    fn invalidate_clears_state() {
        let mut box_ = PromptCacheBox::default();
        box_.store("m1".into(), vec![1, 2, 3], state_of_len(3));
        assert!(box_.is_valid());
        box_.invalidate();
        assert!(!box_.is_valid());
        assert_eq!(box_.reuse("m1", &[1, 2, 3]).reused_len, 0);
    }
}
