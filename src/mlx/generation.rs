//! Generation pipeline (spec §4.3.2): prompt construction, KV-cache reuse,
//! the decoding loop, and post-processing. Shared by the streaming and
//! non-streaming call paths — both call `generate`, which differs only in
//! whether its `on_event` sink is wired to an SSE writer or an accumulator.
//!
//! Grounded on `web/chat/generation.rs::evaluate_text_prompt` for the
//! overall shape (tokenize → reuse-or-fresh KV state → decode loop →
//! post-process), composing `mlx::kv_cache`, `mlx::stop_machine`,
//! `mlx::tool_extract`, `mlx::arg_remap`, and `mlx::templates`.

use std::ops::ControlFlow;

use serde_json::Value;

use crate::error::{AfmError, AfmResult};
use crate::mlx::arg_remap;
use crate::mlx::container::SamplingParams;
use crate::mlx::service::MlxService;
use crate::mlx::stop_machine::{StopEvent, StopMachine};
use crate::mlx::templates::{self, ToolCallParser};
use crate::mlx::tool_extract;
use crate::types::{
    ChatCompletionRequest, GenerationCounts, Message, ResponseFormat, TokenLogprob, ToolCall,
};

/// One event the pipeline hands to the caller as generation proceeds.
pub enum GenerationEvent {
    Delta {
        text: String,
        logprobs: Option<Vec<TokenLogprob>>,
    },
    ToolCalls(Vec<ToolCall>),
    Done {
        finish_reason: &'static str,
        counts: GenerationCounts,
    },
}

pub struct GenerationRequest<'a> {
    pub chat_request: &'a ChatCompletionRequest,
    pub tool_call_parser_override: Option<ToolCallParser>,
    pub fix_tool_args: bool,
    pub schema_properties: Vec<String>,
    pub want_logprobs: bool,
}

/// Run one full generation. `on_event` is invoked once per pipeline event
/// in strict order (spec §5 "delta chunks are emitted in strict monotonic
/// order"); cancellation is expressed by `on_event` returning `false`.
pub async fn generate(
    service: &MlxService,
    request: GenerationRequest<'_>,
    mut on_event: impl FnMut(GenerationEvent) -> bool,
) -> AfmResult<()> {
    validate_randomness(request.chat_request)?;

    let response_format_wants_json = matches!(
        request.chat_request.response_format,
        Some(ResponseFormat::JsonObject) | Some(ResponseFormat::JsonSchema { .. })
    );
    let json_schema = match &request.chat_request.response_format {
        Some(ResponseFormat::JsonSchema { json_schema }) => Some(json_schema),
        _ => None,
    };

    let prompt_messages =
        templates::build_prompt_messages(&request.chat_request.messages, response_format_wants_json, json_schema);

    let tools: Vec<Value> = request
        .chat_request
        .tools
        .clone()
        .unwrap_or_default();

    let templated_prompt = match request.tool_call_parser_override {
        Some(parser) if !tools.is_empty() => parser
            .render(&prompt_messages, &tools)
            .map_err(AfmError::LoadFailed)?,
        _ => render_plain(&prompt_messages),
    };

    let has_image = templates::has_image_content(&request.chat_request.messages);
    let opens_think = templates::prompt_ends_with_open_think(&templated_prompt);

    let sampling = SamplingParams {
        temperature: request.chat_request.temperature,
        repetition_penalty: request.chat_request.repetition_penalty,
        min_p: request.chat_request.min_p,
        presence_penalty: request.chat_request.presence_penalty,
        max_tokens: request.chat_request.effective_max_tokens(),
        randomness: crate::foundation::randomness::from_request(request.chat_request),
    };

    let stop_strings = request.chat_request.stop_strings();
    let fix_tool_args = request.fix_tool_args;
    let schema_properties = request.schema_properties;
    let want_logprobs = request.want_logprobs;
    let wants_tools = !tools.is_empty();

    let result = service
        .with_inner(|view| -> AfmResult<(String, Vec<ToolCall>, GenerationCounts, &'static str)> {
            let tokens = view.container.tokenize(&templated_prompt);

            let reuse = if has_image {
                crate::mlx::kv_cache::ReuseDecision {
                    reused_len: 0,
                    kv_state: None,
                }
            } else {
                view.prompt_cache_box.reuse(view.model_id, &tokens)
            };

            let mut kv_state = reuse
                .kv_state
                .unwrap_or_else(|| view.container.fresh_kv_state());
            let suffix = &tokens[reuse.reused_len..];

            let mut stop_machine = StopMachine::new(stop_strings.clone());
            let mut raw_output = String::new();
            // Native tool-call events are a real MLX binding's job (see
            // `DESIGN.md`); until one exists this stays empty and the
            // fallback extractor below does the work.
            let mut tool_calls_from_backend: Vec<ToolCall> = Vec::new();
            let mut stopped = false;
            let mut cancelled = false;
            let mut counts = GenerationCounts::default();

            if opens_think && !cancelled {
                raw_output.push_str("<think>");
                if !on_event(GenerationEvent::Delta {
                    text: "<think>".to_string(),
                    logprobs: None,
                }) {
                    cancelled = true;
                }
            }

            let gen_result = view.container.generate(
                suffix,
                kv_state.as_mut(),
                &sampling,
                &mut |token| {
                    if cancelled || stopped {
                        return ControlFlow::Break(());
                    }
                    raw_output.push_str(&token.text);
                    let events = stop_machine.push(&token.text);
                    let logprobs = if want_logprobs {
                        Some(vec![TokenLogprob {
                            token: token.text.clone(),
                            logprob: token.logprob,
                            top_logprobs: token.top_logprobs.clone(),
                        }])
                    } else {
                        None
                    };
                    for (i, event) in events.into_iter().enumerate() {
                        let (text, is_stop) = match event {
                            StopEvent::Emit(t) => (t, false),
                            StopEvent::Stop(t) => (t, true),
                        };
                        let ok = on_event(GenerationEvent::Delta {
                            text,
                            logprobs: if i == 0 { logprobs.clone() } else { None },
                        });
                        if is_stop {
                            stopped = true;
                        }
                        if !ok {
                            cancelled = true;
                        }
                    }
                    if stopped || cancelled {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                },
            );

            let stats = gen_result.map_err(AfmError::LoadFailed)?;
            counts.prompt_tokens = stats.prompt_tokens.max(suffix.len() as u64) + reuse.reused_len as u64;
            counts.completion_tokens = stats.completion_tokens;
            counts.cached_tokens = reuse.reused_len as u64;

            if !stopped && !cancelled {
                if let Some(event) = stop_machine.finish() {
                    if let StopEvent::Emit(text) = event {
                        on_event(GenerationEvent::Delta { text, logprobs: None });
                    }
                }
            }

            if cancelled {
                // Per spec §5: leave the prompt-cache box untouched.
                return Err(AfmError::Cancelled);
            }

            view.prompt_cache_box
                .store(view.model_id.to_string(), tokens, kv_state);

            let mut content = raw_output;
            let mut calls = tool_calls_from_backend.drain(..).collect::<Vec<_>>();
            if calls.is_empty() && wants_tools {
                let (stripped, extracted) = tool_extract::extract(&content);
                content = stripped;
                calls = extracted;
            }
            if fix_tool_args && !calls.is_empty() {
                for call in &mut calls {
                    let args: Value = serde_json::from_str(&call.function.arguments)
                        .unwrap_or(Value::Object(Default::default()));
                    let remapped = arg_remap::remap(&args, &schema_properties);
                    call.function.arguments = tool_extract::canonical_arguments(&remapped);
                }
            }

            if counts.completion_tokens == 0 {
                let (chars, words) = (content.chars().count(), content.split_whitespace().count());
                counts.completion_tokens =
                    (chars as f64 / 4.0).max(words as f64 / 0.75).floor() as u64;
            }

            let finish_reason = if !calls.is_empty() {
                "tool_calls"
            } else if stopped {
                "stop"
            } else {
                "length"
            };

            Ok((content, calls, counts, finish_reason))
        })
        .await?;

    match result {
        Ok((_, calls, counts, finish_reason)) => {
            if !calls.is_empty() {
                on_event(GenerationEvent::ToolCalls(calls));
            }
            on_event(GenerationEvent::Done {
                finish_reason,
                counts,
            });
            Ok(())
        }
        Err(AfmError::Cancelled) => Err(AfmError::Cancelled),
        Err(other) => Err(other),
    }
}

pub(crate) fn render_plain(messages: &[Value]) -> String {
    let mut out = String::new();
    for message in messages {
        let role = message["role"].as_str().unwrap_or("user");
        let content = message["content"].as_str().unwrap_or("");
        out.push_str(&format!("{role}: {content}\n"));
    }
    out.push_str("assistant:");
    out
}

fn validate_randomness(request: &ChatCompletionRequest) -> AfmResult<()> {
    if request.top_p.is_some() && request.top_k.is_some() {
        return Err(AfmError::ConflictingSamplingModes(
            "top_p and top_k are mutually exclusive".to_string(),
        ));
    }
    Ok(())
}

/// Re-derive a plain-text `Message` list's token-count fallback without
/// running any model — used by the non-streaming completion path when
/// estimating usage for a system/tool message round trip.
pub fn estimate_tokens(messages: &[Message]) -> u64 {
    let text: String = messages.iter().map(|m| m.text()).collect::<Vec<_>>().join(" ");
    let chars = text.chars().count();
    let words = text.split_whitespace().count();
    (chars as f64 / 4.0).max(words as f64 / 0.75).floor() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mlx::cache_resolver::CacheResolver;
    use crate::mlx::container::mock::MockContainer;
    use crate::mlx::container::Container;
    use crate::mlx::registry::ModelRegistry;
    use crate::mlx::service::{ContainerLoader, WeightFetcher};
    use crate::types::{MessageContent, ModelCapabilities, Role};
    use std::future::Future;
    use std::path::Path;
    use std::pin::Pin;

    struct NeverFetch;
    impl WeightFetcher for NeverFetch {
        fn fetch<'a>(
            &'a self,
            _model_id: &'a str,
            _progress: crate::mlx::service::ProgressSink,
        ) -> Pin<Box<dyn Future<Output = AfmResult<()>> + Send + 'a>> {
            Box::pin(async { Err(AfmError::ModelNotFoundInCache("demo".to_string())) })
        }
    }

    struct ScriptLoader {
        script: &'static str,
    }
    impl ContainerLoader for ScriptLoader {
        fn load(&self, _weight_dir: &Path, model_id: &str) -> AfmResult<Box<dyn Container>> {
            Ok(Box::new(MockContainer {
                id: model_id.to_string(),
                caps: ModelCapabilities::default(),
                script: self.script.to_string(),
            }))
        }
    }

    fn user(text: &str) -> Message {
        Message {
            role: Role::User,
            content: Some(MessageContent::Text(text.to_string())),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    async fn service_with_script(script: &'static str) -> MlxService {
        let tmp = std::env::temp_dir().join(format!("afm-gen-test-{}", uuid::Uuid::new_v4()));
        let resolver = CacheResolver::new(tmp.clone());
        let registry = ModelRegistry::new(tmp.join("registry.json"));
        let service = MlxService::new(
            resolver,
            registry,
            Box::new(NeverFetch),
            Box::new(ScriptLoader { script }),
            None,
        );
        // Force a "loaded" state directly via with_inner isn't exposed, so
        // route through ensure_loaded with a weight dir that already
        // resolves — write a minimal one on disk.
        let weight_dir = tmp.join("mlx-community").join("demo");
        std::fs::create_dir_all(&weight_dir).unwrap();
        std::fs::write(weight_dir.join("config.json"), "{}").unwrap();
        std::fs::write(weight_dir.join("model.safetensors"), []).unwrap();
        service.ensure_loaded("demo", None).await.unwrap();
        service
    }

    #[tokio::test]
    async fn scenario_s1_stop_sequence_truncates_output() {
        let service = service_with_script("hello world END here").await;
        let request = ChatCompletionRequest {
            model: "demo".into(),
            messages: vec![user("hi")],
            temperature: None,
            top_p: None,
            top_k: None,
            min_p: None,
            max_tokens: None,
            max_completion_tokens: None,
            frequency_penalty: None,
            presence_penalty: None,
            repetition_penalty: None,
            stop: Some(crate::types::StopSequences::One("END".to_string())),
            stream: true,
            tools: None,
            tool_choice: None,
            response_format: None,
            logprobs: None,
            top_logprobs: None,
            seed: None,
        };
        let mut emitted = String::new();
        let mut finish_reason = "";
        generate(
            &service,
            GenerationRequest {
                chat_request: &request,
                tool_call_parser_override: None,
                fix_tool_args: false,
                schema_properties: Vec::new(),
                want_logprobs: false,
            },
            |event| {
                match event {
                    GenerationEvent::Delta { text, .. } => emitted.push_str(&text),
                    GenerationEvent::Done { finish_reason: fr, .. } => finish_reason = fr,
                    GenerationEvent::ToolCalls(_) => {}
                }
                true
            },
        )
        .await
        .unwrap();
        assert!(emitted.contains("hello world"));
        assert!(!emitted.contains("here"));
        assert_eq!(finish_reason, "stop");
    }

    #[test]
    fn conflicting_sampling_modes_rejected() {
        let request = ChatCompletionRequest {
            model: "demo".into(),
            messages: vec![user("hi")],
            temperature: None,
            top_p: Some(0.9),
            top_k: Some(50),
            min_p: None,
            max_tokens: None,
            max_completion_tokens: None,
            frequency_penalty: None,
            presence_penalty: None,
            repetition_penalty: None,
            stop: None,
            stream: false,
            tools: None,
            tool_choice: None,
            response_format: None,
            logprobs: None,
            top_logprobs: None,
            seed: None,
        };
        assert!(matches!(
            validate_randomness(&request),
            Err(AfmError::ConflictingSamplingModes(_))
        ));
    }

    #[test]
    fn token_estimate_uses_char_and_word_floor() {
        let messages = vec![user("one two three four")];
        // 19 chars / 4 = 4.75, 4 words / 0.75 = 5.33 -> floor(5.33) = 5
        assert_eq!(estimate_tokens(&messages), 5);
    }
}
