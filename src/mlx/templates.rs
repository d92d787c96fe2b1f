//! Prompt construction (spec §4.3.2, the non-KV-cache half) and the
//! tool-call-parser chat-template swap-in.
//!
//! Grounded on `web/chat/jinja_templates.rs::apply_native_chat_template`
//! (minijinja `Environment`, the Python-syntax-to-minijinja preprocessing
//! step, `raise_exception`/`strftime_now` template functions) and
//! `web/chat/templates.rs`'s per-family hand-written templates, generalized
//! from "whatever the GGUF's own `tokenizer.chat_template` says" to
//! spec.md's four named override templates.

use minijinja::{context, Environment};
use serde_json::{json, Value};

use crate::types::{Message, Role};

pub const DEFAULT_SYSTEM_MESSAGE: &str =
    "You are a helpful assistant running locally on this device.";

/// One of the four hand-written chat templates substituted in when a
/// `tool-call-parser` override is active and tools are non-empty, so the
/// model sees tool definitions in the exact format the chosen parser
/// expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallParser {
    XmlFunction,
    Hermes,
    Llama3Json,
    Mistral,
}

impl ToolCallParser {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "xml-function" => Some(ToolCallParser::XmlFunction),
            "hermes" => Some(ToolCallParser::Hermes),
            "llama3-json" => Some(ToolCallParser::Llama3Json),
            "mistral" => Some(ToolCallParser::Mistral),
            _ => None,
        }
    }

    /// `m.content` already carries any tool calls on the message as
    /// `<tool_call>{"name":...,"arguments":...}</tool_call>` text (see
    /// `message_to_wire`), so none of these loop over `m.tool_calls`
    /// separately — doing so would render the same call twice.
    fn template_source(self) -> &'static str {
        match self {
            ToolCallParser::XmlFunction => {
                "{% for m in messages %}{{ m.role }}: {{ m.content }}\n{% endfor %}{% if tools %}Available tools:\n{% for t in tools %}- {{ t.function.name }}: {{ t.function.description }}\n{% endfor %}{% endif %}assistant:"
            }
            ToolCallParser::Hermes => {
                "{% for m in messages %}<|im_start|>{{ m.role }}\n{{ m.content }}<|im_end|>\n{% endfor %}{% if tools %}<tools>\n{% for t in tools %}{{ t | tojson }}\n{% endfor %}</tools>\n{% endif %}<|im_start|>assistant\n"
            }
            ToolCallParser::Llama3Json => {
                "{% for m in messages %}<|start_header_id|>{{ m.role }}<|end_header_id|>\n\n{{ m.content }}<|eot_id|>\n{% endfor %}{% if tools %}Tools available as JSON: {{ tools | tojson }}\n{% endif %}<|start_header_id|>assistant<|end_header_id|>\n\n"
            }
            ToolCallParser::Mistral => {
                "{% for m in messages %}[{{ m.role | upper }}]{{ m.content }}[/{{ m.role | upper }}]\n{% endfor %}{% if tools %}[AVAILABLE_TOOLS]{{ tools | tojson }}[/AVAILABLE_TOOLS]\n{% endif %}"
            }
        }
    }

    /// Render this override template against the prepared messages/tools.
    pub fn render(self, messages: &[Value], tools: &[Value]) -> Result<String, String> {
        let mut env = Environment::new();
        env.add_template("override", self.template_source())
            .map_err(|e| format!("failed to parse tool-call-parser template: {e}"))?;
        let template = env
            .get_template("override")
            .map_err(|e| format!("failed to load tool-call-parser template: {e}"))?;
        template
            .render(context! { messages => messages, tools => tools })
            .map_err(|e| format!("failed to render tool-call-parser template: {e}"))
    }
}

fn message_to_wire(message: &Message) -> Value {
    let content = match message.tool_calls.as_ref() {
        Some(calls) if !calls.is_empty() => calls
            .iter()
            .map(|tc| format!("<tool_call>{{\"name\":\"{}\",\"arguments\":{}}}</tool_call>", tc.function.name, tc.function.arguments))
            .collect::<Vec<_>>()
            .join(""),
        _ => match message.role {
            Role::Tool => format!("<tool_response>{}</tool_response>", message.text()),
            _ => message.text(),
        },
    };
    json!({
        "role": match message.role {
            Role::System | Role::Developer => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        },
        "content": content,
        "tool_calls": message.tool_calls,
    })
}

/// Apply the prompt-construction rules that precede tokenization:
/// default system message injection, response-format JSON instruction, and
/// message-role textual representation (tool_calls/tool_response blocks).
/// Returns the effective message list as wire-shaped JSON values, ready for
/// either the model's native chat template or a parser-override template.
pub fn build_prompt_messages(
    messages: &[Message],
    response_format_wants_json: bool,
    json_schema: Option<&Value>,
) -> Vec<Value> {
    let has_system = messages
        .iter()
        .any(|m| matches!(m.role, Role::System | Role::Developer));

    let mut out = Vec::with_capacity(messages.len() + 2);

    if !has_system {
        out.push(json!({"role": "system", "content": DEFAULT_SYSTEM_MESSAGE, "tool_calls": Value::Null}));
    }

    for message in messages {
        out.push(message_to_wire(message));
    }

    if response_format_wants_json {
        let mut instruction =
            "You must respond with a single valid JSON value and nothing else.".to_string();
        if let Some(schema) = json_schema {
            instruction.push_str(&format!(" The JSON must conform to this schema: {schema}"));
        }
        out.push(json!({"role": "system", "content": instruction, "tool_calls": Value::Null}));
    }

    out
}

/// Whether the templated prompt ends with an opening `<think>` tag (post
/// processing then injects a literal `<think>` into the emitted stream).
pub fn prompt_ends_with_open_think(templated_prompt: &str) -> bool {
    templated_prompt.trim_end().ends_with("<think>")
}

/// Whether any message carries an image part (caller uses this to skip
/// KV-cache reuse, since prefix matching only covers pure-text inputs).
pub fn has_image_content(messages: &[Message]) -> bool {
    messages.iter().any(|m| m.has_image())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentPart, ImageUrl, MessageContent};

    fn user(text: &str) -> Message {
        Message {
            role: Role::User,
            content: Some(MessageContent::Text(text.to_string())),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    #[test]
    fn injects_default_system_message_when_absent() {
        let built = build_prompt_messages(&[user("hi")], false, None);
        assert_eq!(built[0]["role"], "system");
        assert_eq!(built[0]["content"], DEFAULT_SYSTEM_MESSAGE);
    }

    #[test]
    fn leaves_existing_system_message_alone() {
        let system = Message {
            role: Role::System,
            content: Some(MessageContent::Text("custom".to_string())),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        };
        let built = build_prompt_messages(&[system, user("hi")], false, None);
        assert_eq!(built[0]["content"], "custom");
        assert_eq!(built.len(), 2);
    }

    #[test]
    fn appends_json_instruction_when_requested() {
        let built = build_prompt_messages(&[user("hi")], true, None);
        let last = built.last().unwrap();
        assert_eq!(last["role"], "system");
        assert!(last["content"].as_str().unwrap().contains("valid JSON"));
    }

    #[test]
    fn detects_open_think_suffix() {
        assert!(prompt_ends_with_open_think("...assistant\n<think>"));
        assert!(!prompt_ends_with_open_think("...assistant\n"));
    }

    #[test]
    fn detects_image_content() {
        let with_image = Message {
            role: Role::User,
            content: Some(MessageContent::Parts(vec![ContentPart::ImageUrl {
                image_url: ImageUrl { url: "data:...".into() },
            }])),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        };
        assert!(has_image_content(&[with_image]));
        assert!(!has_image_content(&[user("hi")]));
    }

    #[test]
    fn tool_call_parser_names_resolve() {
        assert_eq!(ToolCallParser::parse("hermes"), Some(ToolCallParser::Hermes));
        assert_eq!(ToolCallParser::parse("unknown"), None);
    }

    #[test]
    fn renders_hermes_override_template() {
        let messages = vec![json!({"role": "user", "content": "hi", "tool_calls": Value::Null})];
        let tools = vec![json!({"function": {"name": "f", "description": "d"}})];
        let rendered = ToolCallParser::Hermes.render(&messages, &tools).unwrap();
        assert!(rendered.contains("<|im_start|>user"));
        assert!(rendered.contains("<tools>"));
    }

    /// A message whose content already bakes in a `<tool_call>` block (as
    /// `message_to_wire` produces) plus a populated `tool_calls` array
    /// must render that call exactly once, for all four override
    /// templates — and must not choke on `tool_calls[].function.arguments`
    /// being a plain JSON string rather than a map.
    fn wire_message_with_tool_call() -> Value {
        json!({
            "role": "assistant",
            "content": "<tool_call>{\"name\":\"get_weather\",\"arguments\":{\"city\":\"nyc\"}}</tool_call>",
            "tool_calls": [{
                "id": "call_1",
                "type": "function",
                "function": { "name": "get_weather", "arguments": "{\"city\":\"nyc\"}" },
            }],
        })
    }

    #[test]
    fn xml_function_override_does_not_duplicate_tool_calls() {
        let messages = vec![wire_message_with_tool_call()];
        let tools = vec![json!({"function": {"name": "get_weather", "description": "d"}})];
        let rendered = ToolCallParser::XmlFunction.render(&messages, &tools).unwrap();
        assert_eq!(rendered.matches("<tool_call>").count(), 1);
    }

    #[test]
    fn hermes_override_does_not_duplicate_tool_calls() {
        let messages = vec![wire_message_with_tool_call()];
        let tools = vec![json!({"function": {"name": "get_weather", "description": "d"}})];
        let rendered = ToolCallParser::Hermes.render(&messages, &tools).unwrap();
        assert_eq!(rendered.matches("<tool_call>").count(), 1);
    }

    #[test]
    fn llama3_json_override_does_not_duplicate_tool_calls() {
        let messages = vec![wire_message_with_tool_call()];
        let tools = vec![json!({"function": {"name": "get_weather", "description": "d"}})];
        let rendered = ToolCallParser::Llama3Json.render(&messages, &tools).unwrap();
        assert_eq!(rendered.matches("<tool_call>").count(), 1);
    }

    #[test]
    fn mistral_override_does_not_duplicate_tool_calls() {
        let messages = vec![wire_message_with_tool_call()];
        let tools = vec![json!({"function": {"name": "get_weather", "description": "d"}})];
        let rendered = ToolCallParser::Mistral.render(&messages, &tools).unwrap();
        assert_eq!(rendered.matches("<tool_call>").count(), 1);
    }
}
