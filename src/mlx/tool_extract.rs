//! Fallback tool-call extractor (spec §4.3.4). Runs only when the model's
//! native tool-call path produced nothing.
//!
//! Grounded on `web/chat/command_executor.rs`: `extract_balanced_json`
//! (quote-aware balanced-brace scanner, reused here verbatim in spirit for
//! both XML-function parameter values and the JSON/Mistral formats), the
//! `FORMAT_PRIORITY` ordered-detector-list idiom, and the
//! `LLAMA3_FUNC_PATTERN` regex shape for the XML-function format.

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;
use serde_json::{Map, Value};

use crate::types::{ToolCall, ToolCallFunction};

lazy_static! {
    static ref TOOL_CALL_BLOCK: Regex = Regex::new(r"(?s)<tool_call>(.*?)</tool_call>").unwrap();
    static ref XML_FUNCTION: Regex = Regex::new(r"(?s)<function=([a-zA-Z0-9_.-]+)>(.*?)(?:</function>|$)").unwrap();
    static ref XML_PARAMETER: Regex =
        Regex::new(r"(?s)<parameter=([a-zA-Z0-9_.-]+)>(.*?)(?:</parameter>|$)").unwrap();
    static ref MISTRAL_BRACKET_PREFIX: Regex = Regex::new(r"\[TOOL_CALLS\](\w+)\[ARGS\]").unwrap();
    static ref MISTRAL_ARRAY_PREFIX: Regex = Regex::new(r"\[TOOL_CALLS\]\s*\[").unwrap();
    static ref EMPTY_THINK: Regex = Regex::new(r"(?s)<think>\s*</think>").unwrap();
}

/// Quote-aware balanced-brace JSON scanner starting at the first `{` at or
/// after `start`. Returns the end offset (exclusive) and the slice.
fn extract_balanced_json(text: &str, start: usize) -> Option<(usize, String)> {
    let bytes = text.as_bytes();
    let mut i = start;
    while i < bytes.len() && bytes[i] != b'{' {
        i += 1;
    }
    if i >= bytes.len() {
        return None;
    }
    let open = i;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
        } else {
            match c {
                '"' => in_string = true,
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some((i + 1, text[open..=i].to_string()));
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}

fn fresh_call_id() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..24)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("call_{suffix}")
}

fn canonical_map(args: &BTreeMap<String, Value>) -> String {
    let map: Map<String, Value> = args.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    canonical_arguments(&Value::Object(map))
}

/// Re-serialize arguments with sorted keys (spec §4.3.4/§4.3.5) — `serde_json`
/// sorts object keys on serialization only when built with the
/// `preserve_order` feature disabled, which is this crate's configuration.
pub fn canonical_arguments(args: &Value) -> String {
    serde_json::to_string(args).unwrap_or_else(|_| "{}".to_string())
}

fn to_call(name: &str, args: BTreeMap<String, Value>) -> ToolCall {
    ToolCall {
        id: fresh_call_id(),
        kind: "function".to_string(),
        function: ToolCallFunction {
            name: name.to_string(),
            arguments: canonical_map(&args),
        },
    }
}

/// (a) XML-function: `<function=NAME>` followed by zero or more
/// `<parameter=KEY>VALUE</parameter>` and a closing `</function>`. Strips
/// one leading/trailing newline from each value; on duplicate keys keeps
/// the first non-empty value; salvages an unclosed trailing parameter.
fn parse_xml_function(inner: &str) -> Option<ToolCall> {
    let caps = XML_FUNCTION.captures(inner)?;
    let name = caps.get(1)?.as_str().to_string();
    let body = caps.get(2)?.as_str();

    let mut args: BTreeMap<String, Value> = BTreeMap::new();
    for param in XML_PARAMETER.captures_iter(body) {
        let key = param.get(1)?.as_str().to_string();
        let mut value = param.get(2)?.as_str();
        value = value.strip_prefix('\n').unwrap_or(value);
        value = value.strip_suffix('\n').unwrap_or(value);
        let entry = args.entry(key).or_insert_with(|| Value::String(String::new()));
        if matches!(entry, Value::String(s) if s.is_empty()) {
            *entry = Value::String(value.to_string());
        }
    }
    Some(to_call(&name, args))
}

/// (b) JSON: object with `name` and `arguments` (or `parameters`).
fn parse_json_call(text: &str) -> Option<ToolCall> {
    let (_end, json) = extract_balanced_json(text, 0)?;
    let value: Value = serde_json::from_str(&json).ok()?;
    let obj = value.as_object()?;
    let name = obj.get("name")?.as_str()?.to_string();
    let args_value = obj.get("arguments").or_else(|| obj.get("parameters"))?;
    let args_map = match args_value {
        Value::Object(m) => m.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Value::String(s) => serde_json::from_str::<Value>(s)
            .ok()
            .and_then(|v| v.as_object().map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect()))
            .unwrap_or_default(),
        _ => BTreeMap::new(),
    };
    Some(to_call(&name, args_map))
}

fn parse_tool_call_block(inner: &str) -> Option<ToolCall> {
    parse_xml_function(inner).or_else(|| parse_json_call(inner))
}

fn detect_mistral_bracket(text: &str) -> Option<(usize, usize, ToolCall)> {
    let caps = MISTRAL_BRACKET_PREFIX.captures(text)?;
    let whole = caps.get(0)?;
    let name = caps.get(1)?.as_str().to_string();
    let (end, args_json) = extract_balanced_json(text, whole.end())?;
    let args: BTreeMap<String, Value> = serde_json::from_str::<Value>(&args_json)
        .ok()
        .and_then(|v| v.as_object().map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect()))
        .unwrap_or_default();
    Some((whole.start(), end, to_call(&name, args)))
}

fn detect_mistral_array(text: &str) -> Option<(usize, usize, Vec<ToolCall>)> {
    let m = MISTRAL_ARRAY_PREFIX.find(text)?;
    let array_start = m.end() - 1;
    let (end, array_json) = extract_balanced_array(text, array_start)?;
    let value: Value = serde_json::from_str(&array_json).ok()?;
    let mut calls = Vec::new();
    for item in value.as_array()? {
        let obj = item.as_object()?;
        let name = obj.get("name")?.as_str()?.to_string();
        let args: BTreeMap<String, Value> = obj
            .get("arguments")
            .or_else(|| obj.get("parameters"))
            .and_then(|v| v.as_object())
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        calls.push(to_call(&name, args));
    }
    Some((m.start(), end, calls))
}

fn extract_balanced_array(text: &str, start: usize) -> Option<(usize, String)> {
    let bytes = text.as_bytes();
    let mut i = start;
    while i < bytes.len() && bytes[i] != b'[' {
        i += 1;
    }
    if i >= bytes.len() {
        return None;
    }
    let open = i;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
        } else {
            match c {
                '"' => in_string = true,
                '[' => depth += 1,
                ']' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some((i + 1, text[open..=i].to_string()));
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}

/// Recognize a bare top-level JSON object with `name` + `arguments`/`parameters`.
fn detect_bare_json(text: &str) -> Option<(usize, usize, ToolCall)> {
    let trimmed_start = text.find('{')?;
    let (end, json) = extract_balanced_json(text, trimmed_start)?;
    let value: Value = serde_json::from_str(&json).ok()?;
    let obj = value.as_object()?;
    if !obj.contains_key("name") || (!obj.contains_key("arguments") && !obj.contains_key("parameters")) {
        return None;
    }
    let call = parse_json_call(&json)?;
    Some((trimmed_start, end, call))
}

/// Runs the full priority-ordered extraction pipeline and returns the
/// content with matched regions stripped plus the calls found, in document
/// order. `None` tool calls means the native path should be trusted as-is.
pub fn extract(content: &str) -> (String, Vec<ToolCall>) {
    let mut calls = Vec::new();
    let mut remaining = content.to_string();

    // <tool_call>...</tool_call> blocks first (highest priority: explicit markers).
    let mut stripped = String::with_capacity(remaining.len());
    let mut last_end = 0;
    for m in TOOL_CALL_BLOCK.captures_iter(&remaining) {
        let whole = m.get(0).unwrap();
        stripped.push_str(&remaining[last_end..whole.start()]);
        if let Some(call) = parse_tool_call_block(m.get(1).unwrap().as_str()) {
            calls.push(call);
        }
        last_end = whole.end();
    }
    stripped.push_str(&remaining[last_end..]);
    remaining = stripped;

    if calls.is_empty() {
        if let Some((start, end, call)) = detect_mistral_bracket(&remaining) {
            remaining = format!("{}{}", &remaining[..start], &remaining[end..]);
            calls.push(call);
        } else if let Some((start, end, mut array_calls)) = detect_mistral_array(&remaining) {
            remaining = format!("{}{}", &remaining[..start], &remaining[end..]);
            calls.append(&mut array_calls);
        } else if let Some((start, end, call)) = detect_bare_json(&remaining) {
            remaining = format!("{}{}", &remaining[..start], &remaining[end..]);
            calls.push(call);
        }
    }

    let remaining = EMPTY_THINK.replace_all(&remaining, "").to_string();
    (remaining.trim().to_string(), calls)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_s4_fallback_tool_extraction() {
        let content = "<tool_call><function=f><parameter=a>1</parameter><parameter=b>2</parameter></function></tool_call>";
        let (remaining, calls) = extract(content);
        assert_eq!(remaining, "");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "f");
        assert_eq!(calls[0].function.arguments, r#"{"a":"1","b":"2"}"#);
    }

    #[test]
    fn property_6_tool_call_round_trip() {
        let content = "<tool_call><function=name><parameter=k>v</parameter></function></tool_call>";
        let (_, calls) = extract(content);
        assert_eq!(calls.len(), 1);
        let reparsed: Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
        let reserialized = serde_json::to_string(&reparsed).unwrap();
        assert_eq!(reserialized, calls[0].function.arguments);
        assert_eq!(calls[0].function.arguments, r#"{"k":"v"}"#);
    }

    #[test]
    fn xml_function_strips_single_surrounding_newline() {
        let content = "<tool_call><function=f><parameter=a>\nvalue\n</parameter></function></tool_call>";
        let (_, calls) = extract(content);
        assert_eq!(calls[0].function.arguments, r#"{"a":"value"}"#);
    }

    #[test]
    fn xml_function_salvages_unclosed_trailing_parameter() {
        // The block and function tags are closed, but the model forgot to
        // close the last <parameter> — the value runs to end-of-string.
        let content =
            "<tool_call><function=f><parameter=a>1</parameter><parameter=b>unterminated value</function></tool_call>";
        let (remaining, calls) = extract(content);
        assert_eq!(remaining, "");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.arguments, r#"{"a":"1","b":"unterminated value"}"#);
    }

    #[test]
    fn json_object_format_inside_tool_call_tags() {
        let content = r#"<tool_call>{"name":"search","arguments":{"q":"rust"}}</tool_call>"#;
        let (_, calls) = extract(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "search");
        assert_eq!(calls[0].function.arguments, r#"{"q":"rust"}"#);
    }

    #[test]
    fn mistral_bracket_format() {
        let content = r#"[TOOL_CALLS]get_weather[ARGS]{"city":"sf"}"#;
        let (remaining, calls) = extract(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "get_weather");
        assert_eq!(calls[0].function.arguments, r#"{"city":"sf"}"#);
        assert_eq!(remaining, "");
    }

    #[test]
    fn mistral_array_format() {
        let content = r#"[TOOL_CALLS][{"name":"a","arguments":{"x":1}},{"name":"b","arguments":{"y":2}}]"#;
        let (_, calls) = extract(content);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].function.name, "a");
        assert_eq!(calls[1].function.name, "b");
    }

    #[test]
    fn bare_top_level_json_object() {
        let content = r#"some preamble {"name":"f","parameters":{"a":1}} trailing"#;
        let (remaining, calls) = extract(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "f");
        assert_eq!(remaining.trim(), "some preamble  trailing".trim());
    }

    #[test]
    fn collapses_empty_think_tags_left_behind() {
        let content = "<think></think><tool_call><function=f></function></tool_call>";
        let (remaining, calls) = extract(content);
        assert_eq!(remaining, "");
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn no_tool_call_present_returns_untouched_content() {
        let content = "just a normal reply with no calls";
        let (remaining, calls) = extract(content);
        assert!(calls.is_empty());
        assert_eq!(remaining, content);
    }

    #[test]
    fn call_ids_are_fresh_and_well_formed() {
        let content = r#"<tool_call>{"name":"a","arguments":{}}</tool_call><tool_call>{"name":"b","arguments":{}}</tool_call>"#;
        let (_, calls) = extract(content);
        assert_eq!(calls.len(), 2);
        assert_ne!(calls[0].id, calls[1].id);
        for call in &calls {
            assert!(call.id.starts_with("call_"));
            assert_eq!(call.id.len(), "call_".len() + 24);
        }
    }
}
