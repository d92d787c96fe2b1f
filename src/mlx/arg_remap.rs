//! Argument-name remapping (spec §4.3.5). Not present in the teacher (its
//! tool-calling layer trusts the model's own parameter names); built fresh
//! in the ordered-heuristics-dispatch-table idiom `web/chat/command_executor.rs`
//! uses for `FORMAT_PRIORITY`.

use serde_json::{Map, Value};

/// Try, in priority order, to find the schema property name an emitted key
/// was meant to target. Returns the emitted key unchanged if none succeed.
fn remap_key(emitted: &str, schema_properties: &[String]) -> String {
    // 1. Exact match.
    if schema_properties.iter().any(|p| p == emitted) {
        return emitted.to_string();
    }
    // 2. Case-insensitive match.
    if let Some(p) = schema_properties
        .iter()
        .find(|p| p.eq_ignore_ascii_case(emitted))
    {
        return p.clone();
    }
    // 3. Snake-case <-> camel-case conversion.
    let snake = to_snake_case(emitted);
    let camel = to_camel_case(emitted);
    if let Some(p) = schema_properties
        .iter()
        .find(|p| to_snake_case(p) == snake || to_camel_case(p) == camel)
    {
        return p.clone();
    }
    // 4. Suffix match when exactly one schema property ends with the
    //    emitted key (case-insensitive).
    let matches: Vec<&String> = schema_properties
        .iter()
        .filter(|p| p.to_lowercase().ends_with(&emitted.to_lowercase()))
        .collect();
    if matches.len() == 1 {
        return matches[0].clone();
    }

    emitted.to_string()
}

fn to_snake_case(s: &str) -> String {
    let mut out = String::new();
    for (i, c) in s.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn to_camel_case(s: &str) -> String {
    let mut out = String::new();
    let mut upper_next = false;
    for (i, c) in s.chars().enumerate() {
        if c == '_' {
            upper_next = true;
            continue;
        }
        if upper_next && i > 0 {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Re-serialize arguments with remapped keys and sorted keys. When the
/// caller supplied no schema properties, arguments are returned unchanged
/// (still re-sorted).
pub fn remap(arguments: &Value, schema_properties: &[String]) -> Value {
    let Value::Object(obj) = arguments else {
        return arguments.clone();
    };
    if schema_properties.is_empty() {
        return Value::Object(obj.clone());
    }
    let mut out: Map<String, Value> = Map::new();
    for (key, value) in obj {
        let mapped = remap_key(key, schema_properties);
        out.insert(mapped, value.clone());
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scenario_s5_suffix_match() {
        let args = json!({"path": "/x"});
        let schema = vec!["filePath".to_string()];
        let remapped = remap(&args, &schema);
        assert_eq!(remapped, json!({"filePath": "/x"}));
    }

    #[test]
    fn exact_match_is_left_alone() {
        let args = json!({"filePath": "/x"});
        let schema = vec!["filePath".to_string()];
        assert_eq!(remap(&args, &schema), json!({"filePath": "/x"}));
    }

    #[test]
    fn case_insensitive_match() {
        let args = json!({"FILEPATH": "/x"});
        let schema = vec!["filePath".to_string()];
        assert_eq!(remap(&args, &schema), json!({"filePath": "/x"}));
    }

    #[test]
    fn snake_to_camel_match() {
        let args = json!({"file_path": "/x"});
        let schema = vec!["filePath".to_string()];
        assert_eq!(remap(&args, &schema), json!({"filePath": "/x"}));
    }

    #[test]
    fn ambiguous_suffix_leaves_key_unchanged() {
        let args = json!({"path": "/x"});
        let schema = vec!["filePath".to_string(), "dirPath".to_string()];
        assert_eq!(remap(&args, &schema), json!({"path": "/x"}));
    }

    #[test]
    fn unmapped_key_is_left_unchanged() {
        let args = json!({"totally_unrelated": 1});
        let schema = vec!["filePath".to_string()];
        assert_eq!(remap(&args, &schema), json!({"totally_unrelated": 1}));
    }

    #[test]
    fn property_7_remap_is_idempotent() {
        let schema = vec!["filePath".to_string(), "lineNumber".to_string()];
        for args in [
            json!({"path": "/x", "line": 3}),
            json!({"filePath": "/y"}),
            json!({}),
        ] {
            let once = remap(&args, &schema);
            let twice = remap(&once, &schema);
            assert_eq!(once, twice);
        }
    }
}
