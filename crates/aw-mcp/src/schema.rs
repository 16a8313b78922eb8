//! Schema normalization and argument coercion.
//!
//! Every tool schema returned by an MCP server is normalized before it is
//! handed to an LLM provider, because providers disagree wildly on which
//! JSON-Schema keywords they tolerate. Once normalized, the *same* schema
//! is reused to validate/coerce the arguments a model hands back.

use serde_json::{Map, Value, json};

const SIMPLE_TYPES: &[&str] = &["string", "number", "integer", "boolean", "null"];

/// Drops everything except `properties`/`required`, narrows each property to
/// `{type, description?, enum?, items?, minimum?, maximum?}`, collapses
/// `integer` to `number`, forces `additionalProperties: false` and
/// `type: "object"`, and always emits a fresh `Value` (never a reference
/// into the input) so later mutation elsewhere can't alias the cache entry.
pub fn normalize_schema(input: &Value) -> Value {
    let properties = input
        .get("properties")
        .and_then(Value::as_object)
        .map(|props| {
            let mut out = Map::new();
            for (key, prop) in props {
                out.insert(key.clone(), normalize_property(prop));
            }
            out
        })
        .unwrap_or_default();

    let required: Vec<Value> = input
        .get("required")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut out = Map::new();
    out.insert("type".to_string(), json!("object"));
    out.insert("additionalProperties".to_string(), json!(false));
    out.insert("properties".to_string(), Value::Object(properties));
    out.insert("required".to_string(), Value::Array(required));
    Value::Object(out)
}

fn normalize_property(prop: &Value) -> Value {
    let obj = prop.as_object();

    let declared_type = obj
        .and_then(|o| o.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("string");
    let prop_type = collapse_type(declared_type);

    let mut out = Map::new();
    out.insert("type".to_string(), json!(prop_type));

    if let Some(desc) = obj.and_then(|o| o.get("description")).and_then(Value::as_str) {
        out.insert("description".to_string(), json!(desc));
    }

    if let Some(enum_vals) = obj.and_then(|o| o.get("enum")).and_then(Value::as_array) {
        out.insert("enum".to_string(), Value::Array(enum_vals.clone()));
    }

    if let Some(items) = obj.and_then(|o| o.get("items")) {
        out.insert("items".to_string(), normalize_items(items));
    }

    if let Some(min) = obj.and_then(|o| o.get("minimum")) {
        out.insert("minimum".to_string(), min.clone());
    }
    if let Some(max) = obj.and_then(|o| o.get("maximum")) {
        out.insert("maximum".to_string(), max.clone());
    }

    Value::Object(out)
}

fn normalize_items(items: &Value) -> Value {
    let item_type = items
        .as_object()
        .and_then(|o| o.get("type"))
        .and_then(Value::as_str);
    match item_type {
        Some(t) if SIMPLE_TYPES.contains(&t) => json!({ "type": collapse_type(t) }),
        _ => json!({ "type": "string" }),
    }
}

fn collapse_type(t: &str) -> &'static str {
    match t {
        "integer" => "number",
        "number" => "number",
        "boolean" => "boolean",
        "array" => "array",
        "object" => "object",
        "null" => "null",
        _ => "string",
    }
}

/// Rewrites Ollama's degenerate single-argument call shape `{"$": value}`
/// into `{<first-required-or-declared-property>: value}`.
pub fn remap_ollama_dollar_arg(schema: &Value, arguments: &mut Value) {
    let Some(obj) = arguments.as_object() else {
        return;
    };
    if obj.len() != 1 {
        return;
    }
    let Some(value) = obj.get("$") else {
        return;
    };
    let value = value.clone();

    let target_key = schema
        .get("required")
        .and_then(Value::as_array)
        .and_then(|r| r.first())
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            schema
                .get("properties")
                .and_then(Value::as_object)
                .and_then(|p| p.keys().next())
                .cloned()
        });

    if let Some(key) = target_key {
        let mut new_obj = Map::new();
        new_obj.insert(key, value);
        *arguments = Value::Object(new_obj);
    }
}

/// Validates and coerces `arguments` against the normalized `schema`
///:
/// - string -> array when schema demands array (wraps the single value)
/// - string -> number via the usual float parse when schema demands number
/// - drops null/undefined values for non-required params
/// - case-insensitive enum matching; drops values that don't match so the
///   absence of the key lets any downstream default apply
pub fn coerce_arguments(schema: &Value, arguments: &mut Value) {
    remap_ollama_dollar_arg(schema, arguments);

    let Some(args_obj) = arguments.as_object_mut() else {
        return;
    };
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return;
    };
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut to_remove = Vec::new();
    for (key, value) in args_obj.iter_mut() {
        let Some(prop_schema) = properties.get(key) else {
            continue;
        };
        let is_required = required.contains(&key.as_str());

        if value.is_null() {
            if !is_required {
                to_remove.push(key.clone());
            }
            continue;
        }

        let prop_type = prop_schema
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("string");

        match prop_type {
            "array" if !value.is_array() => {
                *value = json!([value.clone()]);
            }
            "number" if value.is_string() => {
                if let Some(parsed) = value.as_str().and_then(|s| s.parse::<f64>().ok()) {
                    *value = json!(parsed);
                }
            }
            _ => {}
        }

        if let Some(enum_vals) = prop_schema.get("enum").and_then(Value::as_array) {
            let matches = value.as_str().is_some_and(|s| {
                enum_vals
                    .iter()
                    .any(|e| e.as_str().is_some_and(|e| e.eq_ignore_ascii_case(s)))
            });
            if !matches {
                to_remove.push(key.clone());
            } else if let Some(s) = value.as_str() {
                // Canonicalize to the schema's casing.
                if let Some(canon) = enum_vals
                    .iter()
                    .find_map(|e| e.as_str().filter(|e| e.eq_ignore_ascii_case(s)))
                {
                    *value = json!(canon);
                }
            }
        }
    }
    for key in to_remove {
        args_obj.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_per_spec_scenario_4() {
        let input = json!({
            "type": "object",
            "properties": {
                "q": {"type": "string", "enum": ["a", "b"], "description": "x"},
                "n": {"type": "integer", "minimum": 0}
            },
            "required": ["q"],
            "extra": "drop"
        });
        let expected = json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "q": {"type": "string", "description": "x", "enum": ["a", "b"]},
                "n": {"type": "number", "minimum": 0}
            },
            "required": ["q"]
        });
        assert_eq!(normalize_schema(&input), expected);
    }

    #[test]
    fn normalization_is_idempotent() {
        let input = json!({
            "type": "object",
            "properties": {"n": {"type": "integer"}},
            "required": []
        });
        let once = normalize_schema(&input);
        let twice = normalize_schema(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn ollama_dollar_remap_uses_first_required() {
        let schema = json!({
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        });
        let mut args = json!({"$": "weather"});
        remap_ollama_dollar_arg(&schema, &mut args);
        assert_eq!(args, json!({"query": "weather"}));
    }

    #[test]
    fn coerces_string_to_array_and_number() {
        let schema = normalize_schema(&json!({
            "properties": {
                "tags": {"type": "array"},
                "count": {"type": "integer"}
            },
            "required": []
        }));
        let mut args = json!({"tags": "solo", "count": "3"});
        coerce_arguments(&schema, &mut args);
        assert_eq!(args, json!({"tags": ["solo"], "count": 3.0}));
    }

    #[test]
    fn drops_invalid_enum_case_insensitively_matched_kept() {
        let schema = normalize_schema(&json!({
            "properties": {"unit": {"type": "string", "enum": ["Celsius", "Fahrenheit"]}},
            "required": []
        }));
        let mut args = json!({"unit": "celsius"});
        coerce_arguments(&schema, &mut args);
        assert_eq!(args, json!({"unit": "Celsius"}));

        let mut bad_args = json!({"unit": "Kelvin"});
        coerce_arguments(&schema, &mut bad_args);
        assert_eq!(bad_args, json!({}));
    }

    #[test]
    fn drops_null_for_non_required_params() {
        let schema = normalize_schema(&json!({
            "properties": {"opt": {"type": "string"}},
            "required": []
        }));
        let mut args = json!({"opt": null});
        coerce_arguments(&schema, &mut args);
        assert_eq!(args, json!({}));
    }
}
