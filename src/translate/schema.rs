//! Tool parameter schema cleanup.
//!
//! Some backends behind the routing service (Gemini in particular) reject JSON-Schema
//! keywords that Anthropic tool definitions use freely. Enabled with
//! `translation.sanitize_tool_schemas`.

use serde_json::{Map, Value};

const KEPT_STRING_FORMATS: &[&str] = &["date-time", "enum"];

/// Keywords whose value is a map of name -> subschema.
const SCHEMA_MAPS: &[&str] = &["properties", "patternProperties", "$defs", "definitions"];

/// Return a copy of `schema` with unsupported keywords removed, recursively.
pub fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(sanitize_object(map)),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
        other => other.clone(),
    }
}

fn sanitize_object(map: &Map<String, Value>) -> Map<String, Value> {
    let is_string = map.get("type").and_then(Value::as_str) == Some("string");
    let mut out = Map::new();

    for (key, value) in map {
        match key.as_str() {
            "additionalProperties" | "default" => {}
            "format" if is_string => {
                if value
                    .as_str()
                    .is_some_and(|f| KEPT_STRING_FORMATS.contains(&f))
                {
                    out.insert(key.clone(), value.clone());
                }
            }
            k if SCHEMA_MAPS.contains(&k) => {
                let cleaned = match value {
                    Value::Object(named) => Value::Object(
                        named
                            .iter()
                            .map(|(name, sub)| (name.clone(), sanitize_schema(sub)))
                            .collect(),
                    ),
                    other => other.clone(),
                };
                out.insert(key.clone(), cleaned);
            }
            _ => {
                out.insert(key.clone(), sanitize_schema(value));
            }
        }
    }
    out
}
