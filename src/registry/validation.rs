//! Validation of payloads against a JSON-schema subset.
//!
//! Supported keywords: `type`, `properties`, `required`,
//! `additionalProperties` (boolean or schema), `items`, `enum`, `const`,
//! `minimum`, `maximum`, `minLength`, `maxLength`, `minItems`, `maxItems`.
//! Unknown keywords are ignored.

use crate::error::{Result, StoreError};
use serde_json::{Map, Value};

/// A parsed schema document.
#[derive(Clone, Debug, PartialEq)]
pub struct Schema {
    document: Value,
}

impl Schema {
    pub fn parse(text: &str) -> Result<Self> {
        let document: Value = serde_json::from_str(text)
            .map_err(|e| StoreError::RegistryIndex(format!("invalid schema document: {}", e)))?;
        match document {
            Value::Object(_) | Value::Bool(_) => Ok(Self { document }),
            _ => Err(StoreError::RegistryIndex(
                "schema document must be an object or a boolean".into(),
            )),
        }
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Check `value`, returning every violation found.
    pub fn validate(&self, value: &Value) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        check(&self.document, value, "$", &mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn check(schema: &Value, value: &Value, path: &str, errors: &mut Vec<String>) {
    let rules = match schema {
        Value::Bool(true) => return,
        Value::Bool(false) => {
            errors.push(format!("{}: no value allowed", path));
            return;
        }
        Value::Object(rules) => rules,
        _ => return,
    };

    if let Some(expected) = rules.get("type") {
        let allowed: Vec<&str> = match expected {
            Value::String(t) => vec![t.as_str()],
            Value::Array(ts) => ts.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| has_type(value, t)) {
            errors.push(format!("{}: expected type {}", path, allowed.join(" or ")));
            return;
        }
    }

    if let Some(Value::Array(options)) = rules.get("enum") {
        if !options.contains(value) {
            errors.push(format!("{}: value not in enum", path));
        }
    }

    if let Some(expected) = rules.get("const") {
        if expected != value {
            errors.push(format!("{}: value does not equal const", path));
        }
    }

    match value {
        Value::Object(fields) => check_object(rules, fields, path, errors),
        Value::Array(items) => {
            check_len(rules, "minItems", "maxItems", items.len(), path, errors);
            if let Some(item_schema) = rules.get("items") {
                for (i, item) in items.iter().enumerate() {
                    check(item_schema, item, &format!("{}[{}]", path, i), errors);
                }
            }
        }
        Value::String(s) => {
            check_len(rules, "minLength", "maxLength", s.chars().count(), path, errors);
        }
        Value::Number(n) => {
            let n = n.as_f64().unwrap_or(f64::NAN);
            if let Some(min) = rules.get("minimum").and_then(Value::as_f64) {
                if n < min {
                    errors.push(format!("{}: {} is less than minimum {}", path, n, min));
                }
            }
            if let Some(max) = rules.get("maximum").and_then(Value::as_f64) {
                if n > max {
                    errors.push(format!("{}: {} is greater than maximum {}", path, n, max));
                }
            }
        }
        _ => {}
    }
}

fn check_object(
    rules: &Map<String, Value>,
    fields: &Map<String, Value>,
    path: &str,
    errors: &mut Vec<String>,
) {
    if let Some(Value::Array(required)) = rules.get("required") {
        for name in required.iter().filter_map(Value::as_str) {
            if !fields.contains_key(name) {
                errors.push(format!("{}: missing required property '{}'", path, name));
            }
        }
    }

    let properties = rules.get("properties").and_then(Value::as_object);
    for (name, field) in fields {
        let field_path = format!("{}.{}", path, name);
        match properties.and_then(|p| p.get(name)) {
            Some(field_schema) => check(field_schema, field, &field_path, errors),
            None => match rules.get("additionalProperties") {
                Some(Value::Bool(false)) => {
                    errors.push(format!("{}: additional property not allowed", field_path));
                }
                Some(extra @ Value::Object(_)) => check(extra, field, &field_path, errors),
                _ => {}
            },
        }
    }
}

fn check_len(
    rules: &Map<String, Value>,
    min_key: &str,
    max_key: &str,
    len: usize,
    path: &str,
    errors: &mut Vec<String>,
) {
    if let Some(min) = rules.get(min_key).and_then(Value::as_u64) {
        if (len as u64) < min {
            errors.push(format!("{}: length {} is less than {}", path, len, min));
        }
    }
    if let Some(max) = rules.get(max_key).and_then(Value::as_u64) {
        if (len as u64) > max {
            errors.push(format!("{}: length {} is greater than {}", path, len, max));
        }
    }
}

fn has_type(value: &Value, name: &str) -> bool {
    match name {
        "null" => value.is_null(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => match value {
            Value::Number(n) => n.is_i64() || n.is_u64() || n.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false),
            _ => false,
        },
        _ => false,
    }
}
