use crate::document::values_equal;
use serde_json::Value;

/// Validate a JSON value against the subset of JSON Schema the engine
/// understands: `type`, `enum`, `properties`, `required`,
/// `additionalProperties`, `items`, `minimum`/`maximum`,
/// `minLength`/`maxLength`. Returns one entry per failed path.
pub fn validate(schema: &Value, value: &Value) -> Vec<String> {
    let mut failures = Vec::new();
    validate_value(schema, value, "$", &mut failures);
    failures
}

fn validate_value(schema: &Value, value: &Value, path: &str, failures: &mut Vec<String>) {
    let schema = match schema.as_object() {
        Some(map) => map,
        // a non-object schema (e.g. `true`) accepts everything
        None => return,
    };

    if let Some(expected) = schema.get("type") {
        if !type_matches(expected, value) {
            failures.push(format!(
                "{path}: expected {}, got {}",
                type_display(expected),
                type_name(value)
            ));
            return;
        }
    }

    if let Some(Value::Array(options)) = schema.get("enum") {
        if !options.iter().any(|option| values_equal(option, value)) {
            failures.push(format!("{path}: value not in enum"));
        }
    }

    if let Some(number) = value.as_f64() {
        if let Some(minimum) = schema.get("minimum").and_then(Value::as_f64) {
            if number < minimum {
                failures.push(format!("{path}: {number} is below minimum {minimum}"));
            }
        }
        if let Some(maximum) = schema.get("maximum").and_then(Value::as_f64) {
            if number > maximum {
                failures.push(format!("{path}: {number} is above maximum {maximum}"));
            }
        }
    }

    if let Some(text) = value.as_str() {
        let length = text.chars().count();
        if let Some(min_length) = schema.get("minLength").and_then(Value::as_u64) {
            if (length as u64) < min_length {
                failures.push(format!("{path}: shorter than minLength {min_length}"));
            }
        }
        if let Some(max_length) = schema.get("maxLength").and_then(Value::as_u64) {
            if (length as u64) > max_length {
                failures.push(format!("{path}: longer than maxLength {max_length}"));
            }
        }
    }

    if let Value::Object(fields) = value {
        if let Some(Value::Array(required)) = schema.get("required") {
            for name in required.iter().filter_map(Value::as_str) {
                let missing = matches!(fields.get(name), None | Some(Value::Null));
                if missing {
                    failures.push(format!("{path}.{name}: required field is missing"));
                }
            }
        }
        let properties = schema.get("properties").and_then(Value::as_object);
        if let Some(properties) = properties {
            for (name, property_schema) in properties {
                if let Some(field) = fields.get(name) {
                    validate_value(property_schema, field, &format!("{path}.{name}"), failures);
                }
            }
        }
        if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
            for name in fields.keys() {
                let declared = properties.map(|p| p.contains_key(name)).unwrap_or(false);
                if !declared {
                    failures.push(format!("{path}.{name}: additional property not allowed"));
                }
            }
        }
    }

    if let (Value::Array(items), Some(item_schema)) = (value, schema.get("items")) {
        for (position, item) in items.iter().enumerate() {
            validate_value(item_schema, item, &format!("{path}.{position}"), failures);
        }
    }
}

fn type_matches(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(name) => single_type_matches(name, value),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| single_type_matches(name, value)),
        _ => true,
    }
}

fn single_type_matches(name: &str, value: &Value) -> bool {
    match name {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => value.as_f64().map(|n| n.fract() == 0.0).unwrap_or(false),
        _ => true,
    }
}

fn type_display(expected: &Value) -> String {
    match expected {
        Value::String(name) => name.clone(),
        other => other.to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
