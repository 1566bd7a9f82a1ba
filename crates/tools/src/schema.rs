//! Argument checking against a tool's JSON schema.
//!
//! Only the top level is checked: the arguments must be an object, every
//! `required` property present, present properties of their declared
//! `type`, and no undeclared properties when `additionalProperties` is
//! `false`. Anything deeper is the server's business.

use cortex_core::error::SchemaError;
use serde_json::Value;

pub fn validate(schema: &Value, arguments: &Value) -> Result<(), SchemaError> {
    let Some(args) = arguments.as_object() else {
        return Err(SchemaError::NotAnObject(json_type(arguments).to_string()));
    };

    let properties = schema.get("properties").and_then(Value::as_object);

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if args.get(name).is_none() {
                return Err(SchemaError::MissingRequired(name.to_string()));
            }
        }
    }

    for (name, value) in args {
        match properties.and_then(|p| p.get(name)) {
            Some(property) => check_type(name, property, value)?,
            None => {
                if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
                    return Err(SchemaError::UnexpectedParameter(name.clone()));
                }
            }
        }
    }

    Ok(())
}

fn check_type(name: &str, property: &Value, value: &Value) -> Result<(), SchemaError> {
    let allowed: Vec<&str> = match property.get("type") {
        Some(Value::String(t)) => vec![t.as_str()],
        Some(Value::Array(types)) => types.iter().filter_map(Value::as_str).collect(),
        _ => return Ok(()),
    };
    if allowed.is_empty() || allowed.iter().any(|t| matches_type(t, value)) {
        return Ok(());
    }
    Err(SchemaError::TypeMismatch {
        name: name.to_string(),
        expected: allowed.join(" | "),
        actual: json_type(value).to_string(),
    })
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|f| f.fract() == 0.0),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        // unknown type keywords are not ours to enforce
        _ => true,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn add_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "a": {"type": "integer"},
                "b": {"type": "number"},
                "label": {"type": ["string", "null"]}
            },
            "required": ["a", "b"]
        })
    }

    #[test]
    fn accepts_matching_arguments() {
        assert!(validate(&add_schema(), &json!({"a": 2, "b": 3.5})).is_ok());
        assert!(validate(&add_schema(), &json!({"a": 2.0, "b": 3, "label": null})).is_ok());
        // undeclared extras are allowed unless forbidden
        assert!(validate(&add_schema(), &json!({"a": 1, "b": 1, "note": "x"})).is_ok());
    }

    #[test]
    fn rejects_non_objects() {
        let err = validate(&add_schema(), &json!([1, 2])).unwrap_err();
        assert_eq!(err, SchemaError::NotAnObject("array".into()));
    }

    #[test]
    fn rejects_missing_required() {
        let err = validate(&add_schema(), &json!({"a": 2})).unwrap_err();
        assert_eq!(err, SchemaError::MissingRequired("b".into()));
    }

    #[test]
    fn rejects_wrong_types() {
        let err = validate(&add_schema(), &json!({"a": "two", "b": 3})).unwrap_err();
        assert!(matches!(err, SchemaError::TypeMismatch { ref name, .. } if name == "a"));

        let err = validate(&add_schema(), &json!({"a": 2.5, "b": 3})).unwrap_err();
        assert!(matches!(err, SchemaError::TypeMismatch { ref actual, .. } if actual == "number"));
    }

    #[test]
    fn additional_properties_false_rejects_extras() {
        let schema = json!({
            "type": "object",
            "properties": {"q": {"type": "string"}},
            "additionalProperties": false
        });
        let err = validate(&schema, &json!({"q": "x", "limit": 3})).unwrap_err();
        assert_eq!(err, SchemaError::UnexpectedParameter("limit".into()));
    }

    #[test]
    fn schema_without_properties_accepts_any_object() {
        assert!(validate(&json!({"type": "object"}), &json!({"anything": [1]})).is_ok());
        assert!(validate(&json!({}), &json!({})).is_ok());
    }
}
