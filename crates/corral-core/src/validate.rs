//! Pre-flight checks on task payloads.

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::value::{read, Value};

/// Whether `value` can cross the isolation boundary.
///
/// Primitives, plain objects and arrays, binary buffers and the built-in special types are
/// serializable. Functions, symbols and class instances are not, at any depth. Revisited
/// containers are not walked twice.
pub fn validate_serializable(value: &Value) -> bool {
    let mut visited = FxHashSet::default();
    check(value, &mut visited)
}

fn check(value: &Value, visited: &mut FxHashSet<usize>) -> bool {
    if let Some(id) = value.identity() {
        if !visited.insert(id) {
            return true;
        }
    }

    match value {
        Value::Function(_) | Value::Symbol(_) | Value::Instance(_) => false,
        Value::Undefined
        | Value::Null
        | Value::Bool(_)
        | Value::Number(_)
        | Value::BigInt(_)
        | Value::String(_)
        | Value::ArrayBuffer(_)
        | Value::TypedArray { .. }
        | Value::Date(_)
        | Value::RegExp(_) => true,
        Value::Array(items) => {
            let items = read(items).clone();
            items.iter().all(|item| check(item, visited))
        }
        Value::Object(props) => {
            let values: Vec<Value> = read(props).values().cloned().collect();
            values.iter().all(|v| check(v, visited))
        }
        Value::Map(entries) => {
            let entries = read(entries).clone();
            entries
                .iter()
                .all(|(k, v)| check(k, visited) && check(v, visited))
        }
        Value::Set(members) => {
            let members = read(members).clone();
            members.iter().all(|m| check(m, visited))
        }
        Value::Error(err) => err.cause.as_ref().is_none_or(|cause| check(cause, visited)),
        Value::Encoded { form, .. } => check(form, visited),
    }
}

/// Shape a task payload must have.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageSchema {
    /// Property names that must be present as own keys.
    pub required: Vec<String>,
    /// Property name to expected `typeof`, checked when the property is present.
    pub types: Vec<(String, String)>,
}

impl MessageSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, name: impl Into<String>) -> Self {
        self.required.push(name.into());
        self
    }

    pub fn expect_type(mut self, name: impl Into<String>, type_of: impl Into<String>) -> Self {
        self.types.push((name.into(), type_of.into()));
        self
    }
}

/// Outcome of [`validate_against_schema`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// Check `payload` against `schema`, collecting every problem found.
pub fn validate_against_schema(payload: &Value, schema: &MessageSchema) -> ValidationResult {
    if !matches!(payload, Value::Object(_)) {
        return ValidationResult::from_errors(vec!["Message must be an object".to_string()]);
    }

    let mut errors = Vec::new();
    for field in &schema.required {
        if !payload.has_own(field) {
            errors.push(format!("Missing required field: {field}"));
        }
    }
    for (field, expected) in &schema.types {
        if let Some(value) = payload.get(field) {
            let actual = value.type_of();
            if actual != expected {
                errors.push(format!(
                    "Field {field} must be of type {expected}, got {actual}"
                ));
            }
        }
    }
    ValidationResult::from_errors(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ErrorValue;

    #[test]
    fn test_serializable_values() {
        let value = Value::object([
            ("n", Value::from(1)),
            ("list", Value::array(vec![Value::Null, Value::from("s")])),
            ("when", Value::date_from_millis(0).unwrap()),
            ("tags", Value::set([Value::from("a")])),
            ("bytes", Value::ArrayBuffer(vec![0, 1])),
            ("err", Value::error(ErrorValue::generic("oops"))),
        ]);
        assert!(validate_serializable(&value));
    }

    #[test]
    fn test_unserializable_values() {
        assert!(!validate_serializable(&Value::function("f")));
        assert!(!validate_serializable(&Value::symbol("s")));
        assert!(!validate_serializable(&Value::instance("Socket", [("fd", Value::from(3))])));

        let nested = Value::object([(
            "inner",
            Value::map([(Value::from("cb"), Value::function("cb"))]),
        )]);
        assert!(!validate_serializable(&nested));
    }

    #[test]
    fn test_cyclic_value_terminates() {
        let obj = Value::object([("n", Value::from(1))]);
        obj.set_property("self", obj.clone());
        assert!(validate_serializable(&obj));
    }

    #[test]
    fn test_schema_requires_object() {
        let schema = MessageSchema::new().require("id");
        for payload in [Value::Null, Value::from("x"), Value::array(vec![])] {
            let result = validate_against_schema(&payload, &schema);
            assert!(!result.valid);
            assert_eq!(result.errors, vec!["Message must be an object"]);
        }
    }

    #[test]
    fn test_schema_collects_all_errors() {
        let schema = MessageSchema::new()
            .require("id")
            .require("op")
            .expect_type("count", "number");
        let payload = Value::object([("count", Value::from("three"))]);

        let result = validate_against_schema(&payload, &schema);
        assert!(!result.valid);
        assert_eq!(
            result.errors,
            vec![
                "Missing required field: id",
                "Missing required field: op",
                "Field count must be of type number, got string",
            ]
        );
    }

    #[test]
    fn test_schema_passes() {
        let schema = MessageSchema::new().require("op").expect_type("op", "string");
        let payload = Value::object([("op", Value::from("echo"))]);
        assert_eq!(
            validate_against_schema(&payload, &schema),
            ValidationResult {
                valid: true,
                errors: vec![]
            }
        );
    }
}
