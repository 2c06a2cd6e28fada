//! Error values reported by task handlers.

use serde::{Deserialize, Serialize};

use crate::codec::truncate_stack;
use crate::error::Result;
use crate::value::{ErrorValue, Value};

/// Classification of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    DeserializationError,
    TimeoutError,
    TaskExecutionError,
    UnknownError,
}

impl ErrorCode {
    fn for_error_name(name: &str) -> Self {
        match name {
            "TypeError" | "RangeError" => ErrorCode::ValidationError,
            "SyntaxError" => ErrorCode::DeserializationError,
            "TimeoutError" => ErrorCode::TimeoutError,
            _ => ErrorCode::TaskExecutionError,
        }
    }
}

/// A thrown value flattened for transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedError {
    pub message: String,
    pub code: ErrorCode,
    /// Error name (`TypeError`, ...) or constructor of a non-error thrown value.
    pub error_type: String,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub cause: Option<Box<SerializedError>>,
    #[serde(default)]
    pub retryable: bool,
}

impl SerializedError {
    /// An `UnknownError` carrying only a message.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: ErrorCode::UnknownError,
            error_type: "Error".to_string(),
            stack: None,
            cause: None,
            retryable: false,
        }
    }
}

/// Converts thrown values to [`SerializedError`] and back.
pub struct ErrorSerializer;

impl ErrorSerializer {
    /// Flatten any thrown value: an error, a string or an arbitrary object.
    pub fn serialize(thrown: &Value) -> SerializedError {
        match thrown {
            Value::Error(err) => {
                let code = ErrorCode::for_error_name(&err.name);
                SerializedError {
                    message: err.message.clone(),
                    code,
                    error_type: err.name.clone(),
                    stack: err.stack.as_deref().map(truncate_stack),
                    cause: err
                        .cause
                        .as_ref()
                        .map(|cause| Box::new(Self::serialize(cause))),
                    retryable: code == ErrorCode::TimeoutError,
                }
            }
            Value::String(message) => SerializedError {
                error_type: "String".to_string(),
                ..SerializedError::unknown(message.as_str())
            },
            other => {
                let message = match other.get("message") {
                    Some(Value::String(message)) => message,
                    _ => format!("{other:?}"),
                };
                SerializedError {
                    error_type: other.constructor_name(),
                    ..SerializedError::unknown(message)
                }
            }
        }
    }

    /// Rebuild an error value, restoring its name, stack and cause chain.
    pub fn deserialize(serialized: &SerializedError) -> ErrorValue {
        let mut err = ErrorValue::new(serialized.error_type.as_str(), serialized.message.as_str());
        err.stack = serialized.stack.clone();
        err.cause = serialized
            .cause
            .as_deref()
            .map(|cause| Value::error(Self::deserialize(cause)));
        err
    }

    /// Encode as the `error` string of a reply message.
    pub fn to_reply(serialized: &SerializedError) -> Result<String> {
        Ok(serde_json::to_string(serialized)?)
    }

    /// Decode the `error` string of a reply message.
    ///
    /// Text that is not a serialized error becomes an `UnknownError` with the raw text as
    /// its message.
    pub fn from_reply(error: &str) -> SerializedError {
        serde_json::from_str(error).unwrap_or_else(|_| SerializedError::unknown(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_by_error_name() {
        let cases = [
            ("TypeError", ErrorCode::ValidationError),
            ("RangeError", ErrorCode::ValidationError),
            ("SyntaxError", ErrorCode::DeserializationError),
            ("TimeoutError", ErrorCode::TimeoutError),
            ("Error", ErrorCode::TaskExecutionError),
            ("DatabaseError", ErrorCode::TaskExecutionError),
        ];
        for (name, code) in cases {
            let serialized = ErrorSerializer::serialize(&Value::error(ErrorValue::new(name, "x")));
            assert_eq!(serialized.code, code, "{name}");
            assert_eq!(serialized.retryable, code == ErrorCode::TimeoutError);
        }
    }

    #[test]
    fn test_non_error_inputs_are_unknown() {
        let from_string = ErrorSerializer::serialize(&Value::from("boom"));
        assert_eq!(from_string.code, ErrorCode::UnknownError);
        assert_eq!(from_string.message, "boom");

        let from_object =
            ErrorSerializer::serialize(&Value::object([("message", Value::from("bad"))]));
        assert_eq!(from_object.code, ErrorCode::UnknownError);
        assert_eq!(from_object.message, "bad");
        assert_eq!(from_object.error_type, "Object");
    }

    #[test]
    fn test_stack_is_truncated() {
        let stack: Vec<String> = (0..120).map(|i| format!("    at f{i}")).collect();
        let err = ErrorValue::new("Error", "deep").with_stack(stack.join("\n"));
        let serialized = ErrorSerializer::serialize(&Value::error(err));
        let stack = serialized.stack.unwrap();
        assert!(stack.ends_with("... (truncated)"));
        assert_eq!(stack.lines().count(), crate::codec::MAX_STACK_LINES + 1);
    }

    #[test]
    fn test_cause_chain_round_trip() {
        let root = ErrorValue::new("SyntaxError", "unexpected token");
        let err = ErrorValue::new("Error", "parse failed")
            .with_stack("Error: parse failed")
            .with_cause(Value::error(root));

        let serialized = ErrorSerializer::serialize(&Value::error(err.clone()));
        let cause = serialized.cause.as_deref().unwrap();
        assert_eq!(cause.code, ErrorCode::DeserializationError);

        assert_eq!(ErrorSerializer::deserialize(&serialized), err);
    }

    #[test]
    fn test_reply_string_round_trip() {
        let serialized =
            ErrorSerializer::serialize(&Value::error(ErrorValue::new("TimeoutError", "slow")));
        let text = ErrorSerializer::to_reply(&serialized).unwrap();
        assert!(text.contains("\"code\":\"TIMEOUT_ERROR\""));
        assert_eq!(ErrorSerializer::from_reply(&text), serialized);
    }

    #[test]
    fn test_plain_reply_string_becomes_unknown() {
        let parsed = ErrorSerializer::from_reply("worker exploded");
        assert_eq!(parsed.code, ErrorCode::UnknownError);
        assert_eq!(parsed.message, "worker exploded");
    }
}
