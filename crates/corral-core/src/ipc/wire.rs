//! Owned, transport-safe value tree.
//!
//! A [`WireValue`] shares nothing with the [`Value`] it was built from: converting to it and
//! back is the structured clone that happens at the isolation boundary. It only has room
//! for what the serializer emits, so special types must already be codec-encoded. Nested
//! encoded values keep their codec label as [`WireValue::Encoded`].

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::serialize::{MessageSerializer, TypeInfo};
use crate::value::{read, TypedArrayKind, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    /// `NaN`, `Infinity` or `-Infinity`, which JSON cannot carry as numbers.
    NonFinite(String),
    /// Decimal representation.
    BigInt(String),
    String(String),
    Bytes(Vec<u8>),
    TypedArray { kind: TypedArrayKind, bytes: Vec<u8> },
    Array(Vec<WireValue>),
    Object(Vec<(String, WireValue)>),
    Encoded { codec: String, form: Box<WireValue> },
}

impl WireValue {
    fn number(n: f64) -> Self {
        if n.is_finite() {
            WireValue::Number(n)
        } else if n.is_nan() {
            WireValue::NonFinite("NaN".to_string())
        } else if n > 0.0 {
            WireValue::NonFinite("Infinity".to_string())
        } else {
            WireValue::NonFinite("-Infinity".to_string())
        }
    }

    fn from_value(value: &Value, ancestors: &mut FxHashSet<usize>) -> Result<Self> {
        if let Some(id) = value.identity() {
            if !ancestors.insert(id) {
                return Err(Error::CircularReference {
                    path: "wire value".to_string(),
                });
            }
        }

        let wire = match value {
            Value::Undefined => WireValue::Undefined,
            Value::Null => WireValue::Null,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Number(n) => WireValue::number(*n),
            Value::BigInt(n) => WireValue::BigInt(n.to_string()),
            Value::String(s) => WireValue::String(s.clone()),
            Value::ArrayBuffer(bytes) => WireValue::Bytes(bytes.clone()),
            Value::TypedArray { kind, bytes } => WireValue::TypedArray {
                kind: *kind,
                bytes: bytes.clone(),
            },
            Value::Array(items) => {
                let items = read(items).clone();
                WireValue::Array(
                    items
                        .iter()
                        .map(|item| Self::from_value(item, ancestors))
                        .collect::<Result<_>>()?,
                )
            }
            Value::Object(props) => {
                let props = read(props).clone();
                WireValue::Object(
                    props
                        .iter()
                        .map(|(k, v)| Ok((k.clone(), Self::from_value(v, ancestors)?)))
                        .collect::<Result<_>>()?,
                )
            }
            Value::Encoded { codec, form } => WireValue::Encoded {
                codec: codec.clone(),
                form: Box::new(Self::from_value(form, ancestors)?),
            },
            other => {
                return Err(Error::Unserializable(format!(
                    "{} must be encoded before it crosses the wire",
                    other.constructor_name()
                )));
            }
        };

        if let Some(id) = value.identity() {
            ancestors.remove(&id);
        }
        Ok(wire)
    }
}

impl TryFrom<&Value> for WireValue {
    type Error = Error;

    fn try_from(value: &Value) -> Result<Self> {
        Self::from_value(value, &mut FxHashSet::default())
    }
}

impl From<WireValue> for Value {
    fn from(wire: WireValue) -> Self {
        match wire {
            WireValue::Undefined => Value::Undefined,
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Number(n) => Value::Number(n),
            WireValue::NonFinite(repr) => Value::Number(match repr.as_str() {
                "Infinity" => f64::INFINITY,
                "-Infinity" => f64::NEG_INFINITY,
                _ => f64::NAN,
            }),
            // Unparsable digits can only come from a foreign peer; keep the text.
            WireValue::BigInt(digits) => match digits.parse() {
                Ok(n) => Value::BigInt(n),
                Err(_) => Value::String(digits),
            },
            WireValue::String(s) => Value::String(s),
            WireValue::Bytes(bytes) => Value::ArrayBuffer(bytes),
            WireValue::TypedArray { kind, bytes } => Value::TypedArray { kind, bytes },
            WireValue::Array(items) => Value::array(items.into_iter().map(Value::from).collect()),
            WireValue::Object(props) => {
                Value::object(props.into_iter().map(|(k, v)| (k, Value::from(v))))
            }
            WireValue::Encoded { codec, form } => Value::Encoded {
                codec,
                form: Box::new(Value::from(*form)),
            },
        }
    }
}

/// A serialized value as it travels inside a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    pub value: WireValue,
    pub type_info: Option<TypeInfo>,
}

impl Payload {
    /// Serialize `value` and detach the result from the original graph.
    ///
    /// The serializer is reset afterwards whether or not the walk succeeded.
    pub fn encode(serializer: &mut MessageSerializer, value: &Value) -> Result<Self> {
        let serialized = serializer.serialize(value);
        serializer.reset();
        let serialized = serialized?;
        Ok(Self {
            value: WireValue::try_from(&serialized.value)?,
            type_info: serialized.type_info,
        })
    }

    /// Rebuild the value on the receiving side.
    pub fn decode(self, serializer: &MessageSerializer) -> Result<Value> {
        let value = Value::from(self.value);
        serializer.deserialize(&value, self.type_info.as_ref())
    }
}
