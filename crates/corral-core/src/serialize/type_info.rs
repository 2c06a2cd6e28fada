//! Type information recorded alongside serialized values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec::TypeCodec;
use crate::value::{read, Value};

/// Version stamped into every [`TypeInfo`].
pub const TYPE_INFO_VERSION: u32 = 1;

/// Structural summary of a serialized value, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeSchema {
    Primitive {
        #[serde(rename = "typeOf")]
        type_of: String,
    },
    Array {
        length: usize,
    },
    /// Property name to `typeof` of its value.
    Object {
        properties: BTreeMap<String, String>,
    },
    Map {
        size: usize,
    },
    Set {
        size: usize,
    },
    Date {
        #[serde(rename = "epochMs")]
        epoch_ms: i64,
    },
    RegExp {
        source: String,
        flags: String,
    },
    Error {
        name: String,
    },
    Binary {
        #[serde(rename = "byteLength")]
        byte_length: usize,
    },
    Opaque,
}

/// Describes the original type of a serialized value so the receiving side can rebuild it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeInfo {
    /// Constructor name of the original value.
    pub constructor: String,
    /// Codec that encoded the value, if any.
    pub codec: Option<String>,
    pub version: u32,
    pub schema: TypeSchema,
}

impl TypeInfo {
    pub(crate) fn describe(value: &Value, codec: Option<&dyn TypeCodec>) -> Self {
        let schema = match codec {
            Some(codec) => codec.schema(value),
            None => structural_schema(value),
        };
        Self {
            constructor: value.constructor_name(),
            codec: codec.map(|c| c.type_name().to_string()),
            version: TYPE_INFO_VERSION,
            schema,
        }
    }

    /// Codec to rebuild the value with. `None` when no codec encoded it, whatever the
    /// constructor name says.
    pub fn codec_name(&self) -> Option<&str> {
        self.codec.as_deref()
    }
}

fn property_types<'a>(props: impl Iterator<Item = (&'a String, &'a Value)>) -> BTreeMap<String, String> {
    props
        .map(|(key, value)| (key.clone(), value.type_of().to_string()))
        .collect()
}

fn structural_schema(value: &Value) -> TypeSchema {
    match value {
        Value::Array(items) => TypeSchema::Array {
            length: read(items).len(),
        },
        Value::Object(props) => TypeSchema::Object {
            properties: property_types(read(props).iter()),
        },
        Value::Instance(inst) => TypeSchema::Object {
            properties: property_types(read(inst).properties.iter()),
        },
        Value::ArrayBuffer(bytes) | Value::TypedArray { bytes, .. } => TypeSchema::Binary {
            byte_length: bytes.len(),
        },
        Value::Date(_)
        | Value::Map(_)
        | Value::Set(_)
        | Value::RegExp(_)
        | Value::Error(_)
        | Value::Encoded { .. } => TypeSchema::Opaque,
        primitive => TypeSchema::Primitive {
            type_of: primitive.type_of().to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MapCodec;

    #[test]
    fn test_object_schema_lists_property_types() {
        let value = Value::object([
            ("n", Value::from(1)),
            ("s", Value::from("x")),
            ("f", Value::function("cb")),
        ]);
        let info = TypeInfo::describe(&value, None);
        assert_eq!(info.constructor, "Object");
        assert!(info.codec.is_none());
        let TypeSchema::Object { properties } = info.schema else {
            panic!("expected object schema");
        };
        assert_eq!(properties["n"], "number");
        assert_eq!(properties["s"], "string");
        assert_eq!(properties["f"], "function");
    }

    #[test]
    fn test_codec_schema_wins() {
        let value = Value::map([(Value::from(1), Value::from(2))]);
        let info = TypeInfo::describe(&value, Some(&MapCodec));
        assert_eq!(info.codec_name(), Some("Map"));
        assert_eq!(info.schema, TypeSchema::Map { size: 1 });
        assert_eq!(info.version, TYPE_INFO_VERSION);
    }

    #[test]
    fn test_no_codec_name_without_codec() {
        let info = TypeInfo::describe(&Value::from(true), None);
        assert_eq!(info.constructor, "Boolean");
        assert_eq!(info.codec_name(), None);
        assert_eq!(
            info.schema,
            TypeSchema::Primitive {
                type_of: "boolean".to_string()
            }
        );
    }
}
