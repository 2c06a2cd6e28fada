//! Message serialization across the isolation boundary.
//!
//! [`MessageSerializer`] walks a [`Value`] graph and produces a transport-safe copy:
//!
//! 1. **Depth guard**: nesting beyond `max_depth` fails, cyclic or not.
//! 2. **Circular references**: reference identities on the current walk are tracked and a
//!    revisit is resolved by the configured [`CircularRefStrategy`].
//! 3. **Codec dispatch**: the first registered codec that claims a value encodes it.
//!    Everything else is handled structurally: primitives and binary buffers pass
//!    through, arrays and objects recurse, function-valued properties are dropped.
//! 4. **Type info**: with `include_type_info`, the top-level value is described by a
//!    [`TypeInfo`] and every nested codec-encoded value is wrapped in
//!    [`Value::Encoded`], so the other side can rebuild the whole graph bottom-up.
//!
//! Both ends of a channel must agree on `preserve_types`/`include_type_info` for a type
//! to survive the trip.

mod task_error;
mod type_info;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::codec::{ChildEncoder, CodecRegistry, TypeCodec};
use crate::error::{Error, Result};
use crate::value::{read, Properties, Value};

pub use task_error::{ErrorCode, ErrorSerializer, SerializedError};
pub use type_info::{TypeInfo, TypeSchema, TYPE_INFO_VERSION};

/// Default nesting limit.
pub const DEFAULT_MAX_DEPTH: usize = 100;

/// Placeholder written in place of a circular reference under [`CircularRefStrategy::Replace`].
pub const CIRCULAR_PLACEHOLDER: &str = "[Circular Reference]";

/// What to do when a value refers back to one of its ancestors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircularRefStrategy {
    /// Fail with [`Error::CircularReference`].
    #[default]
    Error,
    /// Write `undefined` into the cyclic slot.
    Ignore,
    /// Write [`CIRCULAR_PLACEHOLDER`] into the cyclic slot.
    Replace,
}

/// Serializer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SerializerConfig {
    /// Rebuild values through their codec when type info is present.
    pub preserve_types: bool,
    /// Emit [`TypeInfo`] for serialized values.
    pub include_type_info: bool,
    pub max_depth: usize,
    pub circular_ref_strategy: CircularRefStrategy,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        Self {
            preserve_types: false,
            include_type_info: false,
            max_depth: DEFAULT_MAX_DEPTH,
            circular_ref_strategy: CircularRefStrategy::Error,
        }
    }
}

impl SerializerConfig {
    /// Settings for faithful round trips: type info on, codecs used on decode.
    pub fn preserving() -> Self {
        Self {
            preserve_types: true,
            include_type_info: true,
            ..Self::default()
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_circular_refs(mut self, strategy: CircularRefStrategy) -> Self {
        self.circular_ref_strategy = strategy;
        self
    }
}

/// A transport-safe value plus optional type information.
#[derive(Debug, Clone)]
pub struct Serialized {
    pub value: Value,
    pub type_info: Option<TypeInfo>,
}

/// Walks value graphs, applying codecs, depth limits and cycle handling.
#[derive(Debug, Clone)]
pub struct MessageSerializer {
    config: SerializerConfig,
    registry: CodecRegistry,
    /// Identities of the containers on the current walk.
    seen: FxHashSet<usize>,
    /// Property path of the current walk, for error messages.
    path: Vec<String>,
}

impl MessageSerializer {
    /// A serializer with the built-in codecs.
    pub fn new(config: SerializerConfig) -> Self {
        Self::with_registry(config, CodecRegistry::new())
    }

    pub fn with_registry(config: SerializerConfig, registry: CodecRegistry) -> Self {
        Self {
            config,
            registry,
            seen: FxHashSet::default(),
            path: Vec::new(),
        }
    }

    pub fn config(&self) -> &SerializerConfig {
        &self.config
    }

    pub fn registry(&self) -> &CodecRegistry {
        &self.registry
    }

    /// Register a custom codec, keyed by its type name.
    pub fn register(&mut self, codec: impl TypeCodec + 'static) {
        self.registry.register(codec);
    }

    /// Serialize a top-level value.
    pub fn serialize(&mut self, value: &Value) -> Result<Serialized> {
        self.serialize_at(value, 0)
    }

    /// Serialize a value that sits `depth` levels below the root.
    pub fn serialize_at(&mut self, value: &Value, depth: usize) -> Result<Serialized> {
        let type_info = if self.config.include_type_info {
            let codec = self.registry.find(value).cloned();
            Some(TypeInfo::describe(value, codec.as_deref()))
        } else {
            None
        };
        let value = self.walk(value, depth, false)?;
        Ok(Serialized { value, type_info })
    }

    /// Rebuild a value from its serialized form.
    ///
    /// Nested [`Value::Encoded`] nodes are rebuilt through their codec, innermost first,
    /// when `preserve_types` is on and unwrapped to their plain form otherwise. The top
    /// level is rebuilt only when `type_info` names a codec that is registered here.
    pub fn deserialize(&self, serialized: &Value, type_info: Option<&TypeInfo>) -> Result<Value> {
        let value = self
            .restore(serialized, &mut FxHashSet::default())?
            .unwrap_or_else(|| serialized.clone());
        if self.config.preserve_types {
            let codec = type_info
                .and_then(TypeInfo::codec_name)
                .and_then(|name| self.registry.get(name));
            if let Some(codec) = codec {
                return codec.decode(&value);
            }
        }
        Ok(value)
    }

    /// Forget identities left behind by an aborted walk.
    ///
    /// Call between independent top-level `serialize` calls on the same instance.
    pub fn reset(&mut self) {
        self.seen.clear();
        self.path.clear();
    }

    /// Replace the encoded nodes below `value`. `None` means nothing needed replacing.
    fn restore(&self, value: &Value, ancestors: &mut FxHashSet<usize>) -> Result<Option<Value>> {
        if let Value::Encoded { codec, form } = value {
            let form = self
                .restore(form, ancestors)?
                .unwrap_or_else(|| (**form).clone());
            let codec = self
                .registry
                .get(codec)
                .filter(|_| self.config.preserve_types);
            return match codec {
                Some(codec) => codec.decode(&form).map(Some),
                None => Ok(Some(form)),
            };
        }

        let Some(id) = value.identity() else {
            return Ok(None);
        };
        if !ancestors.insert(id) {
            return Ok(None);
        }
        let restored = match value {
            Value::Array(items) => {
                let items = read(items).clone();
                self.restore_all(&items, ancestors)?.map(Value::array)
            }
            Value::Object(props) => {
                let props = read(props).clone();
                let values: Vec<Value> = props.values().cloned().collect();
                self.restore_all(&values, ancestors)?
                    .map(|values| Value::object(props.keys().cloned().zip(values)))
            }
            _ => None,
        };
        ancestors.remove(&id);
        Ok(restored)
    }

    fn restore_all(
        &self,
        items: &[Value],
        ancestors: &mut FxHashSet<usize>,
    ) -> Result<Option<Vec<Value>>> {
        let mut changed: Option<Vec<Value>> = None;
        for (idx, item) in items.iter().enumerate() {
            match self.restore(item, ancestors)? {
                Some(restored) => changed
                    .get_or_insert_with(|| items[..idx].to_vec())
                    .push(restored),
                None => {
                    if let Some(out) = changed.as_mut() {
                        out.push(item.clone());
                    }
                }
            }
        }
        Ok(changed)
    }

    /// `nested` is false only for the top-level value, which [`TypeInfo`] describes.
    fn walk(&mut self, value: &Value, depth: usize, nested: bool) -> Result<Value> {
        if depth > self.config.max_depth {
            return Err(Error::SerializationDepthExceeded {
                max_depth: self.config.max_depth,
            });
        }

        let identity = value.identity();
        if let Some(id) = identity {
            if self.seen.contains(&id) {
                return self.on_circular();
            }
            self.seen.insert(id);
        }

        let encoded = self.encode(value, depth, nested)?;

        if let Some(id) = identity {
            self.seen.remove(&id);
        }
        Ok(encoded)
    }

    fn on_circular(&self) -> Result<Value> {
        match self.config.circular_ref_strategy {
            CircularRefStrategy::Error => Err(Error::CircularReference {
                path: self.current_path(),
            }),
            CircularRefStrategy::Ignore => Ok(Value::Undefined),
            CircularRefStrategy::Replace => Ok(Value::String(CIRCULAR_PLACEHOLDER.to_string())),
        }
    }

    fn current_path(&self) -> String {
        let mut path = String::from("$");
        for segment in &self.path {
            path.push_str(segment);
        }
        path
    }

    fn encode(&mut self, value: &Value, depth: usize, nested: bool) -> Result<Value> {
        if let Some(codec) = self.registry.find(value).cloned() {
            let mut children = Nested {
                serializer: self,
                depth: depth + 1,
            };
            let form = codec.encode(value, &mut children)?;
            if nested && self.config.include_type_info {
                return Ok(Value::Encoded {
                    codec: codec.type_name().to_string(),
                    form: Box::new(form),
                });
            }
            return Ok(form);
        }

        match value {
            Value::Undefined
            | Value::Null
            | Value::Bool(_)
            | Value::Number(_)
            | Value::BigInt(_)
            | Value::String(_)
            | Value::ArrayBuffer(_)
            | Value::TypedArray { .. }
            | Value::Encoded { .. } => Ok(value.clone()),
            Value::Function(name) => Err(Error::Unserializable(format!("function `{name}`"))),
            Value::Symbol(description) => {
                Err(Error::Unserializable(format!("Symbol({description})")))
            }
            Value::Array(items) => {
                let items = read(items).clone();
                let mut encoded = Vec::with_capacity(items.len());
                for (idx, item) in items.iter().enumerate() {
                    self.path.push(format!("[{idx}]"));
                    let item = self.walk(item, depth + 1, true)?;
                    self.path.pop();
                    encoded.push(item);
                }
                Ok(Value::array(encoded))
            }
            Value::Object(props) => {
                let props = read(props).clone();
                self.encode_properties(&props, depth)
            }
            Value::Instance(inst) => {
                let props = read(inst).properties.clone();
                self.encode_properties(&props, depth)
            }
            Value::Date(_) | Value::Map(_) | Value::Set(_) | Value::RegExp(_) | Value::Error(_) => {
                Err(Error::Unserializable(format!(
                    "no codec registered for {}",
                    value.constructor_name()
                )))
            }
        }
    }

    fn encode_properties(&mut self, props: &Properties, depth: usize) -> Result<Value> {
        let mut encoded = Properties::with_capacity(props.len());
        for (key, value) in props {
            if matches!(value, Value::Function(_)) {
                continue;
            }
            self.path.push(format!(".{key}"));
            let value = self.walk(value, depth + 1, true)?;
            self.path.pop();
            encoded.insert(key.clone(), value);
        }
        Ok(Value::object(encoded))
    }
}

impl Default for MessageSerializer {
    fn default() -> Self {
        Self::new(SerializerConfig::default())
    }
}

struct Nested<'a> {
    serializer: &'a mut MessageSerializer,
    depth: usize,
}

impl ChildEncoder for Nested<'_> {
    fn encode_child(&mut self, value: &Value) -> Result<Value> {
        self.serializer.walk(value, self.depth, true)
    }
}
