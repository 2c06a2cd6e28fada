//! Type codec registry.
//!
//! A [`TypeCodec`] owns one family of values (Date, Map, ...) and knows how to turn it into
//! a transport-safe form and back. The [`CodecRegistry`] holds the built-in codecs followed
//! by any custom codecs, and the serializer asks it for the first codec that claims a value.

mod builtin;

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::serialize::TypeSchema;
use crate::value::Value;

pub use builtin::{DateCodec, ErrorCodec, MapCodec, RegExpCodec, SetCodec, MAX_STACK_LINES};
pub(crate) use builtin::truncate_stack;

/// Encodes nested values on behalf of a codec.
///
/// Codecs never recurse on their own: children go back through the serializer so depth
/// limits and circular-reference handling apply inside Map entries, Set members and
/// Error causes too.
pub trait ChildEncoder {
    fn encode_child(&mut self, value: &Value) -> Result<Value>;
}

/// Paired encode/decode logic for one type.
pub trait TypeCodec: Send + Sync {
    /// Name the codec is registered under and recorded in type information.
    fn type_name(&self) -> &str;

    /// Whether this codec owns `value`.
    fn matches(&self, value: &Value) -> bool;

    /// Convert `value` into its transport-safe form.
    fn encode(&self, value: &Value, children: &mut dyn ChildEncoder) -> Result<Value>;

    /// Rebuild a value from the form produced by [`TypeCodec::encode`].
    fn decode(&self, form: &Value) -> Result<Value>;

    /// Structural summary recorded in type information.
    fn schema(&self, _value: &Value) -> TypeSchema {
        TypeSchema::Opaque
    }
}

/// Ordered table of codecs, keyed by type name.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: Vec<Arc<dyn TypeCodec>>,
}

impl CodecRegistry {
    /// A registry holding the built-in Date, Map, Set, RegExp and Error codecs.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(DateCodec);
        registry.register(MapCodec);
        registry.register(SetCodec);
        registry.register(RegExpCodec);
        registry.register(ErrorCodec);
        registry
    }

    /// A registry with no codecs at all.
    pub fn empty() -> Self {
        Self { codecs: Vec::new() }
    }

    /// Register a codec. A codec with the same type name is replaced in place.
    pub fn register(&mut self, codec: impl TypeCodec + 'static) {
        self.register_arc(Arc::new(codec));
    }

    pub fn register_arc(&mut self, codec: Arc<dyn TypeCodec>) {
        match self
            .codecs
            .iter_mut()
            .find(|existing| existing.type_name() == codec.type_name())
        {
            Some(slot) => *slot = codec,
            None => self.codecs.push(codec),
        }
    }

    /// First codec, in registration order, that claims `value`.
    pub fn find(&self, value: &Value) -> Option<&Arc<dyn TypeCodec>> {
        self.codecs.iter().find(|codec| codec.matches(value))
    }

    /// Codec registered under `name`.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn TypeCodec>> {
        self.codecs.iter().find(|codec| codec.type_name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.codecs.iter().map(|codec| codec.type_name())
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct NeverMatches;

    impl TypeCodec for NeverMatches {
        fn type_name(&self) -> &str {
            "Date"
        }

        fn matches(&self, _value: &Value) -> bool {
            false
        }

        fn encode(&self, _value: &Value, _children: &mut dyn ChildEncoder) -> Result<Value> {
            Err(Error::codec("Date", "unused"))
        }

        fn decode(&self, form: &Value) -> Result<Value> {
            Ok(form.clone())
        }
    }

    #[test]
    fn test_builtin_order() {
        let registry = CodecRegistry::new();
        let names: Vec<_> = registry.names().collect();
        assert_eq!(names, vec!["Date", "Map", "Set", "RegExp", "Error"]);
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = CodecRegistry::new();
        registry.register(NeverMatches);
        assert_eq!(registry.len(), 5);
        // The replacement never matches, so dates are no longer claimed.
        let now = Value::date_from_millis(0).unwrap();
        assert!(registry.find(&now).is_none());
    }

    #[test]
    fn test_find_by_value() {
        let registry = CodecRegistry::new();
        let codec = registry.find(&Value::set([Value::from(1)])).unwrap();
        assert_eq!(codec.type_name(), "Set");
        assert!(registry.find(&Value::from("plain")).is_none());
    }
}
