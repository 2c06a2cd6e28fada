//! Dynamic values carried across the isolation boundary.
//!
//! [`Value`] is a tagged union covering primitives, containers and the special types the
//! codec layer knows how to round-trip (Date, Map, Set, RegExp, Error). Reference-typed
//! variants share their contents through `Arc<RwLock<_>>`, so a graph can contain cycles
//! and two slots can point at the same container. The serializer relies on that identity
//! to detect circular references.

use std::cell::RefCell;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Shared, mutable container used by reference-typed values.
pub type Shared<T> = Arc<RwLock<T>>;

/// Insertion-ordered property bag of an object or class instance.
pub type Properties = IndexMap<String, Value>;

/// Acquire a read guard, recovering the data if a writer panicked.
pub(crate) fn read<T>(shared: &Shared<T>) -> RwLockReadGuard<'_, T> {
    shared.read().unwrap_or_else(PoisonError::into_inner)
}

/// Acquire a write guard, recovering the data if a writer panicked.
pub(crate) fn write<T>(shared: &Shared<T>) -> RwLockWriteGuard<'_, T> {
    shared.write().unwrap_or_else(PoisonError::into_inner)
}

fn shared<T>(value: T) -> Shared<T> {
    Arc::new(RwLock::new(value))
}

/// Element type of a typed array view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypedArrayKind {
    Int8,
    Uint8,
    Uint8Clamped,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
    BigInt64,
    BigUint64,
}

impl TypedArrayKind {
    /// Constructor name of the view type.
    pub fn constructor_name(&self) -> &'static str {
        match self {
            TypedArrayKind::Int8 => "Int8Array",
            TypedArrayKind::Uint8 => "Uint8Array",
            TypedArrayKind::Uint8Clamped => "Uint8ClampedArray",
            TypedArrayKind::Int16 => "Int16Array",
            TypedArrayKind::Uint16 => "Uint16Array",
            TypedArrayKind::Int32 => "Int32Array",
            TypedArrayKind::Uint32 => "Uint32Array",
            TypedArrayKind::Float32 => "Float32Array",
            TypedArrayKind::Float64 => "Float64Array",
            TypedArrayKind::BigInt64 => "BigInt64Array",
            TypedArrayKind::BigUint64 => "BigUint64Array",
        }
    }
}

/// A regular expression literal.
///
/// `last_index` is the match cursor. It is part of the value's state but does not take
/// part in equality.
#[derive(Debug, Clone)]
pub struct RegExpValue {
    pub source: String,
    pub flags: String,
    pub last_index: usize,
}

impl RegExpValue {
    pub fn new(source: impl Into<String>, flags: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            flags: flags.into(),
            last_index: 0,
        }
    }
}

impl PartialEq for RegExpValue {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.flags == other.flags
    }
}

/// An error object: name, message, optional stack trace and cause.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    pub cause: Option<Value>,
}

impl ErrorValue {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            cause: None,
        }
    }

    /// A plain `Error` with the given message.
    pub fn generic(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_cause(mut self, cause: Value) -> Self {
        self.cause = Some(cause);
        self
    }
}

/// An instance of a named class that is not one of the built-in special types.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceValue {
    pub class_name: String,
    pub properties: Properties,
}

/// A dynamically typed value.
#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    BigInt(i128),
    String(String),
    /// A symbol, identified by its description. Never transferable.
    Symbol(String),
    /// A function, identified by its name. Never transferable.
    Function(String),
    Array(Shared<Vec<Value>>),
    Object(Shared<Properties>),
    Instance(Shared<InstanceValue>),
    ArrayBuffer(Vec<u8>),
    TypedArray { kind: TypedArrayKind, bytes: Vec<u8> },
    Date(DateTime<Utc>),
    Map(Shared<Vec<(Value, Value)>>),
    Set(Shared<Vec<Value>>),
    RegExp(RegExpValue),
    Error(Arc<ErrorValue>),
    /// A nested special value in its codec-encoded form, labelled with the codec that
    /// produced it. Emitted by the serializer when type information is on.
    Encoded { codec: String, form: Box<Value> },
}

impl Value {
    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(shared(items))
    }

    pub fn object<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Object(shared(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    pub fn empty_object() -> Self {
        Value::Object(shared(Properties::new()))
    }

    pub fn instance<I, K>(class_name: impl Into<String>, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Instance(shared(InstanceValue {
            class_name: class_name.into(),
            properties: entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }))
    }

    /// Build a map, inserting entries in order. Later duplicate keys overwrite earlier ones.
    pub fn map<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (Value, Value)>,
    {
        let map = Value::Map(shared(Vec::new()));
        for (key, value) in entries {
            map.map_insert(key, value);
        }
        map
    }

    /// Build a set, inserting values in order and skipping duplicates.
    pub fn set<I>(values: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        let set = Value::Set(shared(Vec::new()));
        for value in values {
            set.set_add(value);
        }
        set
    }

    /// A date, truncated to millisecond precision.
    pub fn date(at: DateTime<Utc>) -> Self {
        Value::Date(at.trunc_subsecs(3))
    }

    /// A date from milliseconds since the Unix epoch, if representable.
    pub fn date_from_millis(millis: i64) -> Option<Self> {
        Utc.timestamp_millis_opt(millis).single().map(Value::Date)
    }

    pub fn regexp(source: impl Into<String>, flags: impl Into<String>) -> Self {
        Value::RegExp(RegExpValue::new(source, flags))
    }

    pub fn error(error: ErrorValue) -> Self {
        Value::Error(Arc::new(error))
    }

    pub fn function(name: impl Into<String>) -> Self {
        Value::Function(name.into())
    }

    pub fn symbol(description: impl Into<String>) -> Self {
        Value::Symbol(description.into())
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Read a property of an object or instance.
    pub fn get(&self, key: &str) -> Option<Value> {
        match self {
            Value::Object(props) => read(props).get(key).cloned(),
            Value::Instance(inst) => read(inst).properties.get(key).cloned(),
            _ => None,
        }
    }

    /// Whether `key` is an own property of an object or instance.
    pub fn has_own(&self, key: &str) -> bool {
        match self {
            Value::Object(props) => read(props).contains_key(key),
            Value::Instance(inst) => read(inst).properties.contains_key(key),
            _ => false,
        }
    }

    /// Assign a property on an object or instance. Returns `false` for other values.
    pub fn set_property(&self, key: impl Into<String>, value: Value) -> bool {
        match self {
            Value::Object(props) => {
                write(props).insert(key.into(), value);
                true
            }
            Value::Instance(inst) => {
                write(inst).properties.insert(key.into(), value);
                true
            }
            _ => false,
        }
    }

    /// Append to an array. Returns `false` for other values.
    pub fn push(&self, value: Value) -> bool {
        match self {
            Value::Array(items) => {
                write(items).push(value);
                true
            }
            _ => false,
        }
    }

    /// Element of an array by index.
    pub fn index(&self, idx: usize) -> Option<Value> {
        match self {
            Value::Array(items) => read(items).get(idx).cloned(),
            _ => None,
        }
    }

    /// Insert or overwrite a map entry. Returns `false` if this is not a map.
    pub fn map_insert(&self, key: Value, value: Value) -> bool {
        let Value::Map(entries) = self else {
            return false;
        };
        let mut entries = write(entries);
        match entries.iter_mut().find(|(k, _)| same_value_zero(k, &key)) {
            Some(slot) => slot.1 = value,
            None => entries.push((key, value)),
        }
        true
    }

    /// Look up a map entry by key.
    pub fn map_get(&self, key: &Value) -> Option<Value> {
        match self {
            Value::Map(entries) => read(entries)
                .iter()
                .find(|(k, _)| same_value_zero(k, key))
                .map(|(_, v)| v.clone()),
            _ => None,
        }
    }

    /// Add a member to a set unless already present. Returns `false` if this is not a set.
    pub fn set_add(&self, value: Value) -> bool {
        let Value::Set(members) = self else {
            return false;
        };
        let mut members = write(members);
        if !members.iter().any(|m| same_value_zero(m, &value)) {
            members.push(value);
        }
        true
    }

    pub fn set_has(&self, value: &Value) -> bool {
        match self {
            Value::Set(members) => read(members).iter().any(|m| same_value_zero(m, value)),
            _ => false,
        }
    }

    /// Element count of an array, map or set.
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::Array(items) => Some(read(items).len()),
            Value::Map(entries) => Some(read(entries).len()),
            Value::Set(members) => Some(read(members).len()),
            _ => None,
        }
    }

    /// Identity of a reference-typed value, stable for the lifetime of the container.
    pub fn identity(&self) -> Option<usize> {
        match self {
            Value::Array(a) => Some(Arc::as_ptr(a) as *const () as usize),
            Value::Object(o) => Some(Arc::as_ptr(o) as *const () as usize),
            Value::Instance(i) => Some(Arc::as_ptr(i) as *const () as usize),
            Value::Map(m) => Some(Arc::as_ptr(m) as *const () as usize),
            Value::Set(s) => Some(Arc::as_ptr(s) as *const () as usize),
            Value::Error(e) => Some(Arc::as_ptr(e) as *const () as usize),
            _ => None,
        }
    }

    /// The `typeof` classification of this value.
    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::BigInt(_) => "bigint",
            Value::String(_) => "string",
            Value::Symbol(_) => "symbol",
            Value::Function(_) => "function",
            _ => "object",
        }
    }

    /// Name of the constructor that produced this value.
    pub fn constructor_name(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(_) => "Boolean".to_string(),
            Value::Number(_) => "Number".to_string(),
            Value::BigInt(_) => "BigInt".to_string(),
            Value::String(_) => "String".to_string(),
            Value::Symbol(_) => "Symbol".to_string(),
            Value::Function(_) => "Function".to_string(),
            Value::Array(_) => "Array".to_string(),
            Value::Object(_) => "Object".to_string(),
            Value::Instance(inst) => read(inst).class_name.clone(),
            Value::ArrayBuffer(_) => "ArrayBuffer".to_string(),
            Value::TypedArray { kind, .. } => kind.constructor_name().to_string(),
            Value::Date(_) => "Date".to_string(),
            Value::Map(_) => "Map".to_string(),
            Value::Set(_) => "Set".to_string(),
            Value::RegExp(_) => "RegExp".to_string(),
            Value::Error(err) => err.name.clone(),
            Value::Encoded { form, .. } => form.constructor_name(),
        }
    }
}

/// Key equality used by maps and sets: primitives compare by value (NaN equals NaN),
/// reference types compare by identity.
pub fn same_value_zero(a: &Value, b: &Value) -> bool {
    match (a.identity(), b.identity()) {
        (Some(x), Some(y)) => return x == y,
        (Some(_), None) | (None, Some(_)) => return false,
        (None, None) => {}
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x == y || (x.is_nan() && y.is_nan()),
        // Dates, regexps and buffers are objects too; without a shared container they
        // never collide as keys.
        (Value::Date(_), _)
        | (Value::RegExp(_), _)
        | (Value::ArrayBuffer(_), _)
        | (Value::TypedArray { .. }, _) => false,
        _ => a == b,
    }
}

/// Pairs of containers currently being compared. A pair met again while it is still open
/// is assumed equal, which lets two cyclic graphs of the same shape compare equal.
type OpenPairs = Vec<(usize, usize)>;

fn unordered_eq<T>(a: &[T], b: &[T], mut eq: impl FnMut(&T, &T) -> bool) -> bool {
    a.len() == b.len() && a.iter().all(|x| b.iter().any(|y| eq(x, y)))
}

fn properties_eq(a: &Properties, b: &Properties, open: &mut OpenPairs) -> bool {
    a.len() == b.len()
        && a.iter().all(|(key, va)| match b.get(key) {
            Some(vb) => values_eq(va, vb, open),
            None => false,
        })
}

fn values_eq(a: &Value, b: &Value, open: &mut OpenPairs) -> bool {
    let pair = match (a.identity(), b.identity()) {
        (Some(x), Some(y)) if x == y => return true,
        (Some(x), Some(y)) => {
            if open.contains(&(x, y)) {
                return true;
            }
            open.push((x, y));
            true
        }
        _ => false,
    };

    let equal = match (a, b) {
        (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y || (x.is_nan() && y.is_nan()),
        (Value::BigInt(x), Value::BigInt(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Symbol(x), Value::Symbol(y)) => x == y,
        (Value::Function(x), Value::Function(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => {
            let (x, y) = (read(x).clone(), read(y).clone());
            x.len() == y.len() && x.iter().zip(&y).all(|(va, vb)| values_eq(va, vb, open))
        }
        (Value::Object(x), Value::Object(y)) => {
            let (x, y) = (read(x).clone(), read(y).clone());
            properties_eq(&x, &y, open)
        }
        (Value::Instance(x), Value::Instance(y)) => {
            let (x, y) = (read(x).clone(), read(y).clone());
            x.class_name == y.class_name && properties_eq(&x.properties, &y.properties, open)
        }
        (Value::ArrayBuffer(x), Value::ArrayBuffer(y)) => x == y,
        (
            Value::TypedArray { kind: ka, bytes: ba },
            Value::TypedArray { kind: kb, bytes: bb },
        ) => ka == kb && ba == bb,
        (Value::Date(x), Value::Date(y)) => x == y,
        (Value::Map(x), Value::Map(y)) => {
            let (x, y) = (read(x).clone(), read(y).clone());
            unordered_eq(&x, &y, |(ka, va), (kb, vb)| {
                values_eq(ka, kb, open) && values_eq(va, vb, open)
            })
        }
        (Value::Set(x), Value::Set(y)) => {
            let (x, y) = (read(x).clone(), read(y).clone());
            unordered_eq(&x, &y, |va, vb| values_eq(va, vb, open))
        }
        (Value::RegExp(x), Value::RegExp(y)) => x == y,
        (Value::Error(x), Value::Error(y)) => {
            x.name == y.name
                && x.message == y.message
                && x.stack == y.stack
                && match (&x.cause, &y.cause) {
                    (Some(ca), Some(cb)) => values_eq(ca, cb, open),
                    (None, None) => true,
                    _ => false,
                }
        }
        (
            Value::Encoded { codec: ca, form: fa },
            Value::Encoded { codec: cb, form: fb },
        ) => ca == cb && values_eq(fa, fb, open),
        _ => false,
    };

    if pair {
        open.pop();
    }
    equal
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        values_eq(self, other, &mut OpenPairs::new())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::array(items)
    }
}

impl From<ErrorValue> for Value {
    fn from(err: ErrorValue) -> Self {
        Value::error(err)
    }
}

/// Debug view that prints `[Circular]` instead of recursing into an ancestor.
struct Tracked<'a> {
    value: &'a Value,
    ancestors: &'a RefCell<Vec<usize>>,
}

impl Tracked<'_> {
    fn child<'b>(&'b self, value: &'b Value) -> Tracked<'b> {
        Tracked {
            value,
            ancestors: self.ancestors,
        }
    }
}

impl fmt::Debug for Tracked<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(id) = self.value.identity() {
            if self.ancestors.borrow().contains(&id) {
                return f.write_str("[Circular]");
            }
            self.ancestors.borrow_mut().push(id);
        }

        let result = match self.value {
            Value::Undefined => f.write_str("undefined"),
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::BigInt(n) => write!(f, "{n}n"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Symbol(s) => write!(f, "Symbol({s})"),
            Value::Function(name) => write!(f, "[Function {name}]"),
            Value::Array(items) => f
                .debug_list()
                .entries(read(items).iter().map(|v| self.child(v)))
                .finish(),
            Value::Object(props) => f
                .debug_map()
                .entries(read(props).iter().map(|(k, v)| (k, self.child(v))))
                .finish(),
            Value::Instance(inst) => {
                let inst = read(inst);
                f.write_str(&inst.class_name)?;
                f.write_str(" ")?;
                f.debug_map()
                    .entries(inst.properties.iter().map(|(k, v)| (k, self.child(v))))
                    .finish()
            }
            Value::ArrayBuffer(bytes) => write!(f, "ArrayBuffer({} bytes)", bytes.len()),
            Value::TypedArray { kind, bytes } => {
                write!(f, "{}({} bytes)", kind.constructor_name(), bytes.len())
            }
            Value::Date(at) => write!(f, "Date({})", at.to_rfc3339()),
            Value::Map(entries) => {
                f.write_str("Map ")?;
                f.debug_map()
                    .entries(
                        read(entries)
                            .iter()
                            .map(|(k, v)| (self.child(k), self.child(v))),
                    )
                    .finish()
            }
            Value::Set(members) => {
                f.write_str("Set ")?;
                f.debug_set()
                    .entries(read(members).iter().map(|v| self.child(v)))
                    .finish()
            }
            Value::RegExp(re) => write!(f, "/{}/{}", re.source, re.flags),
            Value::Error(err) => {
                let mut s = f.debug_struct(&err.name);
                s.field("message", &err.message);
                if let Some(cause) = &err.cause {
                    s.field("cause", &self.child(cause));
                }
                s.finish()
            }
            Value::Encoded { codec, form } => {
                write!(f, "<{codec}> ")?;
                self.child(form).fmt(f)
            }
        };

        if self.value.identity().is_some() {
            self.ancestors.borrow_mut().pop();
        }
        result
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ancestors = RefCell::new(Vec::new());
        Tracked {
            value: self,
            ancestors: &ancestors,
        }
        .fmt(f)
    }
}
