//! Core engine for corral worker pools.
//!
//! This crate provides:
//! - A dynamic value model that can hold cyclic graphs and special types
//! - Type codecs and a type-preserving message serializer
//! - Error serialization and payload validation
//! - A length-prefixed IPC protocol for worker processes
//! - A worker pool with bounded queueing, timeouts and crash recovery

pub mod codec;
pub mod error;
pub mod ipc;
pub mod pool;
pub mod serialize;
pub mod validate;
pub mod value;

pub use codec::{ChildEncoder, CodecRegistry, TypeCodec};
pub use error::{Error, Result};
pub use ipc::{Encoding, Payload, ProcessBackend, ReplyMessage, TaskMessage, WireValue};
pub use pool::{
    ExecutionUnit, PoolConfig, PoolStats, TaskHandle, TaskHandler, ThreadBackend, UnitEvent,
    UnitEvents, WorkerBackend, WorkerPool, WorkerSnapshot,
};
pub use serialize::{
    CircularRefStrategy, ErrorCode, ErrorSerializer, MessageSerializer, Serialized,
    SerializedError, SerializerConfig, TypeInfo, TypeSchema,
};
pub use validate::{validate_against_schema, validate_serializable, MessageSchema, ValidationResult};
pub use value::{ErrorValue, InstanceValue, RegExpValue, TypedArrayKind, Value};
