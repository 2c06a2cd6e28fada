//! IPC protocol messages for corral workers.
//!
//! Messages are length-prefixed over a byte stream.
//! Format: 4-byte length (u32 LE) + message encoded as JSON or bincode.

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::wire::Payload;
use crate::error::{Error, Result};
use crate::serialize::{ErrorSerializer, MessageSerializer, SerializedError};
use crate::value::{ErrorValue, Value};

/// Frames larger than this are rejected (100 MiB).
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Work sent from the pool to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub task_id: String,
    pub data: Payload,
}

/// Outcome sent from a worker back to the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyMessage {
    pub task_id: String,
    pub success: bool,
    pub result: Option<Payload>,
    /// A [`SerializedError`] encoded as JSON, or free text from a foreign worker.
    pub error: Option<String>,
}

impl ReplyMessage {
    pub fn success(task_id: impl Into<String>, result: Payload) -> Self {
        Self {
            task_id: task_id.into(),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(task_id: impl Into<String>, error: &SerializedError) -> Self {
        let error = ErrorSerializer::to_reply(error).unwrap_or_else(|_| error.message.clone());
        Self {
            task_id: task_id.into(),
            success: false,
            result: None,
            error: Some(error),
        }
    }
}

/// Run one task on the worker side and build its reply.
///
/// The payload is decoded with `serializer`, handed to `handler`, and the handler's
/// outcome is encoded back. A handler error is the thrown value. Decoding and encoding
/// problems become failed replies rather than errors.
pub fn run_task<F>(message: TaskMessage, serializer: &mut MessageSerializer, handler: F) -> ReplyMessage
where
    F: FnOnce(Value) -> std::result::Result<Value, Value>,
{
    let TaskMessage { task_id, data } = message;

    let data = match data.decode(serializer) {
        Ok(data) => data,
        Err(e) => {
            let thrown = Value::error(ErrorValue::new("SyntaxError", e.to_string()));
            return ReplyMessage::failure(task_id, &ErrorSerializer::serialize(&thrown));
        }
    };

    match handler(data) {
        Ok(result) => match Payload::encode(serializer, &result) {
            Ok(result) => ReplyMessage::success(task_id, result),
            Err(e) => {
                let thrown = Value::error(ErrorValue::new("DataCloneError", e.to_string()));
                ReplyMessage::failure(task_id, &ErrorSerializer::serialize(&thrown))
            }
        },
        Err(thrown) => ReplyMessage::failure(task_id, &ErrorSerializer::serialize(&thrown)),
    }
}

/// Message encoding used on a framed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Json,
    Bincode,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::Bincode => "bincode",
        }
    }

    pub fn encode<T: Serialize>(&self, message: &T) -> Result<Vec<u8>> {
        Ok(match self {
            Encoding::Json => serde_json::to_vec(message)?,
            Encoding::Bincode => bincode::serialize(message)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(match self {
            Encoding::Json => serde_json::from_slice(bytes)?,
            Encoding::Bincode => bincode::deserialize(bytes)?,
        })
    }
}

impl FromStr for Encoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(Encoding::Json),
            "bincode" => Ok(Encoding::Bincode),
            other => Err(Error::UnsupportedEncoding(other.to_string())),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn frame_len(len_bytes: [u8; 4]) -> Result<usize> {
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {len} bytes")));
    }
    Ok(len)
}

fn frame_header(bytes: &[u8]) -> Result<[u8; 4]> {
    if bytes.len() > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!(
            "IPC message too large: {} bytes",
            bytes.len()
        )));
    }
    Ok((bytes.len() as u32).to_le_bytes())
}

/// Write one length-prefixed message.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, encoding: Encoding, message: &T) -> Result<()> {
    let bytes = encoding.encode(message)?;
    let header = frame_header(&bytes)?;
    writer
        .write_all(&header)
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {e}")))?;
    writer
        .write_all(&bytes)
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {e}")))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {e}")))?;
    Ok(())
}

/// Read one length-prefixed message. Returns `None` on a clean end of stream.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R, encoding: Encoding) -> Result<Option<T>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Ipc(format!("Failed to read IPC message length: {e}"))),
    }
    let len = frame_len(len_bytes)?;

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {e}")))?;
    encoding.decode(&bytes).map(Some)
}

/// Async counterpart of [`write_frame`].
pub async fn write_frame_async<W, T>(writer: &mut W, encoding: Encoding, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encoding.encode(message)?;
    let header = frame_header(&bytes)?;
    writer
        .write_all(&header)
        .await
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {e}")))?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {e}")))?;
    Ok(())
}

/// Async counterpart of [`read_frame`].
pub async fn read_frame_async<R, T>(reader: &mut R, encoding: Encoding) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Ipc(format!("Failed to read IPC message length: {e}"))),
    }
    let len = frame_len(len_bytes)?;

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .await
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {e}")))?;
    encoding.decode(&bytes).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::WireValue;
    use crate::serialize::{ErrorCode, SerializerConfig};
    use std::io::Cursor;

    fn task(value: &Value) -> TaskMessage {
        let mut serializer = MessageSerializer::default();
        TaskMessage {
            task_id: "t-1".to_string(),
            data: Payload::encode(&mut serializer, value).unwrap(),
        }
    }

    #[test]
    fn test_task_roundtrip_both_encodings() {
        let message = task(&Value::object([
            ("op", Value::from("sum")),
            ("values", Value::array(vec![Value::from(1), Value::from(2.5)])),
        ]));

        for encoding in [Encoding::Json, Encoding::Bincode] {
            let mut buf = Vec::new();
            write_frame(&mut buf, encoding, &message).unwrap();

            let mut cursor = Cursor::new(buf);
            let decoded: TaskMessage = read_frame(&mut cursor, encoding).unwrap().unwrap();
            assert_eq!(decoded, message);

            let eof: Option<TaskMessage> = read_frame(&mut cursor, encoding).unwrap();
            assert!(eof.is_none());
        }
    }

    #[test]
    fn test_reply_with_type_info_bincode() {
        let mut serializer = MessageSerializer::new(SerializerConfig::preserving());
        let payload = Payload::encode(&mut serializer, &Value::set([Value::from(1)])).unwrap();
        let reply = ReplyMessage::success("t-2", payload);

        let bytes = Encoding::Bincode.encode(&reply).unwrap();
        let decoded: ReplyMessage = Encoding::Bincode.decode(&bytes).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes().to_vec();
        buf.extend_from_slice(b"{}");
        let result: Result<Option<TaskMessage>> = read_frame(&mut Cursor::new(buf), Encoding::Json);
        assert!(matches!(result, Err(Error::Ipc(_))));
    }

    struct ResetStream;

    impl Read for ResetStream {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer reset"))
        }
    }

    impl Write for ResetStream {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_stream_failures_are_ipc_errors() {
        let read: Result<Option<TaskMessage>> = read_frame(&mut ResetStream, Encoding::Json);
        match read {
            Err(Error::Ipc(message)) => assert!(message.contains("peer reset"), "{message}"),
            other => panic!("expected an IPC error, got {other:?}"),
        }

        let written = write_frame(&mut ResetStream, Encoding::Json, &task(&Value::Null));
        assert!(matches!(written, Err(Error::Ipc(message)) if message.contains("pipe closed")));

        // A header promising more bytes than arrive is not a clean end of stream.
        let mut truncated = 10u32.to_le_bytes().to_vec();
        truncated.extend_from_slice(b"{}");
        let result: Result<Option<TaskMessage>> =
            read_frame(&mut Cursor::new(truncated), Encoding::Json);
        assert!(matches!(result, Err(Error::Ipc(_))));
    }

    #[test]
    fn test_encoding_names() {
        assert_eq!("json".parse::<Encoding>().unwrap(), Encoding::Json);
        assert_eq!("bincode".parse::<Encoding>().unwrap(), Encoding::Bincode);
        assert!(matches!(
            "msgpack".parse::<Encoding>(),
            Err(Error::UnsupportedEncoding(name)) if name == "msgpack"
        ));
    }

    #[test]
    fn test_run_task_success() {
        let mut serializer = MessageSerializer::default();
        let reply = run_task(task(&Value::from(20)), &mut serializer, |data| {
            Ok(Value::from(data.as_f64().unwrap_or(0.0) + 1.0))
        });
        assert!(reply.success);
        assert_eq!(reply.task_id, "t-1");
        assert_eq!(reply.result.unwrap().value, WireValue::Number(21.0));
    }

    #[test]
    fn test_run_task_thrown_error() {
        let mut serializer = MessageSerializer::default();
        let reply = run_task(task(&Value::Null), &mut serializer, |_| {
            Err(Value::error(ErrorValue::new("RangeError", "out of range")))
        });
        assert!(!reply.success);
        let error = ErrorSerializer::from_reply(reply.error.as_deref().unwrap());
        assert_eq!(error.code, ErrorCode::ValidationError);
        assert_eq!(error.message, "out of range");
    }

    #[test]
    fn test_run_task_unserializable_result() {
        let mut serializer = MessageSerializer::default();
        let reply = run_task(task(&Value::Null), &mut serializer, |_| Ok(Value::function("f")));
        assert!(!reply.success);
        let error = ErrorSerializer::from_reply(reply.error.as_deref().unwrap());
        assert_eq!(error.error_type, "DataCloneError");
        assert_eq!(error.code, ErrorCode::TaskExecutionError);
    }
}
