//! MessagePack codec for hub frames.
//!
//! Provides serialization and deserialization of [`Frame`] to/from the
//! MessagePack binary format used by ASP.NET Core SignalR. Every message is
//! preceded by a VarInt length prefix (7 bits per byte, least significant
//! group first, at most 5 bytes).
//!
//! Decoded values are mapped onto JSON: `bin` becomes an array of byte
//! values and the timestamp extension becomes milliseconds since the epoch.

use bytes::{Buf, BufMut, BytesMut};
use serde_json::Value;
use tracing::debug;

use super::frame::kind;
use super::{CompletionResult, Frame, HubProtocol, ProtocolError, TransferFormat};

const MAX_PREFIX_BYTES: usize = 5;
const MAX_MESSAGE_LEN: u64 = i32::MAX as u64;

const RESULT_KIND_ERROR: u64 = 1;
const RESULT_KIND_VOID: u64 = 2;
const RESULT_KIND_VALUE: u64 = 3;

/// Codec for the SignalR MessagePack protocol (version 1).
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePackCodec;

impl MessagePackCodec {
    /// Encodes a [`Frame`] into a MessagePack array, without length prefix.
    pub fn encode_payload(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::new();
        let headers = Value::Object(serde_json::Map::new());

        match frame {
            Frame::Invocation {
                invocation_id,
                target,
                arguments,
                stream_ids,
            } => {
                // [1, Headers, InvocationId, Target, [Arguments], [StreamIds]]
                let payload = vec![
                    Value::from(kind::INVOCATION),
                    headers,
                    invocation_id.clone().map_or(Value::Null, Value::String),
                    Value::String(target.clone()),
                    Value::Array(arguments.clone()),
                    string_array(stream_ids),
                ];
                rmp_serde::encode::write(&mut buf, &payload)?;
            }
            Frame::StreamInvocation {
                invocation_id,
                target,
                arguments,
                stream_ids,
            } => {
                let payload = vec![
                    Value::from(kind::STREAM_INVOCATION),
                    headers,
                    Value::String(invocation_id.clone()),
                    Value::String(target.clone()),
                    Value::Array(arguments.clone()),
                    string_array(stream_ids),
                ];
                rmp_serde::encode::write(&mut buf, &payload)?;
            }
            Frame::StreamItem {
                invocation_id,
                item,
            } => {
                let payload = vec![
                    Value::from(kind::STREAM_ITEM),
                    headers,
                    Value::String(invocation_id.clone()),
                    item.clone(),
                ];
                rmp_serde::encode::write(&mut buf, &payload)?;
            }
            Frame::Completion {
                invocation_id,
                result,
            } => {
                // [3, Headers, InvocationId, ResultKind, Result?]
                let mut payload = vec![
                    Value::from(kind::COMPLETION),
                    headers,
                    Value::String(invocation_id.clone()),
                ];
                match result {
                    CompletionResult::Error(e) => {
                        payload.push(Value::from(RESULT_KIND_ERROR));
                        payload.push(Value::String(e.clone()));
                    }
                    CompletionResult::Void => payload.push(Value::from(RESULT_KIND_VOID)),
                    CompletionResult::Value(v) => {
                        payload.push(Value::from(RESULT_KIND_VALUE));
                        payload.push(v.clone());
                    }
                }
                rmp_serde::encode::write(&mut buf, &payload)?;
            }
            Frame::CancelInvocation { invocation_id } => {
                let payload = vec![
                    Value::from(kind::CANCEL_INVOCATION),
                    headers,
                    Value::String(invocation_id.clone()),
                ];
                rmp_serde::encode::write(&mut buf, &payload)?;
            }
            Frame::Ping => {
                // [6]
                rmp_serde::encode::write(&mut buf, &(kind::PING as u32,))?;
            }
            Frame::Close {
                error,
                allow_reconnect,
            } => {
                // [7, Error, AllowReconnect]
                let payload = vec![
                    Value::from(kind::CLOSE),
                    error.clone().map_or(Value::Null, Value::String),
                    Value::Bool(*allow_reconnect),
                ];
                rmp_serde::encode::write(&mut buf, &payload)?;
            }
        }

        Ok(buf)
    }

    /// Decodes one MessagePack array (without length prefix) into a [`Frame`].
    pub fn decode_payload(data: &[u8]) -> Result<Frame, ProtocolError> {
        let array: Vec<Value> = match rmpv::decode::read_value(&mut &data[..])? {
            rmpv::Value::Array(items) => items.into_iter().map(wire_to_json).collect(),
            _ => return Err(ProtocolError::invalid("message must be an array")),
        };

        let message_type = array
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| ProtocolError::invalid("missing message type"))?;

        match message_type {
            kind::INVOCATION => {
                expect_len(&array, 5, "Invocation")?;
                let invocation_id = match &array[2] {
                    Value::String(s) => Some(s.clone()),
                    Value::Null => None,
                    _ => return Err(ProtocolError::invalid("invocation id must be a string")),
                };
                Ok(Frame::Invocation {
                    invocation_id,
                    target: string_at(&array, 3, "target")?,
                    arguments: array_at(&array, 4, "arguments")?,
                    stream_ids: stream_ids_at(&array, 5)?,
                })
            }
            kind::STREAM_INVOCATION => {
                expect_len(&array, 5, "StreamInvocation")?;
                Ok(Frame::StreamInvocation {
                    invocation_id: string_at(&array, 2, "invocation id")?,
                    target: string_at(&array, 3, "target")?,
                    arguments: array_at(&array, 4, "arguments")?,
                    stream_ids: stream_ids_at(&array, 5)?,
                })
            }
            kind::STREAM_ITEM => {
                expect_len(&array, 4, "StreamItem")?;
                Ok(Frame::StreamItem {
                    invocation_id: string_at(&array, 2, "invocation id")?,
                    item: array[3].clone(),
                })
            }
            kind::COMPLETION => {
                expect_len(&array, 4, "Completion")?;
                let invocation_id = string_at(&array, 2, "invocation id")?;
                let result = match array[3].as_u64() {
                    Some(RESULT_KIND_ERROR) => {
                        CompletionResult::Error(string_at(&array, 4, "completion error")?)
                    }
                    Some(RESULT_KIND_VOID) => CompletionResult::Void,
                    Some(RESULT_KIND_VALUE) => {
                        let value = array
                            .get(4)
                            .cloned()
                            .ok_or_else(|| ProtocolError::invalid("completion result missing"))?;
                        CompletionResult::Value(value)
                    }
                    _ => return Err(ProtocolError::invalid("unknown completion result kind")),
                };
                Ok(Frame::Completion {
                    invocation_id,
                    result,
                })
            }
            kind::CANCEL_INVOCATION => {
                expect_len(&array, 3, "CancelInvocation")?;
                Ok(Frame::CancelInvocation {
                    invocation_id: string_at(&array, 2, "invocation id")?,
                })
            }
            kind::PING => Ok(Frame::Ping),
            kind::CLOSE => {
                expect_len(&array, 2, "Close")?;
                let error = match &array[1] {
                    Value::String(s) => Some(s.clone()),
                    Value::Null => None,
                    _ => return Err(ProtocolError::invalid("close error must be a string")),
                };
                // Older servers send only [7, Error].
                let allow_reconnect = array.get(2).and_then(Value::as_bool).unwrap_or(false);
                Ok(Frame::Close {
                    error,
                    allow_reconnect,
                })
            }
            other => Err(ProtocolError::UnexpectedMessageType(other)),
        }
    }
}

impl HubProtocol for MessagePackCodec {
    fn name(&self) -> &'static str {
        "messagepack"
    }

    fn version(&self) -> u32 {
        1
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Binary
    }

    fn write_message(&self, frame: &Frame, out: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload = Self::encode_payload(frame)?;
        write_length_prefix(payload.len() as u64, out);
        out.put_slice(&payload);
        Ok(())
    }

    fn parse_message(&self, input: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        loop {
            let Some((len, prefix)) = read_length_prefix(input)? else {
                return Ok(None);
            };
            let total = prefix + len as usize;
            if input.len() < total {
                return Ok(None);
            }
            input.advance(prefix);
            let payload = input.split_to(len as usize);
            match Self::decode_payload(&payload) {
                Err(ProtocolError::UnexpectedMessageType(message_type)) => {
                    debug!(message_type, "Ignoring message of unknown type");
                }
                decoded => return decoded.map(Some),
            }
        }
    }
}

fn write_length_prefix(mut len: u64, out: &mut BytesMut) {
    loop {
        let mut byte = (len & 0x7f) as u8;
        len >>= 7;
        if len > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

/// Returns `(payload length, prefix length)` once the whole prefix is buffered.
fn read_length_prefix(input: &[u8]) -> Result<Option<(u64, usize)>, ProtocolError> {
    let mut len = 0u64;
    for (i, byte) in input.iter().take(MAX_PREFIX_BYTES).enumerate() {
        len |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            if len > MAX_MESSAGE_LEN {
                return Err(ProtocolError::MessageTooLarge(len));
            }
            return Ok(Some((len, i + 1)));
        }
    }
    if input.len() >= MAX_PREFIX_BYTES {
        return Err(ProtocolError::invalid("length prefix longer than 5 bytes"));
    }
    Ok(None)
}

const TIMESTAMP_EXT: i8 = -1;

fn wire_to_json(value: rmpv::Value) -> Value {
    match value {
        rmpv::Value::Nil => Value::Null,
        rmpv::Value::Boolean(b) => Value::Bool(b),
        rmpv::Value::Integer(n) => match (n.as_u64(), n.as_i64()) {
            (Some(u), _) => Value::from(u),
            (None, Some(i)) => Value::from(i),
            (None, None) => Value::Null,
        },
        rmpv::Value::F32(f) => float_to_json(f64::from(f)),
        rmpv::Value::F64(f) => float_to_json(f),
        rmpv::Value::String(s) => Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        rmpv::Value::Binary(bytes) => bytes_to_json(&bytes),
        rmpv::Value::Array(items) => Value::Array(items.into_iter().map(wire_to_json).collect()),
        rmpv::Value::Map(entries) => Value::Object(
            entries
                .into_iter()
                .map(|(key, value)| {
                    let key = match key {
                        rmpv::Value::String(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                        other => other.to_string(),
                    };
                    (key, wire_to_json(value))
                })
                .collect(),
        ),
        rmpv::Value::Ext(TIMESTAMP_EXT, data) => timestamp_millis(&data)
            .map(Value::from)
            .unwrap_or_else(|| bytes_to_json(&data)),
        rmpv::Value::Ext(_, data) => bytes_to_json(&data),
    }
}

fn float_to_json(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn bytes_to_json(bytes: &[u8]) -> Value {
    Value::Array(bytes.iter().map(|b| Value::from(*b)).collect())
}

/// Milliseconds since the Unix epoch for the 32, 64 and 96 bit timestamp layouts.
fn timestamp_millis(data: &[u8]) -> Option<i64> {
    let (seconds, nanos) = match data.len() {
        4 => (i64::from(u32::from_be_bytes(data.try_into().ok()?)), 0),
        8 => {
            let packed = u64::from_be_bytes(data.try_into().ok()?);
            ((packed & 0x3_ffff_ffff) as i64, (packed >> 34) as u32)
        }
        12 => (
            i64::from_be_bytes(data[4..].try_into().ok()?),
            u32::from_be_bytes(data[..4].try_into().ok()?),
        ),
        _ => return None,
    };
    seconds
        .checked_mul(1000)?
        .checked_add(i64::from(nanos / 1_000_000))
}

fn string_array(items: &[String]) -> Value {
    Value::Array(items.iter().cloned().map(Value::String).collect())
}

fn expect_len(array: &[Value], min: usize, what: &str) -> Result<(), ProtocolError> {
    if array.len() < min {
        return Err(ProtocolError::invalid(format!(
            "{what} message has {} elements, expected at least {min}",
            array.len()
        )));
    }
    Ok(())
}

fn string_at(array: &[Value], index: usize, what: &str) -> Result<String, ProtocolError> {
    match array.get(index) {
        Some(Value::String(s)) => Ok(s.clone()),
        _ => Err(ProtocolError::invalid(format!("{what} must be a string"))),
    }
}

fn array_at(array: &[Value], index: usize, what: &str) -> Result<Vec<Value>, ProtocolError> {
    match array.get(index) {
        Some(Value::Array(items)) => Ok(items.clone()),
        _ => Err(ProtocolError::invalid(format!("{what} must be an array"))),
    }
}

fn stream_ids_at(array: &[Value], index: usize) -> Result<Vec<String>, ProtocolError> {
    match array.get(index) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(ids)) => ids
            .iter()
            .map(|id| {
                id.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ProtocolError::invalid("stream ids must be strings"))
            })
            .collect(),
        Some(_) => Err(ProtocolError::invalid("stream ids must be an array")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let codec = MessagePackCodec;
        let mut buf = BytesMut::new();
        codec.write_message(&frame, &mut buf).unwrap();
        let decoded = codec.parse_message(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        decoded
    }

    #[test]
    fn test_ping_bytes() {
        let encoded = MessagePackCodec.encode(&Frame::Ping).unwrap();
        // length 2, then MessagePack [6]
        assert_eq!(encoded, vec![0x02, 0x91, 0x06]);
    }

    #[test]
    fn test_invocation_layout() {
        let frame = Frame::Invocation {
            invocation_id: Some("1".into()),
            target: "Echo".into(),
            arguments: vec![serde_json::json!("hello")],
            stream_ids: vec![],
        };
        let payload = MessagePackCodec::encode_payload(&frame).unwrap();
        let decoded_as_json: Vec<Value> = rmp_serde::from_slice(&payload).unwrap();

        assert_eq!(decoded_as_json.len(), 6);
        assert_eq!(decoded_as_json[0], Value::from(1u64));
        assert_eq!(decoded_as_json[1], serde_json::json!({}));
        assert_eq!(decoded_as_json[2], Value::String("1".into()));
        assert_eq!(decoded_as_json[3], Value::String("Echo".into()));
        assert_eq!(decoded_as_json[4], serde_json::json!(["hello"]));
        assert_eq!(decoded_as_json[5], serde_json::json!([]));
    }

    #[test]
    fn test_invocation_without_id_and_with_streams() {
        let frame = Frame::Invocation {
            invocation_id: None,
            target: "Upload".into(),
            arguments: vec![serde_json::json!({"title": "Hello"})],
            stream_ids: vec!["2".into(), "3".into()],
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_completion_kinds() {
        for result in [
            CompletionResult::Void,
            CompletionResult::Value(serde_json::json!(null)),
            CompletionResult::Value(serde_json::json!([1, 2, 3])),
            CompletionResult::Error("Something went wrong".into()),
        ] {
            let frame = Frame::completion("9", result);
            assert_eq!(roundtrip(frame.clone()), frame);
        }
    }

    #[test]
    fn test_close_without_allow_reconnect_field() {
        // [7, "bye"] as sent by older servers
        let mut payload = Vec::new();
        rmp_serde::encode::write(&mut payload, &(7u32, "bye")).unwrap();
        let frame = MessagePackCodec::decode_payload(&payload).unwrap();
        assert_eq!(
            frame,
            Frame::Close {
                error: Some("bye".into()),
                allow_reconnect: false,
            }
        );
    }

    #[test]
    fn test_partial_message_waits_for_more_bytes() {
        let codec = MessagePackCodec;
        let encoded = codec
            .encode(&Frame::StreamItem {
                invocation_id: "4".into(),
                item: serde_json::json!("a fairly long item to split in the middle"),
            })
            .unwrap();

        let mut buf = BytesMut::from(&encoded[..encoded.len() / 2]);
        assert!(codec.parse_message(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[encoded.len() / 2..]);
        let frame = codec.parse_message(&mut buf).unwrap().unwrap();
        assert!(matches!(frame, Frame::StreamItem { ref invocation_id, .. } if invocation_id == "4"));
    }

    #[test]
    fn test_two_messages_in_one_buffer() {
        let codec = MessagePackCodec;
        let mut buf = BytesMut::new();
        codec.write_message(&Frame::Ping, &mut buf).unwrap();
        codec
            .write_message(
                &Frame::CancelInvocation {
                    invocation_id: "12".into(),
                },
                &mut buf,
            )
            .unwrap();

        assert_eq!(codec.parse_message(&mut buf).unwrap(), Some(Frame::Ping));
        assert_eq!(
            codec.parse_message(&mut buf).unwrap(),
            Some(Frame::CancelInvocation {
                invocation_id: "12".into()
            })
        );
        assert_eq!(codec.parse_message(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_long_length_prefix() {
        let mut buf = BytesMut::new();
        write_length_prefix(300, &mut buf);
        assert_eq!(&buf[..], &[0xac, 0x02]);
        assert_eq!(read_length_prefix(&buf).unwrap(), Some((300, 2)));
    }

    #[test]
    fn test_unknown_message_type() {
        let mut payload = Vec::new();
        rmp_serde::encode::write(&mut payload, &(42u32,)).unwrap();
        assert!(matches!(
            MessagePackCodec::decode_payload(&payload),
            Err(ProtocolError::UnexpectedMessageType(42))
        ));
    }

    #[test]
    fn test_unknown_message_type_is_skipped() {
        let codec = MessagePackCodec;
        let mut payload = Vec::new();
        rmp_serde::encode::write(&mut payload, &(42u32, "future")).unwrap();
        let mut buf = BytesMut::new();
        write_length_prefix(payload.len() as u64, &mut buf);
        buf.put_slice(&payload);
        codec.write_message(&Frame::Ping, &mut buf).unwrap();

        assert_eq!(codec.parse_message(&mut buf).unwrap(), Some(Frame::Ping));
        assert!(buf.is_empty());

        // A lone unknown message leaves nothing to return.
        let mut buf = BytesMut::new();
        write_length_prefix(payload.len() as u64, &mut buf);
        buf.put_slice(&payload);
        assert_eq!(codec.parse_message(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_completion_with_binary_result() {
        // [3, {}, "1", 3, bin(1, 2, 3)]
        let payload = [
            0x95, 0x03, 0x80, 0xa1, b'1', 0x03, 0xc4, 0x03, 0x01, 0x02, 0x03,
        ];
        let frame = MessagePackCodec::decode_payload(&payload).unwrap();
        let Frame::Completion {
            result: CompletionResult::Value(value),
            ..
        } = frame
        else {
            panic!("Expected a completion with a value");
        };
        let bytes: Vec<u8> = serde_json::from_value(value).unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[test]
    fn test_stream_item_with_timestamp() {
        // [2, {}, "7", timestamp32(1_700_000_000)]
        let mut payload = vec![0x94, 0x02, 0x80, 0xa1, b'7', 0xd6, 0xff];
        payload.extend_from_slice(&1_700_000_000u32.to_be_bytes());
        let frame = MessagePackCodec::decode_payload(&payload).unwrap();
        assert_eq!(
            frame,
            Frame::StreamItem {
                invocation_id: "7".into(),
                item: serde_json::json!(1_700_000_000_000i64),
            }
        );
    }

    #[test]
    fn test_timestamp_layouts() {
        let packed: u64 = (500_000_000u64 << 34) | 10;
        assert_eq!(timestamp_millis(&packed.to_be_bytes()), Some(10_500));

        let mut wide = 250_000_000u32.to_be_bytes().to_vec();
        wide.extend_from_slice(&(-2i64).to_be_bytes());
        assert_eq!(timestamp_millis(&wide), Some(-1_750));

        assert_eq!(timestamp_millis(&[1, 2, 3]), None);
    }
}
