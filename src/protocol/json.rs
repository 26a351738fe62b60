//! JSON codec for hub frames.
//!
//! Each message is a JSON object terminated by the ASCII record separator
//! (`0x1E`). The `type` field selects the message kind.

use bytes::{BufMut, BytesMut};
use serde_json::{Map, Value};
use tracing::debug;

use super::frame::kind;
use super::{CompletionResult, Frame, HubProtocol, ProtocolError, TransferFormat};

pub(crate) const RECORD_SEPARATOR: u8 = 0x1e;

/// Codec for the SignalR JSON protocol (version 1).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    fn to_object(frame: &Frame) -> Map<String, Value> {
        let mut map = Map::new();
        match frame {
            Frame::Invocation {
                invocation_id,
                target,
                arguments,
                stream_ids,
            } => {
                map.insert("type".into(), kind::INVOCATION.into());
                if let Some(id) = invocation_id {
                    map.insert("invocationId".into(), id.clone().into());
                }
                map.insert("target".into(), target.clone().into());
                map.insert("arguments".into(), Value::Array(arguments.clone()));
                if !stream_ids.is_empty() {
                    map.insert("streamIds".into(), stream_ids.clone().into());
                }
            }
            Frame::StreamInvocation {
                invocation_id,
                target,
                arguments,
                stream_ids,
            } => {
                map.insert("type".into(), kind::STREAM_INVOCATION.into());
                map.insert("invocationId".into(), invocation_id.clone().into());
                map.insert("target".into(), target.clone().into());
                map.insert("arguments".into(), Value::Array(arguments.clone()));
                if !stream_ids.is_empty() {
                    map.insert("streamIds".into(), stream_ids.clone().into());
                }
            }
            Frame::StreamItem {
                invocation_id,
                item,
            } => {
                map.insert("type".into(), kind::STREAM_ITEM.into());
                map.insert("invocationId".into(), invocation_id.clone().into());
                map.insert("item".into(), item.clone());
            }
            Frame::Completion {
                invocation_id,
                result,
            } => {
                map.insert("type".into(), kind::COMPLETION.into());
                map.insert("invocationId".into(), invocation_id.clone().into());
                match result {
                    CompletionResult::Void => {}
                    CompletionResult::Value(v) => {
                        map.insert("result".into(), v.clone());
                    }
                    CompletionResult::Error(e) => {
                        map.insert("error".into(), e.clone().into());
                    }
                }
            }
            Frame::CancelInvocation { invocation_id } => {
                map.insert("type".into(), kind::CANCEL_INVOCATION.into());
                map.insert("invocationId".into(), invocation_id.clone().into());
            }
            Frame::Ping => {
                map.insert("type".into(), kind::PING.into());
            }
            Frame::Close {
                error,
                allow_reconnect,
            } => {
                map.insert("type".into(), kind::CLOSE.into());
                if let Some(e) = error {
                    map.insert("error".into(), e.clone().into());
                }
                if *allow_reconnect {
                    map.insert("allowReconnect".into(), true.into());
                }
            }
        }
        map
    }

    fn from_object(mut map: Map<String, Value>) -> Result<Frame, ProtocolError> {
        let message_type = map
            .get("type")
            .and_then(Value::as_u64)
            .ok_or_else(|| ProtocolError::invalid("missing 'type' property"))?;

        let frame = match message_type {
            kind::INVOCATION => Frame::Invocation {
                invocation_id: optional_string(&map, "invocationId")?,
                target: required_string(&map, "target")?,
                arguments: take_arguments(&mut map)?,
                stream_ids: stream_ids(&map)?,
            },
            kind::STREAM_INVOCATION => Frame::StreamInvocation {
                invocation_id: required_string(&map, "invocationId")?,
                target: required_string(&map, "target")?,
                arguments: take_arguments(&mut map)?,
                stream_ids: stream_ids(&map)?,
            },
            kind::STREAM_ITEM => Frame::StreamItem {
                invocation_id: required_string(&map, "invocationId")?,
                item: map.remove("item").unwrap_or(Value::Null),
            },
            kind::COMPLETION => {
                let invocation_id = required_string(&map, "invocationId")?;
                let result = if let Some(error) = optional_string(&map, "error")? {
                    CompletionResult::Error(error)
                } else if let Some(value) = map.remove("result") {
                    CompletionResult::Value(value)
                } else {
                    CompletionResult::Void
                };
                Frame::Completion {
                    invocation_id,
                    result,
                }
            }
            kind::CANCEL_INVOCATION => Frame::CancelInvocation {
                invocation_id: required_string(&map, "invocationId")?,
            },
            kind::PING => Frame::Ping,
            kind::CLOSE => Frame::Close {
                error: optional_string(&map, "error")?,
                allow_reconnect: map
                    .get("allowReconnect")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
            other => return Err(ProtocolError::UnexpectedMessageType(other)),
        };
        Ok(frame)
    }
}

impl HubProtocol for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn version(&self) -> u32 {
        1
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Text
    }

    fn write_message(&self, frame: &Frame, out: &mut BytesMut) -> Result<(), ProtocolError> {
        let text = serde_json::to_vec(&Value::Object(Self::to_object(frame)))?;
        out.put_slice(&text);
        out.put_u8(RECORD_SEPARATOR);
        Ok(())
    }

    fn parse_message(&self, input: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        while let Some(end) = input.iter().position(|b| *b == RECORD_SEPARATOR) {
            let record = input.split_to(end + 1);
            let Value::Object(map) = serde_json::from_slice::<Value>(&record[..end])? else {
                return Err(ProtocolError::invalid("message must be a JSON object"));
            };
            match Self::from_object(map) {
                Err(ProtocolError::UnexpectedMessageType(message_type)) => {
                    debug!(message_type, "Ignoring message of unknown type");
                }
                decoded => return decoded.map(Some),
            }
        }
        Ok(None)
    }
}

fn required_string(map: &Map<String, Value>, key: &str) -> Result<String, ProtocolError> {
    optional_string(map, key)?
        .ok_or_else(|| ProtocolError::invalid(format!("missing '{key}' property")))
}

fn optional_string(map: &Map<String, Value>, key: &str) -> Result<Option<String>, ProtocolError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ProtocolError::invalid(format!("'{key}' must be a string"))),
    }
}

fn take_arguments(map: &mut Map<String, Value>) -> Result<Vec<Value>, ProtocolError> {
    match map.remove("arguments") {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items),
        Some(_) => Err(ProtocolError::invalid("'arguments' must be an array")),
    }
}

fn stream_ids(map: &Map<String, Value>) -> Result<Vec<String>, ProtocolError> {
    match map.get("streamIds") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(ids)) => ids
            .iter()
            .map(|id| {
                id.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ProtocolError::invalid("'streamIds' must contain strings"))
            })
            .collect(),
        Some(_) => Err(ProtocolError::invalid("'streamIds' must be an array")),
    }
}
