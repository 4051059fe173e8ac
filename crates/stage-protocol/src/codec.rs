//! Message encoding and the tokio codec for framed streams

use std::borrow::Cow;

use bincode::Options;
use bytes::{Bytes, BytesMut};
use serde_json::{Map, Value};
use tokio_util::codec::{Decoder, Encoder};

use crate::compression;
use crate::error::CodecError;
use crate::frame::{Frame, FrameFlags, FrameHeader, MAX_PAYLOAD_SIZE};
use crate::message::{BinaryKind, HelloAck, Hello, Message, StateDelta, RESERVED_TYPES};

/// Bincode configuration for binary bodies: varint integers, little endian,
/// trailing bytes rejected, bounded allocation.
fn binary_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_PAYLOAD_SIZE as u64)
}

/// Encode a message into a frame, compressing the payload if requested.
pub fn encode(message: &Message, compress: bool) -> Result<Frame, CodecError> {
    let body = if message.is_binary() {
        encode_binary(message)?
    } else {
        encode_json(message)?
    };

    let payload = if compress {
        compression::compress(&body)?
    } else {
        body
    };

    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    Ok(Frame::new(
        FrameFlags::new(compress, message.is_binary()),
        Bytes::from(payload),
    ))
}

/// Decode a frame into a message.
///
/// Decompression failures are [`CodecError::Corrupt`]; a payload that does not
/// match the shape of its declared kind is [`CodecError::Schema`]. Unknown
/// binary kinds are not errors and decode to [`Message::Unrecognized`].
pub fn decode(frame: &Frame) -> Result<Message, CodecError> {
    let body: Cow<'_, [u8]> = if frame.flags.is_compressed() {
        Cow::Owned(compression::decompress(&frame.payload, MAX_PAYLOAD_SIZE)?)
    } else {
        Cow::Borrowed(&frame.payload)
    };

    if frame.flags.is_binary() {
        decode_binary(&body)
    } else {
        decode_json(&body)
    }
}

fn tagged(kind: &str, value: Value) -> Result<Value, CodecError> {
    let mut object = match value {
        Value::Object(object) => object,
        other => {
            return Err(CodecError::schema(format!(
                "{kind} must serialize to a JSON object, got {other}"
            )))
        }
    };
    object.insert("type".to_string(), Value::String(kind.to_string()));
    Ok(Value::Object(object))
}

fn encode_json(message: &Message) -> Result<Vec<u8>, CodecError> {
    let value = match message {
        Message::Hello(hello) => tagged("hello", serde_json::to_value(hello)?)?,
        Message::HelloAck(ack) => tagged("hello-ack", serde_json::to_value(ack)?)?,
        Message::Ping { timestamp } => tagged("ping", serde_json::json!({ "timestamp": timestamp }))?,
        Message::Pong { timestamp } => tagged("pong", serde_json::json!({ "timestamp": timestamp }))?,
        Message::Control { kind, payload } => {
            if RESERVED_TYPES.contains(&kind.as_str()) {
                return Err(CodecError::schema(format!(
                    "control message cannot use reserved type '{kind}'"
                )));
            }
            let mut object = Map::new();
            object.insert("type".to_string(), Value::String(kind.clone()));
            if !payload.is_null() {
                object.insert("payload".to_string(), payload.clone());
            }
            Value::Object(object)
        }
        Message::StateDelta(_) | Message::Unrecognized { .. } => {
            return Err(CodecError::schema("binary message routed to JSON encoder"))
        }
    };

    Ok(serde_json::to_vec(&value)?)
}

fn encode_binary(message: &Message) -> Result<Vec<u8>, CodecError> {
    match message {
        Message::StateDelta(delta) => {
            let body = binary_options().serialize(delta)?;
            let mut out = Vec::with_capacity(body.len() + 1);
            out.push(BinaryKind::StateDelta.as_u8());
            out.extend_from_slice(&body);
            Ok(out)
        }
        Message::Unrecognized { kind, payload } => {
            if BinaryKind::from_u8(*kind).is_some() {
                return Err(CodecError::schema(format!(
                    "binary kind {kind:#04x} is known and cannot be sent as unrecognized"
                )));
            }
            let mut out = Vec::with_capacity(payload.len() + 1);
            out.push(*kind);
            out.extend_from_slice(payload);
            Ok(out)
        }
        _ => Err(CodecError::schema("JSON message routed to binary encoder")),
    }
}

#[derive(serde::Deserialize)]
struct Timestamp {
    timestamp: u64,
}

fn decode_json(body: &[u8]) -> Result<Message, CodecError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| CodecError::schema(format!("invalid JSON: {e}")))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| CodecError::schema("JSON message has no string 'type' field"))?
        .to_string();

    let shape = |e: serde_json::Error| CodecError::schema(format!("malformed '{kind}': {e}"));

    let message = match kind.as_str() {
        "hello" => Message::Hello(serde_json::from_value::<Hello>(value).map_err(shape)?),
        "hello-ack" => Message::HelloAck(serde_json::from_value::<HelloAck>(value).map_err(shape)?),
        "ping" => Message::Ping {
            timestamp: serde_json::from_value::<Timestamp>(value).map_err(shape)?.timestamp,
        },
        "pong" => Message::Pong {
            timestamp: serde_json::from_value::<Timestamp>(value).map_err(shape)?.timestamp,
        },
        _ => {
            let payload = value.get("payload").cloned().unwrap_or(Value::Null);
            Message::Control {
                kind: kind.clone(),
                payload,
            }
        }
    };

    Ok(message)
}

fn decode_binary(body: &[u8]) -> Result<Message, CodecError> {
    let (&kind, rest) = body
        .split_first()
        .ok_or_else(|| CodecError::schema("binary message has no kind tag"))?;

    match BinaryKind::from_u8(kind) {
        Some(BinaryKind::StateDelta) => {
            let delta: StateDelta = binary_options()
                .deserialize(rest)
                .map_err(|e| CodecError::schema(format!("malformed state delta: {e}")))?;
            Ok(Message::StateDelta(delta))
        }
        None => {
            tracing::debug!("Unrecognized binary message kind {:#04x}", kind);
            Ok(Message::Unrecognized {
                kind,
                payload: Bytes::copy_from_slice(rest),
            })
        }
    }
}

/// Codec splitting a byte stream into frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Current header being decoded (if any)
    pending_header: Option<FrameHeader>,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_header: None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Try to decode header if we don't have one
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None), // Need more data
            },
        };

        let payload_len = header.payload_length as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        if src.len() < payload_len {
            // Save header and wait for more data
            src.reserve(payload_len - src.len());
            self.pending_header = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(payload_len).freeze();
        Ok(Some(Frame::new(header.flags, payload)))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        frame.encode(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::HEADER_SIZE;
    use serde_json::json;

    fn sample_messages() -> Vec<Message> {
        let mut hello = Hello::new(true);
        hello.token = Some("secret".to_string());
        hello.device = Some(json!({ "uuid": "abc", "type": "native", "canAudio": true }));

        vec![
            Message::Hello(hello),
            Message::Hello(Hello::new(false)),
            Message::Hello(Hello {
                device: Some(Value::Null),
                ..Hello::new(false)
            }),
            Message::HelloAck(HelloAck::accepted()),
            Message::HelloAck(HelloAck::rejected("bad token")),
            Message::Ping { timestamp: 42 },
            Message::Pong { timestamp: u64::MAX },
            Message::control("stage-joined", json!({ "stageId": "s1", "groupId": null })),
            Message::control("chat", Value::Null),
            Message::StateDelta(StateDelta {
                sequence: 7,
                baseline: false,
                entity: "stage-device/42".to_string(),
                data: Bytes::from(vec![0u8; 300]),
            }),
            Message::StateDelta(StateDelta::new("", Bytes::new())),
            Message::Unrecognized {
                kind: 0x7F,
                payload: Bytes::from_static(b"future"),
            },
        ]
    }

    #[test]
    fn test_roundtrip_with_and_without_compression() {
        for message in sample_messages() {
            for compress in [false, true] {
                let frame = encode(&message, compress).unwrap();
                assert_eq!(frame.flags.is_compressed(), compress);
                assert_eq!(frame.flags.is_binary(), message.is_binary());
                assert_eq!(decode(&frame).unwrap(), message, "compress={compress}");
            }
        }
    }

    #[test]
    fn test_control_json_shape() {
        let frame = encode(&Message::control("chat", json!({ "text": "hi" })), false).unwrap();
        let value: Value = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(value, json!({ "type": "chat", "payload": { "text": "hi" } }));
    }

    #[test]
    fn test_hello_device_null_vs_absent() {
        let absent = br#"{"type":"hello","protocolVersion":1,"supportsCompression":false}"#;
        let frame = Frame::new(FrameFlags::new(false, false), Bytes::from_static(absent));
        let Message::Hello(hello) = decode(&frame).unwrap() else {
            panic!("expected hello");
        };
        assert_eq!(hello.device, None);

        let null = br#"{"type":"hello","protocolVersion":1,"supportsCompression":false,"device":null}"#;
        let frame = Frame::new(FrameFlags::new(false, false), Bytes::from_static(null));
        let Message::Hello(hello) = decode(&frame).unwrap() else {
            panic!("expected hello");
        };
        assert_eq!(hello.device, Some(Value::Null));
    }

    #[test]
    fn test_hello_ack_from_server_json() {
        let payload = br#"{"type":"hello-ack","accepted":true,"compression":true}"#;
        let frame = Frame::new(FrameFlags::new(false, false), Bytes::from_static(payload));
        match decode(&frame).unwrap() {
            Message::HelloAck(ack) => {
                assert!(ack.accepted);
                assert_eq!(ack.compression, Some(true));
            }
            other => panic!("Expected HelloAck, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_binary_kind_is_unrecognized() {
        let frame = Frame::new(FrameFlags::new(false, true), Bytes::from_static(b"\x99rest"));
        assert_eq!(
            decode(&frame).unwrap(),
            Message::Unrecognized {
                kind: 0x99,
                payload: Bytes::from_static(b"rest"),
            }
        );
    }

    #[test]
    fn test_schema_errors() {
        let cases: [(bool, &[u8]); 5] = [
            (false, &b"not json"[..]),
            (false, &br#"{"payload":1}"#[..]),
            (false, &br#"{"type":"hello-ack"}"#[..]),
            (true, &b""[..]),
            (true, &b"\x01\xFF\xFF"[..]),
        ];
        for (binary, payload) in cases {
            let frame = Frame::new(FrameFlags::new(false, binary), Bytes::copy_from_slice(payload));
            let err = decode(&frame).unwrap_err();
            assert!(matches!(err, CodecError::Schema(_)), "{payload:?}: {err}");
            assert!(!err.is_fatal());
        }
    }

    #[test]
    fn test_bad_compression_is_corrupt() {
        let frame = Frame::new(FrameFlags::new(true, true), Bytes::from_static(&[0xFF; 8]));
        let err = decode(&frame).unwrap_err();
        assert!(matches!(err, CodecError::Corrupt(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_reserved_control_kind_rejected() {
        let result = encode(&Message::control("hello", Value::Null), false);
        assert!(matches!(result, Err(CodecError::Schema(_))));

        let result = encode(
            &Message::Unrecognized {
                kind: BinaryKind::StateDelta.as_u8(),
                payload: Bytes::new(),
            },
            false,
        );
        assert!(matches!(result, Err(CodecError::Schema(_))));
    }

    #[test]
    fn test_codec_stream_roundtrip() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let messages = sample_messages();
        for message in &messages {
            codec.encode(encode(message, true).unwrap(), &mut buf).unwrap();
        }

        for message in &messages {
            let frame = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(&decode(&frame).unwrap(), message);
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_partial_read() {
        let mut codec = FrameCodec::new();

        let frame = encode(&Message::Ping { timestamp: 12345 }, false).unwrap();

        let mut full_buf = BytesMut::new();
        codec.encode(frame.clone(), &mut full_buf).unwrap();

        // Split inside the header
        let mut partial = full_buf.split_to(HEADER_SIZE - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        // Header complete, payload partial
        partial.extend_from_slice(&full_buf.split_to(3));
        assert!(codec.decode(&mut partial).unwrap().is_none());

        // Add the rest
        partial.extend_from_slice(&full_buf);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_codec_rejects_oversized_length() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        FrameHeader::new(MAX_PAYLOAD_SIZE as u32 + 1, FrameFlags::default()).encode(&mut buf);

        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(CodecError::PayloadTooLarge { .. })));
    }
}
