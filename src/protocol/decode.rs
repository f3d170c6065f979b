//! Incremental packet decoding.
//!
//! [`PacketDecoder`] consumes the frame stream of one connection. Text frames
//! parse immediately unless they declare binary attachments, in which case the
//! partially decoded packet is parked until every attachment frame has
//! arrived; the completed packet is then returned with each placeholder slot
//! replaced by its raw bytes.
//!
//! A decoder holds at most one parked packet. The frame order is part of the
//! protocol: a second text frame while attachments are owed, or a binary
//! frame while none are, is a [`DecodeError`] and the connection should be
//! closed.

use std::fmt;

use bytes::Bytes;

use crate::protocol::packet::{Packet, PacketType, Payload, Placeholder, MAX_ATTACHMENTS};

/// Errors produced while decoding inbound frames.
#[derive(Debug)]
pub enum DecodeError {
    /// Text frame was empty.
    Empty,
    /// Leading character is not a known packet type digit.
    UnknownType(char),
    /// Binary packet header is missing its `<count>-` attachment field.
    BadAttachmentHeader,
    /// Declared attachment count exceeds [`MAX_ATTACHMENTS`].
    TooManyAttachments(usize),
    /// Ack id field is present but does not parse.
    BadAckId,
    /// Payload segment is not valid JSON.
    BadJson(serde_json::Error),
    /// Event or ack payload is not a JSON array.
    NonArrayData,
    /// Event payload is empty or its first element is not a string.
    MissingEventName,
    /// Placeholder index does not match any received attachment.
    BadPlaceholder(usize),
    /// Text frame arrived while binary attachments were still owed.
    UnexpectedText,
    /// Binary frame arrived while no attachments were owed.
    UnexpectedBinary,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty text frame"),
            Self::UnknownType(c) => write!(f, "Unknown packet type '{c}'"),
            Self::BadAttachmentHeader => write!(f, "Malformed attachment count header"),
            Self::TooManyAttachments(n) => {
                write!(f, "Declared {n} attachments (max {MAX_ATTACHMENTS})")
            }
            Self::BadAckId => write!(f, "Malformed ack id"),
            Self::BadJson(e) => write!(f, "Invalid JSON payload: {e}"),
            Self::NonArrayData => write!(f, "Event or ack payload is not a JSON array"),
            Self::MissingEventName => write!(f, "Event payload has no string event name"),
            Self::BadPlaceholder(num) => write!(f, "Placeholder index {num} out of range"),
            Self::UnexpectedText => {
                write!(f, "Text frame while binary attachments were expected")
            }
            Self::UnexpectedBinary => write!(f, "Binary frame while none was expected"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Text frame parsed down to its packet, plus the declared attachment count.
struct ParsedText {
    packet: Packet,
    attachments: usize,
}

/// Stateful decoder for one connection's frame stream.
#[derive(Debug, Default)]
pub struct PacketDecoder {
    pending: Option<PendingBinary>,
}

#[derive(Debug)]
struct PendingBinary {
    packet: Packet,
    expected: usize,
    received: Vec<Bytes>,
}

impl PacketDecoder {
    /// New decoder with no parked packet.
    pub fn new() -> Self {
        PacketDecoder::default()
    }

    /// Number of binary frames still owed for the parked packet.
    pub fn attachments_owed(&self) -> usize {
        self.pending
            .as_ref()
            .map_or(0, |p| p.expected - p.received.len())
    }

    /// Consume a text frame.
    ///
    /// Returns `Ok(None)` when the frame declared attachments and the packet
    /// is parked awaiting them.
    pub fn feed_text(&mut self, text: &str) -> Result<Option<Packet>, DecodeError> {
        if self.pending.is_some() {
            return Err(DecodeError::UnexpectedText);
        }
        let ParsedText {
            packet,
            attachments,
        } = parse_text(text)?;
        if attachments == 0 {
            if packet.packet_type.is_binary() {
                return Ok(Some(finish(packet, &[])?));
            }
            return Ok(Some(packet));
        }
        self.pending = Some(PendingBinary {
            packet,
            expected: attachments,
            received: Vec::with_capacity(attachments),
        });
        Ok(None)
    }

    /// Consume a binary frame.
    ///
    /// Returns `Ok(None)` while more attachments are owed, and the completed
    /// packet once the last one arrives.
    pub fn feed_binary(&mut self, frame: Bytes) -> Result<Option<Packet>, DecodeError> {
        let Some(mut pending) = self.pending.take() else {
            return Err(DecodeError::UnexpectedBinary);
        };
        pending.received.push(frame);
        if pending.received.len() < pending.expected {
            self.pending = Some(pending);
            return Ok(None);
        }
        Ok(Some(finish(pending.packet, &pending.received)?))
    }
}

/// Substitute placeholder slots with their received attachments.
///
/// Only top-level argument slots are considered; placeholder-shaped objects
/// nested deeper inside a JSON argument are left untouched.
fn finish(mut packet: Packet, received: &[Bytes]) -> Result<Packet, DecodeError> {
    for slot in &mut packet.data {
        let Payload::Json(value) = slot else { continue };
        let Some(num) = placeholder_num(value) else {
            continue;
        };
        let bytes = received
            .get(num)
            .ok_or(DecodeError::BadPlaceholder(num))?
            .clone();
        *slot = Payload::Binary(bytes);
    }
    Ok(packet)
}

fn placeholder_num(value: &serde_json::Value) -> Option<usize> {
    if !value.is_object() {
        return None;
    }
    match serde_json::from_value::<Placeholder>(value.clone()) {
        Ok(p) if p.placeholder => Some(p.num),
        _ => None,
    }
}

/// Parse one text frame against the packet grammar.
fn parse_text(text: &str) -> Result<ParsedText, DecodeError> {
    let bytes = text.as_bytes();
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    let packet_type = PacketType::from_code(bytes[0].wrapping_sub(b'0'))
        .ok_or(DecodeError::UnknownType(char::from(bytes[0])))?;
    let mut i = 1;

    // attachment count, binary types only
    let mut attachments = 0;
    if packet_type.is_binary() {
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i == start || i >= bytes.len() || bytes[i] != b'-' {
            return Err(DecodeError::BadAttachmentHeader);
        }
        attachments = text[start..i]
            .parse()
            .map_err(|_| DecodeError::BadAttachmentHeader)?;
        if attachments > MAX_ATTACHMENTS {
            return Err(DecodeError::TooManyAttachments(attachments));
        }
        i += 1;
    }

    // namespace, terminated by ',' or end of frame
    let mut nsp = String::from("/");
    if i < bytes.len() && bytes[i] == b'/' {
        let start = i;
        while i < bytes.len() && bytes[i] != b',' {
            i += 1;
        }
        nsp = text[start..i].to_string();
        if i < bytes.len() {
            i += 1;
        }
    }

    // ack id, a run of digits
    let start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    let ack_id = if i > start {
        Some(text[start..i].parse().map_err(|_| DecodeError::BadAckId)?)
    } else {
        None
    };

    let data = parse_data(packet_type, &text[i..])?;
    Ok(ParsedText {
        packet: Packet {
            packet_type,
            nsp,
            ack_id,
            data,
        },
        attachments,
    })
}

fn parse_data(packet_type: PacketType, rest: &str) -> Result<Vec<Payload>, DecodeError> {
    if packet_type.is_event() || packet_type.is_ack() {
        let value: serde_json::Value =
            serde_json::from_str(rest).map_err(DecodeError::BadJson)?;
        let serde_json::Value::Array(items) = value else {
            return Err(DecodeError::NonArrayData);
        };
        if packet_type.is_event() {
            match items.first() {
                Some(serde_json::Value::String(_)) => {}
                _ => return Err(DecodeError::MissingEventName),
            }
        }
        return Ok(items.into_iter().map(Payload::Json).collect());
    }

    // CONNECT, DISCONNECT and ERROR may carry a single JSON value
    if rest.is_empty() {
        return Ok(Vec::new());
    }
    let value: serde_json::Value = serde_json::from_str(rest).map_err(DecodeError::BadJson)?;
    Ok(vec![Payload::Json(value)])
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn decode_one(text: &str) -> Packet {
        PacketDecoder::new()
            .feed_text(text)
            .unwrap()
            .expect("packet should complete without attachments")
    }

    #[test]
    fn test_decodes_event_in_root_namespace() {
        let packet = decode_one(r#"2["ping",1]"#);
        assert_eq!(packet.packet_type, PacketType::Event);
        assert_eq!(packet.nsp, "/");
        assert_eq!(packet.ack_id, None);
        assert_eq!(packet.event_name(), Some("ping"));
        assert_eq!(packet.data[1], Payload::Json(json!(1)));
    }

    #[test]
    fn test_decodes_namespace_and_ack_id() {
        let packet = decode_one(r#"2/chat,12["msg","hi"]"#);
        assert_eq!(packet.nsp, "/chat");
        assert_eq!(packet.ack_id, Some(12));
        assert_eq!(packet.data.len(), 2);
    }

    #[test]
    fn test_decodes_connect_variants() {
        let root = decode_one("0");
        assert_eq!(root.packet_type, PacketType::Connect);
        assert_eq!(root.nsp, "/");

        let nsp = decode_one("0/chat,");
        assert_eq!(nsp.nsp, "/chat");

        // trailing comma is optional when nothing follows the namespace
        let bare = decode_one("1/chat");
        assert_eq!(bare.packet_type, PacketType::Disconnect);
        assert_eq!(bare.nsp, "/chat");
    }

    #[test]
    fn test_decodes_connect_payload_as_single_value() {
        let packet = decode_one(r#"0/chat,{"token":"t"}"#);
        assert_eq!(packet.data, vec![Payload::Json(json!({"token": "t"}))]);
    }

    #[test]
    fn test_decodes_error_reason() {
        let packet = decode_one(r#"4/bar,"Invalid namespace""#);
        assert_eq!(packet.packet_type, PacketType::Error);
        assert_eq!(packet.nsp, "/bar");
        assert_eq!(packet.data[0].as_str(), Some("Invalid namespace"));
    }

    #[test]
    fn test_reassembles_binary_event() {
        let mut decoder = PacketDecoder::new();
        let parked = decoder
            .feed_text(r#"51-/files,["file",{"_placeholder":true,"num":0}]"#)
            .unwrap();
        assert!(parked.is_none());
        assert_eq!(decoder.attachments_owed(), 1);

        let blob = Bytes::from_static(&[0, 1, 2, 3, 4, 5, 6, 7]);
        let packet = decoder.feed_binary(blob.clone()).unwrap().unwrap();
        assert_eq!(packet.packet_type, PacketType::BinaryEvent);
        assert_eq!(packet.event_name(), Some("file"));
        assert_eq!(packet.data[1], Payload::Binary(blob));
        assert_eq!(decoder.attachments_owed(), 0);
    }

    #[test]
    fn test_reassembles_two_attachments_in_index_order() {
        let mut decoder = PacketDecoder::new();
        decoder
            .feed_text(
                r#"52-["pair",{"_placeholder":true,"num":0},{"_placeholder":true,"num":1}]"#,
            )
            .unwrap();
        assert!(decoder.feed_binary(Bytes::from_static(b"aa")).unwrap().is_none());
        let packet = decoder
            .feed_binary(Bytes::from_static(b"bb"))
            .unwrap()
            .unwrap();
        assert_eq!(packet.data[1], Payload::Binary(Bytes::from_static(b"aa")));
        assert_eq!(packet.data[2], Payload::Binary(Bytes::from_static(b"bb")));
    }

    #[test]
    fn test_zero_attachment_binary_event_completes_immediately() {
        let packet = decode_one(r#"50-["x"]"#);
        assert_eq!(packet.packet_type, PacketType::BinaryEvent);
        assert_eq!(packet.event_name(), Some("x"));
    }

    #[test]
    fn test_rejects_unknown_type() {
        let err = PacketDecoder::new().feed_text("9").unwrap_err();
        assert!(matches!(err, DecodeError::UnknownType('9')));

        let err = PacketDecoder::new().feed_text("x").unwrap_err();
        assert!(matches!(err, DecodeError::UnknownType('x')));
    }

    #[test]
    fn test_rejects_empty_frame() {
        let err = PacketDecoder::new().feed_text("").unwrap_err();
        assert!(matches!(err, DecodeError::Empty));
    }

    #[test]
    fn test_rejects_malformed_attachment_header() {
        let err = PacketDecoder::new().feed_text(r#"5-["x"]"#).unwrap_err();
        assert!(matches!(err, DecodeError::BadAttachmentHeader));

        let err = PacketDecoder::new().feed_text(r#"51["x"]"#).unwrap_err();
        assert!(matches!(err, DecodeError::BadAttachmentHeader));
    }

    #[test]
    fn test_rejects_attachment_count_over_limit() {
        let err = PacketDecoder::new()
            .feed_text(r#"5999-["x"]"#)
            .unwrap_err();
        assert!(matches!(err, DecodeError::TooManyAttachments(999)));
    }

    #[test]
    fn test_rejects_non_array_event_data() {
        let err = PacketDecoder::new().feed_text(r#"2{"a":1}"#).unwrap_err();
        assert!(matches!(err, DecodeError::NonArrayData));
    }

    #[test]
    fn test_rejects_event_without_string_name() {
        let err = PacketDecoder::new().feed_text("2[]").unwrap_err();
        assert!(matches!(err, DecodeError::MissingEventName));

        let err = PacketDecoder::new().feed_text(r#"2[1,"x"]"#).unwrap_err();
        assert!(matches!(err, DecodeError::MissingEventName));
    }

    #[test]
    fn test_rejects_invalid_json_payload() {
        let err = PacketDecoder::new().feed_text(r#"2["unterminated"#).unwrap_err();
        assert!(matches!(err, DecodeError::BadJson(_)));
    }

    #[test]
    fn test_rejects_text_while_attachments_owed() {
        let mut decoder = PacketDecoder::new();
        decoder
            .feed_text(r#"51-["x",{"_placeholder":true,"num":0}]"#)
            .unwrap();
        let err = decoder.feed_text(r#"2["y"]"#).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedText));
    }

    #[test]
    fn test_rejects_binary_when_none_owed() {
        let err = PacketDecoder::new()
            .feed_binary(Bytes::from_static(b"zz"))
            .unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedBinary));
    }

    #[test]
    fn test_rejects_placeholder_index_out_of_range() {
        let mut decoder = PacketDecoder::new();
        decoder
            .feed_text(r#"51-["x",{"_placeholder":true,"num":4}]"#)
            .unwrap();
        let err = decoder.feed_binary(Bytes::from_static(b"zz")).unwrap_err();
        assert!(matches!(err, DecodeError::BadPlaceholder(4)));
    }

    #[test]
    fn test_plain_event_keeps_placeholder_shaped_json() {
        let packet = decode_one(r#"2["x",{"_placeholder":true,"num":0}]"#);
        assert_eq!(
            packet.data[1],
            Payload::Json(json!({"_placeholder": true, "num": 0}))
        );
    }

    #[test]
    fn test_leaves_nested_placeholder_objects_alone() {
        let mut decoder = PacketDecoder::new();
        decoder
            .feed_text(
                r#"51-["x",{"_placeholder":true,"num":0},{"inner":{"_placeholder":true,"num":0}}]"#,
            )
            .unwrap();
        let packet = decoder.feed_binary(Bytes::from_static(b"zz")).unwrap().unwrap();
        assert_eq!(packet.data[1], Payload::Binary(Bytes::from_static(b"zz")));
        assert_eq!(
            packet.data[2],
            Payload::Json(json!({"inner": {"_placeholder": true, "num": 0}}))
        );
    }

    #[test]
    fn test_encode_decode_round_trip_with_binary() {
        let blob = Bytes::from_static(b"payload");
        let mut original = Packet::event("/files", vec!["up".into(), blob.into()]);
        original.ack_id = Some(9);

        let encoded = original.encode();
        let mut decoder = PacketDecoder::new();
        assert!(decoder.feed_text(&encoded.text).unwrap().is_none());
        let mut decoded = None;
        for frame in encoded.binaries {
            decoded = decoder.feed_binary(frame).unwrap();
        }
        let decoded = decoded.unwrap();

        // the wire type stays BINARY_EVENT after decode
        assert_eq!(decoded.packet_type, PacketType::BinaryEvent);
        assert_eq!(decoded.nsp, original.nsp);
        assert_eq!(decoded.ack_id, original.ack_id);
        assert_eq!(decoded.data, original.data);
    }
}
