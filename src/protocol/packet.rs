//! Packet model and wire encoding.
//!
//! Every packet travels as one text frame, optionally followed by raw binary
//! frames carrying its attachments:
//!
//! ```text
//! <type digit>[<attachments>-][/<namespace>,][<ack id>][<JSON payload>]
//! ```
//!
//! Examples:
//!
//! ```text
//! 0                                       CONNECT, root namespace
//! 0/chat,                                 CONNECT, /chat
//! 2["ping",1]                             EVENT in the root namespace
//! 2/chat,5["msg","hi"]                    EVENT in /chat, expects ack 5
//! 3/chat,5["ok"]                          ACK 5 with one argument
//! 4/bar,"Invalid namespace"               ERROR with a reason value
//! 51-["file",{"_placeholder":true,"num":0}]   EVENT with one attachment
//! ```
//!
//! Binary arguments never appear inside the JSON text. Each one is replaced
//! by a placeholder object carrying its attachment index, and the raw bytes
//! follow as separate binary frames in index order. [`Packet::encode`]
//! performs the substitution and upgrades EVENT/ACK to their binary wire
//! types when any argument is binary.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Upper bound on binary attachments a single packet may declare.
///
/// A header naming more than this is rejected before any buffering happens,
/// so a peer cannot make the decoder hold unbounded partial state.
pub const MAX_ATTACHMENTS: usize = 255;

/// Wire packet types, one per leading type digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Join a namespace.
    Connect,
    /// Leave a namespace.
    Disconnect,
    /// Named event with JSON arguments.
    Event,
    /// Acknowledgment reply correlated by id.
    Ack,
    /// Connection refusal or protocol-level error.
    Error,
    /// EVENT whose arguments include binary attachments.
    BinaryEvent,
    /// ACK whose arguments include binary attachments.
    BinaryAck,
}

impl PacketType {
    /// Numeric wire code (the leading digit of the text frame).
    pub fn code(self) -> u8 {
        match self {
            PacketType::Connect => 0,
            PacketType::Disconnect => 1,
            PacketType::Event => 2,
            PacketType::Ack => 3,
            PacketType::Error => 4,
            PacketType::BinaryEvent => 5,
            PacketType::BinaryAck => 6,
        }
    }

    /// Parse a numeric wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(PacketType::Connect),
            1 => Some(PacketType::Disconnect),
            2 => Some(PacketType::Event),
            3 => Some(PacketType::Ack),
            4 => Some(PacketType::Error),
            5 => Some(PacketType::BinaryEvent),
            6 => Some(PacketType::BinaryAck),
            _ => None,
        }
    }

    /// Whether this type carries an attachment count in its header.
    pub fn is_binary(self) -> bool {
        matches!(self, PacketType::BinaryEvent | PacketType::BinaryAck)
    }

    /// Whether this type dispatches as an event (named, to handlers).
    pub fn is_event(self) -> bool {
        matches!(self, PacketType::Event | PacketType::BinaryEvent)
    }

    /// Whether this type resolves a pending acknowledgment.
    pub fn is_ack(self) -> bool {
        matches!(self, PacketType::Ack | PacketType::BinaryAck)
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketType::Connect => "CONNECT",
            PacketType::Disconnect => "DISCONNECT",
            PacketType::Event => "EVENT",
            PacketType::Ack => "ACK",
            PacketType::Error => "ERROR",
            PacketType::BinaryEvent => "BINARY_EVENT",
            PacketType::BinaryAck => "BINARY_ACK",
        };
        write!(f, "{name}")
    }
}

/// One argument slot of an event or acknowledgment.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Structured JSON data.
    Json(serde_json::Value),
    /// Raw bytes, carried outside the JSON text as an attachment frame.
    Binary(Bytes),
}

impl Payload {
    /// Borrow the JSON value, if this slot is JSON.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Binary(_) => None,
        }
    }

    /// Borrow the raw bytes, if this slot is binary.
    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            Payload::Json(_) => None,
            Payload::Binary(bytes) => Some(bytes),
        }
    }

    /// Borrow the string content, if this slot is a JSON string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::Json(serde_json::Value::String(s)) => Some(s),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Json(serde_json::Value::String(value.to_string()))
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Json(serde_json::Value::String(value))
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Payload::Binary(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Binary(Bytes::from(value))
    }
}

/// JSON stand-in for a binary argument inside the text frame.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Placeholder {
    #[serde(rename = "_placeholder")]
    pub placeholder: bool,
    pub num: usize,
}

/// A protocol packet, decoded or ready to encode.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Wire type.
    pub packet_type: PacketType,
    /// Namespace path, always with a leading slash.
    pub nsp: String,
    /// Correlation id when the packet expects or carries an acknowledgment.
    pub ack_id: Option<i64>,
    /// Argument slots. For events the first slot is the event name.
    pub data: Vec<Payload>,
}

impl Packet {
    /// CONNECT packet for a namespace.
    pub fn connect(nsp: &str) -> Self {
        Packet {
            packet_type: PacketType::Connect,
            nsp: nsp.to_string(),
            ack_id: None,
            data: Vec::new(),
        }
    }

    /// DISCONNECT packet for a namespace.
    pub fn disconnect(nsp: &str) -> Self {
        Packet {
            packet_type: PacketType::Disconnect,
            nsp: nsp.to_string(),
            ack_id: None,
            data: Vec::new(),
        }
    }

    /// EVENT packet. `data` should start with the event name.
    pub fn event(nsp: &str, data: Vec<Payload>) -> Self {
        Packet {
            packet_type: PacketType::Event,
            nsp: nsp.to_string(),
            ack_id: None,
            data,
        }
    }

    /// EVENT packet with the name prepended to the argument slots.
    pub fn event_named(nsp: &str, event: &str, args: Vec<Payload>) -> Self {
        let mut data = Vec::with_capacity(args.len() + 1);
        data.push(Payload::from(event));
        data.extend(args);
        Packet::event(nsp, data)
    }

    /// ACK reply carrying `data` for a previously received ack id.
    pub fn ack(nsp: &str, ack_id: i64, data: Vec<Payload>) -> Self {
        Packet {
            packet_type: PacketType::Ack,
            nsp: nsp.to_string(),
            ack_id: Some(ack_id),
            data,
        }
    }

    /// ERROR packet with a reason value.
    pub fn error(nsp: &str, reason: &str) -> Self {
        Packet {
            packet_type: PacketType::Error,
            nsp: nsp.to_string(),
            ack_id: None,
            data: vec![Payload::Json(serde_json::Value::String(
                reason.to_string(),
            ))],
        }
    }

    /// Event name, when this is an event packet with a string head.
    pub fn event_name(&self) -> Option<&str> {
        if self.packet_type.is_event() {
            self.data.first().and_then(Payload::as_str)
        } else {
            None
        }
    }

    /// Number of binary argument slots.
    pub fn attachment_count(&self) -> usize {
        self.data
            .iter()
            .filter(|p| matches!(p, Payload::Binary(_)))
            .count()
    }

    /// Effective wire type: EVENT and ACK are upgraded to their binary
    /// counterparts when any argument slot is binary.
    pub fn wire_type(&self) -> PacketType {
        match (self.packet_type, self.attachment_count()) {
            (PacketType::Event, n) if n > 0 => PacketType::BinaryEvent,
            (PacketType::Ack, n) if n > 0 => PacketType::BinaryAck,
            (t, _) => t,
        }
    }

    /// Encode into a text frame plus binary attachment frames.
    pub fn encode(&self) -> EncodedPacket {
        let wire = self.wire_type();

        let mut binaries: Vec<Bytes> = Vec::new();
        let args: Vec<serde_json::Value> = self
            .data
            .iter()
            .map(|payload| match payload {
                Payload::Json(value) => value.clone(),
                Payload::Binary(bytes) => {
                    let num = binaries.len();
                    binaries.push(bytes.clone());
                    serde_json::json!({ "_placeholder": true, "num": num })
                }
            })
            .collect();

        let mut text = String::new();
        text.push(char::from(b'0' + wire.code()));
        if wire.is_binary() {
            text.push_str(&binaries.len().to_string());
            text.push('-');
        }
        if self.nsp != "/" {
            text.push_str(&self.nsp);
            text.push(',');
        }
        if let Some(id) = self.ack_id {
            text.push_str(&id.to_string());
        }
        match wire {
            PacketType::Connect | PacketType::Disconnect => {}
            PacketType::Error => {
                if let Some(value) = args.first() {
                    text.push_str(&value.to_string());
                }
            }
            _ => {
                text.push_str(&serde_json::Value::Array(args).to_string());
            }
        }

        EncodedPacket { text, binaries }
    }
}

/// The wire form of one packet: a text frame plus its attachment frames.
///
/// Kept together so a multi-frame packet enqueues as one unit and two
/// packets' frames never interleave on a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedPacket {
    /// The text frame.
    pub text: String,
    /// Binary attachment frames, in placeholder index order.
    pub binaries: Vec<Bytes>,
}
