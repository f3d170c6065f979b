//! Wire protocol: packet model, encoding, incremental decoding.
//!
//! The protocol multiplexes logical namespaces over one frame stream. A
//! packet is one text frame plus zero or more binary attachment frames:
//!
//! ```text
//! text frame ──► parse header + JSON ──┬── no attachments ──► Packet
//!                                      │
//!                                      └── N attachments ──► park
//! binary frame ──► fill next slot ─────────── last one ────► Packet
//! ```
//!
//! Encoding is the mirror image: [`Packet::encode`] produces an
//! [`EncodedPacket`] holding the text frame and its attachments as one unit,
//! so callers can enqueue a whole packet atomically.

mod decode;
mod packet;

pub use decode::{DecodeError, PacketDecoder};
pub use packet::{EncodedPacket, Packet, PacketType, Payload, MAX_ATTACHMENTS};
