//! Roomcast - Real-time bidirectional event messaging engine.
//!
//! This crate provides the server-side core for a socket-style event protocol:
//! many logical namespaces multiplexed over one physical connection per client,
//! room membership for selective broadcast, structured events with raw binary
//! payloads, and request/acknowledgment correlation in both directions.
//!
//! # Architecture
//!
//! ```text
//! Transport (trait, per connection)
//!      │ text/binary frames
//!      ▼
//! Client actor ──► PacketDecoder ──► Packet ──► route by namespace
//!      │                                          │
//!      │                              ┌───────────┴───────────┐
//!      │                              ▼                       ▼
//!      │                        HandlerRegistry         pending acks
//!      │                        (EVENT dispatch)        (ACK dispatch)
//!      │                              │
//!      ▼                              ▼
//! outbound queue ◄── encode ◄── Namespace / RoomDirectory fan-out
//! ```
//!
//! The transport layer (socket upgrade, heartbeats, reconnection) is not part
//! of this crate: embedders hand each established connection to
//! [`Server::attach`] as an implementation of [`Transport`].
//!
//! # Modules
//!
//! - [`protocol`] - wire packet model, encode/decode, attachment reassembly
//! - [`transport`] - the consumed frame-channel boundary
//! - [`rooms`] - per-namespace room membership and broadcast selection
//! - [`handlers`] - event handler registry with any-event fallback
//! - [`ack`] - acknowledgment id allocation and pending-reply tracking
//! - [`socket`] - one logical namespace connection of one client
//! - [`namespace`] - isolated event space owning rooms and handlers
//! - [`client`] - per-connection actor task
//! - [`server`] - engine entry point, namespace registry, attach

pub mod ack;
pub mod client;
pub mod handlers;
pub mod namespace;
pub mod protocol;
pub mod rooms;
pub mod server;
pub mod socket;
pub mod transport;

// Re-export commonly used types
pub use ack::AckError;
pub use namespace::Namespace;
pub use protocol::{DecodeError, Packet, PacketType, Payload};
pub use server::{ClientHandle, ClientId, EngineError, Server, ServerBuilder};
pub use socket::{AckResponder, Socket, SocketId};
pub use transport::{Transport, TransportFrame};
