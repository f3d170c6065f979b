//! Per-connection actor.
//!
//! [`crate::Server::attach`] spawns one task per connection. The task owns
//! the transport exclusively and drains two sources in a `select!` loop:
//!
//! ```text
//! transport ──► PacketDecoder ──► route: CONNECT / DISCONNECT /
//!                                        EVENT / ACK / ERROR
//! outbound queue ──► transport (text frame, then its attachments)
//! ```
//!
//! Every socket this client has joined shares the one outbound queue, so a
//! multi-frame packet is written contiguously and packets never interleave.
//! Handlers run inline here, in the sender's task; emission to other
//! connections is a queue send and never blocks this loop.
//!
//! While a binary packet's attachments are outstanding, a read deadline
//! bounds the wait for the next frame; letting it pass counts as a protocol
//! error.
//!
//! The loop ends on transport close, transport error, a protocol error, or
//! a shutdown request. On the way out every socket of the connection closes
//! with the loop's reason, which fails their pending acks.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::handlers::is_reserved;
use crate::namespace::Namespace;
use crate::protocol::{DecodeError, EncodedPacket, Packet, PacketDecoder, PacketType, Payload};
use crate::server::{ClientId, ServerCore};
use crate::socket::Socket;
use crate::transport::{Transport, TransportError, TransportFrame};

/// Message on a connection's outbound queue.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// One whole encoded packet: text frame plus attachments, written back
    /// to back.
    Packet(EncodedPacket),
    /// Stop the loop and close the transport.
    Shutdown,
}

/// What the select loop observed in one turn.
enum Step {
    Inbound(Result<TransportFrame, TransportError>),
    Outbound(Option<Outbound>),
    Expired,
}

/// State owned by one connection's task.
pub(crate) struct Connection {
    server: Arc<ServerCore>,
    client_id: ClientId,
    transport: Box<dyn Transport>,
    decoder: PacketDecoder,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    /// Sockets of this connection, by namespace name.
    sockets: HashMap<String, Socket>,
}

impl Connection {
    pub(crate) fn new(
        server: Arc<ServerCore>,
        client_id: ClientId,
        transport: Box<dyn Transport>,
        outbound_tx: mpsc::UnboundedSender<Outbound>,
        outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    ) -> Self {
        Self {
            server,
            client_id,
            transport,
            decoder: PacketDecoder::new(),
            outbound_tx,
            outbound_rx,
            sockets: HashMap::new(),
        }
    }

    /// Drive the connection until it closes, then tear everything down.
    pub(crate) async fn run(mut self) {
        log::info!("[Client] Connection {} attached", self.client_id);

        // the root namespace joins implicitly, without a CONNECT packet
        let root = self.server.root_namespace();
        self.join_namespace(&root);

        let reason = self.drive().await;

        self.transport.close().await;
        for socket in self.sockets.values() {
            socket.close(reason);
        }
        self.server
            .unregister_client(&self.client_id, &self.outbound_tx);
        log::info!("[Client] Connection {} detached: {reason}", self.client_id);
    }

    async fn drive(&mut self) -> &'static str {
        let read_timeout = self.server.read_timeout();
        let mut read_deadline: Option<Instant> = None;
        loop {
            let step = tokio::select! {
                frame = self.transport.recv() => Step::Inbound(frame),
                queued = self.outbound_rx.recv() => Step::Outbound(queued),
                () = wait_until(read_deadline) => Step::Expired,
            };
            match step {
                Step::Inbound(Ok(frame)) => {
                    if let Err(e) = self.handle_frame(frame) {
                        log::warn!(
                            "[Client] Protocol error on {}: {e}",
                            self.client_id
                        );
                        return "parse error";
                    }
                    // while attachments are owed, the next frame must land
                    // within the read deadline
                    read_deadline = if self.decoder.attachments_owed() > 0 {
                        Some(Instant::now() + read_timeout)
                    } else {
                        None
                    };
                }
                Step::Inbound(Err(TransportError::Closed)) => return "transport close",
                Step::Inbound(Err(TransportError::Io(msg))) => {
                    log::warn!("[Client] Transport error on {}: {msg}", self.client_id);
                    return "transport error";
                }
                Step::Outbound(Some(Outbound::Packet(encoded))) => {
                    if self.write_packet(encoded).await.is_err() {
                        return "transport error";
                    }
                }
                Step::Outbound(Some(Outbound::Shutdown)) => return "forced close",
                // self holds a sender, so the queue cannot end first
                Step::Outbound(None) => return "transport close",
                Step::Expired => {
                    log::warn!(
                        "[Client] Protocol error on {}: {} attachments missing after {:?}",
                        self.client_id,
                        self.decoder.attachments_owed(),
                        read_timeout
                    );
                    return "parse error";
                }
            }
        }
    }

    async fn write_packet(&mut self, encoded: EncodedPacket) -> Result<(), TransportError> {
        self.transport.send(TransportFrame::Text(encoded.text)).await?;
        for attachment in encoded.binaries {
            self.transport.send(TransportFrame::Binary(attachment)).await?;
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: TransportFrame) -> Result<(), DecodeError> {
        let packet = match frame {
            TransportFrame::Text(text) => self.decoder.feed_text(&text)?,
            TransportFrame::Binary(bytes) => self.decoder.feed_binary(bytes)?,
        };
        if let Some(packet) = packet {
            self.route(packet);
        }
        Ok(())
    }

    fn route(&mut self, packet: Packet) {
        match packet.packet_type {
            PacketType::Connect => self.handle_connect(&packet.nsp),
            PacketType::Disconnect => self.handle_disconnect(&packet.nsp),
            PacketType::Event | PacketType::BinaryEvent => self.handle_event(packet),
            PacketType::Ack | PacketType::BinaryAck => self.handle_ack(packet),
            PacketType::Error => {
                log::warn!(
                    "[Client] ERROR packet from {}: {:?}",
                    self.client_id,
                    packet.data.first()
                );
            }
        }
    }

    fn handle_connect(&mut self, nsp: &str) {
        self.prune_closed(nsp);
        if let Some(socket) = self.sockets.get(nsp) {
            // already joined: confirm again, never a second socket
            if nsp != "/" {
                socket.enqueue(Packet::connect(nsp).encode());
            }
            return;
        }
        match self.server.authorize_namespace(nsp) {
            Some(namespace) => self.join_namespace(&namespace),
            None => {
                log::info!(
                    "[Client] CONNECT to {nsp} refused for {}",
                    self.client_id
                );
                let refusal = Packet::error(nsp, "Invalid namespace").encode();
                let _ = self.outbound_tx.send(Outbound::Packet(refusal));
            }
        }
    }

    fn join_namespace(&mut self, namespace: &Arc<Namespace>) {
        let socket = Socket::new(
            self.client_id.clone(),
            namespace,
            self.outbound_tx.clone(),
            self.server.ack_timeout(),
        );
        self.sockets
            .insert(namespace.name().to_string(), socket.clone());
        namespace.join_socket(&socket);
    }

    fn handle_disconnect(&mut self, nsp: &str) {
        if let Some(socket) = self.sockets.remove(nsp) {
            socket.close("client namespace disconnect");
        }
    }

    fn handle_event(&mut self, packet: Packet) {
        self.prune_closed(&packet.nsp);
        let Some(socket) = self.sockets.get(&packet.nsp).cloned() else {
            log::warn!(
                "[Client] EVENT for unjoined namespace {} from {}",
                packet.nsp,
                self.client_id
            );
            return;
        };
        let Some(name) = packet.event_name().map(ToOwned::to_owned) else {
            log::warn!("[Client] Event without a name from {}", self.client_id);
            return;
        };
        if is_reserved(&name) {
            log::warn!(
                "[Client] Ignoring inbound '{name}' from {}: reserved lifecycle name",
                self.client_id
            );
            return;
        }
        let Some(namespace) = socket.namespace() else {
            return;
        };

        let ack = packet.ack_id.map(|ack_id| socket.responder(ack_id));
        let args: &[Payload] = &packet.data[1..];
        let invoked = namespace
            .handlers()
            .dispatch(&socket, &name, args, ack.as_ref());
        if invoked == 0 {
            log::debug!("[Client] No handler for '{name}' in {}", packet.nsp);
        }
    }

    fn handle_ack(&mut self, packet: Packet) {
        let Some(ack_id) = packet.ack_id else {
            log::warn!("[Client] ACK without an id from {}", self.client_id);
            return;
        };
        match self.sockets.get(&packet.nsp) {
            Some(socket) => socket.handle_ack_reply(ack_id, packet.data),
            None => log::debug!(
                "[Client] ACK {ack_id} for unjoined namespace {}",
                packet.nsp
            ),
        }
    }

    /// Drop a map entry whose socket was closed server-side, so a later
    /// CONNECT can create a fresh one.
    fn prune_closed(&mut self, nsp: &str) {
        if self
            .sockets
            .get(nsp)
            .is_some_and(|socket| !socket.is_connected())
        {
            self.sockets.remove(nsp);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("client_id", &self.client_id)
            .field("namespaces", &self.sockets.len())
            .finish_non_exhaustive()
    }
}

/// Sleep until the armed deadline; pend forever while none is armed.
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}
