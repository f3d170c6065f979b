//! One logical connection of one client to one namespace.
//!
//! A [`Socket`] is a cheap-to-clone handle: the connection actor, the
//! namespace registries and any embedder tasks all share the same inner
//! state. Emission never blocks; packets are encoded once and enqueued on
//! the connection's outbound queue, which the actor drains in order.
//!
//! Closing runs a fixed sequence: the `disconnecting` lifecycle event (rooms
//! still intact), pending acks fail closed, room membership is dropped, the
//! socket leaves its namespace, and `disconnect` fires with the reason.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::ack::{AckError, AckRegistry};
use crate::client::Outbound;
use crate::handlers::lifecycle;
use crate::namespace::Namespace;
use crate::protocol::{EncodedPacket, Packet, Payload};
use crate::server::ClientId;

/// Socket identifier: the client id for the root namespace, otherwise
/// `{namespace}#{client id}`.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct SocketId(pub String);

impl SocketId {
    /// Derive the id of one client's socket in one namespace.
    pub fn for_namespace(nsp: &str, client: &ClientId) -> Self {
        if nsp == "/" {
            Self(client.to_string())
        } else {
            Self(format!("{nsp}#{client}"))
        }
    }
}

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SocketId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SocketId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SocketId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

struct SocketInner {
    id: SocketId,
    client_id: ClientId,
    nsp_name: String,
    namespace: Weak<Namespace>,
    outbound: mpsc::UnboundedSender<Outbound>,
    acks: AckRegistry,
    ack_timeout: Duration,
    connected: AtomicBool,
}

/// Handle to one namespace connection.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl Socket {
    pub(crate) fn new(
        client_id: ClientId,
        namespace: &Arc<Namespace>,
        outbound: mpsc::UnboundedSender<Outbound>,
        ack_timeout: Duration,
    ) -> Self {
        let id = SocketId::for_namespace(namespace.name(), &client_id);
        Self {
            inner: Arc::new(SocketInner {
                id,
                client_id,
                nsp_name: namespace.name().to_string(),
                namespace: Arc::downgrade(namespace),
                outbound,
                acks: AckRegistry::new(),
                ack_timeout,
                connected: AtomicBool::new(true),
            }),
        }
    }

    /// This socket's id, unique per (client, namespace).
    pub fn id(&self) -> &SocketId {
        &self.inner.id
    }

    /// The connection identity this socket belongs to.
    pub fn client_id(&self) -> &ClientId {
        &self.inner.client_id
    }

    /// Name of the namespace this socket is joined to.
    pub fn namespace_name(&self) -> &str {
        &self.inner.nsp_name
    }

    /// Whether the socket is still joined to its namespace.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// The namespace this socket belongs to, while it is still alive.
    pub(crate) fn namespace(&self) -> Option<Arc<Namespace>> {
        self.inner.namespace.upgrade()
    }

    /// Emit a named event to this client. Delivery is best-effort: after the
    /// socket or its connection has closed, the packet is dropped.
    pub fn emit(&self, event: &str, args: Vec<Payload>) {
        let packet = Packet::event_named(&self.inner.nsp_name, event, args);
        self.enqueue(packet.encode());
    }

    /// Emit a `message` event, the conventional default channel.
    pub fn send(&self, args: Vec<Payload>) {
        self.emit("message", args);
    }

    /// Emit a named event and wait for the client's acknowledgment.
    ///
    /// Resolves with the reply payload, exactly once. A single deadline
    /// applies (configured at server build time); there is no retry.
    ///
    /// # Errors
    ///
    /// [`AckError::Timeout`] when the deadline passes without a reply;
    /// [`AckError::Closed`] when the socket closes with the ack pending.
    pub async fn emit_with_ack(
        &self,
        event: &str,
        args: Vec<Payload>,
    ) -> Result<Vec<Payload>, AckError> {
        if !self.is_connected() {
            return Err(AckError::Closed);
        }
        let (ack_id, reply) = self.inner.acks.allocate();
        // close() may have failed the pending set between the check above
        // and allocate; re-check so the binding cannot be left dangling
        if !self.is_connected() {
            self.inner.acks.forget(ack_id);
            return Err(AckError::Closed);
        }

        let mut packet = Packet::event_named(&self.inner.nsp_name, event, args);
        packet.ack_id = Some(ack_id);
        if !self.enqueue(packet.encode()) {
            self.inner.acks.forget(ack_id);
            return Err(AckError::Closed);
        }

        match tokio::time::timeout(self.inner.ack_timeout, reply).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(AckError::Closed),
            Err(_) => {
                self.inner.acks.forget(ack_id);
                Err(AckError::Timeout)
            }
        }
    }

    /// Join a room in this socket's namespace. Idempotent; `false` when
    /// already a member or the socket is closed.
    pub fn join(&self, room: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        let Some(namespace) = self.inner.namespace.upgrade() else {
            return false;
        };
        let joined = namespace.join_room(self.id(), room);
        // close() may have run leave_all between the check above and the
        // insert; undo so membership cannot outlive the socket
        if joined && !self.is_connected() {
            namespace.leave_room(self.id(), room);
            return false;
        }
        joined
    }

    /// Leave a room. `false` when not a member.
    pub fn leave(&self, room: &str) -> bool {
        match self.inner.namespace.upgrade() {
            Some(namespace) => namespace.leave_room(self.id(), room),
            None => false,
        }
    }

    /// Rooms this socket is currently in.
    pub fn rooms(&self) -> Vec<String> {
        match self.inner.namespace.upgrade() {
            Some(namespace) => namespace.rooms_of(self.id()),
            None => Vec::new(),
        }
    }

    /// Emit to every other socket in this namespace (never back to self).
    pub fn broadcast(&self, event: &str, args: Vec<Payload>) {
        if let Some(namespace) = self.inner.namespace.upgrade() {
            namespace.broadcast_except(Some(self.id()), event, args);
        }
    }

    /// Emit to the members of the given rooms, deduplicated, excluding self.
    pub fn broadcast_rooms(&self, rooms: &[&str], event: &str, args: Vec<Payload>) {
        if let Some(namespace) = self.inner.namespace.upgrade() {
            namespace.broadcast_rooms_except(rooms, Some(self.id()), event, args);
        }
    }

    /// Disconnect this socket server-side.
    ///
    /// With `close = false`, a DISCONNECT packet tells the client this
    /// namespace is gone and only this socket is torn down; the connection
    /// and the client's other namespaces stay up. With `close = true`, the
    /// whole connection shuts down and every socket on it closes with reason
    /// `"forced close"`.
    pub fn disconnect(&self, close: bool) {
        if close {
            let _ = self.inner.outbound.send(Outbound::Shutdown);
        } else {
            self.enqueue(Packet::disconnect(&self.inner.nsp_name).encode());
            self.close("server namespace disconnect");
        }
    }

    /// Enqueue one encoded packet on the connection's outbound queue.
    ///
    /// Returns `false` when the socket has closed or the actor is gone.
    pub(crate) fn enqueue(&self, encoded: EncodedPacket) -> bool {
        if !self.is_connected() {
            log::debug!(
                "[Client] Dropping packet for closed socket {}",
                self.inner.id
            );
            return false;
        }
        self.inner
            .outbound
            .send(Outbound::Packet(encoded))
            .is_ok()
    }

    /// Resolve an inbound ACK reply against the pending set.
    pub(crate) fn handle_ack_reply(&self, ack_id: i64, payload: Vec<Payload>) {
        if !self.inner.acks.resolve(ack_id, payload) {
            log::debug!(
                "[Client] Ack {ack_id} on socket {} has no pending binding",
                self.inner.id
            );
        }
    }

    /// Build the reply handle for an inbound event carrying `ack_id`.
    pub(crate) fn responder(&self, ack_id: i64) -> AckResponder {
        AckResponder {
            inner: Arc::new(ResponderInner {
                socket: self.clone(),
                ack_id,
                sent: AtomicBool::new(false),
            }),
        }
    }

    /// Tear this socket down.
    ///
    /// Fires `disconnecting`, fails pending acks, leaves all rooms, removes
    /// the socket from its namespace, then fires `disconnect` with the
    /// reason. Idempotent: only the first call runs the sequence.
    pub(crate) fn close(&self, reason: &str) {
        if !self.inner.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let reason_arg = [Payload::from(reason)];
        if let Some(namespace) = self.inner.namespace.upgrade() {
            namespace
                .handlers()
                .dispatch_reserved(self, lifecycle::DISCONNECTING, &reason_arg);
            self.inner.acks.fail_all();
            namespace.remove_socket(self.id());
            namespace
                .handlers()
                .dispatch_reserved(self, lifecycle::DISCONNECT, &reason_arg);
        } else {
            self.inner.acks.fail_all();
        }
        log::info!("[Client] Socket {} closed: {reason}", self.inner.id);
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.inner.id)
            .field("namespace", &self.inner.nsp_name)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

struct ResponderInner {
    socket: Socket,
    ack_id: i64,
    sent: AtomicBool,
}

/// Reply handle for one inbound event that requested an acknowledgment.
///
/// Clones share one reply slot: the first [`send`](AckResponder::send) wins
/// and later attempts are logged and dropped. Sending no reply leaves the
/// remote caller to its own timeout.
#[derive(Clone)]
pub struct AckResponder {
    inner: Arc<ResponderInner>,
}

impl AckResponder {
    /// The correlation id the reply will carry.
    pub fn ack_id(&self) -> i64 {
        self.inner.ack_id
    }

    /// Send the acknowledgment reply. Only the first call has any effect.
    pub fn send(&self, args: Vec<Payload>) {
        if self.inner.sent.swap(true, Ordering::SeqCst) {
            log::debug!(
                "[Client] Duplicate ack reply {} dropped (socket {})",
                self.inner.ack_id,
                self.inner.socket.id()
            );
            return;
        }
        let socket = &self.inner.socket;
        let packet = Packet::ack(socket.namespace_name(), self.inner.ack_id, args);
        socket.enqueue(packet.encode());
    }
}

impl std::fmt::Debug for AckResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckResponder")
            .field("ack_id", &self.inner.ack_id)
            .field("socket", self.inner.socket.id())
            .field("sent", &self.inner.sent.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
impl Socket {
    /// Socket with no namespace behind it, for registry-level tests.
    pub(crate) fn detached(id: &str) -> Self {
        Self::detached_with_queue(id, Duration::from_secs(30)).0
    }

    /// Detached socket plus the receiving end of its outbound queue.
    pub(crate) fn detached_with_queue(
        id: &str,
        ack_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let socket = Self {
            inner: Arc::new(SocketInner {
                id: SocketId::from(id),
                client_id: ClientId::from("test-client"),
                nsp_name: "/".to_string(),
                namespace: Weak::new(),
                outbound: tx,
                acks: AckRegistry::new(),
                ack_timeout,
                connected: AtomicBool::new(true),
            }),
        };
        (socket, rx)
    }
}
