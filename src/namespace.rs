//! Isolated event spaces multiplexed over shared connections.
//!
//! A namespace owns three things and nothing else: the sockets joined to it,
//! their room memberships, and the event handlers. Nothing crosses namespace
//! boundaries; two namespaces interact only in that their sockets may share a
//! physical connection.
//!
//! Namespaces come into existence on first use (either server-side via
//! [`crate::Server::namespace`] or by an authorized client CONNECT) and live
//! for the rest of the server's lifetime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::handlers::{lifecycle, HandlerRegistry};
use crate::protocol::{Packet, Payload};
use crate::rooms::RoomDirectory;
use crate::socket::{AckResponder, Socket, SocketId};

/// One isolated event space.
pub struct Namespace {
    name: String,
    sockets: Mutex<HashMap<SocketId, Socket>>,
    rooms: Mutex<RoomDirectory>,
    handlers: HandlerRegistry,
}

impl Namespace {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            sockets: Mutex::new(HashMap::new()),
            rooms: Mutex::new(RoomDirectory::new()),
            handlers: HandlerRegistry::new(),
        })
    }

    /// Namespace path, with its leading slash.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a handler for a named event.
    ///
    /// Lifecycle handlers register here too, under the names in
    /// [`lifecycle`](crate::handlers::lifecycle).
    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(&Socket, &[Payload], Option<AckResponder>) + Send + Sync + 'static,
    {
        self.handlers.on(event, handler);
    }

    /// Register a handler for every inbound event.
    pub fn on_any<F>(&self, handler: F)
    where
        F: Fn(&Socket, &str, &[Payload], Option<AckResponder>) + Send + Sync + 'static,
    {
        self.handlers.on_any(handler);
    }

    /// The handler registry itself.
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Ids of every socket currently joined.
    pub fn socket_ids(&self) -> Vec<SocketId> {
        self.sockets
            .lock()
            .map(|sockets| sockets.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of sockets currently joined.
    pub fn socket_count(&self) -> usize {
        self.sockets.lock().map(|sockets| sockets.len()).unwrap_or(0)
    }

    /// Look up a joined socket by id.
    pub fn socket(&self, id: &SocketId) -> Option<Socket> {
        self.sockets
            .lock()
            .ok()
            .and_then(|sockets| sockets.get(id).cloned())
    }

    /// Current members of a room.
    pub fn members_of(&self, room: &str) -> Vec<SocketId> {
        self.rooms
            .lock()
            .map(|rooms| rooms.members_of(room).cloned().collect())
            .unwrap_or_default()
    }

    /// Rooms a socket has joined.
    pub fn rooms_of(&self, socket: &SocketId) -> Vec<String> {
        self.rooms
            .lock()
            .map(|rooms| rooms.rooms_of(socket))
            .unwrap_or_default()
    }

    /// Emit an event to every socket in the namespace.
    pub fn broadcast(&self, event: &str, args: Vec<Payload>) {
        self.broadcast_except(None, event, args);
    }

    /// Emit an event to the members of the given rooms, deduplicated.
    pub fn broadcast_rooms(&self, rooms: &[&str], event: &str, args: Vec<Payload>) {
        self.broadcast_rooms_except(rooms, None, event, args);
    }

    /// Broadcast to every socket except one. Encodes once and fans the
    /// encoded packet out to each target's queue.
    pub(crate) fn broadcast_except(
        &self,
        except: Option<&SocketId>,
        event: &str,
        args: Vec<Payload>,
    ) {
        let encoded = Packet::event_named(&self.name, event, args).encode();
        let targets: Vec<Socket> = match self.sockets.lock() {
            Ok(sockets) => sockets
                .values()
                .filter(|socket| Some(socket.id()) != except)
                .cloned()
                .collect(),
            Err(_) => return,
        };
        for target in targets {
            target.enqueue(encoded.clone());
        }
    }

    /// Broadcast to the union of the rooms' members except one socket.
    pub(crate) fn broadcast_rooms_except(
        &self,
        rooms: &[&str],
        except: Option<&SocketId>,
        event: &str,
        args: Vec<Payload>,
    ) {
        let selected = match self.rooms.lock() {
            Ok(directory) => directory.members_of_any(rooms),
            Err(_) => return,
        };
        if selected.is_empty() {
            return;
        }
        let encoded = Packet::event_named(&self.name, event, args).encode();
        let targets: Vec<Socket> = match self.sockets.lock() {
            Ok(sockets) => selected
                .iter()
                .filter(|id| Some(*id) != except)
                .filter_map(|id| sockets.get(id).cloned())
                .collect(),
            Err(_) => return,
        };
        for target in targets {
            target.enqueue(encoded.clone());
        }
    }

    pub(crate) fn join_room(&self, socket: &SocketId, room: &str) -> bool {
        self.rooms
            .lock()
            .map(|mut rooms| rooms.join(socket, room))
            .unwrap_or(false)
    }

    pub(crate) fn leave_room(&self, socket: &SocketId, room: &str) -> bool {
        self.rooms
            .lock()
            .map(|mut rooms| rooms.leave(socket, room))
            .unwrap_or(false)
    }

    /// Admit a freshly created socket.
    ///
    /// The socket is registered, joins the room named by its own id (so a
    /// per-socket room exists from the start), non-root joins are confirmed
    /// with a CONNECT echo, and the `connect` / `connection` lifecycle
    /// events fire in that order.
    pub(crate) fn join_socket(&self, socket: &Socket) {
        if let Ok(mut sockets) = self.sockets.lock() {
            sockets.insert(socket.id().clone(), socket.clone());
        }
        if let Ok(mut rooms) = self.rooms.lock() {
            rooms.join(socket.id(), socket.id().as_ref());
        }
        if self.name != "/" {
            socket.enqueue(Packet::connect(&self.name).encode());
        }
        log::info!("[Namespace] Socket {} joined {}", socket.id(), self.name);
        self.handlers
            .dispatch_reserved(socket, lifecycle::CONNECT, &[]);
        self.handlers
            .dispatch_reserved(socket, lifecycle::CONNECTION, &[]);
    }

    /// Drop a socket: leaves every room, then the socket set.
    pub(crate) fn remove_socket(&self, id: &SocketId) {
        if let Ok(mut rooms) = self.rooms.lock() {
            rooms.leave_all(id);
        }
        if let Ok(mut sockets) = self.sockets.lock() {
            sockets.remove(id);
        }
        log::debug!("[Namespace] Socket {id} removed from {}", self.name);
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.name)
            .field("socket_count", &self.socket_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::sync::mpsc;

    use crate::client::Outbound;
    use crate::server::ClientId;

    fn make_socket(
        nsp: &Arc<Namespace>,
        client: &str,
    ) -> (Socket, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let socket = Socket::new(ClientId::from(client), nsp, tx, Duration::from_secs(1));
        (socket, rx)
    }

    fn drain_texts(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<String> {
        let mut texts = Vec::new();
        while let Ok(out) = rx.try_recv() {
            if let Outbound::Packet(encoded) = out {
                texts.push(encoded.text);
            }
        }
        texts
    }

    #[test]
    fn test_join_socket_fires_connect_then_connection() {
        let nsp = Namespace::new("/");
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        nsp.on(lifecycle::CONNECT, move |_, _, _| {
            o.lock().unwrap().push("connect");
        });
        let o = Arc::clone(&order);
        nsp.on(lifecycle::CONNECTION, move |_, _, _| {
            o.lock().unwrap().push("connection");
        });

        let (socket, _rx) = make_socket(&nsp, "c1");
        nsp.join_socket(&socket);

        assert_eq!(*order.lock().unwrap(), vec!["connect", "connection"]);
        assert_eq!(nsp.socket_count(), 1);
    }

    #[test]
    fn test_join_socket_enters_own_id_room() {
        let nsp = Namespace::new("/");
        let (socket, _rx) = make_socket(&nsp, "c1");
        nsp.join_socket(&socket);

        let members = nsp.members_of(socket.id().as_ref());
        assert_eq!(members, vec![socket.id().clone()]);
    }

    #[test]
    fn test_connect_echo_only_for_non_root() {
        let root = Namespace::new("/");
        let (socket, mut rx) = make_socket(&root, "c1");
        root.join_socket(&socket);
        assert!(drain_texts(&mut rx).is_empty());

        let chat = Namespace::new("/chat");
        let (socket, mut rx) = make_socket(&chat, "c1");
        chat.join_socket(&socket);
        assert_eq!(drain_texts(&mut rx), vec!["0/chat,".to_string()]);
    }

    #[test]
    fn test_broadcast_excludes_sender() {
        let nsp = Namespace::new("/");
        let (s1, mut rx1) = make_socket(&nsp, "c1");
        let (s2, mut rx2) = make_socket(&nsp, "c2");
        nsp.join_socket(&s1);
        nsp.join_socket(&s2);

        s1.broadcast("news", vec!["hello".into()]);

        assert!(drain_texts(&mut rx1).is_empty());
        assert_eq!(drain_texts(&mut rx2), vec![r#"2["news","hello"]"#.to_string()]);
    }

    #[test]
    fn test_broadcast_reaches_everyone_without_exclusion() {
        let nsp = Namespace::new("/");
        let (s1, mut rx1) = make_socket(&nsp, "c1");
        let (s2, mut rx2) = make_socket(&nsp, "c2");
        nsp.join_socket(&s1);
        nsp.join_socket(&s2);

        nsp.broadcast("news", Vec::new());

        assert_eq!(drain_texts(&mut rx1).len(), 1);
        assert_eq!(drain_texts(&mut rx2).len(), 1);
    }

    #[test]
    fn test_room_broadcast_union_deduplicates() {
        let nsp = Namespace::new("/");
        let (s1, mut rx1) = make_socket(&nsp, "c1");
        let (s2, mut rx2) = make_socket(&nsp, "c2");
        let (s3, mut rx3) = make_socket(&nsp, "c3");
        for s in [&s1, &s2, &s3] {
            nsp.join_socket(s);
        }
        // s1 in both rooms, s2 in foo, s3 in bar
        s1.join("foo");
        s1.join("bar");
        s2.join("foo");
        s3.join("bar");
        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            drain_texts(rx);
        }

        nsp.broadcast_rooms(&["foo", "bar"], "ping", Vec::new());

        assert_eq!(drain_texts(&mut rx1).len(), 1);
        assert_eq!(drain_texts(&mut rx2).len(), 1);
        assert_eq!(drain_texts(&mut rx3).len(), 1);
    }

    #[test]
    fn test_room_broadcast_misses_non_members() {
        let nsp = Namespace::new("/");
        let (s1, mut rx1) = make_socket(&nsp, "c1");
        let (s2, mut rx2) = make_socket(&nsp, "c2");
        nsp.join_socket(&s1);
        nsp.join_socket(&s2);
        s1.join("foo");
        drain_texts(&mut rx1);
        drain_texts(&mut rx2);

        nsp.broadcast_rooms(&["foo"], "ping", Vec::new());

        assert_eq!(drain_texts(&mut rx1).len(), 1);
        assert!(drain_texts(&mut rx2).is_empty());
    }

    #[test]
    fn test_remove_socket_clears_rooms_and_set() {
        let nsp = Namespace::new("/");
        let (socket, _rx) = make_socket(&nsp, "c1");
        nsp.join_socket(&socket);
        socket.join("chat");

        nsp.remove_socket(socket.id());

        assert!(nsp.socket_ids().is_empty());
        assert!(nsp.members_of("chat").is_empty());
        assert!(nsp.members_of(socket.id().as_ref()).is_empty());
    }

    #[test]
    fn test_close_sequence_disconnecting_sees_rooms_disconnect_does_not() {
        let nsp = Namespace::new("/");
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        nsp.on(lifecycle::DISCONNECTING, move |socket, args, _| {
            assert_eq!(args[0].as_str(), Some("unit test"));
            assert!(socket.rooms().contains(&"chat".to_string()));
            o.lock().unwrap().push("disconnecting");
        });
        let o = Arc::clone(&order);
        nsp.on(lifecycle::DISCONNECT, move |socket, args, _| {
            assert_eq!(args[0].as_str(), Some("unit test"));
            assert!(socket.rooms().is_empty());
            o.lock().unwrap().push("disconnect");
        });

        let (socket, _rx) = make_socket(&nsp, "c1");
        nsp.join_socket(&socket);
        socket.join("chat");

        socket.close("unit test");

        assert_eq!(*order.lock().unwrap(), vec!["disconnecting", "disconnect"]);
        assert_eq!(nsp.socket_count(), 0);
    }

    #[test]
    fn test_join_racing_close_leaves_no_membership() {
        // whichever side of the close a concurrent join lands on, room
        // membership must not survive the socket
        for _ in 0..100 {
            let nsp = Namespace::new("/");
            let (socket, _rx) = make_socket(&nsp, "c1");
            nsp.join_socket(&socket);

            let joiner = {
                let socket = socket.clone();
                std::thread::spawn(move || {
                    socket.join("lobby");
                })
            };
            let closer = {
                let socket = socket.clone();
                std::thread::spawn(move || {
                    socket.close("raced");
                })
            };
            joiner.join().expect("joiner panicked");
            closer.join().expect("closer panicked");

            assert!(nsp.members_of("lobby").is_empty());
            assert!(nsp.rooms_of(socket.id()).is_empty());
        }
    }
}
