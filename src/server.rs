//! Engine entry point: namespace registry and connection attachment.
//!
//! A [`Server`] owns the namespace table and the set of attached
//! connections. [`Server::attach`] hands a transport to a dedicated task
//! (see [`crate::client`]) and returns a [`ClientHandle`] for shutdown
//! control. The root namespace exists from construction; others are
//! created on first lookup, or on a client CONNECT that passes the
//! optional namespace authorizer.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::client::{Connection, Outbound};
use crate::namespace::Namespace;
use crate::transport::Transport;

/// Deadline applied to [`crate::Socket::emit_with_ack`] unless overridden
/// via [`ServerBuilder::ack_timeout`].
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for the remaining attachments of a partially received binary
/// packet, unless overridden via [`ServerBuilder::read_timeout`].
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Identity of one attached connection, chosen by the embedder.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct ClientId(pub String);

impl ClientId {
    /// Process-unique id for embedders that have no identity of their own:
    /// a sequence number plus a random tail.
    pub fn generate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        let seq = NEXT.fetch_add(1, Ordering::Relaxed);
        let tail: u16 = rand::random();
        Self(format!("client-{seq:x}-{tail:04x}"))
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ClientId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Errors from [`Server`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// A connection with this id is already attached.
    DuplicateClient(ClientId),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateClient(id) => write!(f, "Client {id} is already attached"),
        }
    }
}

impl std::error::Error for EngineError {}

type Authorizer = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// State shared by the [`Server`] handle and every connection task.
pub(crate) struct ServerCore {
    root: Arc<Namespace>,
    namespaces: Mutex<HashMap<String, Arc<Namespace>>>,
    clients: Mutex<HashMap<ClientId, mpsc::UnboundedSender<Outbound>>>,
    authorizer: Option<Authorizer>,
    ack_timeout: Duration,
    read_timeout: Duration,
}

impl ServerCore {
    fn new(
        ack_timeout: Duration,
        read_timeout: Duration,
        authorizer: Option<Authorizer>,
    ) -> Self {
        let root = Namespace::new("/");
        let mut namespaces = HashMap::new();
        namespaces.insert("/".to_string(), Arc::clone(&root));
        Self {
            root,
            namespaces: Mutex::new(namespaces),
            clients: Mutex::new(HashMap::new()),
            authorizer,
            ack_timeout,
            read_timeout,
        }
    }

    pub(crate) fn root_namespace(&self) -> Arc<Namespace> {
        Arc::clone(&self.root)
    }

    pub(crate) fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    pub(crate) fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Look up or create a namespace. Server-side access is never refused.
    fn namespace(&self, name: &str) -> Arc<Namespace> {
        let name = normalize(name);
        match self.namespaces.lock() {
            Ok(mut namespaces) => {
                if let Some(existing) = namespaces.get(&name) {
                    return Arc::clone(existing);
                }
                log::info!("[Namespace] Created {name}");
                let created = Namespace::new(&name);
                namespaces.insert(name, Arc::clone(&created));
                created
            }
            Err(_) => Namespace::new(&name),
        }
    }

    /// Resolve the target of a client CONNECT. Namespaces already present
    /// are always connectable; an unknown one consults the authorizer
    /// before being created.
    pub(crate) fn authorize_namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        let name = normalize(name);
        let existing = self
            .namespaces
            .lock()
            .ok()
            .and_then(|namespaces| namespaces.get(&name).cloned());
        if let Some(namespace) = existing {
            return Some(namespace);
        }
        if let Some(allow) = &self.authorizer {
            if !allow(&name) {
                return None;
            }
        }
        Some(self.namespace(&name))
    }

    fn register_client(
        &self,
        id: &ClientId,
        tx: &mpsc::UnboundedSender<Outbound>,
    ) -> Result<(), EngineError> {
        let Ok(mut clients) = self.clients.lock() else {
            return Ok(());
        };
        match clients.entry(id.clone()) {
            Entry::Occupied(mut slot) => {
                // a connection whose task died may still hold its slot
                if slot.get().is_closed() {
                    slot.insert(tx.clone());
                    Ok(())
                } else {
                    Err(EngineError::DuplicateClient(id.clone()))
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(tx.clone());
                Ok(())
            }
        }
    }

    /// Called by the connection task on exit. The channel check keeps a
    /// reattached id from being unregistered by its predecessor.
    pub(crate) fn unregister_client(&self, id: &ClientId, tx: &mpsc::UnboundedSender<Outbound>) {
        if let Ok(mut clients) = self.clients.lock() {
            if clients.get(id).is_some_and(|stored| stored.same_channel(tx)) {
                clients.remove(id);
            }
        }
    }
}

/// Handle to a running engine. Clones share all state.
#[derive(Clone)]
pub struct Server {
    core: Arc<ServerCore>,
}

impl Server {
    /// Build with defaults: 30 second ack deadline, 60 second attachment
    /// read deadline, every namespace connectable.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start configuring a server.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Look up or create a namespace. Accepts names with or without the
    /// leading slash; `""` and `"/"` both address the root.
    pub fn namespace(&self, name: &str) -> Arc<Namespace> {
        self.core.namespace(name)
    }

    /// Names of every namespace currently present, in no particular order.
    pub fn namespace_names(&self) -> Vec<String> {
        self.core
            .namespaces
            .lock()
            .map(|namespaces| namespaces.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of attached connections.
    pub fn client_count(&self) -> usize {
        self.core
            .clients
            .lock()
            .map(|clients| clients.len())
            .unwrap_or(0)
    }

    /// Attach a connection under `id` and spawn the task that owns its
    /// transport. The connection joins the root namespace right away;
    /// non-root namespaces join when the client sends CONNECT packets.
    ///
    /// # Errors
    ///
    /// [`EngineError::DuplicateClient`] when `id` is already attached.
    pub fn attach(
        &self,
        id: impl Into<ClientId>,
        transport: impl Transport + 'static,
    ) -> Result<ClientHandle, EngineError> {
        let id = id.into();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.core.register_client(&id, &outbound_tx)?;
        let connection = Connection::new(
            Arc::clone(&self.core),
            id.clone(),
            Box::new(transport),
            outbound_tx.clone(),
            outbound_rx,
        );
        tokio::spawn(connection.run());
        Ok(ClientHandle {
            id,
            outbound: outbound_tx,
        })
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("namespaces", &self.namespace_names().len())
            .field("clients", &self.client_count())
            .finish_non_exhaustive()
    }
}

/// Control handle for one attached connection.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl ClientHandle {
    /// The id this connection was attached under.
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Whether the connection's task has finished.
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Ask the connection to shut down. Packets queued ahead of the
    /// request are flushed first; then the transport closes and every
    /// socket disconnects with reason `forced close`.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Shutdown);
    }
}

/// Configuration for a [`Server`]; obtained via [`Server::builder`].
pub struct ServerBuilder {
    ack_timeout: Duration,
    read_timeout: Duration,
    authorizer: Option<Authorizer>,
}

impl ServerBuilder {
    fn new() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            authorizer: None,
        }
    }

    /// Deadline for emit-with-ack replies.
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Deadline for the attachments of a binary packet. A connection whose
    /// next frame does not arrive in time while attachments are owed is
    /// closed as a protocol error.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Restrict which unknown namespaces clients may create by CONNECT.
    /// The predicate sees normalized names (leading slash included);
    /// namespaces already present on the server bypass it.
    pub fn namespace_authorizer<F>(mut self, allow: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.authorizer = Some(Box::new(allow));
        self
    }

    /// Construct the server with the accumulated configuration.
    pub fn build(self) -> Server {
        Server {
            core: Arc::new(ServerCore::new(
                self.ack_timeout,
                self.read_timeout,
                self.authorizer,
            )),
        }
    }
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("ack_timeout", &self.ack_timeout)
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

/// Namespace names are absolute paths; bare names gain the leading slash.
fn normalize(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}
