//! Event handler registry.
//!
//! Each namespace owns one registry. Named slots hold any number of handlers
//! per event name, run in registration order; any-event handlers run after
//! the named ones and additionally receive the event name. Lifecycle events
//! are dispatched through the same named slots under the reserved names in
//! [`lifecycle`], but never reach the any-event handlers.
//!
//! Dispatch snapshots the handler list before invoking, so a handler may
//! register or look up handlers without deadlocking. A panicking handler is
//! caught and logged; the remaining handlers still run.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use crate::protocol::Payload;
use crate::socket::{AckResponder, Socket};

/// Handler for a named event.
///
/// Receives the emitting socket, the argument slots (event name excluded),
/// and a reply handle when the event carried an ack id.
pub type EventHandler =
    Arc<dyn Fn(&Socket, &[Payload], Option<AckResponder>) + Send + Sync>;

/// Handler receiving every inbound event together with its name.
pub type AnyEventHandler =
    Arc<dyn Fn(&Socket, &str, &[Payload], Option<AckResponder>) + Send + Sync>;

/// Event names synthesized by the engine for socket lifecycle.
pub mod lifecycle {
    /// A socket joined the namespace.
    pub const CONNECT: &str = "connect";
    /// Alias of [`CONNECT`], fired immediately after it.
    pub const CONNECTION: &str = "connection";
    /// A socket is about to leave; rooms are still intact.
    pub const DISCONNECTING: &str = "disconnecting";
    /// A socket has been removed; the one argument is the reason string.
    pub const DISCONNECT: &str = "disconnect";
}

/// Whether `name` is reserved for engine-synthesized lifecycle events.
pub fn is_reserved(name: &str) -> bool {
    matches!(
        name,
        lifecycle::CONNECT
            | lifecycle::CONNECTION
            | lifecycle::DISCONNECTING
            | lifecycle::DISCONNECT
    )
}

/// Handlers registered for one namespace.
pub struct HandlerRegistry {
    /// Named slots, in registration order per name.
    named: Mutex<HashMap<String, Vec<EventHandler>>>,

    /// Any-event handlers, run after the named slots for inbound events.
    any: Mutex<Vec<AnyEventHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            named: Mutex::new(HashMap::new()),
            any: Mutex::new(Vec::new()),
        }
    }

    /// Append a handler for `event`.
    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(&Socket, &[Payload], Option<AckResponder>) + Send + Sync + 'static,
    {
        if let Ok(mut named) = self.named.lock() {
            named
                .entry(event.to_string())
                .or_default()
                .push(Arc::new(handler));
        }
    }

    /// Append an any-event handler.
    pub fn on_any<F>(&self, handler: F)
    where
        F: Fn(&Socket, &str, &[Payload], Option<AckResponder>) + Send + Sync + 'static,
    {
        if let Ok(mut any) = self.any.lock() {
            any.push(Arc::new(handler));
        }
    }

    /// Dispatch an inbound event: named handlers first, then any-event
    /// handlers. Returns the number of handlers invoked.
    pub fn dispatch(
        &self,
        socket: &Socket,
        event: &str,
        args: &[Payload],
        ack: Option<&AckResponder>,
    ) -> usize {
        let mut invoked = self.dispatch_named(socket, event, args, ack);

        let fallbacks: Vec<AnyEventHandler> = match self.any.lock() {
            Ok(any) => any.clone(),
            Err(_) => Vec::new(),
        };
        for handler in fallbacks {
            invoke_isolated(socket, event, || handler(socket, event, args, ack.cloned()));
            invoked += 1;
        }
        invoked
    }

    /// Dispatch a lifecycle event to its named handlers only.
    ///
    /// Any-event handlers are skipped: they observe inbound traffic, not
    /// engine-synthesized events.
    pub fn dispatch_reserved(&self, socket: &Socket, event: &str, args: &[Payload]) -> usize {
        self.dispatch_named(socket, event, args, None)
    }

    fn dispatch_named(
        &self,
        socket: &Socket,
        event: &str,
        args: &[Payload],
        ack: Option<&AckResponder>,
    ) -> usize {
        // Snapshot so handlers may register handlers without deadlock.
        let handlers: Vec<EventHandler> = match self.named.lock() {
            Ok(named) => named.get(event).cloned().unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        let invoked = handlers.len();
        for handler in handlers {
            invoke_isolated(socket, event, || handler(socket, args, ack.cloned()));
        }
        invoked
    }

    /// Number of named handlers currently registered for `event`.
    pub fn handler_count(&self, event: &str) -> usize {
        self.named
            .lock()
            .map(|named| named.get(event).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let named = self.named.lock().map(|m| m.len()).unwrap_or(0);
        let any = self.any.lock().map(|v| v.len()).unwrap_or(0);
        f.debug_struct("HandlerRegistry")
            .field("named_events", &named)
            .field("any_handlers", &any)
            .finish_non_exhaustive()
    }
}

/// Run one handler, containing any panic it raises.
fn invoke_isolated(socket: &Socket, event: &str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        log::error!(
            "[Namespace] Handler for '{event}' panicked (socket {}): {}",
            socket.id(),
            panic_message(panic.as_ref())
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_log() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str)) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let writer = {
            let log = Arc::clone(&log);
            move |entry: &'static str| log.lock().unwrap().push(entry)
        };
        (log, writer)
    }

    #[test]
    fn test_named_handlers_run_in_registration_order() {
        let registry = HandlerRegistry::new();
        let (log, push) = order_log();
        let push = Arc::new(push);

        let p = Arc::clone(&push);
        registry.on("greet", move |_, _, _| p("first"));
        let p = Arc::clone(&push);
        registry.on("greet", move |_, _, _| p("second"));

        let socket = Socket::detached("s1");
        let invoked = registry.dispatch(&socket, "greet", &[], None);

        assert_eq!(invoked, 2);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_any_event_runs_after_named_and_sees_name() {
        let registry = HandlerRegistry::new();
        let (log, push) = order_log();
        let push = Arc::new(push);

        let p = Arc::clone(&push);
        registry.on("greet", move |_, _, _| p("named"));
        let p = Arc::clone(&push);
        registry.on_any(move |_, name, _, _| {
            assert_eq!(name, "greet");
            p("any");
        });

        let socket = Socket::detached("s1");
        assert_eq!(registry.dispatch(&socket, "greet", &[], None), 2);
        assert_eq!(*log.lock().unwrap(), vec!["named", "any"]);
    }

    #[test]
    fn test_unmatched_event_reaches_only_fallback() {
        let registry = HandlerRegistry::new();
        let (log, push) = order_log();
        registry.on_any(move |_, _, _, _| push("any"));

        let socket = Socket::detached("s1");
        assert_eq!(registry.dispatch(&socket, "nobody-home", &[], None), 1);
        assert_eq!(*log.lock().unwrap(), vec!["any"]);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let registry = HandlerRegistry::new();
        let (log, push) = order_log();

        registry.on("boom", |_, _, _| panic!("handler exploded"));
        registry.on("boom", move |_, _, _| push("survivor"));

        let socket = Socket::detached("s1");
        let invoked = registry.dispatch(&socket, "boom", &[], None);

        assert_eq!(invoked, 2);
        assert_eq!(*log.lock().unwrap(), vec!["survivor"]);
    }

    #[test]
    fn test_reserved_dispatch_skips_any_event_handlers() {
        let registry = HandlerRegistry::new();
        let (log, push) = order_log();
        let push = Arc::new(push);

        let p = Arc::clone(&push);
        registry.on(lifecycle::CONNECT, move |_, _, _| p("connect"));
        let p = Arc::clone(&push);
        registry.on_any(move |_, _, _, _| p("any"));

        let socket = Socket::detached("s1");
        assert_eq!(registry.dispatch_reserved(&socket, lifecycle::CONNECT, &[]), 1);
        assert_eq!(*log.lock().unwrap(), vec!["connect"]);
    }

    #[test]
    fn test_handler_may_register_during_dispatch() {
        let registry = Arc::new(HandlerRegistry::new());
        let (log, push) = order_log();
        let push = Arc::new(push);

        let reg = Arc::clone(&registry);
        let p = Arc::clone(&push);
        registry.on("seed", move |_, _, _| {
            let p = Arc::clone(&p);
            reg.on("grown", move |_, _, _| p("grown"));
        });

        let socket = Socket::detached("s1");
        registry.dispatch(&socket, "seed", &[], None);
        assert_eq!(registry.handler_count("grown"), 1);

        registry.dispatch(&socket, "grown", &[], None);
        assert_eq!(*log.lock().unwrap(), vec!["grown"]);
    }

    #[test]
    fn test_is_reserved() {
        assert!(is_reserved("connect"));
        assert!(is_reserved("connection"));
        assert!(is_reserved("disconnecting"));
        assert!(is_reserved("disconnect"));
        assert!(!is_reserved("message"));
    }
}
