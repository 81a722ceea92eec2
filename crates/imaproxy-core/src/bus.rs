//! Event dispatch
//!
//! Each proxied connection carries two buses: one for client-to-server
//! traffic, one for server-to-client traffic. Plugins subscribe to a
//! command keyword or to one of the pseudo events; the mediator publishes
//! every framed chunk as an [`Event`] and honors the mutations listeners
//! made to it.

use crate::proto::framer::{CommandDescriptor, DATA_EVENT};
use crate::session::Session;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::error;

/// Pseudo event emitted after the command event on every dispatch
pub const POSTDATA_EVENT: &str = "__POSTDATA__";
/// Pseudo event published when a side of the connection comes up
pub const CONNECT_EVENT: &str = "__CONNECT__";
/// Pseudo event published when the connection goes down
pub const DISCONNECT_EVENT: &str = "__DISCONNECT__";

/// One proxied chunk, as seen and mutated by listeners.
///
/// `result` and `write` are the only channel back to the mediator: a
/// listener may replace the forwarded bytes by setting `result`, or
/// suppress forwarding by clearing `write`. Injected traffic goes through
/// the two queues, which the mediator flushes after the dispatch sequence
/// completes so that injected commands stay ordered behind the chunk that
/// triggered them.
#[derive(Debug)]
pub struct Event {
    /// Tag recognized by the framer, `"0"` if none
    pub seq: String,
    /// Uppercased command keyword or pseudo event name
    pub command: String,
    /// The original bytes of the chunk
    pub payload: Vec<u8>,
    /// Replacement bytes to forward instead of `payload`
    pub result: Option<Vec<u8>>,
    /// False suppresses forwarding entirely
    pub write: bool,
    /// Bytes to send to the upstream server after this dispatch
    pub to_upstream: Vec<Vec<u8>>,
    /// Bytes to send to the client after this dispatch
    pub to_client: Vec<Vec<u8>>,
}

impl Event {
    pub fn new(descriptor: CommandDescriptor, payload: Vec<u8>) -> Self {
        Self {
            seq: descriptor.seq,
            command: descriptor.command,
            payload,
            result: None,
            write: descriptor.write,
            to_upstream: Vec::new(),
            to_client: Vec::new(),
        }
    }

    /// An empty event for the connection lifecycle pseudo events
    pub fn pseudo(name: &str) -> Self {
        Self {
            seq: "0".to_string(),
            command: name.to_string(),
            payload: Vec::new(),
            result: None,
            write: false,
            to_upstream: Vec::new(),
            to_client: Vec::new(),
        }
    }
}

/// Handle identifying a registered listener, used to remove it again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler = Box<dyn FnMut(&mut Session, &mut Event) + Send>;

struct ListenerEntry {
    id: ListenerId,
    once: bool,
    removed: AtomicBool,
    handler: Mutex<Handler>,
}

/// Ordered listener registry for one traffic direction.
///
/// Listeners for the same name fire in registration order. The registry
/// lock is not held while a listener runs, so listeners are free to
/// register and remove listeners on either bus from inside a dispatch.
pub struct EventBus {
    name: &'static str,
    inner: Mutex<BusInner>,
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    listeners: HashMap<String, Vec<Arc<ListenerEntry>>>,
}

impl EventBus {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            inner: Mutex::new(BusInner::default()),
        })
    }

    /// Register a listener for `event` and return its removal handle
    pub fn on<F>(&self, event: &str, handler: F) -> ListenerId
    where
        F: FnMut(&mut Session, &mut Event) + Send + 'static,
    {
        self.register(event, Box::new(handler), false)
    }

    /// Register a listener removed automatically after its first call
    pub fn once<F>(&self, event: &str, handler: F) -> ListenerId
    where
        F: FnMut(&mut Session, &mut Event) + Send + 'static,
    {
        self.register(event, Box::new(handler), true)
    }

    fn register(&self, event: &str, handler: Handler, once: bool) -> ListenerId {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.next_id += 1;
        let id = ListenerId(inner.next_id);
        inner
            .listeners
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(ListenerEntry {
                id,
                once,
                removed: AtomicBool::new(false),
                handler: Mutex::new(handler),
            }));
        id
    }

    /// Remove a listener. Returns false when it was not registered.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entries) = inner.listeners.get_mut(event) {
            if let Some(pos) = entries.iter().position(|e| e.id == id) {
                entries[pos].removed.store(true, Ordering::Release);
                entries.remove(pos);
                return true;
            }
        }
        false
    }

    /// Invoke every listener for `name`, in registration order. A panic in
    /// one listener is logged and does not stop the others.
    pub fn emit(&self, name: &str, session: &mut Session, event: &mut Event) {
        let entries: Vec<Arc<ListenerEntry>> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            match inner.listeners.get(name) {
                Some(entries) => entries.clone(),
                None => return,
            }
        };

        for entry in entries {
            if entry.removed.load(Ordering::Acquire) {
                continue;
            }
            if entry.once {
                self.off(name, entry.id);
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                let mut guard = entry.handler.lock().unwrap_or_else(|e| e.into_inner());
                (*guard)(session, event);
            }));
            if outcome.is_err() {
                error!(
                    "{} bus listener for {} panicked on session {}; continuing",
                    self.name,
                    name,
                    session.display_id()
                );
            }
        }
    }

    /// Publish the full sequence for one framed chunk: the command event,
    /// then `__DATA__` (unless the command already is `__DATA__`), then
    /// `__POSTDATA__`. Listeners see and may mutate the same event across
    /// the sequence.
    pub fn dispatch(&self, session: &mut Session, event: &mut Event) {
        let command = event.command.clone();
        self.emit(&command, session, event);
        if command != DATA_EVENT {
            self.emit(DATA_EVENT, session, event);
        }
        self.emit(POSTDATA_EVENT, session, event);
    }
}
