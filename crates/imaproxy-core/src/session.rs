//! Proxy session state
//!
//! One session per accepted client connection, owned and mutated by that
//! connection's mediator.

use std::any::Any;
use std::collections::HashMap;

/// Per-connection session state
#[derive(Debug)]
pub struct Session {
    /// Monotonically increasing ID, unique within the worker
    pub id: u64,
    /// Worker number, when running pre-forked
    pub worker: Option<u32>,
    /// False once either side of the connection has gone down
    pub connected: bool,
    /// True once the server has advertised a capability worth acting on
    pub capabilities_seen: bool,
    /// Per-plugin session state, keyed by plugin identifier
    extensions: HashMap<&'static str, Box<dyn Any + Send>>,
}

impl Session {
    pub fn new(id: u64, worker: Option<u32>) -> Self {
        Self {
            id,
            worker,
            connected: true,
            capabilities_seen: false,
            extensions: HashMap::new(),
        }
    }

    /// Session ID as printed in log lines, with the worker prefix when
    /// running pre-forked
    pub fn display_id(&self) -> String {
        match self.worker {
            Some(w) => format!("w{}:{}", w, self.id),
            None => self.id.to_string(),
        }
    }

    /// Store plugin state under `key`, replacing any previous value
    pub fn ext_put<T: Any + Send>(&mut self, key: &'static str, value: T) {
        self.extensions.insert(key, Box::new(value));
    }

    /// Remove and return plugin state, leaving the slot empty. Pairs with
    /// [`Session::ext_put`] so a listener can hold the state mutably while
    /// also mutating the event it was called with.
    pub fn ext_take<T: Any + Send>(&mut self, key: &'static str) -> Option<Box<T>> {
        let value = self.extensions.remove(key)?;
        match value.downcast::<T>() {
            Ok(v) => Some(v),
            Err(v) => {
                self.extensions.insert(key, v);
                None
            }
        }
    }

    /// Borrow plugin state stored under `key`
    pub fn ext_get<T: Any + Send>(&self, key: &'static str) -> Option<&T> {
        self.extensions.get(key)?.downcast_ref::<T>()
    }

    /// Drop plugin state stored under `key`
    pub fn ext_remove(&mut self, key: &'static str) {
        self.extensions.remove(key);
    }
}
