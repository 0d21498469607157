//! Connection multiplexer - small integer ids to live client connections.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::bus::ConnId;

/// A client connection owned by the network layer.
pub trait ClientConnection: Send + Sync {
    fn id(&self) -> ConnId;

    /// Queue a text frame for the client. Never blocks.
    fn send_text(&self, text: &str);
}

/// Lookup table only. Holds weak handles, so a connection the network layer
/// has dropped simply stops resolving.
#[derive(Default)]
pub struct ConnectionMux {
    conns: HashMap<ConnId, Weak<dyn ClientConnection>>,
}

impl ConnectionMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, conn: Weak<dyn ClientConnection>) -> Option<ConnId> {
        let id = conn.upgrade()?.id();
        self.conns.insert(id, conn);
        Some(id)
    }

    pub fn unregister(&mut self, id: ConnId) {
        self.conns.remove(&id);
    }

    pub fn resolve(&self, id: ConnId) -> Option<Arc<dyn ClientConnection>> {
        self.conns.get(&id)?.upgrade()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}
