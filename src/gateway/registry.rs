//! Session registry - user key to session, passed around by handle.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use super::session::{Session, SessionContext, SessionLogin};

pub(super) struct RegistryInner {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Serializes session start and stop so two sessions never race for
    /// the same channel names.
    pub(super) lifecycle: Mutex<()>,
}

impl RegistryInner {
    /// Drop `key` only if it still maps to this very session.
    pub(super) fn remove_entry(&self, key: &str, session: &Session) {
        let mut sessions = self.sessions.write();
        if sessions
            .get(key)
            .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), session))
        {
            sessions.remove(key);
        }
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: RwLock::new(HashMap::new()),
                lifecycle: Mutex::new(()),
            }),
        }
    }

    pub(super) fn downgrade(&self) -> Weak<RegistryInner> {
        Arc::downgrade(&self.inner)
    }

    /// Build a session for `key` and register it, replacing any entry with
    /// the same key. The caller stops a replaced session first.
    pub fn create(&self, key: &str, login: SessionLogin, ctx: Arc<SessionContext>) -> Arc<Session> {
        let session = Arc::new(Session::new(key.to_string(), login, ctx, self));
        let previous = self.inner.sessions.write().insert(key.to_string(), session.clone());
        if previous.is_some() {
            tracing::warn!(key, "replaced a registered session");
        }
        session
    }

    pub fn get(&self, key: &str) -> Option<Arc<Session>> {
        self.inner.sessions.read().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.sessions.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every session. Used at gateway shutdown.
    pub fn stop_all(&self) {
        let sessions: Vec<Arc<Session>> = self.inner.sessions.read().values().cloned().collect();
        for session in sessions {
            session.stop();
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
