//! Credential persistence collaborator.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::core::Credential;

/// Holds the current credential of every known session.
///
/// Called from background tasks; implementations must not block for long.
/// Only [`CredentialCoordinator`](super::CredentialCoordinator) writes to it
/// on behalf of the orchestration layer.
pub trait CredentialStore: Send + Sync {
    fn credential(&self, session_id: &str) -> Option<Credential>;

    fn update(&self, credential: &Credential, session_id: &str);

    /// The refresh token was rejected; the authenticated session is gone.
    fn invalidate_session(&self, session_id: &str);

    /// An anonymous session was rejected and is about to be replaced.
    fn on_unauthenticated_session_invalidated(&self, session_id: &str);

    /// A brand-new session was issued by the backend.
    fn on_session_obtained(&self, credential: &Credential) {
        self.update(credential, &credential.session_id);
    }
}

/// Process-local store, mostly useful for tests and short-lived tools.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    sessions: RwLock<HashMap<String, Credential>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        let store = Self::new();
        store.write().insert(credential.session_id.clone(), credential);
        store
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Credential>> {
        self.sessions.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Credential>> {
        self.sessions.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn credential(&self, session_id: &str) -> Option<Credential> {
        self.read().get(session_id).cloned()
    }

    fn update(&self, credential: &Credential, session_id: &str) {
        let mut sessions = self.write();
        // A refresh may rotate the session ID.
        if credential.session_id != session_id {
            sessions.remove(session_id);
        }
        sessions.insert(credential.session_id.clone(), credential.clone());
    }

    fn invalidate_session(&self, session_id: &str) {
        self.write().remove(session_id);
    }

    fn on_unauthenticated_session_invalidated(&self, session_id: &str) {
        self.write().remove(session_id);
    }
}
