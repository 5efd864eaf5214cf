//! Per-session serialization of credential fetch, refresh, and acquisition.
//!
//! Every operation on a session runs under that session's flight guard, so
//! two refreshes for one session never hit the network concurrently. Callers
//! that queued behind a refresh for the same failed token take its recorded
//! outcome instead of starting their own.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tokio::sync::Mutex as AsyncMutex;

use super::authenticator::SessionAuthenticator;
use super::store::CredentialStore;
use crate::core::{Credential, ResponseError};
use crate::modules::events::{EventDispatcher, RefreshFailureReason, RefreshPhase, RefreshSuccessReason};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult {
    Found(Credential),
    NotFound,
    /// No credential store is registered.
    Misconfigured,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    TooManyAttempts,
    /// The store no longer holds a credential for the session.
    NoCredential,
    Backend(ResponseError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed(Credential),
    UnauthenticatedSessionReacquired(Credential),
    SessionInvalidated(ResponseError),
    TransientFailure(RefreshFailure),
    Misconfigured,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionOutcome {
    FoundExisting(Credential),
    Acquired(Credential),
    Failed(ResponseError),
    Misconfigured,
}

#[derive(Default)]
struct SessionSlot {
    flight: Arc<AsyncMutex<()>>,
    completed: u64,
    last: Option<(String, RefreshOutcome)>,
}

struct CoordinatorInner {
    store: Option<Arc<dyn CredentialStore>>,
    authenticator: Arc<dyn SessionAuthenticator>,
    support_unauthenticated_sessions: bool,
    session_id: RwLock<String>,
    slots: Mutex<HashMap<String, SessionSlot>>,
    events: Arc<EventDispatcher>,
}

/// Funnels all credential traffic for the service.
#[derive(Clone)]
pub struct CredentialCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl CredentialCoordinator {
    pub fn new(
        store: Option<Arc<dyn CredentialStore>>,
        authenticator: Arc<dyn SessionAuthenticator>,
        support_unauthenticated_sessions: bool,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                store,
                authenticator,
                support_unauthenticated_sessions,
                session_id: RwLock::new(String::new()),
                slots: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn session_id(&self) -> String {
        self.inner
            .session_id
            .read()
            .map(|id| id.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn set_session_id(&self, session_id: impl Into<String>) {
        let mut guard = self
            .inner
            .session_id
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = session_id.into();
    }

    /// Snapshot of the session's credential, read after any in-flight refresh
    /// for that session has finished.
    pub async fn fetch(&self, session_id: &str) -> FetchResult {
        let flight = self.flight_guard(session_id);
        let result = {
            let _serial = flight.lock().await;
            self.fetch_unsynchronized(session_id)
        };
        drop(flight);
        self.prune_slots();
        result
    }

    /// Replace `failed` with a working credential.
    ///
    /// `failed` must be the credential that produced the 401. When the store
    /// already holds something newer, that is returned without a network call.
    pub async fn refresh(&self, session_id: &str, failed: &Credential, max_attempts: u32) -> RefreshOutcome {
        let (flight, observed) = {
            let mut slots = self.slots();
            let slot = slots.entry(session_id.to_string()).or_default();
            (slot.flight.clone(), slot.completed)
        };
        let outcome = {
            let _serial = flight.lock().await;
            match self.coalesced_outcome(session_id, failed, observed) {
                Some(outcome) => {
                    log::debug!("Joining the refresh that just finished for {}", session_id);
                    outcome
                }
                None => {
                    let outcome = self.refresh_unsynchronized(session_id, failed, max_attempts).await;
                    let mut slots = self.slots();
                    let slot = slots.entry(session_id.to_string()).or_default();
                    slot.completed += 1;
                    slot.last = Some((failed.access_token.clone(), outcome.clone()));
                    outcome
                }
            }
        };
        drop(flight);
        self.prune_slots();
        outcome
    }

    /// Current session's credential, or a fresh anonymous session when there
    /// is none yet.
    pub async fn fetch_or_acquire(&self) -> AcquisitionOutcome {
        let session_id = self.session_id();
        let flight = self.flight_guard(&session_id);
        let outcome = {
            let _serial = flight.lock().await;
            match self.fetch_unsynchronized(&session_id) {
                FetchResult::Found(credential) => AcquisitionOutcome::FoundExisting(credential),
                FetchResult::Misconfigured => AcquisitionOutcome::Misconfigured,
                FetchResult::NotFound => match self.acquire_unsynchronized().await {
                    Ok(credential) => AcquisitionOutcome::Acquired(credential),
                    Err(err) => AcquisitionOutcome::Failed(err),
                },
            }
        };
        drop(flight);
        self.prune_slots();
        outcome
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, SessionSlot>> {
        self.inner.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn flight_guard(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        self.slots()
            .entry(session_id.to_string())
            .or_default()
            .flight
            .clone()
    }

    /// Drop slots nobody is waiting on whose session is gone from the store.
    fn prune_slots(&self) {
        let idle: Vec<String> = self
            .slots()
            .iter()
            .filter(|(_, slot)| Arc::strong_count(&slot.flight) == 1)
            .map(|(id, _)| id.clone())
            .collect();
        if idle.is_empty() {
            return;
        }

        let gone: Vec<String> = match self.inner.store {
            Some(ref store) => idle.into_iter().filter(|id| store.credential(id).is_none()).collect(),
            None => idle,
        };
        let mut slots = self.slots();
        for id in gone {
            if slots.get(&id).is_some_and(|slot| Arc::strong_count(&slot.flight) == 1) {
                slots.remove(&id);
            }
        }
    }

    #[cfg(test)]
    fn tracked_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn coalesced_outcome(&self, session_id: &str, failed: &Credential, observed: u64) -> Option<RefreshOutcome> {
        let slots = self.slots();
        let slot = slots.get(session_id)?;
        if slot.completed <= observed {
            return None;
        }
        match slot.last {
            Some((ref token, ref outcome)) if *token == failed.access_token => Some(outcome.clone()),
            _ => None,
        }
    }

    fn fetch_unsynchronized(&self, session_id: &str) -> FetchResult {
        let Some(ref store) = self.inner.store else {
            return FetchResult::Misconfigured;
        };
        match store.credential(session_id) {
            Some(credential) => FetchResult::Found(credential),
            None => FetchResult::NotFound,
        }
    }

    async fn refresh_unsynchronized(&self, session_id: &str, failed: &Credential, max_attempts: u32) -> RefreshOutcome {
        let events = &self.inner.events;
        let unauthenticated = failed.is_unauthenticated_session;
        let fail = |reason| events.refresh(session_id, unauthenticated, RefreshPhase::Failed(reason));

        let Some(ref store) = self.inner.store else {
            fail(RefreshFailureReason::NoAuthDelegate);
            return RefreshOutcome::Misconfigured;
        };

        let mut attempts_left = max_attempts;
        loop {
            let Some(current) = store.credential(session_id) else {
                fail(RefreshFailureReason::NoAccessTokenToBeRefreshed);
                return RefreshOutcome::TransientFailure(RefreshFailure::NoCredential);
            };

            if !current.same_generation(failed) {
                events.refresh(
                    session_id,
                    current.is_unauthenticated_session,
                    RefreshPhase::Succeeded(RefreshSuccessReason::FreshAccessTokenAlreadyAvailable),
                );
                return RefreshOutcome::Refreshed(current);
            }

            if attempts_left == 0 {
                fail(RefreshFailureReason::TooManyRefreshingAttempts);
                return RefreshOutcome::TransientFailure(RefreshFailure::TooManyAttempts);
            }

            events.refresh(session_id, unauthenticated, RefreshPhase::NetworkRequest);
            let error = match self.inner.authenticator.refresh_credential(&current).await {
                Ok(refreshed) => {
                    store.update(&refreshed, session_id);
                    self.set_session_id(refreshed.session_id.clone());
                    events.refresh(
                        &refreshed.session_id,
                        refreshed.is_unauthenticated_session,
                        RefreshPhase::Succeeded(RefreshSuccessReason::AccessTokenRefreshed),
                    );
                    return RefreshOutcome::Refreshed(refreshed);
                }
                Err(error) => error,
            };

            let token_rejected = matches!(error.http_code, Some(400) | Some(422));

            if token_rejected && unauthenticated && self.inner.support_unauthenticated_sessions {
                fail(RefreshFailureReason::UnauthSessionInvalidatedAndRefetched);
                log::info!(
                    "Anonymous session {} rejected ({}), acquiring a new one",
                    session_id,
                    error
                );
                store.on_unauthenticated_session_invalidated(session_id);
                return match self.acquire_unsynchronized().await {
                    Ok(credential) => RefreshOutcome::UnauthenticatedSessionReacquired(credential),
                    Err(acquire_error) => {
                        fail(RefreshFailureReason::UnauthSessionReacquisitionFailed);
                        RefreshOutcome::TransientFailure(RefreshFailure::Backend(acquire_error))
                    }
                };
            }

            if token_rejected {
                fail(RefreshFailureReason::RefreshFailedWithLogout);
                log::warn!("Session {} invalidated by refresh failure: {}", session_id, error);
                store.invalidate_session(session_id);
                return RefreshOutcome::SessionInvalidated(error);
            }

            if error.response_code == Some(crate::codes::AUTH_LOCAL_CACHE_BAD) {
                fail(RefreshFailureReason::LocalCacheBadRefreshRetried);
                attempts_left -= 1;
                continue;
            }

            fail(RefreshFailureReason::RefreshFailedWithAuthError);
            return RefreshOutcome::TransientFailure(RefreshFailure::Backend(error));
        }
    }

    async fn acquire_unsynchronized(&self) -> Result<Credential, ResponseError> {
        let Some(ref store) = self.inner.store else {
            return Err(ResponseError::local(
                crate::codes::LOCAL_NO_CREDENTIAL_STORE,
                "No credential store is registered",
            ));
        };

        let credential = self.inner.authenticator.acquire_unauthenticated_session().await?;
        store.on_session_obtained(&credential);
        self.set_session_id(credential.session_id.clone());
        log::debug!("Obtained anonymous session {}", credential.session_id);
        Ok(credential)
    }
}

impl fmt::Debug for CredentialCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCoordinator")
            .field("session_id", &self.session_id())
            .field("has_store", &self.inner.store.is_some())
            .field(
                "support_unauthenticated_sessions",
                &self.inner.support_unauthenticated_sessions,
            )
            .finish()
    }
}
