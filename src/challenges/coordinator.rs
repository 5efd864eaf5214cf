//! Challenge session coordination.
//!
//! At most one challenge of a given kind is presented at a time. Requests that
//! hit the same challenge while it is on screen park in the session's waiter
//! queue and are released together when it closes; each then re-issues its
//! own request.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Map, Value};
use tokio::sync::oneshot;

use super::classifier::ChallengeKind;
use super::human_verification::{
    CodeSubmissionHandler, ForceUpgradeDelegate, HumanVerificationDelegate,
    HumanVerificationParameters, VerificationOutcome,
};
use crate::core::{ResponseError, body_error};
use crate::modules::events::{ChallengePhase, EventDispatcher};

const DEFAULT_UPGRADE_MESSAGE: &str = "This version of the application is no longer supported";

/// The response that triggered the challenge.
#[derive(Debug, Clone, Copy)]
pub struct ChallengeContext<'a> {
    pub body: &'a Value,
    pub http_status: Option<u16>,
    pub path: &'a str,
}

/// What the executor should do after a challenge.
#[derive(Debug)]
pub enum ChallengeResolution {
    /// Re-issue the request with `headers` merged over the caller's. A ticket
    /// is present only for the request that drove the verification UI.
    RetryWithHeaders {
        headers: HashMap<String, String>,
        ticket: Option<VerificationTicket>,
    },
    Abort(ResponseError),
    /// Deliver this body in place of a fresh attempt.
    AbortWithSubstituteResponse(Value),
}

#[derive(Default)]
struct ChallengeSession {
    active: bool,
    waiters: Vec<oneshot::Sender<()>>,
}

struct CoordinatorInner {
    verification_delegate: Option<Arc<dyn HumanVerificationDelegate>>,
    upgrade_delegate: Option<Arc<dyn ForceUpgradeDelegate>>,
    sessions: Mutex<HashMap<ChallengeKind, ChallengeSession>>,
    presentations: AtomicU64,
    events: Arc<EventDispatcher>,
}

#[derive(Clone)]
pub struct ChallengeCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl ChallengeCoordinator {
    pub fn new(
        verification_delegate: Option<Arc<dyn HumanVerificationDelegate>>,
        upgrade_delegate: Option<Arc<dyn ForceUpgradeDelegate>>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                verification_delegate,
                upgrade_delegate,
                sessions: Mutex::new(HashMap::new()),
                presentations: AtomicU64::new(0),
                events,
            }),
        }
    }

    pub async fn resolve(&self, kind: ChallengeKind, context: ChallengeContext<'_>) -> ChallengeResolution {
        match kind {
            ChallengeKind::ForcedUpgrade => self.notify_upgrade(context),
            ChallengeKind::HumanVerification => self.resolve_verification(context).await,
        }
    }

    /// How many times the verification UI was shown.
    pub fn presentation_count(&self) -> u64 {
        self.inner.presentations.load(Ordering::SeqCst)
    }

    pub fn is_active(&self, kind: ChallengeKind) -> bool {
        self.lock().get(&kind).is_some_and(|session| session.active)
    }

    /// Waiters still parked on `kind`; abandoned ones are not counted.
    pub fn waiter_count(&self, kind: ChallengeKind) -> usize {
        let mut sessions = self.lock();
        match sessions.get_mut(&kind) {
            Some(session) => {
                session.waiters.retain(|waiter| !waiter.is_closed());
                session.waiters.len()
            }
            None => 0,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ChallengeKind, ChallengeSession>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify_upgrade(&self, context: ChallengeContext<'_>) -> ChallengeResolution {
        let message = body_error(context.body)
            .filter(|message| !message.is_empty())
            .unwrap_or(DEFAULT_UPGRADE_MESSAGE);

        if let Some(ref delegate) = self.inner.upgrade_delegate {
            delegate.notify(message);
        } else {
            log::warn!("Forced upgrade requested but no delegate is registered: {}", message);
        }
        self.inner
            .events
            .challenge(ChallengeKind::ForcedUpgrade.as_str(), ChallengePhase::Notified);

        ChallengeResolution::AbortWithSubstituteResponse(context.body.clone())
    }

    async fn resolve_verification(&self, context: ChallengeContext<'_>) -> ChallengeResolution {
        let kind = ChallengeKind::HumanVerification;
        let Some(delegate) = self.inner.verification_delegate.clone() else {
            return ChallengeResolution::Abort(ResponseError::from_body(context.http_status, context.body));
        };

        let parked = {
            let mut sessions = self.lock();
            let session = sessions.entry(kind).or_default();
            if session.active {
                session.waiters.retain(|waiter| !waiter.is_closed());
                let (tx, rx) = oneshot::channel();
                session.waiters.push(tx);
                Some(rx)
            } else {
                session.active = true;
                None
            }
        };

        if let Some(rx) = parked {
            log::debug!("Verification already on screen, parking {}", context.path);
            // A dropped sender means the session went away; retrying is still right.
            let _ = rx.await;
            return ChallengeResolution::RetryWithHeaders {
                headers: HashMap::new(),
                ticket: None,
            };
        }

        let ticket = VerificationTicket {
            coordinator: self.clone(),
            kind,
            submission: None,
            open: true,
        };

        self.inner.presentations.fetch_add(1, Ordering::SeqCst);
        self.inner.events.challenge(kind.as_str(), ChallengePhase::Presented);

        let parameters = HumanVerificationParameters::from_body(context.body);
        let current_url = context.path.split('?').next().filter(|path| !path.is_empty());
        let outcome = delegate.present_challenge(parameters, current_url).await;

        ticket.apply(outcome, context.body)
    }

    fn close_session(&self, kind: ChallengeKind) {
        let waiters = {
            let mut sessions = self.lock();
            match sessions.get_mut(&kind) {
                Some(session) => {
                    session.active = false;
                    std::mem::take(&mut session.waiters)
                }
                None => Vec::new(),
            }
        };

        log::debug!("Closing {} session, releasing {} waiters", kind.as_str(), waiters.len());
        for waiter in waiters {
            let _ = waiter.send(());
        }
        self.inner.events.challenge(kind.as_str(), ChallengePhase::Closed);
    }
}

impl fmt::Debug for ChallengeCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChallengeCoordinator")
            .field("verification_delegate", &self.inner.verification_delegate.is_some())
            .field("upgrade_delegate", &self.inner.upgrade_delegate.is_some())
            .field("presentations", &self.presentation_count())
            .finish()
    }
}

/// Keeps a verification session open while its tokens are being tried.
///
/// Dropping the ticket closes the session and releases every waiter, so an
/// abandoned request never leaves the UI slot occupied.
pub struct VerificationTicket {
    coordinator: ChallengeCoordinator,
    kind: ChallengeKind,
    submission: Option<Arc<dyn CodeSubmissionHandler>>,
    open: bool,
}

impl VerificationTicket {
    /// The re-issued request got past verification.
    pub async fn accept(mut self) {
        if let Some(submission) = self.submission.take() {
            submission.accepted().await;
        }
        self.close();
    }

    /// The re-issued request was refused with a verification code. The
    /// submission handler decides whether to try new tokens.
    pub async fn reject(mut self, error: &ResponseError, body: &Value) -> ChallengeResolution {
        let Some(submission) = self.submission.take() else {
            self.close();
            return ChallengeResolution::AbortWithSubstituteResponse(body.clone());
        };
        let outcome = submission.rejected(error).await;
        self.apply(outcome, body)
    }

    fn apply(mut self, outcome: VerificationOutcome, body: &Value) -> ChallengeResolution {
        match outcome {
            VerificationOutcome::Close => {
                self.close();
                ChallengeResolution::AbortWithSubstituteResponse(body.clone())
            }
            VerificationOutcome::CloseWithError { code, description } => {
                self.close();
                ChallengeResolution::AbortWithSubstituteResponse(annotate(body, code, &description))
            }
            VerificationOutcome::Verification { headers, submission } => {
                self.submission = submission;
                ChallengeResolution::RetryWithHeaders {
                    headers,
                    ticket: Some(self),
                }
            }
        }
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.coordinator.close_session(self.kind);
        }
    }
}

impl Drop for VerificationTicket {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for VerificationTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationTicket")
            .field("kind", &self.kind)
            .field("open", &self.open)
            .finish()
    }
}

fn annotate(body: &Value, code: i64, description: &str) -> Value {
    let mut object = match body {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    object.insert("Code".into(), Value::from(code));
    object.insert("Error".into(), Value::from(description));
    Value::Object(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct GatedDelegate {
        release: Notify,
        calls: Mutex<Vec<Option<String>>>,
        outcome: fn() -> VerificationOutcome,
    }

    impl GatedDelegate {
        fn new(outcome: fn() -> VerificationOutcome) -> Arc<Self> {
            Arc::new(Self {
                release: Notify::new(),
                calls: Mutex::new(Vec::new()),
                outcome,
            })
        }
    }

    #[async_trait]
    impl HumanVerificationDelegate for GatedDelegate {
        async fn present_challenge(
            &self,
            _parameters: HumanVerificationParameters,
            current_url: Option<&str>,
        ) -> VerificationOutcome {
            self.calls.lock().unwrap().push(current_url.map(str::to_string));
            self.release.notified().await;
            (self.outcome)()
        }
    }

    struct RecordingUpgrade(Mutex<Vec<String>>);

    impl ForceUpgradeDelegate for RecordingUpgrade {
        fn notify(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    fn hv_body() -> Value {
        json!({"Code": 9001, "Error": "Human verification required"})
    }

    fn coordinator(delegate: Option<Arc<dyn HumanVerificationDelegate>>) -> ChallengeCoordinator {
        ChallengeCoordinator::new(delegate, None, Arc::new(EventDispatcher::new()))
    }

    async fn wait_for_waiters(coordinator: &ChallengeCoordinator, count: usize) {
        for _ in 0..200 {
            if coordinator.waiter_count(ChallengeKind::HumanVerification) == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("waiters never reached {count}");
    }

    #[tokio::test]
    async fn concurrent_challenges_present_once() {
        let delegate = GatedDelegate::new(|| VerificationOutcome::Verification {
            headers: HashMap::from([("x-pm-human-verification-token".to_string(), "tok".to_string())]),
            submission: None,
        });
        let coordinator = coordinator(Some(delegate.clone()));
        let body = hv_body();

        let presenter = {
            let coordinator = coordinator.clone();
            let body = body.clone();
            tokio::spawn(async move {
                let context = ChallengeContext {
                    body: &body,
                    http_status: Some(422),
                    path: "/core/v4/users?Page=1",
                };
                coordinator.resolve(ChallengeKind::HumanVerification, context).await
            })
        };

        while delegate.calls.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let coordinator = coordinator.clone();
            let body = body.clone();
            waiters.push(tokio::spawn(async move {
                let context = ChallengeContext {
                    body: &body,
                    http_status: Some(422),
                    path: "/core/v4/users",
                };
                coordinator.resolve(ChallengeKind::HumanVerification, context).await
            }));
        }
        wait_for_waiters(&coordinator, 3).await;

        delegate.release.notify_one();
        let ChallengeResolution::RetryWithHeaders { headers, ticket } = presenter.await.unwrap() else {
            panic!("expected retry");
        };
        assert_eq!(headers["x-pm-human-verification-token"], "tok");
        let ticket = ticket.unwrap();
        assert!(coordinator.is_active(ChallengeKind::HumanVerification));

        ticket.accept().await;
        for waiter in waiters {
            let resolution = waiter.await.unwrap();
            assert!(matches!(
                resolution,
                ChallengeResolution::RetryWithHeaders { ref headers, ticket: None } if headers.is_empty()
            ));
        }

        assert_eq!(coordinator.presentation_count(), 1);
        assert!(!coordinator.is_active(ChallengeKind::HumanVerification));
        assert_eq!(
            delegate.calls.lock().unwrap().as_slice(),
            &[Some("/core/v4/users".to_string())]
        );
    }

    #[tokio::test]
    async fn close_substitutes_original_body() {
        let delegate = GatedDelegate::new(|| VerificationOutcome::Close);
        delegate.release.notify_one();
        let coordinator = coordinator(Some(delegate));
        let body = hv_body();

        let resolution = coordinator
            .resolve(
                ChallengeKind::HumanVerification,
                ChallengeContext {
                    body: &body,
                    http_status: Some(422),
                    path: "/core/v4/users",
                },
            )
            .await;
        assert!(matches!(resolution, ChallengeResolution::AbortWithSubstituteResponse(ref value) if *value == body));
        assert!(!coordinator.is_active(ChallengeKind::HumanVerification));
    }

    #[tokio::test]
    async fn close_with_error_annotates_body() {
        let delegate = GatedDelegate::new(|| VerificationOutcome::CloseWithError {
            code: 12087,
            description: "Invalid code".into(),
        });
        delegate.release.notify_one();
        let coordinator = coordinator(Some(delegate));
        let body = hv_body();

        let ChallengeResolution::AbortWithSubstituteResponse(value) = coordinator
            .resolve(
                ChallengeKind::HumanVerification,
                ChallengeContext {
                    body: &body,
                    http_status: Some(422),
                    path: "/core/v4/users",
                },
            )
            .await
        else {
            panic!("expected substitute");
        };
        assert_eq!(value["Code"], 12087);
        assert_eq!(value["Error"], "Invalid code");
    }

    #[tokio::test]
    async fn missing_delegate_aborts_with_original_error() {
        let coordinator = coordinator(None);
        let body = hv_body();
        let resolution = coordinator
            .resolve(
                ChallengeKind::HumanVerification,
                ChallengeContext {
                    body: &body,
                    http_status: Some(422),
                    path: "/core/v4/users",
                },
            )
            .await;
        let ChallengeResolution::Abort(error) = resolution else {
            panic!("expected abort");
        };
        assert_eq!(error.response_code, Some(9001));
    }

    #[tokio::test]
    async fn abandoned_waiters_do_not_leak() {
        let delegate = GatedDelegate::new(|| VerificationOutcome::Close);
        let coordinator = coordinator(Some(delegate.clone()));
        let body = hv_body();

        let presenter = {
            let coordinator = coordinator.clone();
            let body = body.clone();
            tokio::spawn(async move {
                let context = ChallengeContext {
                    body: &body,
                    http_status: None,
                    path: "/core/v4/users",
                };
                coordinator.resolve(ChallengeKind::HumanVerification, context).await
            })
        };
        while delegate.calls.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }

        let waiter = {
            let coordinator = coordinator.clone();
            let body = body.clone();
            tokio::spawn(async move {
                let context = ChallengeContext {
                    body: &body,
                    http_status: None,
                    path: "/core/v4/users",
                };
                coordinator.resolve(ChallengeKind::HumanVerification, context).await
            })
        };
        wait_for_waiters(&coordinator, 1).await;
        waiter.abort();
        let _ = waiter.await;
        assert_eq!(coordinator.waiter_count(ChallengeKind::HumanVerification), 0);

        delegate.release.notify_one();
        presenter.await.unwrap();
        assert!(!coordinator.is_active(ChallengeKind::HumanVerification));
    }

    #[tokio::test]
    async fn dropped_ticket_releases_session() {
        let delegate = GatedDelegate::new(|| VerificationOutcome::Verification {
            headers: HashMap::new(),
            submission: None,
        });
        delegate.release.notify_one();
        let coordinator = coordinator(Some(delegate));
        let body = hv_body();

        let resolution = coordinator
            .resolve(
                ChallengeKind::HumanVerification,
                ChallengeContext {
                    body: &body,
                    http_status: None,
                    path: "/core/v4/users",
                },
            )
            .await;
        assert!(coordinator.is_active(ChallengeKind::HumanVerification));
        drop(resolution);
        assert!(!coordinator.is_active(ChallengeKind::HumanVerification));
    }

    #[tokio::test]
    async fn forced_upgrade_notifies_and_passes_body_through() {
        let upgrade = Arc::new(RecordingUpgrade(Mutex::new(Vec::new())));
        let coordinator =
            ChallengeCoordinator::new(None, Some(upgrade.clone()), Arc::new(EventDispatcher::new()));
        let body = json!({"Code": 5003, "Error": "Please update"});

        let resolution = coordinator
            .resolve(
                ChallengeKind::ForcedUpgrade,
                ChallengeContext {
                    body: &body,
                    http_status: Some(400),
                    path: "/core/v4/users",
                },
            )
            .await;
        assert!(matches!(resolution, ChallengeResolution::AbortWithSubstituteResponse(ref value) if *value == body));
        assert_eq!(upgrade.0.lock().unwrap().as_slice(), &["Please update".to_string()]);
        assert!(!coordinator.is_active(ChallengeKind::ForcedUpgrade));
    }
}
