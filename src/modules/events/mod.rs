//! Event system for the request orchestration layer.
//!
//! Provides hooks for metrics, logging, and custom reactions around request
//! attempts, credential refreshes, and challenge sessions.

use chrono::{DateTime, Utc};
use http::Method;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::metrics::MetricsCollector;

/// Structured pre-request event, one per wire attempt.
#[derive(Debug, Clone)]
pub struct PreRequestEvent {
    pub url: Url,
    pub method: Method,
    pub authenticated: bool,
    pub timestamp: DateTime<Utc>,
}

/// Structured post-response event, one per wire attempt that got a status.
#[derive(Debug, Clone)]
pub struct PostResponseEvent {
    pub url: Url,
    pub method: Method,
    pub status: u16,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

/// Terminal outcome of one logical request.
#[derive(Debug, Clone)]
pub struct CompletedEvent {
    pub path: String,
    pub success: bool,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    Routing,
    AuthRefresh,
    Verification,
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryReason::Routing => write!(f, "routing"),
            RetryReason::AuthRefresh => write!(f, "auth refresh"),
            RetryReason::Verification => write!(f, "verification"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub path: String,
    pub attempt: u32,
    pub reason: RetryReason,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshSuccessReason {
    FreshAccessTokenAlreadyAvailable,
    AccessTokenRefreshed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshFailureReason {
    NoAuthDelegate,
    NoAccessTokenToBeRefreshed,
    TooManyRefreshingAttempts,
    UnauthSessionInvalidatedAndRefetched,
    UnauthSessionReacquisitionFailed,
    RefreshFailedWithLogout,
    LocalCacheBadRefreshRetried,
    RefreshFailedWithAuthError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    /// A refresh round trip is about to hit the network.
    NetworkRequest,
    Succeeded(RefreshSuccessReason),
    Failed(RefreshFailureReason),
}

#[derive(Debug, Clone)]
pub struct RefreshEvent {
    pub session_id: String,
    pub unauthenticated: bool,
    pub phase: RefreshPhase,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengePhase {
    Presented,
    Closed,
    Notified,
}

#[derive(Debug, Clone)]
pub struct ChallengeEvent {
    pub kind: String,
    pub phase: ChallengePhase,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub path: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum ServiceEvent {
    PreRequest(PreRequestEvent),
    PostResponse(PostResponseEvent),
    Completed(CompletedEvent),
    Retry(RetryEvent),
    Refresh(RefreshEvent),
    Challenge(ChallengeEvent),
    Error(ErrorEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &ServiceEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: ServiceEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }

    pub fn refresh(&self, session_id: &str, unauthenticated: bool, phase: RefreshPhase) {
        self.dispatch(ServiceEvent::Refresh(RefreshEvent {
            session_id: session_id.to_string(),
            unauthenticated,
            phase,
            timestamp: Utc::now(),
        }));
    }

    pub fn challenge(&self, kind: impl Into<String>, phase: ChallengePhase) {
        self.dispatch(ServiceEvent::Challenge(ChallengeEvent {
            kind: kind.into(),
            phase,
            timestamp: Utc::now(),
        }));
    }

    pub fn retry(&self, path: &str, attempt: u32, reason: RetryReason) {
        self.dispatch(ServiceEvent::Retry(RetryEvent {
            path: path.to_string(),
            attempt,
            reason,
            timestamp: Utc::now(),
        }));
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &ServiceEvent) {
        match event {
            ServiceEvent::PreRequest(pre) => {
                log::debug!("-> {} {} (auth={})", pre.method, pre.url, pre.authenticated);
            }
            ServiceEvent::PostResponse(post) => {
                log::debug!(
                    "<- {} {} -> {} ({:.2}s)",
                    post.method,
                    post.url,
                    post.status,
                    post.latency.as_secs_f64()
                );
            }
            ServiceEvent::Completed(done) => {
                log::debug!(
                    "{} finished success={} in {:.2}s",
                    done.path,
                    done.success,
                    done.latency.as_secs_f64()
                );
            }
            ServiceEvent::Retry(retry) => {
                log::info!("retry {} attempt {} ({})", retry.path, retry.attempt, retry.reason);
            }
            ServiceEvent::Refresh(refresh) => match refresh.phase {
                RefreshPhase::NetworkRequest => {
                    log::debug!("refreshing credential for session {}", refresh.session_id);
                }
                RefreshPhase::Succeeded(reason) => {
                    log::info!("credential refresh for {}: {:?}", refresh.session_id, reason);
                }
                RefreshPhase::Failed(reason) => {
                    log::warn!(
                        "credential refresh failed for {} (unauthenticated={}): {:?}",
                        refresh.session_id,
                        refresh.unauthenticated,
                        reason
                    );
                }
            },
            ServiceEvent::Challenge(challenge) => {
                log::info!("challenge {} {:?}", challenge.kind, challenge.phase);
            }
            ServiceEvent::Error(error) => {
                log::warn!("request {} failed: {}", error.path, error.error);
            }
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &ServiceEvent) {
        match event {
            ServiceEvent::Completed(done) => {
                self.metrics.record_request(&done.path, done.success, done.latency);
            }
            ServiceEvent::Retry(retry) => {
                self.metrics.record_retry(retry.reason);
            }
            ServiceEvent::Refresh(refresh) => match refresh.phase {
                RefreshPhase::NetworkRequest => self.metrics.record_network_refresh(),
                // Still running, or nothing was sent.
                RefreshPhase::Failed(
                    RefreshFailureReason::LocalCacheBadRefreshRetried
                    | RefreshFailureReason::UnauthSessionInvalidatedAndRefetched
                    | RefreshFailureReason::NoAccessTokenToBeRefreshed,
                ) => {}
                RefreshPhase::Failed(_) => {
                    self.metrics.record_refresh_failure(refresh.unauthenticated);
                }
                RefreshPhase::Succeeded(_) => {}
            },
            ServiceEvent::Challenge(challenge) => match challenge.phase {
                ChallengePhase::Presented => self.metrics.record_challenge_presented(),
                ChallengePhase::Notified => self.metrics.record_upgrade_notification(),
                ChallengePhase::Closed => {}
            },
            _ => {}
        }
    }
}
