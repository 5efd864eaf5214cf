//! Base URL resolution and alternative routing.
//!
//! The executor asks a [`RoutingResolver`] for the base URL before every
//! attempt and hands it any transport failure so the resolver can decide
//! whether switching to another route is worth a retry.

pub mod failover;

pub use failover::{FailoverConfig, FailoverRouting, RotationStrategy, RoutingHealthReport};

use std::collections::HashMap;

use async_trait::async_trait;

use crate::transport::TransportError;

/// Routing collaborator consumed by the executor.
#[async_trait]
pub trait RoutingResolver: Send + Sync {
    /// Base URL the next attempt should use.
    fn current_base_url(&self) -> String;

    /// Whether `error` is something switching routes could fix.
    fn is_routing_solvable_error(&self, error: &TransportError) -> bool;

    /// Decide whether to retry after `error` happened against `failed_base_url`.
    /// Implementations may switch the current base URL before returning `true`.
    async fn resolve_routing_error(&self, error: &TransportError, failed_base_url: &str) -> bool;

    /// Called with the decision once the executor acted on it.
    fn on_routing_error_resolved(&self, _should_retry: bool) {}

    /// Called whenever a request completed against `base_url`.
    fn on_request_completed(&self, _base_url: &str) {}

    /// Extra headers required by the route currently in use.
    fn routing_headers(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Whether alternative routing is switched on. Active routing shortens
    /// the default request timeout so failover kicks in sooner.
    fn is_active(&self) -> bool {
        false
    }
}

/// Single fixed base URL; never retries.
#[derive(Debug, Clone)]
pub struct StaticRouting {
    base_url: String,
}

impl StaticRouting {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl RoutingResolver for StaticRouting {
    fn current_base_url(&self) -> String {
        self.base_url.clone()
    }

    fn is_routing_solvable_error(&self, _error: &TransportError) -> bool {
        false
    }

    async fn resolve_routing_error(&self, _error: &TransportError, _failed_base_url: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_routing_never_retries() {
        let routing = StaticRouting::new("https://mail.example.com/api");
        let error = TransportError::Connect("refused".into());
        assert_eq!(routing.current_base_url(), "https://mail.example.com/api");
        assert!(!routing.is_routing_solvable_error(&error));
        assert!(!routing.resolve_routing_error(&error, "https://mail.example.com/api").await);
        assert!(routing.routing_headers().is_empty());
        assert!(!routing.is_active());
    }
}
