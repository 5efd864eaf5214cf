//! Primary/alternative base URL rotation with host health tracking.
//!
//! Connectivity failures against the current host ban it for a while and move
//! traffic to the next available alternative, chosen by the configured
//! rotation strategy. The primary host is preferred again once its ban ends.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::seq::SliceRandom;

use super::RoutingResolver;
use crate::transport::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationStrategy {
    Sequential,
    Random,
}

#[derive(Debug, Clone)]
pub struct FailoverConfig {
    pub rotation_strategy: RotationStrategy,
    pub ban_time: Duration,
    /// Headers sent only while an alternative host is in use.
    pub alternative_headers: HashMap<String, String>,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            rotation_strategy: RotationStrategy::Sequential,
            ban_time: Duration::from_secs(300),
            alternative_headers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoutingHealthReport {
    pub current: String,
    pub total_hosts: usize,
    pub banned_hosts: usize,
    pub failures: HashMap<String, u64>,
}

#[derive(Debug, Clone)]
struct HostEntry {
    base_url: String,
    failures: u64,
    banned_until: Option<Instant>,
}

impl HostEntry {
    fn new(base_url: String) -> Self {
        Self {
            base_url,
            failures: 0,
            banned_until: None,
        }
    }

    fn is_available(&self, now: Instant) -> bool {
        self.banned_until.is_none_or(|until| now >= until)
    }
}

#[derive(Debug)]
struct RoutingState {
    hosts: Vec<HostEntry>,
    current: usize,
    cursor: usize,
    blocked_decisions: u64,
}

/// Routing resolver switching between a primary base URL and alternatives.
#[derive(Debug)]
pub struct FailoverRouting {
    config: FailoverConfig,
    state: Mutex<RoutingState>,
}

impl FailoverRouting {
    pub fn new<I>(primary: impl Into<String>, alternatives: I, config: FailoverConfig) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut hosts = vec![HostEntry::new(primary.into())];
        for alternative in alternatives {
            let base_url = alternative.into();
            if hosts.iter().any(|entry| entry.base_url == base_url) {
                continue;
            }
            hosts.push(HostEntry::new(base_url));
        }

        Self {
            config,
            state: Mutex::new(RoutingState {
                hosts,
                current: 0,
                cursor: 0,
                blocked_decisions: 0,
            }),
        }
    }

    pub fn health_report(&self) -> RoutingHealthReport {
        let state = self.lock();
        let now = Instant::now();
        RoutingHealthReport {
            current: state.hosts[state.current].base_url.clone(),
            total_hosts: state.hosts.len(),
            banned_hosts: state
                .hosts
                .iter()
                .filter(|entry| !entry.is_available(now))
                .count(),
            failures: state
                .hosts
                .iter()
                .map(|entry| (entry.base_url.clone(), entry.failures))
                .collect(),
        }
    }

    /// Number of times a routing-solvable failure could not be worked around.
    pub fn blocked_decisions(&self) -> u64 {
        self.lock().blocked_decisions
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RoutingState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn select_next(&self, state: &mut RoutingState, now: Instant) -> Option<usize> {
        let available: Vec<usize> = state
            .hosts
            .iter()
            .enumerate()
            .filter(|(idx, entry)| *idx != state.current && entry.is_available(now))
            .map(|(idx, _)| idx)
            .collect();

        if available.is_empty() {
            return None;
        }

        // Primary first whenever it is healthy again.
        if available.contains(&0) {
            return Some(0);
        }

        match self.config.rotation_strategy {
            RotationStrategy::Sequential => {
                let idx = available[state.cursor % available.len()];
                state.cursor = state.cursor.wrapping_add(1);
                Some(idx)
            }
            RotationStrategy::Random => available.choose(&mut rand::thread_rng()).copied(),
        }
    }
}

#[async_trait]
impl RoutingResolver for FailoverRouting {
    fn current_base_url(&self) -> String {
        let mut state = self.lock();
        let now = Instant::now();
        if state.current != 0 && state.hosts[0].is_available(now) {
            state.hosts[0].banned_until = None;
            state.current = 0;
        }
        state.hosts[state.current].base_url.clone()
    }

    fn is_routing_solvable_error(&self, error: &TransportError) -> bool {
        error.is_connectivity() && self.lock().hosts.len() > 1
    }

    async fn resolve_routing_error(&self, error: &TransportError, failed_base_url: &str) -> bool {
        let mut state = self.lock();
        let now = Instant::now();

        if let Some(entry) = state
            .hosts
            .iter_mut()
            .find(|entry| entry.base_url == failed_base_url)
        {
            entry.failures += 1;
            entry.banned_until = Some(now + self.config.ban_time);
        }

        match self.select_next(&mut state, now) {
            Some(next) => {
                log::info!(
                    "Switching route from {} to {} after: {}",
                    failed_base_url,
                    state.hosts[next].base_url,
                    error
                );
                state.current = next;
                true
            }
            None => {
                log::warn!("No alternative route left after: {}", error);
                false
            }
        }
    }

    fn on_routing_error_resolved(&self, should_retry: bool) {
        if !should_retry {
            self.lock().blocked_decisions += 1;
        }
    }

    fn on_request_completed(&self, base_url: &str) {
        let mut state = self.lock();
        if let Some(entry) = state
            .hosts
            .iter_mut()
            .find(|entry| entry.base_url == base_url)
        {
            entry.banned_until = None;
        }
    }

    fn routing_headers(&self) -> HashMap<String, String> {
        if self.lock().current == 0 {
            HashMap::new()
        } else {
            self.config.alternative_headers.clone()
        }
    }

    fn is_active(&self) -> bool {
        self.lock().hosts.len() > 1
    }
}
