//! Metrics collection utilities.
//!
//! Aggregates logical request outcomes globally and per API path, together
//! with counters for credential refreshes, challenges, and retries.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::events::RetryReason;

/// Aggregated metrics across all paths.
#[derive(Debug, Clone)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
    pub network_refreshes: u64,
    pub refresh_failures_authenticated: u64,
    pub refresh_failures_unauthenticated: u64,
    pub challenge_presentations: u64,
    pub upgrade_notifications: u64,
    pub routing_retries: u64,
    pub auth_retries: u64,
    pub verification_retries: u64,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            total_requests: 0,
            successes: 0,
            failures: 0,
            average_latency: None,
            p95_latency: None,
            network_refreshes: 0,
            refresh_failures_authenticated: 0,
            refresh_failures_unauthenticated: 0,
            challenge_presentations: 0,
            upgrade_notifications: 0,
            routing_retries: 0,
            auth_retries: 0,
            verification_retries: 0,
        }
    }
}

/// Path-scoped metrics snapshot.
#[derive(Debug, Clone)]
pub struct PathStats {
    pub path: String,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
    pub consecutive_failures: u32,
}

impl PathStats {
    fn from_accumulator(path: &str, acc: &PathAccumulator) -> Self {
        let (avg, p95) = acc.latency_stats();
        Self {
            path: path.to_string(),
            total_requests: acc.total_requests,
            successes: acc.successes,
            failures: acc.failures,
            average_latency: avg,
            p95_latency: p95,
            consecutive_failures: acc.consecutive_failures,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub global: GlobalStats,
    pub paths: Vec<PathStats>,
}

impl MetricsSnapshot {
    pub fn path(&self, path: &str) -> Option<&PathStats> {
        self.paths.iter().find(|stats| stats.path == path)
    }
}

#[derive(Debug)]
struct PathAccumulator {
    total_requests: u64,
    successes: u64,
    failures: u64,
    latencies: VecDeque<Duration>,
    max_window: usize,
    consecutive_failures: u32,
    last_used: u64,
}

impl PathAccumulator {
    fn new(max_window: usize) -> Self {
        Self {
            last_used: 0,
            total_requests: 0,
            successes: 0,
            failures: 0,
            latencies: VecDeque::with_capacity(max_window),
            max_window,
            consecutive_failures: 0,
        }
    }

    fn record(&mut self, success: bool, latency: Duration) {
        self.total_requests += 1;

        if success {
            self.successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.failures += 1;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }

        if self.latencies.len() == self.max_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    fn latency_stats(&self) -> (Option<Duration>, Option<Duration>) {
        if self.latencies.is_empty() {
            return (None, None);
        }
        let mut samples: Vec<_> = self.latencies.iter().cloned().collect();
        samples.sort_unstable();
        let avg = samples.iter().map(|d| d.as_secs_f64()).sum::<f64>() / samples.len() as f64;
        (Some(Duration::from_secs_f64(avg)), Some(percentile_95(&samples)))
    }
}

fn percentile_95(sorted: &[Duration]) -> Duration {
    let idx = ((sorted.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
    sorted[idx]
}

/// Default number of distinct paths tracked before the least recently used
/// one is evicted.
pub const DEFAULT_MAX_PATHS: usize = 256;

#[derive(Debug)]
struct MetricsState {
    global: GlobalStats,
    max_window: usize,
    max_paths: usize,
    clock: u64,
    latencies: VecDeque<Duration>,
    paths: HashMap<String, PathAccumulator>,
}

impl MetricsState {
    fn new(max_window: usize, max_paths: usize) -> Self {
        Self {
            global: GlobalStats::default(),
            max_window,
            max_paths,
            clock: 0,
            latencies: VecDeque::with_capacity(max_window),
            paths: HashMap::new(),
        }
    }

    fn accumulator_mut(&mut self, path: &str) -> &mut PathAccumulator {
        self.clock += 1;
        if !self.paths.contains_key(path) && self.paths.len() >= self.max_paths {
            let oldest = self
                .paths
                .iter()
                .min_by_key(|(_, acc)| acc.last_used)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                self.paths.remove(&oldest);
            }
        }

        let max_window = self.max_window;
        let acc = self
            .paths
            .entry(path.to_string())
            .or_insert_with(|| PathAccumulator::new(max_window));
        acc.last_used = self.clock;
        acc
    }

    fn record_latency(&mut self, latency: Duration) {
        if self.latencies.len() == self.max_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);

        let mut samples: Vec<_> = self.latencies.iter().cloned().collect();
        samples.sort_unstable();
        self.global.p95_latency = Some(percentile_95(&samples));
    }
}

/// Thread-safe metrics collector used by the orchestration layer.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(128, DEFAULT_MAX_PATHS))),
        }
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(window.max(16), DEFAULT_MAX_PATHS))),
        }
    }

    /// Latency window plus an upper bound on tracked paths.
    pub fn with_limits(window: usize, max_paths: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(window.max(16), max_paths.max(1)))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_request(&self, path: &str, success: bool, latency: Duration) {
        let mut guard = self.lock();
        guard.global.total_requests += 1;
        if success {
            guard.global.successes += 1;
        } else {
            guard.global.failures += 1;
        }

        guard.global.average_latency = Some(match guard.global.average_latency {
            Some(avg) => Duration::from_secs_f64(avg.as_secs_f64() * 0.9 + latency.as_secs_f64() * 0.1),
            None => latency,
        });

        guard.accumulator_mut(path).record(success, latency);
        guard.record_latency(latency);
    }

    pub fn record_network_refresh(&self) {
        self.lock().global.network_refreshes += 1;
    }

    pub fn record_refresh_failure(&self, unauthenticated: bool) {
        let mut guard = self.lock();
        if unauthenticated {
            guard.global.refresh_failures_unauthenticated += 1;
        } else {
            guard.global.refresh_failures_authenticated += 1;
        }
    }

    pub fn record_challenge_presented(&self) {
        self.lock().global.challenge_presentations += 1;
    }

    pub fn record_upgrade_notification(&self) {
        self.lock().global.upgrade_notifications += 1;
    }

    pub fn record_retry(&self, reason: RetryReason) {
        let mut guard = self.lock();
        match reason {
            RetryReason::Routing => guard.global.routing_retries += 1,
            RetryReason::AuthRefresh => guard.global.auth_retries += 1,
            RetryReason::Verification => guard.global.verification_retries += 1,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.lock();
        let paths = guard
            .paths
            .iter()
            .map(|(path, acc)| PathStats::from_accumulator(path, acc))
            .collect();
        MetricsSnapshot {
            global: guard.global.clone(),
            paths,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
