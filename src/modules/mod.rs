//! Cross-cutting services module
//!
//! Structured events around every attempt, refresh, and challenge, plus the
//! metrics collector fed from them.

pub mod events;
pub mod metrics;

// Re-export commonly used types
pub use events::{
    ChallengeEvent, ChallengePhase, CompletedEvent, ErrorEvent, EventDispatcher, EventHandler,
    LoggingHandler, MetricsHandler, PostResponseEvent, PreRequestEvent, RefreshEvent,
    RefreshFailureReason, RefreshPhase, RefreshSuccessReason, RetryEvent, RetryReason,
    ServiceEvent,
};
pub use metrics::{GlobalStats, MetricsCollector, MetricsSnapshot, PathStats};
