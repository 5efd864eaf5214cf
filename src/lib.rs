//! # mailapi-rs
//!
//! Authenticated request orchestration for a JSON mail API backend.
//!
//! One call to [`ApiService::execute`] turns into as many wire attempts as it
//! takes: expired access tokens are refreshed once per session no matter how
//! many requests notice at the same time, transport failures are retried
//! against alternative routes, and human verification is presented once while
//! every affected request waits for it.
//!
//! ## Features
//!
//! - Async executor over a pluggable [`Transport`] (reqwest by default)
//! - Per-session serialized token refresh with stale-credential detection
//! - Anonymous session acquisition and replacement
//! - Human verification and forced upgrade handling
//! - Alternative routing with host bans and rotation
//! - Structured events and metrics
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mailapi_rs::{ApiService, Credential, InMemoryCredentialStore, RequestSpec};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = InMemoryCredentialStore::with_credential(Credential::new("uid", "access", "refresh"));
//!     let service = ApiService::builder()
//!         .with_base_url("https://mail.example.com/api")
//!         .with_credential_store(Arc::new(store))
//!         .with_session_id("uid")
//!         .build()?;
//!
//!     let response = service.execute(RequestSpec::get("/core/v4/users")).await?;
//!     println!("Code: {:?}", response.code());
//!     Ok(())
//! }
//! ```

mod api_service;

pub mod auth;
pub mod challenges;
pub mod codes;
pub mod config;
pub mod core;
pub mod modules;
pub mod routing;
pub mod transport;

pub use crate::api_service::{
    ApiError,
    ApiResult,
    ApiService,
    ApiServiceBuilder,
    ServiceDelegate,
};

pub use crate::auth::{
    AcquisitionOutcome,
    CredentialCoordinator,
    CredentialStore,
    FetchResult,
    HttpSessionAuthenticator,
    InMemoryCredentialStore,
    RefreshFailure,
    RefreshOutcome,
    SessionAuthenticator,
};

pub use crate::challenges::{
    ChallengeContext,
    ChallengeCoordinator,
    ChallengeKind,
    ChallengeResolution,
    Classification,
    CodeSubmissionHandler,
    ForceUpgradeDelegate,
    HumanVerificationDelegate,
    HumanVerificationParameters,
    TransportFault,
    VerificationOutcome,
    VerificationTicket,
    VerifyMethod,
    classify,
    classify_response,
};

pub use crate::config::{ApiServiceConfig, ConfigError};

pub use crate::core::{
    ApiResponse,
    ClientIdentity,
    Credential,
    RequestBody,
    RequestSpec,
    ResponseError,
    RetryPolicy,
};

pub use crate::modules::{
    EventDispatcher,
    EventHandler,
    GlobalStats,
    LoggingHandler,
    MetricsCollector,
    MetricsHandler,
    MetricsSnapshot,
    PathStats,
    RetryReason,
    ServiceEvent,
};

pub use crate::routing::{
    FailoverConfig,
    FailoverRouting,
    RotationStrategy,
    RoutingHealthReport,
    RoutingResolver,
    StaticRouting,
};

pub use crate::transport::{
    ReqwestTransport,
    Transport,
    TransportError,
    TransportRequest,
    TransportResponse,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
