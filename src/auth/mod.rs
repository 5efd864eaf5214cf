//! Credential storage, refresh, and anonymous session acquisition.

pub mod authenticator;
pub mod coordinator;
pub mod store;

pub use authenticator::{HttpSessionAuthenticator, SessionAuthenticator};
pub use coordinator::{
    AcquisitionOutcome, CredentialCoordinator, FetchResult, RefreshFailure, RefreshOutcome,
};
pub use store::{CredentialStore, InMemoryCredentialStore};
