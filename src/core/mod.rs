//! Core data structures and helpers shared by every layer of the service.

pub mod headers;
pub mod types;

pub use headers::{ClientIdentity, HeaderLayers, InvalidHeader, compose_headers};
pub use types::{
    ApiResponse, Credential, RequestBody, RequestSpec, ResponseError, RetryPolicy, body_code,
    body_error,
};
