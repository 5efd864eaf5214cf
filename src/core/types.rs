//! Core data structures shared across the credential, challenge, and
//! execution layers.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::codes;

/// Access/refresh token pair and scope set identifying a session.
///
/// Values are immutable snapshots: a refresh replaces the stored credential
/// wholesale, so a clone held across an await point is never mutated behind
/// the holder's back.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub session_id: String,
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub is_unauthenticated_session: bool,
}

impl Credential {
    pub fn new(
        session_id: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            scopes: Vec::new(),
            is_unauthenticated_session: false,
        }
    }

    /// Credential for an anonymous session, still scoped by the backend.
    pub fn unauthenticated(
        session_id: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        let mut credential = Self::new(session_id, access_token, refresh_token);
        credential.is_unauthenticated_session = true;
        credential
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Two credentials describe the same token generation when their access
    /// tokens match; scopes and refresh tokens may be re-issued alongside.
    pub fn same_generation(&self, other: &Credential) -> bool {
        self.access_token == other.access_token
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("session_id", &self.session_id)
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("scopes", &self.scopes)
            .field("is_unauthenticated_session", &self.is_unauthenticated_session)
            .finish()
    }
}

fn redact(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    format!("{visible}…({} chars)", secret.chars().count())
}

/// Hint forwarded to the transport about how eagerly a request should be
/// retried at the connection level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    #[default]
    UserInitiated,
    Background,
}

/// Raw request payload, used by uploads.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestBody {
    pub content_type: String,
    pub data: Bytes,
}

impl RequestBody {
    pub fn new(content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            data: data.into(),
        }
    }
}

/// One logical API call. Re-used verbatim across internal retries; only the
/// credential and the extra headers of a retry are substituted.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub path: String,
    pub parameters: Option<Value>,
    pub body: Option<RequestBody>,
    pub headers: HashMap<String, String>,
    pub requires_auth: bool,
    pub auth_retry: bool,
    pub retry_policy: RetryPolicy,
    pub timeout: Option<Duration>,
    pub explicit_credential: Option<Credential>,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            parameters: None,
            body: None,
            headers: HashMap::new(),
            requires_auth: true,
            auth_retry: true,
            retry_policy: RetryPolicy::default(),
            timeout: None,
            explicit_credential: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn unauthenticated(mut self) -> Self {
        self.requires_auth = false;
        self
    }

    pub fn without_auth_retry(mut self) -> Self {
        self.auth_retry = false;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.explicit_credential = Some(credential);
        self
    }

    /// Path without its query string.
    pub fn bare_path(&self) -> &str {
        self.path.split('?').next().unwrap_or(&self.path)
    }
}

/// Fully classified failure returned by the backend or synthesised locally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ResponseError {
    pub http_code: Option<u16>,
    pub response_code: Option<i64>,
    pub user_facing_message: String,
    pub underlying: Option<String>,
}

impl ResponseError {
    pub fn new(
        http_code: Option<u16>,
        response_code: Option<i64>,
        user_facing_message: impl Into<String>,
    ) -> Self {
        Self {
            http_code,
            response_code,
            user_facing_message: user_facing_message.into(),
            underlying: None,
        }
    }

    /// Error generated on this side of the wire, never sent to the backend.
    pub fn local(code: i64, message: impl Into<String>) -> Self {
        Self::new(None, Some(code), message)
    }

    pub fn with_underlying(mut self, underlying: impl Into<String>) -> Self {
        self.underlying = Some(underlying.into());
        self
    }

    /// Response code when present, otherwise the HTTP status.
    pub fn best_code(&self) -> i64 {
        self.response_code
            .or(self.http_code.map(i64::from))
            .unwrap_or_default()
    }

    /// Build from a decoded JSON body (`Code` / `Error` fields).
    pub fn from_body(http_code: Option<u16>, body: &Value) -> Self {
        let message = body_error(body).unwrap_or_default().to_string();
        Self::new(http_code, body_code(body), message)
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_facing_message)?;
        match (self.http_code, self.response_code) {
            (Some(http), Some(code)) => write!(f, " (http {http}, code {code})")?,
            (Some(http), None) => write!(f, " (http {http})")?,
            (None, Some(code)) => write!(f, " (code {code})")?,
            (None, None) => {}
        }
        if let Some(ref underlying) = self.underlying {
            write!(f, ": {underlying}")?;
        }
        Ok(())
    }
}

/// Integer `Code` field of a response body.
pub fn body_code(body: &Value) -> Option<i64> {
    body.get("Code").and_then(Value::as_i64)
}

/// User-facing `Error` field of a response body.
pub fn body_error(body: &Value) -> Option<&str> {
    body.get("Error").and_then(Value::as_str)
}

/// Successful response delivered to the caller.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    status: u16,
    headers: HeaderMap,
    body: Value,
}

impl ApiResponse {
    pub(crate) fn new(status: u16, headers: HeaderMap, body: Value) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Decoded JSON body; `Value::Null` when the response had no body.
    pub fn json(&self) -> &Value {
        &self.body
    }

    pub fn code(&self) -> Option<i64> {
        body_code(&self.body)
    }

    pub fn is_success_code(&self) -> bool {
        self.code().map(codes::is_success).unwrap_or(true)
    }

    /// Deserialize the body into a typed response.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.body)
    }
}
