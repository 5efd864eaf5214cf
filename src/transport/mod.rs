//! HTTP transport abstraction.
//!
//! The orchestration layer never talks to a concrete HTTP stack directly; it
//! hands a fully built [`TransportRequest`] to a [`Transport`] and receives
//! either a completed exchange or a [`TransportError`]. TLS, pooling, and
//! cookie storage stay behind this seam.

pub mod reqwest_client;

pub use reqwest_client::ReqwestTransport;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{CONTENT_TYPE, DATE, HeaderValue};
use http::{HeaderMap, Method};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::core::{RequestSpec, RetryPolicy};

/// Contract that abstracts the underlying HTTP transport.
///
/// Implementations should keep cookies and other connection state between
/// calls so consecutive attempts of one logical request behave consistently.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// One attempt, ready to go on the wire.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl TransportRequest {
    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }
}

/// Completed exchange as seen by the orchestration layer.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub url: Url,
}

impl TransportResponse {
    /// Decoded JSON body. Empty or non-JSON bodies yield `None`.
    pub fn json(&self) -> Option<Value> {
        if self.body.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.body).ok()
    }

    /// Server clock as reported by the `Date` header.
    pub fn server_date(&self) -> Option<DateTime<Utc>> {
        let raw = self.headers.get(DATE)?.to_str().ok()?;
        DateTime::parse_from_rfc2822(raw.trim())
            .ok()
            .map(|date| date.with_timezone(&Utc))
    }
}

/// Network-level failures. Anything that produced an HTTP status is a
/// [`TransportResponse`] instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("tls failure: {0}")]
    Tls(String),
    #[error("http transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether the failure happened before any byte reached the backend.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_) | TransportError::Connect(_) | TransportError::Tls(_)
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestBuildError {
    #[error("invalid url '{0}'")]
    InvalidUrl(String),
    #[error("failed to encode parameters: {0}")]
    Parameters(String),
}

/// Turn a [`RequestSpec`] into a wire request against `base_url`.
///
/// Parameters travel in the query string for GET/DELETE/HEAD and as a JSON
/// body otherwise. A raw body (uploads) always wins over JSON parameters,
/// which then move to the query string.
pub fn build_request(
    base_url: &str,
    spec: &RequestSpec,
    mut headers: HeaderMap,
    timeout: Duration,
) -> Result<TransportRequest, RequestBuildError> {
    let joined = format!("{}{}", base_url.trim_end_matches('/'), spec.path);
    let mut url = Url::parse(&joined).map_err(|_| RequestBuildError::InvalidUrl(joined.clone()))?;

    let query_parameters = matches!(spec.method, Method::GET | Method::DELETE | Method::HEAD)
        || spec.body.is_some();

    let mut body = None;
    if let Some(ref parameters) = spec.parameters {
        if query_parameters {
            append_query(&mut url, parameters)?;
        } else {
            let encoded = serde_json::to_vec(parameters)
                .map_err(|err| RequestBuildError::Parameters(err.to_string()))?;
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            body = Some(Bytes::from(encoded));
        }
    }

    if let Some(ref raw) = spec.body {
        let content_type = HeaderValue::from_str(&raw.content_type)
            .map_err(|_| RequestBuildError::Parameters(raw.content_type.clone()))?;
        headers.insert(CONTENT_TYPE, content_type);
        body = Some(raw.data.clone());
    }

    Ok(TransportRequest {
        method: spec.method.clone(),
        url,
        headers,
        body,
        timeout,
        retry_policy: spec.retry_policy,
    })
}

fn append_query(url: &mut Url, parameters: &Value) -> Result<(), RequestBuildError> {
    let Value::Object(map) = parameters else {
        return Err(RequestBuildError::Parameters(
            "query parameters must be a JSON object".into(),
        ));
    };

    let mut pairs = url.query_pairs_mut();
    for (key, value) in map {
        match value {
            Value::Null => {}
            Value::String(text) => {
                pairs.append_pair(key, text);
            }
            Value::Array(items) => {
                for item in items {
                    pairs.append_pair(&format!("{key}[]"), &scalar(item));
                }
            }
            other => {
                pairs.append_pair(key, &scalar(other));
            }
        }
    }
    drop(pairs);

    if url.query() == Some("") {
        url.set_query(None);
    }
    Ok(())
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RequestBody;
    use serde_json::json;

    #[test]
    fn get_parameters_go_to_query() {
        let spec = RequestSpec::get("/mail/v4/messages")
            .with_parameters(json!({"Page": 1, "LabelID": ["0", "5"], "Desc": true}));
        let request =
            build_request("https://mail.example.com/api/", &spec, HeaderMap::new(), Duration::from_secs(30))
                .unwrap();

        let query = request.url.query().unwrap();
        assert!(query.contains("Page=1"));
        assert!(query.contains("Desc=true"));
        assert!(query.contains("LabelID%5B%5D=0"));
        assert_eq!(request.url.path(), "/api/mail/v4/messages");
        assert!(request.body.is_none());
    }

    #[test]
    fn post_parameters_go_to_json_body() {
        let spec = RequestSpec::post("/core/v4/settings").with_parameters(json!({"Locale": "de_DE"}));
        let request =
            build_request("https://mail.example.com/api", &spec, HeaderMap::new(), Duration::from_secs(30))
                .unwrap();

        assert_eq!(request.headers.get(CONTENT_TYPE).unwrap(), "application/json");
        let body: Value = serde_json::from_slice(request.body.as_ref().unwrap()).unwrap();
        assert_eq!(body, json!({"Locale": "de_DE"}));
    }

    #[test]
    fn raw_body_moves_parameters_to_query() {
        let spec = RequestSpec::post("/core/v4/attachments")
            .with_parameters(json!({"MessageID": "m1"}))
            .with_body(RequestBody::new("application/octet-stream", vec![1u8, 2, 3]));
        let request =
            build_request("https://mail.example.com/api", &spec, HeaderMap::new(), Duration::from_secs(30))
                .unwrap();

        assert_eq!(request.url.query(), Some("MessageID=m1"));
        assert_eq!(request.body.as_deref(), Some(&[1u8, 2, 3][..]));
        assert_eq!(
            request.headers.get(CONTENT_TYPE).unwrap(),
            "application/octet-stream"
        );
    }

    #[test]
    fn parses_server_date() {
        let mut headers = HeaderMap::new();
        headers.insert(DATE, HeaderValue::from_static("Tue, 15 Nov 1994 08:12:31 GMT"));
        let response = TransportResponse {
            status: 200,
            headers,
            body: Bytes::new(),
            url: Url::parse("https://mail.example.com").unwrap(),
        };
        assert_eq!(response.server_date().unwrap().timestamp(), 784887151);
        assert!(response.json().is_none());
    }
}
