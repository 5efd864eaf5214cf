//! Reqwest-based implementation of the [`Transport`] trait.
//!
//! A thin adapter around `reqwest::Client` that maps reqwest failures onto
//! [`TransportError`] so the routing layer can reason about them.

use std::error::Error as StdError;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, redirect::Policy};

use super::{Transport, TransportError, TransportRequest, TransportResponse};
use crate::core::RetryPolicy;

/// Reqwest-backed transport with a persistent cookie store.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Creates a client with cookies enabled and a small redirect budget.
    pub fn new() -> Result<Self, TransportError> {
        let client = Client::builder()
            .redirect(Policy::limited(5))
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|err| TransportError::Other(err.to_string()))?;

        Ok(Self { client })
    }

    /// Wrap an existing reqwest client, e.g. one with pinned certificates.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method, request.url.as_str())
            .headers(request.headers)
            .timeout(request.timeout);

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let attempts = match request.retry_policy {
            RetryPolicy::UserInitiated => 1,
            RetryPolicy::Background => 2,
        };

        let mut last_error = None;
        for attempt in 0..attempts {
            let Some(prepared) = builder.try_clone() else {
                // Streaming bodies cannot be replayed.
                return execute(builder).await;
            };
            match execute(prepared).await {
                Ok(response) => return Ok(response),
                Err(err @ TransportError::Connect(_)) if attempt + 1 < attempts => {
                    log::debug!("Connection failed, retrying in background mode: {}", err);
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or_else(|| TransportError::Other("no attempt was made".into())))
    }
}

async fn execute(builder: reqwest::RequestBuilder) -> Result<TransportResponse, TransportError> {
    let response = builder.send().await.map_err(map_error)?;

    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let url = response.url().clone();
    let body = response.bytes().await.map_err(map_error)?;

    Ok(TransportResponse {
        status,
        headers,
        body,
        url,
    })
}

fn map_error(err: reqwest::Error) -> TransportError {
    let message = error_chain(&err);
    if err.is_timeout() {
        TransportError::Timeout(message)
    } else if looks_like_tls(&message) {
        TransportError::Tls(message)
    } else if err.is_connect() {
        TransportError::Connect(message)
    } else {
        TransportError::Other(message)
    }
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn looks_like_tls(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("certificate") || lowered.contains("handshake") || lowered.contains("tls")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_failures_are_detected_from_the_chain() {
        assert!(looks_like_tls("error trying to connect: invalid peer certificate"));
        assert!(looks_like_tls("TLS handshake eof"));
        assert!(!looks_like_tls("connection refused"));
    }
}
