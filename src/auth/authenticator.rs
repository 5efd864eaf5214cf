//! Network round trips that mint credentials.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::codes;
use crate::core::headers::HEADER_SESSION_ID;
use crate::core::{
    ClientIdentity, Credential, HeaderLayers, RequestSpec, ResponseError, body_code, compose_headers,
};
use crate::routing::RoutingResolver;
use crate::transport::{Transport, TransportResponse, build_request};

/// Performs refreshes and anonymous session acquisition against the backend.
#[async_trait]
pub trait SessionAuthenticator: Send + Sync {
    /// Exchange `credential`'s refresh token for a new token pair.
    async fn refresh_credential(&self, credential: &Credential) -> Result<Credential, ResponseError>;

    /// Obtain a brand-new anonymous session.
    async fn acquire_unauthenticated_session(&self) -> Result<Credential, ResponseError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TokenResponse {
    #[serde(rename = "UID", default)]
    uid: Option<String>,
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    scopes: Option<Vec<String>>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    fn scopes(&self) -> Vec<String> {
        if let Some(ref scopes) = self.scopes {
            return scopes.clone();
        }
        self.scope
            .as_deref()
            .map(|scope| scope.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// [`SessionAuthenticator`] speaking the backend's JSON auth endpoints.
///
/// Requests go to the routing collaborator's current base URL and carry the
/// standard client headers, but never a bearer token.
pub struct HttpSessionAuthenticator {
    transport: Arc<dyn Transport>,
    routing: Arc<dyn RoutingResolver>,
    identity: ClientIdentity,
    refresh_path: String,
    sessions_path: String,
    timeout: Duration,
}

impl HttpSessionAuthenticator {
    pub fn new(
        transport: Arc<dyn Transport>,
        routing: Arc<dyn RoutingResolver>,
        identity: ClientIdentity,
        refresh_path: impl Into<String>,
        sessions_path: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            routing,
            identity,
            refresh_path: refresh_path.into(),
            sessions_path: sessions_path.into(),
            timeout,
        }
    }

    async fn post(&self, spec: RequestSpec) -> Result<TransportResponse, ResponseError> {
        let empty = HashMap::new();
        let routing_headers = self.routing.routing_headers();
        let headers = compose_headers(
            &self.identity,
            HeaderLayers {
                credential: None,
                routing: &routing_headers,
                caller: &spec.headers,
                challenge: &empty,
            },
        )
        .map_err(|err| ResponseError::new(None, None, "Invalid auth request").with_underlying(err.to_string()))?;

        let base_url = self.routing.current_base_url();
        let request = build_request(&base_url, &spec, headers, self.timeout)
            .map_err(|err| ResponseError::new(None, None, "Invalid auth request").with_underlying(err.to_string()))?;

        let response = self.transport.send(request).await.map_err(|err| {
            ResponseError::new(None, None, "The request could not reach the server")
                .with_underlying(err.to_string())
        })?;
        self.routing.on_request_completed(&base_url);
        Ok(response)
    }

    fn parse_tokens(response: &TransportResponse) -> Result<TokenResponse, ResponseError> {
        let body = response.json().unwrap_or(Value::Null);
        let code = body_code(&body);
        let ok_status = (200..300).contains(&response.status);
        if !ok_status || code.is_some_and(|code| !codes::is_success(code)) {
            return Err(ResponseError::from_body(Some(response.status), &body));
        }

        TokenResponse::deserialize(&body).map_err(|err| {
            ResponseError::new(Some(response.status), code, "Malformed auth response")
                .with_underlying(err.to_string())
        })
    }
}

#[async_trait]
impl SessionAuthenticator for HttpSessionAuthenticator {
    async fn refresh_credential(&self, credential: &Credential) -> Result<Credential, ResponseError> {
        let spec = RequestSpec::post(self.refresh_path.clone())
            .with_parameters(json!({
                "ResponseType": "token",
                "GrantType": "refresh_token",
                "RefreshToken": credential.refresh_token,
                "RedirectURI": "http://protonmail.ch",
            }))
            .with_header(HEADER_SESSION_ID, credential.session_id.clone());

        let response = self.post(spec).await?;
        let tokens = Self::parse_tokens(&response)?;

        let scopes = tokens.scopes();
        let mut refreshed = credential.clone();
        if let Some(uid) = tokens.uid.filter(|uid| !uid.is_empty()) {
            refreshed.session_id = uid;
        }
        refreshed.access_token = tokens.access_token;
        refreshed.refresh_token = tokens.refresh_token;
        if !scopes.is_empty() {
            refreshed.scopes = scopes;
        }
        Ok(refreshed)
    }

    async fn acquire_unauthenticated_session(&self) -> Result<Credential, ResponseError> {
        let spec = RequestSpec::post(self.sessions_path.clone());
        let response = self.post(spec).await?;
        let tokens = Self::parse_tokens(&response)?;

        let scopes = tokens.scopes();
        let Some(uid) = tokens.uid.filter(|uid| !uid.is_empty()) else {
            return Err(ResponseError::new(
                Some(response.status),
                None,
                "Session response carried no UID",
            ));
        };
        Ok(Credential::unauthenticated(uid, tokens.access_token, tokens.refresh_token).with_scopes(scopes))
    }
}

impl std::fmt::Debug for HttpSessionAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSessionAuthenticator")
            .field("refresh_path", &self.refresh_path)
            .field("sessions_path", &self.sessions_path)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::StaticRouting;
    use crate::transport::{TransportError, TransportRequest};
    use bytes::Bytes;
    use std::sync::Mutex;

    struct StubTransport {
        status: u16,
        body: Value,
        seen: Mutex<Vec<TransportRequest>>,
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
            let url = request.url.clone();
            self.seen.lock().unwrap().push(request);
            Ok(TransportResponse {
                status: self.status,
                headers: http::HeaderMap::new(),
                body: Bytes::from(serde_json::to_vec(&self.body).unwrap()),
                url,
            })
        }
    }

    fn authenticator(status: u16, body: Value) -> (HttpSessionAuthenticator, Arc<StubTransport>) {
        let transport = Arc::new(StubTransport {
            status,
            body,
            seen: Mutex::new(Vec::new()),
        });
        let authenticator = HttpSessionAuthenticator::new(
            transport.clone(),
            Arc::new(StaticRouting::new("https://mail.example.com/api")),
            ClientIdentity::default(),
            "/auth/v4/refresh",
            "/auth/v4/sessions",
            Duration::from_secs(10),
        );
        (authenticator, transport)
    }

    #[tokio::test]
    async fn refresh_posts_refresh_token_and_keeps_session() {
        let (authenticator, transport) = authenticator(
            200,
            json!({"Code": 1000, "AccessToken": "a2", "RefreshToken": "r2", "Scope": "full self"}),
        );
        let refreshed = authenticator
            .refresh_credential(&Credential::new("uid-1", "a1", "r1"))
            .await
            .unwrap();

        assert_eq!(refreshed.session_id, "uid-1");
        assert_eq!(refreshed.access_token, "a2");
        assert_eq!(refreshed.scopes, vec!["full".to_string(), "self".to_string()]);

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].url.path(), "/api/auth/v4/refresh");
        assert_eq!(seen[0].headers.get(HEADER_SESSION_ID).unwrap(), "uid-1");
        assert!(seen[0].headers.get(http::header::AUTHORIZATION).is_none());
        let body: Value = serde_json::from_slice(seen[0].body.as_ref().unwrap()).unwrap();
        assert_eq!(body["RefreshToken"], "r1");
        assert_eq!(body["GrantType"], "refresh_token");
    }

    #[tokio::test]
    async fn refresh_rejection_keeps_http_code() {
        let (authenticator, _) = authenticator(422, json!({"Code": 10013, "Error": "Invalid refresh token"}));
        let error = authenticator
            .refresh_credential(&Credential::new("uid-1", "a1", "r1"))
            .await
            .unwrap_err();
        assert_eq!(error.http_code, Some(422));
        assert_eq!(error.response_code, Some(10013));
    }

    #[tokio::test]
    async fn acquires_unauthenticated_session() {
        let (authenticator, _) = authenticator(
            200,
            json!({"Code": 1000, "UID": "anon-1", "AccessToken": "a", "RefreshToken": "r", "Scopes": ["unauth"]}),
        );
        let credential = authenticator.acquire_unauthenticated_session().await.unwrap();
        assert!(credential.is_unauthenticated_session);
        assert_eq!(credential.session_id, "anon-1");
        assert_eq!(credential.scopes, vec!["unauth".to_string()]);
    }
}
