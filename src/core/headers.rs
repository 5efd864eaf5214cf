//! Standard outgoing header composition.

use std::collections::HashMap;

use http::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use http::{HeaderMap, HeaderName, HeaderValue};
use once_cell::sync::Lazy;
use thiserror::Error;

use super::types::Credential;

pub const HEADER_SESSION_ID: &str = "x-pm-uid";
pub const HEADER_APP_VERSION: &str = "x-pm-appversion";
pub const HEADER_LOCALE: &str = "x-pm-locale";
pub const ACCEPT_API_V1: &str = "application/vnd.protonmail.v1+json";

pub const HEADER_HV_TOKEN: &str = "x-pm-human-verification-token";
pub const HEADER_HV_TOKEN_TYPE: &str = "x-pm-human-verification-token-type";

static DEFAULT_USER_AGENT: Lazy<String> = Lazy::new(|| {
    format!(
        "mailapi-rs/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
});

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid header '{0}'")]
pub struct InvalidHeader(pub String);

/// Who the client claims to be on every request.
#[derive(Debug, Clone, Default)]
pub struct ClientIdentity {
    pub app_version: String,
    pub user_agent: Option<String>,
    pub locale: String,
    pub additional_headers: HashMap<String, String>,
}

impl ClientIdentity {
    fn user_agent(&self) -> &str {
        match self.user_agent.as_deref() {
            Some(agent) if !agent.is_empty() => agent,
            _ => DEFAULT_USER_AGENT.as_str(),
        }
    }

    fn locale(&self) -> &str {
        if self.locale.is_empty() { "en_US" } else { &self.locale }
    }
}

/// Header sources for one attempt, in increasing precedence.
#[derive(Debug, Clone, Copy)]
pub struct HeaderLayers<'a> {
    pub credential: Option<&'a Credential>,
    pub routing: &'a HashMap<String, String>,
    pub caller: &'a HashMap<String, String>,
    pub challenge: &'a HashMap<String, String>,
}

/// Build the header map for one attempt.
///
/// Standard headers go first, then routing and service-wide extras, then the
/// caller's own headers, and finally the tokens a challenge resolution asked
/// to merge in.
pub fn compose_headers(
    identity: &ClientIdentity,
    layers: HeaderLayers<'_>,
) -> Result<HeaderMap, InvalidHeader> {
    let mut headers = HeaderMap::new();

    insert(&mut headers, USER_AGENT.as_str(), identity.user_agent())?;
    insert(&mut headers, HEADER_LOCALE, identity.locale())?;
    insert(&mut headers, HEADER_APP_VERSION, &identity.app_version)?;
    insert(&mut headers, ACCEPT.as_str(), ACCEPT_API_V1)?;

    if let Some(credential) = layers.credential {
        if !credential.access_token.is_empty() {
            insert(
                &mut headers,
                AUTHORIZATION.as_str(),
                &format!("Bearer {}", credential.access_token),
            )?;
        }
        if !credential.session_id.is_empty() {
            insert(&mut headers, HEADER_SESSION_ID, &credential.session_id)?;
        }
    }

    for source in [
        layers.routing,
        &identity.additional_headers,
        layers.caller,
        layers.challenge,
    ] {
        for (name, value) in source {
            insert(&mut headers, name, value)?;
        }
    }

    Ok(headers)
}

fn insert(headers: &mut HeaderMap, name: &str, value: &str) -> Result<(), InvalidHeader> {
    let header_name =
        HeaderName::from_bytes(name.as_bytes()).map_err(|_| InvalidHeader(name.to_string()))?;
    let header_value = HeaderValue::from_str(value).map_err(|_| InvalidHeader(name.to_string()))?;
    headers.insert(header_name, header_value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ClientIdentity {
        ClientIdentity {
            app_version: "ios-mail@4.0.0".into(),
            user_agent: None,
            locale: String::new(),
            additional_headers: HashMap::new(),
        }
    }

    #[test]
    fn attaches_standard_and_credential_headers() {
        let credential = Credential::new("uid-1", "token-1", "refresh-1");
        let empty = HashMap::new();
        let headers = compose_headers(
            &identity(),
            HeaderLayers {
                credential: Some(&credential),
                routing: &empty,
                caller: &empty,
                challenge: &empty,
            },
        )
        .unwrap();

        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer token-1");
        assert_eq!(headers.get(HEADER_SESSION_ID).unwrap(), "uid-1");
        assert_eq!(headers.get(HEADER_LOCALE).unwrap(), "en_US");
        assert_eq!(headers.get(HEADER_APP_VERSION).unwrap(), "ios-mail@4.0.0");
        assert_eq!(headers.get(ACCEPT).unwrap(), ACCEPT_API_V1);
        assert!(headers.get(USER_AGENT).unwrap().to_str().unwrap().starts_with("mailapi-rs/"));
    }

    #[test]
    fn later_layers_take_precedence() {
        let empty = HashMap::new();
        let caller = HashMap::from([(HEADER_LOCALE.to_string(), "fr_FR".to_string())]);
        let challenge = HashMap::from([(HEADER_HV_TOKEN.to_string(), "captcha-token".to_string())]);
        let headers = compose_headers(
            &identity(),
            HeaderLayers {
                credential: None,
                routing: &empty,
                caller: &caller,
                challenge: &challenge,
            },
        )
        .unwrap();

        assert_eq!(headers.get(HEADER_LOCALE).unwrap(), "fr_FR");
        assert_eq!(headers.get(HEADER_HV_TOKEN).unwrap(), "captcha-token");
        assert!(headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn rejects_invalid_header_names() {
        let empty = HashMap::new();
        let caller = HashMap::from([("bad header".to_string(), "x".to_string())]);
        let err = compose_headers(
            &identity(),
            HeaderLayers {
                credential: None,
                routing: &empty,
                caller: &caller,
                challenge: &empty,
            },
        )
        .unwrap_err();
        assert_eq!(err, InvalidHeader("bad header".into()));
    }
}
