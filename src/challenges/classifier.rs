//! Response classification.
//!
//! Maps one completed exchange (or a transport failure) onto the action the
//! executor should take next. Everything here is pure so it can be checked
//! against literal status/body fixtures.

use http::StatusCode;
use serde_json::Value;

use crate::codes;
use crate::core::{ResponseError, body_code, body_error};
use crate::transport::{TransportError, TransportResponse};

/// In-band challenges the backend can answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengeKind {
    HumanVerification,
    ForcedUpgrade,
}

impl ChallengeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeKind::HumanVerification => "human_verification",
            ChallengeKind::ForcedUpgrade => "forced_upgrade",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Success,
    AuthExpired,
    ChallengeRequired(ChallengeKind),
    TransportRetryable,
    TerminalFailure(ResponseError),
}

/// A transport failure together with the routing collaborator's verdict.
#[derive(Debug, Clone, Copy)]
pub struct TransportFault<'a> {
    pub error: &'a TransportError,
    pub routing_solvable: bool,
}

/// Classify one exchange.
///
/// HTTP 401 is authoritative. A body `Code` of 401 only counts when the
/// status itself looks successful or is unknown, which is how transports that
/// mask statuses report it.
pub fn classify(
    http_status: Option<u16>,
    body_code: Option<i64>,
    body_error: Option<&str>,
    transport: Option<TransportFault<'_>>,
    authenticated: bool,
) -> Classification {
    if let Some(fault) = transport {
        if fault.routing_solvable {
            return Classification::TransportRetryable;
        }
        return Classification::TerminalFailure(
            ResponseError::new(http_status, body_code, "The request could not reach the server")
                .with_underlying(fault.error.to_string()),
        );
    }

    if authenticated {
        let status_says_expired = http_status == Some(401);
        let code_says_expired = body_code == Some(codes::AUTH_SESSION_EXPIRED)
            && http_status.is_none_or(|status| (200..300).contains(&status));
        if status_says_expired || code_says_expired {
            return Classification::AuthExpired;
        }
    }

    match body_code {
        Some(codes::HUMAN_VERIFICATION_REQUIRED) => {
            return Classification::ChallengeRequired(ChallengeKind::HumanVerification);
        }
        Some(code) if codes::is_forced_upgrade(code) => {
            return Classification::ChallengeRequired(ChallengeKind::ForcedUpgrade);
        }
        Some(code) if codes::is_success(code) => return Classification::Success,
        None if http_status.is_some_and(|status| (200..300).contains(&status)) => {
            return Classification::Success;
        }
        _ => {}
    }

    Classification::TerminalFailure(ResponseError::new(
        http_status,
        body_code,
        user_facing_message(http_status, body_error),
    ))
}

/// Classify a completed [`TransportResponse`].
pub fn classify_response(response: &TransportResponse, authenticated: bool) -> Classification {
    let body = response.json().unwrap_or(Value::Null);
    classify(
        Some(response.status),
        body_code(&body),
        body_error(&body),
        None,
        authenticated,
    )
}

fn user_facing_message(http_status: Option<u16>, body_error: Option<&str>) -> String {
    if let Some(message) = body_error.filter(|message| !message.is_empty()) {
        return message.to_string();
    }
    http_status
        .and_then(|status| StatusCode::from_u16(status).ok())
        .and_then(|status| status.canonical_reason())
        .unwrap_or("Unknown error")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::HeaderMap;
    use url::Url;

    #[test]
    fn success_sentinels() {
        assert_eq!(classify(Some(200), Some(1000), None, None, true), Classification::Success);
        assert_eq!(classify(Some(200), Some(1001), None, None, false), Classification::Success);
        assert_eq!(classify(Some(204), None, None, None, true), Classification::Success);
    }

    #[test]
    fn http_401_expires_authenticated_requests_only() {
        assert_eq!(classify(Some(401), None, None, None, true), Classification::AuthExpired);
        assert!(matches!(
            classify(Some(401), None, None, None, false),
            Classification::TerminalFailure(ref err) if err.http_code == Some(401)
        ));
    }

    #[test]
    fn body_code_401_is_a_fallback_for_masked_statuses() {
        assert_eq!(classify(Some(200), Some(401), None, None, true), Classification::AuthExpired);
        assert_eq!(classify(None, Some(401), None, None, true), Classification::AuthExpired);
        assert!(matches!(
            classify(Some(422), Some(401), None, None, true),
            Classification::TerminalFailure(_)
        ));
    }

    #[test]
    fn challenge_codes() {
        assert_eq!(
            classify(Some(200), Some(codes::HUMAN_VERIFICATION_REQUIRED), None, None, true),
            Classification::ChallengeRequired(ChallengeKind::HumanVerification)
        );
        assert_eq!(
            classify(Some(400), Some(codes::BAD_APP_VERSION), None, None, true),
            Classification::ChallengeRequired(ChallengeKind::ForcedUpgrade)
        );
        assert_eq!(
            classify(Some(400), Some(codes::BAD_API_VERSION), None, None, false),
            Classification::ChallengeRequired(ChallengeKind::ForcedUpgrade)
        );
    }

    #[test]
    fn other_codes_are_terminal_with_body_message() {
        let Classification::TerminalFailure(error) =
            classify(Some(422), Some(5), Some("boom"), None, true)
        else {
            panic!("expected terminal failure");
        };
        assert_eq!(error.response_code, Some(5));
        assert_eq!(error.http_code, Some(422));
        assert_eq!(error.user_facing_message, "boom");
    }

    #[test]
    fn missing_message_falls_back_to_status_reason() {
        let Classification::TerminalFailure(error) = classify(Some(503), None, None, None, true) else {
            panic!("expected terminal failure");
        };
        assert_eq!(error.user_facing_message, "Service Unavailable");
    }

    #[test]
    fn transport_faults_follow_routing_verdict() {
        let error = TransportError::Timeout("deadline".into());
        assert_eq!(
            classify(
                None,
                None,
                None,
                Some(TransportFault {
                    error: &error,
                    routing_solvable: true
                }),
                true
            ),
            Classification::TransportRetryable
        );

        let Classification::TerminalFailure(terminal) = classify(
            None,
            None,
            None,
            Some(TransportFault {
                error: &error,
                routing_solvable: false,
            }),
            true,
        ) else {
            panic!("expected terminal failure");
        };
        assert_eq!(terminal.underlying.as_deref(), Some("request timed out: deadline"));
    }

    #[test]
    fn classifies_transport_responses() {
        let response = TransportResponse {
            status: 200,
            headers: HeaderMap::new(),
            body: Bytes::from_static(br#"{"Code":9001,"Error":"Human verification required"}"#),
            url: Url::parse("https://mail.example.com/api/core/v4/users").unwrap(),
        };
        assert_eq!(
            classify_response(&response, true),
            Classification::ChallengeRequired(ChallengeKind::HumanVerification)
        );
    }
}
