//! Human verification and forced upgrade collaborators.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::ResponseError;

/// Verification method offered by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VerifyMethod {
    Captcha,
    Sms,
    Email,
    Other(String),
}

impl VerifyMethod {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "captcha" => VerifyMethod::Captcha,
            "sms" => VerifyMethod::Sms,
            "email" => VerifyMethod::Email,
            other => VerifyMethod::Other(other.to_string()),
        }
    }
}

/// Challenge parameters parsed from the `Details` object of a 9001 body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HumanVerificationParameters {
    pub methods: Vec<VerifyMethod>,
    pub start_token: Option<String>,
    pub title: Option<String>,
}

impl HumanVerificationParameters {
    pub fn from_body(body: &Value) -> Self {
        let Some(details) = body.get("Details") else {
            return Self::default();
        };

        let methods = details
            .get("HumanVerificationMethods")
            .and_then(Value::as_array)
            .map(|methods| {
                methods
                    .iter()
                    .filter_map(Value::as_str)
                    .map(VerifyMethod::parse)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            methods,
            start_token: details
                .get("HumanVerificationToken")
                .and_then(Value::as_str)
                .map(str::to_string),
            title: details.get("Title").and_then(Value::as_str).map(str::to_string),
        }
    }
}

/// How the verification UI finished.
pub enum VerificationOutcome {
    /// Dismissed. The original response goes back to the caller.
    Close,
    /// Dismissed with an explicit error to report instead.
    CloseWithError { code: i64, description: String },
    /// Tokens obtained. The request is re-issued with `headers` merged in and
    /// its result reported to `submission`.
    Verification {
        headers: HashMap<String, String>,
        submission: Option<Arc<dyn CodeSubmissionHandler>>,
    },
}

impl fmt::Debug for VerificationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationOutcome::Close => write!(f, "Close"),
            VerificationOutcome::CloseWithError { code, description } => f
                .debug_struct("CloseWithError")
                .field("code", code)
                .field("description", description)
                .finish(),
            VerificationOutcome::Verification { headers, submission } => f
                .debug_struct("Verification")
                .field("headers", &headers.keys().collect::<Vec<_>>())
                .field("submission", &submission.is_some())
                .finish(),
        }
    }
}

/// Verification UI collaborator.
#[async_trait]
pub trait HumanVerificationDelegate: Send + Sync {
    /// Show the challenge and resolve once the user is done with it.
    /// `current_url` is the request path without its query string.
    async fn present_challenge(
        &self,
        parameters: HumanVerificationParameters,
        current_url: Option<&str>,
    ) -> VerificationOutcome;
}

/// Receives the verdict on tokens returned by a `Verification` outcome.
#[async_trait]
pub trait CodeSubmissionHandler: Send + Sync {
    async fn accepted(&self);

    /// The backend refused the tokens. The returned outcome decides what
    /// happens next; another `Verification` keeps the session open.
    async fn rejected(&self, error: &ResponseError) -> VerificationOutcome;
}

/// Told when the backend refuses the client version.
pub trait ForceUpgradeDelegate: Send + Sync {
    fn notify(&self, minimum_version_message: &str);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_details() {
        let body = json!({
            "Code": 9001,
            "Error": "Human verification required",
            "Details": {
                "HumanVerificationMethods": ["captcha", "email", "payment"],
                "HumanVerificationToken": "start-token",
                "Title": "Verify"
            }
        });
        let params = HumanVerificationParameters::from_body(&body);
        assert_eq!(
            params.methods,
            vec![
                VerifyMethod::Captcha,
                VerifyMethod::Email,
                VerifyMethod::Other("payment".into())
            ]
        );
        assert_eq!(params.start_token.as_deref(), Some("start-token"));
        assert_eq!(params.title.as_deref(), Some("Verify"));
    }

    #[test]
    fn missing_details_yield_defaults() {
        let params = HumanVerificationParameters::from_body(&json!({"Code": 9001}));
        assert_eq!(params, HumanVerificationParameters::default());
    }
}
