//! Service configuration.
//!
//! Every field has a default, so a partial JSON document is enough:
//!
//! ```
//! use mailapi_rs::ApiServiceConfig;
//!
//! let config = ApiServiceConfig::from_json_str(r#"{"app_version": "web-mail@5.0.1"}"#).unwrap();
//! assert_eq!(config.locale, "en_US");
//! assert_eq!(config.auth_retry_budget, 10);
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::ClientIdentity;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiServiceConfig {
    pub app_version: String,
    pub user_agent: Option<String>,
    pub locale: String,
    pub additional_headers: HashMap<String, String>,
    /// How many 401-driven retries one logical request may perform.
    pub auth_retry_budget: u32,
    /// How many refresh round trips one refresh may perform when the backend
    /// reports a local cache inconsistency.
    pub refresh_attempts: u32,
    /// Request timeout when no alternative routing is active. Active routing
    /// halves it unless a request sets its own.
    pub default_timeout_secs: u64,
    /// Safety cap on routing retries for one logical request.
    pub max_routing_retries: u32,
    /// When off, a rejected refresh always logs the session out, even for
    /// anonymous sessions.
    pub support_unauthenticated_sessions: bool,
    pub enable_metrics: bool,
    pub refresh_path: String,
    pub sessions_path: String,
}

impl Default for ApiServiceConfig {
    fn default() -> Self {
        Self {
            app_version: "Other".into(),
            user_agent: None,
            locale: "en_US".into(),
            additional_headers: HashMap::new(),
            auth_retry_budget: 10,
            refresh_attempts: 3,
            default_timeout_secs: 60,
            max_routing_retries: 5,
            support_unauthenticated_sessions: true,
            enable_metrics: true,
            refresh_path: "/auth/v4/refresh".into(),
            sessions_path: "/auth/v4/sessions".into(),
        }
    }
}

impl ApiServiceConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_timeout_secs == 0 {
            return Err(ConfigError::Invalid("default_timeout_secs must be positive".into()));
        }
        for path in [&self.refresh_path, &self.sessions_path] {
            if !path.starts_with('/') {
                return Err(ConfigError::Invalid(format!("path '{path}' must start with '/'")));
            }
        }
        Ok(())
    }

    /// Timeout for requests that do not set their own.
    pub fn default_timeout(&self, routing_active: bool) -> Duration {
        let secs = if routing_active {
            (self.default_timeout_secs / 2).max(1)
        } else {
            self.default_timeout_secs
        };
        Duration::from_secs(secs)
    }

    /// Whether `path` targets the token refresh endpoint.
    pub fn is_refresh_path(&self, path: &str) -> bool {
        let bare = path.split('?').next().unwrap_or(path);
        bare.contains("/auth/refresh") || bare == self.refresh_path
    }

    pub fn identity(&self) -> ClientIdentity {
        ClientIdentity {
            app_version: self.app_version.clone(),
            user_agent: self.user_agent.clone(),
            locale: self.locale.clone(),
            additional_headers: self.additional_headers.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_keep_defaults() {
        let config = ApiServiceConfig::from_json_str(
            r#"{"locale": "fr_FR", "auth_retry_budget": 2, "additional_headers": {"x-pm-client": "cli"}}"#,
        )
        .unwrap();
        assert_eq!(config.locale, "fr_FR");
        assert_eq!(config.auth_retry_budget, 2);
        assert_eq!(config.refresh_attempts, 3);
        assert_eq!(config.app_version, "Other");
        assert_eq!(config.identity().additional_headers["x-pm-client"], "cli");
    }

    #[test]
    fn rejects_invalid_documents() {
        assert!(matches!(
            ApiServiceConfig::from_json_str("{not json"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            ApiServiceConfig::from_json_str(r#"{"refresh_path": "auth/v4/refresh"}"#),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn timeout_shrinks_with_active_routing() {
        let config = ApiServiceConfig::default();
        assert_eq!(config.default_timeout(false), Duration::from_secs(60));
        assert_eq!(config.default_timeout(true), Duration::from_secs(30));
    }

    #[test]
    fn recognises_refresh_paths() {
        let config = ApiServiceConfig::default();
        assert!(config.is_refresh_path("/auth/v4/refresh"));
        assert!(config.is_refresh_path("/auth/refresh?x=1"));
        assert!(!config.is_refresh_path("/auth/v4/sessions"));
    }
}
