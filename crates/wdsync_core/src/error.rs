use serde_json::Value;
use thiserror::Error;

use crate::merge::MergeError;

pub type Result<T> = std::result::Result<T, WikidotError>;

/// A failed envelope returned by the AJAX connector.
#[derive(Debug, Clone)]
pub struct ProtocolFailure {
    pub site: String,
    pub status: String,
    pub message: Option<String>,
    pub body: Option<Value>,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("login dialog cancelled")]
    Cancelled,
    #[error("login response did not set a session cookie")]
    MissingSessionCookie,
}

#[derive(Debug, Error)]
pub enum WikidotError {
    #[error("request to {url} failed: {message}")]
    Transport {
        url: String,
        status: Option<u16>,
        message: String,
    },

    #[error(
        "wikidot returned `{}` for {}: {}",
        .0.status,
        .0.site,
        .0.message.as_deref().unwrap_or("no message")
    )]
    Protocol(Box<ProtocolFailure>),

    #[error("could not lock {page} on {site} ({status}): {}", .message.as_deref().unwrap_or("no message"))]
    Lock {
        site: String,
        page: String,
        status: String,
        message: Option<String>,
    },

    #[error("page {page} does not exist on {site}")]
    NotFound { site: String, page: String },

    #[error("authentication failed: {0}")]
    Auth(AuthFailure),

    #[error("{0} cancelled")]
    Cancelled(String),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("malformed document: {0}")]
    Document(String),
}

impl WikidotError {
    pub fn protocol(&self) -> Option<&ProtocolFailure> {
        match self {
            Self::Protocol(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn is_protocol_status(&self, status: &str) -> bool {
        self.protocol()
            .is_some_and(|failure| failure.status == status)
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Cancelled(_) | Self::Auth(AuthFailure::Cancelled)
        )
    }
}

impl From<anyhow::Error> for WikidotError {
    fn from(error: anyhow::Error) -> Self {
        Self::Storage(format!("{error:#}"))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn protocol_status_matching() {
        let error = WikidotError::Protocol(Box::new(ProtocolFailure {
            site: "http://sandbox.wikidot.com".to_string(),
            status: "not_ok".to_string(),
            message: Some("boom".to_string()),
            body: None,
            raw: json!({"status": "not_ok"}),
        }));
        assert!(error.is_protocol_status("not_ok"));
        assert!(!error.is_protocol_status("ok"));
        assert!(error.to_string().contains("sandbox.wikidot.com"));
    }

    #[test]
    fn cancelled_login_counts_as_cancellation() {
        assert!(WikidotError::Auth(AuthFailure::Cancelled).is_cancellation());
        assert!(!WikidotError::Auth(AuthFailure::MissingSessionCookie).is_cancellation());
    }

    #[test]
    fn auth_failures_render_through_the_outer_error() {
        assert_eq!(
            WikidotError::Auth(AuthFailure::MissingSessionCookie).to_string(),
            "authentication failed: login response did not set a session cookie"
        );
        assert_eq!(AuthFailure::Cancelled.to_string(), "login dialog cancelled");
    }
}
