//! Remote portal API consumed by pull, push, the scheduler probe and the cache.

mod http;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::models::{HttpMethod, QueueHeaders, ResourceKind};
use crate::util::compact_text;

pub use http::HttpRemote;

/// Health endpoint used as the reachability probe
pub const HEALTH_PATH: &str = "/api/health";

/// Failure talking to the remote API
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Credential rejected: {0}")]
    Unauthorized(String),
    /// HTTP 409; carries the server's current record when it sent one
    #[error("Rejected as conflicting: {message}")]
    Conflict {
        message: String,
        server_value: Option<serde_json::Value>,
    },
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    /// Transient failures that a later attempt may get past.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::Unauthorized(_) | Self::Conflict { .. } | Self::InvalidResponse(_) => false,
        }
    }

    /// Map a non-success response to an error.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = parse_api_error(status, body);
        match status {
            StatusCode::UNAUTHORIZED => Self::Unauthorized(message),
            StatusCode::CONFLICT => Self::Conflict {
                message,
                server_value: conflict_server_value(body),
            },
            _ => Self::Status {
                status: status.as_u16(),
                message,
            },
        }
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// One replayed write or ad-hoc request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRequest {
    pub method: HttpMethod,
    /// Path relative to the API base, e.g. `/api/leaves/42`
    pub path: String,
    pub body: Option<serde_json::Value>,
    pub headers: QueueHeaders,
    pub timeout: Duration,
}

/// Successful response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResponse {
    pub status: u16,
    /// Decoded JSON body; `None` for empty bodies (204)
    pub body: Option<serde_json::Value>,
}

/// Source of the bearer credential. Token issuance lives elsewhere.
pub trait CredentialSource: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// Fixed credential, mostly for tests and the CLI's env-var path
#[derive(Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token.map(|token| token.trim().to_string()).filter(|token| !token.is_empty()))
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_tuple("StaticToken")
            .field(&self.0.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl CredentialSource for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Operations the sync core needs from the remote store
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Whether a credential is available at all
    fn has_credential(&self) -> bool;

    /// Reachability probe; never fails, only answers
    async fn probe(&self) -> bool;

    /// Records of `kind` changed since `since` (Unix ms), or all when `None`
    async fn fetch_since(
        &self,
        kind: ResourceKind,
        since: Option<i64>,
        timeout: Duration,
    ) -> TransportResult<Vec<serde_json::Value>>;

    /// Send a request; non-success statuses come back as errors
    async fn send(&self, request: RemoteRequest) -> TransportResult<RemoteResponse>;

    /// Plain GET of a path with an optional query string
    async fn get(&self, path_and_query: &str, timeout: Duration)
        -> TransportResult<serde_json::Value>;
}

/// Pull the record list out of a collection response.
///
/// Accepts a bare array or an object wrapping it under `data`, `records`,
/// `items` or the collection's own name.
pub fn extract_records(
    kind: ResourceKind,
    body: serde_json::Value,
) -> TransportResult<Vec<serde_json::Value>> {
    let collection = kind
        .collection_path()
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();

    match body {
        serde_json::Value::Array(records) => Ok(records),
        serde_json::Value::Object(mut object) => {
            for key in ["data", "records", "items", collection.as_str()] {
                match object.remove(key) {
                    Some(serde_json::Value::Array(records)) => return Ok(records),
                    Some(nested @ serde_json::Value::Object(_)) => {
                        return extract_records(kind, nested)
                    }
                    _ => {}
                }
            }
            Err(TransportError::InvalidResponse(format!(
                "{kind} response has no record list"
            )))
        }
        serde_json::Value::Null => Ok(Vec::new()),
        other => Err(TransportError::InvalidResponse(format!(
            "{kind} response is not a list: {}",
            compact_text(&other.to_string())
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

/// The server's current record, from a 409 body such as
/// `{"error": "...", "current": {...}}`.
fn conflict_server_value(body: &str) -> Option<serde_json::Value> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    ["current", "server", "record", "data"]
        .iter()
        .find_map(|key| value.get(*key).filter(|nested| nested.is_object()).cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retryable_classification() {
        assert!(TransportError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(TransportError::Network("reset".to_string()).is_retryable());
        assert!(TransportError::Status {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(!TransportError::Status {
            status: 422,
            message: String::new()
        }
        .is_retryable());
        assert!(!TransportError::Unauthorized(String::new()).is_retryable());
    }

    #[test]
    fn from_status_maps_auth_and_conflict() {
        assert!(matches!(
            TransportError::from_status(StatusCode::UNAUTHORIZED, r#"{"error":"expired"}"#),
            TransportError::Unauthorized(message) if message == "expired (401)"
        ));

        let conflict = TransportError::from_status(
            StatusCode::CONFLICT,
            r#"{"message":"already approved","current":{"id":"7","status":"approved"}}"#,
        );
        assert_eq!(
            conflict,
            TransportError::Conflict {
                message: "already approved (409)".to_string(),
                server_value: Some(json!({ "id": "7", "status": "approved" })),
            }
        );
    }

    #[test]
    fn extract_records_accepts_common_shapes() {
        let bare = extract_records(ResourceKind::Employee, json!([{ "id": 1 }])).unwrap();
        assert_eq!(bare.len(), 1);

        let wrapped = extract_records(
            ResourceKind::LeaveRequest,
            json!({ "data": [{ "id": 1 }, { "id": 2 }] }),
        )
        .unwrap();
        assert_eq!(wrapped.len(), 2);

        let named = extract_records(ResourceKind::LeaveBalance, json!({ "balances": [{ "id": 1 }] }))
            .unwrap();
        assert_eq!(named.len(), 1);

        assert!(extract_records(ResourceKind::Employee, json!({ "ok": true })).is_err());
        assert!(extract_records(ResourceKind::Employee, json!(null)).unwrap().is_empty());
    }

    #[test]
    fn static_token_debug_redacts_secret() {
        let token = StaticToken::new(Some("secret".to_string()));
        let debug = format!("{token:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
        assert_eq!(StaticToken::new(Some("  ".to_string())).bearer_token(), None);
    }
}
