// =============================================================================
// api/error.rs — EVERYTHING THAT CAN GO WRONG TALKING TO THE BACKEND
// =============================================================================
//
// Two layers:
//
//   ApiError      what a single authenticated call produced. Rich, owns a
//                 reqwest::Error when the network is to blame.
//   TrackerError  what the Job Tracker shows to page code. Cheap to clone,
//                 serializable, no transport internals.
//
// The rule of thumb: ApiError is for code, TrackerError is for people.
// =============================================================================

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The `reason` the backend puts on a 403 when uploads hit a running job.
pub const SCORING_IN_PROGRESS_REASON: &str = "scoring_in_progress";

#[derive(Debug, Error)]
pub enum ApiError {
    /// Connection refused, DNS, TLS, timeout. Always worth retrying later.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// 401 even after one token refresh. The user has to sign in again.
    #[error("session expired, please sign in again")]
    SessionExpired,

    /// 403 because a scoring job is running. Expected and temporary.
    #[error("operation restricted while scoring is in progress")]
    OperationRestricted { started_at: Option<DateTime<Utc>> },

    /// Any other 403.
    #[error("forbidden: {message}")]
    Forbidden { message: String },

    /// Any other non-success status.
    #[error("backend returned {status}: {message}")]
    Backend { status: u16, message: String },

    /// A 2xx whose body did not look like what we expected.
    #[error("could not decode backend response: {0}")]
    Decode(String),

    /// The caller handed us something that cannot be sent (bad URL, no org).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Loose view of the error bodies the backend sends.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
}

impl ApiError {
    /// Worth another attempt after backing off.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport(_) | ApiError::Decode(_) => true,
            ApiError::Backend { .. } => true,
            ApiError::SessionExpired
            | ApiError::OperationRestricted { .. }
            | ApiError::Forbidden { .. }
            | ApiError::InvalidRequest(_) => false,
        }
    }

    /// Build an error from a non-success status and its raw body.
    ///
    /// A 401 arriving here means the refresh already happened.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
        let message = parsed
            .message
            .or(parsed.error)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string());

        match status {
            StatusCode::UNAUTHORIZED => ApiError::SessionExpired,
            StatusCode::FORBIDDEN
                if parsed.reason.as_deref() == Some(SCORING_IN_PROGRESS_REASON) =>
            {
                ApiError::OperationRestricted {
                    started_at: parsed.started_at,
                }
            }
            StatusCode::FORBIDDEN => ApiError::Forbidden { message },
            _ => ApiError::Backend {
                status: status.as_u16(),
                message,
            },
        }
    }

    /// Drain a failed response into an `ApiError`.
    pub async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Self::from_status(status, &body)
    }
}

/// The typed error state the Job Tracker exposes. Page code matches on this
/// to decide between "sign in again", "uploads paused" and a retry banner.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrackerError {
    #[error("your session has expired, please sign in again")]
    SessionExpired,

    #[error("uploads are disabled while scoring is in progress")]
    UploadBlocked { started_at: Option<DateTime<Utc>> },

    #[error("could not reach the scoring service: {message}")]
    Transient { message: String },

    #[error("scoring status unavailable: {message}")]
    Rejected { message: String },
}

impl From<&ApiError> for TrackerError {
    fn from(err: &ApiError) -> Self {
        match err {
            ApiError::SessionExpired => TrackerError::SessionExpired,
            ApiError::OperationRestricted { started_at } => TrackerError::UploadBlocked {
                started_at: *started_at,
            },
            e if e.is_transient() => TrackerError::Transient {
                message: e.to_string(),
            },
            e => TrackerError::Rejected {
                message: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoring_reason_on_403_is_a_restriction() {
        let err = ApiError::from_status(
            StatusCode::FORBIDDEN,
            r#"{"reason":"scoring_in_progress","startedAt":"2025-01-01T00:00:00Z"}"#,
        );
        match err {
            ApiError::OperationRestricted { started_at } => assert!(started_at.is_some()),
            other => panic!("expected restriction, got {other:?}"),
        }
    }

    #[test]
    fn plain_403_is_forbidden() {
        let err = ApiError::from_status(StatusCode::FORBIDDEN, r#"{"message":"nope"}"#);
        assert!(matches!(err, ApiError::Forbidden { ref message } if message == "nope"));
        assert!(!err.is_transient());
    }

    #[test]
    fn server_errors_are_transient_even_without_a_body() {
        let err = ApiError::from_status(StatusCode::BAD_GATEWAY, "<html>oops</html>");
        assert!(err.is_transient());
        assert!(matches!(err, ApiError::Backend { status: 502, .. }));
    }

    #[test]
    fn tracker_error_mapping() {
        assert_eq!(
            TrackerError::from(&ApiError::SessionExpired),
            TrackerError::SessionExpired
        );
        assert!(matches!(
            TrackerError::from(&ApiError::Decode("bad".into())),
            TrackerError::Transient { .. }
        ));
        assert!(matches!(
            TrackerError::from(&ApiError::Forbidden { message: "x".into() }),
            TrackerError::Rejected { .. }
        ));
    }
}
