// =============================================================================
// models.rs — THE NOUNS OF THE GATEWAY
// =============================================================================
//
// Who is asking (Session), which tenant they are acting for
// (OrganizationId), and what the scoring backend is currently doing for that
// tenant (ScoringJob). Plus the wire shapes the backend hands us, which are
// camelCase because the backend was written by people who like JavaScript.
//
// None of these are persisted here. The identity provider owns sessions,
// the backend owns jobs. We only observe.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::api::error::TrackerError;

/// Opaque user identifier issued by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(pub String);

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque tenant identifier. Every backend call is scoped by one of these.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrganizationId(pub String);

impl OrganizationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrganizationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OrganizationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One authenticated browser context, as the identity provider sees it.
///
/// `organization_approved` only means something when `organization_id` is
/// set; the constructors keep it `false` otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Session {
    pub subject_id: Option<SubjectId>,
    pub organization_id: Option<OrganizationId>,
    pub organization_approved: bool,
    /// Identity provider session id, used to mint backend tokens.
    pub session_id: Option<String>,
}

impl Session {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn signed_in(subject: impl Into<SubjectId>) -> Self {
        Self {
            subject_id: Some(subject.into()),
            organization_id: None,
            organization_approved: false,
            session_id: None,
        }
    }

    /// Attach a tenant. Approval starts out false; admins flip it out-of-band.
    pub fn with_organization(mut self, organization: impl Into<OrganizationId>) -> Self {
        self.organization_id = Some(organization.into());
        self
    }

    /// Set the approval flag. Ignored when no organization is attached.
    pub fn approved(mut self, approved: bool) -> Self {
        self.organization_approved = approved && self.organization_id.is_some();
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn is_anonymous(&self) -> bool {
        self.subject_id.is_none()
    }
}

/// Where a caller stands, independent of the path they asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AccessState {
    Anonymous,
    AuthenticatedNoOrg,
    AuthenticatedOrgPending,
    AuthenticatedOrgAuthorized,
}

impl AccessState {
    pub fn of(session: &Session) -> Self {
        match (&session.subject_id, &session.organization_id) {
            (None, _) => AccessState::Anonymous,
            (Some(_), None) => AccessState::AuthenticatedNoOrg,
            (Some(_), Some(_)) if session.organization_approved => {
                AccessState::AuthenticatedOrgAuthorized
            }
            (Some(_), Some(_)) => AccessState::AuthenticatedOrgPending,
        }
    }
}

impl fmt::Display for AccessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessState::Anonymous => write!(f, "anonymous"),
            AccessState::AuthenticatedNoOrg => write!(f, "no_org"),
            AccessState::AuthenticatedOrgPending => write!(f, "org_pending"),
            AccessState::AuthenticatedOrgAuthorized => write!(f, "org_authorized"),
        }
    }
}

/// Lifecycle of a backend scoring job.
///
/// ```text
/// Idle -> Queued -> Running -> Completed
/// Queued/Running -> Failed
/// Completed -> Queued   (a new upload enqueues a new job)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScoringStatus {
    /// Nothing has ever run for this tenant, as far as we know.
    #[default]
    Idle,
    Queued,
    Running,
    Completed,
    Failed,
}

impl ScoringStatus {
    /// Queued or Running. Uploads are refused while this holds.
    pub fn is_active(self) -> bool {
        matches!(self, ScoringStatus::Queued | ScoringStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ScoringStatus::Completed | ScoringStatus::Failed)
    }
}

impl fmt::Display for ScoringStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoringStatus::Idle => write!(f, "IDLE"),
            ScoringStatus::Queued => write!(f, "QUEUED"),
            ScoringStatus::Running => write!(f, "RUNNING"),
            ScoringStatus::Completed => write!(f, "COMPLETED"),
            ScoringStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// The tracker's view of one tenant's scoring job.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ScoringJob {
    pub organization_id: Option<OrganizationId>,
    pub status: ScoringStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub queue_position: Option<u32>,
    pub eta_millis: Option<u64>,
}

impl ScoringJob {
    pub fn idle(organization_id: OrganizationId) -> Self {
        Self {
            organization_id: Some(organization_id),
            ..Self::default()
        }
    }
}

/// What page code reads to decide whether to grey out the upload button.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct JobSnapshot {
    pub status: ScoringStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub eta_millis: Option<u64>,
    pub queue_position: Option<u32>,
    pub last_error: Option<TrackerError>,
    pub consecutive_failures: u32,
    /// Failures needed before the connection banner shows.
    #[serde(skip)]
    pub banner_threshold: u32,
}

impl JobSnapshot {
    pub fn uploads_blocked(&self) -> bool {
        self.status.is_active()
    }

    /// Transient errors stay quiet until they pile up.
    pub fn show_connection_banner(&self) -> bool {
        self.banner_threshold > 0 && self.consecutive_failures >= self.banner_threshold
    }
}

// =============================================================================
// Backend wire payloads
// =============================================================================

/// Body of a `202 Accepted` from `/api/esg/scores`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InProgressBody {
    #[serde(default)]
    pub in_progress: Option<bool>,
    #[serde(default)]
    pub is_scoring: Option<bool>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub queue_position: Option<u32>,
    #[serde(default)]
    pub eta_millis: Option<u64>,
    #[serde(default)]
    pub estimated_time_to_process: Option<u64>,
}

/// What a single status poll produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ScoresResponse {
    /// 202: the backend is still chewing.
    InProgress {
        running: bool,
        started_at: Option<DateTime<Utc>>,
        queue_position: Option<u32>,
        eta_millis: Option<u64>,
    },
    /// 200 with a payload. `failed` is set when the payload says the job died.
    Ready {
        failed: bool,
        payload: serde_json::Value,
    },
}

/// `GET /api/esg/scoring-queue-status`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatusResponse {
    #[serde(default)]
    pub current_status: CurrentScoringStatus,
    #[serde(default)]
    pub queue_status: QueueStatus,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentScoringStatus {
    #[serde(default)]
    pub is_scoring: bool,
    #[serde(default)]
    pub last_scored_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pending_documents: u32,
}

/// Durations here are milliseconds.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    #[serde(default)]
    pub in_queue: bool,
    #[serde(default)]
    pub queue_position: Option<u32>,
    #[serde(default)]
    pub estimated_time_to_process: Option<u64>,
    #[serde(default)]
    pub cooldown_remaining: Option<u64>,
    #[serde(default)]
    pub is_scheduled: bool,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_state_covers_all_four_callers() {
        assert_eq!(AccessState::of(&Session::anonymous()), AccessState::Anonymous);
        assert_eq!(
            AccessState::of(&Session::signed_in("u1")),
            AccessState::AuthenticatedNoOrg
        );
        assert_eq!(
            AccessState::of(&Session::signed_in("u1").with_organization("o1")),
            AccessState::AuthenticatedOrgPending
        );
        assert_eq!(
            AccessState::of(&Session::signed_in("u1").with_organization("o1").approved(true)),
            AccessState::AuthenticatedOrgAuthorized
        );
    }

    #[test]
    fn approval_without_organization_is_ignored() {
        let session = Session::signed_in("u1").approved(true);
        assert!(!session.organization_approved);
    }

    #[test]
    fn in_progress_body_reads_camel_case() {
        let body: InProgressBody = serde_json::from_str(
            r#"{"inProgress":true,"startedAt":"2025-01-01T00:00:00Z","queuePosition":2}"#,
        )
        .unwrap();
        assert_eq!(body.in_progress, Some(true));
        assert_eq!(body.queue_position, Some(2));
        assert!(body.started_at.is_some());
    }

    #[test]
    fn banner_waits_for_threshold() {
        let mut snap = JobSnapshot {
            banner_threshold: 3,
            consecutive_failures: 2,
            ..JobSnapshot::default()
        };
        assert!(!snap.show_connection_banner());
        snap.consecutive_failures = 3;
        assert!(snap.show_connection_banner());
    }
}
