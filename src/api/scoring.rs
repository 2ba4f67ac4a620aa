// =============================================================================
// api/scoring.rs — "ARE WE THERE YET?"
// =============================================================================
//
// Two endpoints:
//
//   GET /api/esg/scores                200 = here are your scores
//                                      202 = still working, come back later
//   GET /api/esg/scoring-queue-status  where exactly in the line you are
//
// A 202 is allowed to be terse. When it does not say where we are in the
// queue, we ask the queue-status endpoint. That second call is best effort:
// if it fails, the 202 alone is still a perfectly good answer.
// =============================================================================

use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use reqwest::StatusCode;
use tracing::debug;

use super::error::ApiError;
use super::ApiClient;
use crate::models::{InProgressBody, OrganizationId, QueueStatusResponse, ScoresResponse};
use crate::tracker::StatusSource;

pub const SCORES_PATH: &str = "/api/esg/scores";
pub const QUEUE_STATUS_PATH: &str = "/api/esg/scoring-queue-status";
pub const STARTED_AT_HEADER: &str = "x-process-started-at";

#[derive(Clone)]
pub struct ScoringClient {
    api: ApiClient,
}

impl ScoringClient {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    /// One poll of `/api/esg/scores`.
    pub async fn scores(&self, organization: &OrganizationId) -> Result<ScoresResponse, ApiError> {
        let url = self.api.endpoint(SCORES_PATH, Some(organization))?;
        let response = self.api.send(|http| http.get(url.clone())).await?;
        let status = response.status();

        if status == StatusCode::ACCEPTED {
            let header_started_at = response
                .headers()
                .get(STARTED_AT_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_timestamp);
            let text = response.text().await?;
            // An empty 202 is still a 202.
            let body: InProgressBody = serde_json::from_str(&text).unwrap_or_default();
            return Ok(self
                .in_progress(organization, body, header_started_at)
                .await);
        }

        if !status.is_success() {
            return Err(ApiError::from_response(response).await);
        }

        let text = response.text().await?;
        let payload: serde_json::Value = if text.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))?
        };
        Ok(interpret_ready(payload))
    }

    /// `GET /api/esg/scoring-queue-status`.
    pub async fn queue_status(
        &self,
        organization: &OrganizationId,
    ) -> Result<QueueStatusResponse, ApiError> {
        let url = self.api.endpoint(QUEUE_STATUS_PATH, Some(organization))?;
        let response = self.api.send(|http| http.get(url.clone())).await?;
        if !response.status().is_success() {
            return Err(ApiError::from_response(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn in_progress(
        &self,
        organization: &OrganizationId,
        body: InProgressBody,
        header_started_at: Option<DateTime<Utc>>,
    ) -> ScoresResponse {
        let started_at = body.started_at.or(header_started_at);
        let mut running = body.is_scoring.unwrap_or(started_at.is_some());
        let mut queue_position = body.queue_position;
        let mut eta_millis = body.eta_millis.or(body.estimated_time_to_process);

        if queue_position.is_none() && eta_millis.is_none() {
            match self.queue_status(organization).await {
                Ok(queue) => {
                    running |= queue.current_status.is_scoring;
                    queue_position = queue.queue_status.queue_position;
                    eta_millis = queue.queue_status.estimated_time_to_process;
                }
                Err(e) => {
                    debug!(org = %organization, error = %e, "Queue status unavailable, using 202 as is");
                }
            }
        }

        ScoresResponse::InProgress {
            running,
            started_at,
            queue_position,
            eta_millis,
        }
    }
}

impl StatusSource for ScoringClient {
    fn fetch_status<'a>(
        &'a self,
        organization: &'a OrganizationId,
    ) -> BoxFuture<'a, Result<ScoresResponse, ApiError>> {
        Box::pin(self.scores(organization))
    }
}

/// Map a 200 payload onto a terminal answer.
///
/// Some backend builds answer 200 with `inProgress: true` instead of a 202;
/// that is treated as a running job.
fn interpret_ready(payload: serde_json::Value) -> ScoresResponse {
    if payload.get("inProgress").and_then(|v| v.as_bool()) == Some(true) {
        return ScoresResponse::InProgress {
            running: true,
            started_at: payload
                .get("startedAt")
                .and_then(|v| v.as_str())
                .and_then(parse_timestamp),
            queue_position: payload
                .get("queuePosition")
                .and_then(|v| v.as_u64())
                .and_then(|v| u32::try_from(v).ok()),
            eta_millis: payload.get("etaMillis").and_then(|v| v.as_u64()),
        };
    }

    let failed = payload
        .get("status")
        .and_then(|v| v.as_str())
        .map(|s| s.eq_ignore_ascii_case("failed") || s.eq_ignore_ascii_case("error"))
        .unwrap_or(false);
    ScoresResponse::Ready { failed, payload }
}

/// RFC 3339, or epoch milliseconds.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}
