// =============================================================================
// upload.rs — THE UPLOAD GATE
// =============================================================================
//
// Sits between the upload button and `POST /api/documents`. In order:
//
//   1. Local checks: batch size, file size, file type. Every problem is
//      listed, not just the first one, and nothing touches the network.
//   2. Tracker check: Queued or Running means no upload, with an ETA.
//   3. Send. A 403 "scoring_in_progress" here means a job started between
//      step 2 and step 3; it gets the same message as step 2.
//   4. On success the tracker is told a job is coming and starts polling.
// =============================================================================

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::api::documents::{DocumentType, DocumentsClient, UploadFile};
use crate::api::error::ApiError;
use crate::tracker::ScoringTracker;

#[derive(Debug, Clone)]
pub struct UploadLimits {
    pub max_files: usize,
    pub max_file_bytes: u64,
    /// Lowercase, without the dot.
    pub allowed_extensions: Vec<String>,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_files: 10,
            max_file_bytes: 10 * 1024 * 1024,
            allowed_extensions: ["pdf", "csv", "xlsx", "json", "doc", "docx"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// One reason a batch cannot be sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileRejection {
    EmptyBatch,
    TooManyFiles { count: usize, max: usize },
    TooLarge { name: String, size: u64, max: u64 },
    UnsupportedType { name: String },
}

impl fmt::Display for FileRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileRejection::EmptyBatch => write!(f, "please select files to upload"),
            FileRejection::TooManyFiles { count, max } => {
                write!(f, "{count} files selected, at most {max} can be uploaded at once")
            }
            FileRejection::TooLarge { name, size, max } => write!(
                f,
                "{name} is {:.1} MB, the limit is {:.0} MB",
                *size as f64 / (1024.0 * 1024.0),
                *max as f64 / (1024.0 * 1024.0)
            ),
            FileRejection::UnsupportedType { name } => {
                write!(f, "{name} is not a supported document type")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{}", join_rejections(.0))]
    Validation(Vec<FileRejection>),

    /// Informational: uploads reopen when the job finishes.
    #[error("uploads are disabled while scoring is in progress")]
    ScoringInProgress {
        started_at: Option<DateTime<Utc>>,
        eta_millis: Option<u64>,
    },

    #[error("no organization selected")]
    NoOrganization,

    #[error(transparent)]
    Api(#[from] ApiError),
}

fn join_rejections(rejections: &[FileRejection]) -> String {
    rejections
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// What the backend acknowledged.
#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub files: usize,
    pub response: serde_json::Value,
}

/// Check a batch against `limits` without any I/O.
pub fn validate(files: &[UploadFile], limits: &UploadLimits) -> Result<(), UploadError> {
    let mut rejections = Vec::new();
    if files.is_empty() {
        rejections.push(FileRejection::EmptyBatch);
    }
    if files.len() > limits.max_files {
        rejections.push(FileRejection::TooManyFiles {
            count: files.len(),
            max: limits.max_files,
        });
    }
    for file in files {
        if file.size() > limits.max_file_bytes {
            rejections.push(FileRejection::TooLarge {
                name: file.name.clone(),
                size: file.size(),
                max: limits.max_file_bytes,
            });
        }
        let allowed = file
            .extension()
            .is_some_and(|ext| limits.allowed_extensions.iter().any(|a| *a == ext));
        if !allowed {
            rejections.push(FileRejection::UnsupportedType {
                name: file.name.clone(),
            });
        }
    }

    if rejections.is_empty() {
        Ok(())
    } else {
        Err(UploadError::Validation(rejections))
    }
}

pub struct UploadGate {
    documents: DocumentsClient,
    tracker: Arc<ScoringTracker>,
    limits: UploadLimits,
}

impl UploadGate {
    pub fn new(documents: DocumentsClient, tracker: Arc<ScoringTracker>, limits: UploadLimits) -> Self {
        Self {
            documents,
            tracker,
            limits,
        }
    }

    pub fn limits(&self) -> &UploadLimits {
        &self.limits
    }

    /// True when the upload control should be disabled.
    pub fn is_blocked(&self) -> bool {
        self.tracker.snapshot().uploads_blocked()
    }

    pub async fn submit(
        &self,
        files: &[UploadFile],
        document_type: Option<DocumentType>,
    ) -> Result<UploadReceipt, UploadError> {
        validate(files, &self.limits)?;

        let snapshot = self.tracker.snapshot();
        if snapshot.uploads_blocked() {
            return Err(UploadError::ScoringInProgress {
                started_at: snapshot.started_at,
                eta_millis: snapshot.eta_millis,
            });
        }

        let organization = self.tracker.organization().ok_or(UploadError::NoOrganization)?;

        match self.documents.upload(&organization, files, document_type).await {
            Ok(response) => {
                info!(org = %organization, files = files.len(), "Upload accepted, watching for the new scoring job");
                self.tracker.observe_enqueued();
                self.tracker.restart(organization);
                Ok(UploadReceipt {
                    files: files.len(),
                    response,
                })
            }
            Err(ApiError::OperationRestricted { started_at }) => {
                warn!(org = %organization, "Upload raced a scoring job that just started");
                self.tracker.observe_restriction(started_at);
                self.tracker.restart(organization);
                let snapshot = self.tracker.snapshot();
                Err(UploadError::ScoringInProgress {
                    started_at: snapshot.started_at,
                    eta_millis: snapshot.eta_millis,
                })
            }
            Err(e) => Err(UploadError::Api(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use axum::body::Bytes;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::api::documents::DOCUMENTS_PATH;
    use crate::api::scoring::{ScoringClient, SCORES_PATH};
    use crate::api::testing::{client, serve, within};
    use crate::api::StaticToken;
    use crate::models::{OrganizationId, ScoringStatus};
    use crate::tracker::TrackerConfig;

    fn pdf(name: &str, bytes: usize) -> UploadFile {
        UploadFile::new(name, vec![b'%'; bytes])
    }

    struct Backend {
        base: String,
        uploads: Arc<AtomicU32>,
        last_body: Arc<Mutex<String>>,
    }

    /// Fake backend: `/api/esg/scores` answers with `scores`, uploads answer
    /// with `upload_status`.
    async fn backend(scores: (StatusCode, serde_json::Value), upload_status: StatusCode) -> Backend {
        let uploads = Arc::new(AtomicU32::new(0));
        let last_body = Arc::new(Mutex::new(String::new()));
        let (u, b) = (uploads.clone(), last_body.clone());
        let router = Router::new()
            .route(
                SCORES_PATH,
                get(move || {
                    let scores = scores.clone();
                    async move { (scores.0, Json(scores.1)) }
                }),
            )
            .route(
                DOCUMENTS_PATH,
                post(move |body: Bytes| {
                    let (u, b) = (u.clone(), b.clone());
                    async move {
                        u.fetch_add(1, Ordering::SeqCst);
                        *b.lock() = String::from_utf8_lossy(&body).into_owned();
                        if upload_status == StatusCode::FORBIDDEN {
                            (
                                upload_status,
                                Json(json!({"reason": "scoring_in_progress", "startedAt": "2025-01-01T00:00:00Z"})),
                            )
                        } else {
                            (upload_status, Json(json!({"accepted": true})))
                        }
                    }
                }),
            );
        Backend {
            base: serve(router).await,
            uploads,
            last_body,
        }
    }

    fn gate(base: &str) -> (UploadGate, Arc<ScoringTracker>) {
        let api = client(base, Arc::new(StaticToken("t".into())));
        let tracker = Arc::new(ScoringTracker::new(
            Arc::new(ScoringClient::new(api.clone())),
            TrackerConfig::default(),
        ));
        let gate = UploadGate::new(
            DocumentsClient::new(api),
            tracker.clone(),
            UploadLimits::default(),
        );
        (gate, tracker)
    }

    async fn wait_for_status(tracker: &ScoringTracker, status: ScoringStatus) {
        let mut rx = tracker.subscribe();
        within(rx.wait_for(|s| s.status == status)).await.unwrap();
    }

    #[tokio::test]
    async fn eleven_files_never_reach_the_network() {
        let backend = backend((StatusCode::OK, json!({})), StatusCode::OK).await;
        let (gate, tracker) = gate(&backend.base);
        tracker.start(OrganizationId::from("o1"));

        let files: Vec<_> = (0..11).map(|i| pdf(&format!("r{i}.pdf"), 10)).collect();
        let err = gate.submit(&files, None).await.unwrap_err();
        match err {
            UploadError::Validation(rejections) => assert_eq!(
                rejections,
                vec![FileRejection::TooManyFiles { count: 11, max: 10 }]
            ),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(backend.uploads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn an_eleven_megabyte_file_never_reaches_the_network() {
        let backend = backend((StatusCode::OK, json!({})), StatusCode::OK).await;
        let (gate, tracker) = gate(&backend.base);
        tracker.start(OrganizationId::from("o1"));

        let files = vec![pdf("small.pdf", 10), pdf("huge.pdf", 11 * 1024 * 1024)];
        let err = gate.submit(&files, None).await.unwrap_err();
        assert!(err.to_string().contains("huge.pdf"));
        assert_eq!(backend.uploads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn every_problem_is_itemized() {
        let files = vec![pdf("a.exe", 1), pdf("b.pdf", 20 * 1024 * 1024)];
        let Err(UploadError::Validation(rejections)) = validate(&files, &UploadLimits::default())
        else {
            panic!("expected validation failure");
        };
        assert_eq!(rejections.len(), 2);
        assert!(matches!(
            validate(&[], &UploadLimits::default()),
            Err(UploadError::Validation(ref r)) if r == &vec![FileRejection::EmptyBatch]
        ));
    }

    #[tokio::test]
    async fn refused_while_scoring_is_running() {
        let backend = backend(
            (StatusCode::ACCEPTED, json!({"startedAt": "2025-01-01T00:00:00Z"})),
            StatusCode::OK,
        )
        .await;
        let (gate, tracker) = gate(&backend.base);
        tracker.start(OrganizationId::from("o1"));
        wait_for_status(&tracker, ScoringStatus::Running).await;

        let err = gate.submit(&[pdf("r.pdf", 10)], None).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::ScoringInProgress { eta_millis: Some(60_000), .. }
        ));
        assert!(gate.is_blocked());
        assert_eq!(backend.uploads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn late_403_gets_the_same_restricted_message() {
        let backend = backend((StatusCode::OK, json!({})), StatusCode::FORBIDDEN).await;
        let (gate, tracker) = gate(&backend.base);
        tracker.start(OrganizationId::from("o1"));
        wait_for_status(&tracker, ScoringStatus::Completed).await;

        let err = gate.submit(&[pdf("r.pdf", 10)], None).await.unwrap_err();
        assert!(matches!(err, UploadError::ScoringInProgress { started_at: Some(_), .. }));
        assert_eq!(backend.uploads.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.snapshot().status, ScoringStatus::Running);
    }

    #[tokio::test]
    async fn accepted_upload_sends_every_file_and_rearms_the_tracker() {
        let backend = backend((StatusCode::OK, json!({})), StatusCode::CREATED).await;
        let (gate, tracker) = gate(&backend.base);
        tracker.start(OrganizationId::from("o1"));
        wait_for_status(&tracker, ScoringStatus::Completed).await;

        let files = vec![pdf("a.pdf", 10), pdf("b.csv", 10)];
        let receipt = gate
            .submit(&files, Some(DocumentType::AnnualReport))
            .await
            .unwrap();
        assert_eq!(receipt.files, 2);
        assert_eq!(receipt.response["accepted"], true);

        let body = backend.last_body.lock().clone();
        assert_eq!(body.matches("name=\"files\"").count(), 2);
        assert!(body.contains("annual_report"));

        // The backend still serves the previous job's result. That must not
        // read as the new job being done.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(tracker.snapshot().status, ScoringStatus::Queued);
        assert!(tracker.is_polling());
        assert!(gate.is_blocked());
    }
}
