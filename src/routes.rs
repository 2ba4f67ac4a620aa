// =============================================================================
// routes.rs — THE GATEWAY'S OWN ENDPOINTS
// =============================================================================
//
//   GET  /_gateway/health           liveness, exempt from the gate
//   GET  /_gateway/metrics          counters as JSON, exempt from the gate
//   PUT  /api/organizations/update  tenant profile, forwarded to the backend
//   POST /api/webhooks/identity     identity provider callbacks
//   GET  /api/scoring/status        the caller's scoring job, from its tracker
//   POST /api/scoring/uploads       documents, through the Upload Gate
//   *                               everything else -> proxy::forward
//
// The whole router sits behind the gate middleware, the fallback included.
// =============================================================================

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{middleware, Extension, Json, Router};
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::api::documents::{DocumentType, UploadFile};
use crate::api::error::ApiError;
use crate::api::organizations::{OrganizationUpdate, OrganizationsClient};
use crate::api::{ApiClient, StaticToken};
use crate::gate::middleware::{enforce, GateState};
use crate::metrics::GatewayMetrics;
use crate::models::{JobSnapshot, OrganizationId, Session};
use crate::proxy;
use crate::trackers::TrackerRegistry;
use crate::upload::UploadError;
use crate::webhook::{self, IdentityDirectory, WebhookVerifier};

pub const HEALTH_PATH: &str = "/_gateway/health";
pub const METRICS_PATH: &str = "/_gateway/metrics";
pub const ORGANIZATION_UPDATE_PATH: &str = "/api/organizations/update";
pub const IDENTITY_WEBHOOK_PATH: &str = "/api/webhooks/identity";
pub const SCORING_STATUS_PATH: &str = "/api/scoring/status";
pub const SCORING_UPLOADS_PATH: &str = "/api/scoring/uploads";

/// Multipart framing and the `documentType` field on top of the files.
const UPLOAD_OVERHEAD_BYTES: usize = 1024 * 1024;

/// Active organization cookie set by the identity provider's frontend SDK.
pub const ORGANIZATION_COOKIE: &str = "__clerk_org_id";

#[derive(Clone)]
pub struct AppState {
    pub api_base_url: String,
    pub frontend_url: String,
    /// Pool for backend API calls.
    pub backend: reqwest::Client,
    /// Pool for the frontend hop. Must not follow redirects.
    pub upstream: reqwest::Client,
    pub metrics: Arc<GatewayMetrics>,
    pub directory: Arc<dyn IdentityDirectory>,
    pub webhook: Option<Arc<WebhookVerifier>>,
    pub trackers: Arc<TrackerRegistry>,
}

pub fn router(state: AppState, gate: GateState) -> Router {
    let limits = state.trackers.limits();
    let upload_limit = usize::try_from(limits.max_file_bytes)
        .unwrap_or(usize::MAX)
        .saturating_mul(limits.max_files)
        .saturating_add(UPLOAD_OVERHEAD_BYTES);

    Router::new()
        .route(HEALTH_PATH, get(health))
        .route(METRICS_PATH, get(metrics))
        .route(ORGANIZATION_UPDATE_PATH, put(update_organization))
        .route(IDENTITY_WEBHOOK_PATH, post(identity_webhook))
        .route(SCORING_STATUS_PATH, get(scoring_status))
        .route(
            SCORING_UPLOADS_PATH,
            post(upload_documents).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .fallback(proxy::forward)
        .layer(middleware::from_fn_with_state(gate, enforce))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn api_error_response(err: &ApiError) -> Response {
    let status = match err {
        ApiError::SessionExpired => StatusCode::UNAUTHORIZED,
        ApiError::OperationRestricted { .. } | ApiError::Forbidden { .. } => StatusCode::FORBIDDEN,
        ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ApiError::Backend { status, .. } => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        ApiError::Transport(_) | ApiError::Decode(_) => StatusCode::BAD_GATEWAY,
    };
    error_body(status, err.to_string())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

async fn update_organization(
    State(state): State<AppState>,
    session: Option<Extension<Session>>,
    jar: CookieJar,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return error_body(
            StatusCode::UNAUTHORIZED,
            "Unauthorized - Missing valid authentication",
        );
    };

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, format!("invalid JSON body: {e}")),
    };

    let session_org = session
        .as_ref()
        .and_then(|Extension(s)| s.organization_id.clone());
    let fallback_org = jar
        .get(ORGANIZATION_COOKIE)
        .map(|c| c.value().to_string())
        .or_else(|| session_org.as_ref().map(|o| o.as_str().to_string()));

    let Some(update) = OrganizationUpdate::from_payload(payload, fallback_org.as_deref()) else {
        return error_body(
            StatusCode::UNAUTHORIZED,
            "Unauthorized - Organization not found",
        );
    };

    // The gate approved the session's active tenant, not whatever the body
    // or a cookie names.
    if let Some(active) = session_org.as_ref() {
        if *active != update.organization_id {
            warn!(
                active = %active,
                requested = %update.organization_id,
                "Organization update for a tenant other than the active one"
            );
            return error_body(StatusCode::FORBIDDEN, "Forbidden - organization mismatch");
        }
    }

    let api = ApiClient::with_http(
        state.backend.clone(),
        &state.api_base_url,
        Arc::new(StaticToken(token.to_string())),
    );
    match OrganizationsClient::new(api).update(&update).await {
        Ok(saved) => {
            info!(organization = %update.organization_id, "Organization profile updated");
            Json(saved).into_response()
        }
        Err(e) => {
            warn!(organization = %update.organization_id, error = %e, "Organization update failed");
            api_error_response(&e)
        }
    }
}

async fn identity_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let outcome = webhook::process(
        state.webhook.as_deref(),
        state.directory.as_ref(),
        &headers,
        &body,
        Utc::now(),
    )
    .await;

    match outcome {
        Ok(ack) => {
            state.metrics.increment_webhook_deliveries();
            Json(ack).into_response()
        }
        Err(e) => {
            state.metrics.increment_webhook_rejections();
            warn!(error = %e, "Identity webhook rejected");
            e.into_response()
        }
    }
}

/// The tracker snapshot plus the two derived flags page code reads.
#[derive(Debug, Serialize)]
struct ScoringView {
    #[serde(flatten)]
    snapshot: JobSnapshot,
    uploads_blocked: bool,
    show_connection_banner: bool,
}

impl From<JobSnapshot> for ScoringView {
    fn from(snapshot: JobSnapshot) -> Self {
        Self {
            uploads_blocked: snapshot.uploads_blocked(),
            show_connection_banner: snapshot.show_connection_banner(),
            snapshot,
        }
    }
}

/// Session id and active tenant, or the response explaining which is missing.
fn tenant_of(session: Option<&Session>) -> Result<(String, OrganizationId), Response> {
    let Some(session) = session.filter(|s| !s.is_anonymous()) else {
        return Err(error_body(StatusCode::UNAUTHORIZED, "Unauthorized - Not signed in"));
    };
    let Some(session_id) = session.session_id.clone() else {
        return Err(error_body(StatusCode::UNAUTHORIZED, "Unauthorized - Missing session"));
    };
    let Some(organization) = session.organization_id.clone() else {
        return Err(error_body(StatusCode::BAD_REQUEST, UploadError::NoOrganization.to_string()));
    };
    Ok((session_id, organization))
}

async fn scoring_status(
    State(state): State<AppState>,
    session: Option<Extension<Session>>,
) -> Response {
    let (session_id, organization) = match tenant_of(session.as_ref().map(|Extension(s)| s)) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };
    let view = state.trackers.acquire(&session_id, &organization).await;
    Json(ScoringView::from(view.tracker.snapshot())).into_response()
}

async fn upload_documents(
    State(state): State<AppState>,
    session: Option<Extension<Session>>,
    mut multipart: Multipart,
) -> Response {
    let (session_id, organization) = match tenant_of(session.as_ref().map(|Extension(s)| s)) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };

    let mut files = Vec::new();
    let mut document_type = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return error_body(e.status(), e.body_text()),
        };
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("files") => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                match field.bytes().await {
                    Ok(bytes) => files.push(UploadFile::new(file_name, bytes.to_vec())),
                    Err(e) => return error_body(e.status(), e.body_text()),
                }
            }
            Some("documentType") => {
                let raw = match field.text().await {
                    Ok(raw) => raw,
                    Err(e) => return error_body(e.status(), e.body_text()),
                };
                match serde_json::from_value::<DocumentType>(Value::String(raw.trim().to_string())) {
                    Ok(kind) => document_type = Some(kind),
                    Err(_) => {
                        return error_body(
                            StatusCode::BAD_REQUEST,
                            format!("unknown document type: {}", raw.trim()),
                        )
                    }
                }
            }
            _ => {}
        }
    }

    let view = state.trackers.acquire(&session_id, &organization).await;
    match view.uploads.submit(&files, document_type).await {
        Ok(receipt) => Json(receipt).into_response(),
        Err(UploadError::Validation(rejections)) => {
            let message = UploadError::Validation(rejections.clone()).to_string();
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "error": message, "rejections": rejections })),
            )
                .into_response()
        }
        Err(UploadError::ScoringInProgress { started_at, eta_millis }) => {
            let message = UploadError::ScoringInProgress { started_at, eta_millis }.to_string();
            (
                StatusCode::CONFLICT,
                Json(json!({
                    "error": message,
                    "startedAt": started_at,
                    "etaMillis": eta_millis,
                })),
            )
                .into_response()
        }
        Err(e @ UploadError::NoOrganization) => error_body(StatusCode::BAD_REQUEST, e.to_string()),
        Err(UploadError::Api(e)) => {
            warn!(org = %organization, error = %e, "Upload failed");
            api_error_response(&e)
        }
    }
}
