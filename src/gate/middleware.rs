// =============================================================================
// gate/middleware.rs — THE DOOR
// =============================================================================
//
// An axum middleware that runs before every handler, the proxy included.
// The decision is made and applied before a single byte of page content is
// produced: either the request continues with its `Session` attached as an
// extension, or it gets a 307 and never reaches the handler.
// =============================================================================

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use tracing::{info, warn};
use uuid::Uuid;

use super::policy::{has_dot_segments, GateDecision, GatePolicy};
use super::session::{credential_from, resolve_session, SessionResolver};
use crate::metrics::GatewayMetrics;
use crate::models::{AccessState, Session};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Everything the gate needs per request.
#[derive(Clone)]
pub struct GateState {
    pub policy: Arc<GatePolicy>,
    pub resolver: Arc<dyn SessionResolver>,
    pub session_cookie: String,
    pub metrics: Arc<GatewayMetrics>,
}

pub async fn enforce(State(gate): State<GateState>, mut request: Request, next: Next) -> Response {
    gate.metrics.increment_requests();

    let target = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    // Classified as one path, served as another once the upstream resolves
    // the dots. Refused before any rule is consulted.
    if has_dot_segments(request.uri().path()) {
        gate.metrics.increment_rejected_paths();
        warn!(path = %target, "Refusing path with dot segments");
        return (StatusCode::BAD_REQUEST, "invalid path").into_response();
    }

    if gate.policy.is_exempt(&target) {
        gate.metrics.increment_exempt();
        return next.run(request).await;
    }

    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let credential = credential_from(request.headers(), &gate.session_cookie);
    let session = match resolve_session(gate.resolver.as_ref(), credential.as_deref()).await {
        Ok(session) => session,
        Err(e) => {
            // Fail closed: an unreachable identity provider never lets anyone in.
            gate.metrics.increment_session_lookup_failures();
            warn!(request_id = %request_id, error = %e, "Session lookup failed, treating caller as anonymous");
            Session::anonymous()
        }
    };

    match gate.policy.evaluate(&target, &session) {
        GateDecision::Continue => {
            gate.metrics.increment_continues();
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                request.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
            request.extensions_mut().insert(session);
            next.run(request).await
        }
        GateDecision::Redirect { reason, location } => {
            gate.metrics.increment_redirects(reason);
            info!(
                request_id = %request_id,
                path = %target,
                state = %AccessState::of(&session),
                reason = reason.as_str(),
                location = %location,
                "Redirecting"
            );
            Redirect::temporary(&location).into_response()
        }
    }
}
