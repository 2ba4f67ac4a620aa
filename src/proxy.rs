// =============================================================================
// proxy.rs — EVERYTHING ELSE GOES TO THE FRONTEND
// =============================================================================
//
// Requests that survived the gate and match no gateway route are forwarded
// to the frontend upstream as-is, plus two headers naming the caller:
//
//   x-blever-subject       the signed-in user, if any
//   x-blever-organization  the active tenant, if any
//
// Incoming copies of those headers are always stripped first; only the gate
// gets to set them. Upstream redirects are passed through untouched, never
// followed.
// =============================================================================

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use crate::models::Session;
use crate::routes::AppState;

pub const SUBJECT_HEADER: &str = "x-blever-subject";
pub const ORGANIZATION_HEADER: &str = "x-blever-organization";

/// Ten files of ten megabytes plus multipart overhead.
const MAX_BODY_BYTES: usize = 128 * 1024 * 1024;

const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::PROXY_AUTHORIZATION,
    header::PROXY_AUTHENTICATE,
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

/// Rewrite inbound headers for the upstream hop.
pub fn upstream_headers(inbound: &HeaderMap, session: Option<&Session>) -> HeaderMap {
    let mut headers = inbound.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(SUBJECT_HEADER);
    headers.remove(ORGANIZATION_HEADER);

    if let Some(session) = session {
        if let Some(subject) = session
            .subject_id
            .as_ref()
            .and_then(|s| HeaderValue::from_str(&s.0).ok())
        {
            headers.insert(SUBJECT_HEADER, subject);
        }
        if let Some(org) = session
            .organization_id
            .as_ref()
            .and_then(|o| HeaderValue::from_str(o.as_str()).ok())
        {
            headers.insert(ORGANIZATION_HEADER, org);
        }
    }
    headers
}

pub async fn forward(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", state.frontend_url.trim_end_matches('/'), target);

    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Request body too large or unreadable");
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };

    let headers = upstream_headers(&parts.headers, parts.extensions.get::<Session>());
    debug!(method = %parts.method, url = %url, "Forwarding to frontend");

    let upstream = state
        .upstream
        .request(parts.method.clone(), &url)
        .headers(headers)
        .body(body)
        .send()
        .await;

    let upstream = match upstream {
        Ok(response) => response,
        Err(e) => {
            state.metrics.increment_proxy_errors();
            warn!(url = %url, error = %e, "Frontend unreachable");
            return (StatusCode::BAD_GATEWAY, "frontend unavailable").into_response();
        }
    };

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::CONTENT_LENGTH);

    match upstream.bytes().await {
        Ok(bytes) => {
            let mut response = Response::new(Body::from(bytes));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            response
        }
        Err(e) => {
            state.metrics.increment_proxy_errors();
            warn!(url = %url, error = %e, "Frontend response interrupted");
            (StatusCode::BAD_GATEWAY, "frontend response interrupted").into_response()
        }
    }
}
