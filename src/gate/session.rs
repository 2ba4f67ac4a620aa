// =============================================================================
// gate/session.rs — WHO IS KNOCKING?
// =============================================================================
//
// Turns an incoming request into an explicit `Session` value before the
// policy ever sees it.
//
//   no credential        -> anonymous, no network call
//   401 / 404 on lookup  -> anonymous (token is stale or unknown)
//   anything else broken -> GateError, and the middleware fails CLOSED
//
// The credential is the `Authorization: Bearer` header if present, else the
// session cookie.
// =============================================================================

use axum::http::{header, HeaderMap};
use axum_extra::extract::cookie::CookieJar;
use futures::future::BoxFuture;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::models::Session;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("session lookup failed: {0}")]
    Lookup(#[from] reqwest::Error),

    #[error("identity provider answered {status}")]
    Status { status: u16 },

    #[error("could not decode session: {0}")]
    Decode(String),
}

/// Anything that can turn a credential into a `Session`.
pub trait SessionResolver: Send + Sync {
    fn resolve<'a>(&'a self, credential: &'a str) -> BoxFuture<'a, Result<Session, GateError>>;
}

/// Pull the caller's credential out of the request headers.
pub fn credential_from(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, token) = v.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        })
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    CookieJar::from_headers(headers)
        .get(cookie_name)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
}

/// Organizations are approved when their public metadata says
/// `access: true`, or the string `"true"` in any case.
pub fn access_granted(public_metadata: &Value) -> bool {
    match public_metadata.get("access") {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Resolve the session for an optional credential.
pub async fn resolve_session(
    resolver: &dyn SessionResolver,
    credential: Option<&str>,
) -> Result<Session, GateError> {
    match credential {
        None => Ok(Session::anonymous()),
        Some(token) => resolver.resolve(token).await,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Introspection {
    #[serde(default, alias = "user_id", alias = "sub")]
    user_id: Option<String>,
    #[serde(default, alias = "session_id", alias = "sid")]
    session_id: Option<String>,
    #[serde(default)]
    organization: Option<IntrospectedOrganization>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntrospectedOrganization {
    id: String,
    #[serde(default, alias = "public_metadata")]
    public_metadata: Value,
}

impl From<Introspection> for Session {
    fn from(found: Introspection) -> Self {
        let Some(user) = found.user_id.filter(|u| !u.is_empty()) else {
            return Session::anonymous();
        };
        let mut session = Session::signed_in(user.as_str());
        if let Some(sid) = found.session_id.filter(|s| !s.is_empty()) {
            session = session.with_session_id(sid);
        }
        match found.organization {
            Some(org) if !org.id.is_empty() => {
                let approved = access_granted(&org.public_metadata);
                session.with_organization(org.id.as_str()).approved(approved)
            }
            _ => session,
        }
    }
}

/// Admin client for the identity provider.
#[derive(Clone)]
pub struct IdentityClient {
    http: reqwest::Client,
    api_url: String,
    secret_key: String,
}

pub const SESSION_TOKEN_HEADER: &str = "x-session-token";

impl IdentityClient {
    pub fn new(http: reqwest::Client, api_url: &str, secret_key: &str) -> Self {
        Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            secret_key: secret_key.to_string(),
        }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }

    async fn introspect(&self, credential: &str) -> Result<Session, GateError> {
        let response = self
            .http
            .get(self.url("/sessions/introspect"))
            .bearer_auth(&self.secret_key)
            .header(SESSION_TOKEN_HEADER, credential)
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND => {
                debug!("Credential not recognised, treating caller as anonymous");
                Ok(Session::anonymous())
            }
            s if s.is_success() => {
                let found: Introspection = response
                    .json()
                    .await
                    .map_err(|e| GateError::Decode(e.to_string()))?;
                Ok(found.into())
            }
            s => Err(GateError::Status { status: s.as_u16() }),
        }
    }
}

impl SessionResolver for IdentityClient {
    fn resolve<'a>(&'a self, credential: &'a str) -> BoxFuture<'a, Result<Session, GateError>> {
        Box::pin(self.introspect(credential))
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap as AxumHeaders, HeaderValue, StatusCode as AxumStatus};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    use super::*;
    use crate::api::testing::{serve, within};
    use crate::models::AccessState;

    #[test]
    fn bearer_header_beats_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("__session=from-cookie; x=1"));
        assert_eq!(credential_from(&headers, "__session").as_deref(), Some("from-cookie"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        assert_eq!(credential_from(&headers, "__session").as_deref(), Some("from-header"));

        assert_eq!(credential_from(&HeaderMap::new(), "__session"), None);
    }

    #[test]
    fn access_flag_is_lenient() {
        assert!(access_granted(&json!({"access": true})));
        assert!(access_granted(&json!({"access": "TRUE"})));
        assert!(!access_granted(&json!({"access": "false"})));
        assert!(!access_granted(&json!({"access": 1})));
        assert!(!access_granted(&json!({})));
    }

    async fn identity() -> IdentityClient {
        let router = Router::new().route(
            "/sessions/introspect",
            get(|headers: AxumHeaders| async move {
                let token = headers
                    .get(SESSION_TOKEN_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                match token.as_str() {
                    "approved" => (
                        AxumStatus::OK,
                        Json(json!({
                            "userId": "u1",
                            "sid": "sess_1",
                            "organization": {"id": "o1", "publicMetadata": {"access": "True"}}
                        })),
                    ),
                    "no-org" => (AxumStatus::OK, Json(json!({"userId": "u2"}))),
                    "boom" => (AxumStatus::BAD_GATEWAY, Json(json!({}))),
                    _ => (AxumStatus::UNAUTHORIZED, Json(json!({}))),
                }
            }),
        );
        let base = serve(router).await;
        IdentityClient::new(reqwest::Client::new(), &base, "sk_test")
    }

    #[tokio::test]
    async fn introspection_maps_onto_sessions() {
        let client = identity().await;

        let session = within(resolve_session(&client, Some("approved"))).await.unwrap();
        assert_eq!(AccessState::of(&session), AccessState::AuthenticatedOrgAuthorized);
        assert_eq!(session.session_id.as_deref(), Some("sess_1"));

        let session = within(resolve_session(&client, Some("no-org"))).await.unwrap();
        assert_eq!(AccessState::of(&session), AccessState::AuthenticatedNoOrg);

        let session = within(resolve_session(&client, Some("expired"))).await.unwrap();
        assert!(session.is_anonymous());

        let err = within(resolve_session(&client, Some("boom"))).await.unwrap_err();
        assert!(matches!(err, GateError::Status { status: 502 }));
    }

    #[tokio::test]
    async fn no_credential_means_no_lookup() {
        // Unroutable address: any network call would fail the test.
        let client = IdentityClient::new(reqwest::Client::new(), "http://127.0.0.1:9", "sk");
        let session = resolve_session(&client, None).await.unwrap();
        assert!(session.is_anonymous());
    }
}
