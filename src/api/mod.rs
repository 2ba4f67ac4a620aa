// =============================================================================
// api/mod.rs — THE ONE AND ONLY AUTHENTICATED FETCH
// =============================================================================
//
// Every call to the backend goes through `ApiClient::send`. It does three
// things and refuses to do a fourth:
//
//   1. attaches `Authorization: Bearer <token>`
//   2. on a 401, asks the TokenSource for a fresh token
//   3. retries exactly once with that token
//
// It never retries a second time. A second 401 becomes
// `ApiError::SessionExpired` and the human has to sign in again.
//
// Requests are described by a closure instead of a RequestBuilder because a
// RequestBuilder (multipart bodies especially) cannot be replayed. The closure
// is simply called again for the retry.
// =============================================================================

pub mod documents;
pub mod error;
pub mod organizations;
pub mod scoring;

use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::models::OrganizationId;
use self::error::ApiError;

/// Where bearer tokens come from.
///
/// `token` may hand back a cached value; `refresh` must not.
pub trait TokenSource: Send + Sync {
    fn token(&self) -> BoxFuture<'_, Result<String, ApiError>>;
    fn refresh(&self) -> BoxFuture<'_, Result<String, ApiError>>;
}

/// A fixed token. Useful for service-to-service calls and tests.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

impl TokenSource for StaticToken {
    fn token(&self) -> BoxFuture<'_, Result<String, ApiError>> {
        Box::pin(async move { Ok(self.0.clone()) })
    }

    fn refresh(&self) -> BoxFuture<'_, Result<String, ApiError>> {
        Box::pin(async move { Ok(self.0.clone()) })
    }
}

#[derive(Debug, Deserialize)]
struct MintedToken {
    jwt: String,
}

/// Mints short-lived session tokens from the identity provider and caches
/// the last one until a refresh is requested.
pub struct SessionTokenSource {
    http: reqwest::Client,
    identity_api_url: String,
    secret_key: String,
    session_id: String,
    cached: Mutex<Option<String>>,
}

impl SessionTokenSource {
    pub fn new(
        http: reqwest::Client,
        identity_api_url: impl Into<String>,
        secret_key: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            http,
            identity_api_url: identity_api_url.into(),
            secret_key: secret_key.into(),
            session_id: session_id.into(),
            cached: Mutex::new(None),
        }
    }

    async fn mint(&self) -> Result<String, ApiError> {
        let url = format!(
            "{}/sessions/{}/tokens",
            self.identity_api_url.trim_end_matches('/'),
            urlencoding::encode(&self.session_id)
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.secret_key)
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => {
                let minted: MintedToken = response
                    .json()
                    .await
                    .map_err(|e| ApiError::Decode(e.to_string()))?;
                *self.cached.lock() = Some(minted.jwt.clone());
                Ok(minted.jwt)
            }
            // The session is gone on the identity side; no token will ever come.
            StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND => {
                *self.cached.lock() = None;
                Err(ApiError::SessionExpired)
            }
            _ => Err(ApiError::from_response(response).await),
        }
    }
}

impl TokenSource for SessionTokenSource {
    fn token(&self) -> BoxFuture<'_, Result<String, ApiError>> {
        Box::pin(async move {
            let cached = self.cached.lock().clone();
            match cached {
                Some(token) => Ok(token),
                None => self.mint().await,
            }
        })
    }

    fn refresh(&self) -> BoxFuture<'_, Result<String, ApiError>> {
        Box::pin(async move {
            debug!(session = %self.session_id, "Minting a fresh session token");
            self.mint().await
        })
    }
}

/// Authenticated client for the BLever.AI backend.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
}

impl ApiClient {
    /// Share an existing connection pool.
    pub fn with_http(http: reqwest::Client, base_url: &str, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for `path`, scoped to `organization` when given.
    pub fn endpoint(
        &self,
        path: &str,
        organization: Option<&OrganizationId>,
    ) -> Result<Url, ApiError> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| ApiError::InvalidRequest(format!("{path}: {e}")))?;
        if let Some(org) = organization {
            url.query_pairs_mut()
                .append_pair("organizationId", org.as_str());
        }
        Ok(url)
    }

    /// Send a request with a bearer token, refreshing and retrying once on 401.
    ///
    /// Any status other than 401 is handed back untouched for the caller to
    /// interpret; only transport failures and a repeated 401 are errors here.
    pub async fn send<F>(&self, build: F) -> Result<reqwest::Response, ApiError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let token = self.tokens.token().await?;
        let response = build(&self.http).bearer_auth(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!("Backend said 401, refreshing token and retrying once");
        let token = self.tokens.refresh().await?;
        let response = build(&self.http).bearer_auth(&token).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!("Still 401 after token refresh, giving up");
            return Err(ApiError::SessionExpired);
        }
        Ok(response)
    }
}

// =============================================================================
// Shared test fixtures: an in-process fake backend
// =============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use std::future::Future;
    use std::net::SocketAddr;
    use std::sync::Arc;

    use futures::future::BoxFuture;
    use parking_lot::Mutex;

    use super::{ApiClient, ApiError, TokenSource};

    /// Serve `router` on an ephemeral port and return its base URL.
    pub async fn serve(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake backend");
        let addr: SocketAddr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{addr}")
    }

    /// Hands out `stale` until refreshed, then `fresh`. Counts refreshes.
    pub struct RotatingToken {
        pub current: Mutex<String>,
        pub fresh: String,
        pub refreshes: Mutex<u32>,
    }

    impl RotatingToken {
        pub fn new(stale: &str, fresh: &str) -> Arc<Self> {
            Arc::new(Self {
                current: Mutex::new(stale.to_string()),
                fresh: fresh.to_string(),
                refreshes: Mutex::new(0),
            })
        }
    }

    impl TokenSource for RotatingToken {
        fn token(&self) -> BoxFuture<'_, Result<String, ApiError>> {
            Box::pin(async move { Ok(self.current.lock().clone()) })
        }

        fn refresh(&self) -> BoxFuture<'_, Result<String, ApiError>> {
            Box::pin(async move {
                *self.refreshes.lock() += 1;
                *self.current.lock() = self.fresh.clone();
                Ok(self.fresh.clone())
            })
        }
    }

    pub fn client(base: &str, tokens: Arc<dyn TokenSource>) -> ApiClient {
        ApiClient::with_http(reqwest::Client::new(), base, tokens)
    }

    /// Await with a generous ceiling so a hung test fails instead of hanging.
    pub async fn within<T>(fut: impl Future<Output = T>) -> T {
        tokio::time::timeout(std::time::Duration::from_secs(5), fut)
            .await
            .expect("test future timed out")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;

    use super::testing::{client, serve, within, RotatingToken};
    use super::*;

    fn bearer(headers: &HeaderMap) -> String {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    #[tokio::test]
    async fn refreshes_once_on_401_then_succeeds() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let router = Router::new().route(
            "/ping",
            get(move |headers: HeaderMap| {
                let h = h.clone();
                async move {
                    h.fetch_add(1, Ordering::SeqCst);
                    if bearer(&headers) == "Bearer fresh" {
                        AxumStatus::OK
                    } else {
                        AxumStatus::UNAUTHORIZED
                    }
                }
            }),
        );
        let base = serve(router).await;
        let tokens = RotatingToken::new("stale", "fresh");
        let api = client(&base, tokens.clone());
        let url = api.endpoint("/ping", None).unwrap();

        let response = within(api.send(|http| http.get(url.clone()))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(*tokens.refreshes.lock(), 1);
    }

    #[tokio::test]
    async fn second_401_is_session_expired_not_a_loop() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let router = Router::new().route(
            "/ping",
            get(move || {
                let h = h.clone();
                async move {
                    h.fetch_add(1, Ordering::SeqCst);
                    AxumStatus::UNAUTHORIZED
                }
            }),
        );
        let base = serve(router).await;
        let tokens = RotatingToken::new("stale", "also-stale");
        let api = client(&base, tokens.clone());
        let url = api.endpoint("/ping", None).unwrap();

        let err = within(api.send(|http| http.get(url.clone())))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::SessionExpired));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(*tokens.refreshes.lock(), 1);
    }

    #[tokio::test]
    async fn session_tokens_are_cached_until_refreshed() {
        let mints = Arc::new(AtomicU32::new(0));
        let m = mints.clone();
        let identity = serve(Router::new().route(
            "/sessions/{id}/tokens",
            post(move |Path(id): Path<String>, headers: HeaderMap| {
                let m = m.clone();
                async move {
                    if bearer(&headers) != "Bearer sk_test" {
                        return AxumStatus::FORBIDDEN.into_response();
                    }
                    if id != "sess_1" {
                        return AxumStatus::NOT_FOUND.into_response();
                    }
                    let n = m.fetch_add(1, Ordering::SeqCst) + 1;
                    Json(json!({ "jwt": format!("jwt-{n}") })).into_response()
                }
            }),
        ))
        .await;

        let tokens = SessionTokenSource::new(reqwest::Client::new(), &identity, "sk_test", "sess_1");
        assert_eq!(within(tokens.token()).await.unwrap(), "jwt-1");
        assert_eq!(within(tokens.token()).await.unwrap(), "jwt-1");
        assert_eq!(mints.load(Ordering::SeqCst), 1);

        assert_eq!(within(tokens.refresh()).await.unwrap(), "jwt-2");
        assert_eq!(within(tokens.token()).await.unwrap(), "jwt-2");
        assert_eq!(mints.load(Ordering::SeqCst), 2);

        let gone = SessionTokenSource::new(reqwest::Client::new(), &identity, "sk_test", "sess_gone");
        assert!(matches!(
            within(gone.token()).await,
            Err(ApiError::SessionExpired)
        ));
    }

    #[tokio::test]
    async fn minted_tokens_drive_the_refresh_retry() {
        let mints = Arc::new(AtomicU32::new(0));
        let m = mints.clone();
        let identity = Router::new().route(
            "/sessions/{id}/tokens",
            post(move || {
                let m = m.clone();
                async move {
                    let n = m.fetch_add(1, Ordering::SeqCst) + 1;
                    Json(json!({ "jwt": format!("jwt-{n}") }))
                }
            }),
        );
        // Only the second minted token is accepted.
        let backend = Router::new().route(
            "/ping",
            get(|headers: HeaderMap| async move {
                if bearer(&headers) == "Bearer jwt-2" {
                    AxumStatus::OK
                } else {
                    AxumStatus::UNAUTHORIZED
                }
            }),
        );
        let identity = serve(identity).await;
        let base = serve(backend).await;
        let tokens = Arc::new(SessionTokenSource::new(
            reqwest::Client::new(),
            &identity,
            "sk_test",
            "sess_1",
        ));
        let api = client(&base, tokens);
        let url = api.endpoint("/ping", None).unwrap();

        let response = within(api.send(|http| http.get(url.clone()))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(mints.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn endpoint_scopes_by_organization() {
        let api = client("http://backend:3001/", Arc::new(StaticToken("t".into())));
        let url = api
            .endpoint("/api/esg/scores", Some(&OrganizationId::from("org 1")))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://backend:3001/api/esg/scores?organizationId=org+1"
        );
    }
}
