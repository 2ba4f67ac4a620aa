// =============================================================================
// webhook.rs — THE IDENTITY PROVIDER CALLS US BACK
// =============================================================================
//
// Membership changes arrive as signed webhooks (Svix format):
//
//   svix-id:         msg_...
//   svix-timestamp:  unix seconds
//   svix-signature:  "v1,<base64> v1,<base64>"   (one per active key)
//
// signature = base64(HMAC-SHA256(key, "{id}.{timestamp}.{body}")), with the
// key being the base64 part of the `whsec_...` secret. Comparison is constant
// time and timestamps more than five minutes away from now are refused.
//
// What we do with a verified event:
//
//   organizationMembership.created  user metadata -> has org, pending approval
//   organizationMembership.deleted  if no memberships left -> no org
//   user.created                    acknowledged
//   anything else                   acknowledged, no action
// =============================================================================

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{info, warn};

use crate::gate::session::IdentityClient;

type HmacSha256 = Hmac<Sha256>;

pub const SECRET_PREFIX: &str = "whsec_";
pub const TOLERANCE_SECS: i64 = 5 * 60;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing webhook secret")]
    MissingSecret,

    #[error("invalid webhook secret")]
    InvalidSecret,

    #[error("missing svix headers")]
    MissingHeaders,

    #[error("invalid timestamp")]
    InvalidTimestamp,

    #[error("timestamp outside the tolerance window")]
    TimestampOutOfTolerance,

    #[error("error verifying webhook")]
    InvalidSignature,

    #[error("error parsing request body: {0}")]
    InvalidPayload(String),

    #[error("missing {0} data in event payload")]
    MissingData(&'static str),

    #[error("identity directory error: {0}")]
    Directory(String),
}

impl WebhookError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Directory(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "success": false, "message": self.to_string() }));
        (self.status_code(), body).into_response()
    }
}

/// Checks Svix signatures for one signing secret.
#[derive(Clone)]
pub struct WebhookVerifier {
    key: Vec<u8>,
}

impl WebhookVerifier {
    /// Accepts `whsec_<base64>`; a bare base64 key works too.
    pub fn from_secret(secret: &str) -> Result<Self, WebhookError> {
        let encoded = secret.trim();
        let encoded = encoded.strip_prefix(SECRET_PREFIX).unwrap_or(encoded);
        let key = STANDARD
            .decode(encoded)
            .map_err(|_| WebhookError::InvalidSecret)?;
        if key.is_empty() {
            return Err(WebhookError::InvalidSecret);
        }
        Ok(Self { key })
    }

    fn mac(&self, id: &str, timestamp: i64, body: &[u8]) -> Result<Vec<u8>, WebhookError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).map_err(|_| WebhookError::InvalidSecret)?;
        mac.update(format!("{id}.{timestamp}.").as_bytes());
        mac.update(body);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// The `svix-signature` value for a message. Handy for tests and tools.
    pub fn sign(&self, id: &str, timestamp: i64, body: &[u8]) -> Result<String, WebhookError> {
        Ok(format!("v1,{}", STANDARD.encode(self.mac(id, timestamp, body)?)))
    }

    pub fn verify(
        &self,
        headers: &HeaderMap,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), WebhookError> {
        let (Some(id), Some(timestamp), Some(signatures)) = (
            header(headers, "svix-id"),
            header(headers, "svix-timestamp"),
            header(headers, "svix-signature"),
        ) else {
            return Err(WebhookError::MissingHeaders);
        };

        let timestamp: i64 = timestamp
            .parse()
            .map_err(|_| WebhookError::InvalidTimestamp)?;
        if (now.timestamp() - timestamp).abs() > TOLERANCE_SECS {
            return Err(WebhookError::TimestampOutOfTolerance);
        }

        let expected = self.mac(id, timestamp, body)?;
        let matched = signatures
            .split_whitespace()
            .filter_map(|entry| entry.split_once(','))
            .filter(|(version, _)| *version == "v1")
            .filter_map(|(_, sig)| STANDARD.decode(sig).ok())
            .any(|candidate| bool::from(expected.as_slice().ct_eq(candidate.as_slice())));

        if matched {
            Ok(())
        } else {
            Err(WebhookError::InvalidSignature)
        }
    }
}

fn header<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// The user-directory half of the identity provider.
pub trait IdentityDirectory: Send + Sync {
    fn update_public_metadata<'a>(
        &'a self,
        user_id: &'a str,
        metadata: Value,
    ) -> BoxFuture<'a, Result<(), WebhookError>>;

    fn membership_count<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<u64, WebhookError>>;
}

#[derive(Debug, Deserialize)]
struct MembershipList {
    #[serde(default, alias = "totalCount")]
    total_count: u64,
}

impl IdentityDirectory for IdentityClient {
    fn update_public_metadata<'a>(
        &'a self,
        user_id: &'a str,
        metadata: Value,
    ) -> BoxFuture<'a, Result<(), WebhookError>> {
        Box::pin(async move {
            let url = self.url(&format!("/users/{}/metadata", urlencoding::encode(user_id)));
            let response = self
                .http()
                .patch(url)
                .bearer_auth(self.secret_key())
                .json(&json!({ "public_metadata": metadata }))
                .send()
                .await
                .map_err(|e| WebhookError::Directory(e.to_string()))?;
            if !response.status().is_success() {
                return Err(WebhookError::Directory(format!(
                    "metadata update answered {}",
                    response.status()
                )));
            }
            Ok(())
        })
    }

    fn membership_count<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<u64, WebhookError>> {
        Box::pin(async move {
            let url = self.url(&format!(
                "/users/{}/organization_memberships?limit=1",
                urlencoding::encode(user_id)
            ));
            let response = self
                .http()
                .get(url)
                .bearer_auth(self.secret_key())
                .send()
                .await
                .map_err(|e| WebhookError::Directory(e.to_string()))?;
            if !response.status().is_success() {
                return Err(WebhookError::Directory(format!(
                    "membership list answered {}",
                    response.status()
                )));
            }
            let list: MembershipList = response
                .json()
                .await
                .map_err(|e| WebhookError::Directory(e.to_string()))?;
            Ok(list.total_count)
        })
    }
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookAck {
    pub success: bool,
    pub message: String,
}

impl WebhookAck {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

fn string_at<'a>(data: &'a Value, pointer: &str) -> Option<&'a str> {
    data.pointer(pointer)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

/// Verify and act on one delivery.
pub async fn process(
    verifier: Option<&WebhookVerifier>,
    directory: &dyn IdentityDirectory,
    headers: &HeaderMap,
    body: &[u8],
    now: DateTime<Utc>,
) -> Result<WebhookAck, WebhookError> {
    let verifier = verifier.ok_or(WebhookError::MissingSecret)?;
    verifier.verify(headers, body, now)?;

    let event: WebhookEvent =
        serde_json::from_slice(body).map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;
    info!(event = %event.kind, "Identity webhook verified");

    match event.kind.as_str() {
        "user.created" => {
            let user = string_at(&event.data, "/id").unwrap_or("unknown");
            Ok(WebhookAck::ok(format!("user {user} registered")))
        }
        "organizationMembership.created" => {
            let user = string_at(&event.data, "/public_user_data/user_id")
                .ok_or(WebhookError::MissingData("user"))?;
            let org = string_at(&event.data, "/organization/id")
                .ok_or(WebhookError::MissingData("organization"))?;
            directory
                .update_public_metadata(
                    user,
                    json!({ "hasOrganization": true, "organizationId": org, "authorized": false }),
                )
                .await?;
            info!(user, org, "Membership created, organization pending approval");
            Ok(WebhookAck::ok(format!(
                "User {user} joined org {org}. Pending authorization."
            )))
        }
        "organizationMembership.deleted" => {
            let user = string_at(&event.data, "/public_user_data/user_id")
                .ok_or(WebhookError::MissingData("user"))?;
            let remaining = directory.membership_count(user).await?;
            if remaining == 0 {
                directory
                    .update_public_metadata(
                        user,
                        json!({ "hasOrganization": false, "organizationId": null, "authorized": false }),
                    )
                    .await?;
                info!(user, "Last membership removed, user has no organization");
            }
            Ok(WebhookAck::ok(format!(
                "Processed organization membership deletion for user {user}"
            )))
        }
        other => {
            warn!(event = other, "Unhandled identity webhook type");
            Ok(WebhookAck::ok(format!(
                "Event received but no specific handling for type: {other}"
            )))
        }
    }
}
