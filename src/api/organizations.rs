// =============================================================================
// api/organizations.rs — TENANT PROFILE
// =============================================================================
//
// The browser sends `PUT /api/organizations/update` with `{orgId, ...fields}`.
// The backend only knows `/api/organizations/current`, scoped by query
// string. This module owns that translation.
// =============================================================================

use serde_json::{Map, Value};

use super::error::ApiError;
use super::ApiClient;
use crate::models::OrganizationId;

pub const CURRENT_ORGANIZATION_PATH: &str = "/api/organizations/current";

/// A profile update split into its target tenant and the fields to write.
#[derive(Debug, Clone, PartialEq)]
pub struct OrganizationUpdate {
    pub organization_id: OrganizationId,
    pub fields: Map<String, Value>,
}

impl OrganizationUpdate {
    /// Pull `orgId` out of the payload, falling back to the active
    /// organization cookie. `None` when neither names a tenant.
    pub fn from_payload(payload: Value, cookie_org: Option<&str>) -> Option<Self> {
        let mut fields = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let from_body = match fields.remove("orgId") {
            Some(Value::String(id)) if !id.trim().is_empty() => Some(id),
            _ => None,
        };
        let organization_id = from_body
            .or_else(|| {
                cookie_org
                    .filter(|id| !id.trim().is_empty())
                    .map(str::to_string)
            })
            .map(OrganizationId)?;
        Some(Self {
            organization_id,
            fields,
        })
    }
}

#[derive(Clone)]
pub struct OrganizationsClient {
    api: ApiClient,
}

impl OrganizationsClient {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    pub async fn update(&self, update: &OrganizationUpdate) -> Result<Value, ApiError> {
        let url = self
            .api
            .endpoint(CURRENT_ORGANIZATION_PATH, Some(&update.organization_id))?;
        let response = self
            .api
            .send(|http| http.put(url.clone()).json(&update.fields))
            .await?;
        if !response.status().is_success() {
            return Err(ApiError::from_response(response).await);
        }
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::extract::{Json as JsonBody, Query};
    use axum::routing::put;
    use axum::{Json, Router};
    use serde_json::json;

    use super::*;
    use crate::api::testing::{client, serve, within};
    use crate::api::StaticToken;

    #[test]
    fn org_id_comes_from_body_first() {
        let update = OrganizationUpdate::from_payload(
            json!({"orgId": "o-body", "name": "Acme"}),
            Some("o-cookie"),
        )
        .unwrap();
        assert_eq!(update.organization_id.as_str(), "o-body");
        assert!(!update.fields.contains_key("orgId"));
        assert_eq!(update.fields["name"], "Acme");
    }

    #[test]
    fn cookie_is_the_fallback_and_nothing_means_none() {
        let update = OrganizationUpdate::from_payload(json!({"name": "Acme"}), Some("o-cookie"))
            .unwrap();
        assert_eq!(update.organization_id.as_str(), "o-cookie");
        assert!(OrganizationUpdate::from_payload(json!({"orgId": ""}), None).is_none());
    }

    #[tokio::test]
    async fn update_is_forwarded_to_current_with_org_query() {
        let router = Router::new().route(
            CURRENT_ORGANIZATION_PATH,
            put(
                |Query(q): Query<std::collections::HashMap<String, String>>,
                 JsonBody(body): JsonBody<Value>| async move {
                    Json(json!({"organizationId": q.get("organizationId"), "echo": body}))
                },
            ),
        );
        let base = serve(router).await;
        let orgs = OrganizationsClient::new(client(&base, Arc::new(StaticToken("t".into()))));
        let update =
            OrganizationUpdate::from_payload(json!({"orgId": "o1", "sector": "energy"}), None)
                .unwrap();

        let answer = within(orgs.update(&update)).await.unwrap();
        assert_eq!(answer["organizationId"], "o1");
        assert_eq!(answer["echo"], json!({"sector": "energy"}));
    }
}
