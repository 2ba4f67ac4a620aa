// =============================================================================
// trackers.rs — ONE TRACKER PER SIGNED-IN TENANT VIEW
// =============================================================================
//
// The gateway serves many browsers at once. Each (session, organization)
// pair gets its own ScoringTracker and UploadGate, talking to the backend
// with tokens minted for that session. Entries nobody has asked about for
// `idle_ttl` are swept on the next lookup; dropping the last handle stops
// the tracker's poller.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::api::documents::DocumentsClient;
use crate::api::scoring::ScoringClient;
use crate::api::{ApiClient, SessionTokenSource};
use crate::models::{OrganizationId, ScoringStatus};
use crate::tracker::{ScoringTracker, TrackerConfig};
use crate::upload::{UploadGate, UploadLimits};

/// How long a brand new tracker may take to get its first answer before the
/// caller is handed the idle snapshot instead.
const FIRST_ANSWER_WAIT: Duration = Duration::from_secs(5);

/// Handles for one tenant view.
#[derive(Clone)]
pub struct TrackedView {
    pub tracker: Arc<ScoringTracker>,
    pub uploads: Arc<UploadGate>,
}

struct Entry {
    view: TrackedView,
    last_seen: Instant,
}

type Key = (String, OrganizationId);

pub struct TrackerRegistry {
    http: reqwest::Client,
    api_base_url: String,
    identity_api_url: String,
    identity_secret_key: String,
    config: TrackerConfig,
    limits: UploadLimits,
    idle_ttl: Duration,
    entries: Mutex<HashMap<Key, Entry>>,
}

impl TrackerRegistry {
    pub fn new(
        http: reqwest::Client,
        api_base_url: &str,
        identity_api_url: &str,
        identity_secret_key: &str,
        config: TrackerConfig,
        limits: UploadLimits,
        idle_ttl: Duration,
    ) -> Self {
        Self {
            http,
            api_base_url: api_base_url.to_string(),
            identity_api_url: identity_api_url.to_string(),
            identity_secret_key: identity_secret_key.to_string(),
            config,
            limits,
            idle_ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> &UploadLimits {
        &self.limits
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The tracker and upload gate for this session and tenant, started.
    ///
    /// A view created by this call waits briefly for its first status answer
    /// so the caller does not report a job as idle before anyone asked.
    pub async fn acquire(&self, session_id: &str, organization: &OrganizationId) -> TrackedView {
        let (view, created) = self.get_or_create(session_id, organization);

        if created {
            view.tracker.start(organization.clone());
            let mut updates = view.tracker.subscribe();
            let first = updates.wait_for(|s| s.status != ScoringStatus::Idle || s.last_error.is_some());
            if tokio::time::timeout(FIRST_ANSWER_WAIT, first).await.is_err() {
                debug!(org = %organization, "No first status answer yet");
            }
        } else {
            view.tracker.start(organization.clone());
        }
        view
    }

    fn get_or_create(&self, session_id: &str, organization: &OrganizationId) -> (TrackedView, bool) {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.last_seen) <= self.idle_ttl);
        if entries.len() < before {
            info!(swept = before - entries.len(), "Idle scoring trackers dropped");
        }

        let key = (session_id.to_string(), organization.clone());
        if let Some(entry) = entries.get_mut(&key) {
            entry.last_seen = now;
            return (entry.view.clone(), false);
        }

        let tokens = Arc::new(SessionTokenSource::new(
            self.http.clone(),
            self.identity_api_url.as_str(),
            self.identity_secret_key.as_str(),
            session_id,
        ));
        let api = ApiClient::with_http(self.http.clone(), &self.api_base_url, tokens);
        let tracker = Arc::new(ScoringTracker::new(
            Arc::new(ScoringClient::new(api.clone())),
            self.config.clone(),
        ));
        let uploads = Arc::new(UploadGate::new(
            DocumentsClient::new(api),
            tracker.clone(),
            self.limits.clone(),
        ));
        let view = TrackedView { tracker, uploads };
        entries.insert(
            key,
            Entry {
                view: view.clone(),
                last_seen: now,
            },
        );
        debug!(org = %organization, "Scoring tracker created");
        (view, true)
    }
}
