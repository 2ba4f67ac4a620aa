// =============================================================================
// config.rs — THE CONTROL PANEL
// =============================================================================
//
// Every knob the gateway has, loaded from BLEVER_* environment variables
// with defaults that work on a laptop with the backend on :3001 and the
// frontend on :3000.
//
// Numbers that fail to parse fall back to their default rather than killing
// the process. A typo in a poll interval should not take the login page down.
// =============================================================================

use std::env;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::gate::policy::GatePolicy;
use crate::tracker::TrackerConfig;
use crate::upload::UploadLimits;

#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // NETWORK
    // =========================================================================

    /// Where the gateway listens. Default: 0.0.0.0:8080
    pub bind_addr: String,

    /// Base URL of the scoring/documents/organizations backend.
    pub api_base_url: String,

    /// Upstream that renders the actual pages once the gate lets a request by.
    pub frontend_url: String,

    /// Identity provider admin API (session introspection, user metadata).
    pub identity_api_url: String,

    /// Bearer credential for the identity admin API.
    pub identity_secret_key: String,

    /// `whsec_...` secret for identity webhooks. `None` disables the route.
    pub webhook_secret: Option<String>,

    /// Timeout for every outbound HTTP call.
    pub request_timeout: Duration,

    // =========================================================================
    // ACCESS GATE
    // =========================================================================

    pub session_cookie: String,
    pub public_paths: Vec<String>,
    pub onboarding_paths: Vec<String>,
    pub org_only_paths: Vec<String>,
    pub sign_in_path: String,
    pub org_selection_path: String,
    pub approval_path: String,

    // =========================================================================
    // SCORING TRACKER
    // =========================================================================

    /// Poll interval while a job is queued or running. Default: 15 s.
    pub poll_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,

    /// How long scoring usually takes; ETA falls back to this. Default: 10 min.
    pub expected_scoring_duration: Duration,

    /// Consecutive transient failures before the UI shows a banner.
    pub failure_banner_threshold: u32,

    /// After an upload, how long a finished answer is taken to be the
    /// previous job's. Default: 60 s.
    pub enqueue_grace: Duration,

    /// Trackers nobody has asked about for this long are dropped. Default: 15 min.
    pub tracker_idle: Duration,

    // =========================================================================
    // UPLOADS
    // =========================================================================
    pub max_files: usize,
    pub max_file_bytes: u64,
}

impl Config {
    /// Load configuration from the environment (and `.env`, if present).
    pub fn from_env() -> Self {
        // A missing .env file is fine; not every deployment has one.
        let _ = dotenvy::dotenv();

        Config {
            bind_addr: env_or_default("BLEVER_BIND_ADDR", "0.0.0.0:8080"),
            api_base_url: env_or_default("BLEVER_API_BASE_URL", "http://localhost:3001"),
            frontend_url: env_or_default("BLEVER_FRONTEND_URL", "http://localhost:3000"),
            identity_api_url: env_or_default(
                "BLEVER_IDENTITY_API_URL",
                "https://api.clerk.com/v1",
            ),
            identity_secret_key: env_or_default("BLEVER_IDENTITY_SECRET_KEY", ""),
            webhook_secret: env::var("BLEVER_WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            request_timeout: Duration::from_secs(
                env_or_default("BLEVER_REQUEST_TIMEOUT_SECS", "20").parse().unwrap_or(20),
            ),

            session_cookie: env_or_default("BLEVER_SESSION_COOKIE", "__session"),
            public_paths: env_list(
                "BLEVER_PUBLIC_PATHS",
                "/,/sign-in,/sign-up,/demo-request,/api/webhooks",
            ),
            onboarding_paths: env_list("BLEVER_ONBOARDING_PATHS", "/organization-selection"),
            org_only_paths: env_list("BLEVER_ORG_ONLY_PATHS", "/api/organizations/update"),
            sign_in_path: env_or_default("BLEVER_SIGN_IN_PATH", "/sign-in"),
            org_selection_path: env_or_default(
                "BLEVER_ORG_SELECTION_PATH",
                "/organization-selection",
            ),
            approval_path: env_or_default("BLEVER_APPROVAL_PATH", "/demo-request"),

            poll_interval: Duration::from_millis(
                env_or_default("BLEVER_POLL_INTERVAL_MS", "15000").parse().unwrap_or(15_000),
            ),
            backoff_base: Duration::from_millis(
                env_or_default("BLEVER_BACKOFF_BASE_MS", "1000").parse().unwrap_or(1_000),
            ),
            backoff_cap: Duration::from_millis(
                env_or_default("BLEVER_BACKOFF_CAP_MS", "30000").parse().unwrap_or(30_000),
            ),
            expected_scoring_duration: Duration::from_secs(
                env_or_default("BLEVER_EXPECTED_SCORING_SECS", "600").parse().unwrap_or(600),
            ),
            failure_banner_threshold: env_or_default("BLEVER_FAILURE_BANNER_THRESHOLD", "3")
                .parse()
                .unwrap_or(3),
            enqueue_grace: Duration::from_secs(
                env_or_default("BLEVER_ENQUEUE_GRACE_SECS", "60").parse().unwrap_or(60),
            ),
            tracker_idle: Duration::from_secs(
                env_or_default("BLEVER_TRACKER_IDLE_SECS", "900").parse().unwrap_or(900),
            ),

            max_files: env_or_default("BLEVER_MAX_FILES", "10").parse().unwrap_or(10),
            max_file_bytes: env_or_default("BLEVER_MAX_FILE_BYTES", "10485760")
                .parse()
                .unwrap_or(10 * 1024 * 1024),
        }
    }

    pub fn gate_policy(&self) -> GatePolicy {
        GatePolicy {
            public_paths: self.public_paths.clone(),
            onboarding_paths: self.onboarding_paths.clone(),
            org_only_paths: self.org_only_paths.clone(),
            sign_in_path: self.sign_in_path.clone(),
            org_selection_path: self.org_selection_path.clone(),
            approval_path: self.approval_path.clone(),
            ..GatePolicy::default()
        }
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            poll_interval: self.poll_interval,
            backoff: BackoffPolicy {
                base: self.backoff_base,
                cap: self.backoff_cap,
            },
            expected_duration: self.expected_scoring_duration,
            failure_banner_threshold: self.failure_banner_threshold,
            enqueue_grace: self.enqueue_grace,
        }
    }

    pub fn upload_limits(&self) -> UploadLimits {
        UploadLimits {
            max_files: self.max_files,
            max_file_bytes: self.max_file_bytes,
            ..UploadLimits::default()
        }
    }
}

/// Read an environment variable, falling back to `default`.
fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Comma-separated list, trimmed, empties dropped.
fn env_list(key: &str, default: &str) -> Vec<String> {
    parse_list(&env_or_default(key, default))
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_parsing_trims_and_drops_empties() {
        assert_eq!(
            parse_list(" /, /sign-in ,,/demo-request "),
            vec!["/", "/sign-in", "/demo-request"]
        );
    }
}
