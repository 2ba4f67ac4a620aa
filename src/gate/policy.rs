// =============================================================================
// gate/policy.rs — THE BOUNCER'S RULEBOOK
// =============================================================================
//
// A pure function of (path, Session). No I/O, no clocks, no globals, so the
// same input always gets the same answer and every rule is unit-testable
// without an identity provider in sight.
//
// Precedence, first match wins:
//
//   1. exempt        framework internals and static assets      -> Continue
//   2. public        allowlist                                  -> Continue
//   3. signed in?    no  -> /sign-in?redirect_url=<original>
//   4. organization? no  -> /organization-selection
//   5. approved?     no  -> /demo-request (unless already there)
//   6.                                                          -> Continue
//
// Two path classes bend that ladder: onboarding paths stop after step 3
// (otherwise organization selection would redirect to itself) and
// org-only paths stop after step 4.
// =============================================================================

use serde::Serialize;
use tracing::debug;

use crate::models::Session;

/// Static file extensions that never need identity.
const EXEMPT_EXTENSIONS: &[&str] = &[
    "html", "htm", "css", "js", "jpg", "jpeg", "webp", "png", "gif", "svg", "ttf", "woff",
    "woff2", "ico", "csv", "doc", "docx", "xls", "xlsx", "zip", "webmanifest",
];

/// Framework internals and the gateway's own endpoints.
const EXEMPT_PREFIXES: &[&str] = &["/_next", "/_gateway"];

/// API routes are always gated, whatever their extension says.
const ALWAYS_GATED_PREFIXES: &[&str] = &["/api", "/trpc"];

/// What a path demands of its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RouteClassification {
    /// Exempt or allowlisted. Anyone may pass.
    Public,
    /// Signed in, nothing more.
    RequiresAuth,
    /// Signed in with an organization; approval not needed.
    RequiresOrg,
    /// The default: signed in, organization, approved.
    RequiresApproval,
}

/// Which rung of the ladder sent the caller away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RedirectReason {
    AuthRequired,
    OrganizationRequired,
    OrganizationUnapproved,
}

impl RedirectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RedirectReason::AuthRequired => "auth_required",
            RedirectReason::OrganizationRequired => "organization_required",
            RedirectReason::OrganizationUnapproved => "organization_unapproved",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum GateDecision {
    Continue,
    Redirect {
        reason: RedirectReason,
        location: String,
    },
}

impl GateDecision {
    pub fn is_continue(&self) -> bool {
        matches!(self, GateDecision::Continue)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatePolicy {
    pub public_paths: Vec<String>,
    pub onboarding_paths: Vec<String>,
    pub org_only_paths: Vec<String>,
    pub sign_in_path: String,
    pub org_selection_path: String,
    pub approval_path: String,
    pub exempt_prefixes: Vec<String>,
    pub exempt_extensions: Vec<String>,
}

impl Default for GatePolicy {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            public_paths: owned(&["/", "/sign-in", "/sign-up", "/demo-request", "/api/webhooks"]),
            onboarding_paths: owned(&["/organization-selection"]),
            org_only_paths: owned(&["/api/organizations/update"]),
            sign_in_path: "/sign-in".to_string(),
            org_selection_path: "/organization-selection".to_string(),
            approval_path: "/demo-request".to_string(),
            exempt_prefixes: owned(EXEMPT_PREFIXES),
            exempt_extensions: owned(EXEMPT_EXTENSIONS),
        }
    }
}

/// `"/"` only matches itself; anything else matches itself or a sub-path.
/// `/sign-in` covers `/sign-in/factor-one` but not `/sign-inside`.
pub fn path_matches(path: &str, entry: &str) -> bool {
    let entry = normalize(entry);
    if entry == "/" {
        return path == "/";
    }
    path == entry
        || path
            .strip_prefix(entry)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Drop the query string and any trailing slash (except on the root).
fn normalize(path: &str) -> &str {
    let path = path.split(['?', '#']).next().unwrap_or("");
    if path.is_empty() {
        return "/";
    }
    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

/// True when any segment is `.` or `..`, as written or after percent-decoding
/// (repeatedly, so `%252e` counts too). Backslashes count as separators.
/// Such a path is matched under one prefix here and served under another
/// once the upstream resolves it.
pub fn has_dot_segments(path: &str) -> bool {
    let path = path.split(['?', '#']).next().unwrap_or("");
    let mut current = path.to_string();
    for _ in 0..4 {
        if current.split(['/', '\\']).any(|seg| seg == "." || seg == "..") {
            return true;
        }
        let decoded = match urlencoding::decode(&current) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => break,
        };
        if decoded == current {
            break;
        }
        current = decoded;
    }
    false
}

impl GatePolicy {
    fn any_match(path: &str, entries: &[String]) -> bool {
        entries.iter().any(|e| path_matches(path, e))
    }

    /// Step 1. Framework internals and static files.
    pub fn is_exempt(&self, path: &str) -> bool {
        let path = normalize(path);
        if Self::any_match(path, &self.exempt_prefixes) {
            return true;
        }
        if ALWAYS_GATED_PREFIXES.iter().any(|p| path_matches(path, p)) {
            return false;
        }
        let last = path.rsplit('/').next().unwrap_or("");
        match last.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => {
                let ext = ext.to_ascii_lowercase();
                self.exempt_extensions.iter().any(|e| *e == ext)
            }
            _ => false,
        }
    }

    pub fn classify(&self, path: &str) -> RouteClassification {
        let path = normalize(path);
        if self.is_exempt(path) || Self::any_match(path, &self.public_paths) {
            RouteClassification::Public
        } else if Self::any_match(path, &self.onboarding_paths) {
            RouteClassification::RequiresAuth
        } else if Self::any_match(path, &self.org_only_paths) {
            RouteClassification::RequiresOrg
        } else {
            RouteClassification::RequiresApproval
        }
    }

    /// Decide one request. `target` is the path with its query string; the
    /// query only travels along in the sign-in callback.
    pub fn evaluate(&self, target: &str, session: &Session) -> GateDecision {
        let path = normalize(target);
        let class = self.classify(path);

        let decision = match class {
            RouteClassification::Public => GateDecision::Continue,
            _ if session.subject_id.is_none() => GateDecision::Redirect {
                reason: RedirectReason::AuthRequired,
                location: self.sign_in_location(target),
            },
            RouteClassification::RequiresAuth => GateDecision::Continue,
            _ if session.organization_id.is_none() => {
                self.redirect_unless_there(path, RedirectReason::OrganizationRequired)
            }
            RouteClassification::RequiresOrg => GateDecision::Continue,
            _ if !session.organization_approved => {
                self.redirect_unless_there(path, RedirectReason::OrganizationUnapproved)
            }
            RouteClassification::RequiresApproval => GateDecision::Continue,
        };

        debug!(path, ?class, ?decision, "Gate decision");
        decision
    }

    fn sign_in_location(&self, target: &str) -> String {
        let original = if target.starts_with('/') {
            target.to_string()
        } else {
            format!("/{target}")
        };
        format!(
            "{}?redirect_url={}",
            self.sign_in_path,
            urlencoding::encode(&original)
        )
    }

    /// Never redirect a page to itself.
    fn redirect_unless_there(&self, path: &str, reason: RedirectReason) -> GateDecision {
        let location = match reason {
            RedirectReason::OrganizationRequired => &self.org_selection_path,
            RedirectReason::OrganizationUnapproved => &self.approval_path,
            RedirectReason::AuthRequired => &self.sign_in_path,
        };
        if path_matches(path, location) {
            GateDecision::Continue
        } else {
            GateDecision::Redirect {
                reason,
                location: location.clone(),
            }
        }
    }
}
