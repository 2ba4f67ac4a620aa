// ═══════════════════════════════════════════════════════════════
// METRICS COLLECTOR - What the gate did, counted
// ═══════════════════════════════════════════════════════════════
//
// Atomic counters, no locks. Every request bumps exactly one of
// `rejected_paths`, `exempt`, `continues` or one redirect counter, so
//
//     requests_total = rejected_paths + exempt + continues + redirects_*
//
// holds at any quiet moment. Served as JSON on GET /_gateway/metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::gate::policy::RedirectReason;

/// The metrics snapshot - what gets serialized to JSON
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub rejected_paths: u64,
    pub exempt: u64,
    pub continues: u64,
    pub redirects_sign_in: u64,
    pub redirects_organization_selection: u64,
    pub redirects_approval: u64,
    pub session_lookup_failures: u64,
    pub webhook_deliveries: u64,
    pub webhook_rejections: u64,
    pub proxy_errors: u64,
    pub uptime_seconds: u64,
    pub requests_per_minute: f64,
    pub status: String,
}

pub struct GatewayMetrics {
    requests_total: AtomicU64,
    rejected_paths: AtomicU64,
    exempt: AtomicU64,
    continues: AtomicU64,
    redirects_sign_in: AtomicU64,
    redirects_organization_selection: AtomicU64,
    redirects_approval: AtomicU64,
    session_lookup_failures: AtomicU64,
    webhook_deliveries: AtomicU64,
    webhook_rejections: AtomicU64,
    proxy_errors: AtomicU64,
    start_time: Instant,
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            rejected_paths: AtomicU64::new(0),
            exempt: AtomicU64::new(0),
            continues: AtomicU64::new(0),
            redirects_sign_in: AtomicU64::new(0),
            redirects_organization_selection: AtomicU64::new(0),
            redirects_approval: AtomicU64::new(0),
            session_lookup_failures: AtomicU64::new(0),
            webhook_deliveries: AtomicU64::new(0),
            webhook_rejections: AtomicU64::new(0),
            proxy_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn increment_requests(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rejected_paths(&self) {
        self.rejected_paths.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_exempt(&self) {
        self.exempt.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_continues(&self) {
        self.continues.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_redirects(&self, reason: RedirectReason) {
        let counter = match reason {
            RedirectReason::AuthRequired => &self.redirects_sign_in,
            RedirectReason::OrganizationRequired => &self.redirects_organization_selection,
            RedirectReason::OrganizationUnapproved => &self.redirects_approval,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_session_lookup_failures(&self) {
        self.session_lookup_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_webhook_deliveries(&self) {
        self.webhook_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_webhook_rejections(&self) {
        self.webhook_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_proxy_errors(&self) {
        self.proxy_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of all metrics (lock-free reads)
    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime = self.start_time.elapsed().as_secs();
        let requests_total = self.requests_total.load(Ordering::Relaxed);
        let requests_per_minute = if uptime > 0 {
            (requests_total as f64 / uptime as f64) * 60.0
        } else {
            0.0
        };

        MetricsSnapshot {
            requests_total,
            rejected_paths: self.rejected_paths.load(Ordering::Relaxed),
            exempt: self.exempt.load(Ordering::Relaxed),
            continues: self.continues.load(Ordering::Relaxed),
            redirects_sign_in: self.redirects_sign_in.load(Ordering::Relaxed),
            redirects_organization_selection: self
                .redirects_organization_selection
                .load(Ordering::Relaxed),
            redirects_approval: self.redirects_approval.load(Ordering::Relaxed),
            session_lookup_failures: self.session_lookup_failures.load(Ordering::Relaxed),
            webhook_deliveries: self.webhook_deliveries.load(Ordering::Relaxed),
            webhook_rejections: self.webhook_rejections.load(Ordering::Relaxed),
            proxy_errors: self.proxy_errors.load(Ordering::Relaxed),
            uptime_seconds: uptime,
            requests_per_minute,
            status: "operational".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirects_are_counted_per_target() {
        let metrics = GatewayMetrics::new();
        metrics.increment_redirects(RedirectReason::AuthRequired);
        metrics.increment_redirects(RedirectReason::AuthRequired);
        metrics.increment_redirects(RedirectReason::OrganizationUnapproved);

        let snap = metrics.snapshot();
        assert_eq!(snap.redirects_sign_in, 2);
        assert_eq!(snap.redirects_organization_selection, 0);
        assert_eq!(snap.redirects_approval, 1);
        assert_eq!(snap.status, "operational");
    }
}
