// =============================================================================
// tracker.rs — THE ASYNC JOB TRACKER
// =============================================================================
//
// One tracker per organization view. It answers a single question for page
// code: "is a scoring job active for this tenant right now?"
//
//   start(org)   poll immediately, then every `poll_interval` while the job
//                is Queued or Running. Stops by itself on Completed, Failed
//                or Idle.
//   fetch_once() one poll. A second call while the first is still waiting
//                on the network returns immediately without a request.
//   stop()       cancel the timer AND any fetch in flight. Dropping the
//                tracker does the same.
//
// State is published through a `watch` channel so any number of views can
// subscribe without polling the tracker itself.
//
// Lifecycle:
//
//   Idle ──upload──▶ Queued ──picked up──▶ Running ──done──▶ Completed
//                      └──────────┴──decisive failure──▶ Failed
//   Completed ──new upload──▶ Queued
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::error::{ApiError, TrackerError};
use crate::backoff::{BackoffPolicy, RetryState};
use crate::models::{JobSnapshot, OrganizationId, ScoresResponse, ScoringJob, ScoringStatus};

/// Floor for the locally computed ETA. Nobody believes "0 minutes left".
const MIN_ETA: Duration = Duration::from_secs(60);

/// Anything that can answer "what is scoring doing for this tenant?".
pub trait StatusSource: Send + Sync {
    fn fetch_status<'a>(
        &'a self,
        organization: &'a OrganizationId,
    ) -> BoxFuture<'a, Result<ScoresResponse, ApiError>>;
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub poll_interval: Duration,
    pub backoff: BackoffPolicy,
    /// Typical end-to-end scoring time, used when the backend gives no ETA.
    pub expected_duration: Duration,
    pub failure_banner_threshold: u32,
    /// After an upload, a finished answer is taken to describe the previous
    /// job until the backend reports the new one or this much time passes.
    pub enqueue_grace: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(15_000),
            backoff: BackoffPolicy::default(),
            expected_duration: Duration::from_secs(600),
            failure_banner_threshold: 3,
            enqueue_grace: Duration::from_secs(60),
        }
    }
}

/// Why `fetch_once` did not talk to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    /// Another fetch is still outstanding.
    InFlight,
    /// Too soon after the last failure.
    BackingOff { remaining: Duration },
    /// `start` was never called.
    NoOrganization,
    /// The tracker switched organization while this fetch was in flight.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FetchOutcome {
    Skipped(SkipReason),
    Updated(ScoringStatus),
    Failed(TrackerError),
}

/// `etaMillis` from the backend wins. Otherwise count down from the usual
/// scoring time, never below a minute. No start time means no estimate.
pub fn estimate_eta(
    backend_eta: Option<u64>,
    started_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    expected: Duration,
) -> Option<u64> {
    if backend_eta.is_some() {
        return backend_eta;
    }
    let started_at = started_at?;
    let elapsed = (now - started_at).to_std().unwrap_or(Duration::ZERO);
    let remaining = expected.saturating_sub(elapsed).max(MIN_ETA);
    Some(remaining.as_millis() as u64)
}

struct TrackerState {
    job: ScoringJob,
    retry: RetryState,
    last_error: Option<TrackerError>,
    /// Bumped on organization switch so late answers for the old tenant
    /// are dropped.
    generation: u64,
    /// Set by an accepted upload, cleared once the backend reports the job.
    enqueued_at: Option<Instant>,
}

struct Inner {
    source: Arc<dyn StatusSource>,
    config: TrackerConfig,
    state: Mutex<TrackerState>,
    in_flight: AtomicBool,
    snapshots: watch::Sender<JobSnapshot>,
}

/// Clears the in-flight flag however the fetch ends, cancellation included.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Inner {
    fn snapshot_of(&self, state: &TrackerState) -> JobSnapshot {
        JobSnapshot {
            status: state.job.status,
            started_at: state.job.started_at,
            eta_millis: state.job.eta_millis,
            queue_position: state.job.queue_position,
            last_error: state.last_error.clone(),
            consecutive_failures: state.retry.consecutive_failures(),
            banner_threshold: self.config.failure_banner_threshold,
        }
    }

    fn publish(&self, state: &TrackerState) {
        self.snapshots.send_replace(self.snapshot_of(state));
    }

    async fn fetch_once(&self) -> FetchOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Status fetch already in flight, skipping");
            return FetchOutcome::Skipped(SkipReason::InFlight);
        }
        let _guard = InFlightGuard(&self.in_flight);

        let (organization, generation) = {
            let state = self.state.lock();
            let Some(org) = state.job.organization_id.clone() else {
                return FetchOutcome::Skipped(SkipReason::NoOrganization);
            };
            if let Some(remaining) = state.retry.remaining(Instant::now()) {
                return FetchOutcome::Skipped(SkipReason::BackingOff { remaining });
            }
            (org, state.generation)
        };

        let result = self.source.fetch_status(&organization).await;
        self.apply(generation, result)
    }

    fn apply(&self, generation: u64, result: Result<ScoresResponse, ApiError>) -> FetchOutcome {
        let mut state = self.state.lock();
        if state.generation != generation {
            return FetchOutcome::Skipped(SkipReason::Superseded);
        }

        let outcome = match result {
            Ok(ScoresResponse::InProgress {
                running,
                started_at,
                queue_position,
                eta_millis,
            }) => {
                let status = if running || started_at.is_some() {
                    ScoringStatus::Running
                } else {
                    ScoringStatus::Queued
                };
                state.job.status = status;
                state.job.started_at = started_at;
                state.job.queue_position = queue_position;
                state.job.eta_millis = estimate_eta(
                    eta_millis,
                    started_at,
                    Utc::now(),
                    self.config.expected_duration,
                );
                state.enqueued_at = None;
                state.retry.record_success();
                state.last_error = None;
                FetchOutcome::Updated(status)
            }
            Ok(ScoresResponse::Ready { .. })
                if state
                    .enqueued_at
                    .is_some_and(|at| at.elapsed() < self.config.enqueue_grace) =>
            {
                debug!("Finished answer predates the new upload, still queued");
                state.retry.record_success();
                state.last_error = None;
                FetchOutcome::Updated(ScoringStatus::Queued)
            }
            Ok(ScoresResponse::Ready { failed, .. }) => {
                let status = if failed {
                    ScoringStatus::Failed
                } else {
                    ScoringStatus::Completed
                };
                state.job.status = status;
                state.job.queue_position = None;
                state.job.eta_millis = None;
                state.enqueued_at = None;
                state.retry.record_success();
                state.last_error = None;
                FetchOutcome::Updated(status)
            }
            Err(ApiError::OperationRestricted { started_at }) => {
                mark_running(&mut state, started_at, self.config.expected_duration);
                state.retry.record_success();
                let err = TrackerError::UploadBlocked {
                    started_at: state.job.started_at,
                };
                state.last_error = Some(err.clone());
                FetchOutcome::Failed(err)
            }
            Err(e) if e.is_transient() => {
                state.retry.record_failure(Instant::now());
                let err = TrackerError::from(&e);
                state.last_error = Some(err.clone());
                FetchOutcome::Failed(err)
            }
            Err(e) => {
                warn!(error = %e, "Status poll failed decisively");
                if state.job.status.is_active() {
                    state.job.status = ScoringStatus::Failed;
                }
                state.job.eta_millis = None;
                state.enqueued_at = None;
                let err = TrackerError::from(&e);
                state.last_error = Some(err.clone());
                FetchOutcome::Failed(err)
            }
        };

        self.publish(&state);
        outcome
    }

    /// How long to sleep before the next tick, or `None` to stop polling.
    fn next_wait(&self, outcome: &FetchOutcome) -> Option<Duration> {
        let interval = self.config.poll_interval;
        match outcome {
            FetchOutcome::Updated(status) if status.is_active() => Some(interval),
            FetchOutcome::Updated(_) => None,
            FetchOutcome::Skipped(SkipReason::BackingOff { remaining }) => Some(*remaining),
            FetchOutcome::Skipped(SkipReason::InFlight) => Some(interval),
            FetchOutcome::Skipped(SkipReason::NoOrganization | SkipReason::Superseded) => None,
            FetchOutcome::Failed(TrackerError::UploadBlocked { .. }) => Some(interval),
            FetchOutcome::Failed(TrackerError::Transient { .. }) => {
                let backoff = self
                    .state
                    .lock()
                    .retry
                    .remaining(Instant::now())
                    .unwrap_or(Duration::ZERO);
                Some(interval.max(backoff))
            }
            FetchOutcome::Failed(TrackerError::SessionExpired | TrackerError::Rejected { .. }) => {
                None
            }
        }
    }
}

fn mark_running(state: &mut TrackerState, started_at: Option<DateTime<Utc>>, expected: Duration) {
    // A new start time invalidates whatever ETA the previous job left behind.
    let fresh_start = started_at.is_some() && started_at != state.job.started_at;
    state.job.status = ScoringStatus::Running;
    state.job.started_at = started_at.or(state.job.started_at);
    state.enqueued_at = None;
    let known = if fresh_start { None } else { state.job.eta_millis };
    state.job.eta_millis = estimate_eta(known, state.job.started_at, Utc::now(), expected);
}

async fn poll_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let outcome = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            outcome = inner.fetch_once() => outcome,
        };
        let Some(wait) = inner.next_wait(&outcome) else {
            debug!(?outcome, "Polling finished");
            break;
        };
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

struct Poller {
    organization: OrganizationId,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Poller {
    fn cancel(self) {
        let _ = self.shutdown.send(true);
        self.handle.abort();
    }
}

/// The Async Job Tracker.
pub struct ScoringTracker {
    inner: Arc<Inner>,
    poller: Mutex<Option<Poller>>,
}

impl ScoringTracker {
    pub fn new(source: Arc<dyn StatusSource>, config: TrackerConfig) -> Self {
        let (snapshots, _) = watch::channel(JobSnapshot {
            banner_threshold: config.failure_banner_threshold,
            ..JobSnapshot::default()
        });
        Self {
            inner: Arc::new(Inner {
                source,
                state: Mutex::new(TrackerState {
                    job: ScoringJob::default(),
                    retry: RetryState::new(config.backoff),
                    last_error: None,
                    generation: 0,
                    enqueued_at: None,
                }),
                config,
                in_flight: AtomicBool::new(false),
                snapshots,
            }),
            poller: Mutex::new(None),
        }
    }

    /// Start polling for `organization`. Calling it again for the same
    /// organization while polling is a no-op; a different organization
    /// resets the tracker first.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, organization: OrganizationId) {
        let mut poller = self.poller.lock();
        if let Some(current) = poller.as_ref() {
            if current.organization == organization && !current.handle.is_finished() {
                return;
            }
        }
        if let Some(previous) = poller.take() {
            previous.cancel();
        }

        {
            let mut state = self.inner.state.lock();
            if state.job.organization_id.as_ref() != Some(&organization) {
                state.generation += 1;
                state.job = ScoringJob::idle(organization.clone());
                state.retry.reset();
                state.last_error = None;
                state.enqueued_at = None;
                self.inner.publish(&state);
            }
        }

        info!(org = %organization, "Scoring tracker started");
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(poll_loop(Arc::clone(&self.inner), rx));
        *poller = Some(Poller {
            organization,
            shutdown,
            handle,
        });
    }

    /// Like `start`, but always begins a fresh polling loop, even if one is
    /// already running for this organization.
    pub fn restart(&self, organization: OrganizationId) {
        if let Some(previous) = self.poller.lock().take() {
            previous.cancel();
        }
        self.start(organization);
    }

    /// One status poll. Reentrant-safe.
    pub async fn fetch_once(&self) -> FetchOutcome {
        self.inner.fetch_once().await
    }

    /// Cancel the timer and any fetch still in flight.
    pub fn stop(&self) {
        if let Some(poller) = self.poller.lock().take() {
            debug!(org = %poller.organization, "Scoring tracker stopped");
            poller.cancel();
        }
    }

    pub fn is_polling(&self) -> bool {
        self.poller
            .lock()
            .as_ref()
            .is_some_and(|p| !p.handle.is_finished())
    }

    /// The backend refused a mutation because scoring is running. Reflect
    /// that immediately instead of waiting for the next poll.
    pub fn observe_restriction(&self, started_at: Option<DateTime<Utc>>) {
        let mut state = self.inner.state.lock();
        mark_running(&mut state, started_at, self.inner.config.expected_duration);
        state.last_error = Some(TrackerError::UploadBlocked {
            started_at: state.job.started_at,
        });
        self.inner.publish(&state);
    }

    /// The backend accepted documents and will enqueue a new job.
    pub fn observe_enqueued(&self) {
        let mut state = self.inner.state.lock();
        state.job.status = ScoringStatus::Queued;
        state.job.started_at = None;
        state.job.queue_position = None;
        state.job.eta_millis = None;
        state.last_error = None;
        state.enqueued_at = Some(Instant::now());
        self.inner.publish(&state);
    }

    pub fn organization(&self) -> Option<OrganizationId> {
        self.inner.state.lock().job.organization_id.clone()
    }

    pub fn job(&self) -> ScoringJob {
        self.inner.state.lock().job.clone()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.inner.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobSnapshot> {
        self.inner.snapshots.subscribe()
    }
}

impl Drop for ScoringTracker {
    fn drop(&mut self) {
        self.stop();
    }
}
