//! Top-level promotion workflow: gate -> canary -> commit/rollback.
//!
//! Run phases:
//! - Evaluating (accuracy gate)
//! - Admitted / Rejected
//! - Canarying
//! - Promoting / Reverting
//! - terminal: Promoted, Rejected, RolledBack (CommitFailed reported as a
//!   failed run with the candidate parked canary-staged at 0% traffic)
//!
//! The controller is the single writer of ledger transitions; the gate and
//! the canary controller only propose outcomes. One workflow runs at a
//! time, enforced by the store's in-flight guard.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::canary::{CanaryConfig, CanaryController, CanaryOutcome};
use crate::error::PromotionError;
use crate::gate::{self, GateDecision, GatePolicy};
use crate::metrics::PROMOTION_METRICS;
use crate::notifier::{Notifier, NotifyEvent};
use crate::resilience::{retry_async, RetryConfig};
use crate::serving::{ServingError, ServingRuntime};
use crate::version_store::{VersionStatus, VersionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Evaluating,
    Admitted,
    Canarying,
    Promoting,
    Reverting,
}

/// Terminal outcome of one promotion run. Infrastructure and invariant
/// errors that prevent reaching a terminal state surface as
/// `Err(PromotionError)` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionOutcome {
    Promoted { version: u64 },
    Rejected { version: u64, reason: String },
    RolledBack { version: u64, reason: String },
    CommitFailed { version: u64, reason: String },
}

impl PromotionOutcome {
    /// CLI exit code contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Promoted { .. } => 0,
            Self::Rejected { .. } => 2,
            Self::RolledBack { .. } => 3,
            Self::CommitFailed { .. } => 4,
        }
    }
}

pub struct PromotionController {
    store: Arc<VersionStore>,
    runtime: Arc<dyn ServingRuntime>,
    canary: CanaryController,
    notifier: Arc<dyn Notifier>,
    policy: GatePolicy,
    reload_timeout: Duration,
    reload_retry: RetryConfig,
}

impl PromotionController {
    pub fn new(
        store: Arc<VersionStore>,
        runtime: Arc<dyn ServingRuntime>,
        notifier: Arc<dyn Notifier>,
        policy: GatePolicy,
        canary_config: CanaryConfig,
    ) -> Self {
        let canary = CanaryController::new(runtime.clone(), canary_config);
        Self {
            store,
            runtime,
            canary,
            notifier,
            policy,
            reload_timeout: Duration::from_secs(15),
            reload_retry: RetryConfig::default(),
        }
    }

    pub fn with_reload_timeout(mut self, timeout: Duration) -> Self {
        self.reload_timeout = timeout;
        self
    }

    pub fn with_reload_retry(mut self, retry: RetryConfig) -> Self {
        self.reload_retry = retry;
        self
    }

    /// Startup recovery: force-revert any canary stranded by an unclean
    /// shutdown, resetting the runtime's traffic split to the baseline.
    /// Must run before the first `run` call on a restarted controller.
    pub async fn recover(&self) -> Result<(), PromotionError> {
        let reverted = self.store.recover()?;
        if reverted.is_empty() {
            return Ok(());
        }
        let baseline = self.store.get_active();
        for id in reverted {
            if let Some(base) = &baseline {
                self.call_runtime(|| self.runtime.set_traffic_split(base.id, 1.0, id, 0.0))
                    .await
                    .map_err(PromotionError::infra)?;
            }
            self.notifier
                .notify(NotifyEvent::RolledBack, &format!("version {id}: force-reverted on startup"))
                .await;
        }
        Ok(())
    }

    /// Execute one full promotion workflow for a freshly trained candidate.
    pub async fn run(
        &self,
        accuracy: f64,
        artifact_path: &str,
        cancel: watch::Receiver<bool>,
    ) -> Result<PromotionOutcome, PromotionError> {
        let run_id = Uuid::new_v4();
        let mut phase = RunPhase::Idle;
        self.enter(run_id, &mut phase, RunPhase::Evaluating);

        let candidate = self.store.record_candidate(accuracy, artifact_path)?;
        let baseline = self.store.get_active();

        match gate::evaluate(&candidate, baseline.as_ref(), &self.policy) {
            GateDecision::Admit => {
                self.enter(run_id, &mut phase, RunPhase::Admitted);
            }
            GateDecision::Reject { reason } => {
                self.store.transition(candidate.id, VersionStatus::Rejected)?;
                PROMOTION_METRICS.rejections_total.inc();
                self.notifier
                    .notify(
                        NotifyEvent::Rejected,
                        &format!("version {} ({:.4}): {reason}", candidate.id, accuracy),
                    )
                    .await;
                return Ok(PromotionOutcome::Rejected { version: candidate.id, reason });
            }
        }

        // Make the candidate serveable before exposing it to traffic.
        if let Err(e) = self
            .call_runtime(|| self.runtime.load_version(candidate.id, &candidate.artifact_path))
            .await
        {
            warn!(version = candidate.id, error = %e, "candidate artifact not loadable");
            self.store.transition(candidate.id, VersionStatus::Rejected)?;
            if e.is_transient() {
                // Ledger is consistent; surface the fault to the caller.
                return Err(PromotionError::infra(e));
            }
            let reason = "artifact_load_failed".to_string();
            PROMOTION_METRICS.rejections_total.inc();
            self.notifier
                .notify(NotifyEvent::Rejected, &format!("version {}: {e}", candidate.id))
                .await;
            return Ok(PromotionOutcome::Rejected { version: candidate.id, reason });
        }

        let Some(baseline) = baseline else {
            // First-ever version: nothing is serving, so there is no
            // comparative signal to collect. Commit directly.
            info!(version = candidate.id, "no serving baseline, committing without canary");
            self.store.transition(candidate.id, VersionStatus::Canary)?;
            self.enter(run_id, &mut phase, RunPhase::Promoting);
            return self.commit(candidate.id, None).await;
        };

        self.enter(run_id, &mut phase, RunPhase::Canarying);
        self.store.transition(candidate.id, VersionStatus::Canary)?;

        match self.canary.run_trial(candidate.id, baseline.id, cancel).await {
            CanaryOutcome::Promote => {
                self.enter(run_id, &mut phase, RunPhase::Promoting);
                self.commit(candidate.id, Some(baseline.id)).await
            }
            CanaryOutcome::Abort { reason } => {
                self.enter(run_id, &mut phase, RunPhase::Reverting);
                // Traffic is already back on the baseline; record it.
                self.store.transition(candidate.id, VersionStatus::RolledBack)?;
                PROMOTION_METRICS.rollbacks_total.inc();
                self.notifier
                    .notify(
                        NotifyEvent::RolledBack,
                        &format!("version {}: {reason}", candidate.id),
                    )
                    .await;
                Ok(PromotionOutcome::RolledBack { version: candidate.id, reason })
            }
        }
    }

    /// Commit: route all traffic to the candidate, confirm the reload, and
    /// mark it Active. Any failure reverts traffic to the baseline and
    /// leaves the candidate canary-staged at 0%, so no half-promoted state
    /// is externally observable; restarting the pipeline is the recovery.
    async fn commit(
        &self,
        candidate: u64,
        baseline: Option<u64>,
    ) -> Result<PromotionOutcome, PromotionError> {
        let started = Instant::now();
        // With no baseline there is nothing to split away from; the freshly
        // loaded version already takes all traffic.
        if let Some(base) = baseline {
            let commit_res = self
                .call_runtime(|| self.runtime.set_traffic_split(candidate, 1.0, base, 0.0))
                .await;
            if let Err(e) = commit_res {
                return self.fail_commit(candidate, baseline, &e.to_string()).await;
            }
        }
        PROMOTION_METRICS
            .reload_latency_ms
            .observe(started.elapsed().as_secs_f64() * 1000.0);

        match self.store.transition(candidate, VersionStatus::Active) {
            Ok(active) => {
                PROMOTION_METRICS.promotions_total.inc();
                self.notifier
                    .notify(
                        NotifyEvent::Promoted,
                        &format!("version {} now active ({:.4})", active.id, active.accuracy),
                    )
                    .await;
                info!(version = candidate, "promotion committed");
                Ok(PromotionOutcome::Promoted { version: candidate })
            }
            Err(e @ PromotionError::InvariantViolation(_)) => {
                // State corruption; revert traffic, then surface loudly.
                error!(version = candidate, error = %e, "invariant violation during commit");
                self.revert_traffic(candidate, baseline).await;
                Err(e)
            }
            Err(e) => self.fail_commit(candidate, baseline, &e.to_string()).await,
        }
    }

    async fn fail_commit(
        &self,
        candidate: u64,
        baseline: Option<u64>,
        reason: &str,
    ) -> Result<PromotionOutcome, PromotionError> {
        warn!(version = candidate, reason, "commit failed, reverting to baseline");
        self.revert_traffic(candidate, baseline).await;
        PROMOTION_METRICS.commit_failures_total.inc();
        self.notifier
            .notify(NotifyEvent::CommitFailed, &format!("version {candidate}: {reason}"))
            .await;
        Ok(PromotionOutcome::CommitFailed { version: candidate, reason: reason.to_string() })
    }

    async fn revert_traffic(&self, candidate: u64, baseline: Option<u64>) {
        let Some(base) = baseline else { return };
        if let Err(e) = self
            .call_runtime(|| self.runtime.set_traffic_split(base, 1.0, candidate, 0.0))
            .await
        {
            error!(version = candidate, error = %e, "failed to restore baseline traffic");
        }
    }

    /// Bounded-timeout, bounded-retry wrapper for serving-runtime calls on
    /// the commit path.
    async fn call_runtime<F, Fut>(&self, mut op: F) -> Result<(), ServingError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), ServingError>>,
    {
        retry_async(&self.reload_retry, |_attempt| {
            let fut = op();
            let timeout = self.reload_timeout;
            async move {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(ServingError::Transient(format!(
                        "call timed out after {}ms",
                        timeout.as_millis()
                    ))),
                }
            }
        })
        .await
    }

    fn enter(&self, run_id: Uuid, phase: &mut RunPhase, next: RunPhase) {
        info!(%run_id, from = ?*phase, to = ?next, "promotion phase");
        *phase = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canary::CancelHandle;
    use crate::serving::VersionMetrics;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeRuntime {
        splits: Mutex<Vec<(u64, f64, u64, f64)>>,
        fail_commit_split: Mutex<bool>,
        metrics: Mutex<Option<(VersionMetrics, VersionMetrics)>>,
    }

    #[async_trait]
    impl ServingRuntime for FakeRuntime {
        async fn load_version(&self, _id: u64, _p: &str) -> Result<(), ServingError> {
            Ok(())
        }

        async fn set_traffic_split(
            &self,
            a: u64,
            fa: f64,
            b: u64,
            fb: f64,
        ) -> Result<(), ServingError> {
            // The commit call routes 100% to the candidate (fa == 1.0 with
            // a as the higher/new version).
            if *self.fail_commit_split.lock() && fa == 1.0 && a > b {
                return Err(ServingError::Fatal("reload rejected".into()));
            }
            self.splits.lock().push((a, fa, b, fb));
            Ok(())
        }

        async fn get_metrics(&self, version: u64) -> Result<VersionMetrics, ServingError> {
            let guard = self.metrics.lock();
            let (cand, base) = guard.as_ref().copied().unwrap_or((
                VersionMetrics { error_rate: 0.01, p95_latency_ms: 100.0 },
                VersionMetrics { error_rate: 0.01, p95_latency_ms: 100.0 },
            ));
            // Higher version id is always the candidate in these tests.
            Ok(if version >= 2 { cand } else { base })
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<(NotifyEvent, String)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, event: NotifyEvent, details: &str) {
            self.events.lock().push((event, details.to_string()));
        }
    }

    fn controller(
        store: Arc<VersionStore>,
        runtime: Arc<FakeRuntime>,
        notifier: Arc<RecordingNotifier>,
    ) -> PromotionController {
        let canary_config = CanaryConfig {
            traffic_fraction: 0.1,
            trial_duration: Duration::from_millis(20),
            sample_interval: Duration::from_millis(5),
            max_error_rate_delta: 0.05,
            max_latency_regression: 0.10,
        };
        PromotionController::new(
            store,
            runtime,
            notifier,
            GatePolicy { min_accuracy: 0.97, max_regression: 0.02 },
            canary_config,
        )
        .with_reload_timeout(Duration::from_millis(200))
        .with_reload_retry(RetryConfig {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: 0.0,
        })
    }

    /// Seed a serving baseline directly through the ledger, bypassing the
    /// gate so tests can choose any baseline accuracy.
    fn seed_active(store: &VersionStore, accuracy: f64) -> u64 {
        let v = store.record_candidate(accuracy, "models/base").unwrap();
        store.transition(v.id, VersionStatus::Canary).unwrap();
        store.transition(v.id, VersionStatus::Active).unwrap();
        v.id
    }

    #[tokio::test]
    async fn first_version_commits_without_canary() {
        let store = Arc::new(VersionStore::in_memory());
        let runtime = Arc::new(FakeRuntime::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let ctl = controller(store.clone(), runtime.clone(), notifier.clone());

        let (_h, cancel) = CancelHandle::new();
        let out = ctl.run(0.99, "models/1", cancel).await.unwrap();
        assert_eq!(out, PromotionOutcome::Promoted { version: 1 });
        assert_eq!(store.get_active().unwrap().id, 1);
        // No baseline means no split call at all; a lone version must never
        // be told to serve 0% of traffic.
        assert!(runtime.splits.lock().is_empty());
    }

    #[tokio::test]
    async fn below_threshold_candidate_rejected() {
        let store = Arc::new(VersionStore::in_memory());
        let runtime = Arc::new(FakeRuntime::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let ctl = controller(store.clone(), runtime.clone(), notifier.clone());
        seed_active(&store, 0.971);

        let (_h, cancel) = CancelHandle::new();
        let out = ctl.run(0.968, "models/2", cancel).await.unwrap();
        assert_eq!(
            out,
            PromotionOutcome::Rejected { version: 2, reason: "below_threshold".into() }
        );
        assert_eq!(store.get(2).unwrap().status, VersionStatus::Rejected);
        // Baseline untouched, rejection notified.
        assert_eq!(store.get_active().unwrap().id, 1);
        assert!(notifier.events.lock().iter().any(|(e, _)| *e == NotifyEvent::Rejected));
    }

    #[tokio::test]
    async fn clean_canary_promotes_candidate() {
        let store = Arc::new(VersionStore::in_memory());
        let runtime = Arc::new(FakeRuntime::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let ctl = controller(store.clone(), runtime.clone(), notifier.clone());
        seed_active(&store, 0.95);

        let (_h, cancel) = CancelHandle::new();
        let out = ctl.run(0.99, "models/2", cancel).await.unwrap();
        assert_eq!(out, PromotionOutcome::Promoted { version: 2 });
        let active = store.get_active().unwrap();
        assert_eq!(active.id, 2);
        assert_eq!(store.get(1).unwrap().superseded_by, Some(2));
        // Final split routes everything to the new version.
        assert_eq!(runtime.splits.lock().last().copied().unwrap(), (2, 1.0, 1, 0.0));
    }

    #[tokio::test]
    async fn canary_regression_rolls_back() {
        let store = Arc::new(VersionStore::in_memory());
        let runtime = Arc::new(FakeRuntime::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let ctl = controller(store.clone(), runtime.clone(), notifier.clone());
        seed_active(&store, 0.95);

        *runtime.metrics.lock() = Some((
            VersionMetrics { error_rate: 0.07, p95_latency_ms: 100.0 },
            VersionMetrics { error_rate: 0.01, p95_latency_ms: 100.0 },
        ));
        let (_h, cancel) = CancelHandle::new();
        let out = ctl.run(0.99, "models/2", cancel).await.unwrap();
        assert!(matches!(out, PromotionOutcome::RolledBack { version: 2, .. }));
        assert_eq!(store.get(2).unwrap().status, VersionStatus::RolledBack);
        assert_eq!(store.get_active().unwrap().id, 1);
        // Revert split restored the baseline.
        assert_eq!(runtime.splits.lock().last().copied().unwrap(), (1, 1.0, 2, 0.0));
        assert!(notifier.events.lock().iter().any(|(e, _)| *e == NotifyEvent::RolledBack));
    }

    #[tokio::test]
    async fn commit_failure_reverts_and_parks_canary() {
        let store = Arc::new(VersionStore::in_memory());
        let runtime = Arc::new(FakeRuntime::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let ctl = controller(store.clone(), runtime.clone(), notifier.clone());
        seed_active(&store, 0.95);

        *runtime.fail_commit_split.lock() = true;
        let (_h, cancel) = CancelHandle::new();
        let out = ctl.run(0.99, "models/2", cancel).await.unwrap();
        assert!(matches!(out, PromotionOutcome::CommitFailed { version: 2, .. }));
        // Candidate parked canary-staged, baseline still active and serving.
        assert_eq!(store.get(2).unwrap().status, VersionStatus::Canary);
        assert_eq!(store.get_active().unwrap().id, 1);
        assert_eq!(runtime.splits.lock().last().copied().unwrap(), (1, 1.0, 2, 0.0));
        assert!(notifier.events.lock().iter().any(|(e, _)| *e == NotifyEvent::CommitFailed));
    }

    #[tokio::test]
    async fn recover_unparks_a_stranded_canary() {
        let store = Arc::new(VersionStore::in_memory());
        let runtime = Arc::new(FakeRuntime::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let ctl = controller(store.clone(), runtime.clone(), notifier.clone());
        seed_active(&store, 0.95);

        *runtime.fail_commit_split.lock() = true;
        let (_h, cancel) = CancelHandle::new();
        let _ = ctl.run(0.99, "models/2", cancel).await.unwrap();

        // A second run is blocked while the failed candidate is parked.
        let (_h2, cancel2) = CancelHandle::new();
        let err = ctl.run(0.995, "models/3", cancel2).await.unwrap_err();
        assert!(matches!(err, PromotionError::AlreadyInProgress));

        // Restart path: recover, then the pipeline accepts work again.
        *runtime.fail_commit_split.lock() = false;
        ctl.recover().await.unwrap();
        assert_eq!(store.get(2).unwrap().status, VersionStatus::RolledBack);
        let (_h3, cancel3) = CancelHandle::new();
        let out = ctl.run(0.995, "models/3", cancel3).await.unwrap();
        assert!(matches!(out, PromotionOutcome::Promoted { version: 3 }));
    }
}
