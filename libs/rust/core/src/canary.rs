//! Canary trial: stage an admitted candidate at a minority traffic share,
//! poll comparative error rate / latency against the baseline, and decide
//! continue or abort.
//!
//! Abort is monotonic: once any sample trips a threshold the trial ends,
//! and traffic is restored to 100% baseline before control returns. A run
//! that cannot even observe the candidate (runtime errors mid-trial) takes
//! the same revert path. Cancellation from the operator is handled exactly
//! like an abort condition.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::metrics::PROMOTION_METRICS;
use crate::resilience::{retry_async, RetryConfig};
use crate::serving::{ServingError, ServingRuntime};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryConfig {
    /// Share of requests routed to the candidate during the trial.
    pub traffic_fraction: f64,
    pub trial_duration: Duration,
    pub sample_interval: Duration,
    /// Abort when candidate error rate exceeds baseline by more than this.
    pub max_error_rate_delta: f64,
    /// Abort when candidate p95 exceeds baseline p95 by more than this
    /// relative fraction (0.10 = +10%).
    pub max_latency_regression: f64,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            traffic_fraction: 0.1,
            trial_duration: Duration::from_secs(600),
            sample_interval: Duration::from_secs(5),
            max_error_rate_delta: 0.05,
            max_latency_regression: 0.10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanaryOutcome {
    Promote,
    Abort { reason: String },
}

/// Hands out cancellation requests to an in-flight trial.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

pub struct CanaryController {
    runtime: Arc<dyn ServingRuntime>,
    config: CanaryConfig,
    revert_retry: RetryConfig,
}

impl CanaryController {
    pub fn new(runtime: Arc<dyn ServingRuntime>, config: CanaryConfig) -> Self {
        Self { runtime, config, revert_retry: RetryConfig::default() }
    }

    /// Run the full trial. On return, traffic is either still split (only
    /// on `Promote`, for the caller to commit) or restored to 100%
    /// baseline (every abort path).
    pub async fn run_trial(
        &self,
        candidate: u64,
        baseline: u64,
        mut cancel: watch::Receiver<bool>,
    ) -> CanaryOutcome {
        let f = self.config.traffic_fraction;
        if let Err(e) = self
            .runtime
            .set_traffic_split(baseline, 1.0 - f, candidate, f)
            .await
        {
            // Split never took effect, so there is nothing to revert.
            warn!(candidate, baseline, error = %e, "traffic split failed");
            return CanaryOutcome::Abort { reason: "split_failed".into() };
        }
        info!(candidate, baseline, fraction = f, "canary staged");

        let started = Instant::now();
        let deadline = started + self.config.trial_duration;
        let mut degraded = false;

        // Sample-first loop: a zero-duration trial still takes one sample.
        let outcome = loop {
            if *cancel.borrow() {
                break CanaryOutcome::Abort { reason: "operator_cancelled".into() };
            }

            if let Some(reason) = self.take_sample(candidate, baseline, &mut degraded).await {
                PROMOTION_METRICS.canary_aborts_total.inc();
                break CanaryOutcome::Abort { reason };
            }

            if Instant::now() >= deadline {
                break CanaryOutcome::Promote;
            }
            let wake = (Instant::now() + self.config.sample_interval).min(deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                res = cancel.changed() => {
                    // A dropped sender makes changed() resolve immediately on
                    // every call; without this the wait arm never runs and
                    // the loop spins. No cancellation can arrive anymore, so
                    // just finish the interval.
                    if res.is_err() {
                        tokio::time::sleep_until(wake).await;
                    }
                }
            }
        };

        PROMOTION_METRICS
            .trial_duration_ms
            .observe(started.elapsed().as_secs_f64() * 1000.0);

        if let CanaryOutcome::Abort { reason } = &outcome {
            info!(candidate, reason, "canary aborting, reverting traffic");
            self.revert_to_baseline(candidate, baseline).await;
        }
        outcome
    }

    /// One comparative sample. Returns an abort reason, or None to keep
    /// going. Flips to degraded health-only polling when the runtime
    /// cannot report per-version metrics.
    async fn take_sample(
        &self,
        candidate: u64,
        baseline: u64,
        degraded: &mut bool,
    ) -> Option<String> {
        PROMOTION_METRICS.canary_samples_total.inc();

        if *degraded {
            return self.health_poll().await;
        }

        let cand = match self.runtime.get_metrics(candidate).await {
            Ok(m) => m,
            Err(ServingError::MetricsUnavailable) => {
                warn!(candidate, "per-version metrics unavailable, degrading to health polling");
                *degraded = true;
                return self.health_poll().await;
            }
            // Unobservable candidate is presumed unsafe.
            Err(e) => return Some(format!("metrics_failed: {e}")),
        };
        let base = match self.runtime.get_metrics(baseline).await {
            Ok(m) => m,
            Err(ServingError::MetricsUnavailable) => {
                *degraded = true;
                return self.health_poll().await;
            }
            Err(e) => return Some(format!("metrics_failed: {e}")),
        };

        if cand.error_rate - base.error_rate > self.config.max_error_rate_delta {
            return Some(format!(
                "error_rate_regression: candidate {:.4} vs baseline {:.4}",
                cand.error_rate, base.error_rate
            ));
        }
        if base.p95_latency_ms > 0.0
            && cand.p95_latency_ms / base.p95_latency_ms - 1.0 > self.config.max_latency_regression
        {
            return Some(format!(
                "latency_regression: candidate p95 {:.1}ms vs baseline {:.1}ms",
                cand.p95_latency_ms, base.p95_latency_ms
            ));
        }
        None
    }

    /// Minimum viable signal when per-version metrics are unsupported.
    async fn health_poll(&self) -> Option<String> {
        if self.runtime.health_check().await {
            None
        } else {
            Some("runtime_unhealthy".into())
        }
    }

    /// Restore 100% traffic to the baseline, retrying transient failures.
    /// Failure past the retry budget is logged loudly; the caller still
    /// reports the rollback so an operator can intervene.
    async fn revert_to_baseline(&self, candidate: u64, baseline: u64) {
        let res = retry_async(&self.revert_retry, |_| {
            self.runtime.set_traffic_split(baseline, 1.0, candidate, 0.0)
        })
        .await;
        if let Err(e) = res {
            warn!(candidate, baseline, error = %e, "failed to restore baseline traffic after retries");
        }
    }
}
