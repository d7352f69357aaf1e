//! Promotion metrics group, registered once against the default prometheus
//! registry and scraped via the health server's `/metrics` endpoint.

use once_cell::sync::Lazy;
use prometheus::{register_histogram, register_int_counter, Histogram, IntCounter};

pub struct PromotionMetrics {
    pub promotions_total: IntCounter,
    pub rejections_total: IntCounter,
    pub rollbacks_total: IntCounter,
    pub commit_failures_total: IntCounter,
    pub canary_samples_total: IntCounter,
    pub canary_aborts_total: IntCounter,
    pub reload_latency_ms: Histogram,
    pub trial_duration_ms: Histogram,
}

pub static PROMOTION_METRICS: Lazy<PromotionMetrics> = Lazy::new(|| PromotionMetrics {
    promotions_total: register_int_counter!(
        "modelgate_promotions_total",
        "Candidates committed as the new active version"
    )
    .unwrap(),
    rejections_total: register_int_counter!(
        "modelgate_rejections_total",
        "Candidates rejected by the accuracy gate"
    )
    .unwrap(),
    rollbacks_total: register_int_counter!(
        "modelgate_rollbacks_total",
        "Canaries aborted and rolled back"
    )
    .unwrap(),
    commit_failures_total: register_int_counter!(
        "modelgate_commit_failures_total",
        "Promotions that failed during commit/reload"
    )
    .unwrap(),
    canary_samples_total: register_int_counter!(
        "modelgate_canary_samples_total",
        "Comparative metric samples taken during canary trials"
    )
    .unwrap(),
    canary_aborts_total: register_int_counter!(
        "modelgate_canary_aborts_total",
        "Early aborts triggered by a canary sample"
    )
    .unwrap(),
    reload_latency_ms: register_histogram!(
        "modelgate_reload_latency_ms",
        "Serving runtime reload latency (ms)",
        vec![50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 15000.0]
    )
    .unwrap(),
    trial_duration_ms: register_histogram!(
        "modelgate_trial_duration_ms",
        "Observed canary trial wall-clock duration (ms)",
        vec![100.0, 1000.0, 10_000.0, 60_000.0, 300_000.0, 900_000.0]
    )
    .unwrap(),
});
