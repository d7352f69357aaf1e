//! Core library for the model promotion controller: version ledger,
//! accuracy gate, canary trial, promotion orchestration, and the shared
//! service plumbing (tracing, settings, health/metrics endpoints).

use anyhow::Result;
use axum::{routing::get, Router};
use once_cell::sync::OnceCell;
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static NODE_LIVENESS: AtomicBool = AtomicBool::new(true);
static NODE_READINESS: AtomicBool = AtomicBool::new(false);

pub fn mark_ready() {
    NODE_READINESS.store(true, Ordering::SeqCst);
}
pub fn clear_ready() {
    NODE_READINESS.store(false, Ordering::SeqCst);
}
pub fn mark_not_live() {
    NODE_LIVENESS.store(false, Ordering::SeqCst);
}

pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("MODELGATE_JSON_LOG")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let builder = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env());
        if json {
            builder.json().flatten_event(true).try_init().map_err(|e| anyhow::anyhow!(e))?;
        } else {
            builder
                .with_target(true)
                .with_line_number(true)
                .try_init()
                .map_err(|e| anyhow::anyhow!(e))?;
        }
        Ok(())
    })?;
    info!(target: "modelgate", service, "tracing initialized");
    Ok(())
}

/// Service settings, layered defaults <- optional file <- environment
/// (`MODELGATE__` prefix, `__` separator). CLI flags override on top.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub serving_url: String,
    pub model_name: String,
    pub ledger_path: String,
    pub webhook_url: Option<String>,
    pub health_port: u16,
}

pub fn load_settings() -> Result<Settings> {
    let mut builder = config::Config::builder()
        .set_default("serving_url", "http://localhost:8501")?
        .set_default("model_name", "mnist")?
        .set_default("ledger_path", "models/ledger.jsonl")?
        .set_default("health_port", 8080)?;
    if let Ok(file) = std::env::var("MODELGATE_CONFIG_FILE") {
        builder = builder.add_source(config::File::with_name(&file).required(false));
    }
    builder = builder.add_source(config::Environment::with_prefix("MODELGATE").separator("__"));
    let settings = builder.build()?.try_deserialize()?;
    Ok(settings)
}

/// Liveness/readiness plus the prometheus scrape endpoint.
pub async fn start_health_server(port: u16) -> Result<()> {
    let app = Router::new()
        .route(
            "/live",
            get(|| async {
                axum::Json(serde_json::json!({"live": NODE_LIVENESS.load(Ordering::SeqCst)}))
            }),
        )
        .route(
            "/ready",
            get(|| async {
                axum::Json(serde_json::json!({"ready": NODE_READINESS.load(Ordering::SeqCst)}))
            }),
        )
        .route("/metrics", get(metrics_handler));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(?addr, "health server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = ?e, "health server failed");
        }
    });
    Ok(())
}

async fn metrics_handler() -> axum::response::Response {
    let metric_families = prometheus::default_registry().gather();
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&metric_families, &mut buf) {
        return axum::response::Response::builder()
            .status(500)
            .body(axum::body::Body::from(format!("encode error: {e}")))
            .unwrap();
    }
    axum::response::Response::builder()
        .status(200)
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(axum::body::Body::from(buf))
        .unwrap()
}

pub mod canary;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod notifier;
pub mod promotion;
mod resilience;
pub mod serving;
pub mod version_store;

pub use canary::{CanaryConfig, CanaryController, CanaryOutcome, CancelHandle};
pub use error::PromotionError;
pub use gate::{evaluate, GateDecision, GatePolicy};
pub use metrics::{PromotionMetrics, PROMOTION_METRICS};
pub use notifier::{LogNotifier, Notifier, NotifyEvent, WebhookNotifier};
pub use promotion::{PromotionController, PromotionOutcome, RunPhase};
pub use resilience::{retry_async, RetryConfig};
pub use serving::{HttpServingRuntime, ServingError, ServingRuntime, VersionMetrics};
pub use version_store::{ModelVersion, VersionStatus, VersionStore};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracing_init_is_idempotent() {
        assert!(init_tracing("core-test").is_ok());
        assert!(init_tracing("core-test-again").is_ok());
    }
}
