//! Serving-runtime client seam.
//!
//! The controller only ever talks to the runtime through [`ServingRuntime`];
//! the HTTP implementation targets a TF-Serving-style REST surface (model
//! status under `/v1/models/{name}`, per-version status under
//! `.../versions/{id}`). Calls distinguish transient faults (network, 5xx —
//! retryable) from fatal ones (invalid artifact, 4xx — reject immediately).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ServingError {
    /// Network error, timeout, 5xx. Worth retrying.
    #[error("transient serving error: {0}")]
    Transient(String),
    /// Invalid artifact, unknown version, 4xx. Retrying will not help.
    #[error("fatal serving error: {0}")]
    Fatal(String),
    /// The runtime cannot report per-split metrics; the canary trial
    /// degrades to binary health-check polling.
    #[error("per-version metrics unavailable")]
    MetricsUnavailable,
}

impl ServingError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// One comparative sample for a served version.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VersionMetrics {
    pub error_rate: f64,
    pub p95_latency_ms: f64,
}

#[async_trait]
pub trait ServingRuntime: Send + Sync {
    /// Ask the runtime to load the artifact for `id`. Must be complete
    /// (version serveable) when it returns Ok.
    async fn load_version(&self, id: u64, artifact_path: &str) -> Result<(), ServingError>;

    /// Route `fraction_a` of traffic to `version_a` and `fraction_b` to
    /// `version_b`. Fractions sum to 1.0; `(v, 1.0, _, 0.0)` restores a
    /// single-version state.
    async fn set_traffic_split(
        &self,
        version_a: u64,
        fraction_a: f64,
        version_b: u64,
        fraction_b: f64,
    ) -> Result<(), ServingError>;

    async fn get_metrics(&self, version: u64) -> Result<VersionMetrics, ServingError>;

    async fn health_check(&self) -> bool;
}

/// REST client for a TF-Serving-style endpoint.
pub struct HttpServingRuntime {
    client: reqwest::Client,
    base_url: String,
    model_name: String,
}

#[derive(Debug, Deserialize)]
struct ModelVersionStatus {
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelStatusResponse {
    #[serde(default)]
    model_version_status: Vec<ModelVersionStatus>,
}

impl HttpServingRuntime {
    pub fn new(base_url: &str, model_name: &str, call_timeout: Duration) -> Result<Self, ServingError> {
        let client = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|e| ServingError::Transient(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model_name: model_name.to_string(),
        })
    }

    fn classify(status: reqwest::StatusCode, body: String) -> ServingError {
        if status.is_client_error() {
            ServingError::Fatal(format!("{status}: {body}"))
        } else {
            ServingError::Transient(format!("{status}: {body}"))
        }
    }

    fn split_body(version_a: u64, fraction_a: f64, version_b: u64, fraction_b: f64) -> serde_json::Value {
        let mut split = serde_json::Map::new();
        split.insert(version_a.to_string(), fraction_a.into());
        // A degenerate split (both sides the same version) must not let the
        // second entry overwrite the first with its zero fraction.
        if version_b != version_a {
            split.insert(version_b.to_string(), fraction_b.into());
        }
        serde_json::json!({ "traffic_split": split })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T, ServingError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ServingError::Transient(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify(status, body));
        }
        resp.json::<T>().await.map_err(|e| ServingError::Transient(e.to_string()))
    }
}

#[async_trait]
impl ServingRuntime for HttpServingRuntime {
    async fn load_version(&self, id: u64, artifact_path: &str) -> Result<(), ServingError> {
        // The runtime picks artifacts up from its configured model base
        // path; loading is confirmed by the per-version status endpoint.
        debug!(version = id, artifact_path, "confirming version load");
        let url = format!("{}/v1/models/{}/versions/{}", self.base_url, self.model_name, id);
        let status: ModelStatusResponse = self.get_json(&url).await?;
        let available = status
            .model_version_status
            .iter()
            .any(|s| s.state.as_deref() == Some("AVAILABLE"));
        if available {
            Ok(())
        } else {
            Err(ServingError::Fatal(format!("version {id} not loadable from {artifact_path}")))
        }
    }

    async fn set_traffic_split(
        &self,
        version_a: u64,
        fraction_a: f64,
        version_b: u64,
        fraction_b: f64,
    ) -> Result<(), ServingError> {
        let url = format!("{}/v1/models/{}:config", self.base_url, self.model_name);
        let body = Self::split_body(version_a, fraction_a, version_b, fraction_b);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ServingError::Transient(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(Self::classify(status, body))
        }
    }

    async fn get_metrics(&self, version: u64) -> Result<VersionMetrics, ServingError> {
        let url = format!(
            "{}/v1/models/{}/versions/{}/metrics",
            self.base_url, self.model_name, version
        );
        match self.get_json::<VersionMetrics>(&url).await {
            Ok(m) => Ok(m),
            // A runtime without per-version metrics answers 404 here.
            Err(ServingError::Fatal(msg)) if msg.starts_with("404") => {
                Err(ServingError::MetricsUnavailable)
            }
            Err(e) => Err(e),
        }
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/v1/models/{}", self.base_url, self.model_name);
        self.get_json::<ModelStatusResponse>(&url).await.is_ok()
    }
}
