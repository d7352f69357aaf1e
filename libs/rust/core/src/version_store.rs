//! Durable ledger of model versions and their status transitions.
//!
//! Single-writer discipline: every mutation goes through one lock, and the
//! store is the only component allowed to touch `status`. Transitions are
//! forward-only (`Candidate -> {Rejected | Canary}`, `Canary -> {Active |
//! RolledBack}`) and records are never deleted, so "what happened to
//! version N" is always answerable from the ledger alone.
//!
//! Persistence is an append-order JSON-lines file (one record per line,
//! rewritten as a snapshot on mutation), or fully in-memory for tests.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::PromotionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Candidate,
    Canary,
    Active,
    Rejected,
    RolledBack,
}

impl VersionStatus {
    /// Forward-only moves. Everything else is an invalid transition.
    fn can_move_to(self, next: VersionStatus) -> bool {
        matches!(
            (self, next),
            (VersionStatus::Candidate, VersionStatus::Rejected)
                | (VersionStatus::Candidate, VersionStatus::Canary)
                | (VersionStatus::Canary, VersionStatus::Active)
                | (VersionStatus::Canary, VersionStatus::RolledBack)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelVersion {
    pub id: u64,
    pub accuracy: f64,
    pub status: VersionStatus,
    pub created_at: DateTime<Utc>,
    pub artifact_path: String,
    /// Set on the previously-serving version when a successor commits.
    /// Lookup relation only; the historical status is left untouched.
    pub superseded_by: Option<u64>,
}

impl ModelVersion {
    /// Serving baseline: Active and not yet superseded.
    pub fn is_serving_baseline(&self) -> bool {
        self.status == VersionStatus::Active && self.superseded_by.is_none()
    }
}

struct Inner {
    versions: Vec<ModelVersion>,
    next_id: u64,
}

pub struct VersionStore {
    inner: Mutex<Inner>,
    ledger_path: Option<PathBuf>,
}

impl VersionStore {
    pub fn in_memory() -> Self {
        Self { inner: Mutex::new(Inner { versions: Vec::new(), next_id: 1 }), ledger_path: None }
    }

    /// Open (or create) a file-backed ledger. Records replay in id order.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PromotionError> {
        let path = path.as_ref().to_path_buf();
        let mut versions: Vec<ModelVersion> = Vec::new();
        if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(PromotionError::infra)?;
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                let rec: ModelVersion = serde_json::from_str(line)
                    .map_err(|e| PromotionError::Infrastructure(format!("corrupt ledger line: {e}")))?;
                versions.push(rec);
            }
            versions.sort_by_key(|v| v.id);
        }
        let next_id = versions.last().map(|v| v.id + 1).unwrap_or(1);
        Ok(Self { inner: Mutex::new(Inner { versions, next_id }), ledger_path: Some(path) })
    }

    /// Startup recovery: an unclean shutdown can strand a `Canary` (traffic
    /// state unknown) or a `Candidate` (would wedge the in-flight guard).
    /// Force both back to a terminal state before accepting new work.
    /// Returns the ids that were reverted so the caller can also reset the
    /// serving runtime's traffic split.
    pub fn recover(&self) -> Result<Vec<u64>, PromotionError> {
        let mut reverted = Vec::new();
        let mut inner = self.inner.lock();
        for v in inner.versions.iter_mut() {
            match v.status {
                VersionStatus::Canary => {
                    warn!(version = v.id, "leftover canary from unclean shutdown, force-reverting");
                    v.status = VersionStatus::RolledBack;
                    reverted.push(v.id);
                }
                VersionStatus::Candidate => {
                    warn!(version = v.id, "leftover candidate from unclean shutdown, marking rejected");
                    v.status = VersionStatus::Rejected;
                }
                _ => {}
            }
        }
        self.persist(&inner)?;
        Ok(reverted)
    }

    /// Record a fresh candidate. Fails fast with `AlreadyInProgress` while
    /// another candidate or canary is in flight; overlapping rollouts would
    /// make the traffic-split state ambiguous.
    pub fn record_candidate(
        &self,
        accuracy: f64,
        artifact_path: &str,
    ) -> Result<ModelVersion, PromotionError> {
        let mut inner = self.inner.lock();
        if inner
            .versions
            .iter()
            .any(|v| matches!(v.status, VersionStatus::Candidate | VersionStatus::Canary))
        {
            return Err(PromotionError::AlreadyInProgress);
        }
        let rec = ModelVersion {
            id: inner.next_id,
            accuracy,
            status: VersionStatus::Candidate,
            created_at: Utc::now(),
            artifact_path: artifact_path.to_string(),
            superseded_by: None,
        };
        inner.next_id += 1;
        inner.versions.push(rec.clone());
        self.persist(&inner)?;
        info!(version = rec.id, accuracy, "candidate recorded");
        Ok(rec)
    }

    pub fn get(&self, id: u64) -> Option<ModelVersion> {
        self.inner.lock().versions.iter().find(|v| v.id == id).cloned()
    }

    /// The currently served baseline, if any.
    pub fn get_active(&self) -> Option<ModelVersion> {
        self.inner.lock().versions.iter().find(|v| v.is_serving_baseline()).cloned()
    }

    pub fn get_canary(&self) -> Option<ModelVersion> {
        self.inner
            .lock()
            .versions
            .iter()
            .find(|v| v.status == VersionStatus::Canary)
            .cloned()
    }

    /// Full ledger in creation order.
    pub fn history(&self) -> Vec<ModelVersion> {
        self.inner.lock().versions.clone()
    }

    /// Commit a status transition. Validates the forward-only machine and
    /// the at-most-one Active / at-most-one Canary invariants; on a
    /// `Canary -> Active` commit the previous baseline gets its
    /// `superseded_by` back-reference set in the same critical section.
    pub fn transition(&self, id: u64, next: VersionStatus) -> Result<ModelVersion, PromotionError> {
        let mut inner = self.inner.lock();

        let current = inner
            .versions
            .iter()
            .find(|v| v.id == id)
            .map(|v| v.status)
            .ok_or_else(|| {
                PromotionError::InvariantViolation(format!("unknown version {id}"))
            })?;

        if !current.can_move_to(next) {
            return Err(PromotionError::InvariantViolation(format!(
                "invalid transition for version {id}: {current:?} -> {next:?}"
            )));
        }
        if next == VersionStatus::Canary
            && inner.versions.iter().any(|v| v.status == VersionStatus::Canary)
        {
            return Err(PromotionError::InvariantViolation(
                "a canary is already staged".into(),
            ));
        }

        if next == VersionStatus::Active {
            // Demote the old baseline via back-reference, not status.
            if let Some(prev) = inner.versions.iter_mut().find(|v| v.is_serving_baseline()) {
                prev.superseded_by = Some(id);
            }
        }

        let updated = {
            let v = inner
                .versions
                .iter_mut()
                .find(|v| v.id == id)
                .ok_or_else(|| PromotionError::InvariantViolation(format!("unknown version {id}")))?;
            v.status = next;
            v.clone()
        };
        self.persist(&inner)?;
        info!(version = id, status = ?next, "version transitioned");
        Ok(updated)
    }

    fn persist(&self, inner: &Inner) -> Result<(), PromotionError> {
        let Some(path) = &self.ledger_path else { return Ok(()) };
        let mut out = String::new();
        for v in &inner.versions {
            out.push_str(&serde_json::to_string(v).map_err(PromotionError::infra)?);
            out.push('\n');
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, out).map_err(PromotionError::infra)?;
        std::fs::rename(&tmp, path).map_err(PromotionError::infra)?;
        Ok(())
    }
}
