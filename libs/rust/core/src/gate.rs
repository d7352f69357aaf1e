//! Accuracy gate: the minimum-bar admission check before any live exposure.
//!
//! Pure and deterministic; the controller commits the resulting transition,
//! the gate itself never touches state.

use serde::{Deserialize, Serialize};

use crate::version_store::ModelVersion;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatePolicy {
    /// Hard floor on candidate accuracy.
    pub min_accuracy: f64,
    /// Maximum tolerated accuracy drop versus the serving baseline, even
    /// when `min_accuracy` is met.
    pub max_regression: f64,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self { min_accuracy: 0.97, max_regression: 0.02 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Admit,
    Reject { reason: String },
}

/// Threshold check first, regression check second. The ordering is fixed so
/// a candidate failing both always reports `below_threshold`.
pub fn evaluate(
    candidate: &ModelVersion,
    baseline: Option<&ModelVersion>,
    policy: &GatePolicy,
) -> GateDecision {
    if candidate.accuracy < policy.min_accuracy {
        return GateDecision::Reject { reason: "below_threshold".into() };
    }
    if let Some(base) = baseline {
        if base.accuracy - candidate.accuracy > policy.max_regression {
            return GateDecision::Reject { reason: "regression".into() };
        }
    }
    GateDecision::Admit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version_store::VersionStatus;
    use chrono::Utc;

    fn version(accuracy: f64) -> ModelVersion {
        ModelVersion {
            id: 1,
            accuracy,
            status: VersionStatus::Candidate,
            created_at: Utc::now(),
            artifact_path: "models/test".into(),
            superseded_by: None,
        }
    }

    #[test]
    fn below_threshold_rejected_regardless_of_baseline() {
        let policy = GatePolicy { min_accuracy: 0.97, max_regression: 0.02 };
        let candidate = version(0.968);
        let baseline = version(0.971);
        for base in [None, Some(&baseline)] {
            assert_eq!(
                evaluate(&candidate, base, &policy),
                GateDecision::Reject { reason: "below_threshold".into() }
            );
        }
    }

    #[test]
    fn regression_rejected_even_above_threshold() {
        let policy = GatePolicy { min_accuracy: 0.90, max_regression: 0.02 };
        let candidate = version(0.93);
        let baseline = version(0.96);
        assert_eq!(
            evaluate(&candidate, Some(&baseline), &policy),
            GateDecision::Reject { reason: "regression".into() }
        );
    }

    #[test]
    fn threshold_reported_when_both_checks_fail() {
        let policy = GatePolicy { min_accuracy: 0.97, max_regression: 0.01 };
        let candidate = version(0.90);
        let baseline = version(0.99);
        assert_eq!(
            evaluate(&candidate, Some(&baseline), &policy),
            GateDecision::Reject { reason: "below_threshold".into() }
        );
    }

    #[test]
    fn admit_when_above_threshold_and_within_regression() {
        let policy = GatePolicy { min_accuracy: 0.97, max_regression: 0.02 };
        let candidate = version(0.99);
        let baseline = version(0.95);
        assert_eq!(evaluate(&candidate, Some(&baseline), &policy), GateDecision::Admit);
        // No baseline at all admits on threshold alone.
        assert_eq!(evaluate(&candidate, None, &policy), GateDecision::Admit);
    }

    #[test]
    fn deterministic_for_identical_inputs() {
        let policy = GatePolicy::default();
        let candidate = version(0.975);
        let baseline = version(0.98);
        let first = evaluate(&candidate, Some(&baseline), &policy);
        for _ in 0..10 {
            assert_eq!(evaluate(&candidate, Some(&baseline), &policy), first);
        }
    }
}
