//! Stable JSON report shapes (consumed by upstream layers)
//!
//! Field names here are a wire contract: upstream services align feedback to
//! steps positionally and by `step_id`, and dashboards key off the closed
//! `error_type` string set. Renaming anything is a breaking change.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use serde::{Deserialize, Serialize};

use crate::verifier::{StepVerdict, Verdict};

/// Complete grade for one solution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GradingReport {
    pub total_points: u32,
    pub goal_reached: bool,
    pub confidence: f64,
    pub summary: String,
    pub step_feedback: Vec<StepFeedback>,
    pub deductions: Vec<Deduction>,
    pub missing_steps: Vec<MissingStep>,
}

/// Per-step entry, in input step order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepFeedback {
    pub step_id: u32,
    pub is_valid: bool,
    pub error_type: Option<String>,
    #[serde(default)]
    pub error_details: String,
    pub confidence: f64,
    #[serde(default)]
    pub is_redundant: bool,
    pub theorem_applied: Option<String>,
    /// `"step N"`, present only for cascading failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<String>,
}

/// One structured point loss.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Deduction {
    pub deducted_points: u32,
    pub deduction_reason: String,
    pub deduction_confidence_score: f64,
    /// `"step N"`, `"final"`, or `"initialization"`.
    pub deduction_step: String,
    pub error_type: String,
}

/// Descriptor for work the solution still owes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MissingStep {
    pub description: String,
    pub note: String,
}

impl StepFeedback {
    pub fn from_verdict(v: &StepVerdict) -> Self {
        match &v.verdict {
            Verdict::Valid { theorem, redundant } => Self {
                step_id: v.step_id,
                is_valid: true,
                error_type: None,
                error_details: String::new(),
                confidence: v.confidence,
                is_redundant: *redundant,
                theorem_applied: theorem.clone(),
                root_cause: None,
            },
            Verdict::Invalid { kind, details, root_cause } => Self {
                step_id: v.step_id,
                is_valid: false,
                error_type: Some(kind.as_str().to_string()),
                error_details: details.clone(),
                confidence: v.confidence,
                is_redundant: false,
                theorem_applied: None,
                root_cause: root_cause.map(|r| format!("step {r}")),
            },
            Verdict::Unknown { reason } => Self {
                step_id: v.step_id,
                is_valid: false,
                error_type: None,
                error_details: reason.clone(),
                confidence: v.confidence,
                is_redundant: false,
                theorem_applied: None,
                root_cause: None,
            },
        }
    }
}

impl Deduction {
    /// Deduction record for an invalid step, `None` when nothing was lost.
    pub fn from_verdict(v: &StepVerdict) -> Option<Self> {
        if v.points_deducted == 0 {
            return None;
        }
        let (reason, error_type) = match &v.verdict {
            Verdict::Invalid { kind, details, .. } => (details.clone(), kind.as_str().to_string()),
            _ => return None,
        };
        Some(Self {
            deducted_points: v.points_deducted,
            deduction_reason: reason,
            deduction_confidence_score: v.confidence,
            deduction_step: format!("step {}", v.step_id),
            error_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verifier::{ErrorKind, StepVerdict};

    #[test]
    fn valid_feedback_shape() {
        let v = StepVerdict::valid(3, Some("circle_property_radius_equal".into()), false, 0.92);
        let fb = StepFeedback::from_verdict(&v);
        let json = serde_json::to_value(&fb).unwrap();
        assert_eq!(json["step_id"], 3);
        assert_eq!(json["is_valid"], true);
        assert_eq!(json["error_type"], serde_json::Value::Null);
        assert_eq!(json["theorem_applied"], "circle_property_radius_equal");
        assert!(json.get("root_cause").is_none(), "absent, not null");
    }

    #[test]
    fn invalid_feedback_carries_root_cause() {
        let v = StepVerdict::invalid(
            4,
            ErrorKind::CascadingError,
            ErrorKind::CascadingError.reason(4, Some(2)),
            Some(2),
            0.85,
        );
        let fb = StepFeedback::from_verdict(&v);
        let json = serde_json::to_value(&fb).unwrap();
        assert_eq!(json["error_type"], "cascading_error");
        assert_eq!(json["root_cause"], "step 2");

        let d = Deduction::from_verdict(&v).unwrap();
        assert_eq!(d.deducted_points, 10);
        assert_eq!(d.deduction_step, "step 4");
        assert_eq!(d.error_type, "cascading_error");
    }

    #[test]
    fn valid_steps_yield_no_deduction() {
        let v = StepVerdict::valid(1, None, false, 0.9);
        assert!(Deduction::from_verdict(&v).is_none());
    }
}
