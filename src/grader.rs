//! Grade orchestrator (step loop, deductions, goal, summary)
//!
//! One grade call owns everything: the engine (and through it the KB), the
//! verdict list, and the deduction ledger. The loop never aborts on a
//! grading-domain failure — every step gets a verdict and the report is
//! always well-formed. The single early exit is an externally injected
//! `GlobalMisalignment` policy verdict.
//!
//! Scoring contract:
//! - deductions below the confidence floor (default 0.5) are discarded,
//! - `total_points = max(0, 100 − Σ accepted deductions)`,
//! - aggregate confidence is the arithmetic mean of per-step verdict
//!   confidences (0 when no steps ran),
//! - an unreached goal costs 20 points at `deduction_step = "final"` and
//!   emits one synthetic missing-step descriptor.
//!
//! Infrastructure failures (the problem itself will not load) degrade to a
//! single 100-point `initialization` deduction with no step feedback.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use tracing::{info, warn};

use crate::engine::{DeductiveEngine, InitError, TheoremEngine};
use crate::report::{Deduction, GradingReport, MissingStep, StepFeedback};
use crate::verifier::{self, ErrorKind, StepVerdict};
use crate::{ProblemSpec, Step};

/// Points lost when the goal is not entailed by the final KB.
const GOAL_DEDUCTION_POINTS: u32 = 20;
const GOAL_DEDUCTION_CONFIDENCE: f64 = 0.85;

/// Knobs for one grade call.
#[derive(Clone, Debug)]
pub struct GradeOptions {
    /// Deductions with confidence below this are discarded before scoring.
    pub confidence_floor: f64,
    /// Externally injected verdicts (e.g. a rubric layer flagging a solution
    /// as globally misaligned). The verifier never produces these itself.
    pub overrides: Vec<PolicyOverride>,
}

impl Default for GradeOptions {
    fn default() -> Self {
        Self { confidence_floor: 0.5, overrides: Vec::new() }
    }
}

/// One policy-injected verdict.
#[derive(Clone, Debug)]
pub struct PolicyOverride {
    pub step_id: u32,
    pub kind: ErrorKind,
    pub details: Option<String>,
}

/// Grade with the built-in deductive engine and default options.
pub fn grade(spec: &ProblemSpec, steps: &[Step]) -> GradingReport {
    let mut engine = DeductiveEngine::new();
    grade_with_engine(&mut engine, spec, steps, &GradeOptions::default())
}

/// Grade against a caller-supplied engine. The engine is borrowed for the
/// duration of the call; its KB is (re)loaded from `spec`.
pub fn grade_with_engine<E: TheoremEngine>(
    engine: &mut E,
    spec: &ProblemSpec,
    steps: &[Step],
    options: &GradeOptions,
) -> GradingReport {
    if let Err(e) = engine.load(spec) {
        warn!(error = %e, "problem failed to load");
        return initialization_failure_report(&e);
    }

    let mut verdicts: Vec<StepVerdict> = Vec::with_capacity(steps.len());
    for step in steps {
        let verdict = match options.overrides.iter().find(|o| o.step_id == step.step_id) {
            Some(o) => injected_verdict(o),
            None => verifier::verify_step(engine, step, &verdicts),
        };
        let fatal = verdict.error_kind() == Some(ErrorKind::GlobalMisalignment);
        verdicts.push(verdict);
        if fatal {
            warn!(step = step.step_id, "global misalignment - terminating verification");
            break;
        }
    }

    let goal = engine.check_goal();
    let goal_reached = goal.reached();
    info!(?goal, steps = verdicts.len(), "verification finished");

    let mut deductions: Vec<Deduction> = verdicts.iter().filter_map(Deduction::from_verdict).collect();
    let mut missing_steps = Vec::new();
    if !goal_reached {
        deductions.push(Deduction {
            deducted_points: GOAL_DEDUCTION_POINTS,
            deduction_reason: "Solution incomplete - goal not reached".to_string(),
            deduction_confidence_score: GOAL_DEDUCTION_CONFIDENCE,
            deduction_step: "final".to_string(),
            error_type: ErrorKind::MissingPremise.as_str().to_string(),
        });
        missing_steps.push(MissingStep {
            description: "Additional steps needed to reach goal".to_string(),
            note: "Solution incomplete".to_string(),
        });
    }

    // Every deduction passes through the confidence filter, the final one
    // included.
    deductions.retain(|d| d.deduction_confidence_score >= options.confidence_floor);

    let deducted: u32 = deductions.iter().map(|d| d.deducted_points).sum();
    let total_points = 100u32.saturating_sub(deducted);

    let confidence = if verdicts.is_empty() {
        0.0
    } else {
        verdicts.iter().map(|v| v.confidence).sum::<f64>() / verdicts.len() as f64
    };

    let summary = summarize(&verdicts, goal_reached);
    info!(total_points, goal_reached, "grading complete");

    GradingReport {
        total_points,
        goal_reached,
        confidence,
        summary,
        step_feedback: verdicts.iter().map(StepFeedback::from_verdict).collect(),
        deductions,
        missing_steps,
    }
}

fn injected_verdict(o: &PolicyOverride) -> StepVerdict {
    let details = o
        .details
        .clone()
        .unwrap_or_else(|| o.kind.reason(o.step_id, None));
    StepVerdict::invalid(o.step_id, o.kind, details, None, o.kind.confidence())
}

fn initialization_failure_report(error: &InitError) -> GradingReport {
    GradingReport {
        total_points: 0,
        goal_reached: false,
        confidence: 0.0,
        summary: "Unable to grade solution - geometry solver initialization failed".to_string(),
        step_feedback: Vec::new(),
        deductions: vec![Deduction {
            deducted_points: 100,
            deduction_reason: format!("Cannot initialize geometry solver: {error}"),
            deduction_confidence_score: 1.0,
            deduction_step: "initialization".to_string(),
            error_type: ErrorKind::GlobalMisalignment.as_str().to_string(),
        }],
        missing_steps: Vec::new(),
    }
}

fn summarize(verdicts: &[StepVerdict], goal_reached: bool) -> String {
    let valid = verdicts.iter().filter(|v| v.is_valid()).count();
    let total = verdicts.len();

    let mut parts: Vec<String> = Vec::new();
    if valid == total && goal_reached {
        parts.push(
            "Student demonstrated complete understanding and correctly solved the problem."
                .to_string(),
        );
    } else if valid > 0 {
        parts.push(format!("Student completed {valid}/{total} steps correctly."));
        if (valid as f64) >= (total as f64) * 0.7 {
            parts.push("Shows good grasp of geometry concepts.".to_string());
        }
        let kinds: Vec<ErrorKind> = verdicts.iter().filter_map(|v| v.error_kind()).collect();
        if kinds.contains(&ErrorKind::InvalidTheorem) {
            parts.push("Needs improvement in theorem application.".to_string());
        }
        if kinds.contains(&ErrorKind::WrongConclusion) {
            parts.push("Logical reasoning needs strengthening.".to_string());
        }
        if !goal_reached {
            parts.push("Solution incomplete - missing steps to reach goal.".to_string());
        }
    } else {
        parts.push("Student needs significant support with geometry problem solving.".to_string());
    }
    parts.join(" ")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MinimalEngine;

    fn circle_spec(goal_cdl: &str) -> ProblemSpec {
        ProblemSpec {
            construction_cdl: vec!["Cocircular(O,ABC)".into()],
            text_cdl: vec![
                "IsCentreOfCircle(O,O)".into(),
                "IsDiameterOfCircle(AB,O)".into(),
            ],
            goal_cdl: goal_cdl.into(),
            problem_answer: None,
        }
    }

    /// Spec whose goal is already entailed by the givens.
    fn settled_spec() -> ProblemSpec {
        ProblemSpec {
            text_cdl: vec![
                "IsCentreOfCircle(O,O)".into(),
                "IsDiameterOfCircle(AB,O)".into(),
                "Equal(MeasureOfAngle(ACB),90)".into(),
            ],
            ..circle_spec("Equal(MeasureOfAngle(ACB),90)")
        }
    }

    #[test]
    fn clean_circle_proof_scores_eighty_without_goal_closure() {
        // Radii, isosceles judgments, base-angle equalities: all six steps
        // verify; the registry alone does not close the semicircle goal, so
        // one final deduction applies.
        let spec = circle_spec("Equal(MeasureOfAngle(ACB),90)");
        let steps = vec![
            Step::new(1, "Equal(LengthOfLine(OA),LengthOfLine(OC))")
                .with_theorem("circle_property_radius_equal"),
            Step::new(2, "Equal(LengthOfLine(OC),LengthOfLine(OB))")
                .with_theorem("circle_property_radius_equal"),
            Step::new(3, "IsoscelesTriangle(AOC)")
                .with_theorem("two_sides_equal")
                .with_depends_on(vec![1]),
            Step::new(4, "IsoscelesTriangle(BOC)")
                .with_theorem("two_sides_equal")
                .with_depends_on(vec![2]),
            Step::new(5, "Equal(MeasureOfAngle(OAC),MeasureOfAngle(OCA))").with_depends_on(vec![3]),
            Step::new(6, "Equal(MeasureOfAngle(OBC),MeasureOfAngle(OCB))").with_depends_on(vec![4]),
        ];

        let report = grade(&spec, &steps);
        assert!(report.step_feedback.iter().all(|f| f.is_valid), "{report:?}");
        assert!(!report.goal_reached);
        assert_eq!(report.total_points, 80);
        assert_eq!(report.missing_steps.len(), 1);
        assert_eq!(report.deductions.len(), 1);
        assert_eq!(report.deductions[0].deduction_step, "final");
    }

    #[test]
    fn full_marks_when_student_closes_the_goal() {
        let spec = circle_spec("Equal(MeasureOfAngle(ACB),90)");
        let steps = vec![Step::new(1, "Equal(MeasureOfAngle(ACB),90)")
            .with_theorem("diameter right angle")];
        let report = grade(&spec, &steps);
        assert!(report.goal_reached);
        assert_eq!(report.total_points, 100);
        assert_eq!(
            report.step_feedback[0].theorem_applied.as_deref(),
            Some("diameter_of_circle_property_right_angle")
        );
        assert_eq!(
            report.summary,
            "Student demonstrated complete understanding and correctly solved the problem."
        );
    }

    #[test]
    fn wrong_conclusion_scores_eighty() {
        let steps = vec![Step::new(1, "Equal(LengthOfLine(OA),LengthOfLine(OD))")
            .with_theorem("circle_property_radius_equal")];
        let report = grade(&settled_spec(), &steps);
        assert_eq!(report.total_points, 80);
        assert!(report.goal_reached);
        assert_eq!(
            report.summary,
            "Student needs significant support with geometry problem solving."
        );
        let fb = &report.step_feedback[0];
        assert!(!fb.is_valid);
        assert_eq!(fb.error_type.as_deref(), Some("wrong_conclusion"));
        assert_eq!(report.deductions.len(), 1);
        assert_eq!(report.deductions[0].deducted_points, 20);
        assert!((report.deductions[0].deduction_confidence_score - 0.92).abs() < 1e-9);
    }

    #[test]
    fn cascade_scores_eighty_total() {
        let steps = vec![
            Step::new(1, "Equal(LengthOfLine(OA)"), // unbalanced: syntax error
            Step::new(2, "Cocircular(O,ABC)").with_depends_on(vec![1]),
        ];
        let report = grade(&settled_spec(), &steps);
        assert_eq!(report.total_points, 80);
        let kinds: Vec<_> = report
            .step_feedback
            .iter()
            .map(|f| f.error_type.clone())
            .collect();
        assert_eq!(
            kinds,
            vec![Some("syntax_error".into()), Some("cascading_error".into())]
        );
        assert_eq!(report.step_feedback[1].root_cause.as_deref(), Some("step 1"));
        let total_deducted: u32 = report.deductions.iter().map(|d| d.deducted_points).sum();
        assert_eq!(total_deducted, 20);
    }

    #[test]
    fn assumption_path_keeps_full_marks_when_goal_holds() {
        let steps = vec![Step::new(1, "IsTangentOfCircle(XY,O)")];
        let report = grade(&settled_spec(), &steps);
        assert_eq!(report.total_points, 100);
        assert!(report.goal_reached);
        let fb = &report.step_feedback[0];
        assert!(fb.is_valid);
        assert!((fb.confidence - 0.75).abs() < 1e-9);
    }

    #[test]
    fn algebraic_chain_resolves_value_goal() {
        let spec = ProblemSpec {
            construction_cdl: vec![],
            text_cdl: vec![],
            goal_cdl: "Value(MeasureOfAngle(DEF))".into(),
            problem_answer: Some("40".into()),
        };
        let steps = vec![
            Step::new(1, "Equal(MeasureOfAngle(ABC),40)"),
            Step::new(2, "Equal(MeasureOfAngle(DEF),MeasureOfAngle(ABC))"),
            Step::new(3, "Equal(MeasureOfAngle(DEF),40)"),
        ];
        let report = grade(&spec, &steps);
        assert!(report.goal_reached);
        assert_eq!(report.total_points, 100);
        assert!(report.step_feedback.iter().all(|f| f.is_valid));
        // Step 3 restates what the equation system already entails.
        assert!(report.step_feedback[2].is_redundant);
        assert!((report.step_feedback[2].confidence - 0.80).abs() < 1e-9);
    }

    #[test]
    fn unknown_theorem_costs_twenty() {
        let steps = vec![Step::new(1, "RightTriangle(ACB)").with_theorem("magic_angle_thm")];
        let report = grade(&settled_spec(), &steps);
        assert_eq!(report.total_points, 80);
        assert_eq!(
            report.step_feedback[0].error_type.as_deref(),
            Some("unknown_theorem")
        );
        assert!((report.deductions[0].deduction_confidence_score - 0.87).abs() < 1e-9);
    }

    #[test]
    fn empty_step_list_boundary() {
        // Goal already holds from the givens: full marks.
        let report = grade(&settled_spec(), &[]);
        assert_eq!(report.total_points, 100);
        assert_eq!(report.confidence, 0.0);
        assert!(report.step_feedback.is_empty());

        // Goal open: one missing-steps deduction.
        let report = grade(&circle_spec("Equal(MeasureOfAngle(ACB),90)"), &[]);
        assert_eq!(report.total_points, 80);
        assert_eq!(report.missing_steps.len(), 1);
    }

    #[test]
    fn global_misalignment_terminates_early_and_zeroes() {
        let options = GradeOptions {
            overrides: vec![PolicyOverride {
                step_id: 1,
                kind: ErrorKind::GlobalMisalignment,
                details: None,
            }],
            ..GradeOptions::default()
        };
        let steps = vec![
            Step::new(1, "IsTangentOfCircle(XY,O)"),
            Step::new(2, "Cocircular(O,ABC)"),
        ];
        let mut engine = DeductiveEngine::new();
        let report = grade_with_engine(&mut engine, &settled_spec(), &steps, &options);
        assert_eq!(report.step_feedback.len(), 1, "loop terminates at the fatal step");
        assert_eq!(report.total_points, 0);
        assert_eq!(
            report.step_feedback[0].error_type.as_deref(),
            Some("global_misalignment")
        );
    }

    #[test]
    fn initialization_failure_degrades_cleanly() {
        let spec = ProblemSpec {
            construction_cdl: vec!["Shape(AB,BC,CD)".into()], // does not close
            text_cdl: vec![],
            goal_cdl: "Value(MeasureOfAngle(ABC))".into(),
            problem_answer: None,
        };
        let report = grade(&spec, &[Step::new(1, "Triangle(ABC)")]);
        assert_eq!(report.total_points, 0);
        assert!(report.step_feedback.is_empty());
        assert_eq!(report.deductions.len(), 1);
        let d = &report.deductions[0];
        assert_eq!(d.deducted_points, 100);
        assert_eq!(d.deduction_step, "initialization");
        assert!((d.deduction_confidence_score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn confidence_filter_discards_low_confidence_deductions() {
        let options = GradeOptions { confidence_floor: 0.9, ..GradeOptions::default() };
        let steps = vec![Step::new(1, "Equal(LengthOfLine(OA)")]; // syntax, confidence 0.85
        let mut engine = DeductiveEngine::new();
        let report = grade_with_engine(&mut engine, &settled_spec(), &steps, &options);
        assert!(report.deductions.is_empty());
        assert_eq!(report.total_points, 100);
        assert!(!report.step_feedback[0].is_valid, "feedback still records the failure");
    }

    #[test]
    fn feedback_preserves_step_order() {
        let steps = vec![
            Step::new(1, "Equal(MeasureOfAngle(ABC),40)"),
            Step::new(2, "IsTangentOfCircle(XY,O)"),
            Step::new(3, "Equal(LengthOfLine(OA)"),
            Step::new(4, "Cocircular(O,ABC)").with_depends_on(vec![3]),
        ];
        let report = grade(&settled_spec(), &steps);
        let ids: Vec<u32> = report.step_feedback.iter().map(|f| f.step_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn minimal_engine_degrades_but_still_grades() {
        let steps = vec![
            Step::new(1, "Equal(MeasureOfAngle(ABC),40)"),
            Step::new(2, "IsTangentOfCircle(XY,O)"),
        ];
        let mut engine = MinimalEngine::new();
        let report = grade_with_engine(
            &mut engine,
            &settled_spec(),
            &steps,
            &GradeOptions::default(),
        );
        // Equations still land, assumptions still admit, the goal never
        // closes.
        assert!(report.step_feedback.iter().all(|f| f.is_valid));
        assert!(!report.goal_reached);
        assert_eq!(report.total_points, 80);
    }

    #[test]
    fn aggregate_confidence_is_mean_of_step_confidences() {
        let steps = vec![
            Step::new(1, "Equal(MeasureOfAngle(ABC),40)"), // 0.85
            Step::new(2, "IsTangentOfCircle(XY,O)"),       // 0.75
        ];
        let report = grade(&settled_spec(), &steps);
        assert!((report.confidence - 0.80).abs() < 1e-9);
    }
}
