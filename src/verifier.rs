//! Per-step verification (cascade → parse → route → verdict)
//!
//! Every step produces exactly one [`StepVerdict`] through a fixed routing
//! order:
//!
//! ```text
//!   Start → [cascade?]──yes→ Invalid(CascadingError)
//!       → [parse?]────fail→ Invalid(SyntaxError)
//!       → [Equal?]────yes→ equation fast path / theorem route
//!       → [predicate known?]──no→ assumption (slot + add)
//!       → [in KB?]────yes→ Valid(member)
//!       → [theorem supplied?]─yes→ match → snapshot → apply → verify
//!       → assumption fallback
//! ```
//!
//! Grading-domain failures are verdict kinds with deductions, never `Err`:
//! the caller always gets a verdict and the loop always continues. The only
//! KB mutation that can be half-done is a speculative theorem application,
//! and that is fenced by snapshot/restore — a failed application that skips
//! the restore is a bug, not a policy choice.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use tracing::debug;

use crate::cdl::{self, Claim};
use crate::engine::TheoremEngine;
use crate::kb::TheoremTag;
use crate::matcher;
use crate::Step;

/// Closed failure taxonomy. String ids are part of the report contract.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    GlobalMisalignment,
    MissingPremise,
    InvalidTheorem,
    WrongConclusion,
    NotDerivable,
    UnknownTheorem,
    UnknownPredicate,
    ComputationError,
    SyntaxError,
    CascadingError,
}

impl ErrorKind {
    /// Stable string identifier used in reports.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::GlobalMisalignment => "global_misalignment",
            ErrorKind::MissingPremise => "missing_premise",
            ErrorKind::InvalidTheorem => "invalid_theorem",
            ErrorKind::WrongConclusion => "wrong_conclusion",
            ErrorKind::NotDerivable => "not_derivable",
            ErrorKind::UnknownTheorem => "unknown_theorem",
            ErrorKind::UnknownPredicate => "unknown_predicate",
            ErrorKind::ComputationError => "computation_error",
            ErrorKind::SyntaxError => "syntax_error",
            ErrorKind::CascadingError => "cascading_error",
        }
    }

    /// Default point cost.
    pub fn points(self) -> u32 {
        match self {
            ErrorKind::GlobalMisalignment => 100,
            ErrorKind::MissingPremise
            | ErrorKind::InvalidTheorem
            | ErrorKind::WrongConclusion
            | ErrorKind::NotDerivable
            | ErrorKind::UnknownTheorem => 20,
            ErrorKind::UnknownPredicate => 15,
            ErrorKind::ComputationError | ErrorKind::SyntaxError | ErrorKind::CascadingError => 10,
        }
    }

    /// Default confidence for a deduction of this kind.
    pub fn confidence(self) -> f64 {
        match self {
            ErrorKind::GlobalMisalignment => 0.95,
            ErrorKind::MissingPremise => 0.90,
            ErrorKind::InvalidTheorem => 0.88,
            ErrorKind::WrongConclusion => 0.92,
            ErrorKind::NotDerivable => 0.85,
            ErrorKind::UnknownTheorem => 0.87,
            ErrorKind::UnknownPredicate => 0.80,
            ErrorKind::ComputationError => 0.88,
            ErrorKind::SyntaxError => 0.85,
            ErrorKind::CascadingError => 0.85,
        }
    }

    /// Human-readable deduction reason.
    pub fn reason(self, step_id: u32, root_cause: Option<u32>) -> String {
        match self {
            ErrorKind::GlobalMisalignment => {
                "Solution does not serve the purpose of solving the problem".to_string()
            }
            ErrorKind::MissingPremise => format!(
                "Step {step_id} lacks necessary prerequisite - logical gap in reasoning"
            ),
            ErrorKind::InvalidTheorem => format!(
                "Step {step_id} incorrectly applies theorem - prerequisites not met"
            ),
            ErrorKind::WrongConclusion => format!(
                "Step {step_id} draws incorrect conclusion from theorem application"
            ),
            ErrorKind::NotDerivable => format!(
                "Step {step_id} claims result that cannot be derived from current state"
            ),
            ErrorKind::UnknownTheorem => format!("Step {step_id} references unknown theorem"),
            ErrorKind::UnknownPredicate => format!(
                "Step {step_id} uses predicate not recognized by the geometry system"
            ),
            ErrorKind::ComputationError => format!(
                "Step {step_id} contains local computational or algebraic error"
            ),
            ErrorKind::SyntaxError => format!(
                "Step {step_id} has incorrect mathematical notation or format"
            ),
            ErrorKind::CascadingError => match root_cause {
                Some(root) => format!("Step {step_id} error cascaded from incorrect step {root}"),
                None => format!("Step {step_id} error cascaded from an incorrect earlier step"),
            },
        }
    }
}

/// Outcome variant of one verified step.
#[derive(Clone, Debug, PartialEq)]
pub enum Verdict {
    Valid {
        theorem: Option<String>,
        redundant: bool,
    },
    Invalid {
        kind: ErrorKind,
        details: String,
        root_cause: Option<u32>,
    },
    Unknown {
        reason: String,
    },
}

/// One step's verdict with its confidence and point cost.
#[derive(Clone, Debug, PartialEq)]
pub struct StepVerdict {
    pub step_id: u32,
    pub verdict: Verdict,
    pub confidence: f64,
    pub points_deducted: u32,
}

impl StepVerdict {
    pub fn valid(step_id: u32, theorem: Option<String>, redundant: bool, confidence: f64) -> Self {
        Self {
            step_id,
            verdict: Verdict::Valid { theorem, redundant },
            confidence,
            points_deducted: 0,
        }
    }

    /// Invalid verdict with the taxonomy's default points and the given
    /// path-specific confidence.
    pub fn invalid(
        step_id: u32,
        kind: ErrorKind,
        details: String,
        root_cause: Option<u32>,
        confidence: f64,
    ) -> Self {
        Self {
            step_id,
            verdict: Verdict::Invalid { kind, details, root_cause },
            confidence,
            points_deducted: kind.points(),
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        matches!(self.verdict, Verdict::Valid { .. })
    }

    #[inline]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.verdict {
            Verdict::Invalid { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Verify one step against the engine's current KB.
///
/// `previous` holds the verdicts of all earlier steps, in order; the cascade
/// check reads dependency outcomes from it.
pub fn verify_step<E: TheoremEngine>(
    engine: &mut E,
    step: &Step,
    previous: &[StepVerdict],
) -> StepVerdict {
    let step_id = step.step_id;

    // S1 — cascade. An invalid dependency wins over everything else.
    for dep in &step.depends_on {
        let dep_verdict = previous.iter().find(|v| v.step_id == *dep);
        if let Some(v) = dep_verdict {
            if !v.is_valid() {
                debug!(step = step_id, dep, "cascading failure");
                return StepVerdict::invalid(
                    step_id,
                    ErrorKind::CascadingError,
                    ErrorKind::CascadingError.reason(step_id, Some(*dep)),
                    Some(*dep),
                    0.85,
                );
            }
        }
    }
    // Forward, self, or unknown references are missing premises.
    for dep in &step.depends_on {
        let missing = *dep >= step_id || !previous.iter().any(|v| v.step_id == *dep);
        if missing {
            return StepVerdict::invalid(
                step_id,
                ErrorKind::NotDerivable,
                format!("Step {step_id} depends on step {dep}, which does not precede it"),
                None,
                0.85,
            );
        }
    }

    // S2 — parse.
    let claim = match cdl::parse_claim(&step.claim_cdl, step_id, 1, engine.centre_hint()) {
        Ok(c) => c,
        Err(e) => {
            debug!(step = step_id, error = %e, "claim failed to parse");
            return StepVerdict::invalid(
                step_id,
                ErrorKind::SyntaxError,
                format!("Cannot parse claim: {e}"),
                None,
                0.85,
            );
        }
    };
    debug!(step = step_id, claim = %claim.claim_id, predicate = %claim.predicate, "parsed");

    // S3 — Equal claims.
    if claim.predicate == "Equal" {
        return match (&claim.expr, &step.theorem_name) {
            // Algebra the lowering cannot express is admitted rather than
            // penalized; the equation sub-store owns algebra.
            (None, _) => {
                StepVerdict::valid(step_id, Some("algebraic_constraint".into()), false, 0.75)
            }
            (Some(_), Some(name)) => theorem_route(engine, step, &claim, name),
            (Some(eq), None) => {
                let redundant = engine.kb().entails(eq);
                let tag = TheoremTag::AlgebraicConstraint(step_id);
                match engine.kb_mut().add_equation(eq, &[], tag) {
                    Ok(_) => StepVerdict::valid(
                        step_id,
                        Some("algebraic_constraint".into()),
                        redundant,
                        if redundant { 0.80 } else { 0.85 },
                    ),
                    Err(_) => StepVerdict::valid(
                        step_id,
                        Some("algebraic_constraint".into()),
                        false,
                        0.75,
                    ),
                }
            }
        };
    }

    // S4 — unknown predicate: bounded-trust admission.
    if !engine.kb().knows_predicate(&claim.predicate) {
        engine.kb_mut().ensure_predicate_slot(&claim.predicate);
        let tag = TheoremTag::Assumption(step_id);
        return match engine.kb_mut().add(&claim.predicate, &claim.item, &[], tag) {
            Ok(_) => {
                let theorem = step.theorem_name.clone().or_else(|| Some("assumption".into()));
                StepVerdict::valid(step_id, theorem, false, 0.70)
            }
            Err(e) => StepVerdict::invalid(
                step_id,
                ErrorKind::UnknownPredicate,
                format!("{} ({e})", ErrorKind::UnknownPredicate.reason(step_id, None)),
                None,
                0.60,
            ),
        };
    }

    // S5 — already established.
    if engine.kb().has_points(&claim.predicate, &claim.item) {
        return StepVerdict::valid(step_id, None, false, 0.90);
    }

    // S6 — theorem application.
    if let Some(name) = &step.theorem_name {
        return theorem_route(engine, step, &claim, name);
    }

    // S7 — assumption fallback.
    let tag = TheoremTag::Assumption(step_id);
    match engine.kb_mut().add(&claim.predicate, &claim.item, &[], tag) {
        Ok(_) => StepVerdict::valid(step_id, Some("assumption".into()), false, 0.75),
        Err(e) => StepVerdict::invalid(
            step_id,
            ErrorKind::NotDerivable,
            format!("{} ({e})", ErrorKind::NotDerivable.reason(step_id, None)),
            None,
            0.50,
        ),
    }
}

/// Match the informal theorem name, speculatively apply it, and confirm the
/// claimed conclusion materialized. Restores the KB on any failure.
fn theorem_route<E: TheoremEngine>(
    engine: &mut E,
    step: &Step,
    claim: &Claim,
    name: &str,
) -> StepVerdict {
    let step_id = step.step_id;
    let canonical = match matcher::match_theorem(name, engine.theorem_names()) {
        Some(c) => c,
        None => {
            return StepVerdict::invalid(
                step_id,
                ErrorKind::UnknownTheorem,
                format!("Cannot find theorem '{name}' in the registry"),
                None,
                0.87,
            );
        }
    };
    debug!(step = step_id, student = name, canonical, "theorem matched");

    let snapshot = engine.kb().snapshot();
    match engine.apply_theorem(canonical, &claim.item) {
        None => {
            engine.kb_mut().restore(snapshot);
            StepVerdict::invalid(
                step_id,
                ErrorKind::InvalidTheorem,
                format!("Theorem '{canonical}' prerequisites not satisfied in current state"),
                None,
                0.88,
            )
        }
        Some(_) => {
            let concluded = match &claim.expr {
                Some(eq) => engine.kb().entails(eq),
                None => engine.kb().has_points(&claim.predicate, &claim.item),
            };
            if concluded {
                StepVerdict::valid(step_id, Some(canonical.to_string()), false, 0.92)
            } else {
                engine.kb_mut().restore(snapshot);
                StepVerdict::invalid(
                    step_id,
                    ErrorKind::WrongConclusion,
                    format!("Theorem '{canonical}' does not produce the claimed conclusion"),
                    None,
                    0.92,
                )
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DeductiveEngine;
    use crate::ProblemSpec;

    fn engine() -> DeductiveEngine {
        let spec = ProblemSpec {
            construction_cdl: vec!["Cocircular(O,ABC)".into()],
            text_cdl: vec![
                "IsCentreOfCircle(O,O)".into(),
                "IsDiameterOfCircle(AB,O)".into(),
            ],
            goal_cdl: "Equal(MeasureOfAngle(ACB),90)".into(),
            problem_answer: None,
        };
        let mut eng = DeductiveEngine::new();
        eng.load(&spec).unwrap();
        eng
    }

    fn step(id: u32, cdl: &str) -> Step {
        Step::new(id, cdl)
    }

    #[test]
    fn cascade_beats_everything_else() {
        let mut eng = engine();
        let bad = StepVerdict::invalid(
            1,
            ErrorKind::SyntaxError,
            "broken".into(),
            None,
            0.85,
        );
        // The claim itself is a perfectly fine given, but the dependency is
        // invalid, so cascade wins.
        let s = step(2, "Cocircular(O,ABC)").with_depends_on(vec![1]);
        let v = verify_step(&mut eng, &s, &[bad]);
        assert_eq!(v.error_kind(), Some(ErrorKind::CascadingError));
        assert_eq!(v.points_deducted, 10);
        assert!((v.confidence - 0.85).abs() < 1e-9);
        match v.verdict {
            Verdict::Invalid { root_cause, .. } => assert_eq!(root_cause, Some(1)),
            _ => panic!("expected invalid"),
        }
    }

    #[test]
    fn forward_dependency_is_not_derivable() {
        let mut eng = engine();
        let s = step(1, "Cocircular(O,ABC)").with_depends_on(vec![3]);
        let v = verify_step(&mut eng, &s, &[]);
        assert_eq!(v.error_kind(), Some(ErrorKind::NotDerivable));
        assert_eq!(v.points_deducted, 20);
    }

    #[test]
    fn syntax_failure_verdict() {
        let mut eng = engine();
        let v = verify_step(&mut eng, &step(1, "Equal(LengthOfLine(OA)"), &[]);
        assert_eq!(v.error_kind(), Some(ErrorKind::SyntaxError));
        assert_eq!(v.points_deducted, 10);
        assert!((v.confidence - 0.85).abs() < 1e-9);
    }

    #[test]
    fn equal_fast_path_and_redundancy() {
        let mut eng = engine();
        let v = verify_step(&mut eng, &step(1, "Equal(MeasureOfAngle(DEF),40)"), &[]);
        assert!(v.is_valid());
        assert!((v.confidence - 0.85).abs() < 1e-9);

        // Same constraint again: still valid, flagged redundant.
        let v2 = verify_step(&mut eng, &step(2, "Equal(MeasureOfAngle(DEF),40)"), &[]);
        match v2.verdict {
            Verdict::Valid { redundant, .. } => assert!(redundant),
            _ => panic!("expected valid"),
        }
        assert!((v2.confidence - 0.80).abs() < 1e-9);
    }

    #[test]
    fn unlowerable_algebra_is_admitted_leniently() {
        let mut eng = engine();
        let v = verify_step(&mut eng, &step(1, "Equal(LengthOfLine(AB)/2,LengthOfLine(CD))"), &[]);
        assert!(v.is_valid());
        assert!((v.confidence - 0.75).abs() < 1e-9);
    }

    #[test]
    fn unknown_predicate_becomes_assumption() {
        let mut eng = engine();
        let v = verify_step(&mut eng, &step(1, "MidpointOfLine(M,AB)"), &[]);
        assert!(v.is_valid());
        assert!((v.confidence - 0.70).abs() < 1e-9);
        assert!(eng.kb().has_points("MidpointOfLine", &['M', 'A', 'B']));
    }

    #[test]
    fn membership_hit_is_high_confidence() {
        let mut eng = engine();
        let v = verify_step(&mut eng, &step(1, "Cocircular(O,ABC)"), &[]);
        assert!(v.is_valid());
        assert!((v.confidence - 0.90).abs() < 1e-9);
    }

    #[test]
    fn unknown_theorem_name_is_invalid() {
        let mut eng = engine();
        let s = step(1, "RightTriangle(ACB)").with_theorem("magic_angle_thm");
        let v = verify_step(&mut eng, &s, &[]);
        assert_eq!(v.error_kind(), Some(ErrorKind::UnknownTheorem));
        assert_eq!(v.points_deducted, 20);
        assert!((v.confidence - 0.87).abs() < 1e-9);
    }

    #[test]
    fn wrong_conclusion_rolls_the_kb_back() {
        let mut eng = engine();
        let before = eng.kb().canonical_bytes();
        // D is not on the circle: the radius theorem applies but cannot
        // support OA = OD.
        let s = step(1, "Equal(LengthOfLine(OA),LengthOfLine(OD))")
            .with_theorem("circle_property_radius_equal");
        let v = verify_step(&mut eng, &s, &[]);
        assert_eq!(v.error_kind(), Some(ErrorKind::WrongConclusion));
        assert_eq!(v.points_deducted, 20);
        assert!((v.confidence - 0.92).abs() < 1e-9);
        assert_eq!(eng.kb().canonical_bytes(), before, "rollback must be byte-faithful");
    }

    #[test]
    fn equal_claim_with_theorem_takes_the_theorem_route() {
        let mut eng = engine();
        let s = step(1, "Equal(LengthOfLine(OA),LengthOfLine(OC))")
            .with_theorem("circle_property_radius_equal");
        let before_len = eng.kb().len();
        let v = verify_step(&mut eng, &s, &[]);
        match &v.verdict {
            Verdict::Valid { theorem, .. } => {
                assert_eq!(theorem.as_deref(), Some("circle_property_radius_equal"));
            }
            other => panic!("expected valid, got {other:?}"),
        }
        assert!((v.confidence - 0.92).abs() < 1e-9);
        assert!(eng.kb().len() > before_len, "committed theorem output");
    }

    #[test]
    fn invalid_theorem_when_preconditions_unmet() {
        let mut eng = engine();
        let before = eng.kb().canonical_bytes();
        // No CongruentBetweenTriangle fact exists, so the property theorem
        // has nothing to chew on.
        let s = step(1, "Equal(LengthOfLine(AB),LengthOfLine(DE))")
            .with_theorem("congruent_triangle_property_line_equal");
        let v = verify_step(&mut eng, &s, &[]);
        assert_eq!(v.error_kind(), Some(ErrorKind::InvalidTheorem));
        assert!((v.confidence - 0.88).abs() < 1e-9);
        assert_eq!(eng.kb().canonical_bytes(), before);
    }

    #[test]
    fn assumption_fallback_for_known_predicate() {
        let mut eng = engine();
        let v = verify_step(&mut eng, &step(1, "IsTangentOfCircle(XY,O)"), &[]);
        assert!(v.is_valid());
        assert!((v.confidence - 0.75).abs() < 1e-9);
        assert!(eng.kb().has_points("IsTangentOfCircle", &['X', 'Y', 'O']));
    }

    #[test]
    fn monotonic_growth_on_accepting_valid_steps() {
        let mut eng = engine();
        let mut len = eng.kb().len();
        let steps = [
            step(1, "Equal(MeasureOfAngle(DEF),40)"),
            step(2, "IsTangentOfCircle(XY,O)"),
            step(3, "MidpointOfLine(M,AB)"),
        ];
        let mut previous = Vec::new();
        for s in &steps {
            let v = verify_step(&mut eng, s, &previous);
            match &v.verdict {
                Verdict::Valid { redundant: false, .. } => {
                    assert!(eng.kb().len() > len, "step {} must grow the KB", s.step_id);
                }
                other => panic!("expected non-redundant valid, got {other:?}"),
            }
            len = eng.kb().len();
            previous.push(v);
        }
    }
}
