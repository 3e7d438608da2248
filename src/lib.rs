//! Crate root: public surface, shared data model, and grading invariants
//!
//! This module is the **single canonical entry-point** for downstream users of
//! the library. It centralizes the shared data model (steps, problem specs),
//! re-exports the main submodules, and documents the invariants the whole
//! crate is built around.
//!
//! ## Invariants
//!
//! - **One grade call, one world.** A [`grade`] invocation owns its knowledge
//!   base, snapshot stack, and engine exclusively. Nothing is shared across
//!   invocations and nothing survives the call; concurrent grading means
//!   independent instances.
//! - **Append-only knowledge.** KB facts are never mutated in place. The only
//!   way to retract is restoring a snapshot taken before a speculative
//!   theorem application.
//! - **Verdicts, not exceptions.** A student being wrong is data: every step
//!   receives exactly one verdict, the loop always finishes, and the report
//!   is always well-formed (possibly with score 0). Only *infrastructure*
//!   failures (an unloadable problem) degrade the call, and even those
//!   produce a structured report.
//! - **Deterministic replay.** Fact ids are monotonic, step feedback follows
//!   input order, equation records preserve insertion order. Tests rely on
//!   ids and positions; no reordering optimization is permitted.
//!
//! The failure mode for violated invariants is a **precise error** (never
//! UB); we forbid unsafe throughout the crate.

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

use serde::{Deserialize, Serialize};

/// CDL tokenizer, parser, normalizer, and legacy repair.
pub mod cdl;
/// Knowledge base: facts, provenance, snapshots, equation sub-store.
pub mod kb;
/// Theorem engine seam plus the built-in deductive and minimal engines.
pub mod engine;
/// Informal theorem-name matching (cascade + Ratcliff–Obershelp).
pub mod matcher;
/// Per-step verification state machine and the failure taxonomy.
pub mod verifier;
/// Grade orchestration: step loop, deductions, goal check, summary.
pub mod grader;
/// Stable JSON report shapes.
pub mod report;
/// Happy-path facade: builder, one-shot grading, report I/O.
pub mod api;

// ============================================================================
// Canonical re-exports (centralization)
// ============================================================================

pub use crate::engine::{
    DeductiveEngine, GoalStatus, InitError, MinimalEngine, TheoremEngine, Update,
};
pub use crate::grader::{grade, grade_with_engine, GradeOptions, PolicyOverride};
pub use crate::kb::{FactId, KnowledgeBase, Snapshot, TheoremTag};
pub use crate::report::{Deduction, GradingReport, MissingStep, StepFeedback};
pub use crate::verifier::{ErrorKind, StepVerdict, Verdict};

// ============================================================================
// Shared data model
// ============================================================================

/// One ordered, numbered assertion from the student.
///
/// Upstream extractors fill the textual fields; the core only requires
/// `step_id`, `claim_cdl`, and (optionally) `theorem_name`/`depends_on`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Positive, unique per solution, strictly ordered in the input list.
    pub step_id: u32,
    /// Verbatim student text, as extracted.
    #[serde(default)]
    pub raw_text: String,
    /// Cleaned-up text, as produced upstream.
    #[serde(default)]
    pub normalized_text: String,
    /// Lexical atoms of the step, as produced upstream.
    #[serde(default)]
    pub tokens: Vec<String>,
    /// The single CDL expression this step claims.
    pub claim_cdl: String,
    /// Informal theorem name offered by the student, if any.
    #[serde(default)]
    pub theorem_name: Option<String>,
    /// Ids of earlier steps this one declares it builds on.
    #[serde(default)]
    pub depends_on: Vec<u32>,
}

impl Step {
    /// A bare step: just an id and a claim.
    pub fn new(step_id: u32, claim_cdl: &str) -> Self {
        Self {
            step_id,
            raw_text: String::new(),
            normalized_text: String::new(),
            tokens: Vec::new(),
            claim_cdl: claim_cdl.to_string(),
            theorem_name: None,
            depends_on: Vec::new(),
        }
    }

    /// Attach the student's theorem name.
    pub fn with_theorem(mut self, name: &str) -> Self {
        self.theorem_name = Some(name.to_string());
        self
    }

    /// Declare dependencies on earlier steps.
    pub fn with_depends_on(mut self, deps: Vec<u32>) -> Self {
        self.depends_on = deps;
        self
    }
}

/// The formalized problem, as emitted by the upstream formalizer.
///
/// All fields are raw CDL strings; the engine parses them at `load` and an
/// ill-formed spec degrades the grade call to an initialization failure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProblemSpec {
    /// Shape / collinear / cocircular declarations.
    #[serde(default)]
    pub construction_cdl: Vec<String>,
    /// Given predicates (including given `Equal` constraints).
    #[serde(default)]
    pub text_cdl: Vec<String>,
    /// `Value(expr)` or `Equal(lhs,rhs)`.
    pub goal_cdl: String,
    /// Expected answer for `Value` goals, when the problem states one.
    #[serde(default)]
    pub problem_answer: Option<String>,
}
