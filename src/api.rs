// src/api.rs
//! "Happy-path" crate API
//!
//! This module wraps the grading core with a small, ergonomic surface area:
//! - `GraderBuilder` hides engine/option wiring (safe defaults)
//! - one-shot `grade_solution` for the common case
//! - `io` helpers for the JSON request/report formats the CLI speaks
//!
//! Everything delegates to the existing `grader::grade_with_engine` and
//! changes no grading semantics.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    engine::{DeductiveEngine, MinimalEngine},
    grader::{self, GradeOptions, PolicyOverride},
    GradingReport, ProblemSpec, Step,
};

// ===============================================================================================
// Builder
// ===============================================================================================

/// Ergonomic constructor for a configured grade call.
///
/// Defaults:
/// - built-in deductive engine
/// - confidence floor: 0.5
/// - no policy overrides
pub struct GraderBuilder {
    options: GradeOptions,
    minimal: bool,
}

impl GraderBuilder {
    pub fn new() -> Self {
        Self { options: GradeOptions::default(), minimal: false }
    }

    /// Deductions below this confidence are discarded before scoring.
    pub fn confidence_floor(mut self, floor: f64) -> Self {
        self.options.confidence_floor = floor.clamp(0.0, 1.0);
        self
    }

    /// Inject a policy verdict (e.g. rubric-level global misalignment).
    pub fn policy_override(mut self, o: PolicyOverride) -> Self {
        self.options.overrides.push(o);
        self
    }

    /// Use the degraded no-deduction engine instead of the built-in solver.
    pub fn minimal_engine(mut self) -> Self {
        self.minimal = true;
        self
    }

    /// Run one grade call. A fresh engine is constructed and dropped here;
    /// nothing is shared across calls.
    pub fn grade(&self, spec: &ProblemSpec, steps: &[Step]) -> GradingReport {
        if self.minimal {
            let mut engine = MinimalEngine::new();
            grader::grade_with_engine(&mut engine, spec, steps, &self.options)
        } else {
            let mut engine = DeductiveEngine::new();
            grader::grade_with_engine(&mut engine, spec, steps, &self.options)
        }
    }
}

impl Default for GraderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ===============================================================================================
/* One-shot helpers */
// ===============================================================================================

/// Grade a solution with all defaults.
pub fn grade_solution(spec: &ProblemSpec, steps: &[Step]) -> GradingReport {
    GraderBuilder::new().grade(spec, steps)
}

// ===============================================================================================
/* Request / report I/O */
// ===============================================================================================

pub mod io {
    //! JSON I/O for the CLI and other thin hosts.
    //!
    //! A request file bundles the formalized problem with the ordered step
    //! list; the report is the stable `GradingReport` wire shape.

    use super::*;

    /// One grading request: the formalized problem plus the student's steps.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct GradeRequest {
        pub problem: ProblemSpec,
        #[serde(default)]
        pub steps: Vec<Step>,
    }

    /// Read a request file.
    pub fn read_request(path: &Path) -> anyhow::Result<GradeRequest> {
        let data = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("open {}: {e}", path.display()))?;
        serde_json::from_str(&data)
            .map_err(|e| anyhow::anyhow!("parse {}: {e}", path.display()))
    }

    /// Render a report as JSON.
    pub fn render_report(report: &GradingReport, pretty: bool) -> anyhow::Result<String> {
        let out = if pretty {
            serde_json::to_string_pretty(report)?
        } else {
            serde_json::to_string(report)?
        };
        Ok(out)
    }

    /// Write a report file.
    pub fn write_report(path: &Path, report: &GradingReport, pretty: bool) -> anyhow::Result<()> {
        let out = render_report(report, pretty)?;
        fs::write(path, out).map_err(|e| anyhow::anyhow!("write {}: {e}", path.display()))
    }
}

// ===============================================================================================
// Tests
// ===============================================================================================
