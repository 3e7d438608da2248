//! Minimal CLI grader
//!
//! Reads a JSON grading request (formalized problem + ordered steps), runs
//! one synchronous grade call, and emits the `GradingReport` JSON:
//!
//! ```text
//! grade --input solution.json [--out report.json] [--pretty] [--minimal]
//! ```
//!
//! Notes:
//! - Upstream extraction (image → steps) and the problem formalizer live
//!   elsewhere; this binary only drives the verification core.
//! - With no `--out`, the report goes to stdout; diagnostics go to stderr.
//! - `RUST_LOG` controls tracing verbosity (e.g. `RUST_LOG=geograder=debug`).

#![forbid(unsafe_code)]

use std::{env, path::Path};

use geograder::api::{self, GraderBuilder};
use tracing_subscriber::EnvFilter;

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn has_switch(args: &[String], key: &str) -> bool {
    args.iter().any(|a| a == key)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    let input = parse_flag(&args, "--input")
        .ok_or_else(|| anyhow::anyhow!("usage: grade --input <solution.json> [--out <report.json>] [--pretty] [--minimal]"))?;
    let pretty = has_switch(&args, "--pretty");
    let minimal = has_switch(&args, "--minimal");

    eprintln!("Reading grading request from {input}...");
    let request = api::io::read_request(Path::new(&input))?;
    eprintln!(
        "✓ Parsed problem ({} constructions, {} givens, {} steps)",
        request.problem.construction_cdl.len(),
        request.problem.text_cdl.len(),
        request.steps.len()
    );

    let mut builder = GraderBuilder::new();
    if minimal {
        eprintln!("Note: --minimal selected; theorem deduction is disabled.");
        builder = builder.minimal_engine();
    }
    let report = builder.grade(&request.problem, &request.steps);

    eprintln!();
    eprintln!("Grade: {}/100 (goal reached: {})", report.total_points, report.goal_reached);
    eprintln!("Confidence: {:.2}", report.confidence);
    for fb in &report.step_feedback {
        let status = if fb.is_valid { "ok" } else { fb.error_type.as_deref().unwrap_or("?") };
        eprintln!("  step {:>3}: {status}", fb.step_id);
    }

    match parse_flag(&args, "--out") {
        Some(out) => {
            api::io::write_report(Path::new(&out), &report, pretty)?;
            eprintln!("✓ Report written to {out}");
        }
        None => {
            println!("{}", api::io::render_report(&report, pretty)?);
        }
    }
    Ok(())
}
