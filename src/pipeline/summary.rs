//! Ledger summaries for the command line.

use serde::Serialize;

use super::events::TrialOutcome;
use super::ledger::LedgerSnapshot;
use super::simulate::{DivergenceKind, EmpiricalTrial};

/// Aggregated ledger counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    /// Runs started.
    pub runs: usize,
    /// Attempted trials.
    pub attempted: usize,
    /// Mutants that did not compile.
    pub compile_errors: usize,
    /// Mutants that timed out.
    pub timeouts: usize,
    /// Mutants the test did not kill.
    pub survived: usize,
    /// Killing runs over the step cap.
    pub over_long: usize,
    /// Killing runs that were localized.
    pub killed: usize,
    /// Killing runs without an explainable divergence.
    pub no_trial: usize,
    /// Failed trials.
    pub errors: usize,
    /// Ignored test cases.
    pub ignored: usize,
    /// Localized trials.
    pub empirical: usize,
    /// Malformed ledger lines.
    pub malformed_lines: usize,
}

impl LedgerSummary {
    /// Build summary from snapshot.
    pub fn from_snapshot(snapshot: &LedgerSnapshot) -> Self {
        let mut out = Self {
            runs: snapshot.runs.len(),
            attempted: snapshot.trials.len(),
            ignored: snapshot.ignored.len(),
            empirical: snapshot.empirical.len(),
            malformed_lines: snapshot.malformed_lines,
            ..Self::default()
        };
        for record in snapshot.trials.values() {
            match record.outcome {
                TrialOutcome::CompileError => out.compile_errors += 1,
                TrialOutcome::Timeout => out.timeouts += 1,
                TrialOutcome::Survived => out.survived += 1,
                TrialOutcome::OverLong => out.over_long += 1,
                TrialOutcome::Killed => out.killed += 1,
                TrialOutcome::NoTrial => out.no_trial += 1,
                TrialOutcome::Error { .. } => out.errors += 1,
            }
        }
        out
    }
}

fn divergence_label(kind: &DivergenceKind) -> String {
    match kind {
        DivergenceKind::ControlFlow => "control flow".to_string(),
        DivergenceKind::MissingStep => "missing step".to_string(),
        DivergenceKind::DataValue { vars } => format!("data ({})", vars.join(", ")),
    }
}

/// Markdown status table.
pub fn render_status(snapshot: &LedgerSnapshot) -> String {
    let summary = LedgerSummary::from_snapshot(snapshot);
    let mut out = String::from("# Trial Ledger\n\n");
    out.push_str(&format!(
        "- runs: {}\n- completed: {}\n- interrupted: {}\n- malformed lines: {}\n\n",
        summary.runs, snapshot.completed, snapshot.interrupted, summary.malformed_lines
    ));
    out.push_str("| metric | count |\n|---|---:|\n");
    for (name, count) in [
        ("attempted", summary.attempted),
        ("killed", summary.killed),
        ("no trial", summary.no_trial),
        ("survived", summary.survived),
        ("timeout", summary.timeouts),
        ("over-long", summary.over_long),
        ("compile error", summary.compile_errors),
        ("error", summary.errors),
        ("ignored test cases", summary.ignored),
        ("empirical trials", summary.empirical),
    ] {
        out.push_str(&format!("| {name} | {count} |\n"));
    }
    out
}

/// One line per localized trial.
pub fn render_trials(trials: &[EmpiricalTrial]) -> String {
    let mut out = String::new();
    for trial in trials {
        out.push_str(&format!(
            "{} -> {} (step {}, {}{})\n",
            trial.key,
            trial.root_cause,
            trial.root_cause_step,
            divergence_label(&trial.divergence),
            if trial.loop_effective { ", in loop" } else { "" }
        ));
    }
    out
}
