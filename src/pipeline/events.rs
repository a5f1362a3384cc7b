//! Event model for the append-only trial ledger.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::collaborators::TestCaseId;
use super::mutator::{MutantFile, MutationStrategy};
use super::simulate::EmpiricalTrial;

/// Identity of one trial: a test case against one mutant of one line.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrialKey {
    /// Test case the mutant was run against.
    pub test_case: TestCaseId,
    /// Outer class whose source was mutated.
    pub class: String,
    /// Mutated line.
    pub line: u32,
    /// Producing strategy.
    pub strategy: MutationStrategy,
    /// Position among the line's mutants for the strategy.
    pub ordinal: usize,
}

impl TrialKey {
    /// Key for running `test_case` against `mutant`.
    pub fn for_mutant(test_case: &TestCaseId, mutant: &MutantFile) -> Self {
        Self {
            test_case: test_case.clone(),
            class: mutant.class.clone(),
            line: mutant.line,
            strategy: mutant.strategy,
            ordinal: mutant.ordinal,
        }
    }
}

impl fmt::Display for TrialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ {}:{} [{}{}]",
            self.test_case,
            self.class,
            self.line,
            self.strategy.tag(),
            self.ordinal
        )
    }
}

/// Terminal outcome of one attempted trial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrialOutcome {
    /// Mutant did not compile.
    CompileError,
    /// Test exceeded its wall-clock budget.
    Timeout,
    /// Test still passed.
    Survived,
    /// Killing run exceeded the step cap.
    OverLong,
    /// Killing run produced an empirical trial.
    Killed,
    /// Killing run produced no explainable divergence.
    NoTrial,
    /// Processing failed unexpectedly.
    Error {
        /// Error detail.
        message: String,
    },
}

/// Why a test case is skipped by later runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    /// The unmutated test fails.
    BaselineFailure,
    /// The unmutated test exceeds the step cap.
    OverLongBaseline,
    /// No candidate produced a mutant.
    Unmutable,
    /// The first executed class has no source.
    UnresolvedCandidate,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BaselineFailure => "baseline failure",
            Self::OverLongBaseline => "over-long baseline",
            Self::Unmutable => "unmutable",
            Self::UnresolvedCandidate => "unresolved candidate",
        })
    }
}

/// Ledger event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    /// Orchestration run started.
    RunStarted {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Project namespace.
        project: String,
    },
    /// Test case will be skipped from now on.
    TestCaseIgnored {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Ignored test case.
        test_case: TestCaseId,
        /// Reason.
        reason: IgnoreReason,
        /// Optional detail, e.g. the unresolved class.
        #[serde(default)]
        detail: Option<String>,
    },
    /// A mutant was attempted against a test case.
    TrialFinished {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Trial identity.
        key: TrialKey,
        /// Mutant source path.
        mutant_path: String,
        /// Terminal outcome.
        outcome: TrialOutcome,
        /// Compile + execute time.
        #[serde(default)]
        duration_ms: Option<u64>,
    },
    /// A killing mutant was localized.
    EmpiricalTrialFound {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Localized trial.
        trial: EmpiricalTrial,
    },
    /// Run interrupted by signal or operator.
    RunInterrupted {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Free-form reason.
        reason: String,
    },
    /// Run went through every test case.
    RunCompleted {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
    },
}

/// Current unix timestamp in milliseconds.
pub fn now_timestamp_ms() -> i64 {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
