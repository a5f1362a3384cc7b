//! Mutation-driven fault localization pipeline.
//!
//! A passing test case is mutated along its own execution. Every mutant the test kills
//! is traced, aligned against the correct trace and simulated to find the earliest
//! divergence explained by the mutated line. Progress is kept in an append-only ledger
//! so interrupted or repeated runs never redo work.

pub mod align;
pub mod cache;
pub mod candidates;
pub mod collaborators;
pub mod config;
pub mod events;
pub mod ledger;
pub mod mutator;
pub mod operators;
pub mod orchestrator;
pub mod runner;
pub mod simulate;
pub mod summary;

pub use align::{PairList, StepEquivalence, StepPair, TraceAligner};
pub use cache::UnitCache;
pub use candidates::{CandidateError, CandidateSelector, MutationCandidateSet};
pub use collaborators::{
    ClassScanner, CollaboratorError, CommandCompiler, CommandExecutor, Compiler, DiffProvider,
    ExecutionReport, ExecutionRequest, Executor, FsNavigator, LineDiff, ProjectNavigator,
    SimilarDiffProvider, SourceBlockScanner, SourceUnit, TestCaseId, TestPackage, TraceCapture,
};
pub use config::{AlignmentPolicy, PipelineConfig};
pub use events::{IgnoreReason, LedgerEvent, TrialKey, TrialOutcome};
pub use ledger::{Ledger, LedgerError, LedgerSnapshot};
pub use mutator::{MutantFile, MutationResult, MutationResults, MutationStrategy, Mutator};
pub use orchestrator::{
    CancellationFlag, Collaborators, Orchestrator, PipelineError, RunSummary, TrialDecision,
};
pub use runner::{MutantRunOutcome, MutantRunner, RunnerError, SlotRegistry};
pub use simulate::{Divergence, DivergenceKind, DivergenceSimulator, EmpiricalTrial};
pub use summary::{LedgerSummary, render_status, render_trials};
