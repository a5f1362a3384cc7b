//! Top-level driver: test cases in package order, mutants in deterministic order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::align::TraceAligner;
use super::cache::UnitCache;
use super::candidates::{CandidateError, CandidateSelector};
use super::collaborators::{
    ClassScanner, CollaboratorError, Compiler, DiffProvider, ExecutionRequest, Executor,
    ProjectNavigator, TestCaseId, TraceCapture,
};
use super::config::PipelineConfig;
use super::events::{IgnoreReason, TrialKey, TrialOutcome};
use super::ledger::{Ledger, LedgerError};
use super::mutator::{
    MutantFile, MutationError, MutationResult, MutationResults, MutationStrategy, Mutator,
    merge_results,
};
use super::runner::{MutantRunOutcome, MutantRunner, RunnerError, SlotRegistry};
use super::simulate::{DivergenceSimulator, SimulationInput};
use crate::trace::{ClassLocation, Trace};

/// Cooperative cancellation shared with signal handlers.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    /// Unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What the driver does after one mutant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialDecision {
    /// Next mutant.
    Continue,
    /// Skip the remaining mutants of the current candidate line.
    StopCandidate,
    /// Skip the remaining mutants of the current test case.
    StopTestCase,
    /// Stop the run.
    StopAll,
}

/// Decide after a mutant produced (`Some(loop_effective)`) or did not produce a trial.
///
/// `valid_trials` counts trials already recorded for the test case, this one included.
pub fn decide(found: Option<bool>, valid_trials: usize, config: &PipelineConfig) -> TrialDecision {
    let Some(loop_effective) = found else {
        return TrialDecision::Continue;
    };
    if config.limit_trials && valid_trials >= config.trials_per_test_case {
        TrialDecision::StopTestCase
    } else if !loop_effective {
        TrialDecision::StopCandidate
    } else {
        TrialDecision::Continue
    }
}

/// Errors that abort a run. Everything else is contained per mutant or test case.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The ledger could not be read or written.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    /// The test suite could not be listed.
    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),
}

/// Collaborators the pipeline runs against.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    /// Source/project navigation.
    pub navigator: &'a dyn ProjectNavigator,
    /// Static candidate discovery.
    pub scanner: &'a dyn ClassScanner,
    /// Mutant compilation.
    pub compiler: &'a dyn Compiler,
    /// Test execution.
    pub executor: &'a dyn Executor,
    /// Source diffs.
    pub diff: &'a dyn DiffProvider,
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Run id.
    pub run_id: String,
    /// Test cases visited.
    pub test_cases: usize,
    /// Test cases newly ignored by this run.
    pub newly_ignored: usize,
    /// Test cases skipped because a previous run ignored them.
    pub previously_ignored: usize,
    /// Mutants generated.
    pub mutants_generated: usize,
    /// Mutants compiled and executed.
    pub trials_attempted: usize,
    /// Mutants skipped because the ledger already holds them.
    pub trials_skipped: usize,
    /// Localized trials found.
    pub empirical_trials: usize,
    /// Mutants whose processing failed.
    pub errors: usize,
    /// Run stopped on cancellation.
    pub interrupted: bool,
}

/// Result of the unmutated kill-check run.
enum Baseline {
    /// Passing run within limits.
    Usable {
        visited: Vec<ClassLocation>,
        correct: Option<Trace>,
    },
    /// The test case cannot produce meaningful mutants.
    Ignore(IgnoreReason, Option<String>),
}

/// Drives the whole pipeline.
pub struct Orchestrator<'a> {
    config: PipelineConfig,
    collaborators: Collaborators<'a>,
    aligner: TraceAligner,
    slots: SlotRegistry,
    cancel: CancellationFlag,
}

impl<'a> Orchestrator<'a> {
    /// Orchestrator over `collaborators`.
    pub fn new(config: PipelineConfig, collaborators: Collaborators<'a>) -> Self {
        let aligner = TraceAligner::new(config.alignment);
        Self {
            config,
            collaborators,
            aligner,
            slots: SlotRegistry::new(),
            cancel: CancellationFlag::new(),
        }
    }

    /// Share a cancellation flag.
    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run every test case of the suite.
    pub fn run(&self, ledger: &mut Ledger) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary {
            run_id: ledger.begin_run(&self.config.project_name)?,
            ..RunSummary::default()
        };
        let suite = self.collaborators.navigator.test_suite()?;
        let test_cases = suite.test_cases();
        info!(run_id = %summary.run_id, test_cases = test_cases.len(), "run started");

        // parsed units are only trusted for the duration of one run
        let mut cache = UnitCache::new();
        for test_case in &test_cases {
            if self.cancel.is_cancelled() {
                summary.interrupted = true;
                break;
            }
            summary.test_cases += 1;
            let decision = self.run_test_case(ledger, &mut cache, test_case, &mut summary)?;
            if decision == TrialDecision::StopAll {
                summary.interrupted = true;
                break;
            }
        }

        if summary.interrupted {
            warn!(run_id = %summary.run_id, "run interrupted");
            ledger.record_interrupted("cancelled")?;
        } else {
            ledger.record_completed()?;
        }
        info!(
            run_id = %summary.run_id,
            attempted = summary.trials_attempted,
            skipped = summary.trials_skipped,
            trials = summary.empirical_trials,
            cache_hits = cache.hits(),
            "run finished"
        );
        Ok(summary)
    }

    /// Process one test case.
    pub fn run_test_case(
        &self,
        ledger: &mut Ledger,
        cache: &mut UnitCache,
        test_case: &TestCaseId,
        summary: &mut RunSummary,
    ) -> Result<TrialDecision, PipelineError> {
        if ledger.is_ignored(test_case) {
            debug!(test_case = %test_case, "skipping ignored test case");
            summary.previously_ignored += 1;
            return Ok(TrialDecision::Continue);
        }
        if self.config.limit_trials
            && ledger.valid_trials(test_case) >= self.config.trials_per_test_case
        {
            debug!(test_case = %test_case, "trial cap already reached");
            return Ok(TrialDecision::StopTestCase);
        }

        let (visited, correct) = match self.baseline(test_case) {
            Ok(Baseline::Usable { visited, correct }) => (visited, correct),
            Ok(Baseline::Ignore(reason, detail)) => {
                self.ignore(ledger, test_case, reason, detail, summary)?;
                return Ok(TrialDecision::Continue);
            }
            Err(err) => {
                error!(test_case = %test_case, error = %err, "baseline execution failed");
                summary.errors += 1;
                return Ok(TrialDecision::Continue);
            }
        };

        let selector =
            CandidateSelector::new(self.collaborators.navigator, self.collaborators.scanner);
        let candidates = match selector.select(cache, &visited, &test_case.class, &self.cancel) {
            Ok(candidates) => candidates,
            Err(CandidateError::Unresolved(class)) => {
                self.ignore(
                    ledger,
                    test_case,
                    IgnoreReason::UnresolvedCandidate,
                    Some(class),
                    summary,
                )?;
                return Ok(TrialDecision::Continue);
            }
            Err(CandidateError::Cancelled) => return Ok(TrialDecision::StopAll),
        };
        if candidates.is_empty() {
            self.ignore(ledger, test_case, IgnoreReason::Unmutable, None, summary)?;
            return Ok(TrialDecision::Continue);
        }

        let results = match self.generate(
            cache,
            test_case,
            &candidates.dynamic,
            &candidates.control_dominated,
        ) {
            Ok(results) => results,
            Err(err) => {
                error!(test_case = %test_case, error = %err, "mutant generation failed");
                summary.errors += 1;
                return Ok(TrialDecision::Continue);
            }
        };
        let generated: usize = results.values().map(MutationResult::total).sum();
        if generated == 0 {
            self.ignore(ledger, test_case, IgnoreReason::Unmutable, None, summary)?;
            return Ok(TrialDecision::Continue);
        }
        summary.mutants_generated += generated;
        info!(
            test_case = %test_case,
            dynamic = candidates.dynamic.len(),
            control_dominated = candidates.control_dominated.len(),
            mutants = generated,
            "mutants generated"
        );

        for result in results.values() {
            for files in result.mutated_files.values() {
                for mutant in files {
                    if self.cancel.is_cancelled() {
                        return Ok(TrialDecision::StopAll);
                    }
                    let key = TrialKey::for_mutant(test_case, mutant);
                    let decision = if ledger.contains(&key) {
                        debug!(trial = %key, "trial already recorded");
                        summary.trials_skipped += 1;
                        self.recorded_decision(ledger, &key)
                    } else {
                        summary.trials_attempted += 1;
                        self.run_trial(ledger, &key, correct.as_ref(), result, mutant, summary)?
                    };
                    match decision {
                        TrialDecision::Continue => {}
                        TrialDecision::StopCandidate => break,
                        decision @ (TrialDecision::StopTestCase | TrialDecision::StopAll) => {
                            return Ok(decision);
                        }
                    }
                }
            }
        }
        Ok(TrialDecision::Continue)
    }

    /// Kill-check run of the unmutated program.
    fn baseline(&self, test_case: &TestCaseId) -> Result<Baseline, CollaboratorError> {
        let request = ExecutionRequest {
            test_case: test_case.clone(),
            step_limit: self.config.step_limit,
            timeout: self.config.timeout(),
            capture: TraceCapture::Always,
        };
        let report = match self.collaborators.executor.execute(&request) {
            Ok(report) => report,
            Err(CollaboratorError::Timeout { after }) => {
                return Ok(Baseline::Ignore(
                    IgnoreReason::BaselineFailure,
                    Some(format!("timed out after {after:?}")),
                ));
            }
            Err(err) => return Err(err),
        };
        if report.timed_out {
            return Ok(Baseline::Ignore(
                IgnoreReason::BaselineFailure,
                Some("timed out".to_string()),
            ));
        }
        if !report.passed {
            return Ok(Baseline::Ignore(IgnoreReason::BaselineFailure, None));
        }
        if report.over_long || report.step_count > self.config.step_limit {
            return Ok(Baseline::Ignore(
                IgnoreReason::OverLongBaseline,
                Some(format!("{} steps", report.step_count)),
            ));
        }

        let correct = report.trace.filter(|t| t.len() <= self.config.step_limit);
        let visited = if report.visited.is_empty() {
            correct.as_ref().map(Trace::visited_locations).unwrap_or_default()
        } else {
            report.visited
        };
        Ok(Baseline::Usable { visited, correct })
    }

    /// Decision a previous run took for an already recorded trial.
    fn recorded_decision(&self, ledger: &Ledger, key: &TrialKey) -> TrialDecision {
        let found = ledger
            .snapshot()
            .empirical_for(key)
            .map(|trial| trial.loop_effective);
        decide(found, ledger.valid_trials(&key.test_case), &self.config)
    }

    fn ignore(
        &self,
        ledger: &mut Ledger,
        test_case: &TestCaseId,
        reason: IgnoreReason,
        detail: Option<String>,
        summary: &mut RunSummary,
    ) -> Result<(), PipelineError> {
        info!(test_case = %test_case, reason = %reason, "ignoring test case");
        ledger.record_ignored(test_case, reason, detail)?;
        summary.newly_ignored += 1;
        Ok(())
    }

    fn generate(
        &self,
        cache: &mut UnitCache,
        test_case: &TestCaseId,
        dynamic: &[ClassLocation],
        control_dominated: &[ClassLocation],
    ) -> Result<MutationResults, MutationError> {
        let scratch = self.config.scratch_dir.join(path_segment(&test_case.to_string()));
        let mutator = Mutator::new(
            self.collaborators.navigator,
            scratch,
            self.config.mutants_per_test_case,
        );
        let mut results = mutator.mutate(cache, dynamic, MutationStrategy::TraceGuided)?;
        merge_results(
            &mut results,
            mutator.mutate(cache, control_dominated, MutationStrategy::ControlDominated)?,
        );
        Ok(results)
    }

    fn run_trial(
        &self,
        ledger: &mut Ledger,
        key: &TrialKey,
        correct: Option<&Trace>,
        result: &MutationResult,
        mutant: &MutantFile,
        summary: &mut RunSummary,
    ) -> Result<TrialDecision, PipelineError> {
        let runner = MutantRunner::new(
            self.collaborators.navigator,
            self.collaborators.compiler,
            self.collaborators.executor,
            &self.slots,
            self.config.step_limit,
            self.config.timeout(),
        );
        let run = match runner.run(&key.test_case, mutant) {
            Ok(run) => run,
            Err(err) => return self.record_error(ledger, key, mutant, &err, summary),
        };

        let outcome = match run.outcome {
            MutantRunOutcome::CompileError(message) => {
                debug!(trial = %key, message = %message, "mutant does not compile");
                TrialOutcome::CompileError
            }
            MutantRunOutcome::TimedOut => TrialOutcome::Timeout,
            MutantRunOutcome::Survived => TrialOutcome::Survived,
            MutantRunOutcome::OverLong { .. } => TrialOutcome::OverLong,
            MutantRunOutcome::Killed(trace) => {
                let diff = match self.collaborators.diff.diff(
                    &result.source_folder,
                    &result.source_file,
                    &mutant.path,
                ) {
                    Ok(diff) => diff,
                    Err(err) => {
                        let err = RunnerError::from(err);
                        return self.record_error(ledger, key, mutant, &err, summary);
                    }
                };
                let pairs = self.aligner.align(&trace, correct);
                let input = SimulationInput {
                    mutant: &trace,
                    correct,
                    pairs: &pairs,
                    diff: &diff,
                    mutated_class: &mutant.class,
                };
                match DivergenceSimulator.simulate(input, key.clone(), mutant.path.clone()) {
                    Some(trial) => {
                        let loop_effective = trial.loop_effective;
                        self.archive(key, mutant, &trace);
                        info!(
                            trial = %key,
                            root_cause = %trial.root_cause,
                            loop_effective,
                            "localized divergence"
                        );
                        ledger.record_trial(
                            key,
                            &mutant.path,
                            TrialOutcome::Killed,
                            Some(run.duration),
                        )?;
                        ledger.record_empirical(trial)?;
                        summary.empirical_trials += 1;
                        return Ok(decide(
                            Some(loop_effective),
                            ledger.valid_trials(&key.test_case),
                            &self.config,
                        ));
                    }
                    None => TrialOutcome::NoTrial,
                }
            }
        };
        ledger.record_trial(key, &mutant.path, outcome, Some(run.duration))?;
        Ok(decide(None, ledger.valid_trials(&key.test_case), &self.config))
    }

    fn record_error(
        &self,
        ledger: &mut Ledger,
        key: &TrialKey,
        mutant: &MutantFile,
        err: &RunnerError,
        summary: &mut RunSummary,
    ) -> Result<TrialDecision, PipelineError> {
        error!(
            trial = %key,
            mutant = %mutant.path.display(),
            error = %err,
            "mutant processing failed"
        );
        summary.errors += 1;
        ledger.record_trial(
            key,
            &mutant.path,
            TrialOutcome::Error {
                message: err.to_string(),
            },
            None,
        )?;
        Ok(TrialDecision::Continue)
    }

    #[cfg(feature = "serialization")]
    fn archive(&self, key: &TrialKey, mutant: &MutantFile, trace: &Trace) {
        let dir = self
            .config
            .trace_root()
            .join(path_segment(&key.test_case.to_string()))
            .join(mutant.id());
        if let Err(err) = super::runner::archive_killing_run(&dir, mutant, trace) {
            warn!(trial = %key, error = %err, "failed to archive killing trace");
        }
    }

    #[cfg(not(feature = "serialization"))]
    fn archive(&self, _key: &TrialKey, _mutant: &MutantFile, _trace: &Trace) {}
}

/// File-name-safe rendering of an identifier.
pub fn path_segment(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::{Path, PathBuf};

    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::pipeline::collaborators::{
        ExecutionReport, PackageEntry, SimilarDiffProvider, SourceUnit, TestPackage, TestUnit,
    };
    use crate::trace::TraceStep;

    const CALC: &str = "package a;\nclass Calc {\n  int f(int x) {\n    if (x > 0) {\n      x = x + 1;\n    }\n    return x;\n  }\n}\n";

    struct Project {
        _tmp: TempDir,
        root: PathBuf,
        out: PathBuf,
        suite: TestPackage,
    }

    impl Project {
        fn new(methods: &[&str]) -> Self {
            let tmp = tempdir().expect("tempdir should be created");
            let root = tmp.path().to_path_buf();
            std::fs::create_dir_all(root.join("src/a")).expect("src dir should be created");
            std::fs::write(root.join("src/a/Calc.java"), CALC).expect("source should write");
            let out = root.join("out");
            std::fs::create_dir_all(out.join("a")).expect("out dir should be created");
            std::fs::write(out.join("a/Calc.class"), b"original").expect("class should write");
            let suite = TestPackage {
                name: String::new(),
                entries: vec![PackageEntry::Package(TestPackage {
                    name: "a".to_string(),
                    entries: vec![PackageEntry::Unit(TestUnit {
                        class: "a.CalcTest".to_string(),
                        methods: methods.iter().map(|m| m.to_string()).collect(),
                    })],
                })],
            };
            Self {
                _tmp: tmp,
                root,
                out,
                suite,
            }
        }

        fn config(&self) -> PipelineConfig {
            PipelineConfig::for_project(&self.root)
        }
    }

    impl ProjectNavigator for Project {
        fn test_suite(&self) -> Result<TestPackage, CollaboratorError> {
            Ok(self.suite.clone())
        }

        fn resolve_source(&self, class: &str) -> Option<SourceUnit> {
            (crate::trace::outer_class_name(class) == "a.Calc").then(|| SourceUnit {
                class: "a.Calc".to_string(),
                source_file: self.root.join("src/a/Calc.java"),
                source_folder: self.root.join("src"),
            })
        }

        fn output_dir(&self, _class: &str) -> Result<PathBuf, CollaboratorError> {
            Ok(self.out.clone())
        }
    }

    struct NoScan;

    impl ClassScanner for NoScan {
        fn related_lines(
            &self,
            _unit: &SourceUnit,
            _class: &str,
            _lines: &BTreeSet<u32>,
        ) -> Result<Vec<ClassLocation>, CollaboratorError> {
            Ok(Vec::new())
        }
    }

    /// Copies the mutant source into the class file so the executor can see what runs.
    #[derive(Default)]
    struct CopyCompiler {
        calls: Cell<usize>,
        reject: bool,
    }

    impl Compiler for CopyCompiler {
        fn compile(&self, output_dir: &Path, source: &Path) -> Result<(), CollaboratorError> {
            self.calls.set(self.calls.get() + 1);
            if self.reject {
                std::fs::write(output_dir.join("a/Calc$1.class"), b"partial")?;
                return Err(CollaboratorError::Compile("incompatible types".to_string()));
            }
            std::fs::copy(source, output_dir.join("a/Calc.class"))?;
            Ok(())
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mode {
        /// Baseline passes; every mutant is killed with an informative trace.
        Kill,
        /// Baseline passes; every mutant survives.
        Survive,
        /// Baseline fails.
        BrokenBaseline,
        /// Mutants are killed with one-step traces.
        Degenerate,
        /// Mutants are killed with a loop around the mutated line.
        KillInLoop,
        /// Baseline passes but runs past the step cap.
        OverLongBaseline,
        /// Mutants run past the wall-clock budget.
        Timeout,
        /// Mutants are killed past the step cap.
        OverLong,
    }

    struct FakeExecutor {
        out: PathBuf,
        mode: Mode,
        baselines: Cell<usize>,
        seen: RefCell<Vec<Vec<u8>>>,
    }

    impl FakeExecutor {
        fn new(project: &Project, mode: Mode) -> Self {
            Self {
                out: project.out.clone(),
                mode,
                baselines: Cell::new(0),
                seen: RefCell::new(Vec::new()),
            }
        }
    }

    fn steps(lines: &[u32]) -> Trace {
        Trace::bounded(
            lines
                .iter()
                .map(|&l| TraceStep::at(ClassLocation::line_of("a.Calc", l)))
                .collect(),
            100,
        )
        .expect("fixture trace should build")
    }

    impl Executor for FakeExecutor {
        fn execute(
            &self,
            request: &ExecutionRequest,
        ) -> Result<ExecutionReport, CollaboratorError> {
            let report = |passed: bool, trace: Trace| ExecutionReport {
                passed,
                step_count: trace.len(),
                over_long: false,
                timed_out: false,
                visited: Vec::new(),
                trace: Some(trace),
            };
            if request.capture == TraceCapture::Always {
                self.baselines.set(self.baselines.get() + 1);
                let correct = steps(&[3, 4, 5, 7]);
                if self.mode == Mode::OverLongBaseline {
                    return Ok(ExecutionReport {
                        step_count: request.step_limit + 1,
                        over_long: true,
                        trace: None,
                        ..report(true, correct)
                    });
                }
                return Ok(report(self.mode != Mode::BrokenBaseline, correct));
            }

            self.seen
                .borrow_mut()
                .push(std::fs::read(self.out.join("a/Calc.class"))?);
            Ok(match self.mode {
                Mode::Survive => ExecutionReport {
                    trace: None,
                    ..report(true, steps(&[3, 4, 5, 7]))
                },
                Mode::Degenerate => report(false, steps(&[3])),
                Mode::KillInLoop => report(false, steps(&[3, 4, 5, 4, 7])),
                Mode::Timeout => ExecutionReport {
                    timed_out: true,
                    trace: None,
                    ..report(false, steps(&[3]))
                },
                Mode::OverLong => ExecutionReport {
                    step_count: request.step_limit + 1,
                    over_long: true,
                    trace: None,
                    ..report(false, steps(&[3]))
                },
                Mode::Kill | Mode::BrokenBaseline | Mode::OverLongBaseline => {
                    report(false, steps(&[3, 4, 7]))
                }
            })
        }
    }

    struct Harness {
        project: Project,
        compiler: CopyCompiler,
        executor: FakeExecutor,
    }

    impl Harness {
        fn new(mode: Mode, methods: &[&str]) -> Self {
            let project = Project::new(methods);
            let executor = FakeExecutor::new(&project, mode);
            Self {
                project,
                compiler: CopyCompiler::default(),
                executor,
            }
        }

        fn run(&self, config: PipelineConfig, ledger: &mut Ledger) -> RunSummary {
            let collaborators = Collaborators {
                navigator: &self.project,
                scanner: &NoScan,
                compiler: &self.compiler,
                executor: &self.executor,
                diff: &SimilarDiffProvider,
            };
            Orchestrator::new(config, collaborators)
                .run(ledger)
                .expect("run should succeed")
        }

        fn ledger(&self) -> Ledger {
            Ledger::open(self.project.config().ledger_path()).expect("ledger should open")
        }
    }

    #[test]
    fn decisions_follow_cap_and_loop_effectiveness() {
        let open = PipelineConfig::for_project("/p");
        let capped = PipelineConfig::for_project("/p").with_trial_cap(2);
        assert_eq!(decide(None, 5, &capped), TrialDecision::Continue);
        assert_eq!(decide(Some(true), 1, &capped), TrialDecision::Continue);
        assert_eq!(decide(Some(true), 2, &capped), TrialDecision::StopTestCase);
        assert_eq!(decide(Some(false), 1, &capped), TrialDecision::StopCandidate);
        assert_eq!(decide(Some(true), 99, &open), TrialDecision::Continue);
    }

    #[test]
    fn killing_mutants_become_trials_and_artifacts_are_restored() {
        let h = Harness::new(Mode::Kill, &["adds"]);
        let mut ledger = h.ledger();
        let summary = h.run(h.project.config(), &mut ledger);

        assert_eq!(summary.test_cases, 1);
        assert!(summary.mutants_generated > 0);
        assert!(summary.empirical_trials > 0);
        assert!(!summary.interrupted);
        assert_eq!(
            std::fs::read(h.project.out.join("a/Calc.class")).expect("class should exist"),
            b"original"
        );
        assert!(h.executor.seen.borrow().iter().all(|bytes| bytes != b"original"));
        assert!(ledger.snapshot().completed);
        assert_eq!(ledger.snapshot().empirical.len(), summary.empirical_trials);
    }

    #[test]
    fn non_loop_effective_trial_stops_the_current_line() {
        let h = Harness::new(Mode::Kill, &["adds"]);
        let mut ledger = h.ledger();
        let summary = h.run(h.project.config(), &mut ledger);

        let mut per_line: BTreeMap<u32, usize> = BTreeMap::new();
        for trial in &ledger.snapshot().empirical {
            assert!(!trial.loop_effective);
            *per_line.entry(trial.key.line).or_default() += 1;
        }
        assert_eq!(per_line.get(&4), Some(&1));
        // line 4 has three mutants; the first trial ends the line
        let attempted_on_4 = ledger.snapshot().trials.keys().filter(|k| k.line == 4).count();
        assert_eq!(attempted_on_4, 1);
        assert!(summary.mutants_generated > summary.trials_attempted);
    }

    #[test]
    fn rerun_with_the_same_ledger_skips_every_recorded_trial() {
        let h = Harness::new(Mode::Kill, &["adds"]);
        let mut ledger = h.ledger();
        let first = h.run(h.project.config(), &mut ledger);
        let compiles = h.compiler.calls.get();
        assert!(compiles > 0);

        let mut reopened = h.ledger();
        let second = h.run(h.project.config(), &mut reopened);
        assert_eq!(second.empirical_trials, 0);
        assert_eq!(second.trials_attempted, 0);
        assert_eq!(second.trials_skipped, first.trials_attempted);
        assert_eq!(h.compiler.calls.get(), compiles);
        assert_eq!(reopened.snapshot().empirical.len(), first.empirical_trials);
    }

    #[test]
    fn failing_baseline_is_ignored_without_mutants() {
        let h = Harness::new(Mode::BrokenBaseline, &["adds"]);
        let mut ledger = h.ledger();
        let summary = h.run(h.project.config(), &mut ledger);

        let tc = TestCaseId::new("a.CalcTest", "adds");
        assert!(ledger.is_ignored(&tc));
        assert_eq!(summary.newly_ignored, 1);
        assert_eq!(summary.mutants_generated, 0);
        assert_eq!(h.compiler.calls.get(), 0);
        assert!(ledger.snapshot().trials.is_empty());

        let again = h.run(h.project.config(), &mut h.ledger());
        assert_eq!(again.previously_ignored, 1);
        assert_eq!(h.executor.baselines.get(), 1);
    }

    #[test]
    fn over_long_baseline_is_ignored_without_mutants() {
        let h = Harness::new(Mode::OverLongBaseline, &["adds"]);
        let mut ledger = h.ledger();
        let summary = h.run(h.project.config(), &mut ledger);

        let tc = TestCaseId::new("a.CalcTest", "adds");
        assert_eq!(
            ledger.snapshot().ignored.get(&tc),
            Some(&IgnoreReason::OverLongBaseline)
        );
        assert_eq!(summary.newly_ignored, 1);
        assert_eq!(summary.mutants_generated, 0);
        assert_eq!(h.compiler.calls.get(), 0);
        assert!(h.executor.seen.borrow().is_empty());
    }

    fn assert_recorded_then_skipped(h: &Harness, expected: &TrialOutcome) {
        let mut ledger = h.ledger();
        let first = h.run(h.project.config(), &mut ledger);
        assert!(first.trials_attempted > 0);
        assert_eq!(first.trials_attempted, first.mutants_generated);
        assert_eq!(first.empirical_trials, 0);
        assert_eq!(ledger.snapshot().trials.len(), first.trials_attempted);
        assert!(ledger.snapshot().trials.values().all(|r| &r.outcome == expected));
        assert_eq!(
            std::fs::read(h.project.out.join("a/Calc.class")).expect("class should exist"),
            b"original"
        );
        assert!(!h.project.out.join("a/Calc$1.class").exists());

        let compiles = h.compiler.calls.get();
        let executions = h.executor.seen.borrow().len();
        let second = h.run(h.project.config(), &mut h.ledger());
        assert_eq!(second.trials_attempted, 0);
        assert_eq!(second.trials_skipped, first.trials_attempted);
        assert_eq!(h.compiler.calls.get(), compiles);
        assert_eq!(h.executor.seen.borrow().len(), executions);
    }

    #[test]
    fn timed_out_mutants_are_recorded_and_skipped_on_rerun() {
        let h = Harness::new(Mode::Timeout, &["adds"]);
        assert_recorded_then_skipped(&h, &TrialOutcome::Timeout);
    }

    #[test]
    fn over_long_mutants_are_recorded_and_skipped_on_rerun() {
        let h = Harness::new(Mode::OverLong, &["adds"]);
        assert_recorded_then_skipped(&h, &TrialOutcome::OverLong);
    }

    #[test]
    fn uncompilable_mutants_are_recorded_and_skipped_on_rerun() {
        let mut h = Harness::new(Mode::Kill, &["adds"]);
        h.compiler.reject = true;
        assert_recorded_then_skipped(&h, &TrialOutcome::CompileError);
        assert!(h.executor.seen.borrow().is_empty());
    }

    #[test]
    fn test_case_already_at_the_cap_does_no_work() {
        let h = Harness::new(Mode::KillInLoop, &["adds"]);
        let config = h.project.config().with_trial_cap(1);
        let first = h.run(config.clone(), &mut h.ledger());
        assert_eq!(first.empirical_trials, 1);
        let baselines = h.executor.baselines.get();

        let second = h.run(config, &mut h.ledger());
        assert_eq!(second.mutants_generated, 0);
        assert_eq!(second.trials_skipped, 0);
        assert_eq!(h.executor.baselines.get(), baselines);
    }

    #[test]
    fn surviving_mutants_record_no_trial() {
        let h = Harness::new(Mode::Survive, &["adds"]);
        let mut ledger = h.ledger();
        let summary = h.run(h.project.config(), &mut ledger);

        assert!(summary.trials_attempted > 0);
        assert_eq!(summary.empirical_trials, 0);
        assert!(ledger
            .snapshot()
            .trials
            .values()
            .all(|r| r.outcome == TrialOutcome::Survived));
        assert_eq!(
            std::fs::read(h.project.out.join("a/Calc.class")).expect("class should exist"),
            b"original"
        );
    }

    #[test]
    fn one_step_traces_yield_no_trial() {
        let h = Harness::new(Mode::Degenerate, &["adds"]);
        let mut ledger = h.ledger();
        let summary = h.run(h.project.config(), &mut ledger);
        assert!(summary.trials_attempted > 0);
        assert_eq!(summary.empirical_trials, 0);
        assert!(ledger
            .snapshot()
            .trials
            .values()
            .all(|r| r.outcome == TrialOutcome::NoTrial));
    }

    #[test]
    fn trial_cap_bounds_valid_trials_per_test_case() {
        let h = Harness::new(Mode::KillInLoop, &["adds", "subtracts"]);
        let mut ledger = h.ledger();
        let summary = h.run(h.project.config().with_trial_cap(1), &mut ledger);

        assert_eq!(summary.empirical_trials, 2);
        for method in ["adds", "subtracts"] {
            assert_eq!(ledger.valid_trials(&TestCaseId::new("a.CalcTest", method)), 1);
        }
    }

    #[test]
    fn cancellation_before_the_first_test_case_interrupts_the_run() {
        let h = Harness::new(Mode::Kill, &["adds"]);
        let mut ledger = h.ledger();
        let cancel = CancellationFlag::new();
        cancel.cancel();
        let collaborators = Collaborators {
            navigator: &h.project,
            scanner: &NoScan,
            compiler: &h.compiler,
            executor: &h.executor,
            diff: &SimilarDiffProvider,
        };
        let summary = Orchestrator::new(h.project.config(), collaborators)
            .with_cancellation(cancel)
            .run(&mut ledger)
            .expect("run should succeed");

        assert!(summary.interrupted);
        assert_eq!(summary.test_cases, 0);
        assert!(ledger.snapshot().interrupted);
        assert_eq!(h.executor.baselines.get(), 0);
    }

    #[test]
    fn path_segments_are_file_name_safe() {
        assert_eq!(path_segment("a.CalcTest#adds"), "a.CalcTest_adds");
        assert_eq!(path_segment("a b/c"), "a_b_c");
    }
}
