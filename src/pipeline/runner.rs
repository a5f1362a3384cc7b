//! Single-mutant execution: compile, swap in, run the test, classify, restore.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::collaborators::{
    CollaboratorError, Compiler, ExecutionRequest, Executor, ProjectNavigator, TestCaseId,
    TraceCapture,
};
use super::mutator::MutantFile;
use crate::trace::{Trace, outer_class_name};

/// Mutant runner errors. Expected outcomes (compile errors, timeouts...) are not errors.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Collaborator failure other than a compile error or timeout.
    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),
    /// Backing up or restoring compiled artifacts failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The executor reported a kill within limits but produced no trace.
    #[error("killed run for {0} produced no trace")]
    MissingTrace(String),
}

/// Terminal state of one mutant run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutantRunOutcome {
    /// Compilation failed; nothing was executed.
    CompileError(String),
    /// The test exceeded its wall-clock budget.
    TimedOut,
    /// The test still passes.
    Survived,
    /// The test failed but ran past the step cap; no trace was kept.
    OverLong {
        /// Steps reported by the executor.
        steps: usize,
    },
    /// The test failed within limits and its trace was captured.
    Killed(Trace),
}

impl MutantRunOutcome {
    /// Signal name reported to callers and persisted in the ledger.
    pub fn signal(&self) -> &'static str {
        match self {
            Self::CompileError(_) => "compile-error",
            Self::TimedOut => "timeout",
            Self::Survived => "survived",
            Self::OverLong { .. } => "over-long",
            Self::Killed(_) => "killed-with-trace",
        }
    }
}

/// Outcome plus timing.
#[derive(Debug, Clone)]
pub struct MutantRun {
    /// Terminal state.
    pub outcome: MutantRunOutcome,
    /// Compile + execute wall time.
    pub duration: Duration,
}

/// Exclusive ownership of per-class artifact slots.
///
/// A mutant of a class may only compile, execute and restore while it holds that class' slot.
#[derive(Debug, Default)]
pub struct SlotRegistry {
    busy: Mutex<BTreeSet<String>>,
    freed: Condvar,
}

impl SlotRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the slot of `class` (by outer class) is free, then take it.
    pub fn acquire(&self, class: &str) -> SlotGuard<'_> {
        let key = outer_class_name(class).to_string();
        let mut busy = lock(&self.busy);
        while busy.contains(&key) {
            busy = self
                .freed
                .wait(busy)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        busy.insert(key.clone());
        SlotGuard {
            registry: self,
            key,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Held slot; released on drop.
#[derive(Debug)]
pub struct SlotGuard<'a> {
    registry: &'a SlotRegistry,
    key: String,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        lock(&self.registry.busy).remove(&self.key);
        self.registry.freed.notify_all();
    }
}

/// Snapshot of a class' compiled artifacts (`Outer.class` and `Outer$*.class`).
///
/// Restores on drop if [`ArtifactBackup::restore`] was not called.
#[derive(Debug)]
pub struct ArtifactBackup {
    dir: PathBuf,
    stem: String,
    files: Vec<(PathBuf, Vec<u8>)>,
    restored: bool,
}

impl ArtifactBackup {
    /// Back up every artifact of `class` under `output_dir`.
    pub fn capture(output_dir: &Path, class: &str) -> std::io::Result<Self> {
        let outer = outer_class_name(class);
        let mut dir = output_dir.to_path_buf();
        let mut parts: Vec<&str> = outer.split('.').collect();
        let stem = parts.pop().unwrap_or(outer).to_string();
        for part in parts {
            dir.push(part);
        }

        let mut backup = Self {
            dir,
            stem,
            files: Vec::new(),
            restored: false,
        };
        for path in backup.artifacts()? {
            let bytes = std::fs::read(&path)?;
            backup.files.push((path, bytes));
        }
        Ok(backup)
    }

    fn is_artifact(&self, name: &str) -> bool {
        let Some(base) = name.strip_suffix(".class") else {
            return false;
        };
        base == self.stem
            || base
                .strip_prefix(self.stem.as_str())
                .is_some_and(|rest| rest.starts_with('$'))
    }

    fn artifacts(&self) -> std::io::Result<Vec<PathBuf>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if self.is_artifact(&name) {
                out.push(entry.path());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Number of backed-up files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True when the class had no artifacts.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Put every artifact back byte-for-byte and delete artifacts the mutant introduced.
    pub fn restore(&mut self) -> std::io::Result<()> {
        let known: BTreeSet<&PathBuf> = self.files.iter().map(|(p, _)| p).collect();
        for path in self.artifacts()? {
            if !known.contains(&path) {
                std::fs::remove_file(&path)?;
            }
        }
        for (path, bytes) in &self.files {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, bytes)?;
        }
        self.restored = true;
        Ok(())
    }
}

impl Drop for ArtifactBackup {
    fn drop(&mut self) {
        if !self.restored {
            if let Err(err) = self.restore() {
                warn!(
                    dir = %self.dir.display(),
                    error = %err,
                    "failed to restore compiled artifacts"
                );
            }
        }
    }
}

/// Runs mutants against the target test.
pub struct MutantRunner<'a> {
    navigator: &'a dyn ProjectNavigator,
    compiler: &'a dyn Compiler,
    executor: &'a dyn Executor,
    slots: &'a SlotRegistry,
    step_limit: usize,
    timeout: Duration,
}

impl<'a> MutantRunner<'a> {
    /// Runner with the given budgets.
    pub fn new(
        navigator: &'a dyn ProjectNavigator,
        compiler: &'a dyn Compiler,
        executor: &'a dyn Executor,
        slots: &'a SlotRegistry,
        step_limit: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            navigator,
            compiler,
            executor,
            slots,
            step_limit,
            timeout,
        }
    }

    /// Compile `mutant`, run `test_case` against it and restore the original artifacts.
    pub fn run(
        &self,
        test_case: &TestCaseId,
        mutant: &MutantFile,
    ) -> Result<MutantRun, RunnerError> {
        let _slot = self.slots.acquire(&mutant.class);
        let output_dir = self.navigator.output_dir(&mutant.class)?;
        let mut backup = ArtifactBackup::capture(&output_dir, &mutant.class)?;
        debug!(class = %mutant.class, artifacts = backup.len(), "backed up compiled artifacts");

        let started = Instant::now();
        let outcome = self.compile_and_execute(test_case, mutant, &output_dir, started);
        backup.restore()?;

        let outcome = outcome?;
        info!(
            test_case = %test_case,
            mutant = %mutant.path.display(),
            outcome = outcome.signal(),
            "mutant run finished"
        );
        Ok(MutantRun {
            outcome,
            duration: started.elapsed(),
        })
    }

    fn compile_and_execute(
        &self,
        test_case: &TestCaseId,
        mutant: &MutantFile,
        output_dir: &Path,
        started: Instant,
    ) -> Result<MutantRunOutcome, RunnerError> {
        match self.compiler.compile(output_dir, &mutant.path) {
            Ok(()) => {}
            Err(CollaboratorError::Compile(message)) => {
                return Ok(MutantRunOutcome::CompileError(message));
            }
            Err(err) => return Err(err.into()),
        }

        let request = ExecutionRequest {
            test_case: test_case.clone(),
            step_limit: self.step_limit,
            timeout: self.timeout,
            capture: TraceCapture::OnFailure,
        };
        let report = match self.executor.execute(&request) {
            Ok(report) => report,
            Err(CollaboratorError::Timeout { .. }) => return Ok(MutantRunOutcome::TimedOut),
            Err(err) => return Err(err.into()),
        };

        if report.timed_out {
            return Ok(MutantRunOutcome::TimedOut);
        }
        if report.passed {
            return Ok(MutantRunOutcome::Survived);
        }
        if report.over_long || report.step_count > self.step_limit {
            return Ok(MutantRunOutcome::OverLong {
                steps: report.step_count,
            });
        }
        match report.trace {
            Some(trace) if trace.len() > self.step_limit => Ok(MutantRunOutcome::OverLong {
                steps: trace.len(),
            }),
            Some(trace) => Ok(MutantRunOutcome::Killed(
                trace.with_construct_time(started.elapsed()),
            )),
            None => Err(RunnerError::MissingTrace(mutant.path.display().to_string())),
        }
    }
}

/// Keep the mutant source and its killing trace next to each other for later inspection.
#[cfg(feature = "serialization")]
pub fn archive_killing_run(
    trace_dir: &Path,
    mutant: &MutantFile,
    trace: &Trace,
) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(trace_dir)?;
    if let Some(name) = mutant.path.file_name() {
        std::fs::copy(&mutant.path, trace_dir.join(name))?;
    }
    let bytes = trace
        .to_bincode()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let path = trace_dir.join("trace.bin");
    std::fs::write(&path, bytes)?;
    Ok(path)
}
