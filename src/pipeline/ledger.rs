//! Trial ledger: JSONL event log replayed into a snapshot.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use super::collaborators::TestCaseId;
use super::events::{IgnoreReason, LedgerEvent, TrialKey, TrialOutcome, now_timestamp_ms};
use super::simulate::EmpiricalTrial;

static RUN_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Ledger errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Event could not be encoded.
    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Recorded attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialRecord {
    /// Mutant source path.
    pub mutant_path: String,
    /// Terminal outcome.
    pub outcome: TrialOutcome,
    /// Compile + execute time.
    pub duration_ms: Option<u64>,
    /// Run that recorded it.
    pub run_id: String,
}

/// Replayed ledger state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    /// Run ids in start order.
    pub runs: Vec<String>,
    /// Attempted trials.
    pub trials: BTreeMap<TrialKey, TrialRecord>,
    /// Ignored test cases.
    pub ignored: BTreeMap<TestCaseId, IgnoreReason>,
    /// Localized trials in discovery order.
    pub empirical: Vec<EmpiricalTrial>,
    /// Number of malformed event lines skipped.
    pub malformed_lines: usize,
    /// Whether the latest run was interrupted.
    pub interrupted: bool,
    /// Whether the latest run completed.
    pub completed: bool,
}

impl LedgerSnapshot {
    /// Fold one event into the snapshot.
    pub fn apply(&mut self, event: LedgerEvent) {
        match event {
            LedgerEvent::RunStarted { run_id, .. } => {
                self.runs.push(run_id);
                self.interrupted = false;
                self.completed = false;
            }
            LedgerEvent::TestCaseIgnored {
                test_case, reason, ..
            } => {
                self.ignored.entry(test_case).or_insert(reason);
            }
            LedgerEvent::TrialFinished {
                run_id,
                key,
                mutant_path,
                outcome,
                duration_ms,
                ..
            } => {
                self.trials.entry(key).or_insert(TrialRecord {
                    mutant_path,
                    outcome,
                    duration_ms,
                    run_id,
                });
            }
            LedgerEvent::EmpiricalTrialFound { trial, .. } => {
                if !self.empirical.iter().any(|t| t.key == trial.key) {
                    self.empirical.push(trial);
                }
            }
            LedgerEvent::RunInterrupted { .. } => self.interrupted = true,
            LedgerEvent::RunCompleted { .. } => self.completed = true,
        }
    }

    /// Localized trial recorded for `key`.
    pub fn empirical_for(&self, key: &TrialKey) -> Option<&EmpiricalTrial> {
        self.empirical.iter().find(|t| &t.key == key)
    }

    /// Localized trials attributed to `test_case`.
    pub fn valid_trials(&self, test_case: &TestCaseId) -> usize {
        self.empirical
            .iter()
            .filter(|t| &t.key.test_case == test_case)
            .count()
    }
}

/// Replay `ledger.jsonl` into a snapshot.
pub fn replay_events(path: &Path) -> Result<LedgerSnapshot, LedgerError> {
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut snapshot = LedgerSnapshot::default();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LedgerEvent>(&line) {
            Ok(event) => snapshot.apply(event),
            Err(_) => snapshot.malformed_lines += 1,
        }
    }
    Ok(snapshot)
}

/// Append one event as a JSONL line.
pub fn append_event(path: &Path, event: &LedgerEvent) -> Result<(), LedgerError> {
    let json = serde_json::to_string(event)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(json.as_bytes())?;
    file.write_all(b"\n")?;
    file.flush()?;
    Ok(())
}

fn generate_run_id() -> String {
    let seq = RUN_SEQUENCE.fetch_add(1, Ordering::SeqCst);
    format!("run-{}-{}-{}", now_timestamp_ms(), std::process::id(), seq)
}

/// Persistent record of attempted trials and ignored test cases.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    run_id: String,
    snapshot: LedgerSnapshot,
}

impl Ledger {
    /// Open (or create) the ledger at `path` and replay its history.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let snapshot = if path.exists() {
            replay_events(&path)?
        } else {
            LedgerSnapshot::default()
        };
        if snapshot.malformed_lines > 0 {
            warn!(
                path = %path.display(),
                malformed = snapshot.malformed_lines,
                "skipped malformed ledger lines"
            );
        }
        debug!(
            trials = snapshot.trials.len(),
            ignored = snapshot.ignored.len(),
            "ledger replayed"
        );
        Ok(Self {
            path,
            run_id: String::new(),
            snapshot,
        })
    }

    /// Ledger file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current run id (empty before [`Ledger::begin_run`]).
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Replayed state including this run's events.
    pub fn snapshot(&self) -> &LedgerSnapshot {
        &self.snapshot
    }

    /// Whether the trial was already attempted.
    pub fn contains(&self, key: &TrialKey) -> bool {
        self.snapshot.trials.contains_key(key)
    }

    /// Whether the test case is ignored.
    pub fn is_ignored(&self, test_case: &TestCaseId) -> bool {
        self.snapshot.ignored.contains_key(test_case)
    }

    /// Localized trials recorded for `test_case` across runs.
    pub fn valid_trials(&self, test_case: &TestCaseId) -> usize {
        self.snapshot.valid_trials(test_case)
    }

    fn append(&mut self, event: LedgerEvent) -> Result<(), LedgerError> {
        append_event(&self.path, &event)?;
        self.snapshot.apply(event);
        Ok(())
    }

    /// Start a new run.
    pub fn begin_run(&mut self, project: &str) -> Result<String, LedgerError> {
        self.run_id = generate_run_id();
        self.append(LedgerEvent::RunStarted {
            run_id: self.run_id.clone(),
            timestamp_ms: now_timestamp_ms(),
            project: project.to_string(),
        })?;
        Ok(self.run_id.clone())
    }

    /// Mark `test_case` ignored.
    pub fn record_ignored(
        &mut self,
        test_case: &TestCaseId,
        reason: IgnoreReason,
        detail: Option<String>,
    ) -> Result<(), LedgerError> {
        self.append(LedgerEvent::TestCaseIgnored {
            run_id: self.run_id.clone(),
            timestamp_ms: now_timestamp_ms(),
            test_case: test_case.clone(),
            reason,
            detail,
        })
    }

    /// Record an attempted trial.
    pub fn record_trial(
        &mut self,
        key: &TrialKey,
        mutant_path: &Path,
        outcome: TrialOutcome,
        duration: Option<Duration>,
    ) -> Result<(), LedgerError> {
        self.append(LedgerEvent::TrialFinished {
            run_id: self.run_id.clone(),
            timestamp_ms: now_timestamp_ms(),
            key: key.clone(),
            mutant_path: mutant_path.display().to_string(),
            outcome,
            duration_ms: duration.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        })
    }

    /// Record a localized trial.
    pub fn record_empirical(&mut self, trial: EmpiricalTrial) -> Result<(), LedgerError> {
        self.append(LedgerEvent::EmpiricalTrialFound {
            run_id: self.run_id.clone(),
            timestamp_ms: now_timestamp_ms(),
            trial,
        })
    }

    /// Record an interruption.
    pub fn record_interrupted(&mut self, reason: &str) -> Result<(), LedgerError> {
        self.append(LedgerEvent::RunInterrupted {
            run_id: self.run_id.clone(),
            timestamp_ms: now_timestamp_ms(),
            reason: reason.to_string(),
        })
    }

    /// Record completion.
    pub fn record_completed(&mut self) -> Result<(), LedgerError> {
        self.append(LedgerEvent::RunCompleted {
            run_id: self.run_id.clone(),
            timestamp_ms: now_timestamp_ms(),
        })
    }
}
