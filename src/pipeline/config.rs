//! Pipeline configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::trace::DEFAULT_STEP_LIMIT;

/// How two trace steps are judged equivalent during alignment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentPolicy {
    /// Same class location.
    #[default]
    Location,
    /// Same class location and identical recorded state.
    LocationAndState,
}

/// Configuration for a localization run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Project directory the collaborators operate on.
    pub project_dir: PathBuf,
    /// Root directory where the ledger and archived traces are persisted.
    pub run_root: PathBuf,
    /// Directory receiving generated mutant sources.
    pub scratch_dir: PathBuf,
    /// Namespace for archived traces.
    pub project_name: String,
    /// Maximum number of steps a trace may hold.
    pub step_limit: usize,
    /// Wall-clock budget per test execution, in seconds.
    pub timeout_secs: u64,
    /// Mutant budget per strategy for one test case.
    pub mutants_per_test_case: usize,
    /// Whether `trials_per_test_case` is enforced.
    pub limit_trials: bool,
    /// Maximum valid trials per test case when limiting is enabled.
    pub trials_per_test_case: usize,
    /// Step equivalence used by the aligner.
    #[serde(default)]
    pub alignment: AlignmentPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let project_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::for_project(project_dir)
    }
}

impl PipelineConfig {
    /// Default layout rooted at `project_dir`.
    pub fn for_project(project_dir: impl Into<PathBuf>) -> Self {
        let project_dir = project_dir.into();
        let run_root = project_dir.join(".mutrace").join("runs");
        let scratch_dir = run_root.join("mutants");
        let project_name = project_name_of(&project_dir);
        Self {
            project_dir,
            run_root,
            scratch_dir,
            project_name,
            step_limit: DEFAULT_STEP_LIMIT,
            timeout_secs: 30,
            mutants_per_test_case: 10,
            limit_trials: false,
            trials_per_test_case: 3,
            alignment: AlignmentPolicy::Location,
        }
    }

    /// Set project directory.
    pub fn with_project_dir(mut self, project_dir: impl Into<PathBuf>) -> Self {
        self.project_dir = project_dir.into();
        self.project_name = project_name_of(&self.project_dir);
        self
    }

    /// Set run-state root. The scratch directory follows unless set afterwards.
    pub fn with_run_root(mut self, run_root: impl Into<PathBuf>) -> Self {
        self.run_root = run_root.into();
        self.scratch_dir = self.run_root.join("mutants");
        self
    }

    /// Set mutant scratch directory.
    pub fn with_scratch_dir(mut self, scratch_dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = scratch_dir.into();
        self
    }

    /// Set trace step cap.
    pub fn with_step_limit(mut self, step_limit: usize) -> Self {
        self.step_limit = step_limit;
        self
    }

    /// Set timeout in seconds.
    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Set mutant budget per strategy.
    pub fn with_mutants_per_test_case(mut self, budget: usize) -> Self {
        self.mutants_per_test_case = budget;
        self
    }

    /// Enable the per-test-case trial cap.
    pub fn with_trial_cap(mut self, trials_per_test_case: usize) -> Self {
        self.limit_trials = true;
        self.trials_per_test_case = trials_per_test_case;
        self
    }

    /// Set alignment policy.
    pub fn with_alignment(mut self, alignment: AlignmentPolicy) -> Self {
        self.alignment = alignment;
        self
    }

    /// Timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Path of the trial ledger.
    pub fn ledger_path(&self) -> PathBuf {
        self.run_root.join("ledger.jsonl")
    }

    /// Root of archived traces for this project.
    pub fn trace_root(&self) -> PathBuf {
        self.run_root.join("traces").join(&self.project_name)
    }

    /// Read a configuration saved with [`PipelineConfig::save`].
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Persist as pretty JSON.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }
}

fn project_name_of(project_dir: &Path) -> String {
    project_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn default_paths_and_builder_overrides_work() {
        let default = PipelineConfig::for_project("/tmp/project-a");
        assert!(default.run_root.ends_with(".mutrace/runs"));
        assert!(default.scratch_dir.ends_with(".mutrace/runs/mutants"));
        assert_eq!(default.project_name, "project-a");
        assert_eq!(default.step_limit, 10_000);
        assert_eq!(default.timeout(), Duration::from_secs(30));
        assert_eq!(default.mutants_per_test_case, 10);
        assert!(!default.limit_trials);

        let cfg = PipelineConfig::default()
            .with_project_dir("/tmp/project-b")
            .with_run_root("/tmp/runs-b")
            .with_step_limit(500)
            .with_timeout_secs(5)
            .with_mutants_per_test_case(4)
            .with_trial_cap(2)
            .with_alignment(AlignmentPolicy::LocationAndState);

        assert_eq!(cfg.project_name, "project-b");
        assert_eq!(cfg.scratch_dir, PathBuf::from("/tmp/runs-b/mutants"));
        assert_eq!(cfg.ledger_path(), PathBuf::from("/tmp/runs-b/ledger.jsonl"));
        assert_eq!(cfg.trace_root(), PathBuf::from("/tmp/runs-b/traces/project-b"));
        assert_eq!(cfg.step_limit, 500);
        assert_eq!(cfg.timeout_secs, 5);
        assert_eq!(cfg.mutants_per_test_case, 4);
        assert!(cfg.limit_trials);
        assert_eq!(cfg.trials_per_test_case, 2);
        assert_eq!(cfg.alignment, AlignmentPolicy::LocationAndState);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let tmp = tempdir().expect("tempdir should be created");
        let path = tmp.path().join("mutrace.json");
        let cfg = PipelineConfig::for_project(tmp.path()).with_trial_cap(7);
        cfg.save(&path).expect("config should save");
        let loaded = PipelineConfig::load(&path).expect("config should load");
        assert_eq!(loaded, cfg);
    }
}
