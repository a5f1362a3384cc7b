//! Collaborator contracts consumed by the pipeline, and process/filesystem adapters.
//!
//! The pipeline never parses sources, compiles or launches programs itself. It talks to
//! a [`ProjectNavigator`], a [`ClassScanner`], a [`Compiler`], an [`Executor`] and a
//! [`DiffProvider`]. The adapters below implement those contracts for a conventional
//! source-tree layout driven by external commands.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::trace::{ClassLocation, Trace, TraceStep, outer_class_name};

/// Collaborator failures.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// The compiler rejected the source.
    #[error("compilation failed: {0}")]
    Compile(String),
    /// The executed program did not finish in time.
    #[error("execution timed out after {after:?}")]
    Timeout {
        /// Elapsed wall-clock time when the program was killed.
        after: Duration,
    },
    /// An external command could not be run or exited abnormally.
    #[error("command execution failed: {0}")]
    CommandFailed(String),
    /// No source artifact backs the class.
    #[error("no source found for class {0}")]
    MissingSource(String),
    /// The executor's report could not be understood.
    #[error("malformed execution report: {0}")]
    MalformedReport(String),
    /// IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity of one test method.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TestCaseId {
    /// Canonical name of the test class.
    pub class: String,
    /// Test method name.
    pub method: String,
}

impl TestCaseId {
    /// Create a test case id.
    pub fn new(class: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            method: method.into(),
        }
    }

    /// Parse `Class#method`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (class, method) = raw.split_once('#')?;
        if class.is_empty() || method.is_empty() {
            return None;
        }
        Some(Self::new(class, method))
    }
}

impl std::fmt::Display for TestCaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.class, self.method)
    }
}

/// A compilation unit holding test methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestUnit {
    /// Canonical class name.
    pub class: String,
    /// Test methods in declaration order.
    pub methods: Vec<String>,
}

/// Entry of a package tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageEntry {
    /// Nested package.
    Package(TestPackage),
    /// Compilation unit.
    Unit(TestUnit),
}

/// A package of the test tree; children keep their navigation order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestPackage {
    /// Dotted package name (empty for the default package).
    pub name: String,
    /// Children in navigation order.
    pub entries: Vec<PackageEntry>,
}

impl TestPackage {
    /// Every test case in depth-first order.
    pub fn test_cases(&self) -> Vec<TestCaseId> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect(&self, out: &mut Vec<TestCaseId>) {
        for entry in &self.entries {
            match entry {
                PackageEntry::Package(package) => package.collect(out),
                PackageEntry::Unit(unit) => out.extend(
                    unit.methods
                        .iter()
                        .map(|m| TestCaseId::new(unit.class.clone(), m.clone())),
                ),
            }
        }
    }
}

/// A resolved source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    /// Outer class owning the file.
    pub class: String,
    /// Absolute path of the source file.
    pub source_file: PathBuf,
    /// Source root the file lives under.
    pub source_folder: PathBuf,
}

/// Source/project navigation.
pub trait ProjectNavigator {
    /// The test tree to evaluate.
    fn test_suite(&self) -> Result<TestPackage, CollaboratorError>;

    /// Resolve a class (inner classes resolve to their outer file).
    fn resolve_source(&self, class: &str) -> Option<SourceUnit>;

    /// Compiled-output directory receiving the class' artifacts.
    fn output_dir(&self, class: &str) -> Result<PathBuf, CollaboratorError>;
}

/// Static candidate discovery.
pub trait ClassScanner {
    /// Lines structurally related to (control-dominating or dominated with) `lines`.
    fn related_lines(
        &self,
        unit: &SourceUnit,
        class: &str,
        lines: &BTreeSet<u32>,
    ) -> Result<Vec<ClassLocation>, CollaboratorError>;
}

/// Compiles one source file into an output directory.
pub trait Compiler {
    /// Compile `source` in place into `output_dir`.
    fn compile(&self, output_dir: &Path, source: &Path) -> Result<(), CollaboratorError>;
}

/// When the executor should materialize a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceCapture {
    /// Always record (baseline runs).
    Always,
    /// Record only when the test fails (kill checks).
    OnFailure,
}

/// One test execution request.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Test to run.
    pub test_case: TestCaseId,
    /// Step cap.
    pub step_limit: usize,
    /// Wall-clock budget.
    pub timeout: Duration,
    /// Trace materialization policy.
    pub capture: TraceCapture,
}

/// What the executor observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Test passed.
    pub passed: bool,
    /// Steps executed (may exceed the cap when `over_long`).
    pub step_count: usize,
    /// Step cap was hit.
    pub over_long: bool,
    /// Wall-clock budget was exceeded.
    pub timed_out: bool,
    /// Distinct executed lines in first-seen order.
    pub visited: Vec<ClassLocation>,
    /// Materialized trace, if any.
    pub trace: Option<Trace>,
}

/// Runs a designated test method under step and time budgets.
pub trait Executor {
    /// Execute once and report.
    fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionReport, CollaboratorError>;
}

/// Line correspondence between an original and a mutated file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineDiff {
    /// Changed lines on the original side (1-based).
    pub changed_original: BTreeSet<u32>,
    /// Changed lines on the mutated side (1-based).
    pub changed_mutated: BTreeSet<u32>,
    /// Mutated line -> original line (unchanged lines, and replaced lines by position).
    pub mutated_to_original: BTreeMap<u32, u32>,
}

impl LineDiff {
    /// True when the mutated line was altered by the mutation.
    pub fn is_changed(&self, mutated_line: u32) -> bool {
        self.changed_mutated.contains(&mutated_line)
    }

    /// Original line a mutated line corresponds to.
    pub fn original_line(&self, mutated_line: u32) -> Option<u32> {
        self.mutated_to_original.get(&mutated_line).copied()
    }

    fn pair_hunk(&mut self, old: &[usize], new: &[usize]) {
        self.changed_original.extend(old.iter().map(|o| *o as u32 + 1));
        self.changed_mutated.extend(new.iter().map(|n| *n as u32 + 1));
        for (o, n) in old.iter().zip(new) {
            self.mutated_to_original.insert(*n as u32 + 1, *o as u32 + 1);
        }
    }
}

/// Produces line diffs.
pub trait DiffProvider {
    /// Diff `original` against `mutated`; `source_folder` is the root both belong to.
    fn diff(
        &self,
        source_folder: &Path,
        original: &Path,
        mutated: &Path,
    ) -> Result<LineDiff, CollaboratorError>;
}

// ---------------------------------------------------------------------------
// Adapters
// ---------------------------------------------------------------------------

/// Navigator over a conventional `<root>/<package path>/<Class>.java` layout.
#[derive(Debug, Clone)]
pub struct FsNavigator {
    source_roots: Vec<PathBuf>,
    test_root: PathBuf,
    output_dir: PathBuf,
    extension: String,
}

impl FsNavigator {
    /// Navigator with one compiled-output directory shared by every class.
    pub fn new(
        source_roots: Vec<PathBuf>,
        test_root: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source_roots,
            test_root: test_root.into(),
            output_dir: output_dir.into(),
            extension: "java".to_string(),
        }
    }

    /// Change the source file extension.
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    fn relative_source_path(&self, class: &str) -> PathBuf {
        let outer = outer_class_name(class);
        let mut path: PathBuf = outer.split('.').collect();
        path.set_extension(&self.extension);
        path
    }

    fn scan_package(&self, dir: &Path, name: &str) -> Result<TestPackage, CollaboratorError> {
        let mut children: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        children.sort();

        let mut package = TestPackage {
            name: name.to_string(),
            entries: Vec::new(),
        };
        for child in children {
            let file_name = child
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if child.is_dir() {
                let nested_name = qualify(name, &file_name);
                let nested = self.scan_package(&child, &nested_name)?;
                if !nested.entries.is_empty() {
                    package.entries.push(PackageEntry::Package(nested));
                }
            } else if child.extension().is_some_and(|e| e == self.extension.as_str()) {
                let stem = child
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
                let source = std::fs::read_to_string(&child)?;
                let methods = find_test_methods(&source);
                if !methods.is_empty() {
                    package.entries.push(PackageEntry::Unit(TestUnit {
                        class: qualify(name, &stem),
                        methods,
                    }));
                }
            }
        }
        Ok(package)
    }
}

fn qualify(package: &str, name: &str) -> String {
    if package.is_empty() {
        name.to_string()
    } else {
        format!("{package}.{name}")
    }
}

/// Method names annotated with `@Test`, in declaration order.
pub fn find_test_methods(source: &str) -> Vec<String> {
    let mut methods = Vec::new();
    let mut pending = false;
    for line in source.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("@Test") {
            pending = true;
            if let Some(name) = method_name(trimmed) {
                methods.push(name);
                pending = false;
            }
            continue;
        }
        if pending && !trimmed.starts_with('@') && !trimmed.is_empty() {
            if let Some(name) = method_name(trimmed) {
                methods.push(name);
            }
            pending = false;
        }
    }
    methods
}

fn method_name(line: &str) -> Option<String> {
    let paren = line.find('(')?;
    let head = line[..paren].trim_end();
    let name = head.rsplit(|c: char| c.is_whitespace()).next()?;
    if name.is_empty() || name.starts_with('@') || !head.contains("void") {
        return None;
    }
    Some(name.to_string())
}

impl ProjectNavigator for FsNavigator {
    fn test_suite(&self) -> Result<TestPackage, CollaboratorError> {
        self.scan_package(&self.test_root, "")
    }

    fn resolve_source(&self, class: &str) -> Option<SourceUnit> {
        let relative = self.relative_source_path(class);
        self.source_roots
            .iter()
            .chain(std::iter::once(&self.test_root))
            .map(|root| (root, root.join(&relative)))
            .find(|(_, path)| path.is_file())
            .map(|(root, path)| SourceUnit {
                class: outer_class_name(class).to_string(),
                source_file: path,
                source_folder: root.clone(),
            })
    }

    fn output_dir(&self, _class: &str) -> Result<PathBuf, CollaboratorError> {
        Ok(self.output_dir.clone())
    }
}

/// Static scanner working on brace structure of the source text.
///
/// For every target line the innermost enclosing branch or loop header is located, and
/// that header plus every statement line it guards is reported.
#[derive(Debug, Default, Clone, Copy)]
pub struct SourceBlockScanner;

const BRANCH_KEYWORDS: [&str; 7] = ["if", "else", "while", "for", "switch", "case", "do"];

fn is_branch_header(line: &str) -> bool {
    let trimmed = line.trim_start().trim_start_matches('}').trim_start();
    BRANCH_KEYWORDS.iter().any(|kw| {
        trimmed.strip_prefix(kw).is_some_and(|rest| {
            rest.is_empty() || rest.starts_with([' ', '(', '{', ':'])
        })
    })
}

fn is_statement_line(line: &str) -> bool {
    let trimmed = line.trim();
    !(trimmed.is_empty()
        || trimmed == "{"
        || trimmed == "}"
        || trimmed.starts_with("//")
        || trimmed.starts_with("/*")
        || trimmed.starts_with('*'))
}

/// Net brace depth change of a line, ignoring braces inside literals and line comments.
fn brace_delta(line: &str) -> i32 {
    let mut delta = 0;
    let mut in_str: Option<char> = None;
    let mut prev = '\0';
    for c in line.chars() {
        match in_str {
            Some(q) => {
                if c == q && prev != '\\' {
                    in_str = None;
                }
            }
            None => match c {
                '"' | '\'' => in_str = Some(c),
                '/' if prev == '/' => break,
                '{' => delta += 1,
                '}' => delta -= 1,
                _ => {}
            },
        }
        prev = c;
    }
    delta
}

impl SourceBlockScanner {
    fn enclosing_header(lines: &[&str], target: usize) -> Option<usize> {
        let mut depth = 0i32;
        for idx in (0..target).rev() {
            let delta = brace_delta(lines[idx]);
            depth += delta;
            if depth > 0 {
                // First unbalanced opener is the enclosing block.
                return is_branch_header(lines[idx]).then_some(idx);
            }
        }
        None
    }

    fn block_lines(lines: &[&str], header: usize) -> Vec<usize> {
        let mut out = vec![header];
        let mut depth = brace_delta(lines[header]);
        if depth <= 0 {
            // Braceless body: the next statement is the guarded one.
            if let Some(next) = (header + 1..lines.len()).find(|&i| is_statement_line(lines[i])) {
                out.push(next);
            }
            return out;
        }
        for (idx, line) in lines.iter().enumerate().skip(header + 1) {
            depth += brace_delta(line);
            if depth <= 0 {
                break;
            }
            if is_statement_line(line) {
                out.push(idx);
            }
        }
        out
    }
}

impl ClassScanner for SourceBlockScanner {
    fn related_lines(
        &self,
        unit: &SourceUnit,
        class: &str,
        lines: &BTreeSet<u32>,
    ) -> Result<Vec<ClassLocation>, CollaboratorError> {
        let source = std::fs::read_to_string(&unit.source_file)?;
        let text: Vec<&str> = source.lines().collect();
        let mut found = BTreeSet::new();
        for &line in lines {
            let idx = line.saturating_sub(1) as usize;
            if idx >= text.len() {
                continue;
            }
            let header = if is_branch_header(text[idx]) {
                Some(idx)
            } else {
                Self::enclosing_header(&text, idx)
            };
            if let Some(header) = header {
                found.extend(Self::block_lines(&text, header));
            }
        }
        Ok(found
            .into_iter()
            .map(|idx| ClassLocation::line_of(class, idx as u32 + 1))
            .collect())
    }
}

/// Splits a command line into program and arguments.
pub fn parse_command(cmd: &str) -> (String, Vec<String>) {
    let parts: Vec<&str> = cmd.split_whitespace().collect();
    if parts.len() > 1 {
        (
            parts[0].to_string(),
            parts[1..].iter().map(|s| s.to_string()).collect(),
        )
    } else {
        (cmd.to_string(), vec![])
    }
}

/// Compiler driven by a command template.
///
/// `{output}`, `{source}` and `{classpath}` are substituted in every argument.
#[derive(Debug, Clone)]
pub struct CommandCompiler {
    template: String,
    classpath: String,
    working_dir: PathBuf,
}

impl CommandCompiler {
    /// Compiler from a template such as `javac -d {output} -cp {classpath} {source}`.
    pub fn new(
        template: impl Into<String>,
        classpath: impl Into<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            template: template.into(),
            classpath: classpath.into(),
            working_dir: working_dir.into(),
        }
    }
}

impl Compiler for CommandCompiler {
    fn compile(&self, output_dir: &Path, source: &Path) -> Result<(), CollaboratorError> {
        let (program, args) = parse_command(&self.template);
        let output_dir = output_dir.to_string_lossy();
        let source = source.to_string_lossy();
        let args: Vec<String> = args
            .iter()
            .map(|a| {
                a.replace("{output}", &output_dir)
                    .replace("{source}", &source)
                    .replace("{classpath}", &self.classpath)
            })
            .collect();

        let output = Command::new(&program)
            .args(&args)
            .current_dir(&self.working_dir)
            .output()
            .map_err(|e| CollaboratorError::CommandFailed(format!("{program}: {e}")))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(CollaboratorError::Compile(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

/// JSON report written by the launcher at `MUTRACE_REPORT`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LauncherReport {
    /// Steps executed.
    pub step_count: usize,
    /// Step cap hit.
    #[serde(default)]
    pub over_long: bool,
    /// Distinct executed lines, when the launcher tracks them without a full trace.
    #[serde(default)]
    pub visited: Option<Vec<ClassLocation>>,
    /// Recorded steps, when captured.
    #[serde(default)]
    pub steps: Option<Vec<TraceStep>>,
}

/// Launcher stderr kept in a missing-report error.
const STDERR_TAIL_CHARS: usize = 2_000;

/// Executor spawning a launcher command per test run.
///
/// The launcher's stderr goes to `<report_dir>/<class>-<method>.stderr`.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    launcher: String,
    working_dir: PathBuf,
    report_dir: PathBuf,
    poll_interval: Duration,
}

impl CommandExecutor {
    /// Executor running `launcher` in `working_dir`; reports land in `report_dir`.
    pub fn new(
        launcher: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        report_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            launcher: launcher.into(),
            working_dir: working_dir.into(),
            report_dir: report_dir.into(),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn wait_with_timeout(
        child: &mut std::process::Child,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Option<ExitStatus>, CollaboratorError> {
        let start = Instant::now();
        loop {
            match child.try_wait()? {
                Some(status) => return Ok(Some(status)),
                None => {
                    if start.elapsed() > timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Ok(None);
                    }
                    std::thread::sleep(poll_interval);
                }
            }
        }
    }
}

impl Executor for CommandExecutor {
    fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionReport, CollaboratorError> {
        std::fs::create_dir_all(&self.report_dir)?;
        let stem = format!("{}-{}", request.test_case.class, request.test_case.method);
        let report_path = self.report_dir.join(format!("{stem}.json"));
        if report_path.exists() {
            std::fs::remove_file(&report_path)?;
        }
        // a full stderr pipe would block the launcher until the timeout
        let stderr_path = self.report_dir.join(format!("{stem}.stderr"));
        let stderr_file = std::fs::File::create(&stderr_path)?;

        let (program, args) = parse_command(&self.launcher);
        let capture = match request.capture {
            TraceCapture::Always => "always",
            TraceCapture::OnFailure => "on_failure",
        };
        let mut child = Command::new(&program)
            .args(&args)
            .current_dir(&self.working_dir)
            .env("MUTRACE_TEST_CLASS", &request.test_case.class)
            .env("MUTRACE_TEST_METHOD", &request.test_case.method)
            .env("MUTRACE_STEP_LIMIT", request.step_limit.to_string())
            .env("MUTRACE_CAPTURE", capture)
            .env("MUTRACE_REPORT", &report_path)
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_file))
            .spawn()
            .map_err(|e| CollaboratorError::CommandFailed(format!("{program}: {e}")))?;

        let started = Instant::now();
        let status = Self::wait_with_timeout(&mut child, request.timeout, self.poll_interval)?;
        let Some(status) = status else {
            return Ok(ExecutionReport {
                passed: false,
                step_count: 0,
                over_long: false,
                timed_out: true,
                visited: Vec::new(),
                trace: None,
            });
        };
        let elapsed = started.elapsed();

        if !report_path.exists() {
            let stderr = std::fs::read(&stderr_path).unwrap_or_default();
            let stderr = String::from_utf8_lossy(&stderr);
            let tail: String = {
                let trimmed = stderr.trim();
                let skip = trimmed.chars().count().saturating_sub(STDERR_TAIL_CHARS);
                trimmed.chars().skip(skip).collect()
            };
            return Err(CollaboratorError::MalformedReport(format!(
                "launcher wrote no report (exit {:?}): {tail}",
                status.code(),
            )));
        }
        let raw = std::fs::read_to_string(&report_path)?;
        let report: LauncherReport = serde_json::from_str(&raw)
            .map_err(|e| CollaboratorError::MalformedReport(e.to_string()))?;

        let over_long = report.over_long || report.step_count > request.step_limit;
        let trace = match report.steps {
            Some(steps) if !over_long => Trace::bounded(steps, request.step_limit)
                .ok()
                .map(|t| t.with_construct_time(elapsed)),
            _ => None,
        };
        let visited = match (report.visited, &trace) {
            (Some(visited), _) => visited,
            (None, Some(trace)) => trace.visited_locations(),
            (None, None) => Vec::new(),
        };

        Ok(ExecutionReport {
            passed: status.success(),
            step_count: report.step_count,
            over_long,
            timed_out: false,
            visited,
            trace,
        })
    }
}

/// Diff provider backed by `similar`'s line diff.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimilarDiffProvider;

impl SimilarDiffProvider {
    /// Diff two in-memory texts.
    ///
    /// Lines of a replaced hunk are paired by position, so a line-preserving mutation
    /// maps every mutated line back to an original line.
    pub fn diff_text(original: &str, mutated: &str) -> LineDiff {
        use similar::{DiffTag, TextDiff};

        let diff = TextDiff::from_lines(original, mutated);
        let mut out = LineDiff::default();
        let mut pending_old: Vec<usize> = Vec::new();
        let mut pending_new: Vec<usize> = Vec::new();
        for op in diff.ops() {
            let (tag, old, new) = op.as_tag_tuple();
            if tag == DiffTag::Equal {
                out.pair_hunk(&pending_old, &pending_new);
                pending_old.clear();
                pending_new.clear();
                for (o, n) in old.zip(new) {
                    out.mutated_to_original.insert(n as u32 + 1, o as u32 + 1);
                }
            } else {
                pending_old.extend(old);
                pending_new.extend(new);
            }
        }
        out.pair_hunk(&pending_old, &pending_new);
        out
    }
}

impl DiffProvider for SimilarDiffProvider {
    fn diff(
        &self,
        _source_folder: &Path,
        original: &Path,
        mutated: &Path,
    ) -> Result<LineDiff, CollaboratorError> {
        let original = std::fs::read_to_string(original)?;
        let mutated = std::fs::read_to_string(mutated)?;
        Ok(Self::diff_text(&original, &mutated))
    }
}
