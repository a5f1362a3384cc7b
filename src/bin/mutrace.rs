use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mutrace::pipeline::{
    AlignmentPolicy, CancellationFlag, Collaborators, CommandCompiler, CommandExecutor,
    FsNavigator, Ledger, LedgerSummary, Orchestrator, PipelineConfig, SimilarDiffProvider,
    SourceBlockScanner, render_status, render_trials,
};

#[derive(Debug, Parser)]
#[command(name = "mutrace")]
#[command(about = "Mutation-driven fault localization over execution traces")]
struct Cli {
    /// Log pipeline progress.
    #[arg(long, global = true)]
    verbose: bool,
    /// Log everything, including per-mutant decisions.
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Mutate, trace and localize every test case of a project.
    Run {
        /// Project directory.
        #[arg(long)]
        project: Option<PathBuf>,
        /// Run root directory (ledger and archived traces).
        #[arg(long)]
        run_root: Option<PathBuf>,
        /// Load settings from a saved JSON configuration.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Main source root, relative to the project. Repeatable.
        #[arg(long = "source-root", default_value = "src/main/java")]
        source_roots: Vec<PathBuf>,
        /// Test source root, relative to the project.
        #[arg(long, default_value = "src/test/java")]
        test_root: PathBuf,
        /// Source file extension.
        #[arg(long, default_value = "java")]
        source_extension: String,
        /// Compiled-output directory, relative to the project.
        #[arg(long, default_value = "target/classes")]
        output_dir: PathBuf,
        /// Compile command; `{output}`, `{source}` and `{classpath}` are substituted.
        #[arg(long, default_value = "javac -nowarn -d {output} -cp {classpath} {source}")]
        compile: String,
        /// Classpath handed to the compile command.
        #[arg(long, default_value = "target/classes")]
        classpath: String,
        /// Launcher that runs one test and writes the execution report.
        #[arg(long)]
        launcher: String,
        /// Trace step cap.
        #[arg(long)]
        step_limit: Option<usize>,
        /// Per-execution timeout in seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Mutant budget per strategy and test case.
        #[arg(long)]
        mutants: Option<usize>,
        /// Stop a test case after this many localized trials.
        #[arg(long)]
        trial_cap: Option<usize>,
        /// Step equivalence used for alignment.
        #[arg(long, value_enum)]
        alignment: Option<AlignmentArg>,
    },
    /// Summarize the ledger.
    Status {
        /// Project directory.
        #[arg(long)]
        project: Option<PathBuf>,
        /// Run root directory.
        #[arg(long)]
        run_root: Option<PathBuf>,
    },
    /// List localized trials.
    Trials {
        /// Project directory.
        #[arg(long)]
        project: Option<PathBuf>,
        /// Run root directory.
        #[arg(long)]
        run_root: Option<PathBuf>,
        /// Emit JSON output.
        #[arg(long)]
        json: bool,
    },
    /// List ignored test cases.
    Ignored {
        /// Project directory.
        #[arg(long)]
        project: Option<PathBuf>,
        /// Run root directory.
        #[arg(long)]
        run_root: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AlignmentArg {
    /// Same location
    Location,
    /// Same location and recorded state
    State,
}

impl From<AlignmentArg> for AlignmentPolicy {
    fn from(arg: AlignmentArg) -> Self {
        match arg {
            AlignmentArg::Location => AlignmentPolicy::Location,
            AlignmentArg::State => AlignmentPolicy::LocationAndState,
        }
    }
}

fn base_config(
    config: Option<PathBuf>,
    project: Option<PathBuf>,
    run_root: Option<PathBuf>,
) -> Result<PipelineConfig> {
    let mut out = match (config, project) {
        (Some(path), project) => {
            let loaded = PipelineConfig::load(&path)
                .with_context(|| format!("failed to load config {}", path.display()))?;
            match project {
                Some(project) => loaded.with_project_dir(project),
                None => loaded,
            }
        }
        (None, Some(project)) => PipelineConfig::for_project(project),
        (None, None) => PipelineConfig::default(),
    };
    if let Some(run_root) = run_root {
        out = out.with_run_root(run_root);
    }
    Ok(out)
}

fn cancellation() -> Result<CancellationFlag> {
    static FLAG: OnceLock<Result<CancellationFlag, String>> = OnceLock::new();
    let result = FLAG.get_or_init(|| {
        let flag = CancellationFlag::new();
        let handler_flag = flag.clone();
        ctrlc::set_handler(move || handler_flag.cancel())
            .map(|()| flag)
            .map_err(|e| e.to_string())
    });
    match result {
        Ok(flag) => Ok(flag.clone()),
        Err(msg) => anyhow::bail!("failed to install signal handler: {msg}"),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter_layer = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else if cli.verbose {
        tracing_subscriber::EnvFilter::new("info")
    } else {
        tracing_subscriber::EnvFilter::new("warn")
    };
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Command::Run {
            project,
            run_root,
            config,
            source_roots,
            test_root,
            source_extension,
            output_dir,
            compile,
            classpath,
            launcher,
            step_limit,
            timeout_secs,
            mutants,
            trial_cap,
            alignment,
        } => {
            let mut config = base_config(config, project, run_root)?;
            if let Some(step_limit) = step_limit {
                config = config.with_step_limit(step_limit);
            }
            if let Some(timeout_secs) = timeout_secs {
                config = config.with_timeout_secs(timeout_secs);
            }
            if let Some(mutants) = mutants {
                config = config.with_mutants_per_test_case(mutants);
            }
            if let Some(trial_cap) = trial_cap {
                config = config.with_trial_cap(trial_cap);
            }
            if let Some(alignment) = alignment {
                config = config.with_alignment(alignment.into());
            }

            let project_dir = config.project_dir.clone();
            let navigator = FsNavigator::new(
                source_roots.iter().map(|root| project_dir.join(root)).collect(),
                project_dir.join(test_root),
                project_dir.join(output_dir),
            )
            .with_extension(source_extension);
            let compiler = CommandCompiler::new(compile, classpath, &project_dir);
            let executor =
                CommandExecutor::new(launcher, &project_dir, config.run_root.join("reports"));
            let collaborators = Collaborators {
                navigator: &navigator,
                scanner: &SourceBlockScanner,
                compiler: &compiler,
                executor: &executor,
                diff: &SimilarDiffProvider,
            };

            let mut ledger = Ledger::open(config.ledger_path())?;
            config.save(&config.run_root.join("config.json"))?;
            let summary = Orchestrator::new(config, collaborators)
                .with_cancellation(cancellation()?)
                .run(&mut ledger)?;

            println!("run id: {}", summary.run_id);
            println!("ledger: {}", ledger.path().display());
            println!(
                "summary: test_cases={}, ignored={}, mutants={}, attempted={}, skipped={}, \
                 trials={}, errors={}",
                summary.test_cases,
                summary.newly_ignored + summary.previously_ignored,
                summary.mutants_generated,
                summary.trials_attempted,
                summary.trials_skipped,
                summary.empirical_trials,
                summary.errors
            );
            if summary.interrupted {
                println!("interrupted: rerun to continue where this run stopped");
            }
        }
        Command::Status { project, run_root } => {
            let config = base_config(None, project, run_root)?;
            let ledger = Ledger::open(config.ledger_path())?;
            print!("{}", render_status(ledger.snapshot()));
        }
        Command::Trials {
            project,
            run_root,
            json,
        } => {
            let config = base_config(None, project, run_root)?;
            let ledger = Ledger::open(config.ledger_path())?;
            let snapshot = ledger.snapshot();
            if json {
                let output = serde_json::json!({
                    "summary": LedgerSummary::from_snapshot(snapshot),
                    "trials": snapshot.empirical,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                print!("{}", render_trials(&snapshot.empirical));
            }
        }
        Command::Ignored { project, run_root } => {
            let config = base_config(None, project, run_root)?;
            let ledger = Ledger::open(config.ledger_path())?;
            for (test_case, reason) in &ledger.snapshot().ignored {
                println!("{test_case}\t{reason}");
            }
        }
    }

    Ok(())
}
