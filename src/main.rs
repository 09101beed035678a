//! batch-exec CLI
//!
//! Entry point for the `batch-exec` command-line tool.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde_json::{json, Map, Value};
use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

use batch_exec::coordinator::TaskPhase;
use batch_exec::diff::BAR_WIDTH;
use batch_exec::docker::{DockerCli, ImageResolver};
use batch_exec::{
    CacheKey, CancelToken, EventFeed, ExecConfig, ExitCode, RunError, SignalHandler, TaskBuilder,
    TaskFile, TaskStatus, WorkspaceMode,
};

/// Environment variable consulted when `--token` is not given
const TOKEN_ENV: &str = "BATCH_EXEC_TOKEN";

#[derive(Args)]
struct CommonArgs {
    /// Config file (default: ~/.config/batch-exec/config.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Directory holding cached results
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Debug logging (overrides RUST_LOG)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
}

#[derive(Args)]
struct RunArgs {
    /// Task file: {"repositories": [...], "steps": [...]}
    tasks: PathBuf,

    /// Number of tasks executed at once
    #[arg(long, short = 'j')]
    parallelism: Option<usize>,

    /// Per-task timeout, e.g. "90s" or "1h"
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Directory for workspaces and logs
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// Keep task logs after the run
    #[arg(long)]
    keep_logs: bool,

    /// Remove all cached results before running
    #[arg(long)]
    clear_cache: bool,

    /// Neither read nor write cached results
    #[arg(long)]
    no_cache: bool,

    /// Run every task and report failures at the end
    #[arg(long)]
    skip_errors: bool,

    /// Workspace mode: auto, bind or volume
    #[arg(long)]
    workspace: Option<WorkspaceMode>,

    /// Archive endpoint base URL
    #[arg(long, conflicts_with = "store")]
    endpoint: Option<String>,

    /// Access token for the archive endpoint
    #[arg(long)]
    token: Option<String>,

    /// Local directory of <name>@<rev>.tar archives
    #[arg(long)]
    store: Option<PathBuf>,

    /// Print progress as JSON lines on stderr
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the steps of a task file and print the patches as JSON
    Run(RunArgs),

    /// Print the cache key of each task in a task file
    CacheKey {
        /// Task file
        tasks: PathBuf,
    },

    /// Remove all cached results
    ClearCache,
}

#[derive(Parser)]
#[command(name = "batch-exec")]
#[command(about = "Run batch-change steps across repositories and collect patches", version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.common.verbose);

    let code = match cli.command {
        Commands::Run(args) => run(&cli.common, args),
        Commands::CacheKey { tasks } => run_cache_key(&cli.common, &tasks),
        Commands::ClearCache => run_clear_cache(&cli.common),
    };
    process::exit(code.as_i32());
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

/// CLI layer: only flags that were passed.
fn cli_layer(common: &CommonArgs, run: Option<&RunArgs>) -> Value {
    let mut layer = Map::new();
    if let Some(dir) = &common.cache_dir {
        layer.insert("cache_dir".into(), json!(dir));
    }
    let Some(run) = run else {
        return Value::Object(layer);
    };

    if let Some(n) = run.parallelism {
        layer.insert("parallelism".into(), json!(n));
    }
    if let Some(timeout) = run.timeout {
        layer.insert("timeout_seconds".into(), json!(timeout.as_secs()));
    }
    if let Some(dir) = &run.temp_dir {
        layer.insert("temp_dir".into(), json!(dir));
    }
    if let Some(mode) = run.workspace {
        layer.insert("workspace".into(), json!(mode));
    }
    for (flag, set) in [
        ("keep_logs", run.keep_logs),
        ("clear_cache", run.clear_cache),
        ("no_cache", run.no_cache),
        ("skip_errors", run.skip_errors),
    ] {
        if set {
            layer.insert(flag.into(), json!(true));
        }
    }

    let token = run.token.clone().or_else(|| std::env::var(TOKEN_ENV).ok());
    if let Some(endpoint) = &run.endpoint {
        layer.insert("source".into(), json!({"endpoint": endpoint, "token": token}));
    } else if let Some(store) = &run.store {
        layer.insert("source".into(), json!({"store": store}));
    } else if let Some(token) = token {
        layer.insert("source".into(), json!({"token": token}));
    }
    Value::Object(layer)
}

fn load_config(common: &CommonArgs, run: Option<&RunArgs>) -> Result<ExecConfig, ExitCode> {
    match ExecConfig::load(common.config.as_deref(), cli_layer(common, run)) {
        Ok((config, layers)) => {
            debug!(config = %config.redacted(), layers = ?layers, "effective configuration");
            Ok(config)
        }
        Err(e) => {
            error!("{}", e);
            Err(ExitCode::Config)
        }
    }
}

fn load_tasks(path: &Path) -> Result<Vec<batch_exec::Task>, ExitCode> {
    let file = TaskFile::from_file(path).map_err(|e| {
        error!("{}", e);
        ExitCode::Config
    })?;
    let builder = TaskBuilder::new(file.steps).map_err(|e| {
        error!("{}", RunError::from(e));
        ExitCode::Config
    })?;
    Ok(builder.build(&file.repositories))
}

fn run(common: &CommonArgs, args: RunArgs) -> ExitCode {
    let json_events = args.json;
    let config = match load_config(common, Some(&args)) {
        Ok(c) => c,
        Err(code) => return code,
    };
    let tasks = match load_tasks(&args.tasks) {
        Ok(t) => t,
        Err(code) => return code,
    };
    let coordinator = match config.coordinator() {
        Ok(c) => c,
        Err(e) => {
            error!("{}", e);
            return ExitCode::Config;
        }
    };

    if config.clear_cache {
        match coordinator.cache().clear() {
            Ok(n) => debug!(removed = n, "cleared cache"),
            Err(e) => {
                error!("clearing cache: {}", e);
                return ExitCode::TaskFailed;
            }
        }
    }

    let cancel = CancelToken::new();
    let handler = SignalHandler::new(cancel.clone());
    if let Err(e) = handler.install() {
        warn!("could not install interrupt handler: {}", e);
    }

    let updates = coordinator.status().subscribe();
    let progress = thread::spawn(move || {
        let mut feed = EventFeed::new();
        for status in updates {
            if json_events {
                if let Some(event) = feed.next(&status) {
                    if let Ok(line) = serde_json::to_string(&event) {
                        eprintln!("{}", line);
                    }
                }
            } else {
                print_progress(&status);
            }
        }
    });

    let result = coordinator.run(tasks, &cancel);
    // the registry is closed when run returns, which ends the feed
    let _ = progress.join();

    match result {
        Ok(report) => {
            let patches: Vec<_> = report.patches.iter().map(|p| &p.patch).collect();
            if let Err(e) = write_json(&patches) {
                error!("writing patches: {}", e);
                return ExitCode::TaskFailed;
            }
            match report.aggregate_error() {
                Some(e) => {
                    error!("{}", e);
                    e.exit_code()
                }
                None => ExitCode::Success,
            }
        }
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        }
    }
}

fn print_progress(status: &TaskStatus) {
    match status.phase() {
        TaskPhase::Cached => eprintln!("{}  cached", status.repository),
        TaskPhase::Succeeded => match &status.diff_stat {
            Some(stat) => eprintln!("{}  {} {}", status.repository, stat, stat.bar(BAR_WIDTH)),
            None => eprintln!("{}  no changes", status.repository),
        },
        TaskPhase::Failed => {
            if let Some(error) = &status.error {
                eprintln!("{}  failed: {}", status.repository, error.message);
            }
        }
        TaskPhase::Enqueued | TaskPhase::Running => {}
    }
}

fn write_json<T: serde::Serialize>(value: &T) -> io::Result<()> {
    let mut out = io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)
}

fn run_cache_key(common: &CommonArgs, tasks: &Path) -> ExitCode {
    let config = match load_config(common, None) {
        Ok(c) => c,
        Err(code) => return code,
    };
    let tasks = match load_tasks(tasks) {
        Ok(t) => t,
        Err(code) => return code,
    };

    let images = ImageResolver::new(DockerCli::new(&config.docker_binary));
    let mut keys = Vec::with_capacity(tasks.len());
    for task in tasks {
        let mut steps = task.steps.clone();
        if let Err((step, message)) = images.pin(&mut steps, None) {
            error!("{}: step {}: {}", task.repository, step, message);
            return ExitCode::TaskFailed;
        }
        match CacheKey::compute(&task.repository, &steps) {
            Ok(key) => keys.push(json!({
                "repository": task.repository,
                "key": key.as_str(),
            })),
            Err(e) => {
                error!("{}: {}", task.repository, e);
                return ExitCode::TaskFailed;
            }
        }
    }

    match write_json(&keys) {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            error!("{}", e);
            ExitCode::TaskFailed
        }
    }
}

fn run_clear_cache(common: &CommonArgs) -> ExitCode {
    let config = match load_config(common, None) {
        Ok(c) => c,
        Err(code) => return code,
    };
    match config.cache().clear() {
        Ok(removed) => {
            println!("removed {} cached result(s) from {}", removed, config.cache_dir.display());
            ExitCode::Success
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::TaskFailed
        }
    }
}
