//! Goal-driven code generation pipeline.
//!
//! `teamloop run "<goal>"` plans, designs and generates a small project into the
//! sandbox directory, retries generation until the verification command passes or
//! the iteration budget runs out, then asks for a review.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use teamloop::exit_codes;
use teamloop::io::chat::build_chat_clients;
use teamloop::io::config::{DEFAULT_CONFIG_FILE, TeamConfig, load_config, write_config};
use teamloop::io::run_log::{RunLog, make_run_id};
use teamloop::io::verifier::CommandVerifier;
use teamloop::logging;
use teamloop::pipeline::{Pipeline, PipelineOutcome, PipelineSettings, PipelineStop};
use tracing::warn;

#[derive(Parser)]
#[command(
    name = "teamloop",
    version,
    about = "Turn a one-line goal into verified source files"
)]
struct Cli {
    /// Log progress to stderr (`RUST_LOG` takes precedence).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline for one goal.
    Run(RunArgs),
    /// Write the default configuration file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
        #[arg(default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// What to build, in one line.
    goal: String,
    /// Force the first verification pass to fail, exercising the retry loop.
    #[arg(long)]
    fault_inject: bool,
    /// Do not write a run log.
    #[arg(long)]
    no_log: bool,
    #[arg(long)]
    max_iterations: Option<u32>,
    #[arg(long)]
    workdir: Option<PathBuf>,
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// mock | ollama | anthropic | openai
    #[arg(long)]
    backend: Option<String>,
    /// Configuration file (default: ./teamloop.toml when present).
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli.command) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(command: Command) -> Result<i32> {
    match command {
        Command::Run(args) => cmd_run(&args),
        Command::InitConfig { force, path } => cmd_init_config(&path, force),
    }
}

fn cmd_init_config(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &TeamConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn resolve_config(args: &RunArgs) -> Result<TeamConfig> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    if args.config.is_some() && !path.exists() {
        bail!("config file {} does not exist", path.display());
    }
    let mut cfg = load_config(&path)?;
    cfg.apply_env()?;
    if let Some(backend) = &args.backend {
        cfg.backend = backend.parse().context("--backend")?;
    }
    if let Some(max_iterations) = args.max_iterations {
        cfg.max_iterations = max_iterations;
    }
    if let Some(workdir) = &args.workdir {
        cfg.workdir.clone_from(workdir);
    }
    if let Some(log_dir) = &args.log_dir {
        cfg.log_dir.clone_from(log_dir);
    }
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

fn cmd_run(args: &RunArgs) -> Result<i32> {
    if args.goal.trim().is_empty() {
        bail!("goal must be non-empty");
    }
    let cfg = resolve_config(args)?;
    let clients = build_chat_clients(&cfg).context("build chat clients")?;
    let verifier = CommandVerifier::from_config(&cfg.verify);

    let mut pipeline = Pipeline::new(
        &clients.general,
        &clients.coder,
        &verifier,
        &cfg.workdir,
        PipelineSettings::from_config(&cfg, args.fault_inject),
    )?;
    if !args.no_log {
        let sandbox_root = pipeline.sandbox_root().to_path_buf();
        match RunLog::create(&cfg.log_dir, &make_run_id(), &sandbox_root, cfg.fingerprints) {
            Ok(log) => pipeline = pipeline.with_run_log(log),
            Err(err) => warn!(err = %format!("{err:#}"), "run log disabled"),
        }
    }

    let outcome = pipeline.run(args.goal.trim());
    print_summary(&cfg, &outcome);
    Ok(match outcome.stop {
        PipelineStop::Succeeded => exit_codes::OK,
        PipelineStop::BudgetExhausted { .. } => exit_codes::EXHAUSTED,
        PipelineStop::Aborted { .. } => exit_codes::INVALID,
    })
}

fn print_summary(cfg: &TeamConfig, outcome: &PipelineOutcome) {
    let state = &outcome.state;
    println!("run: {}", outcome.run_id);
    println!("workdir: {}", cfg.workdir.display());
    println!("files:");
    for path in state.files.keys() {
        println!("  - {path}");
    }
    let verified = matches!(outcome.stop, PipelineStop::Succeeded);
    println!("verification passed: {verified}");
    println!("iterations: {} (max {})", state.iteration, cfg.max_iterations);
    let stop = match &outcome.stop {
        PipelineStop::Succeeded => "done_ok".to_string(),
        PipelineStop::BudgetExhausted { .. } => "done_failed (retry budget exhausted)".to_string(),
        PipelineStop::Aborted { .. } => "done_failed (aborted)".to_string(),
    };
    println!("stop: {stop}");
    if state.has_error() {
        println!("\nerror:\n{}", state.error);
    }
    if !state.review_notes.is_empty() {
        println!("\nreview notes:\n{}", state.review_notes);
    }
    if let Some(path) = &outcome.log_path {
        println!("\nrun log: {}", path.display());
    }
}
