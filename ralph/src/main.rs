//! `ralph`: run a coding agent in a loop until the project's checks pass.
//!
//! Each `ralph run` creates `.ralph/runs/<run-id>/` holding the run record,
//! the agent-maintained plan and activity log, and raw agent/check logs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use ralph::core::signal::SentinelSignal;
use ralph::exit_codes;
use ralph::interrupt::Interrupt;
use ralph::io::agent::CommandAgent;
use ralph::io::config::load_config;
use ralph::io::init::{InitOptions, RalphPaths, init_workspace};
use ralph::io::verification::CommandVerifier;
use ralph::looping::{IterationReport, LoopStop, run_loop};
use ralph::run::{
    LoopOptions, RunSettings, SettingOverrides, preview_first_prompt, resume_run, start_run,
};
use ralph::status::{load_report, render_report};

/// Diagnostic lines printed under a failed iteration.
const PRINTED_DETAIL_LINES: usize = 6;

#[derive(Parser)]
#[command(
    name = "ralph",
    version,
    about = "Run a coding agent in a loop until verification passes"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Iterate on a task until checks pass and the work is complete.
    Run(RunArgs),
    /// Write a default `.ralph/config.toml`.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
        /// Workspace root.
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
    /// Summarize a run (the most recent one by default).
    Status {
        run_id: Option<String>,
        /// Workspace root.
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// What the agent should accomplish.
    #[arg(required_unless_present = "resume")]
    task: Option<String>,
    /// Iteration cap [config default: 10].
    #[arg(long)]
    max_iterations: Option<u32>,
    /// Checks that must pass: tests, lint, typecheck, build, quick, all [config default: all].
    #[arg(long)]
    mode: Option<String>,
    /// Per-iteration agent budget in USD [config default: 5.00].
    #[arg(long)]
    budget: Option<f64>,
    /// Kill the agent after this many seconds (0 disables the limit).
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Print the first prompt and exit without running anything.
    #[arg(long, conflicts_with = "resume")]
    dry_run: bool,
    /// Stream agent output to stderr.
    #[arg(short, long)]
    verbose: bool,
    /// Workspace root.
    #[arg(long, default_value = ".")]
    root: PathBuf,
    /// Continue an interrupted or exhausted run.
    #[arg(long, value_name = "RUN_ID", conflicts_with = "task")]
    resume: Option<String>,
}

fn main() {
    ralph::logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run(args) => cmd_run(args),
        Command::Init { force, root } => cmd_init(&root, force),
        Command::Status { run_id, root } => cmd_status(&root, run_id.as_deref()),
    }
}

fn cmd_run(args: RunArgs) -> Result<i32> {
    ensure_root(&args.root)?;
    let config = load_config(&RalphPaths::new(&args.root).config_path)?;
    let options =
        LoopOptions::from_config(&config, args.verbose).with_timeout_secs(args.timeout_secs);
    let overrides = SettingOverrides {
        max_iterations: args.max_iterations,
        mode: args.mode,
        budget_usd: args.budget,
    };

    let launch = match (args.resume.as_deref(), args.task.as_deref()) {
        (Some(run_id), _) => Launch::Resume(run_id),
        (None, Some(task)) => Launch::Start {
            task,
            settings: RunSettings::from_defaults(&config.run).with_overrides(&overrides)?,
        },
        (None, None) => bail!("a task description is required"),
    };
    if args.dry_run
        && let Launch::Start { task, settings } = launch
    {
        let pack = preview_first_prompt(&args.root, task, settings, &options)?;
        print!("{}", pack.as_str());
        return Ok(exit_codes::OK);
    }

    // Everything that can fail is set up before a run directory exists.
    let signal = SentinelSignal::new(config.agent.completion_sentinel.clone())
        .context("agent.completion_sentinel")?;
    let interrupt = Interrupt::install()?;
    let agent = CommandAgent::new(
        config.agent.command.clone(),
        config.agent.budget_flag.clone(),
        Arc::new(signal),
    )
    .with_interrupt(interrupt.clone());
    let verifier = CommandVerifier::new(config.verify.clone()).with_interrupt(interrupt.clone());

    let mut handle = match launch {
        Launch::Start { task, settings } => start_run(&args.root, task, settings, options)?,
        Launch::Resume(run_id) => resume_run(&args.root, run_id, &overrides, options)?,
    };

    let settings = handle.settings();
    println!(
        "ralph: run {} · mode {} · up to {} iterations · ${:.2} per iteration",
        handle.run_id(),
        settings.mode,
        settings.max_iterations,
        settings.budget_usd
    );

    let outcome = run_loop(&mut handle, &agent, &verifier, &interrupt, print_iteration)?;
    match outcome.stop {
        LoopStop::Success => {
            println!(
                "ralph: success after {} iteration(s)",
                outcome.total_iterations
            );
            Ok(exit_codes::OK)
        }
        LoopStop::Exhausted => {
            eprintln!(
                "ralph: max iterations ({}) reached without success",
                outcome.total_iterations
            );
            eprintln!("  activity: {}", handle.paths.activity_path.display());
            eprintln!("  agent:    {}", handle.paths.agent_log_path.display());
            eprintln!("  checks:   {}", handle.paths.verify_log_path.display());
            Ok(exit_codes::EXHAUSTED)
        }
        LoopStop::Interrupted => {
            eprintln!(
                "ralph: interrupted after {} iteration(s); continue with `ralph run --resume {}`",
                outcome.total_iterations, outcome.run_id
            );
            Ok(exit_codes::INTERRUPTED)
        }
    }
}

/// How `ralph run` obtains its run.
#[derive(Clone, Copy)]
enum Launch<'a> {
    Start { task: &'a str, settings: RunSettings },
    Resume(&'a str),
}

fn print_iteration(report: &IterationReport) {
    let record = &report.record;
    let mut tags = vec![report.prompt_kind.as_str()];
    if report.escalated {
        tags.push("escalated");
    }
    println!(
        "iteration {}/{} [{}]: {}",
        record.iteration,
        report.max_iterations,
        tags.join(", "),
        record.summary
    );
    if let Some(detail) = report.prior_failure.detail() {
        for line in detail.lines().take(PRINTED_DETAIL_LINES) {
            println!("    {line}");
        }
    }
    if !report.restored_tasks.is_empty() {
        println!(
            "    restored completed task(s): {:?}",
            report.restored_tasks
        );
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    ensure_root(root)?;
    let paths = init_workspace(root, &InitOptions { force })?;
    println!("wrote {}", paths.config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_status(root: &Path, run_id: Option<&str>) -> Result<i32> {
    let report = load_report(root, run_id)?;
    print!("{}", render_report(&report));
    Ok(exit_codes::OK)
}

fn ensure_root(root: &Path) -> Result<()> {
    if !root.is_dir() {
        bail!("workspace root {} is not a directory", root.display());
    }
    Ok(())
}
