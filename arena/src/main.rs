//! `arena`: operator CLI for a TaskArena state directory.
//!
//! Queue jobs, run workers and the scoreboard drain, and inspect progress.
//! The HTTP ingress lives in the separate `arena-server` binary.

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use arena::core::job::JobState;
use arena::drain::{drain_once, rebuild_from_journal, run_drain_loop};
use arena::exit_codes;
use arena::io::agent::{ClaudeCli, CliSettings};
use arena::io::config::{ArenaConfig, load_runtime_config, write_config};
use arena::io::paths::{ArenaPaths, default_state_dir, expand_tilde};
use arena::io::prompt::{PromptEngine, PromptInputs};
use arena::io::rules::assemble_rules;
use arena::io::scoreboard::load_scoreboard;
use arena::io::store::JobStore;
use arena::logging;
use arena::pool::{PoolConfig, run_pool};
use arena::protocol::run_plan_then_apply;
use arena::submit::{DEFAULT_MODE, JobRequest, submit};
use arena::worker::WorkerContext;

#[derive(Parser)]
#[command(
    name = "arena",
    version,
    about = "Filesystem job queue that drives a coding agent through plan and apply"
)]
struct Cli {
    /// State directory (default: $TASKARENA_HOME or ~/.taskarena).
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the state layout and a default `config.toml`.
    Init {
        /// Overwrite an existing config file.
        #[arg(short, long)]
        force: bool,
    },
    /// Queue a job. Without PROMPT, every non-empty stdin line is a job.
    Enqueue {
        prompt: Option<String>,
        /// Target repository (default: current directory).
        #[arg(long)]
        repo: Option<String>,
        #[arg(long, default_value = DEFAULT_MODE)]
        mode: String,
        #[arg(long)]
        hint: Option<String>,
    },
    /// Run the worker pool.
    Work {
        /// Worker count (overrides config and TA_WORKERS).
        #[arg(long)]
        workers: Option<usize>,
        /// Exit once the inbox is empty.
        #[arg(long)]
        once: bool,
    },
    /// Fold finished jobs into the scoreboard.
    Judge {
        /// Run a single drain cycle and print the snapshot.
        #[arg(long)]
        once: bool,
    },
    /// Print the scoreboard.
    Score {
        /// Recompute the counters from the event log first.
        #[arg(long)]
        rebuild: bool,
    },
    /// Print job counts per queue directory.
    Status,
    /// Run plan and apply once against a repository, bypassing the queue.
    Run {
        #[arg(long)]
        repo: String,
        prompt: String,
    },
}

fn main() {
    logging::init(logging::CLI_FILTER);
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = match cli.state_dir {
        Some(dir) => expand_tilde(&dir.to_string_lossy()),
        None => default_state_dir()?,
    };
    let paths = ArenaPaths::new(root);
    match cli.command {
        Command::Init { force } => cmd_init(&paths, force),
        Command::Enqueue {
            prompt,
            repo,
            mode,
            hint,
        } => cmd_enqueue(&paths, prompt, repo, mode, hint),
        Command::Work { workers, once } => cmd_work(&paths, workers, once),
        Command::Judge { once } => cmd_judge(&paths, once),
        Command::Score { rebuild } => cmd_score(&paths, rebuild),
        Command::Status => cmd_status(&paths),
        Command::Run { repo, prompt } => cmd_run(&paths, &repo, &prompt),
    }
}

fn cmd_init(paths: &ArenaPaths, force: bool) -> Result<i32> {
    paths.ensure_layout()?;
    if force || !paths.config_path.exists() {
        write_config(&paths.config_path, &ArenaConfig::default())
            .with_context(|| format!("write {}", paths.config_path.display()))?;
    }
    println!("{}", paths.root.display());
    Ok(exit_codes::OK)
}

fn cmd_enqueue(
    paths: &ArenaPaths,
    prompt: Option<String>,
    repo: Option<String>,
    mode: String,
    hint: Option<String>,
) -> Result<i32> {
    paths.ensure_layout()?;
    let store = JobStore::new(paths.clone());
    let dir = match repo {
        Some(repo) => repo,
        None => std::env::current_dir()
            .context("resolve current directory")?
            .to_string_lossy()
            .into_owned(),
    };
    let prompts = match prompt {
        Some(prompt) => vec![prompt],
        None => io::stdin()
            .lock()
            .lines()
            .collect::<io::Result<Vec<_>>>()
            .context("read prompts from stdin")?
            .into_iter()
            .filter(|line| !line.trim().is_empty())
            .collect(),
    };
    if prompts.is_empty() {
        bail!("no prompt given");
    }
    for prompt in prompts {
        let accepted = submit(
            &store,
            JobRequest {
                dir: Some(dir.clone()),
                prompt: Some(prompt),
                mode: Some(mode.clone()),
                hint: hint.clone(),
            },
        )?;
        println!("{}", accepted.id);
    }
    Ok(exit_codes::OK)
}

fn cmd_work(paths: &ArenaPaths, workers: Option<usize>, once: bool) -> Result<i32> {
    paths.ensure_layout()?;
    let mut cfg = load_runtime_config(&paths.config_path)?;
    if let Some(workers) = workers {
        cfg.workers = workers;
        cfg.validate()?;
    }
    let ctx = WorkerContext::new(paths.clone(), ClaudeCli::new(CliSettings::from_config(&cfg)))?;
    let config = PoolConfig {
        stop_when_idle: once,
        ..PoolConfig::from_config(&cfg)
    };
    let summary = run_pool(&ctx, &config, &AtomicBool::new(false));
    print_json(&json!({
        "processed": summary.processed,
        "succeeded": summary.succeeded,
        "failed": summary.failed,
    }))?;
    Ok(exit_codes::OK)
}

fn cmd_judge(paths: &ArenaPaths, once: bool) -> Result<i32> {
    paths.ensure_layout()?;
    if once {
        let report = drain_once(paths)?;
        print_json(&report.board)?;
        return Ok(exit_codes::OK);
    }
    let cfg = load_runtime_config(&paths.config_path)?;
    run_drain_loop(paths, cfg.drain_interval(), &AtomicBool::new(false));
    Ok(exit_codes::OK)
}

fn cmd_score(paths: &ArenaPaths, rebuild: bool) -> Result<i32> {
    let board = if rebuild {
        paths.ensure_layout()?;
        rebuild_from_journal(paths)?
    } else {
        load_scoreboard(&paths.scoreboard_path)?
    };
    print_json(&board)?;
    Ok(exit_codes::OK)
}

fn cmd_status(paths: &ArenaPaths) -> Result<i32> {
    let store = JobStore::new(paths.clone());
    let mut counts = serde_json::Map::new();
    for state in JobState::ALL {
        counts.insert(state.dir_name().to_string(), json!(store.count(state)?));
    }
    let board = load_scoreboard(&paths.scoreboard_path)?;
    print_json(&json!({ "queue": counts, "scoreboard": board }))?;
    Ok(exit_codes::OK)
}

fn cmd_run(paths: &ArenaPaths, repo: &str, prompt: &str) -> Result<i32> {
    let repo = std::path::absolute(expand_tilde(repo)).context("resolve repository path")?;
    if !repo.is_dir() {
        bail!("not a directory: {}", repo.display());
    }
    if prompt.trim().is_empty() {
        bail!("prompt must be non-empty");
    }
    let cfg = load_runtime_config(&paths.config_path)?;
    let agent = ClaudeCli::new(CliSettings::from_config(&cfg));
    let prompts = PromptEngine::new()?;

    let job_id = format!("run-{}", Uuid::new_v4());
    let repo_text = repo.to_string_lossy().into_owned();
    let rules = assemble_rules(&repo, &paths.agent_rules_path);
    let inputs = PromptInputs {
        job_id: &job_id,
        repo: &repo_text,
        prompt,
        rules: &rules,
    };
    let plan_text = prompts.render_plan(&inputs)?;
    let outcome = run_plan_then_apply(&agent, &repo, &plan_text, |plan| {
        prompts.render_apply(&inputs, plan)
    })?;

    println!("{}", outcome.combined_stdout());
    eprintln!("{}", outcome.combined_stderr());
    if let Some(reason) = outcome.failure_reason() {
        eprintln!("{reason}");
        return Ok(exit_codes::JOB_FAILED);
    }
    Ok(exit_codes::OK)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{rendered}");
    Ok(())
}
