// ABOUTME: Entry point for scopegate — a scope guard for agent file edits and shell commands.
// ABOUTME: Parses CLI args, loads .env and config, and dispatches check/status/mode/unlock.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{Level, debug};
use tracing_subscriber::FmtSubscriber;

use scopegate::access::{Gate, ToolCall};
use scopegate::config::Config;
use scopegate::mode;
use scopegate::state::{
    GuardMode, LockInspection, ReadOutcome, StateStore, UnlockOptions, UnlockOutcome,
};

/// Exit status a host hook treats as "blocked".
const EXIT_BLOCKED: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "scopegate", version, about = "Keep agent edits inside the active task's scope")]
struct Cli {
    /// Worktree root (defaults to the current directory).
    #[arg(long, global = true)]
    worktree: Option<PathBuf>,

    /// Debug-level diagnostics on stderr.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Evaluate a tool call read as JSON from stdin.
    Check,
    /// Show the effective guard mode, task state, and lock.
    Status,
    /// Persist a guard mode override.
    Mode {
        mode: GuardMode,
        /// Recorded as the author of the change.
        #[arg(long)]
        by: Option<String>,
    },
    /// Inspect the state lock and optionally remove it.
    Unlock {
        #[arg(long)]
        force: bool,
        /// Remove a lock recorded for another process or host.
        #[arg(long)]
        override_owner: bool,
    },
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    let worktree = match cli.worktree {
        Some(path) => path,
        None => std::env::current_dir().context("cannot determine the current directory")?,
    };
    if let Err(e) = dotenvy::from_path(worktree.join(".env")) {
        if !e.not_found() {
            eprintln!("warning: ignoring {}: {e}", worktree.join(".env").display());
        }
    }
    init_logging(cli.verbose);

    let config = Config::load(&worktree)
        .with_context(|| format!("loading config for {}", worktree.display()))?;
    debug!(worktree = %worktree.display(), "config loaded");

    match cli.command {
        Command::Check => check(&config, &worktree),
        Command::Status => status(&config, &worktree),
        Command::Mode { mode, by } => set_mode(&config, &worktree, mode, by),
        Command::Unlock {
            force,
            override_owner,
        } => unlock(&config, &worktree, UnlockOptions {
            force,
            override_owner,
        }),
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        Level::DEBUG
    } else {
        std::env::var("SCOPEGATE_LOG")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(Level::WARN)
    };
    // stdout carries the verdict; diagnostics go to stderr.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("warning: logging unavailable: {e}");
    }
}

fn check(config: &Config, worktree: &Path) -> Result<ExitCode> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("reading hook input from stdin")?;

    let evaluated = serde_json::from_str::<ToolCall>(&input)
        .context("hook input is not a tool call")
        .and_then(|call| {
            let gate = Gate::new(config, worktree)?;
            Ok(gate.check(&call)?)
        });

    match evaluated {
        Ok(verdict) => {
            println!("{}", verdict.to_json());
            if verdict.allowed() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_BLOCKED))
            }
        }
        // A call that cannot be evaluated is blocked, not waved through.
        Err(e) => {
            println!(
                "{}",
                json!({
                    "status": "error",
                    "allowed": false,
                    "warned": true,
                    "message": format!("{e:#}"),
                })
            );
            eprintln!("scopegate: {e:#}");
            Ok(ExitCode::from(EXIT_BLOCKED))
        }
    }
}

fn status(config: &Config, worktree: &Path) -> Result<ExitCode> {
    let store = StateStore::from_config(config, worktree)?;
    let effective = mode::effective_mode(&store, config.guard.mode);
    let state = store.read_state();

    let task = match &state {
        ReadOutcome::Ok(task) | ReadOutcome::Recovered { value: task, .. } => json!({
            "id": task.active_task_id,
            "title": task.active_task_title,
            "scopes": task.allowed_scopes,
            "role": task.role,
            "validationAttempts": task.validation_attempts,
        }),
        ReadOutcome::Corrupted(cause) => json!({
            "code": cause.code(),
            "error": cause.to_string(),
        }),
        ReadOutcome::NotFound => serde_json::Value::Null,
    };
    let from_backup = match &state {
        ReadOutcome::Recovered { from_backup, .. } => Some(from_backup.as_str()),
        _ => None,
    };

    let report = json!({
        "worktree": worktree.display().to_string(),
        "mode": effective.as_str(),
        "state": {
            "status": state.status(),
            "fromBackup": from_backup,
            "task": task,
        },
        "lock": lock_json(&store.inspect_lock()),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::SUCCESS)
}

fn set_mode(config: &Config, worktree: &Path, mode: GuardMode, by: Option<String>) -> Result<ExitCode> {
    let store = StateStore::from_config(config, worktree)?;
    let by = by
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "scopegate".to_string());
    let record = store.write_guard_mode(mode, &by)?;
    println!("guard mode set to {} by {}", record.mode, record.updated_by);
    Ok(ExitCode::SUCCESS)
}

fn unlock(config: &Config, worktree: &Path, options: UnlockOptions) -> Result<ExitCode> {
    let store = StateStore::from_config(config, worktree)?;
    let lock_path = store.paths().lock_dir.display().to_string();
    match store.force_unlock(options)? {
        UnlockOutcome::NotLocked => println!("no lock held at {lock_path}"),
        UnlockOutcome::Reported(inspection) => {
            println!("{}", serde_json::to_string_pretty(&lock_json(&inspection))?);
            println!("rerun with --force to remove it");
        }
        UnlockOutcome::Removed(inspection) => {
            println!("removed lock at {lock_path}");
            debug!(lock = %lock_json(&inspection), "removed lock");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn lock_json(inspection: &LockInspection) -> serde_json::Value {
    json!({
        "present": inspection.present,
        "owner": inspection.owner,
        "ageMs": inspection.age.map(|age| u64::try_from(age.as_millis()).unwrap_or(u64::MAX)),
    })
}
