//! uplift
//!
//! Phase-driven in-place upgrade runner. Script actors declared in a
//! workflow manifest run phase by phase; the run state survives reboots.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use color_eyre::Result;
use kameo::actor::Spawn;
use kameo::error::SendError;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use uplift_core::{
    AnswerQuestion, CheckWorkflow, CoreError, DeleteRun, FileStateStore, ListRuns, NoReboot,
    RebootHook, ResumeManager, RunOptions, RunStatus, RunWorkflow, SchedulerActor,
    SchedulerActorArgs,
};
use uplift_exec::{CommandExecutor, LocalExecutor};

mod config;
mod manifest;
mod output;
mod reboot;
mod script;

use config::{Config, LogConfig};
use manifest::Manifest;
use reboot::CommandReboot;

#[derive(Parser)]
#[command(name = "uplift")]
#[command(about = "Phase-driven in-place upgrade runner", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, env = config::CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Workflow manifest; overrides the configured one
    #[arg(long, global = true)]
    manifest: Option<PathBuf>,

    /// Print replies as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a run or resume one
    Run(RunArgs),

    /// Validate the workflow and print the execution plan
    Check {
        /// Allow an experimental actor
        #[arg(long = "enable-experimental", value_name = "ACTOR")]
        enable_experimental: Vec<String>,
    },

    /// List persisted runs
    ListRuns,

    /// Record an answer for a paused run
    Answer {
        run_id: String,
        question_id: String,
        /// JSON value; anything that does not parse is taken as a string
        value: String,
    },

    /// Delete a persisted run
    DeleteRun { run_id: String },

    /// Delete finished runs older than the given age
    Prune {
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Resume this run
    #[arg(long, conflicts_with = "resume")]
    run_id: Option<String>,

    /// Resume the latest unfinished run
    #[arg(long)]
    resume: bool,

    /// Stop after this phase
    #[arg(long, value_name = "PHASE")]
    until_phase: Option<String>,

    /// Allow an experimental actor
    #[arg(long = "enable-experimental", value_name = "ACTOR")]
    enable_experimental: Vec<String>,

    /// Answer a question up front
    #[arg(long = "answer", value_name = "ID=VALUE", value_parser = parse_answer)]
    answers: Vec<(String, Value)>,
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_answer(raw: &str) -> Result<(String, Value), String> {
    match raw.split_once('=') {
        Some((id, value)) if !id.is_empty() => Ok((id.to_string(), parse_value(value))),
        _ => Err(format!("expected ID=VALUE, got {raw:?}")),
    }
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Turn a failed ask into a report, keeping the engine error intact
fn reply<T, M: fmt::Debug>(result: Result<T, SendError<M, CoreError>>) -> Result<T> {
    result.map_err(|e| match e {
        SendError::HandlerError(err) => eyre::Report::new(err),
        other => eyre::eyre!("scheduler unavailable: {other:?}"),
    })
}

fn print<T: Serialize>(json: bool, value: &T, human: impl FnOnce(&T) -> String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", human(value));
    }
    Ok(())
}

/// 0 completed, 1 failed, 2 halted by inhibitors, 3 resumable
fn exit_code(status: &RunStatus) -> u8 {
    match status {
        RunStatus::Completed => 0,
        RunStatus::Failed { .. } => 1,
        RunStatus::Halted { .. } => 2,
        RunStatus::Running
        | RunStatus::AwaitingReboot { .. }
        | RunStatus::Paused { .. }
        | RunStatus::Interrupted { .. } => 3,
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    init_tracing(&config.log);

    let resume = ResumeManager::new(Arc::new(FileStateStore::new(&config.state_dir)));

    // Pruning works on persisted state alone
    if let Commands::Prune { days } = cli.command {
        let pruned = resume.prune(chrono::Duration::days(days)).await?;
        tracing::info!(count = pruned.len(), days, "pruned runs");
        print(cli.json, &pruned, |ids| format!("pruned {} run(s)", ids.len()))?;
        return Ok(ExitCode::SUCCESS);
    }

    let manifest_path = cli.manifest.clone().unwrap_or_else(|| config.manifest.clone());
    let loaded = Manifest::load(&manifest_path)?.into_loaded()?;

    let executor: Arc<dyn CommandExecutor> = Arc::new(LocalExecutor::new());
    let reboot_hook: Arc<dyn RebootHook> = match &config.reboot.command {
        Some(command) => Arc::new(CommandReboot::new(command.clone(), executor.clone())),
        None => Arc::new(NoReboot),
    };

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping the current phase");
            let _ = cancel_tx.send(true);
        }
    });

    let args = SchedulerActorArgs::new(loaded.workflow, loaded.actors, loaded.models)
        .with_resume(resume)
        .with_executor(executor)
        .with_config_bag(config.config_bag(std::env::vars()))
        .with_config(config.scheduler())
        .with_reboot_hook(reboot_hook)
        .with_cancel(cancel_rx);
    let scheduler = SchedulerActor::spawn(args);

    let code = match cli.command {
        Commands::Run(run) => {
            let mut answers: BTreeMap<String, Value> = config.answers.clone();
            answers.extend(run.answers);
            let options = RunOptions {
                run_id: run.run_id,
                resume_latest: run.resume,
                until_phase: run.until_phase,
                enable_experimental: run.enable_experimental.into_iter().collect(),
                answers,
            };

            let report = reply(scheduler.ask(RunWorkflow { options }).await)?;
            print(cli.json, &report, output::report)?;
            exit_code(&report.status)
        }
        Commands::Check {
            enable_experimental,
        } => {
            let enable_experimental: BTreeSet<String> = enable_experimental.into_iter().collect();
            let plan = reply(
                scheduler
                    .ask(CheckWorkflow {
                        enable_experimental,
                    })
                    .await,
            )?;
            print(cli.json, &plan, output::plan)?;
            0
        }
        Commands::ListRuns => {
            let runs = reply(scheduler.ask(ListRuns).await)?;
            print(cli.json, &runs, |runs| output::runs(runs))?;
            0
        }
        Commands::Answer {
            run_id,
            question_id,
            value,
        } => {
            reply(
                scheduler
                    .ask(AnswerQuestion {
                        run_id: run_id.clone(),
                        question_id: question_id.clone(),
                        value: parse_value(&value),
                    })
                    .await,
            )?;
            tracing::info!(%run_id, %question_id, "answer recorded");
            0
        }
        Commands::DeleteRun { run_id } => {
            reply(
                scheduler
                    .ask(DeleteRun {
                        run_id: run_id.clone(),
                    })
                    .await,
            )?;
            tracing::info!(%run_id, "run deleted");
            0
        }
        Commands::Prune { .. } => 0,
    };

    scheduler.stop_gracefully().await.ok();
    Ok(ExitCode::from(code))
}
