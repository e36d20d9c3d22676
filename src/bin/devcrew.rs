//! devcrew - command line trigger
//!
//! Runs one requirement to completion in-process and prints the run summary.
//!
//!   devcrew run "Add image upload to user profiles"
//!   echo "Add dark mode" | devcrew run --json

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;

use devcrew::agents::Role;
use devcrew::config::Config;
use devcrew::orchestrator::Orchestrator;
use devcrew::run::{InMemoryRunStore, Priority, Run, RunFailureCode, RunRequest, RunState};

#[derive(Parser)]
#[command(name = "devcrew", version, about = "Turn a requirement into a reviewed pull request")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute one run and wait for it to finish
    Run {
        /// Requirement text; read from stdin when omitted
        requirement: Vec<String>,

        /// Target repository (owner/name), overrides GITHUB_REPO
        #[arg(long)]
        repository: Option<String>,

        /// Tracker project to open an issue in
        #[arg(long)]
        tracker_project: Option<String>,

        /// low, normal, high or urgent
        #[arg(long)]
        priority: Option<Priority>,

        /// Hand the requirement to one worker role (frontend, backend or
        /// database) instead of planning it
        #[arg(long)]
        role: Option<Role>,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "devcrew=info".into()),
        )
        .init();

    let Command::Run {
        requirement,
        repository,
        tracker_project,
        priority,
        role,
        json,
    } = Args::parse().command;

    let requirement = if requirement.is_empty() {
        let mut input = String::new();
        tokio::io::stdin().read_to_string(&mut input).await?;
        input
    } else {
        requirement.join(" ")
    };

    // a blank requirement still goes through the orchestrator so it ends
    // with the invalid_input code like any other rejected trigger
    let mut request = RunRequest::new(requirement);
    request.repository = repository;
    request.tracker_project = tracker_project;
    request.priority = priority;
    request.role = role;

    let config = Arc::new(Config::from_env()?);
    let orchestrator = Orchestrator::from_config(config, Arc::new(InMemoryRunStore::new()));
    let run = orchestrator.submit(request).await;

    let report = run.report();
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.to_markdown());
    }

    let status = exit_code(&run);
    if let Some(code) = run.failure_code() {
        eprintln!("error: {}", code);
    }
    Ok(ExitCode::from(status))
}

/// Process exit status for a finished run.
fn exit_code(run: &Run) -> u8 {
    match (run.state, run.failure_code()) {
        (RunState::Failed, Some(code)) => exit_status(code),
        (RunState::Failed, None) => 1,
        _ => 0,
    }
}

/// One exit status per failure code. 1 and 2 are used for startup and usage errors.
fn exit_status(code: RunFailureCode) -> u8 {
    match code {
        RunFailureCode::InvalidInput => 3,
        RunFailureCode::DecompositionFailed => 4,
        RunFailureCode::AllTasksFailed => 5,
        RunFailureCode::Timeout => 6,
        RunFailureCode::PublishFailed => 7,
        RunFailureCode::ReviewRejected => 8,
    }
}
