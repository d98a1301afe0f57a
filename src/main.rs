use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use stoker::config::Config;
use stoker::task::TaskKind;

mod cmd;

#[derive(Parser)]
#[command(name = "stoker")]
#[command(version, about = "Feedstock maintenance automation")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one sandboxed maintenance task and write its Task Result
    RunTask {
        /// Task kind to execute
        #[arg(long, value_enum)]
        task: TaskKind,

        /// Feedstock repository name, without the organization
        #[arg(long)]
        repo: String,

        /// Pull request number the task targets
        #[arg(long)]
        pr_number: u64,

        /// Directory shared between the sandboxed and trusted phases
        #[arg(long)]
        task_data_dir: PathBuf,

        /// Version to update to; null/none/empty means auto-detect
        #[arg(long)]
        requested_version: Option<String>,

        /// Commit SHA that statuses should be keyed to
        #[arg(long)]
        sha: Option<String>,
    },
    /// Replay a Task Result against the live pull request
    FinalizeTask {
        /// Directory shared between the sandboxed and trusted phases
        #[arg(long)]
        task_data_dir: PathBuf,
    },
    /// Find the open PR matching a commit and merge it if policy allows
    Automerge {
        /// Feedstock repository name, without the organization
        #[arg(long)]
        repo: String,

        /// Head commit SHA to match against open pull requests
        #[arg(long)]
        sha: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match &cli.command {
        Commands::RunTask {
            task,
            repo,
            pr_number,
            task_data_dir,
            requested_version,
            sha,
        } => {
            cmd::cmd_run_task(
                &config,
                *task,
                repo,
                *pr_number,
                task_data_dir,
                requested_version.as_deref(),
                sha.as_deref(),
            )
            .await?;
        }
        Commands::FinalizeTask { task_data_dir } => {
            cmd::cmd_finalize_task(&config, task_data_dir).await?;
        }
        Commands::Automerge { repo, sha } => {
            cmd::cmd_automerge(&config, repo, sha).await?;
        }
    }

    Ok(())
}
