mod commands;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use runbox_common::logging::init_tracing;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "runbox-cli")]
#[command(about = "RunBox CLI - Run code in the sandbox, submit jobs, and inspect language profiles", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Fields shared by `run` and `submit`
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Language id (e.g., python, node, go, rust)
    #[arg(short, long)]
    pub language: String,

    /// Build command, overriding the language default
    #[arg(short, long)]
    pub build: Option<String>,

    /// Run command, overriding the language default
    #[arg(short, long = "run-cmd")]
    pub run_cmd: Option<String>,

    /// Environment override as KEY=VALUE (repeatable)
    #[arg(short, long = "env", value_parser = commands::parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Source files; each lands in the workspace under its file name
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute files locally through the sandbox executor
    Run {
        #[command(flatten)]
        args: RunArgs,

        /// Backend to use (docker or direct); defaults to RUNBOX_BACKEND
        #[arg(long)]
        backend: Option<String>,

        /// Wall-clock timeout in seconds; defaults to RUNBOX_SANDBOX_TIMEOUT
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Enqueue a run for a worker and wait for its reply
    Submit {
        #[command(flatten)]
        args: RunArgs,

        /// Seconds to wait for the reply
        #[arg(long)]
        wait: Option<u64>,
    },

    /// List builtin language profiles
    Languages,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let exit_code = match cli.command {
        Commands::Run { args, backend, timeout } => commands::run_local(&args, backend.as_deref(), timeout).await?,
        Commands::Submit { args, wait } => commands::submit(&args, wait).await?,
        Commands::Languages => {
            commands::list_languages()?;
            0
        }
    };

    std::process::exit(exit_code);
}
