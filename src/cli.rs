use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "runengine")]
#[command(about = "Queue, isolate and execute extraction runs against versioned configurations")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file (default: .runengine/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, global = true)]
    pub database_url: Option<String>,

    #[arg(long, global = true, value_enum, default_value = "json")]
    pub output: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build (or reuse) a configuration version's environment and run on_activate
    Activate {
        configuration_version_id: String,
        /// Fail instead of waiting when a build of this version is in progress
        #[arg(long)]
        no_wait: bool,
    },
    /// Queue a run of a configuration version
    Submit {
        configuration_version_id: String,
        /// Input payload as JSON
        #[arg(long, default_value = "{}")]
        input: String,
        #[arg(long)]
        validate_only: bool,
    },
    Status {
        run_id: String,
    },
    /// Print a run's events; with --follow, stream them until the run exits
    Events {
        run_id: String,
        #[arg(short, long)]
        follow: bool,
    },
    Retry {
        run_id: String,
    },
    Cancel {
        run_id: String,
    },
    Lineage {
        run_id: String,
    },
    /// List the most recently queued runs
    Runs {
        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Run the worker pool
    Work {
        /// Exit once no run is queued or running
        #[arg(long)]
        until_idle: bool,
    },
    /// Requeue or finish runs whose heartbeat went stale
    Recover,
}

impl Commands {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Activate { .. } => "activate",
            Self::Submit { .. } => "submit",
            Self::Status { .. } => "status",
            Self::Events { .. } => "events",
            Self::Retry { .. } => "retry",
            Self::Cancel { .. } => "cancel",
            Self::Lineage { .. } => "lineage",
            Self::Runs { .. } => "runs",
            Self::Work { .. } => "work",
            Self::Recover => "recover",
        }
    }
}

#[derive(Clone, Debug, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}
