#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]

mod cli;
mod output;

use clap::Parser;
use cli::{Cli, Commands};
use futures_util::StreamExt;
use output::{emit_error, emit_line, emit_output};
use runengine::{
    load_config, ConfigurationVersionId, EngineError, HookRegistry, QueueManager, Result, RunId,
    RunMode, SubmitRequest,
};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let command = cli.command.name();
    if let Err(error) = run(&cli).await {
        emit_error(&cli.output, command, &error);
        std::process::exit(error.exit_code());
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let mut config = load_config(cli.config.clone()).await?;
    if let Some(url) = &cli.database_url {
        config.database_url.clone_from(url);
    }
    let engine = QueueManager::open(&config, HookRegistry::new()).await?;
    let command = cli.command.name();

    match &cli.command {
        Commands::Activate {
            configuration_version_id,
            no_wait,
        } => {
            let id = ConfigurationVersionId::new(configuration_version_id.as_str());
            let environment = if *no_wait {
                engine.try_activate(&id).await?
            } else {
                engine.activate(&id).await?
            };
            emit_output(&cli.output, command, serde_json::to_value(environment)?);
        }

        Commands::Submit {
            configuration_version_id,
            input,
            validate_only,
        } => {
            let input: Value = serde_json::from_str(input)?;
            let mode = if *validate_only {
                RunMode::ValidateOnly
            } else {
                RunMode::Live
            };
            let request = SubmitRequest::live(
                ConfigurationVersionId::new(configuration_version_id.as_str()),
                input,
            )
            .with_mode(mode);
            let run = engine.submit(request).await?;
            emit_output(&cli.output, command, serde_json::to_value(run.status_view())?);
        }

        Commands::Status { run_id } => {
            let status = engine.status(&parse_run_id(run_id)?).await?;
            emit_output(&cli.output, command, serde_json::to_value(status)?);
        }

        Commands::Events { run_id, follow } => {
            let run_id = parse_run_id(run_id)?;
            if *follow {
                let mut stream = engine.event_stream(&run_id).await?;
                while let Some(event) = stream.next().await {
                    emit_line(&cli.output, &serde_json::to_value(event?)?);
                }
            } else {
                let events = engine.events(&run_id).await?;
                emit_output(&cli.output, command, json!({"events": events}));
            }
        }

        Commands::Retry { run_id } => {
            let run = engine.retry(&parse_run_id(run_id)?).await?;
            emit_output(&cli.output, command, serde_json::to_value(run.status_view())?);
        }

        Commands::Cancel { run_id } => {
            let ack = engine.cancel_request(&parse_run_id(run_id)?).await?;
            emit_output(&cli.output, command, serde_json::to_value(ack)?);
        }

        Commands::Lineage { run_id } => {
            let lineage = engine.lineage(&parse_run_id(run_id)?).await?;
            let attempts = lineage.iter().map(|run| run.status_view()).collect::<Vec<_>>();
            emit_output(&cli.output, command, json!({"runs": attempts}));
        }

        Commands::Runs { limit } => {
            let runs = engine.store().recent_runs(*limit).await?;
            let views = runs.iter().map(|run| run.status_view()).collect::<Vec<_>>();
            emit_output(&cli.output, command, json!({"runs": views}));
        }

        Commands::Work { until_idle } => {
            let report = engine.start().await?;
            info!(?report, "Startup recovery finished");
            if *until_idle {
                wait_until_idle(&engine).await?;
            } else {
                tokio::signal::ctrl_c().await?;
            }
            engine.shutdown().await;
            emit_output(&cli.output, command, json!({"message": "worker pool stopped", "recovered": report}));
        }

        Commands::Recover => {
            let report = engine.recover_stale().await?;
            emit_output(&cli.output, command, serde_json::to_value(report)?);
        }
    }
    Ok(())
}

fn parse_run_id(raw: &str) -> Result<RunId> {
    RunId::try_from(raw).map_err(EngineError::Config)
}

async fn wait_until_idle(engine: &QueueManager) -> Result<()> {
    loop {
        tokio::time::sleep(IDLE_CHECK_INTERVAL).await;
        if engine.outstanding().await? == 0 {
            return Ok(());
        }
    }
}
