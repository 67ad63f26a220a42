mod cli;
mod commands;
mod error;
mod output;

use crate::{
    cli::{Args, Commands},
    commands::CommandExecutor,
    error::{AppError, Result},
};
use clap::Parser;
use presage_engine::SinkTarget;
use std::process;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.log_level.as_deref());

    match run(args).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("Application error: {}", e);
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<i32> {
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing in-flight windows");
            signal_token.cancel();
        }
    });

    let mut config = cli::base_config(&args)?;

    match args.command {
        Commands::Predict {
            start,
            end,
            targets,
            data_provider,
            output_dir,
            sink_uri,
            sink_api_key,
            sink_recreate_db,
            forward_resampled,
            n_retries,
        } => {
            if end <= start {
                return Err(AppError::InvalidInput(format!(
                    "end ({end}) must be after start ({start})"
                )));
            }
            config.retry.max_retries = n_retries;
            config.forward_resampled = forward_resampled;
            if let Some(raw) = data_provider.as_deref() {
                config.data_provider = Some(serde_json::from_str(raw).map_err(|e| {
                    AppError::InvalidInput(format!("invalid data-provider JSON: {e}"))
                })?);
            }
            if let Some(uri) = sink_uri {
                config.sink = Some(SinkTarget {
                    uri,
                    api_key: sink_api_key,
                    recreate: sink_recreate_db,
                });
            }

            let executor = CommandExecutor::new(config)?;
            executor
                .predict(start, end, &targets, output_dir.as_deref(), &token)
                .await
        }

        Commands::Metadata {
            targets,
            output_file,
        } => {
            let executor = CommandExecutor::new(config)?;
            executor
                .metadata(&targets, output_file.as_deref(), &token)
                .await
        }

        Commands::DownloadModel {
            output_dir,
            targets,
        } => {
            let executor = CommandExecutor::new(config)?;
            executor.download_model(&output_dir, &targets, &token).await
        }
    }
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_env("PRESAGE_LOG")
            .unwrap_or_else(|_| EnvFilter::new("presage=info,presage_engine=info")),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}
