//! Substreams Data Warehouse server

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use subdwh_common::logging::{init_logging, LogConfig, LogLevel};
use subdwh_common::UploadState;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use subdwh_server::{
    app::App,
    cli::{Cli, Commands, StateCommand},
    config::Config,
    pipeline::{JobSpec, TickOutcome},
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .log_file_prefix("subdwh-server".to_string())
        .filter_directives("subdwh_server=debug,aws_config=warn,hyper=info".to_string())
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env()?;

    let _logging = init_logging(&log_config)?;

    let config = Config::load()?;
    info!(environment = %config.environment, bucket = %config.storage.bucket, "Configuration loaded");

    let command = cli.command.unwrap_or(Commands::Run);
    if matches!(
        command,
        Commands::Run | Commands::UploadTick { .. } | Commands::Load { .. }
    ) {
        config.warehouse.validate()?;
    }

    let app = App::build(config).await?;

    match command {
        Commands::Run => run(app).await?,
        Commands::Discover => {
            let outcome = app.discovery.tick().await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        },
        Commands::Process { package_key } => {
            let outcome = app.processing.run(&package_key).await?;
            info!(?outcome, "Processing finished");
        },
        Commands::UploadTick { dry_run } => {
            let outcome = app.upload.tick().await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !dry_run {
                load_requests(&app, outcome).await?;
            }
        },
        Commands::Load { file_keys } => {
            let report = app.load.run(&file_keys).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        },
        Commands::State { command } => state_command(&app, command).await?,
        Commands::Pending => {
            for key in app.upload.pending_keys().await? {
                println!("{}", key);
            }
        },
    }

    Ok(())
}

async fn run(app: App) -> Result<()> {
    let runtime = app.runtime()?;
    let shutdown = CancellationToken::new();

    info!(
        discovery = %app.config.schedule.discovery,
        upload = %app.config.schedule.upload,
        "Starting schedules"
    );

    let handle = tokio::spawn(runtime.run(shutdown.clone()));

    shutdown_signal().await;
    shutdown.cancel();
    handle.await?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn load_requests(app: &App, outcome: TickOutcome) -> Result<()> {
    for request in outcome.into_requests() {
        if let JobSpec::Load { file_keys } = request.job {
            let report = app.load.run(&file_keys).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

async fn state_command(app: &App, command: StateCommand) -> Result<()> {
    match command {
        StateCommand::Get { file_key } => {
            let state = app.state.get_state(&file_key).await?;
            println!(
                "{}",
                json!({ "file_key": file_key, "state": state.map(|s| s.as_str()) })
            );
        },
        StateCommand::MarkUploaded { file_keys } => {
            for file_key in file_keys {
                let changed = app.state.set_state(&file_key, UploadState::Uploaded).await?;
                println!("{}", json!({ "file_key": file_key, "changed": changed }));
            }
        },
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}
