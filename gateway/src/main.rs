use clap::{Parser, Subcommand};
use directory::EntityLookup;
use resolver::Resolvers;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

mod config;
mod telemetry;

use config::Config;

#[derive(Parser)]
#[command(name = "gateway", about = "Tenant resolution gateway")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Build the stack caches and serve the lookup API.
    Serve {
        #[arg(long, default_value = "gateway.yaml")]
        config: PathBuf,
    },
    /// Load and validate a config file, then exit.
    CheckConfig {
        #[arg(long, default_value = "gateway.yaml")]
        config: PathBuf,
    },
}

#[derive(thiserror::Error, Debug)]
enum GatewayError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Telemetry(#[from] telemetry::TelemetryError),
    #[error(transparent)]
    Build(#[from] resolver::BuildError),
    #[error(transparent)]
    Api(#[from] directory::api::LookupApiError),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        CliCommand::Serve { config } => run(&config),
        CliCommand::CheckConfig { config } => Config::from_file(&config)
            .map(|_| println!("{} is valid", config.display()))
            .map_err(GatewayError::from),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("gateway: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(path: &std::path::Path) -> Result<(), GatewayError> {
    let config = Config::from_file(path)?;
    let _sentry = telemetry::init_logging(&config.logging)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(serve(config))
}

async fn serve(config: Config) -> Result<(), GatewayError> {
    if let Some(metrics) = &config.metrics {
        telemetry::init_metrics(metrics)?;
    }

    let ready = Arc::new(AtomicBool::new(false));
    let is_ready = ready.clone();
    let admin = AdminService::new(move || is_ready.load(Ordering::Relaxed));
    let admin_listener = config.admin_listener.clone();
    let admin_task = tokio::spawn(async move {
        if let Err(e) =
            run_http_service(&admin_listener.host, admin_listener.port, admin).await
        {
            tracing::error!(error = %e, "Admin listener failed");
        }
    });

    let resolvers = Resolvers::from_config(&config.resolver).await?;
    ready.store(true, Ordering::Relaxed);
    tracing::info!("Stack caches built, ready to serve");

    let cache: Arc<dyn EntityLookup> = resolvers.cache();
    let result = directory::api::serve(
        &config.listener.host,
        config.listener.port,
        cache,
        shutdown_signal(),
    )
    .await;

    ready.store(false, Ordering::Relaxed);
    resolvers.shutdown().await;
    admin_task.abort();
    tracing::info!("Shut down");

    Ok(result?)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Unable to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
