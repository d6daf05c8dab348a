//! Main entry point for the Ephemeral Chat pairing service
//!
//! Parses the command line, loads configuration, initializes logging and runs
//! the service until SIGINT or SIGTERM.

use anyhow::Result;
use clap::Parser;
use ephemeral_chat::config::{validate_config, AppConfig};
use ephemeral_chat::service::{AppState, HealthCheck, HealthStatus};
use ephemeral_chat::types::DisconnectPolicy;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info, warn};

/// Ephemeral Chat - time-boxed 1-on-1 conversations with strangers
#[derive(Parser)]
#[command(
    name = "ephemeral-chat",
    version,
    about = "Pairs waiting participants into time-boxed 1-on-1 chat rounds",
    long_about = "Ephemeral Chat keeps a FIFO queue of connected participants, pairs them two at a \
                 time into conversations that expire after a fixed round, relays their messages \
                 over WebSocket and lets either side skip to a new partner."
)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Path to configuration file (TOML format)"
    )]
    config: Option<PathBuf>,

    #[arg(long, help = "Check that the service can be built and exit with status code")]
    health_check: bool,

    #[arg(
        short,
        long,
        value_name = "LEVEL",
        help = "Override log level (trace, debug, info, warn, error)"
    )]
    log_level: Option<String>,

    #[arg(long, value_name = "PORT", help = "Override chat API port")]
    http_port: Option<u16>,

    #[arg(long, value_name = "PORT", help = "Override metrics and health port")]
    metrics_port: Option<u16>,

    #[arg(long, value_name = "SECONDS", help = "Override round duration")]
    round_duration: Option<u64>,

    #[arg(
        long,
        value_name = "POLICY",
        help = "What to do when a participant disconnects mid-round (keep_until_round_ends, end_round)"
    )]
    disconnect_policy: Option<DisconnectPolicy>,

    #[arg(short, long, help = "Enable debug mode with verbose logging")]
    debug: bool,

    #[arg(
        long,
        help = "Validate configuration and exit without starting service"
    )]
    dry_run: bool,
}

/// Initialize structured logging with the configured level
fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Build the service without binding ports and report its components
async fn perform_health_check(config: AppConfig) -> Result<()> {
    info!("Performing health check...");

    let app_state = AppState::new(config).await?;
    let checks = HealthCheck::check_components(&app_state);

    let mut healthy = true;
    for check in &checks {
        println!("{}: {}", check.name, check.status);
        if let Some(message) = &check.message {
            println!("  {}", message);
        }
        healthy &= check.status == HealthStatus::Healthy;
    }

    std::process::exit(if healthy { 0 } else { 1 });
}

/// Wait for shutdown signals (SIGINT, SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C) signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

/// Log a health summary periodically
async fn health_check_task(app_state: Arc<AppState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));

    while app_state.is_running().await {
        interval.tick().await;
        info!("Health check: {}", app_state.summary().await);
    }
}

fn display_startup_banner(config: &AppConfig) {
    info!("💬 Ephemeral Chat Pairing Service");
    info!("   Service: {}", config.service.name);
    info!("   Log level: {}", config.service.log_level);
    info!("   Chat API: {}", config.http_addr());
    info!("   Metrics port: {}", config.service.metrics_port);
    info!(
        "   Round: {}s, skip cooldown: {}s",
        config.pairing.round_duration_seconds, config.pairing.skip_cooldown_seconds
    );
    info!("   Disconnect policy: {}", config.pairing.disconnect_policy);
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}

/// Load configuration from file or environment, then apply CLI overrides
fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::from_env()?,
    };

    if let Some(log_level) = &args.log_level {
        config.service.log_level = log_level.clone();
    }

    if args.debug {
        config.service.log_level = "debug".to_string();
    }

    if let Some(http_port) = args.http_port {
        config.service.http_port = http_port;
    }

    if let Some(metrics_port) = args.metrics_port {
        config.service.metrics_port = metrics_port;
    }

    if let Some(round_duration) = args.round_duration {
        config.pairing.round_duration_seconds = round_duration;
    }

    if let Some(policy) = args.disconnect_policy {
        config.pairing.disconnect_policy = policy;
    }

    validate_config(&config)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args).unwrap_or_else(|e| {
        eprintln!("Configuration error: {:#}", e);
        std::process::exit(1);
    });

    if let Err(e) = init_logging(&config.service.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    if args.health_check {
        return perform_health_check(config).await;
    }

    if args.dry_run {
        info!("Configuration validation successful");
        display_startup_banner(&config);
        info!("Dry run completed - exiting without starting service");
        return Ok(());
    }

    display_startup_banner(&config);

    let app_state = match AppState::new(config.clone()).await {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!("Failed to initialize application: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = app_state.start().await {
        error!("Failed to start service: {}", e);
        std::process::exit(1);
    }

    let health_task = tokio::spawn(health_check_task(app_state.clone()));

    info!("✅ Ephemeral Chat is running");
    info!("Press Ctrl+C to shutdown gracefully...");

    wait_for_shutdown_signal().await;

    info!("🛑 Shutdown signal received, beginning graceful shutdown...");
    health_task.abort();

    match tokio::time::timeout(config.shutdown_timeout(), app_state.shutdown()).await {
        Ok(Ok(())) => info!("✅ Graceful shutdown completed successfully"),
        Ok(Err(e)) => warn!("Shutdown finished with errors: {}", e),
        Err(_) => warn!("⚠️  Shutdown timeout exceeded, forcing exit"),
    }

    info!("🛑 Ephemeral Chat stopped");
    Ok(())
}
