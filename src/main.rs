use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

mod chat;
mod config;
mod coordinator;
mod error;
mod interactions;
mod media;
mod model;
mod queue;
mod server;
mod session;
mod settings;
mod storage;
mod ui;

#[cfg(test)]
mod test_utils;

use config::CadenceConfig;
use server::CadenceServer;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "A multi-guild voice audio server for Discord, written in Rust")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "application.yml")]
    config: PathBuf,

    /// Enable verbose logging (info level)
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging (debug level)
    #[arg(short, long)]
    debug: bool,

    /// Enable trace logging (trace level) - very verbose
    #[arg(short, long)]
    trace: bool,

    /// Custom log level (overrides verbose/debug/trace)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Show timestamps in logs
    #[arg(long)]
    timestamps: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(&args)?;

    info!("Starting Cadence v{}", env!("CARGO_PKG_VERSION"));

    // A missing config file is fine; the environment carries the secrets.
    let config = if args.config.exists() {
        info!("Loading configuration from: {}", args.config.display());
        CadenceConfig::load(&args.config).await?
    } else {
        info!("No config file found, using environment configuration");
        CadenceConfig::from_env()
    };

    if let Err(e) = config.validate() {
        error!("fatal startup error: {e}");
        std::process::exit(1);
    }

    let server = match CadenceServer::new(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("fatal startup error: {e}");
            std::process::exit(1);
        }
    };
    server.run().await?;

    Ok(())
}

fn init_tracing(args: &Args) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    // Priority: custom > trace > debug > verbose > default.
    let log_level = if let Some(ref level) = args.log_level {
        level.clone()
    } else if args.trace {
        "trace".to_string()
    } else if args.debug {
        "debug".to_string()
    } else {
        "info".to_string()
    };

    // RUST_LOG wins unless a CLI flag overrides it.
    let filter = if let Ok(env_filter) = std::env::var("RUST_LOG") {
        if args.log_level.is_some() || args.trace || args.debug || args.verbose {
            create_filter(&log_level)
        } else {
            EnvFilter::new(env_filter)
        }
    } else {
        create_filter(&log_level)
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(!args.no_color)
        .with_file(args.trace)
        .with_line_number(args.trace);

    let registry = tracing_subscriber::registry().with(filter);
    if args.timestamps {
        registry.with(fmt_layer).init();
    } else {
        registry.with(fmt_layer.without_time()).init();
    }

    Ok(())
}

fn create_filter(level: &str) -> tracing_subscriber::EnvFilter {
    let base_filter = match level.to_lowercase().as_str() {
        "trace" => "cadence=trace,trace",
        "debug" => "cadence=debug,info",
        "info" => "cadence=info,warn",
        "warn" => "cadence=warn,error",
        "error" => "cadence=error",
        _ => {
            eprintln!("Warning: Unknown log level '{level}', defaulting to 'info'");
            "cadence=info,warn"
        }
    };

    tracing_subscriber::EnvFilter::new(base_filter)
}
