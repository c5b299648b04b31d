//! WolfHA - High-Availability Database Cluster Driver
//!
//! Runs the configured clusters: routes work to active members, keeps
//! persisted cluster state and re-synchronizes members that dropped out.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfha::api::HttpServer;
use wolfha::cluster::DriverRegistry;
use wolfha::config::WolfHaConfig;
use wolfha::error::{Error, Result, RoutingError};
use wolfha::sync::SynchronizationStrategy;

/// WolfHA - High-Availability Database Cluster Driver
#[derive(Parser)]
#[command(name = "wolfha")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfha.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the enabled clusters and serve the HTTP API
    Start,

    /// Run one re-activation sweep of a cluster and exit
    Sweep {
        /// Cluster name
        cluster: String,
    },

    /// Show the status of a cluster
    Status {
        /// Cluster name
        cluster: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfha.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,

    /// List the synchronization strategies
    Strategies,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => run_start(cli.config, cli.log_level).await,
        Commands::Sweep { cluster } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "compact");
            run_sweep(cli.config, cluster).await
        }
        Commands::Status { cluster } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "compact");
            run_status(cli.config, cluster).await
        }
        Commands::Init { output } => run_init(output),
        Commands::Validate => run_validate(cli.config),
        Commands::Strategies => {
            run_strategies();
            Ok(())
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Register every enabled cluster and serve until interrupted
async fn run_start(config_path: PathBuf, log_level: Option<String>) -> Result<()> {
    let config = match WolfHaConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            init_logging(log_level.as_deref().unwrap_or("info"), "pretty");
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    init_logging(
        log_level.as_deref().unwrap_or(&config.logging.level),
        &config.logging.format,
    );
    tracing::info!("Starting WolfHA with {} cluster(s)", config.enabled_clusters().count());

    let registry = Arc::new(DriverRegistry::default());
    for settings in config.enabled_clusters() {
        if let Err(e) = registry.register_settings(settings, &config.state).await {
            tracing::error!("Failed to register cluster {}: {}", settings.name, e);
            registry.shutdown().await;
            return Err(e);
        }
    }

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    let server = HttpServer::new(config.api.clone(), Arc::clone(&registry));
    let api_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.changed().await;
        };
        if let Err(e) = server.start(shutdown).await {
            tracing::error!("HTTP API error: {}", e);
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);
    if let Err(e) = api_handle.await {
        tracing::warn!("HTTP API task ended abnormally: {}", e);
    }
    registry.shutdown().await;
    tracing::info!("WolfHA stopped");
    Ok(())
}

/// Register one cluster without starting the others
async fn register_one(config_path: PathBuf, name: &str) -> Result<DriverRegistry> {
    let config = WolfHaConfig::from_file(&config_path)?;
    let settings = config
        .cluster(name)
        .ok_or_else(|| Error::from(RoutingError::UnknownCluster(name.to_string())))?;

    let registry = DriverRegistry::default();
    registry.register_settings(settings, &config.state).await?;
    Ok(registry)
}

/// Run a single sweep
async fn run_sweep(config_path: PathBuf, name: String) -> Result<()> {
    let registry = register_one(config_path, &name).await?;
    let cluster = registry.cluster(&name).await?;
    let report = cluster.sweep().await;

    println!("Sweep of cluster {}", name);
    for id in &report.activated {
        println!("  ✓ {} activated", id);
    }
    for (id, reason) in &report.failed {
        println!("  ✗ {}: {}", id, reason);
    }
    if report.activated.is_empty() && report.failed.is_empty() {
        println!("  All members already active");
    }

    registry.shutdown().await;
    Ok(())
}

/// Print cluster status
async fn run_status(config_path: PathBuf, name: String) -> Result<()> {
    let registry = register_one(config_path, &name).await?;
    let cluster = registry.cluster(&name).await?;
    let status = cluster.status().await?;

    println!("Cluster {}", status.name);
    println!("==========================");
    println!("Balancer:         {}", status.balancer.kind);
    println!("State Manager:    {}", status.state_manager);
    println!("Metadata Cache:   {}", status.metadata_cache);
    println!("Strategy:         {}", status.default_strategy);
    println!("Schedule:         {}", status.schedule);
    println!();
    println!("Members:");
    for member in &status.members {
        let last = member
            .last_synchronized
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "  {:<12} {:<8} weight={:<3} last sync: {}  ({})",
            member.id,
            if member.active { "active" } else { "inactive" },
            member.weight,
            last,
            member.location,
        );
    }

    registry.shutdown().await;
    Ok(())
}

/// Initialize a new configuration file
fn run_init(output: PathBuf) -> Result<()> {
    let example = toml::to_string_pretty(&WolfHaConfig::example())
        .map_err(|e| Error::Internal(format!("Failed to render configuration: {}", e)))?;
    let content = format!("# WolfHA Configuration\n# Generated configuration file\n\n{}", example);

    std::fs::write(&output, content)?;
    println!("Configuration written to {:?}", output);
    println!("Edit the member locations and credentials, then run: wolfha start");
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfHaConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            for cluster in &config.clusters {
                println!(
                    "  Cluster {}: {} member(s), {} balancer, {} state{}",
                    cluster.name,
                    cluster.databases.len(),
                    cluster.balancer,
                    cluster.state_manager,
                    if cluster.enabled { "" } else { " (disabled)" },
                );
            }
            println!("  API: {}", if config.api.enabled { config.api.bind_address.as_str() } else { "disabled" });
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// List the synchronization strategies
fn run_strategies() {
    for strategy in SynchronizationStrategy::catalog() {
        println!("{:<18} {}", strategy.id(), strategy.description());
    }
}
