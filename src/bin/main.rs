use anyhow::Result;
use clap::{Parser, Subcommand};
use orca_coordinator::{CoordinatorConfig, HttpProcessorClient, Orca, health::probe, registry};
use orca_coordinator::config::{HealthJsonConfig, OrcaJsonConfig};
use orca_coordinator::registry::HealthObservation;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "orca-coordinator")]
#[command(about = "Orca algorithm orchestration coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordinator HTTP API and the health monitor
    Serve {
        /// Bind address, e.g. 0.0.0.0:3335
        #[arg(long, env = "ORCA_BIND")]
        bind: Option<String>,
        #[arg(long, env = "ORCA_DB_URL")]
        db_url: Option<String>,
        /// Seconds between two health polling rounds
        #[arg(long, env = "ORCA_HEALTH_INTERVAL_SECS")]
        health_interval: Option<u64>,
        /// Bound on one health check, in seconds
        #[arg(long, env = "ORCA_HEALTH_TIMEOUT_SECS")]
        health_timeout: Option<u64>,
        /// Consecutive failed checks before a processor is marked unknown
        #[arg(long, env = "ORCA_HEALTH_FAILURE_THRESHOLD")]
        failure_threshold: Option<u32>,
        /// Bound on one ExecuteDagPart call, in seconds
        #[arg(long, env = "ORCA_DISPATCH_TIMEOUT_SECS")]
        dispatch_timeout: Option<u64>,
    },
    /// Run a single health check against a processor
    Check {
        /// Processor address, e.g. localhost:50051
        #[arg(long)]
        address: String,
        #[arg(long, default_value_t = 2)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("orca_coordinator=info".parse()?),
        )
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            bind,
            db_url,
            health_interval,
            health_timeout,
            failure_threshold,
            dispatch_timeout,
        } => {
            let mut config = CoordinatorConfig::load()?;
            config.apply(OrcaJsonConfig {
                bind,
                db_url,
                dispatch_timeout_secs: dispatch_timeout,
                health: Some(HealthJsonConfig {
                    interval_secs: health_interval,
                    timeout_secs: health_timeout,
                    failure_threshold,
                }),
            });

            let bind = config.bind.clone();
            info!("Starting coordinator on {}", bind);

            let orca = Arc::new(Orca::new(config).await?);
            let _monitor = orca.health.clone().spawn();

            let app = orca_coordinator::api::create_router(orca);
            let listener = tokio::net::TcpListener::bind(&bind).await?;
            info!("Coordinator listening on http://{}", bind);

            axum::serve(listener, app).await?;
        }
        Commands::Check { address, timeout } => {
            let address = registry::normalize_address(&address)?;
            let client = HttpProcessorClient::new();

            match probe(&client, &address, Duration::from_secs(timeout)).await {
                HealthObservation::Responded(response) => {
                    println!("Processor: {}", address);
                    println!("  Status:  {:?}", response.status);
                    if !response.message.is_empty() {
                        println!("  Message: {}", response.message);
                    }
                    if let Some(metrics) = response.metrics {
                        println!("  Active tasks: {}", metrics.active_tasks);
                        println!("  Memory:       {} bytes", metrics.memory_bytes);
                        println!("  CPU:          {:.1}%", metrics.cpu_percent);
                        println!("  Uptime:       {}s", metrics.uptime_seconds);
                    }
                }
                HealthObservation::Failed(reason) => {
                    println!("Processor {} did not answer: {}", address, reason);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
