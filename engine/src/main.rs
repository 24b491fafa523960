use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use common_bus::BusClient;
use engine::config::{Config, PipelineConfig};
use engine::supervisor::StopMode;
use engine::{pipeline, server};
use envconfig::Envconfig;
use health::HealthRegistry;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Single-pipeline streaming ETL engine: Kafka in, ClickHouse out.
#[derive(Parser)]
#[command(name = "engine", version)]
struct Cli {
    /// Path to the pipeline JSON config
    #[arg(long)]
    config: PathBuf,

    /// Debug logging
    #[arg(short = 'd', long)]
    debug: bool,
}

fn setup_tracing(debug: bool) {
    let default = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(default.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        drop(ctrl_c.await);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_tracing(cli.debug);
    info!("Starting up...");

    let config = Config::init_from_env().context("invalid environment configuration")?;
    let pipeline_config =
        PipelineConfig::from_file(&cli.config).context("invalid pipeline config")?;

    let mut bus_config = config.bus.clone();
    if let Some(server) = &pipeline_config.stream_consumer.nats_server {
        bus_config.nats_server = server.clone();
    }
    let bus = BusClient::connect(bus_config)
        .await
        .context("bus connection failed")?;

    let registry = HealthRegistry::new("liveness");
    let _observability = server::start(registry.clone(), &config.host, config.port);

    let mut supervisor = pipeline::start(
        &bus,
        &pipeline_config,
        &registry,
        Duration::from_secs(config.liveness_deadline_seconds),
    )
    .await
    .context("pipeline start failed")?;

    let failure = tokio::select! {
        _ = shutdown_signal() => None,
        failure = supervisor.wait_for_failure() => failure,
    };

    match failure {
        Some(err) => {
            error!(error = %err, "pipeline failed, stopping operators");
            if let Err(stop_err) = supervisor.stop(StopMode::NoWait).await {
                error!(error = %stop_err, "abrupt stop reported failures");
            }
            Err(err.into())
        }
        None => {
            info!("shutdown signal received, draining");
            supervisor
                .stop(StopMode::Drain)
                .await
                .context("drain shutdown failed")?;
            info!("Shutting down");
            Ok(())
        }
    }
}
