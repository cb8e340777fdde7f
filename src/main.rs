//! Volumetric Segmentation Service - Main Entry Point
//!
//! Loads the ONNX model once, builds the forward and inverse transform
//! chains from configuration and serves predictions over HTTP.

use anyhow::Result;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{info, warn};
use volseg_service::{
    cli::Cli,
    config::{AppConfig, LoggingConfig},
    metrics::{MetricsReporter, ServiceMetrics},
    models::OnnxRuntime,
    service::{announce::Announcer, http, SegmentationService},
};

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(format!("volseg_service={}", logging.level).parse()?);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Configuration comes first so the log format can follow it
    let config = AppConfig::load_with_overrides(&cli.config, cli.overrides())?;
    init_tracing(&config.logging)?;

    info!("Starting Volumetric Segmentation Service");
    info!(
        model = %config.model.path,
        input_tensor = %config.model.input_tensor,
        output_tensor = %config.model.output_tensor,
        resolution = ?config.geometry.volume_resolution,
        size = ?config.geometry.volume_size,
        intensity = ?config.intensity,
        "Configuration loaded successfully"
    );
    if config.server.api_key.is_empty() {
        warn!("No API key configured; /predict is open");
    }

    // Initialize metrics
    let metrics = Arc::new(ServiceMetrics::new());

    // Load the model once; every request shares this session
    let runtime = Arc::new(OnnxRuntime::new(&config.model)?);

    let service = Arc::new(SegmentationService::from_config(
        &config,
        runtime,
        metrics.clone(),
    ));

    // Start metrics reporter
    let metrics_clone = metrics.clone();
    let interval_secs = config.server.metrics_interval_secs;
    tokio::spawn(async move {
        let reporter = MetricsReporter::new(metrics_clone, interval_secs);
        reporter.start().await;
    });

    if config.server.announce {
        let announcer = Announcer::new(&config.server, &config.service)?;
        tokio::spawn(announcer.run());
    }

    let host: IpAddr = config.server.host.parse()?;
    let addr = SocketAddr::new(host, config.server.port);
    let app = http::router(service, &config.server);
    http::serve(app, addr).await?;

    info!("Service shutting down...");
    metrics.print_summary();

    Ok(())
}
