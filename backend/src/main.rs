//! Pulp Manager - Main Entry Point

use clap::Parser;

use pulp_manager_backend::{cli, error::Result, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = cli::Cli::parse();

    // Held until exit so pending spans are flushed
    let otel_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();
    let _otel_guard = telemetry::init_tracing(otel_endpoint.as_deref(), "pulp-manager");

    if let Err(e) = cli::run(cli).await {
        tracing::error!(code = e.code(), "{}", e);
        return Err(e);
    }
    Ok(())
}
