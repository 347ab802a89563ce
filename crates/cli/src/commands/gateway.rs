//! `superego gateway`: Start the HTTP API server.

use std::sync::Arc;

use superego_config::AppConfig;
use superego_flow::TracingAuditSink;

pub async fn run(
    mut config: AppConfig,
    port_override: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    let engine = super::build_engine(&config, Arc::new(TracingAuditSink)).await?;

    println!("Superego Gateway");
    println!("   Listening: http://{}:{}", config.gateway.host, config.gateway.port);
    println!("   Store:     {}", engine.store().name());

    superego_gateway::start(config, engine).await?;

    Ok(())
}
