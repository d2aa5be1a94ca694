use anyhow::Result;
use gsm_pairing_gateway::{config::GatewayConfig, run};
use gsm_telemetry::{TelemetryConfig, init_telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    let config = GatewayConfig::from_env()?;
    let telemetry = TelemetryConfig::from_env("pairing-gateway", env!("CARGO_PKG_VERSION"))
        .with_log_level(config.log_level.clone());
    init_telemetry(&telemetry)?;

    run(config).await
}
