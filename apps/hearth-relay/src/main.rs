use anyhow::Result;
use clap::Parser;
use tracing::info;

use hearth_relay::telemetry::Telemetry;
use hearth_relay::{server, Cli, RelayConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = RelayConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        handshake_timeout_secs = config.handshake_timeout.as_secs(),
        linked_accounts = config.links.is_some(),
        "starting hearth-relay"
    );

    let state = server::default_state(&config).with_metrics(telemetry.metrics_handle());
    server::run(config, state).await
}
