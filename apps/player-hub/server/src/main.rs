use anyhow::Result;
use clap::Parser;
use player_hub_server::{
    config::{Cli, ServerConfig},
    telemetry::Telemetry,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = Telemetry::init(cli.otel_stdout)?;
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        outbound_buffer = config.connection.outbound_buffer,
        ping_interval = ?config.connection.ping_interval,
        idle_timeout = ?config.connection.idle_timeout,
        "starting player-hub"
    );

    player_hub_server::run(config, Some(telemetry.metrics_handle())).await
}
