use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "player-hub",
    author,
    version,
    about = "Relay between TV players and their remote controllers"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "PLAYER_HUB_LISTEN_ADDR", default_value = "0.0.0.0:8000")]
    pub listen_addr: String,

    /// Frames queued per connection before it is considered too slow and dropped.
    #[arg(long, env = "PLAYER_HUB_OUTBOUND_BUFFER", default_value_t = 256)]
    pub outbound_buffer: usize,

    /// Seconds between WebSocket pings sent to every connection (0 disables).
    #[arg(long, env = "PLAYER_HUB_PING_INTERVAL_SECS", default_value_t = 30)]
    pub ping_interval_secs: u64,

    /// Seconds without any inbound frame before a connection is dropped (0 disables).
    #[arg(long, env = "PLAYER_HUB_IDLE_TIMEOUT_SECS", default_value_t = 90)]
    pub idle_timeout_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "PLAYER_HUB_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    /// Export tracing spans to stdout through OpenTelemetry.
    #[arg(long, env = "PLAYER_HUB_OTEL_STDOUT", default_value_t = false)]
    pub otel_stdout: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub shutdown_grace: Duration,
    pub connection: ConnectionSettings,
}

/// Per-connection knobs shared by every socket task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub outbound_buffer: usize,
    pub ping_interval: Option<Duration>,
    pub idle_timeout: Option<Duration>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            outbound_buffer: 256,
            ping_interval: Some(Duration::from_secs(30)),
            idle_timeout: Some(Duration::from_secs(90)),
        }
    }
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.outbound_buffer == 0 {
            bail!("outbound buffer must hold at least one frame");
        }

        let ping_interval = seconds(cli.ping_interval_secs);
        let idle_timeout = seconds(cli.idle_timeout_secs);
        if let (Some(ping), Some(idle)) = (ping_interval, idle_timeout) {
            if idle <= ping {
                bail!(
                    "idle timeout ({}s) must be longer than the ping interval ({}s)",
                    idle.as_secs(),
                    ping.as_secs()
                );
            }
        }

        Ok(ServerConfig {
            listen_addr,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            connection: ConnectionSettings {
                outbound_buffer: cli.outbound_buffer,
                ping_interval,
                idle_timeout,
            },
        })
    }
}

fn seconds(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}
