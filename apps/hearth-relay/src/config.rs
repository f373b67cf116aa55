use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

use crate::sync::LinkedAccounts;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub heartbeat_interval: Duration,
    pub handshake_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Listener for service-to-service routes. When unset they share `listen_addr`.
    pub internal_addr: Option<SocketAddr>,
    /// Account links present at startup; invitations add more at runtime.
    pub links: Option<LinkedAccounts>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8787)),
            heartbeat_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(2),
            internal_addr: None,
            links: None,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "hearth-relay",
    author,
    version,
    about = "Live sync relay for Hearth household devices"
)]
pub struct Cli {
    /// Address to bind the HTTP and WebSocket listener to.
    #[arg(long, env = "HEARTH_RELAY_LISTEN_ADDR", default_value = "127.0.0.1:8787")]
    pub listen_addr: String,

    /// Seconds between heartbeat sweeps.
    #[arg(long, env = "HEARTH_RELAY_HEARTBEAT_SECS", default_value_t = 30)]
    pub heartbeat_secs: u64,

    /// Seconds a new socket has to send USER_REGISTRATION.
    #[arg(long, env = "HEARTH_RELAY_HANDSHAKE_TIMEOUT_SECS", default_value_t = 10)]
    pub handshake_timeout_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "HEARTH_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,

    /// Separate address for `/sync/notify`, keeping it off the public listener.
    #[arg(long, env = "HEARTH_RELAY_INTERNAL_ADDR")]
    pub internal_addr: Option<String>,

    /// Linked accounts, e.g. `alice=bob,carol;dave=erin`.
    #[arg(long, env = "HEARTH_RELAY_LINKS")]
    pub links: Option<String>,
}

impl TryFrom<Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        let internal_addr = cli
            .internal_addr
            .as_deref()
            .map(|addr| {
                addr.parse::<SocketAddr>()
                    .with_context(|| format!("invalid internal address: {addr}"))
            })
            .transpose()?;
        if internal_addr == Some(listen_addr) {
            bail!("internal address must differ from the listen address");
        }
        if cli.heartbeat_secs == 0 {
            bail!("heartbeat interval must be at least one second");
        }
        if cli.handshake_timeout_secs == 0 {
            bail!("handshake timeout must be at least one second");
        }
        let links = match cli.links.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(spec) => Some(
                spec.parse::<LinkedAccounts>()
                    .with_context(|| format!("invalid HEARTH_RELAY_LINKS value: {spec}"))?,
            ),
        };
        Ok(RelayConfig {
            listen_addr,
            heartbeat_interval: Duration::from_secs(cli.heartbeat_secs),
            handshake_timeout: Duration::from_secs(cli.handshake_timeout_secs),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            internal_addr,
            links,
        })
    }
}
