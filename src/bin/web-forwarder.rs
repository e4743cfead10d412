//! Binary entry-point for the web forwarder.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use ws_tunnel::config::{self, ForwarderCli, ForwarderConfig};
use ws_tunnel::forwarder::WebForwarder;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = config::parse_cli::<ForwarderCli>();
    let cfg = ForwarderConfig::from(cli);

    fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(config::level_filter(cfg.log_level).into()),
        )
        .init();

    info!("HTTP     : {}", cfg.http_address);
    info!("HTTPS    : {}", cfg.https_address);
    info!("Backend  : {}", cfg.backend_address);
    info!("Trojan   : {}", cfg.trojan_address);

    let forwarder = WebForwarder::new(cfg);
    forwarder.run().await
}
