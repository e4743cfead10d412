//! Binary entry-point for the tunnel proxy.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use ws_tunnel::config::{self, TunnelCli, TunnelConfig};
use ws_tunnel::proxy::TunnelProxy;

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Load CLI flags + JSON config ────────────────────────────────────────
    let cli = config::parse_cli::<TunnelCli>();
    let cfg = TunnelConfig::from_cli(cli)?;

    // ── 2. Init structured logging (env overrides flag) ────────────────────────
    // e.g. RUST_LOG=debug tunnel-proxy
    fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(config::level_filter(cfg.log_level).into()),
        )
        .init();

    info!("Listen   : {}", cfg.local_address);
    info!("Remote   : {}", cfg.remote_address);
    info!(
        "Mode     : {}",
        if cfg.server_proxy_mode { "server" } else { "client" }
    );
    info!("Kind     : {:?}", cfg.proxy_kind);

    // ── 3. Build and run the proxy ─────────────────────────────────────────────
    let proxy = TunnelProxy::new(cfg)?;
    proxy.run().await
}
