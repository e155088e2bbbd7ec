//! Hub process: accepts peers over TCP and relays their writes.
//!
//! Configured through `RELAY_*` environment variables; see
//! [`docrelay::config`]. Logging follows `RUST_LOG` (default `info`).

use anyhow::{Context, Result};
use tracing::info;

use docrelay::sync::TcpAcceptor;
use docrelay::{Hub, HubConfig};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = HubConfig::from_env().context("loading hub configuration")?;
    let hub = Hub::open(&config).context("opening hub store")?;
    let acceptor = TcpAcceptor::bind(config.listen.as_str())
        .await
        .with_context(|| format!("binding {}", config.listen))?;

    info!(
        addr = %acceptor.local_addr()?,
        location = %config.location,
        push_locations = ?config.push_locations,
        "relay hub listening"
    );
    hub.serve_until_ctrl_c(&acceptor).await?;
    Ok(())
}
