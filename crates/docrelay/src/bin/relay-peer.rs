//! Peer process: replicates with a hub and writes documents read from stdin.
//!
//! Each stdin line is one JSON object:
//!
//! ```text
//! {"collection": "sites", "document": {"_id": {"$oid": "507f191e810c19729de860ea"}, "name": "x"}}
//! ```
//!
//! Configured through `RELAY_*` environment variables; see
//! [`docrelay::config`]. Logging follows `RUST_LOG` (default `info`).

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use docrelay::sync::TcpConnector;
use docrelay::{Peer, PeerConfig};

#[derive(Debug, Deserialize)]
struct WriteRequest {
    collection: String,
    document: serde_json::Value,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

async fn read_writes(peer: Peer<docrelay::store::SqliteStore>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: WriteRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(error) => {
                warn!(%error, "skipping malformed input line");
                continue;
            }
        };
        match peer.write_json(&request.collection, &request.document).await {
            Ok((id, queue_id)) => info!(collection = %request.collection, %id, %queue_id, "queued"),
            Err(error) => warn!(collection = %request.collection, %error, "write failed"),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = PeerConfig::from_env().context("loading peer configuration")?;
    let peer = Peer::open(&config).context("opening peer store")?;
    let connector = TcpConnector::new(config.hub_addr.clone());

    info!(
        location = %config.location,
        hub = %config.hub_addr,
        pending = peer.pending().await?,
        "relay peer starting"
    );

    let writer = tokio::spawn(read_writes(peer.clone()));
    let shutdown = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(?error, "failed to install ctrl-c handler");
        }
    };
    let result = peer.run(&connector, shutdown).await;
    writer.abort();
    result?;
    Ok(())
}
