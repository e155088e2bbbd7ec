//! Hub and peer configuration.
//!
//! Both configs have working defaults and can be loaded from `RELAY_*`
//! environment variables:
//!
//! | variable | hub | peer | meaning |
//! |---|---|---|---|
//! | `RELAY_DB` | x | x | SQLite path, `:memory:` for a throwaway store |
//! | `RELAY_LOCATION` | x | x | this node's location (required for peers) |
//! | `RELAY_LISTEN` | x | | address to accept peers on |
//! | `RELAY_PUSH_LOCATIONS` | x | | comma-separated fan-out locations |
//! | `RELAY_HUB_ADDR` | | x | hub address to dial |
//! | `RELAY_HUB_LOCATION` | | x | the hub's location name |
//! | `RELAY_RECONNECT_MS` | | x | delay between connection attempts |
//! | `RELAY_MAX_RECONNECTS` | | x | failed attempts before giving up, `unlimited` to never stop |
//! | `RELAY_POLL_MS` | x | x | idle poll interval |
//! | `RELAY_ACK_TIMEOUT_MS` | x | x | per-delivery ack timeout |
//! | `RELAY_CLAIM_LEASE_MS` | x | x | claim lease on an in-flight entry |
//! | `RELAY_MAX_ATTEMPTS` | x | x | rejections before an entry is dead-lettered |
//! | `RELAY_LEGACY_HEX` | x | x | treat bare 24-hex strings as identifiers |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use docrelay_core::{CodecConfig, Location};
use docrelay_sync::PumpConfig;

use crate::error::{RelayError, Result};

/// Database path meaning "no file, keep everything in memory".
pub const MEMORY_DB: &str = ":memory:";

/// Location name a hub uses unless configured otherwise.
pub const DEFAULT_HUB_LOCATION: &str = "hub";

const DEFAULT_LISTEN: &str = "127.0.0.1:7700";

/// Hub settings.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// SQLite database path, or [`MEMORY_DB`].
    pub db_path: PathBuf,
    /// Address to accept peers on.
    pub listen: String,
    /// The hub's own location. Never a fan-out destination.
    pub location: Location,
    /// Locations that receive every ingested document.
    pub push_locations: Vec<Location>,
    pub pump: PumpConfig,
    pub codec: CodecConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("relay-hub.db"),
            listen: DEFAULT_LISTEN.to_string(),
            location: Location::from(DEFAULT_HUB_LOCATION),
            push_locations: Vec::new(),
            pump: PumpConfig::default(),
            codec: CodecConfig::default(),
        }
    }
}

impl HubConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from any key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(path) = lookup("RELAY_DB") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(listen) = lookup("RELAY_LISTEN") {
            config.listen = listen;
        }
        if let Some(location) = lookup("RELAY_LOCATION") {
            config.location = parse_location("RELAY_LOCATION", &location)?;
        }
        if let Some(list) = lookup("RELAY_PUSH_LOCATIONS") {
            config.push_locations = parse_location_list(&list);
        }
        apply_pump(&lookup, &mut config.pump)?;
        apply_codec(&lookup, &mut config.codec)?;
        Ok(config)
    }
}

/// Peer settings.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// SQLite database path, or [`MEMORY_DB`].
    pub db_path: PathBuf,
    /// Hub address (`host:port`).
    pub hub_addr: String,
    /// This peer's location.
    pub location: Location,
    /// Destination of everything this peer writes.
    pub hub_location: Location,
    pub pump: PumpConfig,
    pub codec: CodecConfig,
    /// Wait between connection attempts.
    pub reconnect_delay: Duration,
    /// Consecutive failed attempts before giving up. `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
}

impl PeerConfig {
    /// Defaults for a peer at `location`.
    pub fn new(location: impl Into<Location>) -> Self {
        Self {
            db_path: PathBuf::from("relay-peer.db"),
            hub_addr: DEFAULT_LISTEN.to_string(),
            location: location.into(),
            hub_location: Location::from(DEFAULT_HUB_LOCATION),
            pump: PumpConfig::default(),
            codec: CodecConfig::default(),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_attempts: Some(5),
        }
    }

    /// Load from the process environment. `RELAY_LOCATION` is required.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from any key lookup. `RELAY_LOCATION` is required.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let location = lookup("RELAY_LOCATION")
            .ok_or_else(|| RelayError::Config("RELAY_LOCATION is not set".into()))?;
        let mut config = Self::new(parse_location("RELAY_LOCATION", &location)?);

        if let Some(path) = lookup("RELAY_DB") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(addr) = lookup("RELAY_HUB_ADDR") {
            config.hub_addr = addr;
        }
        if let Some(hub) = lookup("RELAY_HUB_LOCATION") {
            config.hub_location = parse_location("RELAY_HUB_LOCATION", &hub)?;
        }
        if let Some(ms) = lookup("RELAY_RECONNECT_MS") {
            config.reconnect_delay = parse_millis("RELAY_RECONNECT_MS", &ms)?;
        }
        if let Some(max) = lookup("RELAY_MAX_RECONNECTS") {
            config.max_reconnect_attempts = if max.trim().eq_ignore_ascii_case("unlimited") {
                None
            } else {
                Some(parse_number("RELAY_MAX_RECONNECTS", &max)?)
            };
        }
        if config.hub_location == config.location {
            return Err(RelayError::Config(format!(
                "peer location {} equals the hub location",
                config.location
            )));
        }
        apply_pump(&lookup, &mut config.pump)?;
        apply_codec(&lookup, &mut config.codec)?;
        Ok(config)
    }
}

fn apply_pump<F>(lookup: &F, pump: &mut PumpConfig) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(ms) = lookup("RELAY_POLL_MS") {
        pump.poll_interval = parse_millis("RELAY_POLL_MS", &ms)?;
    }
    if let Some(ms) = lookup("RELAY_ACK_TIMEOUT_MS") {
        pump.ack_timeout = parse_millis("RELAY_ACK_TIMEOUT_MS", &ms)?;
    }
    if let Some(ms) = lookup("RELAY_CLAIM_LEASE_MS") {
        pump.claim_lease = parse_millis("RELAY_CLAIM_LEASE_MS", &ms)?;
    }
    if let Some(max) = lookup("RELAY_MAX_ATTEMPTS") {
        pump.retry.max_attempts = parse_number("RELAY_MAX_ATTEMPTS", &max)?;
    }
    if pump.claim_lease <= pump.ack_timeout {
        return Err(RelayError::Config(format!(
            "claim lease ({:?}) must exceed the ack timeout ({:?})",
            pump.claim_lease, pump.ack_timeout
        )));
    }
    Ok(())
}

fn apply_codec<F>(lookup: &F, codec: &mut CodecConfig) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(flag) = lookup("RELAY_LEGACY_HEX") {
        codec.legacy_hex_strings = parse_bool("RELAY_LEGACY_HEX", &flag)?;
    }
    Ok(())
}

fn parse_location(key: &str, raw: &str) -> Result<Location> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(RelayError::Config(format!("{key} is empty")));
    }
    Ok(Location::from(trimmed))
}

fn parse_location_list(raw: &str) -> Vec<Location> {
    let mut locations: Vec<Location> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Location::from)
        .collect();
    locations.sort();
    locations.dedup();
    locations
}

fn parse_number<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| RelayError::Config(format!("{key}: not a number: {raw:?}")))
}

fn parse_millis(key: &str, raw: &str) -> Result<Duration> {
    parse_number::<u64>(key, raw).map(Duration::from_millis)
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(RelayError::Config(format!("{key}: not a boolean: {raw:?}"))),
    }
}
