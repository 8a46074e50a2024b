//! TOML configuration for lanspeed.
//!
//! Layered model with sensible compiled-in defaults, an environment variable
//! override for the config file path, and a standard filesystem location.
//! Every field can be omitted; missing sections fall back to their defaults.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration shared by the server and client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in the `LANSPEED_CONFIG` environment variable.
    /// 2. `/etc/lanspeed/lanspeed.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("LANSPEED_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "LANSPEED_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new("/etc/lanspeed/lanspeed.toml");
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Offer broadcast and discovery listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Well-known UDP port offers are broadcast to and received on.
    pub port: u16,
    /// Destination address for offer broadcasts.
    pub broadcast_address: String,
    /// Seconds between consecutive offer broadcasts.
    pub offer_interval_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: 13117,
            broadcast_address: "255.255.255.255".to_string(),
            offer_interval_secs: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Transfer
// ---------------------------------------------------------------------------

/// Tuning knobs for the TCP and UDP transfer paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Payload bytes per UDP segment. Trades packet count against
    /// per-packet overhead.
    pub segment_size: u64,
    /// Bytes per TCP write/read chunk.
    pub chunk_size: usize,
    /// How long the server waits for the TCP size line before giving up.
    pub size_line_timeout_secs: u64,
    /// Client TCP connect timeout.
    pub connect_timeout_secs: u64,
    /// UDP end-of-transfer window: the client stops once this long passes
    /// with no new packet. This silence heuristic is the only completion
    /// signal on the wire.
    pub inactivity_timeout_ms: u64,
    /// Pause between consecutive UDP segments on the server, to avoid
    /// flooding local send buffers. Zero disables the pause.
    pub inter_packet_delay_us: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            segment_size: 1024,
            chunk_size: 8192,
            size_line_timeout_secs: 2,
            connect_timeout_secs: 5,
            inactivity_timeout_ms: 1000,
            inter_packet_delay_us: 1000,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
