//! Configuration for the bridge.
//!
//! Configuration is a TOML file deserialized with serde. Every field has a
//! default so a minimal file (or none at all) yields a working testnet-style
//! setup; the node address is the one field operators always override.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for the bridge.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Node RPC address (host:port)
    pub node_address: String,

    /// Address the stratum listener binds to
    pub listen_address: String,

    /// Minimum share difficulty handed to a freshly connected client
    pub min_share_diff: f64,

    /// Extra-nonce width in bytes; 0 disables extra-nonces
    pub extranonce_size: u8,

    /// Upper bound on the wait between job broadcasts, in seconds.
    ///
    /// Push notifications from the node normally drive broadcasts; this
    /// timer is the fallback when notifications are dropped.
    pub block_wait_secs: u64,

    /// Solo mining: every client mines at the network difficulty
    pub solo_mining: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_address: "127.0.0.1:16210".to_string(),
            listen_address: "0.0.0.0:5555".to_string(),
            min_share_diff: 4096.0,
            extranonce_size: 0,
            block_wait_secs: 3,
            solo_mining: false,
        }
    }
}

impl Config {
    /// The fallback broadcast interval as a Duration.
    pub fn block_wait_time(&self) -> Duration {
        Duration::from_secs(self.block_wait_secs)
    }

    /// Load configuration from a TOML file.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        if config.min_share_diff <= 0.0 {
            anyhow::bail!("min_share_diff must be positive");
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.min_share_diff > 0.0);
        assert_eq!(config.extranonce_size, 0);
        assert!(!config.solo_mining);
        assert_eq!(config.block_wait_time(), Duration::from_secs(3));
    }

    #[test]
    fn parses_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            node_address = "10.0.0.5:16110"
            min_share_diff = 1000.0
            extranonce_size = 2
            solo_mining = true
            "#,
        )
        .unwrap();
        assert_eq!(config.node_address, "10.0.0.5:16110");
        assert_eq!(config.min_share_diff, 1000.0);
        assert_eq!(config.extranonce_size, 2);
        assert!(config.solo_mining);
        // Unspecified fields fall back to defaults.
        assert_eq!(config.listen_address, "0.0.0.0:5555");
        assert_eq!(config.block_wait_secs, 3);
    }
}
