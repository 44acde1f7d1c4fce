//! Configuration loading: a TOML file layered with a `FIBRELAY__`-prefixed
//! environment overlay, the same pattern as `dxid-config::DxidConfig::load`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use fibrelay_core::Network;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("vault password not configured (set `vault.password` or the FIBRELAY__VAULT__PASSWORD environment variable)")]
    PasswordMissing,
}

/// Where the HTTP control surface binds. Defaults to loopback-only per the
/// local-key authentication model: the vault password is supplied out of
/// band, not via a login session, so the surface must not be reachable from
/// outside the host by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub poll_interval_secs: u64,
    /// Average block time assumed by `estimate_relay_timing`.
    pub avg_block_minutes: u64,
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Base URLs for the Blockstream-compatible `ChainClient` adapter, per
/// network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainClientConfig {
    pub testnet_base_url: String,
    pub mainnet_base_url: String,
}

impl ChainClientConfig {
    pub fn base_url_for(&self, network: Network) -> &str {
        match network {
            Network::Testnet => &self.testnet_base_url,
            Network::Mainnet => &self.mainnet_base_url,
        }
    }
}

/// Base URLs for the mempool.space `FeeOracle` adapter, per network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeOracleConfig {
    pub testnet_base_url: String,
    pub mainnet_base_url: String,
}

impl FeeOracleConfig {
    pub fn base_url_for(&self, network: Network) -> &str {
        match network {
            Network::Testnet => &self.testnet_base_url,
            Network::Mainnet => &self.mainnet_base_url,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// PBKDF2-HMAC-SHA256 iteration count (default 480,000), overridable
    /// so tests don't pay the full KDF cost.
    pub pbkdf2_iterations: u32,
    /// The master password for the Secret Vault. Supplied via config or,
    /// more commonly, the `FIBRELAY__VAULT__PASSWORD` environment variable
    /// so it never needs to sit in a file on disk.
    pub password: Option<String>,
}

impl VaultConfig {
    pub fn resolve_password(&self) -> Result<String, ConfigError> {
        self.password.clone().filter(|p| !p.is_empty()).ok_or(ConfigError::PasswordMissing)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FibrelayConfig {
    pub database_path: String,
    pub active_network: Network,
    pub http: HttpConfig,
    pub engine: EngineConfig,
    pub chain_client: ChainClientConfig,
    pub fee_oracle: FeeOracleConfig,
    pub vault: VaultConfig,
}

impl FibrelayConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("FIBRELAY").separator("__"));
        let cfg = builder.build().with_context(|| format!("loading config from {}", path.display()))?;
        Ok(cfg.try_deserialize()?)
    }

    /// A fully-populated config using the public Blockstream/mempool.space
    /// endpoints, written out by `fibrelay-cli init-config` as a starting
    /// point (mirrors `dxid-config::DxidConfig::example`).
    pub fn example() -> Self {
        Self {
            database_path: "fibrelay.sqlite3".into(),
            active_network: Network::Testnet,
            http: HttpConfig { bind_addr: "127.0.0.1:8420".into() },
            engine: EngineConfig { poll_interval_secs: 30, avg_block_minutes: 10 },
            chain_client: ChainClientConfig {
                testnet_base_url: "https://blockstream.info/testnet/api".into(),
                mainnet_base_url: "https://blockstream.info/api".into(),
            },
            fee_oracle: FeeOracleConfig {
                testnet_base_url: "https://mempool.space/testnet/api/v1/fees/recommended".into(),
                mainnet_base_url: "https://mempool.space/api/v1/fees/recommended".into(),
            },
            vault: VaultConfig { pbkdf2_iterations: fibrelay_crypto::ITERATIONS, password: None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_config_has_loopback_bind_addr() {
        let cfg = FibrelayConfig::example();
        assert!(cfg.http.bind_addr.starts_with("127.0.0.1"));
    }

    #[test]
    fn example_config_serializes_to_toml() {
        let cfg = FibrelayConfig::example();
        let rendered = toml::to_string_pretty(&cfg).unwrap();
        assert!(rendered.contains("database_path"));
        assert!(rendered.contains("pbkdf2_iterations"));
    }

    #[test]
    fn missing_password_is_a_typed_error() {
        let cfg = VaultConfig { pbkdf2_iterations: 1000, password: None };
        assert!(matches!(cfg.resolve_password(), Err(ConfigError::PasswordMissing)));

        let cfg = VaultConfig { pbkdf2_iterations: 1000, password: Some("hunter2".into()) };
        assert_eq!(cfg.resolve_password().unwrap(), "hunter2");
    }
}
