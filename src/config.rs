//! Configuration management
//!
//! Loads configuration from config.toml with support for:
//! - Server binding settings
//! - Store selection (embedded SQLite or PostgreSQL via DATABASE_URL)
//! - Ledger award amounts
//! - Notification TTL and proof upload limits
//! - Maintenance job intervals

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

/// Main configuration structure matching config.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub rewards: RewardsConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    pub proofs: ProofsConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Database configuration. `DATABASE_URL` selects PostgreSQL; otherwise the
/// embedded SQLite file is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub sqlite_path: PathBuf,
    #[serde(default)]
    pub max_pool_size: Option<usize>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("bounty-board.db"),
            max_pool_size: None,
        }
    }
}

/// Reputation credited on approval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardsConfig {
    pub hunter_award: i64,
    pub reporter_award: i64,
}

impl Default for RewardsConfig {
    fn default() -> Self {
        Self {
            hunter_award: crate::ledger::HUNTER_AWARD,
            reporter_award: crate::ledger::REPORTER_AWARD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    pub ttl_secs: u64,
}

impl NotificationsConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self { ttl_secs: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofsConfig {
    pub root: PathBuf,
    pub public_base_url: String,
    #[serde(default = "default_max_proof_bytes")]
    pub max_bytes: usize,
}

fn default_max_proof_bytes() -> usize {
    crate::blob::MAX_PROOF_BYTES
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// How often active bounties past expiry are persisted as expired
    pub expiry_sweep_secs: u64,
    /// How often approved confirmations with missing awards are settled
    pub reconcile_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            expiry_sweep_secs: 60,
            reconcile_secs: 300,
        }
    }
}

impl Config {
    /// Load from `path`, falling back to the embedded defaults when it is
    /// missing, then apply environment overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let mut config: Config = if path.exists() {
            let content = std::fs::read_to_string(path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            toml::from_str(DEFAULT_CONFIG).context("Failed to parse default config")?
        };

        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("BOUNTY_HOST") {
            if !host.is_empty() {
                self.server.host = host;
            }
        }
        if let Some(port) = std::env::var("BOUNTY_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            self.server.port = port;
        }
        if let Ok(path) = std::env::var("BOUNTY_SQLITE_PATH") {
            if !path.is_empty() {
                self.database.sqlite_path = PathBuf::from(path);
            }
        }
    }

    /// PostgreSQL connection string, if the server should use Postgres
    pub fn database_url(&self) -> Option<String> {
        std::env::var("DATABASE_URL").ok().filter(|url| !url.is_empty())
    }
}
