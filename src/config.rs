//! Runtime configuration for the ledger and its snapshot cache.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::storage::ScanIsolation;

/// Ledger configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// sqlx connection URL, e.g. `sqlite:coinledger.db?mode=rwc`
    pub database_url: String,

    /// Upper bound on pooled store connections
    pub max_connections: u32,

    /// Seconds between snapshot cache refreshes
    pub refresh_interval_secs: u64,

    /// Deadline for a single ledger operation, in milliseconds
    pub operation_timeout_ms: u64,

    /// Whether the three snapshot scans share one read transaction
    pub scan_isolation: ScanIsolation,

    /// Refuse to build snapshots with more users than this
    pub max_snapshot_users: Option<usize>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:coinledger.db?mode=rwc".to_string(),
            max_connections: 10,
            refresh_interval_secs: 15,
            operation_timeout_ms: 5_000,
            scan_isolation: ScanIsolation::Independent,
            max_snapshot_users: None,
        }
    }
}

impl LedgerConfig {
    /// Configuration pointing at a SQLite file, created on first use.
    pub fn for_database_path(path: &str) -> Self {
        Self {
            database_url: format!("sqlite:{}?mode=rwc", path),
            ..Self::default()
        }
    }

    /// Read a TOML file. Keys that are absent keep their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings under which no operation could ever succeed.
    pub fn validate(&self) -> Result<()> {
        if self.operation_timeout_ms == 0 {
            anyhow::bail!("operation_timeout_ms must be greater than zero");
        }
        if self.max_connections == 0 {
            anyhow::bail!("max_connections must be greater than zero");
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}
