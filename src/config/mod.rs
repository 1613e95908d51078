//! Configuration module for Tessera.

pub mod tune;

pub use self::tune::{TuneEffect, Tunables};

use crate::error::{Result, TesseraError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for a Tessera mount.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TesseraConfig {
    /// Node configuration.
    pub node: NodeConfig,
    /// Mount arguments.
    #[serde(default)]
    pub mount: MountArgs,
    /// Device geometry.
    #[serde(default)]
    pub layout: LayoutConfig,
    /// Cluster lock configuration.
    #[serde(default)]
    pub lock: LockConfig,
    /// Runtime tunables.
    #[serde(default)]
    pub tune: Tunables,
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl TesseraConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TesseraError::Config(format!("Failed to read config file: {}", e))
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            TesseraError::Config(format!("Failed to parse config: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node.id == 0 {
            return Err(TesseraError::InvalidConfig {
                field: "node.id".to_string(),
                reason: "Node ID must be non-zero".to_string(),
            });
        }

        self.layout.validate()?;

        if self.lock.max_total_locks == 0 {
            return Err(TesseraError::InvalidConfig {
                field: "lock.max_total_locks".to_string(),
                reason: "Lock table must allow at least one entry".to_string(),
            });
        }

        Ok(())
    }

    /// Create a small development configuration.
    pub fn development() -> Self {
        Self {
            node: NodeConfig {
                id: 1,
                name: "dev-node".to_string(),
            },
            mount: MountArgs {
                posix_acls: true,
                ..MountArgs::default()
            },
            layout: LayoutConfig {
                block_size: 4096,
                region_count: 4,
                region_blocks: 256,
                journal_blocks: 512,
                max_transaction_blocks: 64,
                journal_count: 1,
            },
            lock: LockConfig {
                wait_timeout: Duration::from_secs(2),
                max_total_locks: 10_000,
            },
            tune: Tunables::default(),
            observability: ObservabilityConfig {
                log_level: "debug".to_string(),
                ..ObservabilityConfig::default()
            },
        }
    }
}

/// Node-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier within the cluster.
    pub id: u64,
    /// Human-readable node name.
    pub name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 1,
            name: "tessera-node".to_string(),
        }
    }
}

/// Arguments the filesystem was mounted with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountArgs {
    pub lockproto: String,
    pub locktable: String,
    pub hostdata: String,
    pub ignore_local_fs: bool,
    pub localcaching: bool,
    pub localflocks: bool,
    pub oopses_ok: bool,
    pub upgrade: bool,
    pub num_glockd: u32,
    /// POSIX ACL support.
    pub posix_acls: bool,
    pub suiddir: bool,
}

impl Default for MountArgs {
    fn default() -> Self {
        Self {
            lockproto: "lock_dlm".to_string(),
            locktable: "cluster:tessera".to_string(),
            hostdata: String::new(),
            ignore_local_fs: false,
            localcaching: false,
            localflocks: false,
            oopses_ok: false,
            upgrade: false,
            num_glockd: 1,
            posix_acls: false,
            suiddir: false,
        }
    }
}

/// Geometry of the block device backing the mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Block size in bytes.
    pub block_size: u32,
    /// Number of allocation regions.
    pub region_count: u32,
    /// Blocks per region, including its bitmap block.
    pub region_blocks: u32,
    /// Blocks per journal.
    pub journal_blocks: u32,
    /// Largest transaction a single request may reserve.
    pub max_transaction_blocks: u32,
    /// Number of journals (one per node).
    pub journal_count: u32,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            region_count: 8,
            region_blocks: 1024,
            journal_blocks: 2048,
            max_transaction_blocks: 256,
            journal_count: 1,
        }
    }
}

impl LayoutConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two() || !(512..=65536).contains(&self.block_size) {
            return Err(TesseraError::InvalidConfig {
                field: "layout.block_size".to_string(),
                reason: "Block size must be a power of two in 512..=65536".to_string(),
            });
        }

        if self.region_count == 0 {
            return Err(TesseraError::InvalidConfig {
                field: "layout.region_count".to_string(),
                reason: "At least one region is required".to_string(),
            });
        }

        let capacity = crate::region::bitmap_capacity(self.block_size as usize);
        if self.region_blocks < 2 || (self.region_blocks as u64 - 1) > capacity {
            return Err(TesseraError::InvalidConfig {
                field: "layout.region_blocks".to_string(),
                reason: "Region bitmap must fit in a single block".to_string(),
            });
        }

        if self.journal_count == 0 {
            return Err(TesseraError::InvalidConfig {
                field: "layout.journal_count".to_string(),
                reason: "At least one journal is required".to_string(),
            });
        }

        if self.max_transaction_blocks == 0 || self.max_transaction_blocks > self.journal_blocks {
            return Err(TesseraError::InvalidConfig {
                field: "layout.max_transaction_blocks".to_string(),
                reason: "Transaction capacity must be non-zero and fit the journal".to_string(),
            });
        }

        Ok(())
    }
}

/// Cluster lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// How long a request waits for an incompatible grant to clear.
    #[serde(with = "humantime_serde")]
    pub wait_timeout: Duration,
    /// Maximum number of lock entries kept in the table.
    pub max_total_locks: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(30),
            max_total_locks: 100_000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Emit metrics through the installed `metrics` recorder.
    pub metrics_enabled: bool,
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}
