//! WolfQuorum Configuration
//!
//! This module provides configuration structures for a WolfQuorum
//! ensemble member.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::election::ElectionMode;
use crate::state::{LearnerType, QuorumView, ServerDescriptor, ServerId};

/// Floor of the read-only grace period while LOOKING
const MIN_READ_ONLY_GRACE: Duration = Duration::from_millis(2000);

/// Main WolfQuorum configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Ensemble configuration
    pub quorum: EnsembleConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique server id
    pub id: ServerId,

    /// Data directory holding the epoch files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Address the client listener binds to
    #[serde(default = "default_client_address")]
    pub client_address: SocketAddr,

    /// Override this node's learner type from the server list
    #[serde(default)]
    pub learner_type: Option<LearnerType>,
}

/// Ensemble configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleConfig {
    /// Length of one tick in milliseconds
    #[serde(default = "default_tick_time_ms")]
    pub tick_time_ms: u64,

    /// Ticks a learner may take to connect and sync
    #[serde(default = "default_init_limit")]
    pub init_limit: u32,

    /// Ticks a learner may fall behind
    #[serde(default = "default_sync_limit")]
    pub sync_limit: u32,

    /// Election algorithm
    #[serde(default)]
    pub election: ElectionMode,

    /// Ensemble members, this node included
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// One ensemble member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server id
    pub id: ServerId,

    /// Quorum address (host:port)
    pub address: SocketAddr,

    /// Leader election address
    #[serde(default)]
    pub election_address: Option<SocketAddr>,

    /// Participant or observer
    #[serde(default)]
    pub learner_type: LearnerType,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfquorum")
}

fn default_client_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 2181))
}

fn default_tick_time_ms() -> u64 {
    2000
}

fn default_init_limit() -> u32 {
    10
}

fn default_sync_limit() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl From<&ServerConfig> for ServerDescriptor {
    fn from(server: &ServerConfig) -> Self {
        ServerDescriptor {
            id: server.id,
            addr: server.address,
            election_addr: server.election_address,
            learner_type: server.learner_type,
        }
    }
}

impl QuorumConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: QuorumConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: QuorumConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.quorum.servers.is_empty() {
            return Err(crate::Error::Config("quorum.servers cannot be empty".into()));
        }

        let mut ids = BTreeSet::new();
        for server in &self.quorum.servers {
            if !ids.insert(server.id) {
                return Err(crate::Error::Config(format!(
                    "duplicate server id {} in quorum.servers",
                    server.id
                )));
            }
        }

        if self.quorum.tick_time_ms == 0 {
            return Err(crate::Error::Config("quorum.tick_time_ms must be positive".into()));
        }

        if self.quorum.init_limit == 0 || self.quorum.sync_limit == 0 {
            return Err(crate::Error::Config(
                "quorum.init_limit and quorum.sync_limit must be positive".into(),
            ));
        }

        if self.learner_type() == LearnerType::Participant && !ids.contains(&self.node.id) {
            return Err(crate::Error::Config(format!(
                "node.id {} is not listed in quorum.servers",
                self.node.id
            )));
        }

        Ok(())
    }

    /// Effective learner type of this node
    pub fn learner_type(&self) -> LearnerType {
        self.node.learner_type.unwrap_or_else(|| {
            self.quorum
                .servers
                .iter()
                .find(|s| s.id == self.node.id)
                .map(|s| s.learner_type)
                .unwrap_or_default()
        })
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Directory holding `currentEpoch` and `acceptedEpoch`
    pub fn snap_dir(&self) -> PathBuf {
        self.node.data_dir.join("version-2")
    }

    /// Get tick time as Duration
    pub fn tick_time(&self) -> Duration {
        Duration::from_millis(self.quorum.tick_time_ms)
    }

    /// How long LOOKING may last before read-only service starts
    pub fn read_only_grace(&self) -> Duration {
        self.tick_time().max(MIN_READ_ONLY_GRACE)
    }

    /// Build the membership view, applying the learner type override
    pub fn quorum_view(&self) -> QuorumView {
        let mut view = QuorumView::new(
            self.node.id,
            self.quorum.servers.iter().map(ServerDescriptor::from),
        );
        if let Some(learner_type) = self.node.learner_type {
            view.set_local_learner_type(learner_type);
        }
        view
    }

    /// Calculate quorum size
    pub fn quorum_size(&self) -> usize {
        self.quorum_view().quorum_size()
    }
}
