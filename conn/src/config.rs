use std::path::Path;
use std::time::Duration;

use log::warn;
use raft::ReadOnlyOption;
use serde_derive::Deserialize;

use crate::error::{Error, Result};
use crate::pb::RaftContext;

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub id: u64,
    pub addr: String,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    StdLog,
    Term,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NodeConfig {
    pub id: u64,
    pub group: u32,
    pub addr: String,
    pub metrics_addr: Option<String>,
    /// Seed a fresh single-member cluster with this node as its voter.
    pub bootstrap: bool,
    pub peers: Vec<PeerConfig>,
    pub tick_interval_ms: u64,
    pub election_tick: usize,
    pub heartbeat_tick: usize,
    pub max_size_per_msg: u64,
    pub max_inflight_msgs: usize,
    /// Capacity of the outbound raft message queue.
    pub message_queue_size: usize,
    pub log_format: LogFormat,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            id: 1,
            group: 0,
            addr: "0.0.0.0:7080".to_string(),
            metrics_addr: None,
            bootstrap: false,
            peers: Vec::new(),
            tick_interval_ms: 100,
            election_tick: 10,
            heartbeat_tick: 3,
            max_size_per_msg: 1 << 20,
            max_inflight_msgs: 256,
            message_queue_size: 100,
            log_format: LogFormat::StdLog,
        }
    }
}

impl NodeConfig {
    /// Loads the config at `path`, falling back to defaults when the file
    /// cannot be read.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = match std::fs::read_to_string(path.as_ref()) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file {:?}, {:?}",
                    path.as_ref(),
                    e
                );
                return Ok(NodeConfig::default());
            }
        };
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: NodeConfig =
            toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
        if config.message_queue_size == 0 {
            return Err(Error::Config("message_queue_size must be positive".into()));
        }
        Ok(config)
    }

    pub fn raft_context(&self) -> RaftContext {
        RaftContext {
            id: self.id,
            group: self.group,
            addr: self.addr.clone(),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Engine config. `applied` must be the latest snapshot index so the
    /// engine never replays below it.
    pub fn raft_config(&self, applied: u64) -> Result<raft::Config> {
        let config = raft::Config {
            id: self.id,
            election_tick: self.election_tick,
            heartbeat_tick: self.heartbeat_tick,
            applied,
            max_size_per_msg: self.max_size_per_msg,
            max_inflight_msgs: self.max_inflight_msgs,
            // Lease reads need check-quorum, which makes bootstrapping flaky.
            read_only_option: ReadOnlyOption::Safe,
            pre_vote: true,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let config = NodeConfig::from_toml_str(
            r#"
            id = 2
            group = 1
            addr = "10.0.0.2:7080"
            tick_interval_ms = 20
            log_format = "term"

            [[peers]]
            id = 1
            addr = "10.0.0.1:7080"
            "#,
        )
        .unwrap();
        assert_eq!(config.id, 2);
        assert_eq!(config.log_format, LogFormat::Term);
        assert_eq!(config.election_tick, 10);
        assert_eq!(config.tick_interval(), Duration::from_millis(20));
        assert_eq!(
            config.peers,
            vec![PeerConfig {
                id: 1,
                addr: "10.0.0.1:7080".to_string()
            }]
        );
        assert_eq!(config.raft_context().group, 1);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = NodeConfig::from_toml("/nonexistent/config.toml").unwrap();
        assert_eq!(config.message_queue_size, 100);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            NodeConfig::from_toml_str("id = \"one\""),
            Err(Error::Config(_))
        ));
        assert!(NodeConfig::from_toml_str("message_queue_size = 0").is_err());

        let mut config = NodeConfig::default();
        config.heartbeat_tick = 20;
        assert!(config.raft_config(0).is_err());
        assert_eq!(NodeConfig::default().raft_config(5).unwrap().applied, 5);
    }
}
