use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use wrn_core::{NodeId, NodeRole, Result, WrenError};

/// Flat server configuration. Every field has a default so a bare
/// `wren --node-id 1` runs a single-node cluster out of the box.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_id: NodeId,
    /// Client-facing listener.
    pub listen_addr: SocketAddr,
    /// Node-to-node RPC listener.
    pub cluster_addr: SocketAddr,
    pub data_dir: PathBuf,
    /// `replica` joins slot groups; `proxy` only terminates sockets.
    #[serde(default = "default_role")]
    pub role: String,
    /// Peer declarations, `id@host:port` or `id@host:port@proxy`.
    #[serde(default)]
    pub peers: Vec<String>,

    #[serde(default = "default_slot_count")]
    pub slot_count: u32,
    #[serde(default = "default_replica_count")]
    pub slot_replica_count: usize,
    #[serde(default = "default_replica_count")]
    pub channel_replica_count: usize,

    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval_tick")]
    pub heartbeat_interval_tick: u64,
    #[serde(default = "default_election_interval_tick")]
    pub election_interval_tick: u64,
    #[serde(default = "default_pong_max_tick")]
    pub pong_max_tick: u64,
    #[serde(default = "default_leader_timeout_max_tick")]
    pub leader_timeout_max_tick: u64,

    #[serde(default = "default_sub_count")]
    pub channel_sub_count: usize,
    #[serde(default = "default_sub_count")]
    pub user_sub_count: usize,
    #[serde(default = "default_user_node_ping_tick")]
    pub user_node_ping_tick: u64,
    #[serde(default = "default_user_node_pong_timeout_tick")]
    pub user_node_pong_timeout_tick: u64,
    #[serde(default = "default_channel_deadline_tick")]
    pub channel_deadline_tick: u64,
    #[serde(default = "default_check_user_leader_interval_tick")]
    pub check_user_leader_interval_tick: u64,
    #[serde(default = "default_user_process_interval_tick")]
    pub user_process_interval_tick: u64,
    /// Per-user queue byte budget; zero is unlimited.
    #[serde(default)]
    pub user_msg_queue_max_size: u64,

    #[serde(default = "default_deliver_count")]
    pub deliver_count: usize,
    #[serde(default = "default_deliver_max_retry")]
    pub deliver_max_retry: u32,
    #[serde(default = "default_max_deliver_size_per_node")]
    pub max_deliver_size_per_node: u64,

    #[serde(default = "default_message_retry_interval_secs")]
    pub message_retry_interval_secs: u64,
    #[serde(default = "default_message_retry_max_count")]
    pub message_retry_max_count: u32,
    #[serde(default = "default_message_retry_scan_interval_secs")]
    pub message_retry_scan_interval_secs: u64,
    #[serde(default = "default_message_retry_worker_count")]
    pub message_retry_worker_count: usize,

    #[serde(default = "default_auth_pool_size")]
    pub auth_pool_size: usize,
    #[serde(default = "default_conn_idle_time_secs")]
    pub conn_idle_time_secs: u64,
    #[serde(default = "default_req_timeout_secs")]
    pub req_timeout_secs: u64,

    #[serde(default = "default_max_uncommitted_log_size")]
    pub max_uncommitted_log_size: u64,
    #[serde(default = "default_sync_limit_size")]
    pub sync_limit_size: u64,
    #[serde(default = "default_learner_min_log_gap")]
    pub learner_to_follower_min_log_gap: u64,

    #[serde(default = "default_shard_num")]
    pub shard_num: usize,
    #[serde(default = "default_shard_num")]
    pub slot_shard_num: usize,
}

fn default_role() -> String {
    "replica".into()
}
fn default_slot_count() -> u32 {
    64
}
fn default_replica_count() -> usize {
    3
}
fn default_tick_interval_ms() -> u64 {
    150
}
fn default_heartbeat_interval_tick() -> u64 {
    1
}
fn default_election_interval_tick() -> u64 {
    10
}
fn default_pong_max_tick() -> u64 {
    30
}
fn default_leader_timeout_max_tick() -> u64 {
    25
}
fn default_sub_count() -> usize {
    64
}
fn default_user_node_ping_tick() -> u64 {
    100
}
fn default_user_node_pong_timeout_tick() -> u64 {
    500
}
fn default_channel_deadline_tick() -> u64 {
    600
}
fn default_check_user_leader_interval_tick() -> u64 {
    10
}
fn default_user_process_interval_tick() -> u64 {
    1
}
fn default_deliver_count() -> usize {
    32
}
fn default_deliver_max_retry() -> u32 {
    10
}
fn default_max_deliver_size_per_node() -> u64 {
    5 * 1024 * 1024
}
fn default_message_retry_interval_secs() -> u64 {
    60
}
fn default_message_retry_max_count() -> u32 {
    5
}
fn default_message_retry_scan_interval_secs() -> u64 {
    5
}
fn default_message_retry_worker_count() -> usize {
    24
}
fn default_auth_pool_size() -> usize {
    100
}
fn default_conn_idle_time_secs() -> u64 {
    180
}
fn default_req_timeout_secs() -> u64 {
    10
}
fn default_max_uncommitted_log_size() -> u64 {
    32 * 1024 * 1024
}
fn default_sync_limit_size() -> u64 {
    4 * 1024 * 1024
}
fn default_learner_min_log_gap() -> u64 {
    100
}
fn default_shard_num() -> usize {
    8
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: 1,
            listen_addr: "0.0.0.0:5100".parse().unwrap_or_else(|_| unreachable!()),
            cluster_addr: "0.0.0.0:5101".parse().unwrap_or_else(|_| unreachable!()),
            data_dir: PathBuf::from("./data"),
            role: default_role(),
            peers: Vec::new(),
            slot_count: default_slot_count(),
            slot_replica_count: default_replica_count(),
            channel_replica_count: default_replica_count(),
            tick_interval_ms: default_tick_interval_ms(),
            heartbeat_interval_tick: default_heartbeat_interval_tick(),
            election_interval_tick: default_election_interval_tick(),
            pong_max_tick: default_pong_max_tick(),
            leader_timeout_max_tick: default_leader_timeout_max_tick(),
            channel_sub_count: default_sub_count(),
            user_sub_count: default_sub_count(),
            user_node_ping_tick: default_user_node_ping_tick(),
            user_node_pong_timeout_tick: default_user_node_pong_timeout_tick(),
            channel_deadline_tick: default_channel_deadline_tick(),
            check_user_leader_interval_tick: default_check_user_leader_interval_tick(),
            user_process_interval_tick: default_user_process_interval_tick(),
            user_msg_queue_max_size: 0,
            deliver_count: default_deliver_count(),
            deliver_max_retry: default_deliver_max_retry(),
            max_deliver_size_per_node: default_max_deliver_size_per_node(),
            message_retry_interval_secs: default_message_retry_interval_secs(),
            message_retry_max_count: default_message_retry_max_count(),
            message_retry_scan_interval_secs: default_message_retry_scan_interval_secs(),
            message_retry_worker_count: default_message_retry_worker_count(),
            auth_pool_size: default_auth_pool_size(),
            conn_idle_time_secs: default_conn_idle_time_secs(),
            req_timeout_secs: default_req_timeout_secs(),
            max_uncommitted_log_size: default_max_uncommitted_log_size(),
            sync_limit_size: default_sync_limit_size(),
            learner_to_follower_min_log_gap: default_learner_min_log_gap(),
            shard_num: default_shard_num(),
            slot_shard_num: default_shard_num(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "toml" => toml::from_str(&content)
                .map_err(|e| WrenError::Config(format!("TOML parse error: {e}"))),
            "json" => serde_json::from_str(&content)
                .map_err(|e| WrenError::Config(format!("JSON parse error: {e}"))),
            _ => Err(WrenError::Config(format!(
                "unknown config file extension: {ext}"
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id == 0 || self.node_id > wrn_core::MAX_NODE_ID {
            return Err(WrenError::Config(format!(
                "node_id {} out of range 1..={}",
                self.node_id,
                wrn_core::MAX_NODE_ID
            )));
        }
        if self.slot_count == 0 {
            return Err(WrenError::Config("slot_count must be positive".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn node_role(&self) -> NodeRole {
        if self.role.eq_ignore_ascii_case("proxy") {
            NodeRole::Proxy
        } else {
            NodeRole::Replica
        }
    }

    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    #[must_use]
    pub fn req_timeout(&self) -> Duration {
        Duration::from_secs(self.req_timeout_secs.max(1))
    }

    #[must_use]
    pub fn conn_idle_time(&self) -> Duration {
        Duration::from_secs(self.conn_idle_time_secs.max(1))
    }

    #[must_use]
    pub fn message_retry_interval(&self) -> Duration {
        Duration::from_secs(self.message_retry_interval_secs.max(1))
    }

    #[must_use]
    pub fn message_retry_scan_interval(&self) -> Duration {
        Duration::from_secs(self.message_retry_scan_interval_secs.max(1))
    }

    /// Parse a peer declaration: `id@host:port` with an optional `@proxy`
    /// role suffix.
    pub fn parse_peer(decl: &str) -> Result<(NodeId, String, NodeRole)> {
        let mut parts = decl.splitn(3, '@');
        let id = parts
            .next()
            .and_then(|p| p.parse::<NodeId>().ok())
            .ok_or_else(|| WrenError::Config(format!("bad peer declaration: {decl}")))?;
        let addr = parts
            .next()
            .ok_or_else(|| WrenError::Config(format!("bad peer declaration: {decl}")))?
            .to_string();
        let role = match parts.next() {
            Some(role) if role.eq_ignore_ascii_case("proxy") => NodeRole::Proxy,
            _ => NodeRole::Replica,
        };
        Ok((id, addr, role))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.slot_count, 64);
        assert_eq!(cfg.slot_replica_count, 3);
        assert_eq!(cfg.tick_interval_ms, 150);
        assert_eq!(cfg.election_interval_tick, 10);
        assert_eq!(cfg.channel_deadline_tick, 600);
        assert_eq!(cfg.deliver_count, 32);
        assert_eq!(cfg.max_deliver_size_per_node, 5 * 1024 * 1024);
        assert_eq!(cfg.message_retry_max_count, 5);
        assert_eq!(cfg.auth_pool_size, 100);
        assert_eq!(cfg.conn_idle_time_secs, 180);
        assert_eq!(cfg.req_timeout_secs, 10);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_gets_defaults() {
        let cfg: Config = toml::from_str(
            r#"
node_id = 3
listen_addr = "127.0.0.1:5100"
cluster_addr = "127.0.0.1:5101"
data_dir = "/tmp/wren-3"
"#,
        )
        .unwrap();
        assert_eq!(cfg.node_id, 3);
        assert_eq!(cfg.user_sub_count, 64);
        assert_eq!(cfg.message_retry_interval_secs, 60);
    }

    #[test]
    fn test_parse_peer() {
        let (id, addr, role) = Config::parse_peer("2@10.0.0.2:5101").unwrap();
        assert_eq!(id, 2);
        assert_eq!(addr, "10.0.0.2:5101");
        assert_eq!(role, NodeRole::Replica);

        let (_, _, role) = Config::parse_peer("4@10.0.0.4:5101@proxy").unwrap();
        assert_eq!(role, NodeRole::Proxy);

        assert!(Config::parse_peer("nonsense").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_node_id() {
        let cfg = Config {
            node_id: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = Config {
            node_id: 1024,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
