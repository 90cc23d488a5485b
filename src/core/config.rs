use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TCP_PORT: u16 = 8001;
pub const DEFAULT_DISCOVERY_PORT: u16 = 48999;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// TCP port serving file transfers and peer messages.
    pub tcp_port: u16,
    /// UDP port for HELLO/ASSIGN_ID/NEW_NODE broadcasts.
    pub discovery_port: u16,
    /// Directory replicated between peers.
    pub shared_dir: PathBuf,
    /// Directory holding the operation log, retry queue and peer snapshot.
    pub state_dir: PathBuf,
    /// How often an unassigned node re-broadcasts HELLO.
    pub hello_interval: Duration,
    /// How long a node waits for an ID before electing itself.
    pub election_grace: Duration,
    /// Immediate attempts per send before the transfer is queued.
    pub send_attempts: u32,
    /// Timeout for dialing a peer.
    pub dial_timeout: Duration,
    /// Pause between retry worker passes.
    pub retry_interval: Duration,
    /// Total attempts a queued task gets before it is abandoned.
    pub max_task_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tcp_port: DEFAULT_TCP_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            shared_dir: PathBuf::from("shared"),
            state_dir: PathBuf::from("state"),
            hello_interval: Duration::from_secs(5),
            election_grace: Duration::from_secs(5),
            send_attempts: 3,
            dial_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_secs(10),
            max_task_retries: 12,
        }
    }
}

impl Config {
    /// Override the discovery port from `DISCOVERY_PORT`, when set to a
    /// valid port number.
    pub fn apply_env(mut self) -> Self {
        if let Ok(raw) = std::env::var("DISCOVERY_PORT") {
            match raw.parse::<u16>() {
                Ok(port) if port > 0 => self.discovery_port = port,
                _ => log::warn!("Ignoring invalid DISCOVERY_PORT value {:?}", raw),
            }
        }
        self
    }

    pub fn oplog_path(&self) -> PathBuf {
        self.state_dir.join("oplog.json")
    }

    pub fn retry_queue_path(&self) -> PathBuf {
        self.state_dir.join("retry_queue.json")
    }

    pub fn peers_path(&self) -> PathBuf {
        self.state_dir.join("peers.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.tcp_port, 8001);
        assert_eq!(config.discovery_port, 48999);
        assert_eq!(config.send_attempts, 3);
        assert_eq!(config.oplog_path(), PathBuf::from("state/oplog.json"));
    }
}
