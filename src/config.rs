//! Configuration and paths

use std::path::PathBuf;
use std::time::Duration;

/// Endpoints, storage location and timing constants
#[derive(Debug, Clone)]
pub struct Config {
    pub store_file: PathBuf,
    pub api_base_url: String,
    pub hub_url: String,
    /// Hub method invoked right after the handshake, with the user id as argument
    pub hub_join_method: String,
    /// Keep-alive ping period, well under the server's client timeout
    pub hub_ping_interval_secs: u64,
    pub message_poll_interval_secs: u64,
    pub status_poll_interval_secs: u64,
    pub send_timeout_secs: u64,
    /// Let the poll adopt own messages sent from another device
    pub adopt_own_from_poll: bool,
}

impl Default for Config {
    fn default() -> Self {
        let state_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".jobsearch");

        Self {
            store_file: state_dir.join("storage.json"),
            api_base_url: DEFAULT_API_URL.to_string(),
            hub_url: DEFAULT_HUB_URL.to_string(),
            hub_join_method: "JoinChat".to_string(),
            hub_ping_interval_secs: 15,
            message_poll_interval_secs: 10,
            status_poll_interval_secs: 30,
            send_timeout_secs: 10,
            adopt_own_from_poll: false,
        }
    }
}

impl Config {
    /// Default config with `JOBSEARCH_API_URL` / `JOBSEARCH_HUB_URL` applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("JOBSEARCH_API_URL") {
            config.api_base_url = url;
        }
        if let Ok(url) = std::env::var("JOBSEARCH_HUB_URL") {
            config.hub_url = url;
        }
        config
    }

    /// Create config for testing with custom paths
    pub fn for_test(temp_dir: &std::path::Path) -> Self {
        Self {
            store_file: temp_dir.join("state/storage.json"),
            api_base_url: "http://127.0.0.1:9/api".to_string(),
            hub_url: "ws://127.0.0.1:9/chatHub".to_string(),
            hub_join_method: "JoinChat".to_string(),
            hub_ping_interval_secs: 15,
            message_poll_interval_secs: 10,
            status_poll_interval_secs: 30,
            send_timeout_secs: 10,
            adopt_own_from_poll: false,
        }
    }

    pub fn message_poll_interval(&self) -> Duration {
        Duration::from_secs(self.message_poll_interval_secs)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_secs(self.status_poll_interval_secs)
    }

    pub fn hub_ping_interval(&self) -> Duration {
        Duration::from_secs(self.hub_ping_interval_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    /// Join `path` onto the API base URL without doubling slashes
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.api_base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

pub const DEFAULT_API_URL: &str = "http://localhost:5000/api";
pub const DEFAULT_HUB_URL: &str = "ws://localhost:5000/chatHub";

/// Prefix marking a locally generated placeholder id
pub const TEMP_ID_PREFIX: &str = "temp-";
