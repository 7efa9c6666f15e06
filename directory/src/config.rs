use serde::Deserialize;
use std::time::Duration;

const DEFAULT_ENDPOINT: &str = "https://www.grafana.com/api";
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_COMPLETE_REFRESH_SECS: u64 = 5 * 60 * 60;
const DEFAULT_INCREMENTAL_REFRESH_SECS: u64 = 5 * 60;

/// Scheme that selects the in-memory directory instead of the HTTP one.
pub const MOCK_SCHEME: &str = "mock";

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct ClientConfig {
    /// Base URL of the directory API.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Bearer token sent with every list request.
    #[serde(default)]
    pub key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            endpoint: default_endpoint(),
            key: String::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Dry-run mode serves fixture data instead of talking to a real directory.
    pub fn is_dry_run(&self) -> bool {
        self.endpoint.starts_with(&format!("{MOCK_SCHEME}://"))
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct RefreshConfig {
    #[serde(default = "default_complete_refresh_secs")]
    pub complete_refresh_secs: u64,
    #[serde(default = "default_incremental_refresh_secs")]
    pub incremental_refresh_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        RefreshConfig {
            complete_refresh_secs: DEFAULT_COMPLETE_REFRESH_SECS,
            incremental_refresh_secs: DEFAULT_INCREMENTAL_REFRESH_SECS,
        }
    }
}

impl RefreshConfig {
    pub fn complete_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.complete_refresh_secs)
    }

    pub fn incremental_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.incremental_refresh_secs)
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.into()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_complete_refresh_secs() -> u64 {
    DEFAULT_COMPLETE_REFRESH_SECS
}

fn default_incremental_refresh_secs() -> u64 {
    DEFAULT_INCREMENTAL_REFRESH_SECS
}
