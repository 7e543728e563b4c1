use crate::core::address::Network;
use crate::error::{EngineError, Result};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_DATABASE: &str = "./data/assurance";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ELECTRUM_SERVERS: [&str; 4] = [
    "bch.imaginary.cash:50001",
    "electroncash.de:50001",
    "electroncash.dk:50001",
    "electrum.imaginary.cash:50001",
];

const LISTEN_ADDR_KEY: &str = "ASSURANCE_LISTEN_ADDR";
const DATABASE_KEY: &str = "ASSURANCE_DATABASE";
const NETWORK_KEY: &str = "ASSURANCE_NETWORK";
const ELECTRUM_SERVERS_KEY: &str = "ASSURANCE_ELECTRUM_SERVERS";
const REQUEST_TIMEOUT_KEY: &str = "ASSURANCE_REQUEST_TIMEOUT_SECS";
const LOG_LEVEL_KEY: &str = "ASSURANCE_LOG_LEVEL";

/// Service settings: defaults, then an optional TOML file, then the
/// `ASSURANCE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub listen_addr: String,
    pub database: PathBuf,
    pub network: Network,
    pub electrum_servers: Vec<String>,
    pub request_timeout_secs: u64,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            database: PathBuf::from(DEFAULT_DATABASE),
            network: Network::Mainnet,
            electrum_servers: DEFAULT_ELECTRUM_SERVERS
                .iter()
                .map(|server| server.to_string())
                .collect(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Settings> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Settings::default(),
        };
        settings.apply_overrides(|key| env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Settings> {
        let text = fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Ok(toml::from_str(&text)?)
    }

    /// Apply overrides from `lookup`, normally the process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup(LISTEN_ADDR_KEY) {
            self.listen_addr = addr;
        }
        if let Some(database) = lookup(DATABASE_KEY) {
            self.database = PathBuf::from(database);
        }
        if let Some(network) = lookup(NETWORK_KEY) {
            self.network = Network::from_str(&network)?;
        }
        if let Some(servers) = lookup(ELECTRUM_SERVERS_KEY) {
            self.electrum_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|server| !server.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(timeout) = lookup(REQUEST_TIMEOUT_KEY) {
            self.request_timeout_secs = timeout.trim().parse().map_err(|e| {
                EngineError::Config(format!("Invalid {REQUEST_TIMEOUT_KEY} {timeout}: {e}"))
            })?;
        }
        if let Some(level) = lookup(LOG_LEVEL_KEY) {
            self.log_level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_addr.parse::<SocketAddr>().map_err(|e| {
            EngineError::Config(format!("Invalid listen address {}: {e}", self.listen_addr))
        })?;
        if self.electrum_servers.is_empty() {
            return Err(EngineError::Config(
                "At least one electrum server is required".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(EngineError::Config(
                "Request timeout must be at least one second".to_string(),
            ));
        }
        self.log_level_filter()?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn log_level_filter(&self) -> Result<LevelFilter> {
        LevelFilter::from_str(&self.log_level)
            .map_err(|_| EngineError::Config(format!("Invalid log level {}", self.log_level)))
    }
}
