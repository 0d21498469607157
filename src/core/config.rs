//! Configuration - One TOML file shared by the gateway and its workers
//!
//! The gateway and every worker it spawns read the same file, so both ends
//! of a bus channel agree on directory and record sizes without passing
//! anything but the session key on the worker command line.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::types::BrokerType;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "TRADE_GATEWAY_CONFIG";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    /// Brokers clients may log in to
    #[serde(default = "default_brokers")]
    pub brokers: Vec<BrokerConfig>,

    #[serde(default)]
    pub sim: SimConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            bus: BusConfig::default(),
            worker: WorkerConfig::default(),
            brokers: default_brokers(),
            sim: SimConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7788,
        }
    }
}

/// Shared-memory bus limits. Both sides must use identical values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Directory holding the channel files
    #[serde(default = "default_bus_dir")]
    pub dir: PathBuf,

    /// Largest single frame in bytes
    #[serde(default = "default_max_msg_len")]
    pub max_msg_len: usize,

    /// Frames a channel can hold before senders start dropping
    #[serde(default = "default_max_msg_nums")]
    pub max_msg_nums: usize,

    /// How long a blocked receive waits before re-checking its stop flag
    #[serde(default = "default_recv_poll_ms")]
    pub recv_poll_ms: u64,
}

fn default_bus_dir() -> PathBuf {
    PathBuf::from("/dev/shm")
}
fn default_max_msg_len() -> usize {
    2048
}
fn default_max_msg_nums() -> usize {
    1024
}
fn default_recv_poll_ms() -> u64 {
    100
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            dir: default_bus_dir(),
            max_msg_len: default_max_msg_len(),
            max_msg_nums: default_max_msg_nums(),
            recv_poll_ms: default_recv_poll_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Directory containing worker executables; `PATH` lookup when unset
    pub search_dir: Option<PathBuf>,
}

impl WorkerConfig {
    pub fn program_path(&self, program: &str) -> PathBuf {
        match &self.search_dir {
            Some(dir) => dir.join(program),
            None => PathBuf::from(program),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub broker_type: String,
}

fn default_brokers() -> Vec<BrokerConfig> {
    vec![BrokerConfig {
        name: "sim".to_string(),
        broker_type: BrokerType::Sim.as_str().to_string(),
    }]
}

/// Simulator worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Directory for per-session snapshot files
    #[serde(default = "default_user_file_path")]
    pub user_file_path: PathBuf,

    /// JSON instrument definitions
    #[serde(default = "default_instrument_file")]
    pub instrument_file: PathBuf,

    /// Shared-memory quote matrix maintained by the market-data service
    pub quote_matrix: Option<PathBuf>,

    #[serde(default = "default_initial_balance")]
    pub initial_balance: f64,

    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_user_file_path() -> PathBuf {
    PathBuf::from("/var/lib/trade-gateway/users")
}
fn default_instrument_file() -> PathBuf {
    PathBuf::from("/etc/trade-gateway/instruments.json")
}
fn default_initial_balance() -> f64 {
    10_000_000.0
}
fn default_currency() -> String {
    "CNY".to_string()
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            user_file_path: default_user_file_path(),
            instrument_file: default_instrument_file(),
            quote_matrix: None,
            initial_balance: default_initial_balance(),
            currency: default_currency(),
        }
    }
}

impl Config {
    /// Load from TOML file
    pub fn load(path: &Path) -> crate::core::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::core::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> crate::core::Result<Self> {
        toml::from_str(content)
            .map_err(|e| crate::core::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load from `$TRADE_GATEWAY_CONFIG`, the system location or the working
    /// directory, in that order. Falls back to defaults.
    pub fn load_default() -> Self {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            candidates.push(PathBuf::from(path));
        }
        candidates.push(PathBuf::from("/etc/trade-gateway/config.toml"));
        candidates.push(PathBuf::from("config.toml"));

        for path in &candidates {
            match Self::load(path) {
                Ok(cfg) => {
                    tracing::info!("📋 Loaded config from {}", path.display());
                    return cfg;
                }
                Err(e) if path.exists() => {
                    tracing::warn!("skipping {}: {}", path.display(), e);
                }
                Err(_) => {}
            }
        }

        tracing::warn!("⚠️ No config file found, using defaults");
        Self::default()
    }

    /// Get broker config by name
    pub fn broker(&self, name: &str) -> Option<&BrokerConfig> {
        self.brokers.iter().find(|b| b.name == name)
    }

    pub fn broker_names(&self) -> Vec<String> {
        self.brokers.iter().map(|b| b.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_file() {
        let cfg = Config::parse(
            r#"
            [server]
            host = "127.0.0.1"
            port = 9000

            [bus]
            dir = "/tmp/bus"
            max_msg_len = 512

            [[brokers]]
            name = "simnow"
            type = "sim"

            [[brokers]]
            name = "broker_a"
            type = "ctp"

            [sim]
            initial_balance = 500000.0
            "#,
        )
        .unwrap();

        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.bus.dir, PathBuf::from("/tmp/bus"));
        assert_eq!(cfg.bus.max_msg_len, 512);
        assert_eq!(cfg.bus.max_msg_nums, 1024);
        assert_eq!(cfg.broker("broker_a").unwrap().broker_type, "ctp");
        assert_eq!(cfg.broker_names(), vec!["simnow", "broker_a"]);
        assert_eq!(cfg.sim.initial_balance, 500000.0);
        assert_eq!(cfg.sim.currency, "CNY");
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let cfg = Config::parse("").unwrap();
        assert_eq!(cfg.server.port, 7788);
        assert_eq!(cfg.bus.dir, PathBuf::from("/dev/shm"));
        assert_eq!(cfg.broker("sim").unwrap().broker_type, "sim");
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = Config::parse("[server\nport = ").unwrap_err();
        assert!(matches!(err, crate::core::Error::Config(_)));
    }

    #[test]
    fn test_program_path() {
        let worker = WorkerConfig { search_dir: Some(PathBuf::from("/opt/bin")) };
        assert_eq!(worker.program_path("trade-sim"), PathBuf::from("/opt/bin/trade-sim"));
        assert_eq!(WorkerConfig::default().program_path("trade-sim"), PathBuf::from("trade-sim"));
    }
}
