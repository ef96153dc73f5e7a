use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::blockchain::consensus::{AuthoritativeServer, ConsensusPolicy, WeightedChainSelection};
use crate::blockchain::PublicKey;

/// Errors in the node configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// How candidate chains from peers are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusMode {
    Authoritative,
    Weighted,
}

impl ConsensusMode {
    pub fn policy(self) -> Arc<dyn ConsensusPolicy> {
        match self {
            ConsensusMode::Authoritative => Arc::new(AuthoritativeServer),
            ConsensusMode::Weighted => Arc::new(WeightedChainSelection),
        }
    }
}

/// Node settings, read from the environment
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub enable_reset: bool,
    pub consensus: ConsensusMode,
    /// Base URLs of peers to sync with
    pub peers: Vec<String>,
    pub sync_interval: Duration,
    /// Bound on every request to a peer or remote server
    pub peer_timeout: Duration,
    /// Local miner threads; 0 runs no miner
    pub miner_threads: usize,
    pub miner_pubkey: Option<PublicKey>,
    /// When set the process only mines against this server
    pub miner_server_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "127.0.0.1".to_string(),
            port: 8333,
            data_dir: PathBuf::from("data"),
            enable_reset: false,
            consensus: ConsensusMode::Authoritative,
            peers: Vec::new(),
            sync_interval: Duration::from_secs(5),
            peer_timeout: Duration::from_secs(10),
            miner_threads: 0,
            miner_pubkey: None,
            miner_server_url: None,
        }
    }
}

fn invalid(key: &'static str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(invalid(key, value, "expected true or false")),
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: ToString,
{
    value.trim().parse().map_err(|e: T::Err| invalid(key, value, e))
}

impl Config {
    /// Reads the configuration from the process environment and `.env`
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(host) = get("HOST") {
            config.host = host;
        }
        if let Some(port) = get("PORT") {
            config.port = parse_number("PORT", &port)?;
        }
        if let Some(dir) = get("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(flag) = get("ENABLE_RESET") {
            config.enable_reset = parse_bool("ENABLE_RESET", &flag)?;
        }
        if let Some(mode) = get("CONSENSUS") {
            config.consensus = match mode.trim().to_ascii_lowercase().as_str() {
                "authoritative" => ConsensusMode::Authoritative,
                "weighted" => ConsensusMode::Weighted,
                _ => return Err(invalid("CONSENSUS", &mode, "expected authoritative or weighted")),
            };
        }
        if let Some(peers) = get("PEERS") {
            config.peers = peers
                .split(',')
                .map(|peer| peer.trim().trim_end_matches('/'))
                .filter(|peer| !peer.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(secs) = get("SYNC_INTERVAL_SECS") {
            config.sync_interval = Duration::from_secs(parse_number("SYNC_INTERVAL_SECS", &secs)?);
        }
        if let Some(secs) = get("PEER_TIMEOUT_SECS") {
            config.peer_timeout = Duration::from_secs(parse_number("PEER_TIMEOUT_SECS", &secs)?);
        }
        if let Some(threads) = get("MINER_THREADS") {
            config.miner_threads = parse_number("MINER_THREADS", &threads)?;
        }
        if let Some(key) = get("MINER_PUBKEY") {
            config.miner_pubkey = Some(key.trim().parse().map_err(|e| invalid("MINER_PUBKEY", &key, e))?);
        }
        if let Some(url) = get("MINER_SERVER_URL") {
            config.miner_server_url = Some(url.trim().to_string());
        }

        Ok(config)
    }

    pub fn bind_address(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}
