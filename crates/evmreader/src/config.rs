//! Reader configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Commitment level used to pick the block height indexed on each new head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultBlock {
    #[default]
    Latest,
    Safe,
    Finalized,
    Pending,
}

impl fmt::Display for DefaultBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DefaultBlock::Latest => "latest",
            DefaultBlock::Safe => "safe",
            DefaultBlock::Finalized => "finalized",
            DefaultBlock::Pending => "pending",
        };
        f.write_str(s)
    }
}

impl FromStr for DefaultBlock {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "latest" => Ok(DefaultBlock::Latest),
            "safe" => Ok(DefaultBlock::Safe),
            "finalized" => Ok(DefaultBlock::Finalized),
            "pending" => Ok(DefaultBlock::Pending),
            other => Err(format!("invalid default block: {other}")),
        }
    }
}

/// Bounded retry with a constant delay between attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    pub delay_ms: u64,
}

impl RetryPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_ms: 1000,
        }
    }
}

/// Backoff between resubscription attempts (initial and max seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectionConfig {
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            initial_backoff_secs: 1,
            max_backoff_secs: 60,
        }
    }
}

/// Reader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// HTTP RPC URL (eth_getLogs, eth_getBlockByNumber, eth_call, eth_chainId).
    pub http_url: String,
    /// WebSocket RPC URL for the newHeads subscription.
    pub ws_url: String,
    /// Chain the endpoint is expected to serve.
    pub chain_id: u64,
    #[serde(default)]
    pub default_block: DefaultBlock,
    /// Max block range per eth_getLogs request.
    pub getlogs_max_range: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub reconnection: ReconnectionConfig,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            http_url: "http://127.0.0.1:8545".to_string(),
            ws_url: "ws://127.0.0.1:8545".to_string(),
            chain_id: 31337,
            default_block: DefaultBlock::Latest,
            getlogs_max_range: 10_000,
            retry: RetryPolicy::default(),
            reconnection: ReconnectionConfig::default(),
        }
    }
}

impl ReaderConfig {
    /// Defaults overridden by `EVMREADER_*` environment variables.
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("EVMREADER_HTTP_URL") {
            config.ws_url = url.replace("http://", "ws://").replace("https://", "wss://");
            config.http_url = url;
        }
        if let Ok(url) = std::env::var("EVMREADER_WS_URL") {
            config.ws_url = url;
        }
        if let Some(id) = env_parse("EVMREADER_CHAIN_ID")? {
            config.chain_id = id;
        }
        if let Ok(block) = std::env::var("EVMREADER_DEFAULT_BLOCK") {
            config.default_block = block.parse()?;
        }
        if let Some(range) = env_parse("EVMREADER_GETLOGS_MAX_RANGE")? {
            config.getlogs_max_range = range;
        }
        if let Some(retries) = env_parse("EVMREADER_MAX_RETRIES")? {
            config.retry.max_retries = retries;
        }
        if let Some(delay) = env_parse("EVMREADER_RETRY_DELAY_MS")? {
            config.retry.delay_ms = delay;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.http_url.is_empty() {
            return Err("http_url cannot be empty".to_string());
        }
        if self.ws_url.is_empty() {
            return Err("ws_url cannot be empty".to_string());
        }
        if self.getlogs_max_range == 0 {
            return Err("getlogs_max_range must be > 0".to_string());
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, String> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map(Some)
            .map_err(|_| format!("invalid value for {key}: {v}")),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_block_parses_and_displays() {
        for s in ["latest", "safe", "finalized", "pending"] {
            let b: DefaultBlock = s.parse().unwrap();
            assert_eq!(b.to_string(), s);
        }
        assert_eq!("FINALIZED".parse::<DefaultBlock>(), Ok(DefaultBlock::Finalized));
        assert!("earliest".parse::<DefaultBlock>().is_err());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let json = r#"{
            "http_url": "http://node:8545",
            "ws_url": "ws://node:8546",
            "chain_id": 11155111,
            "default_block": "finalized",
            "getlogs_max_range": 500
        }"#;
        let c: ReaderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(c.default_block, DefaultBlock::Finalized);
        assert_eq!(c.retry.max_retries, 3);
        assert_eq!(c.reconnection.initial_backoff_secs, 1);
        assert_eq!(c.reconnection.max_backoff_secs, 60);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn zero_range_is_rejected() {
        let c = ReaderConfig {
            getlogs_max_range: 0,
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }
}
