//! Configuration management
//!
//! JSON configuration file with environment variable support for API
//! credentials. All fractional and monetary values are decimal strings in
//! the file ("0.02", not 0.02) so they land in `Money` without ever passing
//! through a binary float.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::portfolio::PortfolioConfig;
use crate::Money;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub exchange: ExchangeConfig,
    pub strategy: StrategyConfig,
    pub portfolio: PortfolioConfig,
    pub pairs: Vec<PairConfig>,
    /// Directory holding the state store file
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Seconds between price/execution polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Seconds per signal candle (5-minute candles)
    #[serde(default = "default_candle_interval")]
    pub candle_interval_secs: u64,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_poll_interval() -> u64 {
    5
}

fn default_candle_interval() -> u64 {
    300
}

impl Config {
    /// Load configuration from a JSON file, with API credentials taken from
    /// the environment when present.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        if let Ok(api_key) = std::env::var("TRAILGUARD_API_KEY") {
            config.exchange.api_key = Some(api_key);
        }
        if let Ok(api_secret) = std::env::var("TRAILGUARD_API_SECRET") {
            config.exchange.api_secret = Some(api_secret);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.pairs.is_empty(), "at least one pair must be configured");
        self.strategy.validate()?;
        Ok(())
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.state_dir.join("trailguard.db")
    }
}

/// Exchange connectivity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    pub base_url: String,
    /// Order placement/cancel budget, requests per second
    pub orders_rate_limit: u32,
    /// Status and market data budget, requests per second
    pub reads_rate_limit: u32,
    pub max_retries: u32,
    pub request_timeout_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            api_key: None,
            api_secret: None,
            base_url: "https://api.exchange.example.com".to_string(),
            orders_rate_limit: 10,
            reads_rate_limit: 20,
            max_retries: 3,
            request_timeout_secs: 10,
        }
    }
}

/// Trailing-stop strategy parameters. Fractions are 0-1 ("0.02" = 2%).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Trailing distance from the highest observed price
    pub trail_pct: Money,
    /// Gap between stop trigger and stop limit
    pub stop_limit_buffer_pct: Money,
    /// Minimum relative improvement before a stop is replaced
    pub min_ratchet: Money,
    /// Cancel an unfilled entry after this many candle closes
    pub max_entry_wait_candles: u32,
    /// Escalate a triggered-but-unfilled stop after this long
    pub stop_timeout_seconds: u64,
    /// Consecutive placement failures before escalation kicks in
    pub stop_fail_threshold: u32,
    /// Limit-buffer tightening per escalation step (fraction of the buffer)
    pub stop_escalation_step_pct: Money,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        StrategyConfig {
            trail_pct: "0.02".parse().unwrap(),
            stop_limit_buffer_pct: "0.005".parse().unwrap(),
            min_ratchet: "0.001".parse().unwrap(),
            max_entry_wait_candles: 12,
            stop_timeout_seconds: 90,
            stop_fail_threshold: 3,
            stop_escalation_step_pct: "0.25".parse().unwrap(),
        }
    }
}

impl StrategyConfig {
    pub fn validate(&self) -> Result<()> {
        let unit = |v: Money, name: &str| -> Result<()> {
            anyhow::ensure!(
                v.is_positive() && v < Money::ONE,
                "{} must be a fraction in (0, 1), got {}",
                name,
                v
            );
            Ok(())
        };
        unit(self.trail_pct, "trail_pct")?;
        unit(self.stop_limit_buffer_pct, "stop_limit_buffer_pct")?;
        unit(self.stop_escalation_step_pct, "stop_escalation_step_pct")?;
        anyhow::ensure!(
            !self.min_ratchet.is_negative() && self.min_ratchet < Money::ONE,
            "min_ratchet must be in [0, 1), got {}",
            self.min_ratchet
        );
        Ok(())
    }
}

/// One traded pair registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairConfig {
    pub product_id: String,
    /// Label grouping pairs for concentration limits (e.g. "large_cap")
    pub correlation_group: String,
    /// Target share of capital for rebalance drift checks, whole percent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_allocation_pct: Option<Money>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "exchange": {
                "base_url": "https://api.exchange.example.com",
                "orders_rate_limit": 10,
                "reads_rate_limit": 20,
                "max_retries": 3,
                "request_timeout_secs": 10
            },
            "strategy": {
                "trail_pct": "0.02",
                "stop_limit_buffer_pct": "0.005",
                "min_ratchet": "0.001",
                "max_entry_wait_candles": 12,
                "stop_timeout_seconds": 90,
                "stop_fail_threshold": 3,
                "stop_escalation_step_pct": "0.25"
            },
            "portfolio": {
                "total_capital": "100000",
                "max_position_size_pct": "5",
                "max_positions": 5,
                "max_correlated_exposure_pct": "15",
                "rebalance_threshold_pct": "5",
                "emergency_liquidation_loss_pct": "-10"
            },
            "pairs": [
                { "product_id": "BTC-USD", "correlation_group": "large_cap", "target_allocation_pct": "40" },
                { "product_id": "ETH-USD", "correlation_group": "large_cap" }
            ]
        }"#
    }

    #[test]
    fn test_parse_sample_config() {
        let config: Config = serde_json::from_str(sample_json()).unwrap();
        assert_eq!(config.pairs.len(), 2);
        assert_eq!(config.strategy.trail_pct, "0.02".parse().unwrap());
        assert_eq!(config.portfolio.max_positions, 5);
        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.candle_interval_secs, 300);
        config.validate().unwrap();
    }

    #[test]
    fn test_fractions_are_exact() {
        let config: Config = serde_json::from_str(sample_json()).unwrap();
        // "0.005" parsed via the string path, not through f64
        assert_eq!(config.strategy.stop_limit_buffer_pct.to_string(), "0.005");
    }

    #[test]
    fn test_validate_rejects_out_of_range_fraction() {
        let mut config: Config = serde_json::from_str(sample_json()).unwrap();
        config.strategy.trail_pct = "1.5".parse().unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_pairs() {
        let mut config: Config = serde_json::from_str(sample_json()).unwrap();
        config.pairs.clear();
        assert!(config.validate().is_err());
    }
}
