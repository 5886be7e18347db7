/*
[INPUT]:  YAML configuration file
[OUTPUT]: Parsed and validated grid configuration
[POS]:    Configuration layer - engine and venue setup
[UPDATE]: When adding new configuration options
*/

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use keygrid_exchange::ContractSpec;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::feed::ManualBoundary;
use crate::precision::PrecisionGuard;
use crate::quota::QuotaParams;
use crate::retry::RetryPolicy;

/// Top-level configuration for one grid
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GridConfig {
    /// Trading symbol (e.g., "BTC-USD")
    pub symbol: String,
    /// Directory for snapshot, transaction log and trade ledger
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Base quantity bought per slot fill
    #[serde(with = "rust_decimal::serde::str")]
    pub base_amount_per_grid: Decimal,
    /// Share of each filled unit resting as take-profit
    #[serde(default = "default_sell_quota_ratio", with = "rust_decimal::serde::str")]
    pub sell_quota_ratio: Decimal,
    /// Minimum gap between a buy slot and its sell target
    #[serde(default = "default_min_profit_pct", with = "rust_decimal::serde::str")]
    pub min_profit_pct: Decimal,
    #[serde(default = "default_price_buffer_pct", with = "rust_decimal::serde::str")]
    pub buy_price_buffer_pct: Decimal,
    #[serde(default = "default_price_buffer_pct", with = "rust_decimal::serde::str")]
    pub sell_price_buffer_pct: Decimal,
    #[serde(default = "default_max_fill_per_level")]
    pub max_fill_per_level: u32,
    #[serde(default = "default_recon_interval_sec")]
    pub recon_interval_sec: u64,
    #[serde(default = "default_event_poll_interval_sec")]
    pub event_poll_interval_sec: u64,
    /// Upper bound for any single place/cancel call
    #[serde(default = "default_order_action_timeout_sec")]
    pub order_action_timeout_sec: u64,
    /// Relative price match tolerance
    #[serde(default = "default_price_tolerance", with = "rust_decimal::serde::str")]
    pub price_tolerance: Decimal,
    #[serde(default = "default_place_max_attempts")]
    pub place_max_attempts: usize,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default)]
    pub contract: ContractSpec,
    #[serde(default)]
    pub boundary: Option<ManualBoundary>,
    #[serde(default)]
    pub paper: PaperConfig,
    /// Daily-rotated log files are written here when set
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

/// Seed for the paper venue
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PaperConfig {
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub initial_price: Option<Decimal>,
    #[serde(default = "default_zero", with = "rust_decimal::serde::str")]
    pub initial_holdings: Decimal,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./state")
}

fn default_sell_quota_ratio() -> Decimal {
    Decimal::new(7, 1)
}

fn default_min_profit_pct() -> Decimal {
    Decimal::new(5, 3)
}

fn default_price_buffer_pct() -> Decimal {
    Decimal::new(2, 3)
}

fn default_max_fill_per_level() -> u32 {
    1
}

fn default_recon_interval_sec() -> u64 {
    30
}

fn default_event_poll_interval_sec() -> u64 {
    2
}

fn default_order_action_timeout_sec() -> u64 {
    10
}

fn default_price_tolerance() -> Decimal {
    Decimal::new(1, 4)
}

fn default_place_max_attempts() -> usize {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_zero() -> Decimal {
    Decimal::ZERO
}

impl GridConfig {
    /// Configuration with every optional field at its default.
    pub fn new(symbol: impl Into<String>, base_amount_per_grid: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            state_dir: default_state_dir(),
            base_amount_per_grid,
            sell_quota_ratio: default_sell_quota_ratio(),
            min_profit_pct: default_min_profit_pct(),
            buy_price_buffer_pct: default_price_buffer_pct(),
            sell_price_buffer_pct: default_price_buffer_pct(),
            max_fill_per_level: default_max_fill_per_level(),
            recon_interval_sec: default_recon_interval_sec(),
            event_poll_interval_sec: default_event_poll_interval_sec(),
            order_action_timeout_sec: default_order_action_timeout_sec(),
            price_tolerance: default_price_tolerance(),
            place_max_attempts: default_place_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            contract: ContractSpec::default(),
            boundary: None,
            paper: PaperConfig::default(),
            log_dir: None,
        }
    }

    /// Load configuration from YAML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.symbol.trim().is_empty() {
            bail!("symbol cannot be empty");
        }
        if self.base_amount_per_grid <= Decimal::ZERO {
            bail!("base_amount_per_grid must be positive, got {}", self.base_amount_per_grid);
        }
        if self.sell_quota_ratio <= Decimal::ZERO || self.sell_quota_ratio > Decimal::ONE {
            bail!("sell_quota_ratio must be in (0, 1], got {}", self.sell_quota_ratio);
        }
        if self.min_profit_pct < Decimal::ZERO {
            bail!("min_profit_pct cannot be negative");
        }
        if self.buy_price_buffer_pct < Decimal::ZERO || self.sell_price_buffer_pct < Decimal::ZERO {
            bail!("price buffers cannot be negative");
        }
        if self.price_tolerance <= Decimal::ZERO {
            bail!("price_tolerance must be positive");
        }
        if self.max_fill_per_level == 0 {
            bail!("max_fill_per_level must be at least 1");
        }
        if self.contract.contract_size <= Decimal::ZERO {
            bail!("contract.contract_size must be positive");
        }
        if self.recon_interval_sec == 0 || self.event_poll_interval_sec == 0 {
            bail!("intervals must be at least one second");
        }
        if let Some(boundary) = &self.boundary {
            boundary.validate().context("invalid boundary")?;
        }
        Ok(())
    }

    pub fn quota_params(&self) -> QuotaParams {
        QuotaParams {
            unit: self.base_amount_per_grid,
            retain_ratio: self.sell_quota_ratio,
            max_fill_per_level: self.max_fill_per_level,
            buy_buffer_pct: self.buy_price_buffer_pct,
            sell_buffer_pct: self.sell_price_buffer_pct,
        }
    }

    pub fn precision(&self) -> PrecisionGuard {
        PrecisionGuard::from_spec(&self.contract)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::for_orders(self.place_max_attempts, self.retry_base_delay_ms)
    }

    pub fn recon_interval(&self) -> Duration {
        Duration::from_secs(self.recon_interval_sec)
    }

    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_secs(self.event_poll_interval_sec)
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.order_action_timeout_sec)
    }
}
