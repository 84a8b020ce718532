//! Configuration types for a VoltMatch engine instance.
//!
//! Every section implements `Default` from [`crate::constants`] and is
//! `#[serde(default)]`, so a config file only needs to name what it changes.

use std::path::Path;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{constants, MarketId, Result, UserId, VoltmatchError};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Markets served by this engine. Each gets its own sequencer.
    pub markets: Vec<MarketConfig>,
    pub escrow: EscrowConfig,
    pub backoff: BackoffConfig,
    pub sweeper: SweeperConfig,
    /// Users allowed to raise and resolve disputes on any trade.
    pub arbiters: Vec<UserId>,
    pub log: LogConfig,
    /// Re-read attempts after an optimistic concurrency conflict.
    pub store_retry_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            markets: Vec::new(),
            escrow: EscrowConfig::default(),
            backoff: BackoffConfig::default(),
            sweeper: SweeperConfig::default(),
            arbiters: Vec::new(),
            log: LogConfig::default(),
            store_retry_limit: constants::DEFAULT_STORE_RETRY_LIMIT,
        }
    }
}

impl EngineConfig {
    /// Config with a single active market and defaults everywhere else.
    #[must_use]
    pub fn single_market(id: impl Into<String>) -> Self {
        Self {
            markets: vec![MarketConfig::new(id)],
            ..Self::default()
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| VoltmatchError::Configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.markets.is_empty() {
            return Err(VoltmatchError::Configuration(
                "at least one market must be configured".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for market in &self.markets {
            if market.id.as_str().trim().is_empty() {
                return Err(VoltmatchError::Configuration("market id must not be empty".into()));
            }
            if !seen.insert(market.id.clone()) {
                return Err(VoltmatchError::Configuration(format!(
                    "duplicate market {}",
                    market.id
                )));
            }
            if market.command_buffer == 0 {
                return Err(VoltmatchError::Configuration(format!(
                    "{}: command_buffer must be positive",
                    market.id
                )));
            }
        }
        if self.escrow.delivery_deadline_secs == 0 {
            return Err(VoltmatchError::Configuration(
                "escrow.delivery_deadline_secs must be positive".into(),
            ));
        }
        if self.escrow.shortfall_tolerance_bps > 10_000 {
            return Err(VoltmatchError::Configuration(
                "escrow.shortfall_tolerance_bps cannot exceed 10000".into(),
            ));
        }
        if self.backoff.max_attempts == 0 {
            return Err(VoltmatchError::Configuration(
                "backoff.max_attempts must be at least 1".into(),
            ));
        }
        if self.backoff.multiplier == 0 || self.backoff.initial_delay_ms > self.backoff.max_delay_ms {
            return Err(VoltmatchError::Configuration(
                "backoff must have multiplier >= 1 and initial_delay_ms <= max_delay_ms".into(),
            ));
        }
        if self.sweeper.interval_ms == 0 {
            return Err(VoltmatchError::Configuration(
                "sweeper.interval_ms must be positive".into(),
            ));
        }
        if self.store_retry_limit == 0 {
            return Err(VoltmatchError::Configuration(
                "store_retry_limit must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Per-market configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Market identifier (e.g., a grid zone such as "zone-north").
    pub id: MarketId,
    /// Inactive markets reject new offers until reopened.
    #[serde(default = "default_true")]
    pub active: bool,
    /// Capacity of the sequencer's command queue.
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
}

fn default_true() -> bool {
    true
}

fn default_command_buffer() -> usize {
    constants::DEFAULT_COMMAND_BUFFER
}

impl MarketConfig {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: MarketId::new(id),
            active: true,
            command_buffer: constants::DEFAULT_COMMAND_BUFFER,
        }
    }
}

/// Escrow lifecycle parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscrowConfig {
    /// Time from escrow lock to the delivery deadline.
    pub delivery_deadline_secs: u64,
    /// Accepted delivery shortfall in basis points.
    pub shortfall_tolerance_bps: u32,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            delivery_deadline_secs: constants::DEFAULT_DELIVERY_DEADLINE_SECS,
            shortfall_tolerance_bps: constants::DEFAULT_SHORTFALL_TOLERANCE_BPS,
        }
    }
}

impl EscrowConfig {
    #[must_use]
    pub fn delivery_deadline(&self) -> chrono::Duration {
        seconds(self.delivery_deadline_secs)
    }

    /// Tolerance as a fraction (200 bps → 0.02).
    #[must_use]
    pub fn shortfall_tolerance(&self) -> Decimal {
        Decimal::new(i64::from(self.shortfall_tolerance_bps), 4)
    }

    /// Smallest delivered quantity that still settles without dispute.
    #[must_use]
    pub fn minimum_delivery(&self, matched: Decimal) -> Decimal {
        matched * (Decimal::ONE - self.shortfall_tolerance())
    }
}

/// Exponential backoff against the settlement ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub multiplier: u32,
    pub max_delay_ms: u64,
    /// Total attempts including the first one.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: constants::DEFAULT_BACKOFF_INITIAL_MS,
            multiplier: constants::DEFAULT_BACKOFF_MULTIPLIER,
            max_delay_ms: constants::DEFAULT_BACKOFF_MAX_MS,
            max_attempts: constants::DEFAULT_BACKOFF_MAX_ATTEMPTS,
        }
    }
}

impl BackoffConfig {
    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Expiration sweeper timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub interval_ms: u64,
    /// MATCHED trades older than this get their escrow lock retried.
    pub matched_grace_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_ms: constants::DEFAULT_SWEEP_INTERVAL_MS,
            matched_grace_secs: constants::DEFAULT_MATCHED_GRACE_SECS,
        }
    }
}

impl SweeperConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub fn matched_grace(&self) -> chrono::Duration {
        seconds(self.matched_grace_secs)
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// Log output settings consumed by the engine's tracing setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG` when set.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: constants::DEFAULT_LOG_FILTER.to_string(),
            json: false,
        }
    }
}
