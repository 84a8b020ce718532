//! System-wide constants for the VoltMatch marketplace engine.

/// Default time a seller has to confirm delivery once escrow is locked (seconds).
pub const DEFAULT_DELIVERY_DEADLINE_SECS: u64 = 3600;

/// Default delivery shortfall tolerance in basis points (200 = 2%).
///
/// A confirmation reporting less than `matched × (1 - tolerance)` kWh
/// raises a dispute instead of settling.
pub const DEFAULT_SHORTFALL_TOLERANCE_BPS: u32 = 200;

/// Default first retry delay against the settlement ledger (milliseconds).
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 100;

/// Default growth factor between consecutive ledger retries.
pub const DEFAULT_BACKOFF_MULTIPLIER: u32 = 2;

/// Default upper bound for a single retry delay (milliseconds).
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 5000;

/// Default number of ledger attempts before giving up.
pub const DEFAULT_BACKOFF_MAX_ATTEMPTS: u32 = 5;

/// Default expiration sweep interval (milliseconds).
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1000;

/// Default age (seconds) after which the sweeper re-drives a trade still
/// waiting for its escrow lock.
pub const DEFAULT_MATCHED_GRACE_SECS: u64 = 60;

/// Default capacity of a market sequencer's command queue.
pub const DEFAULT_COMMAND_BUFFER: usize = 1024;

/// Default number of re-read attempts after a store version conflict.
pub const DEFAULT_STORE_RETRY_LIMIT: u32 = 8;

/// Settlement idempotency cache size (number of trade IDs to remember).
pub const SETTLEMENT_IDEMPOTENCY_CACHE_SIZE: usize = 500_000;

/// Default `tracing` filter directive.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine name.
pub const ENGINE_NAME: &str = "VoltMatch";
