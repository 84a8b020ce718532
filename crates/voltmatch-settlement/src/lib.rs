//! # voltmatch-settlement
//!
//! **Settlement plane**: everything the engine needs to move value on the
//! external ledger safely.
//!
//! ## Architecture
//!
//! The escrow coordinator talks to the ledger only through
//! [`SettlementAdapter`] and:
//! 1. Locks the buyer's value and the seller's energy credits per trade
//! 2. Retries unreachable-ledger failures with a bounded [`BackoffPolicy`]
//! 3. Settles, refunds or splits the hold exactly once per trade
//!
//! [`InMemoryLedger`] is a complete adapter backed by in-process balances.
//! It uses [`IdempotencyGuard`] to replay repeated calls and
//! [`SupplyConservation`] to prove no value was created or destroyed.

pub mod adapter;
pub mod backoff;
pub mod idempotency;
pub mod memory;
pub mod supply_conservation;

pub use adapter::{LedgerError, LedgerResult, LockRequest, SettlementAdapter};
pub use backoff::BackoffPolicy;
pub use idempotency::IdempotencyGuard;
pub use memory::{AccountBalance, InMemoryLedger, LedgerOp};
pub use supply_conservation::{Asset, SupplyConservation};
