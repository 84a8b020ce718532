//! # voltmatch-types
//!
//! Shared types, errors, and configuration for the **VoltMatch** energy
//! marketplace engine.
//!
//! This crate is the leaf dependency of the workspace; every other crate
//! depends on it. It defines:
//!
//! - **Identifiers**: [`OfferId`], [`UserId`], [`TradeId`], [`DisputeId`], [`EscrowId`], [`MarketId`], [`LedgerRef`], [`TxHash`]
//! - **Offer model**: [`Offer`], [`OfferRequest`], [`OfferSide`], [`OfferStatus`], [`OfferPriority`]
//! - **Trade model**: [`Trade`], [`TradeStatus`], [`TradeEvent`]
//! - **Dispute model**: [`Dispute`], [`DisputeStatus`], [`DisputeReason`], [`Resolution`], [`PendingResolution`], [`SettlementSplit`]
//! - **Escrow model**: [`EscrowRecord`], [`EscrowState`]
//! - **Configuration**: [`EngineConfig`], [`MarketConfig`], [`EscrowConfig`], [`BackoffConfig`], [`SweeperConfig`], [`LogConfig`]
//! - **Errors**: [`VoltmatchError`] with `VM_ERR_` prefix codes, [`ErrorKind`]
//! - **Constants**: system-wide defaults

pub mod config;
pub mod constants;
pub mod dispute;
pub mod error;
pub mod escrow;
pub mod ids;
pub mod offer;
pub mod trade;

// Re-export all primary types at crate root for ergonomic imports:
//   use voltmatch_types::{Offer, OfferSide, Trade, Dispute, ...};

pub use config::*;
pub use dispute::*;
pub use error::*;
pub use escrow::*;
pub use ids::*;
pub use offer::*;
pub use trade::*;

// Constants are accessed via `voltmatch_types::constants::FOO`
// (not re-exported to avoid name collisions).
