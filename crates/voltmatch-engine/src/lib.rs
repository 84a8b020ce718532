//! # voltmatch-engine
//!
//! The running marketplace: continuous matching per market, escrow-backed
//! settlement and dispute handling for **VoltMatch**.
//!
//! - [`Marketplace`]: facade exposing every client operation
//! - [`sequencer`]: one task per market owning its order book, so each book is
//!   mutated by exactly one writer
//! - [`EscrowCoordinator`]: locks, settles, refunds and splits escrow on the
//!   external ledger and drives trades through their state machine
//! - [`DisputeDesk`]: authorization rules for raising and resolving disputes
//! - [`ExpirationSweeper`]: retires expired offers and times out deliveries
//! - [`Repository`]: versioned Offer Store with atomic multi-record commits
//!
//! ## Trade Lifecycle
//!
//! ```text
//! ┌─────────┐  lock   ┌───────────────┐ delivery ┌───────────┐
//! │ MATCHED ├────────▶│ ESCROW_LOCKED ├─────────▶│ COMPLETED │
//! └────┬────┘         └───────┬───────┘          └───────────┘
//!      │ lock failed          │ shortfall / timeout / dispute ▲
//!      ▼                      ▼                               │
//! ┌───────────┐ refund  ┌──────────┐  release / split         │
//! │ CANCELLED │◀────────┤ DISPUTED ├──────────────────────────┘
//! └───────────┘         └──────────┘
//! ```
//!
//! A cancelled MATCHED trade hands its quantity back to both parent offers,
//! which re-enter the book at their original time priority.

pub mod clock;
pub mod coordinator;
pub mod dispute;
pub mod marketplace;
pub mod markets;
pub mod sequencer;
pub mod store;
pub mod sweeper;
pub mod telemetry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{EscrowCoordinator, EscrowQueue};
pub use dispute::{DisputeDesk, ResolutionOutcome};
pub use marketplace::Marketplace;
pub use markets::MarketRegistry;
pub use sequencer::{SequencerHandle, SubmitReceipt, TopOfBook};
pub use store::{Expected, InMemoryRepository, Record, RecordKey, Repository, Versioned, WriteBatch};
pub use sweeper::{ExpirationSweeper, SweepReport};
pub use telemetry::init_tracing;
