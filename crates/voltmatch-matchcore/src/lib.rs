//! # voltmatch-matchcore
//!
//! **Pure continuous matching for VoltMatch energy markets.**
//!
//! MatchCore is the compute plane: it keeps one market's order book and
//! plans fills for incoming offers. It has:
//!
//! - **Zero side effects**: no store writes, no ledger calls, no clocks
//! - **Price-time priority**: best price first, then `(created_at, sequence)`
//! - **Resting price wins**: every fill executes at the resting offer's price
//! - **Self-trade prevention**: same-owner offers are never matched
//! - **Market sharding**: each market has its own independent book

pub mod matcher;
pub mod orderbook;
pub mod price_level;

pub use matcher::{Fill, MatchOutcome, MatchPlan, build_trade, match_incoming, plan_match};
pub use orderbook::{BookPosition, DepthLevel, DepthSnapshot, OrderBook};
pub use price_level::{PriceLevel, RestingOffer, TimeKey};
