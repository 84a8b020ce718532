//! Continuous price-time-priority matcher.
//!
//! Matching is split into a read-only planning step and an apply step so
//! that callers can persist the outcome before the book is mutated:
//!
//! ```text
//! plan_match(&OrderBook, &Offer) -> MatchPlan   (pure)
//! OrderBook::apply(&MatchPlan)                  (mutates the book)
//! ```
//!
//! An incoming BUY walks the asks from the lowest price upwards while the ask
//! price is at or below its limit; an incoming SELL walks the bids from the
//! highest price downwards. Within a level the oldest offer fills first. The
//! trade price is always the resting offer's price.
//!
//! ## Skipped resting offers
//!
//! - **Expired**: offers past `expires_at` never match; they are reported in
//!   [`MatchPlan::expired`] so the caller can retire them.
//! - **Self-trade**: offers owned by the incoming offer's owner are skipped
//!   and stay in the book.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;
use voltmatch_types::{Offer, OfferId, OfferSide, Result, Trade, TradeId, TradeStatus, UserId};

use crate::{OrderBook, PriceLevel};

/// One resting offer consumed (partly or fully) by the incoming offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fill {
    pub resting_offer_id: OfferId,
    pub resting_owner: UserId,
    pub quantity: Decimal,
    /// Resting offer's price.
    pub price: Decimal,
}

/// Outcome of matching one incoming offer against a book.
#[derive(Debug, Clone, Default)]
pub struct MatchPlan {
    /// Fills in execution order.
    pub fills: Vec<Fill>,
    /// Resting offers found expired during the walk.
    pub expired: Vec<OfferId>,
    /// Number of same-owner resting offers passed over.
    pub self_trades_skipped: usize,
    /// Incoming quantity left after all fills.
    pub remaining: Decimal,
}

impl MatchPlan {
    /// Total quantity filled.
    #[must_use]
    pub fn filled(&self) -> Decimal {
        self.fills.iter().map(|f| f.quantity).sum()
    }

    /// One MATCHED trade per fill.
    #[must_use]
    pub fn trades(&self, incoming: &Offer, now: DateTime<Utc>) -> Vec<Trade> {
        self.fills
            .iter()
            .map(|fill| build_trade(incoming, fill, now))
            .collect()
    }
}

/// Build the trade record for a single fill.
#[must_use]
pub fn build_trade(incoming: &Offer, fill: &Fill, now: DateTime<Utc>) -> Trade {
    let (sell_offer_id, seller_id, buy_offer_id, buyer_id) = match incoming.side {
        OfferSide::Buy => (
            fill.resting_offer_id,
            fill.resting_owner,
            incoming.id,
            incoming.owner_id,
        ),
        OfferSide::Sell => (
            incoming.id,
            incoming.owner_id,
            fill.resting_offer_id,
            fill.resting_owner,
        ),
    };
    Trade {
        id: TradeId::new(),
        market: incoming.market.clone(),
        sell_offer_id,
        buy_offer_id,
        seller_id,
        buyer_id,
        matched_amount: fill.quantity,
        matched_price: fill.price,
        status: TradeStatus::Matched,
        escrow_ref: None,
        settlement_tx_ref: None,
        delivery_deadline: None,
        delivered_amount: None,
        evidence_ref: None,
        cancel_reason: None,
        created_at: now,
        matched_at: now,
        completed_at: None,
    }
}

/// Walk the opposite side of `book` and plan fills for `incoming`.
///
/// Does not mutate the book. `incoming.remaining_amount` is the quantity to
/// match.
#[must_use]
pub fn plan_match(book: &OrderBook, incoming: &Offer, now: DateTime<Utc>) -> MatchPlan {
    let mut plan = MatchPlan {
        remaining: incoming.remaining_amount,
        ..MatchPlan::default()
    };
    if plan.remaining <= Decimal::ZERO {
        return plan;
    }

    let limit = incoming.price_per_unit;
    match incoming.side {
        OfferSide::Buy => {
            let crossing = book.ask_levels().take_while(|level| level.price <= limit);
            walk_levels(crossing, incoming, now, &mut plan);
        }
        OfferSide::Sell => {
            let crossing = book.bid_levels().take_while(|level| level.price >= limit);
            walk_levels(crossing, incoming, now, &mut plan);
        }
    }

    debug!(
        offer = %incoming.id,
        fills = plan.fills.len(),
        filled = %plan.filled(),
        remaining = %plan.remaining,
        expired = plan.expired.len(),
        self_trades_skipped = plan.self_trades_skipped,
        "match planned"
    );
    plan
}

fn walk_levels<'a>(
    levels: impl Iterator<Item = &'a PriceLevel>,
    incoming: &Offer,
    now: DateTime<Utc>,
    plan: &mut MatchPlan,
) {
    for level in levels {
        for resting in level.iter() {
            if plan.remaining.is_zero() {
                return;
            }
            if resting.is_expired_at(now) {
                plan.expired.push(resting.offer_id);
                continue;
            }
            if resting.owner_id == incoming.owner_id {
                plan.self_trades_skipped += 1;
                continue;
            }
            let quantity = plan.remaining.min(resting.remaining);
            plan.fills.push(Fill {
                resting_offer_id: resting.offer_id,
                resting_owner: resting.owner_id,
                quantity,
                price: level.price,
            });
            plan.remaining -= quantity;
        }
    }
}

/// Result of [`match_incoming`].
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub trades: Vec<Trade>,
    pub expired: Vec<OfferId>,
}

/// Plan, apply to the book, and fill `incoming` in one step.
///
/// The remainder is not rested; callers decide whether to
/// [`OrderBook::submit`] it.
pub fn match_incoming(
    book: &mut OrderBook,
    incoming: &mut Offer,
    now: DateTime<Utc>,
) -> Result<MatchOutcome> {
    let plan = plan_match(book, incoming, now);
    book.apply(&plan)?;
    for fill in &plan.fills {
        incoming.apply_fill(fill.quantity, now)?;
    }
    Ok(MatchOutcome {
        trades: plan.trades(incoming, now),
        expired: plan.expired,
    })
}
