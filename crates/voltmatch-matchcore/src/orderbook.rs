//! The order book for a single energy market.
//!
//! Uses `BTreeMap` for price-level ordering:
//! - **Bids** (buys): `BTreeMap<Reverse<Decimal>, PriceLevel>` -- highest price first
//! - **Asks** (sells): `BTreeMap<Decimal, PriceLevel>` -- lowest price first
//!
//! Within a level offers are ordered by `(created_at, sequence)`. An auxiliary
//! `HashMap<OfferId, (side, price, time key)>` gives O(log N) removal and
//! amendment.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use voltmatch_types::{MarketId, Offer, OfferId, OfferSide, Result, VoltmatchError};

use crate::matcher::MatchPlan;
use crate::price_level::{PriceLevel, RestingOffer, TimeKey};

/// Where an offer sits after it was added to the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookPosition {
    pub side: OfferSide,
    pub price: Decimal,
    /// Number of better-priced levels on the same side.
    pub levels_ahead: usize,
    /// Number of older offers at the same price.
    pub queue_position: usize,
}

/// Aggregated quantity at one price.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthLevel {
    pub price: Decimal,
    pub quantity: Decimal,
    pub offers: usize,
}

/// Top-of-book snapshot for a market.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthSnapshot {
    pub market: MarketId,
    /// Best first.
    pub bids: Vec<DepthLevel>,
    /// Best first.
    pub asks: Vec<DepthLevel>,
    pub spread: Option<Decimal>,
    pub mid_price: Option<Decimal>,
    pub last_trade_price: Option<Decimal>,
}

/// The order book for a single market.
#[derive(Debug)]
pub struct OrderBook {
    /// The market this book serves.
    pub market: MarketId,
    /// Buy side: highest price first (`Reverse` key).
    bids: BTreeMap<Reverse<Decimal>, PriceLevel>,
    /// Sell side: lowest price first.
    asks: BTreeMap<Decimal, PriceLevel>,
    /// Fast lookup: `OfferId -> (side, price, time key)`.
    index: HashMap<OfferId, (OfferSide, Decimal, TimeKey)>,
    last_trade_price: Option<Decimal>,
}

impl OrderBook {
    /// Create a new empty order book for the given market.
    #[must_use]
    pub fn new(market: MarketId) -> Self {
        Self {
            market,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            index: HashMap::new(),
            last_trade_price: None,
        }
    }

    // =================================================================
    // Insertion
    // =================================================================

    /// Validate `offer` and rest its remaining quantity in the book.
    ///
    /// Returns the offer's position on its side of the book.
    pub fn submit(&mut self, offer: &Offer, now: DateTime<Utc>) -> Result<BookPosition> {
        offer.validate(now)?;
        if offer.remaining_amount <= Decimal::ZERO {
            return Err(VoltmatchError::InvalidOffer {
                offer_id: offer.id,
                reason: "nothing left to rest in the book".into(),
            });
        }
        self.insert(RestingOffer::from_offer(offer))?;
        self.position(&offer.id)
            .ok_or_else(|| VoltmatchError::Internal(format!("{} vanished after insert", offer.id)))
    }

    /// Insert a resting offer at its price and time-priority position.
    pub fn insert(&mut self, offer: RestingOffer) -> Result<()> {
        if self.index.contains_key(&offer.offer_id) {
            return Err(VoltmatchError::DuplicateOffer(offer.offer_id));
        }

        let price = offer.price;
        self.index
            .insert(offer.offer_id, (offer.side, price, offer.time_key()));

        match offer.side {
            OfferSide::Buy => {
                self.bids
                    .entry(Reverse(price))
                    .or_insert_with(|| PriceLevel::new(price))
                    .insert(offer);
            }
            OfferSide::Sell => {
                self.asks
                    .entry(price)
                    .or_insert_with(|| PriceLevel::new(price))
                    .insert(offer);
            }
        }
        Ok(())
    }

    // =================================================================
    // Removal / amendment
    // =================================================================

    /// Remove an offer by ID. Returns the removed entry.
    pub fn remove(&mut self, offer_id: &OfferId) -> Result<RestingOffer> {
        let (side, price, key) = self
            .index
            .remove(offer_id)
            .ok_or(VoltmatchError::OfferNotFound(*offer_id))?;

        let removed = match side {
            OfferSide::Buy => {
                let level = self
                    .bids
                    .get_mut(&Reverse(price))
                    .ok_or(VoltmatchError::OfferNotFound(*offer_id))?;
                let removed = level
                    .remove(&key)
                    .ok_or(VoltmatchError::OfferNotFound(*offer_id))?;
                if level.is_empty() {
                    self.bids.remove(&Reverse(price));
                }
                removed
            }
            OfferSide::Sell => {
                let level = self
                    .asks
                    .get_mut(&price)
                    .ok_or(VoltmatchError::OfferNotFound(*offer_id))?;
                let removed = level
                    .remove(&key)
                    .ok_or(VoltmatchError::OfferNotFound(*offer_id))?;
                if level.is_empty() {
                    self.asks.remove(&price);
                }
                removed
            }
        };

        Ok(removed)
    }

    /// Set the remaining quantity of a resting offer. Zero removes it.
    pub fn amend_remaining(&mut self, offer_id: &OfferId, remaining: Decimal) -> Result<()> {
        if remaining <= Decimal::ZERO {
            self.remove(offer_id)?;
            return Ok(());
        }
        let entry = self
            .level_entry_mut(offer_id)
            .ok_or(VoltmatchError::OfferNotFound(*offer_id))?;
        entry.remaining = remaining;
        Ok(())
    }

    /// Apply a match plan computed against this book: reduce or remove the
    /// filled resting offers and drop the expired ones.
    pub fn apply(&mut self, plan: &MatchPlan) -> Result<()> {
        for fill in &plan.fills {
            let current = self
                .get(&fill.resting_offer_id)
                .map(|o| o.remaining)
                .ok_or(VoltmatchError::OfferNotFound(fill.resting_offer_id))?;
            if fill.quantity > current {
                return Err(VoltmatchError::Internal(format!(
                    "fill of {} exceeds resting {current} on {}",
                    fill.quantity, fill.resting_offer_id
                )));
            }
            self.amend_remaining(&fill.resting_offer_id, current - fill.quantity)?;
            self.last_trade_price = Some(fill.price);
        }
        for offer_id in &plan.expired {
            self.remove(offer_id)?;
        }
        Ok(())
    }

    // =================================================================
    // Queries
    // =================================================================

    #[must_use]
    pub fn get(&self, offer_id: &OfferId) -> Option<&RestingOffer> {
        let (side, price, key) = self.index.get(offer_id)?;
        match side {
            OfferSide::Buy => self.bids.get(&Reverse(*price))?.get(key),
            OfferSide::Sell => self.asks.get(price)?.get(key),
        }
    }

    fn level_entry_mut(&mut self, offer_id: &OfferId) -> Option<&mut RestingOffer> {
        let (side, price, key) = self.index.get(offer_id)?;
        match side {
            OfferSide::Buy => self.bids.get_mut(&Reverse(*price))?.get_mut(key),
            OfferSide::Sell => self.asks.get_mut(price)?.get_mut(key),
        }
    }

    /// Current position of a resting offer.
    #[must_use]
    pub fn position(&self, offer_id: &OfferId) -> Option<BookPosition> {
        let (side, price, key) = self.index.get(offer_id)?;
        let (levels_ahead, queue_position) = match side {
            OfferSide::Buy => (
                self.bids.range(..Reverse(*price)).count(),
                self.bids.get(&Reverse(*price))?.queue_position(key),
            ),
            OfferSide::Sell => (
                self.asks.range(..*price).count(),
                self.asks.get(price)?.queue_position(key),
            ),
        };
        Some(BookPosition {
            side: *side,
            price: *price,
            levels_ahead,
            queue_position,
        })
    }

    /// Best (highest-priced, then oldest) open buy offer.
    #[must_use]
    pub fn best_bid(&self) -> Option<&RestingOffer> {
        self.bids.values().next()?.front()
    }

    /// Best (lowest-priced, then oldest) open sell offer.
    #[must_use]
    pub fn best_ask(&self) -> Option<&RestingOffer> {
        self.asks.values().next()?.front()
    }

    /// Spread = best ask - best bid. `None` if either side is empty.
    #[must_use]
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask.price - bid.price),
            _ => None,
        }
    }

    /// Mid price = (best bid + best ask) / 2. `None` if either side is empty.
    #[must_use]
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid.price + ask.price) / Decimal::TWO),
            _ => None,
        }
    }

    #[must_use]
    pub fn last_trade_price(&self) -> Option<Decimal> {
        self.last_trade_price
    }

    /// Aggregated view of the best `levels` price levels on each side.
    #[must_use]
    pub fn depth(&self, levels: usize) -> DepthSnapshot {
        let summarize = |level: &PriceLevel| DepthLevel {
            price: level.price,
            quantity: level.total_quantity(),
            offers: level.len(),
        };
        DepthSnapshot {
            market: self.market.clone(),
            bids: self.bids.values().take(levels).map(summarize).collect(),
            asks: self.asks.values().take(levels).map(summarize).collect(),
            spread: self.spread(),
            mid_price: self.mid_price(),
            last_trade_price: self.last_trade_price,
        }
    }

    /// IDs of resting offers whose expiry is at or before `now`.
    #[must_use]
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<OfferId> {
        self.bid_levels()
            .chain(self.ask_levels())
            .flat_map(PriceLevel::iter)
            .filter(|o| o.is_expired_at(now))
            .map(|o| o.offer_id)
            .collect()
    }

    /// Total number of offers currently in the book.
    #[must_use]
    pub fn offer_count(&self) -> usize {
        self.index.len()
    }

    /// Number of distinct bid price levels.
    #[must_use]
    pub fn bid_depth(&self) -> usize {
        self.bids.len()
    }

    /// Number of distinct ask price levels.
    #[must_use]
    pub fn ask_depth(&self) -> usize {
        self.asks.len()
    }

    /// Returns `true` if the book has no offers on either side.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[must_use]
    pub fn contains(&self, offer_id: &OfferId) -> bool {
        self.index.contains_key(offer_id)
    }

    // =================================================================
    // Iteration (for the matcher)
    // =================================================================

    /// Iterate bid levels from best (highest) to worst.
    pub fn bid_levels(&self) -> impl Iterator<Item = &PriceLevel> {
        self.bids.values()
    }

    /// Iterate ask levels from best (lowest) to worst.
    pub fn ask_levels(&self) -> impl Iterator<Item = &PriceLevel> {
        self.asks.values()
    }
}
