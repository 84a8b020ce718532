//! A single price level in the order book.
//!
//! Offers at the same price are keyed by `(created_at, sequence)` so that
//! time priority survives removal and re-insertion: an offer restored after
//! a failed escrow lock goes back to its original place in the queue.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use voltmatch_types::{Offer, OfferId, OfferSide, UserId};

/// Time-priority key within a level: arrival time, then sequencer order.
pub type TimeKey = (DateTime<Utc>, u64);

/// The book's lightweight view of an offer.
///
/// The offer store owns the full record; the book only keeps what matching
/// needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestingOffer {
    pub offer_id: OfferId,
    pub owner_id: UserId,
    pub side: OfferSide,
    pub price: Decimal,
    pub remaining: Decimal,
    pub created_at: DateTime<Utc>,
    pub sequence: u64,
    pub expires_at: DateTime<Utc>,
}

impl RestingOffer {
    #[must_use]
    pub fn from_offer(offer: &Offer) -> Self {
        Self {
            offer_id: offer.id,
            owner_id: offer.owner_id,
            side: offer.side,
            price: offer.price_per_unit,
            remaining: offer.remaining_amount,
            created_at: offer.created_at,
            sequence: offer.sequence,
            expires_at: offer.expires_at,
        }
    }

    #[must_use]
    pub fn time_key(&self) -> TimeKey {
        (self.created_at, self.sequence)
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// All resting offers at one price, oldest first.
#[derive(Debug, Clone)]
pub struct PriceLevel {
    /// The price at this level.
    pub price: Decimal,
    offers: BTreeMap<TimeKey, RestingOffer>,
}

impl PriceLevel {
    /// Create a new empty price level.
    #[must_use]
    pub fn new(price: Decimal) -> Self {
        Self {
            price,
            offers: BTreeMap::new(),
        }
    }

    /// Insert at the offer's time-priority position.
    pub fn insert(&mut self, offer: RestingOffer) {
        self.offers.insert(offer.time_key(), offer);
    }

    /// Remove the offer stored under `key`.
    pub fn remove(&mut self, key: &TimeKey) -> Option<RestingOffer> {
        self.offers.remove(key)
    }

    #[must_use]
    pub fn get(&self, key: &TimeKey) -> Option<&RestingOffer> {
        self.offers.get(key)
    }

    pub fn get_mut(&mut self, key: &TimeKey) -> Option<&mut RestingOffer> {
        self.offers.get_mut(key)
    }

    /// Peek at the oldest offer without removing it.
    #[must_use]
    pub fn front(&self) -> Option<&RestingOffer> {
        self.offers.values().next()
    }

    /// Iterate offers in time-priority order.
    pub fn iter(&self) -> impl Iterator<Item = &RestingOffer> {
        self.offers.values()
    }

    /// Number of offers queued ahead of `key` at this level.
    #[must_use]
    pub fn queue_position(&self, key: &TimeKey) -> usize {
        self.offers.range(..*key).count()
    }

    /// Total remaining quantity across all offers at this level.
    #[must_use]
    pub fn total_quantity(&self) -> Decimal {
        self.offers.values().map(|o| o.remaining).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.offers.len()
    }
}
