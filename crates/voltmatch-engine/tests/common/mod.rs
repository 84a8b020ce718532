//! Shared harness for the marketplace integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::Duration;
use rust_decimal::Decimal;
use voltmatch_engine::{Clock, InMemoryRepository, ManualClock, Marketplace, SubmitReceipt};
use voltmatch_settlement::InMemoryLedger;
use voltmatch_types::{
    BackoffConfig, EngineConfig, MarketId, OfferPriority, OfferRequest, OfferSide, UserId,
};

pub const ZONE: &str = "zone-test";

pub fn dec(n: i64) -> Decimal {
    Decimal::new(n, 0)
}

/// A running marketplace on one market with an in-memory store and ledger.
pub struct Harness {
    pub market: Marketplace,
    pub zone: MarketId,
    pub ledger: Arc<InMemoryLedger>,
    pub store: Arc<InMemoryRepository>,
    pub clock: Arc<ManualClock>,
    pub arbiter: UserId,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Default test config (one market, three immediate ledger attempts,
    /// one arbiter) adjusted by `tweak`.
    pub async fn with_config(tweak: impl FnOnce(&mut EngineConfig)) -> Self {
        let arbiter = UserId::new();
        let mut config = EngineConfig::single_market(ZONE);
        config.backoff = BackoffConfig {
            initial_delay_ms: 0,
            multiplier: 1,
            max_delay_ms: 0,
            max_attempts: 3,
        };
        config.arbiters.push(arbiter);
        tweak(&mut config);

        let store = Arc::new(InMemoryRepository::new());
        let ledger = Arc::new(InMemoryLedger::with_opening_balance(dec(10_000), dec(10_000)));
        let clock = Arc::new(ManualClock::default());
        let market = Marketplace::start(config, store.clone(), ledger.clone(), clock.clone())
            .await
            .expect("marketplace should start");

        Self {
            market,
            zone: MarketId::new(ZONE),
            ledger,
            store,
            clock,
            arbiter,
        }
    }

    /// An offer request expiring one hour from the harness clock.
    pub fn request(&self, owner: UserId, side: OfferSide, price: i64, amount: i64) -> OfferRequest {
        OfferRequest {
            owner_id: owner,
            side,
            energy_amount: dec(amount),
            price_per_unit: dec(price),
            expires_at: self.clock.now() + Duration::hours(1),
            priority: OfferPriority::Medium,
        }
    }

    pub async fn sell(&self, owner: UserId, price: i64, amount: i64) -> SubmitReceipt {
        self.market
            .submit_offer(&self.zone, self.request(owner, OfferSide::Sell, price, amount))
            .await
            .expect("sell offer should be accepted")
    }

    pub async fn buy(&self, owner: UserId, price: i64, amount: i64) -> SubmitReceipt {
        self.market
            .submit_offer(&self.zone, self.request(owner, OfferSide::Buy, price, amount))
            .await
            .expect("buy offer should be accepted")
    }
}
