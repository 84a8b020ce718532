//! Engine lifecycle: startup validation, market isolation, shutdown and
//! rebuilding the books from the Offer Store after a restart.

mod common;

use std::sync::Arc;

use common::{Harness, ZONE, dec};
use voltmatch_engine::{InMemoryRepository, ManualClock, Marketplace};
use voltmatch_settlement::InMemoryLedger;
use voltmatch_types::{
    EngineConfig, MarketConfig, MarketId, OfferSide, OfferStatus, TradeStatus, UserId,
    VoltmatchError,
};

#[tokio::test]
async fn start_rejects_invalid_config() {
    let result = Marketplace::start(
        EngineConfig::default(),
        Arc::new(InMemoryRepository::new()),
        Arc::new(InMemoryLedger::new()),
        Arc::new(ManualClock::default()),
    )
    .await;
    assert!(matches!(result, Err(VoltmatchError::Configuration(_))));
}

#[tokio::test]
async fn markets_match_independently() {
    let h = Harness::with_config(|config| config.markets.push(MarketConfig::new("zone-north"))).await;
    let north = MarketId::new("zone-north");

    h.sell(UserId::new(), 10, 5).await;
    let receipt = h
        .market
        .submit_offer(&north, h.request(UserId::new(), OfferSide::Buy, 10, 5))
        .await
        .unwrap();
    assert!(receipt.trades.is_empty());

    assert!(h.market.best_ask(&h.zone).await.unwrap().is_some());
    assert!(h.market.best_bid(&h.zone).await.unwrap().is_none());
    assert!(h.market.best_bid(&north).await.unwrap().is_some());

    // Closing one market leaves the other open.
    h.market.close_market(&north).await.unwrap();
    assert_eq!(h.buy(UserId::new(), 10, 5).await.trades.len(), 1);
}

#[tokio::test]
async fn restart_rebuilds_books_from_store() {
    let h = Harness::new().await;
    let first = h.sell(UserId::new(), 10, 5).await;
    let partial = h.sell(UserId::new(), 11, 8).await;
    h.buy(UserId::new(), 11, 5 + 3).await;
    h.market.flush_escrow().await;
    h.market.shutdown().await;

    assert!(matches!(
        h.market.best_ask(&h.zone).await,
        Err(VoltmatchError::SequencerUnavailable(_))
    ));

    let restarted = Marketplace::start(
        EngineConfig::single_market(ZONE),
        h.store.clone(),
        h.ledger.clone(),
        h.clock.clone(),
    )
    .await
    .unwrap();

    let best = restarted.best_ask(&h.zone).await.unwrap().unwrap();
    assert_eq!(best.offer_id, partial.offer_id);
    assert_eq!(best.remaining, dec(5));
    assert_eq!(
        restarted.get_offer(first.offer_id).await.unwrap().status,
        OfferStatus::Filled
    );

    // New offers queue behind the ones restored from the store.
    let late = restarted
        .submit_offer(&h.zone, h.request(UserId::new(), OfferSide::Sell, 11, 1))
        .await
        .unwrap();
    let receipt = restarted
        .submit_offer(&h.zone, h.request(UserId::new(), OfferSide::Buy, 11, 5))
        .await
        .unwrap();
    assert_eq!(receipt.trades.len(), 1);
    assert_eq!(receipt.trades[0].sell_offer_id, partial.offer_id);
    assert_eq!(
        restarted.best_ask(&h.zone).await.unwrap().unwrap().offer_id,
        late.offer_id
    );

    restarted.shutdown().await;
}

#[tokio::test]
async fn store_conflicts_surface_without_touching_the_book() {
    let h = Harness::with_config(|config| config.store_retry_limit = 1).await;
    h.sell(UserId::new(), 10, 5).await;
    h.store.fail_next_commits(1).await;

    let result = h
        .market
        .submit_offer(&h.zone, h.request(UserId::new(), OfferSide::Buy, 10, 5))
        .await;
    assert!(result.is_err());
    assert_eq!(h.market.best_ask(&h.zone).await.unwrap().unwrap().remaining, dec(5));
    assert_eq!(h.store.trade_count().await, 0);

    assert_eq!(h.buy(UserId::new(), 10, 5).await.trades.len(), 1);
}

#[tokio::test]
async fn restart_locks_trades_left_matched() {
    let h = Harness::new().await;
    h.sell(UserId::new(), 10, 5).await;
    h.store.fail_commits_after(1, 1).await;
    let receipt = h.buy(UserId::new(), 10, 5).await;
    h.market.flush_escrow().await;
    let trade_id = receipt.trades[0].id;
    assert_eq!(h.market.get_trade(trade_id).await.unwrap().status, TradeStatus::Matched);
    h.market.shutdown().await;

    let restarted = Marketplace::start(
        EngineConfig::single_market(ZONE),
        h.store.clone(),
        h.ledger.clone(),
        h.clock.clone(),
    )
    .await
    .unwrap();
    restarted.flush_escrow().await;

    let trade = restarted.get_trade(trade_id).await.unwrap();
    assert_eq!(trade.status, TradeStatus::EscrowLocked);
    assert!(h.ledger.is_held(trade_id).await);
    h.ledger.verify_conservation().await.unwrap();

    restarted.shutdown().await;
}
