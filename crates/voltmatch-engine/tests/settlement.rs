//! Escrow and settlement through the running marketplace.
//!
//! Each test drives a match through the background escrow lock and then
//! exercises delivery: clean settlement, idempotent confirmation, shortfall
//! and timeout disputes, and lock failures that hand quantity back to the
//! book.

mod common;

use std::sync::Arc;

use chrono::Duration;
use common::{Harness, dec};
use rust_decimal::Decimal;
use voltmatch_settlement::LedgerOp;
use voltmatch_types::{
    DisputeReason, OfferSide, OfferStatus, Trade, TradeStatus, UserId, VoltmatchError,
};

/// Match one seller against one buyer and wait for escrow.
async fn locked_trade(h: &Harness, seller: UserId, buyer: UserId, price: i64, amount: i64) -> Trade {
    h.sell(seller, price, amount).await;
    let receipt = h.buy(buyer, price, amount).await;
    assert_eq!(receipt.trades.len(), 1);
    h.market.flush_escrow().await;
    h.market.get_trade(receipt.trades[0].id).await.unwrap()
}

#[tokio::test]
async fn match_lock_and_settle() {
    let h = Harness::new().await;
    let (seller, buyer) = (UserId::new(), UserId::new());
    let trade = locked_trade(&h, seller, buyer, 12, 10).await;

    assert_eq!(trade.status, TradeStatus::EscrowLocked);
    assert!(trade.escrow_ref.is_some());
    assert_eq!(trade.delivery_deadline, Some(trade.matched_at + Duration::hours(1)));
    assert!(h.ledger.is_held(trade.id).await);
    assert_eq!(h.ledger.balance(buyer).await.value, dec(10_000 - 120));
    assert_eq!(h.ledger.balance(seller).await.credits, dec(10_000 - 10));

    let done = h.market.confirm_delivery(trade.id, dec(10), "meter-42").await.unwrap();
    assert_eq!(done.status, TradeStatus::Completed);
    assert_eq!(done.delivered_amount, Some(dec(10)));
    assert_eq!(done.evidence_ref.as_deref(), Some("meter-42"));
    assert!(done.settlement_tx_ref.is_some());
    assert!(done.completed_at.is_some());

    assert_eq!(h.ledger.balance(seller).await.value, dec(10_120));
    assert_eq!(h.ledger.balance(buyer).await.credits, dec(10_010));
    h.ledger.verify_conservation().await.unwrap();
}

#[tokio::test]
async fn confirming_twice_settles_once() {
    let h = Harness::new().await;
    let trade = locked_trade(&h, UserId::new(), UserId::new(), 10, 5).await;

    let first = h.market.confirm_delivery(trade.id, dec(5), "meter-1").await.unwrap();
    let second = h.market.confirm_delivery(trade.id, dec(5), "meter-1").await.unwrap();

    assert_eq!(first.settlement_tx_ref, second.settlement_tx_ref);
    assert_eq!(h.ledger.transfer_count().await, 1);
    assert_eq!(h.ledger.call_count(LedgerOp::Settle).await, 1);
}

#[tokio::test]
async fn concurrent_confirmations_settle_once() {
    let h = Arc::new(Harness::new().await);
    let trade = locked_trade(&h, UserId::new(), UserId::new(), 10, 5).await;

    let calls: Vec<_> = (0..8)
        .map(|_| {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.market.confirm_delivery(trade.id, dec(5), "meter").await })
        })
        .collect();
    let mut tx_refs = Vec::new();
    for call in calls {
        tx_refs.push(call.await.unwrap().unwrap().settlement_tx_ref);
    }

    assert!(tx_refs.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(h.ledger.transfer_count().await, 1);
}

#[tokio::test]
async fn delivery_within_tolerance_settles() {
    let h = Harness::new().await;
    let trade = locked_trade(&h, UserId::new(), UserId::new(), 10, 10).await;

    // 2% tolerance: 9.8 of 10 is enough.
    let done = h
        .market
        .confirm_delivery(trade.id, Decimal::new(98, 1), "meter")
        .await
        .unwrap();
    assert_eq!(done.status, TradeStatus::Completed);
}

#[tokio::test]
async fn shortfall_opens_a_dispute() {
    let h = Harness::new().await;
    let trade = locked_trade(&h, UserId::new(), UserId::new(), 10, 10).await;

    let disputed = h.market.confirm_delivery(trade.id, dec(6), "meter").await.unwrap();
    assert_eq!(disputed.status, TradeStatus::Disputed);
    assert_eq!(disputed.delivered_amount, Some(dec(6)));
    assert!(h.ledger.is_held(trade.id).await);

    let dispute = h.market.active_dispute(trade.id).await.unwrap().unwrap();
    assert!(dispute.raised_by.is_none());
    assert!(matches!(
        dispute.reason,
        DisputeReason::DeliveryShortfall { expected, delivered }
            if expected == dec(10) && delivered == dec(6)
    ));
}

#[tokio::test]
async fn invalid_delivery_reports_are_rejected() {
    let h = Harness::new().await;
    let trade = locked_trade(&h, UserId::new(), UserId::new(), 10, 10).await;

    let err = h.market.confirm_delivery(trade.id, dec(-1), "meter").await.unwrap_err();
    assert!(matches!(err, VoltmatchError::InvalidDelivery { .. }));
    assert_eq!(h.market.get_trade(trade.id).await.unwrap().status, TradeStatus::EscrowLocked);
}

#[tokio::test]
async fn missed_deadline_becomes_a_timeout_dispute() {
    let h = Harness::new().await;
    let trade = locked_trade(&h, UserId::new(), UserId::new(), 10, 10).await;

    h.clock.advance(Duration::minutes(59));
    assert!(h.market.sweep_once().await.unwrap().timed_out_trades.is_empty());

    h.clock.advance(Duration::minutes(2));
    let report = h.market.sweep_once().await.unwrap();
    assert_eq!(report.timed_out_trades.len(), 1);
    assert_eq!(report.timed_out_trades[0].0, trade.id);

    let timed_out = h.market.get_trade(trade.id).await.unwrap();
    assert_eq!(timed_out.status, TradeStatus::Disputed);
    let dispute = h.market.active_dispute(trade.id).await.unwrap().unwrap();
    assert!(matches!(dispute.reason, DisputeReason::DeliveryTimeout { .. }));

    // Late delivery reports no longer settle.
    let err = h.market.confirm_delivery(trade.id, dec(10), "meter").await.unwrap_err();
    assert!(matches!(err, VoltmatchError::InvalidTransition { .. }));

    let again = h.market.sweep_once().await.unwrap();
    assert!(again.timed_out_trades.is_empty());
}

#[tokio::test]
async fn transient_lock_failures_are_retried() {
    let h = Harness::new().await;
    h.ledger.fail_next(LedgerOp::Lock, 2).await;
    let trade = locked_trade(&h, UserId::new(), UserId::new(), 10, 4).await;

    assert_eq!(trade.status, TradeStatus::EscrowLocked);
    assert_eq!(h.ledger.call_count(LedgerOp::Lock).await, 3);
}

#[tokio::test]
async fn unreachable_ledger_cancels_and_restores_offers() {
    let h = Harness::new().await;
    let ask = h.sell(UserId::new(), 10, 10).await;
    h.ledger.set_offline(true).await;

    let bid = h.buy(UserId::new(), 10, 4).await;
    h.market.flush_escrow().await;

    let trade = h.market.get_trade(bid.trades[0].id).await.unwrap();
    assert_eq!(trade.status, TradeStatus::Cancelled);
    assert!(trade.cancel_reason.is_some());
    assert_eq!(h.ledger.call_count(LedgerOp::Lock).await, 3);

    let ask = h.market.get_offer(ask.offer_id).await.unwrap();
    assert_eq!(ask.status, OfferStatus::Open);
    assert_eq!(ask.remaining_amount, dec(10));
    let bid = h.market.get_offer(bid.offer_id).await.unwrap();
    assert_eq!(bid.status, OfferStatus::Open);
    assert_eq!(bid.remaining_amount, dec(4));

    // Restored offers rest again without being re-matched.
    let top = h.market.best_ask(&h.zone).await.unwrap().unwrap();
    assert_eq!(top.offer_id, ask.id);
    assert_eq!(top.remaining, dec(10));
}

#[tokio::test]
async fn rejected_lock_cancels_without_retry() {
    let h = Harness::new().await;
    h.ledger
        .reject_locks(Some("buyer account frozen".into()))
        .await;
    let trade = locked_trade(&h, UserId::new(), UserId::new(), 10, 5).await;

    assert_eq!(trade.status, TradeStatus::Cancelled);
    assert!(
        trade
            .cancel_reason
            .as_deref()
            .is_some_and(|reason| reason.contains("buyer account frozen"))
    );
    assert_eq!(h.ledger.call_count(LedgerOp::Lock).await, 1);
    assert!(!h.ledger.is_held(trade.id).await);
}

#[tokio::test]
async fn insufficient_funds_cancel_the_trade() {
    let h = Harness::new().await;
    let (seller, buyer) = (UserId::new(), UserId::new());
    // 11 kWh at 1000 is more than the buyer's opening balance.
    let trade = locked_trade(&h, seller, buyer, 1_000, 11).await;

    assert_eq!(trade.status, TradeStatus::Cancelled);
    assert!(
        trade
            .cancel_reason
            .as_deref()
            .is_some_and(|reason| reason.contains("insufficient value"))
    );
}

#[tokio::test]
async fn settle_outage_keeps_escrow_locked() {
    let h = Harness::new().await;
    let trade = locked_trade(&h, UserId::new(), UserId::new(), 10, 5).await;
    h.ledger.fail_next(LedgerOp::Settle, 10).await;

    let err = h.market.confirm_delivery(trade.id, dec(5), "meter").await.unwrap_err();
    assert!(matches!(err, VoltmatchError::RetriesExhausted { .. }));
    let stuck = h.market.get_trade(trade.id).await.unwrap();
    assert_eq!(stuck.status, TradeStatus::EscrowLocked);
    assert!(stuck.settlement_tx_ref.is_none());

    h.ledger.fail_next(LedgerOp::Settle, 0).await;
    let done = h.market.confirm_delivery(trade.id, dec(5), "meter").await.unwrap();
    assert_eq!(done.status, TradeStatus::Completed);
    assert_eq!(h.ledger.transfer_count().await, 1);
}

#[tokio::test]
async fn oversized_trade_value_is_rejected_at_submit() {
    let h = Harness::new().await;
    let huge = 1_000_000_000_000_000;
    let err = h
        .market
        .submit_offer(&h.zone, h.request(UserId::new(), OfferSide::Sell, huge, huge))
        .await
        .unwrap_err();
    assert!(matches!(err, VoltmatchError::InvalidOffer { .. }));
    assert!(h.market.best_ask(&h.zone).await.unwrap().is_none());

    // The engine keeps matching and locking afterwards.
    let trade = locked_trade(&h, UserId::new(), UserId::new(), 10, 5).await;
    assert_eq!(trade.status, TradeStatus::EscrowLocked);
}

#[tokio::test]
async fn stranded_match_is_locked_by_the_sweeper() {
    let h = Harness::new().await;
    let buyer = UserId::new();
    h.sell(UserId::new(), 10, 5).await;
    // The buy commits; the escrow lock's commit is lost.
    h.store.fail_commits_after(1, 1).await;
    let receipt = h.buy(buyer, 10, 5).await;
    h.market.flush_escrow().await;

    let trade_id = receipt.trades[0].id;
    assert_eq!(h.market.get_trade(trade_id).await.unwrap().status, TradeStatus::Matched);
    assert!(h.ledger.is_held(trade_id).await);

    // Inside the grace period the sweeper leaves it to the dispatcher.
    assert!(h.market.sweep_once().await.unwrap().relocked_trades.is_empty());

    h.clock.advance(Duration::seconds(61));
    let report = h.market.sweep_once().await.unwrap();
    assert_eq!(report.relocked_trades, vec![trade_id]);

    let trade = h.market.get_trade(trade_id).await.unwrap();
    assert_eq!(trade.status, TradeStatus::EscrowLocked);
    assert!(trade.escrow_ref.is_some());
    assert_eq!(h.ledger.balance(buyer).await.value, dec(10_000 - 50));
    h.ledger.verify_conservation().await.unwrap();
}

#[tokio::test]
async fn lost_settlement_commit_completes_on_next_sweep() {
    let h = Harness::new().await;
    let (seller, buyer) = (UserId::new(), UserId::new());
    let trade = locked_trade(&h, seller, buyer, 10, 5).await;
    // The delivery report commits; the settlement's commit is lost.
    h.store.fail_commits_after(1, 1).await;

    let err = h.market.confirm_delivery(trade.id, dec(5), "meter-7").await.unwrap_err();
    assert!(matches!(err, VoltmatchError::Store(_)));
    let stuck = h.market.get_trade(trade.id).await.unwrap();
    assert_eq!(stuck.status, TradeStatus::EscrowLocked);
    assert_eq!(stuck.delivered_amount, Some(dec(5)));
    assert!(!h.ledger.is_held(trade.id).await);

    h.clock.advance(Duration::hours(2));
    let report = h.market.sweep_once().await.unwrap();
    assert!(report.timed_out_trades.is_empty());

    let done = h.market.get_trade(trade.id).await.unwrap();
    assert_eq!(done.status, TradeStatus::Completed);
    assert_eq!(done.evidence_ref.as_deref(), Some("meter-7"));
    assert!(done.settlement_tx_ref.is_some());
    assert!(h.market.active_dispute(trade.id).await.unwrap().is_none());
    assert_eq!(h.ledger.transfer_count().await, 1);
    assert_eq!(h.ledger.balance(seller).await.value, dec(10_050));
    h.ledger.verify_conservation().await.unwrap();
}
