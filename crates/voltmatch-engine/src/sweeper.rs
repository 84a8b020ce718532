//! Expiration sweeper.
//!
//! On every tick: retire resting offers past `expires_at` (through each
//! market's sequencer, so the book and the store change together), retry
//! the escrow lock of trades left MATCHED past the grace period, and open
//! timeout disputes for ESCROW_LOCKED trades past their delivery deadline.
//! One failing market or trade does not stop the rest of the sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use voltmatch_types::{DisputeId, OfferId, Result, TradeId, TradeStatus};

use crate::clock::Clock;
use crate::coordinator::EscrowCoordinator;
use crate::markets::MarketRegistry;
use crate::store::Repository;

/// What one sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_offers: Vec<OfferId>,
    /// Stranded MATCHED trades whose escrow lock was driven to an outcome.
    pub relocked_trades: Vec<TradeId>,
    /// Trades moved to DISPUTED, with the timeout dispute opened for each.
    pub timed_out_trades: Vec<(TradeId, DisputeId)>,
}

impl SweepReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.expired_offers.is_empty()
            && self.relocked_trades.is_empty()
            && self.timed_out_trades.is_empty()
    }
}

pub struct ExpirationSweeper {
    markets: Arc<MarketRegistry>,
    coordinator: Arc<EscrowCoordinator>,
    store: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    matched_grace: chrono::Duration,
}

impl ExpirationSweeper {
    #[must_use]
    pub fn new(
        markets: Arc<MarketRegistry>,
        coordinator: Arc<EscrowCoordinator>,
        store: Arc<dyn Repository>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        matched_grace: chrono::Duration,
    ) -> Self {
        Self {
            markets,
            coordinator,
            store,
            clock,
            interval,
            matched_grace,
        }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for handle in self.markets.handles() {
            match handle.sweep().await {
                Ok(expired) => report.expired_offers.extend(expired),
                Err(err) => warn!(market = %handle.market(), error = %err, "offer sweep failed"),
            }
        }

        let now = self.clock.now();
        for stored in self.store.trades_in_status(TradeStatus::Matched).await? {
            let trade = stored.value;
            let due = trade.matched_at.checked_add_signed(self.matched_grace);
            if due.is_none_or(|due| due > now) {
                continue;
            }
            match self.coordinator.lock_escrow(trade.id).await {
                Ok(after) if after.status != TradeStatus::Matched => {
                    info!(trade = %trade.id, status = %after.status, "stranded trade re-driven");
                    report.relocked_trades.push(trade.id);
                }
                Ok(_) => {}
                Err(err) => warn!(trade = %trade.id, error = %err, "escrow lock retry failed"),
            }
        }

        for stored in self.store.trades_in_status(TradeStatus::EscrowLocked).await? {
            let trade = stored.value;
            if !trade.delivery_overdue(now) {
                continue;
            }
            match self.coordinator.expire_delivery(trade.id).await {
                Ok(Some(dispute)) => report.timed_out_trades.push((trade.id, dispute.id)),
                Ok(None) => {}
                Err(err) => warn!(trade = %trade.id, error = %err, "delivery timeout failed"),
            }
        }

        if report.is_empty() {
            debug!("sweep found nothing");
        } else {
            info!(
                expired_offers = report.expired_offers.len(),
                relocked_trades = report.relocked_trades.len(),
                timed_out_trades = report.timed_out_trades.len(),
                "sweep complete"
            );
        }
        Ok(report)
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX), "sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.sweep_once().await {
                            error!(error = %err, "sweep failed");
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("sweeper shutdown signal received");
                        break;
                    }
                }
            }
            info!("sweeper stopped");
        })
    }
}
