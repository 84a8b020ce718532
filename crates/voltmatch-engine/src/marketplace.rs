//! The marketplace facade.
//!
//! [`Marketplace`] wires the components together and exposes the client
//! operations:
//!
//! ```text
//!                     ┌──────────────┐
//! submit / cancel ───▶│  sequencer   │──▶ Offer Store
//!  (per market)       │ (order book) │
//!                     └──────┬───────┘
//!                            │ MATCHED trades
//!                            ▼
//! confirm / dispute ─▶ EscrowCoordinator ──▶ SettlementAdapter
//!                            ▲
//!                   ExpirationSweeper (interval)
//! ```
//!
//! Escrow locks run in background tasks after each match; call
//! [`Marketplace::flush_escrow`] to wait for them.

use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use voltmatch_matchcore::{DepthSnapshot, RestingOffer};
use voltmatch_settlement::{BackoffPolicy, SettlementAdapter};
use voltmatch_types::{
    Dispute, DisputeId, EngineConfig, MarketId, Offer, OfferId, OfferRequest, Resolution, Result,
    Trade, TradeId, TradeStatus, UserId, VoltmatchError,
};

use crate::clock::Clock;
use crate::coordinator::{EscrowCoordinator, EscrowQueue};
use crate::dispute::{DisputeDesk, ResolutionOutcome};
use crate::markets::MarketRegistry;
use crate::sequencer::SubmitReceipt;
use crate::store::Repository;
use crate::sweeper::{ExpirationSweeper, SweepReport};

pub struct Marketplace {
    store: Arc<dyn Repository>,
    markets: Arc<MarketRegistry>,
    coordinator: Arc<EscrowCoordinator>,
    disputes: DisputeDesk,
    sweeper: Arc<ExpirationSweeper>,
    escrow: EscrowQueue,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Marketplace {
    /// Validate `config`, rebuild every market's book from `store` and start
    /// the sequencers and the escrow dispatcher. Must run inside a Tokio
    /// runtime. The sweeper is started separately with
    /// [`Marketplace::spawn_sweeper`].
    pub async fn start(
        config: EngineConfig,
        store: Arc<dyn Repository>,
        ledger: Arc<dyn SettlementAdapter>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let (shutdown, _) = broadcast::channel(1);
        let (escrow, trades) = EscrowQueue::new();

        let (markets, mut tasks) = MarketRegistry::spawn(
            &config.markets,
            &store,
            &clock,
            &escrow,
            config.store_retry_limit,
            &shutdown,
        )
        .await?;
        let markets = Arc::new(markets);

        let coordinator = Arc::new(EscrowCoordinator::new(
            Arc::clone(&store),
            ledger,
            Arc::clone(&markets),
            Arc::clone(&clock),
            BackoffPolicy::from(&config.backoff),
            config.escrow.clone(),
            config.store_retry_limit,
        ));
        tasks.push(coordinator.spawn_dispatcher(escrow.clone(), trades, shutdown.subscribe()));

        // Trades a previous run matched but never locked.
        let stranded = store.trades_in_status(TradeStatus::Matched).await?;
        if !stranded.is_empty() {
            warn!(trades = stranded.len(), "re-queueing MATCHED trades for escrow");
        }
        for stored in stranded {
            escrow.enqueue(stored.value.id);
        }

        let disputes = DisputeDesk::new(
            Arc::clone(&coordinator),
            Arc::clone(&store),
            config.arbiters.iter().copied(),
        );
        let sweeper = Arc::new(ExpirationSweeper::new(
            Arc::clone(&markets),
            Arc::clone(&coordinator),
            Arc::clone(&store),
            clock,
            config.sweeper.interval(),
            config.sweeper.matched_grace(),
        ));

        info!(
            markets = markets.len(),
            arbiters = config.arbiters.len(),
            "marketplace started"
        );

        Ok(Self {
            store,
            markets,
            coordinator,
            disputes,
            sweeper,
            escrow,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    // =================================================================
    // Offers
    // =================================================================

    /// Match `request` against `market` and rest any remainder.
    pub async fn submit_offer(&self, market: &MarketId, request: OfferRequest) -> Result<SubmitReceipt> {
        self.markets.get(market)?.submit(request).await
    }

    /// Cancel an open offer. Only its owner may do so.
    pub async fn cancel_offer(&self, offer_id: OfferId, requester: UserId) -> Result<Offer> {
        let offer = self.get_offer(offer_id).await?;
        self.markets
            .get(&offer.market)?
            .cancel(offer_id, requester)
            .await
    }

    pub async fn get_offer(&self, offer_id: OfferId) -> Result<Offer> {
        self.store
            .load_offer(offer_id)
            .await?
            .map(|stored| stored.value)
            .ok_or(VoltmatchError::OfferNotFound(offer_id))
    }

    // =================================================================
    // Book queries
    // =================================================================

    pub async fn best_bid(&self, market: &MarketId) -> Result<Option<RestingOffer>> {
        Ok(self.markets.get(market)?.top().await?.best_bid)
    }

    pub async fn best_ask(&self, market: &MarketId) -> Result<Option<RestingOffer>> {
        Ok(self.markets.get(market)?.top().await?.best_ask)
    }

    pub async fn depth(&self, market: &MarketId, levels: usize) -> Result<DepthSnapshot> {
        self.markets.get(market)?.depth(levels).await
    }

    /// Accept new offers on `market` again.
    pub async fn open_market(&self, market: &MarketId) -> Result<()> {
        self.markets.get(market)?.set_active(true).await
    }

    /// Reject new offers on `market`. Resting offers and trades in flight
    /// are unaffected.
    pub async fn close_market(&self, market: &MarketId) -> Result<()> {
        self.markets.get(market)?.set_active(false).await
    }

    // =================================================================
    // Trades
    // =================================================================

    pub async fn get_trade(&self, trade_id: TradeId) -> Result<Trade> {
        self.store
            .load_trade(trade_id)
            .await?
            .map(|stored| stored.value)
            .ok_or(VoltmatchError::TradeNotFound(trade_id))
    }

    pub async fn confirm_delivery(
        &self,
        trade_id: TradeId,
        delivered: Decimal,
        evidence_ref: impl Into<String>,
    ) -> Result<Trade> {
        self.coordinator
            .confirm_delivery(trade_id, delivered, evidence_ref.into())
            .await
    }

    /// Wait until every escrow lock started so far has finished.
    pub async fn flush_escrow(&self) {
        self.escrow.idle().await;
    }

    // =================================================================
    // Disputes
    // =================================================================

    pub async fn raise_dispute(
        &self,
        trade_id: TradeId,
        raised_by: UserId,
        reason: impl Into<String>,
    ) -> Result<Dispute> {
        self.disputes.raise(trade_id, raised_by, reason.into()).await
    }

    pub async fn resolve_dispute(
        &self,
        dispute_id: DisputeId,
        resolved_by: UserId,
        resolution: Resolution,
    ) -> Result<ResolutionOutcome> {
        self.disputes.resolve(dispute_id, resolved_by, resolution).await
    }

    pub async fn get_dispute(&self, dispute_id: DisputeId) -> Result<Dispute> {
        self.store
            .load_dispute(dispute_id)
            .await?
            .map(|stored| stored.value)
            .ok_or(VoltmatchError::DisputeNotFound(dispute_id))
    }

    /// The unresolved dispute on `trade_id`, if any.
    pub async fn active_dispute(&self, trade_id: TradeId) -> Result<Option<Dispute>> {
        Ok(self
            .store
            .active_dispute(trade_id)
            .await?
            .map(|stored| stored.value))
    }

    // =================================================================
    // Lifecycle
    // =================================================================

    /// Run one expiration sweep now.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        self.sweeper.sweep_once().await
    }

    /// Start sweeping on the configured interval.
    pub async fn spawn_sweeper(&self) {
        let task = Arc::clone(&self.sweeper).spawn(self.shutdown.subscribe());
        self.tasks.lock().await.push(task);
    }

    /// Stop every background task and wait for them to exit.
    pub async fn shutdown(&self) {
        info!("marketplace shutting down");
        // Receivers are gone when every task already stopped.
        let _ = self.shutdown.send(());
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "background task ended abnormally");
            }
        }
    }
}
