//! Escrow & Settlement Coordinator.
//!
//! Owns every trade transition after MATCHED. Ledger calls go through the
//! [`SettlementAdapter`] wrapped in a [`BackoffPolicy`]; the resulting state
//! change is then committed with the trade's version, re-reading and
//! retrying on conflict.
//!
//! ## Ordering
//!
//! ```text
//! commit intent ─▶ ledger call (idempotent per trade) ─▶ commit trade + escrow (+ dispute)
//! ```
//!
//! Before value moves, settlement records the delivered amount on the
//! ESCROW_LOCKED trade and dispute resolution records the chosen outcome on
//! the dispute. If the final commit is lost, the next operation on the trade
//! finishes the recorded intent rather than picking a new outcome. A lost
//! lock commit leaves the trade MATCHED; the sweeper and engine start
//! re-drive it and the ledger hands back the existing hold.
//!
//! Operations on one trade are serialized by a per-trade async lock, so a
//! delivery confirmation can never race a timeout or a dispute resolution
//! inside one engine. Across engines the version check decides.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use rust_decimal::Decimal;
use tokio::sync::{OwnedMutexGuard, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use voltmatch_settlement::{BackoffPolicy, LockRequest, SettlementAdapter};
use voltmatch_types::{
    Dispute, DisputeId, DisputeReason, EscrowConfig, EscrowRecord, LedgerRef, Resolution, Result,
    SettlementSplit, Trade, TradeEvent, TradeId, TradeStatus, UserId, VoltmatchError,
};

use crate::clock::Clock;
use crate::markets::MarketRegistry;
use crate::store::{Repository, Versioned, WriteBatch};

// =====================================================================
// Escrow queue
// =====================================================================

/// Hands freshly matched trades from the sequencers to the coordinator.
///
/// Tracks how many locks are still in flight so callers can wait for the
/// queue to drain.
#[derive(Debug, Clone)]
pub struct EscrowQueue {
    trades: mpsc::UnboundedSender<TradeId>,
    pending: Arc<watch::Sender<usize>>,
}

impl EscrowQueue {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TradeId>) {
        let (trades, receiver) = mpsc::unbounded_channel();
        let (pending, _) = watch::channel(0);
        (
            Self {
                trades,
                pending: Arc::new(pending),
            },
            receiver,
        )
    }

    pub fn enqueue(&self, trade_id: TradeId) {
        self.pending.send_modify(|n| *n += 1);
        if self.trades.send(trade_id).is_err() {
            warn!(trade = %trade_id, "escrow dispatcher gone, trade left MATCHED");
            self.done();
        }
    }

    fn done(&self) {
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
    }

    fn in_flight(&self) -> InFlight {
        InFlight(self.clone())
    }

    /// Locks queued or running.
    #[must_use]
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Wait until every queued lock has finished.
    pub async fn idle(&self) {
        let mut pending = self.pending.subscribe();
        let _ = pending.wait_for(|n| *n == 0).await;
    }
}

/// One dispatched lock; counts it done on drop, panics included.
struct InFlight(EscrowQueue);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.done();
    }
}

// =====================================================================
// Per-trade serialization
// =====================================================================

#[derive(Debug, Default)]
struct TradeLocks {
    held: Mutex<HashMap<TradeId, Arc<tokio::sync::Mutex<()>>>>,
}

impl TradeLocks {
    async fn acquire(&self, trade_id: TradeId) -> TradeGuard<'_> {
        let lock = {
            let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(held.entry(trade_id).or_default())
        };
        TradeGuard {
            guard: Some(lock.lock_owned().await),
            locks: self,
            trade_id,
        }
    }

    /// Forget the lock once nobody holds or waits for it.
    fn prune(&self, trade_id: TradeId) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held.get(&trade_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            held.remove(&trade_id);
        }
    }
}

struct TradeGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a TradeLocks,
    trade_id: TradeId,
}

impl Drop for TradeGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.prune(self.trade_id);
    }
}

// =====================================================================
// Coordinator
// =====================================================================

/// Drives trades from MATCHED to COMPLETED or CANCELLED.
pub struct EscrowCoordinator {
    store: Arc<dyn Repository>,
    ledger: Arc<dyn SettlementAdapter>,
    markets: Arc<MarketRegistry>,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
    escrow: EscrowConfig,
    retry_limit: u32,
    locks: TradeLocks,
}

impl EscrowCoordinator {
    #[must_use]
    pub fn new(
        store: Arc<dyn Repository>,
        ledger: Arc<dyn SettlementAdapter>,
        markets: Arc<MarketRegistry>,
        clock: Arc<dyn Clock>,
        backoff: BackoffPolicy,
        escrow: EscrowConfig,
        retry_limit: u32,
    ) -> Self {
        Self {
            store,
            ledger,
            markets,
            clock,
            backoff,
            escrow,
            retry_limit: retry_limit.max(1),
            locks: TradeLocks::default(),
        }
    }

    /// Lock escrow for every trade arriving on `trades`, each in its own task.
    pub fn spawn_dispatcher(
        self: &Arc<Self>,
        queue: EscrowQueue,
        mut trades: mpsc::UnboundedReceiver<TradeId>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    next = trades.recv() => {
                        let Some(trade_id) = next else { break };
                        let coordinator = Arc::clone(&coordinator);
                        let in_flight = queue.in_flight();
                        tokio::spawn(async move {
                            let _in_flight = in_flight;
                            if let Err(err) = coordinator.lock_escrow(trade_id).await {
                                error!(trade = %trade_id, error = %err, "escrow lock aborted, trade left MATCHED");
                            }
                        });
                    }
                    _ = shutdown.recv() => break,
                }
            }
            info!("escrow dispatcher stopped");
        })
    }

    // =================================================================
    // Lock
    // =================================================================

    /// Reserve the buyer's value and the seller's credits for a MATCHED
    /// trade.
    ///
    /// A rejection or an exhausted retry budget cancels the trade and
    /// restores its offers. Trades no longer MATCHED are returned as they
    /// are. Any other error leaves the trade MATCHED and safe to retry.
    pub async fn lock_escrow(&self, trade_id: TradeId) -> Result<Trade> {
        let _guard = self.locks.acquire(trade_id).await;
        let trade = self.load_trade(trade_id).await?.value;
        if trade.status != TradeStatus::Matched {
            debug!(trade = %trade_id, status = %trade.status, "lock skipped");
            return Ok(trade);
        }

        let request = LockRequest {
            trade_id,
            payer: trade.buyer_id,
            payee: trade.seller_id,
            value: trade.value()?,
            energy_credits: trade.matched_amount,
        };
        let locked = self
            .backoff
            .run(trade_id, "lock", || self.ledger.lock(&request))
            .await;

        match locked {
            Ok(escrow_ref) => self.record_lock(trade_id, escrow_ref).await,
            Err(err @ (VoltmatchError::LedgerRejected { .. } | VoltmatchError::RetriesExhausted { .. })) => {
                warn!(trade = %trade_id, error = %err, "escrow lock failed, cancelling trade");
                let handle = self.markets.get(&trade.market)?;
                match handle.cancel_trade(trade_id, err.to_string()).await {
                    Ok(cancelled) => Ok(cancelled),
                    Err(VoltmatchError::InvalidTransition { .. }) => {
                        Ok(self.load_trade(trade_id).await?.value)
                    }
                    Err(other) => Err(other),
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn record_lock(&self, trade_id: TradeId, escrow_ref: LedgerRef) -> Result<Trade> {
        let now = self.clock.now();
        let deadline = now + self.escrow.delivery_deadline();
        let recorded = self
            .update_trade(trade_id, |trade, escrow, batch| {
                trade.transition(TradeEvent::EscrowLocked, now)?;
                trade.escrow_ref = Some(escrow_ref.clone());
                trade.delivery_deadline = Some(deadline);
                if escrow.is_none() {
                    batch.insert(EscrowRecord::locked(
                        trade_id,
                        trade.value()?,
                        trade.matched_amount,
                        escrow_ref.clone(),
                        now,
                    ));
                }
                Ok(trade.clone())
            })
            .await;

        match recorded {
            Ok(trade) => {
                info!(trade = %trade_id, escrow = %escrow_ref.0, %deadline, "escrow locked");
                Ok(trade)
            }
            Err(VoltmatchError::InvalidTransition { from, .. }) => {
                let current = self.load_trade(trade_id).await?.value;
                if current.status != TradeStatus::Cancelled {
                    debug!(trade = %trade_id, status = %from, "escrow lock already recorded");
                    return Ok(current);
                }
                // Cancelled while the lock was in flight; give the
                // reservation back.
                warn!(trade = %trade_id, "late escrow lock on cancelled trade, refunding");
                self.backoff
                    .run(trade_id, "refund", || self.ledger.refund(trade_id, &escrow_ref))
                    .await?;
                Ok(current)
            }
            Err(err) => Err(err),
        }
    }

    // =================================================================
    // Delivery
    // =================================================================

    /// Record a delivery report for an ESCROW_LOCKED trade.
    ///
    /// Within the shortfall tolerance the escrow is released to the seller
    /// and the trade completes. Below it, a dispute is opened instead and
    /// the trade becomes DISPUTED. Repeating the call on a COMPLETED trade
    /// returns it unchanged, and repeating it after an interrupted
    /// settlement finishes that settlement with the first report.
    pub async fn confirm_delivery(
        &self,
        trade_id: TradeId,
        delivered: Decimal,
        evidence_ref: String,
    ) -> Result<Trade> {
        let _guard = self.locks.acquire(trade_id).await;
        let trade = self.load_trade(trade_id).await?.value;
        match trade.status {
            TradeStatus::Completed => return Ok(trade),
            TradeStatus::EscrowLocked => {}
            from => {
                return Err(VoltmatchError::InvalidTransition {
                    trade_id,
                    from,
                    event: TradeEvent::DeliveryConfirmed,
                });
            }
        }
        if let Some(done) = self.resume_settlement(&trade).await? {
            return Ok(done);
        }
        if delivered < Decimal::ZERO {
            return Err(VoltmatchError::InvalidDelivery {
                trade_id,
                reason: format!("delivered amount must not be negative, got {delivered}"),
            });
        }

        let minimum = self.escrow.minimum_delivery(trade.matched_amount);
        if delivered < minimum {
            info!(trade = %trade_id, %delivered, %minimum, "delivery shortfall, opening dispute");
            let reason = DisputeReason::DeliveryShortfall {
                expected: trade.matched_amount,
                delivered,
            };
            let (_, trade) = self
                .open_dispute(
                    trade_id,
                    None,
                    reason,
                    TradeEvent::DisputeRaised,
                    Some((delivered, evidence_ref)),
                )
                .await?;
            return Ok(trade);
        }

        self.update_trade(trade_id, |trade, _, _| {
            if trade.status != TradeStatus::EscrowLocked {
                return Err(VoltmatchError::InvalidTransition {
                    trade_id,
                    from: trade.status,
                    event: TradeEvent::DeliveryConfirmed,
                });
            }
            trade.delivered_amount = Some(delivered);
            trade.evidence_ref = Some(evidence_ref.clone());
            Ok(())
        })
        .await?;
        self.settle_delivery(trade_id).await
    }

    /// Finish a settlement whose delivery report was recorded but whose
    /// final commit never landed.
    async fn resume_settlement(&self, trade: &Trade) -> Result<Option<Trade>> {
        if trade.status != TradeStatus::EscrowLocked || trade.delivered_amount.is_none() {
            return Ok(None);
        }
        warn!(trade = %trade.id, delivered = ?trade.delivered_amount, "resuming interrupted settlement");
        self.settle_delivery(trade.id).await.map(Some)
    }

    /// Release the escrow to the seller and complete the trade.
    async fn settle_delivery(&self, trade_id: TradeId) -> Result<Trade> {
        let escrow = self.load_escrow(trade_id).await?.value;
        let tx = self
            .backoff
            .run(trade_id, "settle", || {
                self.ledger.settle(trade_id, &escrow.external_ref)
            })
            .await?;

        let now = self.clock.now();
        let trade = self
            .update_trade(trade_id, |trade, escrow, _| {
                trade.transition(TradeEvent::DeliveryConfirmed, now)?;
                trade.settlement_tx_ref = Some(tx.clone());
                let release = full_release(trade)?;
                escrow
                    .ok_or(VoltmatchError::EscrowNotFound(trade_id))?
                    .close(&release, now)?;
                Ok(trade.clone())
            })
            .await?;
        info!(trade = %trade_id, tx = %tx.0, "delivery confirmed, escrow released");
        Ok(trade)
    }

    /// Open a timeout dispute if the trade's delivery deadline has passed.
    ///
    /// A trade whose delivery was already reported settles instead.
    pub async fn expire_delivery(&self, trade_id: TradeId) -> Result<Option<Dispute>> {
        let _guard = self.locks.acquire(trade_id).await;
        let trade = self.load_trade(trade_id).await?.value;
        if self.resume_settlement(&trade).await?.is_some() {
            return Ok(None);
        }
        let now = self.clock.now();
        let Some(deadline) = trade.delivery_deadline.filter(|_| trade.delivery_overdue(now)) else {
            return Ok(None);
        };
        info!(trade = %trade_id, %deadline, "delivery deadline passed, opening dispute");
        let (dispute, _) = self
            .open_dispute(
                trade_id,
                None,
                DisputeReason::DeliveryTimeout { deadline },
                TradeEvent::DeliveryTimedOut,
                None,
            )
            .await?;
        Ok(Some(dispute))
    }

    // =================================================================
    // Disputes
    // =================================================================

    /// Move an ESCROW_LOCKED trade to DISPUTED on behalf of `raised_by`.
    ///
    /// Callers check that `raised_by` may act on the trade.
    pub async fn raise_dispute(
        &self,
        trade_id: TradeId,
        raised_by: UserId,
        reason: String,
    ) -> Result<Dispute> {
        let _guard = self.locks.acquire(trade_id).await;
        let trade = self.load_trade(trade_id).await?.value;
        self.resume_settlement(&trade).await?;
        let (dispute, _) = self
            .open_dispute(
                trade_id,
                Some(raised_by),
                DisputeReason::Claim(reason),
                TradeEvent::DisputeRaised,
                None,
            )
            .await?;
        Ok(dispute)
    }

    async fn open_dispute(
        &self,
        trade_id: TradeId,
        raised_by: Option<UserId>,
        reason: DisputeReason,
        event: TradeEvent,
        delivery: Option<(Decimal, String)>,
    ) -> Result<(Dispute, Trade)> {
        if let Some(active) = self.store.active_dispute(trade_id).await? {
            return Err(VoltmatchError::DisputeAlreadyActive {
                trade_id,
                dispute_id: active.value.id,
            });
        }
        let now = self.clock.now();
        let dispute = Dispute::initiate(trade_id, raised_by, reason, now);
        let trade = self
            .update_trade(trade_id, |trade, _, batch| {
                trade.transition(event, now)?;
                if let Some((delivered, evidence_ref)) = &delivery {
                    trade.delivered_amount = Some(*delivered);
                    trade.evidence_ref = Some(evidence_ref.clone());
                }
                batch.insert(dispute.clone());
                Ok(trade.clone())
            })
            .await?;
        info!(trade = %trade_id, dispute = %dispute.id, reason = %dispute.reason, "dispute opened");
        Ok((dispute, trade))
    }

    /// Apply `resolution` to an INITIATED dispute: record it as pending on the
    /// dispute, move the escrowed value on the ledger, then resolve the
    /// dispute and transition the trade in one commit.
    ///
    /// A dispute that already carries a pending resolution finishes that one,
    /// whatever `resolution` asks for.
    ///
    /// Callers check that `resolved_by` may choose `resolution`.
    pub async fn resolve_dispute(
        &self,
        dispute_id: DisputeId,
        resolved_by: UserId,
        resolution: Resolution,
    ) -> Result<(Dispute, Trade)> {
        let trade_id = self.load_dispute(dispute_id).await?.value.trade_id;
        let _guard = self.locks.acquire(trade_id).await;

        let mut stored = self.load_dispute(dispute_id).await?;
        let replaying = stored.value.pending_resolution.is_some();
        let pending = stored.value.begin_resolution(resolution, resolved_by)?;
        if pending.resolution != resolution {
            warn!(
                trade = %trade_id,
                dispute = %dispute_id,
                requested = %resolution,
                pending = %pending.resolution,
                "finishing interrupted resolution instead"
            );
        }
        let resolution = pending.resolution;

        let trade = self.load_trade(trade_id).await?.value;
        let event = match resolution {
            Resolution::ReleaseToSeller => TradeEvent::ReleasedToSeller,
            Resolution::RefundToBuyer => TradeEvent::RefundedToBuyer,
            Resolution::PartialSplit { .. } => TradeEvent::SplitSettled,
        };
        if trade.status.apply(event).is_none() {
            return Err(VoltmatchError::InvalidTransition {
                trade_id,
                from: trade.status,
                event,
            });
        }
        let split = resolution.split(dispute_id, &trade)?;
        let escrow = self.load_escrow(trade_id).await?.value;
        let reference = &escrow.external_ref;

        if !replaying {
            let mut batch = WriteBatch::new();
            batch.update(stored.value.clone(), stored.version);
            self.store.commit(batch).await?;
            stored = self.load_dispute(dispute_id).await?;
        }

        let tx = match resolution {
            Resolution::ReleaseToSeller => Some(
                self.backoff
                    .run(trade_id, "settle", || self.ledger.settle(trade_id, reference))
                    .await?,
            ),
            Resolution::RefundToBuyer => {
                self.backoff
                    .run(trade_id, "refund", || self.ledger.refund(trade_id, reference))
                    .await?;
                None
            }
            Resolution::PartialSplit { .. } => Some(
                self.backoff
                    .run(trade_id, "split", || {
                        self.ledger.split(trade_id, reference, split.seller_value)
                    })
                    .await?,
            ),
        };

        let now = self.clock.now();
        let mut dispute = stored.value;
        dispute.resolve(resolution, pending.resolved_by, now)?;
        let trade = self
            .update_trade(trade_id, |trade, escrow, batch| {
                trade.transition(event, now)?;
                if let Some(tx) = &tx {
                    trade.settlement_tx_ref = Some(tx.clone());
                }
                if let Resolution::PartialSplit { delivered } = resolution {
                    trade.delivered_amount = Some(delivered);
                }
                escrow
                    .ok_or(VoltmatchError::EscrowNotFound(trade_id))?
                    .close(&split, now)?;
                batch.update(dispute.clone(), stored.version);
                Ok(trade.clone())
            })
            .await?;

        info!(
            trade = %trade_id,
            dispute = %dispute_id,
            %resolution,
            seller_value = %split.seller_value,
            buyer_refund = %split.buyer_refund,
            status = %trade.status,
            "dispute resolved"
        );
        Ok((dispute, trade))
    }

    // =================================================================
    // Store helpers
    // =================================================================

    async fn load_trade(&self, trade_id: TradeId) -> Result<Versioned<Trade>> {
        self.store
            .load_trade(trade_id)
            .await?
            .ok_or(VoltmatchError::TradeNotFound(trade_id))
    }

    async fn load_escrow(&self, trade_id: TradeId) -> Result<Versioned<EscrowRecord>> {
        self.store
            .load_escrow(trade_id)
            .await?
            .ok_or(VoltmatchError::EscrowNotFound(trade_id))
    }

    async fn load_dispute(&self, dispute_id: DisputeId) -> Result<Versioned<Dispute>> {
        self.store
            .load_dispute(dispute_id)
            .await?
            .ok_or(VoltmatchError::DisputeNotFound(dispute_id))
    }

    /// Read the trade and its escrow record, let `apply` change them (and add
    /// further writes), then commit everything against the versions read.
    /// Conflicts re-read and re-apply up to the retry limit.
    async fn update_trade<T, F>(&self, trade_id: TradeId, mut apply: F) -> Result<T>
    where
        F: FnMut(&mut Trade, Option<&mut EscrowRecord>, &mut WriteBatch) -> Result<T> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let stored = self.load_trade(trade_id).await?;
            let escrow = self.store.load_escrow(trade_id).await?;
            let mut trade = stored.value;
            let mut batch = WriteBatch::new();

            let out = match escrow {
                Some(Versioned {
                    value: mut record,
                    version,
                }) => {
                    let out = apply(&mut trade, Some(&mut record), &mut batch)?;
                    batch.update(record, version);
                    out
                }
                None => apply(&mut trade, None, &mut batch)?,
            };
            batch.update(trade, stored.version);

            match self.store.commit(batch).await {
                Ok(()) => return Ok(out),
                Err(err) if err.is_retryable() && attempt < self.retry_limit => {
                    warn!(trade = %trade_id, attempt, error = %err, "trade commit conflict, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Everything to the seller, nothing back to the buyer.
fn full_release(trade: &Trade) -> Result<SettlementSplit> {
    Ok(SettlementSplit {
        seller_value: trade.value()?,
        buyer_refund: Decimal::ZERO,
        delivered_energy: trade.matched_amount,
    })
}
