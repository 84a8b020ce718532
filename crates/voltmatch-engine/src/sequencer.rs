//! Per-market sequencer.
//!
//! Each market owns exactly one sequencer task. It holds the market's
//! [`OrderBook`] and handles every command that touches it (submissions,
//! cancellations, restorations after failed escrow locks, expiry sweeps)
//! strictly one at a time, in arrival order. Different markets run in
//! parallel.
//!
//! ## Submission flow
//!
//! ```text
//! submit ─▶ validate ─▶ plan_match ─▶ commit batch ─▶ OrderBook::apply ─▶ rest remainder
//!                                        │
//!                                        └─ offers, fills, expiries, trades in one write
//! ```
//!
//! The book is only mutated after the store accepted the batch, so a failed
//! commit leaves both exactly as they were.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use voltmatch_matchcore::{BookPosition, DepthSnapshot, MatchPlan, OrderBook, RestingOffer, plan_match};
use voltmatch_types::{
    MarketConfig, MarketId, Offer, OfferId, OfferRequest, OfferStatus, Result, Trade, TradeEvent,
    TradeId, UserId, VoltmatchError,
};

use crate::clock::Clock;
use crate::coordinator::EscrowQueue;
use crate::store::{Repository, WriteBatch};

/// Result of a submission.
#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    pub offer_id: OfferId,
    pub status: OfferStatus,
    /// Quantity left after matching; rests in the book when positive.
    pub remaining: Decimal,
    /// MATCHED trades produced by this submission, in fill order.
    pub trades: Vec<Trade>,
    /// Where the remainder rests, if any.
    pub position: Option<BookPosition>,
}

/// Best resting offer on each side.
#[derive(Debug, Clone, Default)]
pub struct TopOfBook {
    pub best_bid: Option<RestingOffer>,
    pub best_ask: Option<RestingOffer>,
}

pub(crate) enum Command {
    Submit {
        request: OfferRequest,
        reply: oneshot::Sender<Result<SubmitReceipt>>,
    },
    Cancel {
        offer_id: OfferId,
        requester: UserId,
        reply: oneshot::Sender<Result<Offer>>,
    },
    CancelTrade {
        trade_id: TradeId,
        reason: String,
        reply: oneshot::Sender<Result<Trade>>,
    },
    Sweep {
        reply: oneshot::Sender<Result<Vec<OfferId>>>,
    },
    Top {
        reply: oneshot::Sender<TopOfBook>,
    },
    Depth {
        levels: usize,
        reply: oneshot::Sender<DepthSnapshot>,
    },
    SetActive {
        active: bool,
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to one market's sequencer task.
#[derive(Debug, Clone)]
pub struct SequencerHandle {
    market: MarketId,
    commands: mpsc::Sender<Command>,
}

impl SequencerHandle {
    #[must_use]
    pub fn market(&self) -> &MarketId {
        &self.market
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| VoltmatchError::SequencerUnavailable(self.market.clone()))?;
        response
            .await
            .map_err(|_| VoltmatchError::SequencerUnavailable(self.market.clone()))
    }

    pub async fn submit(&self, request: OfferRequest) -> Result<SubmitReceipt> {
        self.request(|reply| Command::Submit { request, reply }).await?
    }

    pub async fn cancel(&self, offer_id: OfferId, requester: UserId) -> Result<Offer> {
        self.request(|reply| Command::Cancel {
            offer_id,
            requester,
            reply,
        })
        .await?
    }

    /// Cancel a MATCHED trade whose escrow could not be locked and return its
    /// quantity to both parent offers.
    pub async fn cancel_trade(&self, trade_id: TradeId, reason: String) -> Result<Trade> {
        self.request(|reply| Command::CancelTrade {
            trade_id,
            reason,
            reply,
        })
        .await?
    }

    /// Retire resting offers past their expiry.
    pub async fn sweep(&self) -> Result<Vec<OfferId>> {
        self.request(|reply| Command::Sweep { reply }).await?
    }

    pub async fn top(&self) -> Result<TopOfBook> {
        self.request(|reply| Command::Top { reply }).await
    }

    pub async fn depth(&self, levels: usize) -> Result<DepthSnapshot> {
        self.request(|reply| Command::Depth { levels, reply }).await
    }

    pub async fn set_active(&self, active: bool) -> Result<()> {
        self.request(|reply| Command::SetActive { active, reply }).await
    }
}

pub(crate) struct Sequencer {
    market: MarketId,
    book: OrderBook,
    active: bool,
    next_sequence: u64,
    store: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    escrow: EscrowQueue,
    retry_limit: u32,
}

impl Sequencer {
    /// Rebuild the market's book from the store and start its task.
    pub(crate) async fn spawn(
        config: &MarketConfig,
        store: Arc<dyn Repository>,
        clock: Arc<dyn Clock>,
        escrow: EscrowQueue,
        retry_limit: u32,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(SequencerHandle, JoinHandle<()>)> {
        let mut book = OrderBook::new(config.id.clone());
        let mut next_sequence = 1;
        for offer in store.open_offers(&config.id).await? {
            next_sequence = next_sequence.max(offer.sequence + 1);
            book.insert(RestingOffer::from_offer(&offer))?;
        }

        let (commands, inbox) = mpsc::channel(config.command_buffer.max(1));
        let sequencer = Self {
            market: config.id.clone(),
            book,
            active: config.active,
            next_sequence,
            store,
            clock,
            escrow,
            retry_limit: retry_limit.max(1),
        };
        let task = tokio::spawn(sequencer.run(inbox, shutdown));
        let handle = SequencerHandle {
            market: config.id.clone(),
            commands,
        };
        Ok((handle, task))
    }

    async fn run(mut self, mut inbox: mpsc::Receiver<Command>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            market = %self.market,
            resting = self.book.offer_count(),
            active = self.active,
            "sequencer started"
        );
        loop {
            tokio::select! {
                command = inbox.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }
        info!(market = %self.market, "sequencer stopped");
    }

    async fn handle(&mut self, command: Command) {
        // A dropped receiver only means the caller stopped waiting; the
        // command has still been applied.
        match command {
            Command::Submit { request, reply } => {
                let _ = reply.send(self.submit(request).await);
            }
            Command::Cancel {
                offer_id,
                requester,
                reply,
            } => {
                let _ = reply.send(self.cancel(offer_id, requester).await);
            }
            Command::CancelTrade {
                trade_id,
                reason,
                reply,
            } => {
                let _ = reply.send(self.cancel_trade(trade_id, &reason).await);
            }
            Command::Sweep { reply } => {
                let _ = reply.send(self.sweep().await);
            }
            Command::Top { reply } => {
                let _ = reply.send(TopOfBook {
                    best_bid: self.book.best_bid().cloned(),
                    best_ask: self.book.best_ask().cloned(),
                });
            }
            Command::Depth { levels, reply } => {
                let _ = reply.send(self.book.depth(levels));
            }
            Command::SetActive { active, reply } => {
                info!(market = %self.market, active, "market activity changed");
                self.active = active;
                let _ = reply.send(());
            }
        }
    }

    // =================================================================
    // Submission
    // =================================================================

    async fn submit(&mut self, request: OfferRequest) -> Result<SubmitReceipt> {
        if !self.active {
            return Err(VoltmatchError::MarketClosed(self.market.clone()));
        }
        let now = self.clock.now();
        let mut offer = Offer::from_request(self.market.clone(), request, now);
        offer.validate(now)?;
        offer.sequence = self.next_sequence;
        self.next_sequence += 1;

        let mut attempt = 0;
        let (plan, offer, trades) = loop {
            attempt += 1;
            let plan = plan_match(&self.book, &offer, now);
            let (batch, filled, trades) = self.match_batch(&offer, &plan, now).await?;
            match self.store.commit(batch).await {
                Ok(()) => break (plan, filled, trades),
                Err(err) if err.is_retryable() && attempt < self.retry_limit => {
                    warn!(market = %self.market, offer = %offer.id, attempt, error = %err, "match commit conflict, replanning");
                }
                Err(err) => return Err(err),
            }
        };

        self.book.apply(&plan)?;
        let position = if offer.remaining_amount > Decimal::ZERO {
            Some(self.book.submit(&offer, now)?)
        } else {
            None
        };
        for trade in &trades {
            self.escrow.enqueue(trade.id);
        }

        info!(
            market = %self.market,
            offer = %offer.id,
            side = %offer.side,
            price = %offer.price_per_unit,
            trades = trades.len(),
            remaining = %offer.remaining_amount,
            "offer sequenced"
        );

        Ok(SubmitReceipt {
            offer_id: offer.id,
            status: offer.status,
            remaining: offer.remaining_amount,
            trades,
            position,
        })
    }

    /// Everything a match writes: resting offers reduced by their fills,
    /// expired resting offers retired, the incoming offer and its trades.
    async fn match_batch(
        &self,
        incoming: &Offer,
        plan: &MatchPlan,
        now: DateTime<Utc>,
    ) -> Result<(WriteBatch, Offer, Vec<Trade>)> {
        let mut batch = WriteBatch::new();
        let mut incoming = incoming.clone();

        for fill in &plan.fills {
            let stored = self
                .store
                .load_offer(fill.resting_offer_id)
                .await?
                .ok_or(VoltmatchError::OfferNotFound(fill.resting_offer_id))?;
            let mut resting = stored.value;
            resting.apply_fill(fill.quantity, now)?;
            batch.update(resting, stored.version);
            incoming.apply_fill(fill.quantity, now)?;
        }

        for offer_id in &plan.expired {
            match self.store.load_offer(*offer_id).await? {
                Some(stored) if !stored.value.status.is_terminal() => {
                    let mut expired = stored.value;
                    expired.status = OfferStatus::Expired;
                    expired.updated_at = now;
                    batch.update(expired, stored.version);
                }
                Some(_) => {}
                None => warn!(market = %self.market, offer = %offer_id, "expired offer missing from store"),
            }
        }

        let trades = plan.trades(&incoming, now);
        batch.insert(incoming.clone());
        for trade in &trades {
            batch.insert(trade.clone());
        }
        Ok((batch, incoming, trades))
    }

    // =================================================================
    // Cancellation
    // =================================================================

    async fn cancel(&mut self, offer_id: OfferId, requester: UserId) -> Result<Offer> {
        let mut attempt = 0;
        let offer = loop {
            attempt += 1;
            let stored = self
                .store
                .load_offer(offer_id)
                .await?
                .filter(|stored| stored.value.market == self.market)
                .ok_or(VoltmatchError::OfferNotFound(offer_id))?;
            let mut offer = stored.value;
            if offer.owner_id != requester {
                return Err(VoltmatchError::NotOwner {
                    offer_id,
                    requester,
                });
            }
            if offer.status.is_terminal() {
                return Err(VoltmatchError::AlreadyTerminal {
                    offer_id,
                    status: offer.status,
                });
            }
            offer.status = OfferStatus::Cancelled;
            offer.updated_at = self.clock.now();

            let mut batch = WriteBatch::new();
            batch.update(offer.clone(), stored.version);
            match self.store.commit(batch).await {
                Ok(()) => break offer,
                Err(err) if err.is_retryable() && attempt < self.retry_limit => {
                    warn!(offer = %offer_id, attempt, error = %err, "cancel conflict, retrying");
                }
                Err(err) => return Err(err),
            }
        };

        if self.book.contains(&offer_id) {
            self.book.remove(&offer_id)?;
        }
        info!(market = %self.market, offer = %offer_id, "offer cancelled");
        Ok(offer)
    }

    // =================================================================
    // Restoration
    // =================================================================

    /// Cancel a MATCHED trade and hand its quantity back to both parent
    /// offers in the same commit. Restored offers keep their original time
    /// priority; parents that were cancelled or expired meanwhile stay so.
    async fn cancel_trade(&mut self, trade_id: TradeId, reason: &str) -> Result<Trade> {
        let mut attempt = 0;
        let (trade, restored) = loop {
            attempt += 1;
            let now = self.clock.now();
            let stored = self
                .store
                .load_trade(trade_id)
                .await?
                .ok_or(VoltmatchError::TradeNotFound(trade_id))?;
            let mut trade = stored.value;
            trade.transition(TradeEvent::EscrowLockFailed, now)?;
            trade.cancel_reason = Some(reason.to_owned());

            let mut batch = WriteBatch::new();
            let mut restored = Vec::with_capacity(2);
            for offer_id in [trade.sell_offer_id, trade.buy_offer_id] {
                let Some(parent) = self.store.load_offer(offer_id).await? else {
                    warn!(trade = %trade_id, offer = %offer_id, "parent offer missing, nothing to restore");
                    continue;
                };
                let mut offer = parent.value;
                if !offer.restore(trade.matched_amount, now)? {
                    debug!(trade = %trade_id, offer = %offer_id, status = %offer.status, "parent not restorable");
                    continue;
                }
                if offer.is_expired_at(now) {
                    offer.status = OfferStatus::Expired;
                }
                restored.push(offer.clone());
                batch.update(offer, parent.version);
            }
            batch.update(trade.clone(), stored.version);

            match self.store.commit(batch).await {
                Ok(()) => break (trade, restored),
                Err(err) if err.is_retryable() && attempt < self.retry_limit => {
                    warn!(trade = %trade_id, attempt, error = %err, "restore conflict, retrying");
                }
                Err(err) => return Err(err),
            }
        };

        for offer in &restored {
            let in_book = self.book.contains(&offer.id);
            match (offer.status, in_book) {
                (OfferStatus::Expired, true) => {
                    self.book.remove(&offer.id)?;
                }
                (OfferStatus::Expired, false) => {}
                (_, true) => self.book.amend_remaining(&offer.id, offer.remaining_amount)?,
                (_, false) => self.book.insert(RestingOffer::from_offer(offer))?,
            }
        }

        info!(
            market = %self.market,
            trade = %trade_id,
            restored = restored.len(),
            reason,
            "trade cancelled before escrow"
        );
        Ok(trade)
    }

    // =================================================================
    // Expiry
    // =================================================================

    async fn sweep(&mut self) -> Result<Vec<OfferId>> {
        let now = self.clock.now();
        let expired = self.book.expired(now);
        if expired.is_empty() {
            return Ok(expired);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut batch = WriteBatch::new();
            for offer_id in &expired {
                if let Some(stored) = self.store.load_offer(*offer_id).await? {
                    if stored.value.status.is_terminal() {
                        continue;
                    }
                    let mut offer = stored.value;
                    offer.status = OfferStatus::Expired;
                    offer.updated_at = now;
                    batch.update(offer, stored.version);
                }
            }
            match self.store.commit(batch).await {
                Ok(()) => break,
                Err(err) if err.is_retryable() && attempt < self.retry_limit => {
                    warn!(market = %self.market, attempt, error = %err, "sweep conflict, retrying");
                }
                Err(err) => return Err(err),
            }
        }

        for offer_id in &expired {
            self.book.remove(offer_id)?;
        }
        debug!(market = %self.market, count = expired.len(), "expired offers retired");
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use voltmatch_types::{OfferSide, TradeStatus};

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryRepository;

    fn dec(n: i64) -> Decimal {
        Decimal::new(n, 0)
    }

    struct Fixture {
        handle: SequencerHandle,
        store: Arc<InMemoryRepository>,
        clock: Arc<ManualClock>,
        queue: EscrowQueue,
        _trades: mpsc::UnboundedReceiver<TradeId>,
        _shutdown: broadcast::Sender<()>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryRepository::new());
        let clock = Arc::new(ManualClock::default());
        let (queue, trades) = EscrowQueue::new();
        let (shutdown, _) = broadcast::channel(1);
        let (handle, _task) = Sequencer::spawn(
            &MarketConfig::new("zone-seq"),
            store.clone(),
            clock.clone(),
            queue.clone(),
            3,
            shutdown.subscribe(),
        )
        .await
        .unwrap();
        Fixture {
            handle,
            store,
            clock,
            queue,
            _trades: trades,
            _shutdown: shutdown,
        }
    }

    fn request(clock: &ManualClock, owner: UserId, side: OfferSide, price: i64, amount: i64) -> OfferRequest {
        let mut request = OfferRequest::dummy(owner, side, dec(price), dec(amount));
        request.expires_at = clock.now() + Duration::hours(1);
        request
    }

    #[tokio::test]
    async fn submit_rests_and_matches() {
        let f = fixture().await;
        let seller = UserId::new();
        let buyer = UserId::new();

        let ask = f.handle.submit(request(&f.clock, seller, OfferSide::Sell, 12, 10)).await.unwrap();
        assert!(ask.trades.is_empty());
        assert_eq!(ask.position.unwrap().queue_position, 0);

        let bid = f.handle.submit(request(&f.clock, buyer, OfferSide::Buy, 13, 4)).await.unwrap();
        assert_eq!(bid.status, OfferStatus::Filled);
        assert_eq!(bid.trades.len(), 1);
        assert_eq!(bid.trades[0].matched_price, dec(12));
        assert!(bid.position.is_none());

        let stored_ask = f.store.load_offer(ask.offer_id).await.unwrap().unwrap().value;
        assert_eq!(stored_ask.remaining_amount, dec(6));
        assert_eq!(stored_ask.status, OfferStatus::PartiallyFilled);

        let top = f.handle.top().await.unwrap();
        assert_eq!(top.best_ask.unwrap().remaining, dec(6));
        assert!(top.best_bid.is_none());
        assert_eq!(f.queue.pending(), 1);
    }

    #[tokio::test]
    async fn failed_commit_leaves_book_untouched() {
        let f = fixture().await;
        let ask = f
            .handle
            .submit(request(&f.clock, UserId::new(), OfferSide::Sell, 12, 10))
            .await
            .unwrap();

        f.store.fail_next_commits(1).await;
        let err = f
            .handle
            .submit(request(&f.clock, UserId::new(), OfferSide::Buy, 12, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, VoltmatchError::Store(_)));

        let top = f.handle.top().await.unwrap();
        assert_eq!(top.best_ask.unwrap().offer_id, ask.offer_id);
        assert_eq!(f.store.trade_count().await, 0);
    }

    #[tokio::test]
    async fn cancel_checks_owner_and_status() {
        let f = fixture().await;
        let owner = UserId::new();
        let ask = f.handle.submit(request(&f.clock, owner, OfferSide::Sell, 12, 10)).await.unwrap();

        let err = f.handle.cancel(ask.offer_id, UserId::new()).await.unwrap_err();
        assert!(matches!(err, VoltmatchError::NotOwner { .. }));

        let cancelled = f.handle.cancel(ask.offer_id, owner).await.unwrap();
        assert_eq!(cancelled.status, OfferStatus::Cancelled);
        assert!(f.handle.top().await.unwrap().best_ask.is_none());

        let err = f.handle.cancel(ask.offer_id, owner).await.unwrap_err();
        assert!(matches!(
            err,
            VoltmatchError::AlreadyTerminal { status: OfferStatus::Cancelled, .. }
        ));
    }

    #[tokio::test]
    async fn cancel_trade_restores_both_parents() {
        let f = fixture().await;
        let ask = f
            .handle
            .submit(request(&f.clock, UserId::new(), OfferSide::Sell, 12, 10))
            .await
            .unwrap();
        let bid = f
            .handle
            .submit(request(&f.clock, UserId::new(), OfferSide::Buy, 12, 10))
            .await
            .unwrap();
        let trade = &bid.trades[0];

        let cancelled = f.handle.cancel_trade(trade.id, "ledger said no".into()).await.unwrap();
        assert_eq!(cancelled.status, TradeStatus::Cancelled);
        assert_eq!(cancelled.cancel_reason.as_deref(), Some("ledger said no"));

        for id in [ask.offer_id, bid.offer_id] {
            let offer = f.store.load_offer(id).await.unwrap().unwrap().value;
            assert_eq!(offer.status, OfferStatus::Open);
            assert_eq!(offer.remaining_amount, dec(10));
        }
        // Both restored offers cross again but rest side by side.
        let top = f.handle.top().await.unwrap();
        assert_eq!(top.best_ask.unwrap().offer_id, ask.offer_id);
        assert_eq!(top.best_bid.unwrap().offer_id, bid.offer_id);

        let err = f.handle.cancel_trade(trade.id, "again".into()).await.unwrap_err();
        assert!(matches!(err, VoltmatchError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn sweep_retires_expired_offers() {
        let f = fixture().await;
        let ask = f
            .handle
            .submit(request(&f.clock, UserId::new(), OfferSide::Sell, 12, 10))
            .await
            .unwrap();

        assert!(f.handle.sweep().await.unwrap().is_empty());
        f.clock.advance(Duration::hours(2));
        assert_eq!(f.handle.sweep().await.unwrap(), vec![ask.offer_id]);

        let offer = f.store.load_offer(ask.offer_id).await.unwrap().unwrap().value;
        assert_eq!(offer.status, OfferStatus::Expired);
        assert_eq!(f.handle.depth(5).await.unwrap().asks.len(), 0);
    }

    #[tokio::test]
    async fn closed_market_rejects_submissions() {
        let f = fixture().await;
        f.handle.set_active(false).await.unwrap();
        let err = f
            .handle
            .submit(request(&f.clock, UserId::new(), OfferSide::Sell, 12, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, VoltmatchError::MarketClosed(_)));

        f.handle.set_active(true).await.unwrap();
        assert!(
            f.handle
                .submit(request(&f.clock, UserId::new(), OfferSide::Sell, 12, 10))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn book_is_rebuilt_from_store() {
        let f = fixture().await;
        let ask = f
            .handle
            .submit(request(&f.clock, UserId::new(), OfferSide::Sell, 12, 10))
            .await
            .unwrap();

        let (queue, _rx) = EscrowQueue::new();
        let (shutdown, _) = broadcast::channel(1);
        let (restarted, _task) = Sequencer::spawn(
            &MarketConfig::new("zone-seq"),
            f.store.clone(),
            f.clock.clone(),
            queue,
            3,
            shutdown.subscribe(),
        )
        .await
        .unwrap();

        let top = restarted.top().await.unwrap();
        assert_eq!(top.best_ask.unwrap().offer_id, ask.offer_id);
    }
}
