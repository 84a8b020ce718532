//! Offer Store: durable records behind a repository interface.
//!
//! Every record carries a version. Writers load a record, change it, and
//! commit a [`WriteBatch`] that states which version each write expects to
//! replace. A batch is applied entirely or not at all; a stale expectation
//! fails the whole batch with [`VoltmatchError::VersionConflict`].
//!
//! [`InMemoryRepository`] is the reference implementation. A database-backed
//! repository only has to honour the same per-batch atomicity.

use std::collections::{HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use voltmatch_types::{
    Dispute, DisputeId, EscrowRecord, MarketId, Offer, OfferId, Result, Trade, TradeId,
    TradeStatus, VoltmatchError,
};

/// A record together with the version it was read at.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

/// Anything the store persists.
#[derive(Debug, Clone)]
pub enum Record {
    Offer(Offer),
    Trade(Trade),
    Dispute(Dispute),
    Escrow(EscrowRecord),
}

impl Record {
    #[must_use]
    pub fn key(&self) -> RecordKey {
        match self {
            Self::Offer(offer) => RecordKey::Offer(offer.id),
            Self::Trade(trade) => RecordKey::Trade(trade.id),
            Self::Dispute(dispute) => RecordKey::Dispute(dispute.id),
            Self::Escrow(escrow) => RecordKey::Escrow(escrow.trade_id),
        }
    }
}

impl From<Offer> for Record {
    fn from(offer: Offer) -> Self {
        Self::Offer(offer)
    }
}

impl From<Trade> for Record {
    fn from(trade: Trade) -> Self {
        Self::Trade(trade)
    }
}

impl From<Dispute> for Record {
    fn from(dispute: Dispute) -> Self {
        Self::Dispute(dispute)
    }
}

impl From<EscrowRecord> for Record {
    fn from(escrow: EscrowRecord) -> Self {
        Self::Escrow(escrow)
    }
}

/// Identity of a stored record. Escrow records are keyed by their trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Offer(OfferId),
    Trade(TradeId),
    Dispute(DisputeId),
    Escrow(TradeId),
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offer(id) => write!(f, "{id}"),
            Self::Trade(id) => write!(f, "{id}"),
            Self::Dispute(id) => write!(f, "{id}"),
            Self::Escrow(id) => write!(f, "escrow of {id}"),
        }
    }
}

/// What a write expects to find in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    /// The record must not exist yet.
    Absent,
    /// The record must still be at this version.
    Version(u64),
}

impl Expected {
    fn as_version(self) -> Option<u64> {
        match self {
            Self::Absent => None,
            Self::Version(v) => Some(v),
        }
    }
}

/// Writes committed together.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    writes: Vec<(Record, Expected)>,
}

impl WriteBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a record that must not exist yet.
    pub fn insert(&mut self, record: impl Into<Record>) -> &mut Self {
        self.writes.push((record.into(), Expected::Absent));
        self
    }

    /// Replace a record last read at `version`.
    pub fn update(&mut self, record: impl Into<Record>, version: u64) -> &mut Self {
        self.writes.push((record.into(), Expected::Version(version)));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn writes(&self) -> impl Iterator<Item = &(Record, Expected)> {
        self.writes.iter()
    }

    fn into_writes(self) -> Vec<(Record, Expected)> {
        self.writes
    }
}

/// Persistence seam for offers, trades, disputes and escrow records.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn load_offer(&self, offer_id: OfferId) -> Result<Option<Versioned<Offer>>>;

    async fn load_trade(&self, trade_id: TradeId) -> Result<Option<Versioned<Trade>>>;

    async fn load_dispute(&self, dispute_id: DisputeId) -> Result<Option<Versioned<Dispute>>>;

    async fn load_escrow(&self, trade_id: TradeId) -> Result<Option<Versioned<EscrowRecord>>>;

    /// The unresolved dispute on `trade_id`, if any.
    async fn active_dispute(&self, trade_id: TradeId) -> Result<Option<Versioned<Dispute>>>;

    async fn trades_in_status(&self, status: TradeStatus) -> Result<Vec<Versioned<Trade>>>;

    /// OPEN and PARTIALLY_FILLED offers of one market, for rebuilding its book.
    async fn open_offers(&self, market: &MarketId) -> Result<Vec<Offer>>;

    /// Apply every write in `batch` atomically.
    async fn commit(&self, batch: WriteBatch) -> Result<()>;
}

#[derive(Debug, Default)]
struct Tables {
    offers: HashMap<OfferId, Versioned<Offer>>,
    trades: HashMap<TradeId, Versioned<Trade>>,
    disputes: HashMap<DisputeId, Versioned<Dispute>>,
    escrows: HashMap<TradeId, Versioned<EscrowRecord>>,
    /// Commits left to fail with a store error.
    failing_commits: u32,
    /// Commits to let through before `failing_commits` applies.
    passing_commits: u32,
}

impl Tables {
    fn version_of(&self, key: RecordKey) -> Option<u64> {
        match key {
            RecordKey::Offer(id) => self.offers.get(&id).map(|r| r.version),
            RecordKey::Trade(id) => self.trades.get(&id).map(|r| r.version),
            RecordKey::Dispute(id) => self.disputes.get(&id).map(|r| r.version),
            RecordKey::Escrow(id) => self.escrows.get(&id).map(|r| r.version),
        }
    }

    fn put(&mut self, record: Record, version: u64) {
        match record {
            Record::Offer(value) => {
                self.offers.insert(value.id, Versioned { value, version });
            }
            Record::Trade(value) => {
                self.trades.insert(value.id, Versioned { value, version });
            }
            Record::Dispute(value) => {
                self.disputes.insert(value.id, Versioned { value, version });
            }
            Record::Escrow(value) => {
                self.escrows.insert(value.trade_id, Versioned { value, version });
            }
        }
    }
}

/// Repository held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    tables: RwLock<Tables>,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail without applying anything.
    pub async fn fail_next_commits(&self, count: u32) {
        self.fail_commits_after(0, count).await;
    }

    /// Let `skip` commits succeed, then fail the following `count`.
    pub async fn fail_commits_after(&self, skip: u32, count: u32) {
        let mut tables = self.tables.write().await;
        tables.passing_commits = skip;
        tables.failing_commits = count;
    }

    pub async fn offer_count(&self) -> usize {
        self.tables.read().await.offers.len()
    }

    pub async fn trade_count(&self) -> usize {
        self.tables.read().await.trades.len()
    }

    pub async fn all_trades(&self) -> Vec<Trade> {
        self.tables
            .read()
            .await
            .trades
            .values()
            .map(|r| r.value.clone())
            .collect()
    }

    pub async fn all_offers(&self) -> Vec<Offer> {
        self.tables
            .read()
            .await
            .offers
            .values()
            .map(|r| r.value.clone())
            .collect()
    }

    pub async fn disputes_for(&self, trade_id: TradeId) -> Vec<Dispute> {
        self.tables
            .read()
            .await
            .disputes
            .values()
            .filter(|r| r.value.trade_id == trade_id)
            .map(|r| r.value.clone())
            .collect()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn load_offer(&self, offer_id: OfferId) -> Result<Option<Versioned<Offer>>> {
        Ok(self.tables.read().await.offers.get(&offer_id).cloned())
    }

    async fn load_trade(&self, trade_id: TradeId) -> Result<Option<Versioned<Trade>>> {
        Ok(self.tables.read().await.trades.get(&trade_id).cloned())
    }

    async fn load_dispute(&self, dispute_id: DisputeId) -> Result<Option<Versioned<Dispute>>> {
        Ok(self.tables.read().await.disputes.get(&dispute_id).cloned())
    }

    async fn load_escrow(&self, trade_id: TradeId) -> Result<Option<Versioned<EscrowRecord>>> {
        Ok(self.tables.read().await.escrows.get(&trade_id).cloned())
    }

    async fn active_dispute(&self, trade_id: TradeId) -> Result<Option<Versioned<Dispute>>> {
        Ok(self
            .tables
            .read()
            .await
            .disputes
            .values()
            .find(|r| r.value.trade_id == trade_id && r.value.is_active())
            .cloned())
    }

    async fn trades_in_status(&self, status: TradeStatus) -> Result<Vec<Versioned<Trade>>> {
        Ok(self
            .tables
            .read()
            .await
            .trades
            .values()
            .filter(|r| r.value.status == status)
            .cloned()
            .collect())
    }

    async fn open_offers(&self, market: &MarketId) -> Result<Vec<Offer>> {
        Ok(self
            .tables
            .read()
            .await
            .offers
            .values()
            .filter(|r| &r.value.market == market && !r.value.status.is_terminal())
            .map(|r| r.value.clone())
            .collect())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut tables = self.tables.write().await;

        if tables.passing_commits > 0 {
            tables.passing_commits -= 1;
        } else if tables.failing_commits > 0 {
            tables.failing_commits -= 1;
            return Err(VoltmatchError::Store("injected commit failure".into()));
        }

        let mut seen = HashSet::with_capacity(batch.len());
        for (record, expected) in batch.writes() {
            let key = record.key();
            if !seen.insert(key) {
                return Err(VoltmatchError::Store(format!("{key} written twice in one batch")));
            }
            let found = tables.version_of(key);
            if found != expected.as_version() {
                debug!(entity = %key, ?expected, ?found, "commit rejected");
                return Err(VoltmatchError::VersionConflict {
                    entity: key.to_string(),
                    expected: expected.as_version(),
                    found,
                });
            }
        }

        for (record, expected) in batch.into_writes() {
            let version = expected.as_version().map_or(1, |v| v + 1);
            tables.put(record, version);
        }
        Ok(())
    }
}
