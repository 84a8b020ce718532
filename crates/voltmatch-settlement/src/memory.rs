//! In-memory ledger implementing [`SettlementAdapter`].
//!
//! Keeps per-user value and energy-credit balances plus one escrow hold per
//! trade. Every operation is idempotent on the trade ID and re-checks the
//! supply conservation invariant before returning; a failed check rolls the
//! balances back. Failure injection lets tests simulate an unreachable or
//! refusing ledger.

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use voltmatch_types::{LedgerRef, TradeId, TxHash, UserId, constants};

use crate::adapter::{LedgerError, LedgerResult, LockRequest, SettlementAdapter};
use crate::idempotency::IdempotencyGuard;
use crate::supply_conservation::{Asset, SupplyConservation};

/// Ledger call kinds, used for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerOp {
    Lock,
    Settle,
    Refund,
    Split,
}

/// Balances of one account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountBalance {
    pub value: Decimal,
    pub credits: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HoldState {
    Held,
    Released,
    Refunded,
}

#[derive(Debug, Clone)]
struct Hold {
    payer: UserId,
    payee: UserId,
    value: Decimal,
    credits: Decimal,
    reference: LedgerRef,
    state: HoldState,
}

#[derive(Debug, Default)]
struct Faults {
    transient: HashMap<LedgerOp, u32>,
    offline: bool,
    reject_locks: Option<String>,
}

struct LedgerState {
    accounts: HashMap<UserId, AccountBalance>,
    holds: HashMap<TradeId, Hold>,
    locks: IdempotencyGuard<LedgerRef>,
    closings: IdempotencyGuard<TxHash>,
    supply: SupplyConservation,
    faults: Faults,
    calls: HashMap<LedgerOp, u32>,
    transfers: u32,
    opening_balance: Option<AccountBalance>,
}

/// Balances and holds as they were before a mutation.
struct Snapshot {
    accounts: HashMap<UserId, AccountBalance>,
    holds: HashMap<TradeId, Hold>,
}

impl LedgerState {
    fn new(opening_balance: Option<AccountBalance>) -> Self {
        Self {
            accounts: HashMap::new(),
            holds: HashMap::new(),
            locks: IdempotencyGuard::new(constants::SETTLEMENT_IDEMPOTENCY_CACHE_SIZE),
            closings: IdempotencyGuard::new(constants::SETTLEMENT_IDEMPOTENCY_CACHE_SIZE),
            supply: SupplyConservation::new(),
            faults: Faults::default(),
            calls: HashMap::new(),
            transfers: 0,
            opening_balance,
        }
    }

    /// Count the call and apply any injected failure.
    fn enter(&mut self, op: LedgerOp) -> LedgerResult<()> {
        *self.calls.entry(op).or_insert(0) += 1;
        if self.faults.offline {
            return Err(LedgerError::Unavailable("ledger offline".into()));
        }
        if let Some(remaining) = self.faults.transient.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(LedgerError::Unavailable(format!("injected {op:?} failure")));
            }
        }
        Ok(())
    }

    fn deposit(&mut self, user: UserId, value: Decimal, credits: Decimal) {
        let account = self.accounts.entry(user).or_default();
        account.value += value;
        account.credits += credits;
        self.supply.record_deposit(Asset::Value, value);
        self.supply.record_deposit(Asset::EnergyCredits, credits);
    }

    fn account(&mut self, user: UserId) -> &mut AccountBalance {
        if !self.accounts.contains_key(&user) {
            if let Some(opening) = self.opening_balance {
                self.deposit(user, opening.value, opening.credits);
            }
        }
        self.accounts.entry(user).or_default()
    }

    fn supply_of(&self, asset: Asset) -> Decimal {
        let in_accounts: Decimal = self
            .accounts
            .values()
            .map(|a| match asset {
                Asset::Value => a.value,
                Asset::EnergyCredits => a.credits,
            })
            .sum();
        let held: Decimal = self
            .holds
            .values()
            .filter(|h| h.state == HoldState::Held)
            .map(|h| match asset {
                Asset::Value => h.value,
                Asset::EnergyCredits => h.credits,
            })
            .sum();
        in_accounts + held
    }

    fn held(&self, trade_id: TradeId, escrow: &LedgerRef) -> LedgerResult<Hold> {
        let hold = self
            .holds
            .get(&trade_id)
            .ok_or_else(|| LedgerError::Rejected(format!("no escrow held for {trade_id}")))?;
        if &hold.reference != escrow {
            return Err(LedgerError::Rejected(format!(
                "escrow reference mismatch for {trade_id}"
            )));
        }
        Ok(hold.clone())
    }

    /// Pay out a hold: `release` value to the payee, the rest back to the
    /// payer; credits in the same proportion.
    fn close_hold(&mut self, trade_id: TradeId, hold: &Hold, release: Decimal) {
        let credits_released = if hold.value.is_zero() {
            hold.credits
        } else {
            hold.credits
                .checked_mul(release)
                .map_or_else(|| hold.credits * (release / hold.value), |n| n / hold.value)
        };
        let refund_value = hold.value - release;
        let refund_credits = hold.credits - credits_released;

        let payee = self.account(hold.payee);
        payee.value += release;
        payee.credits += refund_credits;
        let payer = self.account(hold.payer);
        payer.value += refund_value;
        payer.credits += credits_released;

        if let Some(h) = self.holds.get_mut(&trade_id) {
            h.state = if release.is_zero() {
                HoldState::Refunded
            } else {
                HoldState::Released
            };
        }
    }

    /// Transaction hash of the transfer that closed `trade_id`'s hold.
    fn closing_tx(&self, trade_id: TradeId) -> TxHash {
        self.closings
            .get(&trade_id)
            .cloned()
            .unwrap_or_else(|| TxHash(digest("close", trade_id)))
    }

    fn check_conservation(&self) -> LedgerResult<()> {
        for asset in [Asset::Value, Asset::EnergyCredits] {
            self.supply
                .verify(asset, self.supply_of(asset))
                .map_err(|e| LedgerError::Rejected(e.to_string()))?;
        }
        Ok(())
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            accounts: self.accounts.clone(),
            holds: self.holds.clone(),
        }
    }

    /// Keep the mutation if supply is conserved, otherwise put `before` back.
    fn conserve_or_restore(&mut self, before: Snapshot) -> LedgerResult<()> {
        if let Err(err) = self.check_conservation() {
            self.accounts = before.accounts;
            self.holds = before.holds;
            warn!(error = %err, "ledger mutation rolled back");
            return Err(err);
        }
        Ok(())
    }
}

fn digest(tag: &str, trade_id: TradeId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tag.as_bytes());
    hasher.update(trade_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// In-memory ledger with failure injection.
pub struct InMemoryLedger {
    state: RwLock<LedgerState>,
}

impl InMemoryLedger {
    /// Ledger where unknown accounts start empty.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LedgerState::new(None)),
        }
    }

    /// Ledger that deposits `value` and `credits` into every account the
    /// first time it is touched.
    #[must_use]
    pub fn with_opening_balance(value: Decimal, credits: Decimal) -> Self {
        Self {
            state: RwLock::new(LedgerState::new(Some(AccountBalance { value, credits }))),
        }
    }

    /// Deposit value and credits into `user`'s account.
    pub async fn fund(&self, user: UserId, value: Decimal, credits: Decimal) {
        self.state.write().await.deposit(user, value, credits);
    }

    pub async fn balance(&self, user: UserId) -> AccountBalance {
        self.state
            .read()
            .await
            .accounts
            .get(&user)
            .copied()
            .unwrap_or_default()
    }

    /// Make the next `count` calls of `op` fail as unavailable.
    pub async fn fail_next(&self, op: LedgerOp, count: u32) {
        self.state.write().await.faults.transient.insert(op, count);
    }

    /// Take the whole ledger offline (every call unavailable) or back online.
    pub async fn set_offline(&self, offline: bool) {
        self.state.write().await.faults.offline = offline;
    }

    /// Refuse every lock with `reason` until cleared with `None`.
    pub async fn reject_locks(&self, reason: Option<String>) {
        self.state.write().await.faults.reject_locks = reason;
    }

    /// Number of calls received for `op`, including failed and repeated ones.
    pub async fn call_count(&self, op: LedgerOp) -> u32 {
        self.state.read().await.calls.get(&op).copied().unwrap_or(0)
    }

    /// Number of settlements and splits that actually moved value.
    pub async fn transfer_count(&self) -> u32 {
        self.state.read().await.transfers
    }

    /// Whether escrow for `trade_id` is still held.
    pub async fn is_held(&self, trade_id: TradeId) -> bool {
        self.state
            .read()
            .await
            .holds
            .get(&trade_id)
            .is_some_and(|h| h.state == HoldState::Held)
    }

    /// Check the supply conservation invariant for every asset.
    pub async fn verify_conservation(&self) -> voltmatch_types::Result<()> {
        let state = self.state.read().await;
        for asset in [Asset::Value, Asset::EnergyCredits] {
            state.supply.verify(asset, state.supply_of(asset))?;
        }
        Ok(())
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SettlementAdapter for InMemoryLedger {
    async fn lock(&self, request: &LockRequest) -> LedgerResult<LedgerRef> {
        let mut state = self.state.write().await;
        state.enter(LedgerOp::Lock)?;
        if let Some(existing) = state.locks.get(&request.trade_id) {
            return Ok(existing.clone());
        }
        // The hold outlives the bounded replay cache.
        if let Some(hold) = state.holds.get(&request.trade_id) {
            return Ok(hold.reference.clone());
        }
        if let Some(reason) = state.faults.reject_locks.clone() {
            return Err(LedgerError::Rejected(reason));
        }

        let payer = *state.account(request.payer);
        if payer.value < request.value {
            return Err(LedgerError::Rejected(format!(
                "insufficient value: {} < {}",
                payer.value, request.value
            )));
        }
        let payee = *state.account(request.payee);
        if payee.credits < request.energy_credits {
            return Err(LedgerError::Rejected(format!(
                "insufficient energy credits: {} < {}",
                payee.credits, request.energy_credits
            )));
        }

        let before = state.snapshot();
        state.account(request.payer).value -= request.value;
        state.account(request.payee).credits -= request.energy_credits;
        let reference = LedgerRef(format!("lock-{}", &digest("lock", request.trade_id)[..16]));
        state.holds.insert(
            request.trade_id,
            Hold {
                payer: request.payer,
                payee: request.payee,
                value: request.value,
                credits: request.energy_credits,
                reference: reference.clone(),
                state: HoldState::Held,
            },
        );
        state.conserve_or_restore(before)?;
        state.locks.record(request.trade_id, reference.clone());

        debug!(trade = %request.trade_id, value = %request.value, credits = %request.energy_credits, "escrow held");
        Ok(reference)
    }

    async fn settle(&self, trade_id: TradeId, escrow: &LedgerRef) -> LedgerResult<TxHash> {
        let mut state = self.state.write().await;
        state.enter(LedgerOp::Settle)?;
        let hold = state.held(trade_id, escrow)?;
        match hold.state {
            HoldState::Refunded => {
                return Err(LedgerError::Rejected(format!("{trade_id} was refunded")));
            }
            HoldState::Released => return Ok(state.closing_tx(trade_id)),
            HoldState::Held => {}
        }

        let before = state.snapshot();
        state.close_hold(trade_id, &hold, hold.value);
        state.conserve_or_restore(before)?;
        let tx = state.closing_tx(trade_id);
        state.closings.record(trade_id, tx.clone());
        state.transfers += 1;

        info!(trade = %trade_id, tx = %tx, value = %hold.value, "escrow released to seller");
        Ok(tx)
    }

    async fn refund(&self, trade_id: TradeId, escrow: &LedgerRef) -> LedgerResult<()> {
        let mut state = self.state.write().await;
        state.enter(LedgerOp::Refund)?;
        let hold = state.held(trade_id, escrow)?;
        match hold.state {
            HoldState::Released => {
                return Err(LedgerError::Rejected(format!("{trade_id} was released")));
            }
            HoldState::Refunded => return Ok(()),
            HoldState::Held => {}
        }

        let before = state.snapshot();
        state.close_hold(trade_id, &hold, Decimal::ZERO);
        state.conserve_or_restore(before)?;

        info!(trade = %trade_id, value = %hold.value, "escrow refunded to buyer");
        Ok(())
    }

    async fn split(
        &self,
        trade_id: TradeId,
        escrow: &LedgerRef,
        release_value: Decimal,
    ) -> LedgerResult<TxHash> {
        let mut state = self.state.write().await;
        state.enter(LedgerOp::Split)?;
        let hold = state.held(trade_id, escrow)?;
        match hold.state {
            HoldState::Refunded => {
                return Err(LedgerError::Rejected(format!("{trade_id} was refunded")));
            }
            HoldState::Released => return Ok(state.closing_tx(trade_id)),
            HoldState::Held => {}
        }
        if release_value < Decimal::ZERO || release_value > hold.value {
            return Err(LedgerError::Rejected(format!(
                "release {release_value} outside escrowed {}",
                hold.value
            )));
        }

        let before = state.snapshot();
        state.close_hold(trade_id, &hold, release_value);
        state.conserve_or_restore(before)?;
        let tx = state.closing_tx(trade_id);
        state.closings.record(trade_id, tx.clone());
        state.transfers += 1;

        info!(trade = %trade_id, tx = %tx, released = %release_value, refunded = %(hold.value - release_value), "escrow split");
        Ok(tx)
    }
}
