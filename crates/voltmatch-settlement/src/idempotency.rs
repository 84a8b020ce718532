//! Settlement idempotency guard: one outcome per trade.
//!
//! Each ledger operation keyed on a [`TradeId`] records its outcome the
//! first time it runs. Repeating the operation returns the recorded outcome
//! instead of moving value again.
//!
//! The guard keeps a bounded cache with oldest-first eviction so memory
//! stays predictable in long-running engines.

use std::collections::{HashMap, VecDeque};

use voltmatch_types::TradeId;

/// Remembers the outcome of at most `max_size` trades.
#[derive(Debug)]
pub struct IdempotencyGuard<V> {
    /// Recorded outcome per trade.
    outcomes: HashMap<TradeId, V>,
    /// Insertion order for eviction (front = oldest).
    order: VecDeque<TradeId>,
    /// Maximum number of entries before eviction kicks in.
    max_size: usize,
}

impl<V: Clone> IdempotencyGuard<V> {
    /// Create a new guard. A zero size is treated as one.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            outcomes: HashMap::new(),
            order: VecDeque::new(),
            max_size,
        }
    }

    /// Record `outcome` for `trade_id` unless one exists already.
    ///
    /// Returns the previously recorded outcome on a repeat, `None` on the
    /// first call.
    pub fn record(&mut self, trade_id: TradeId, outcome: V) -> Option<V> {
        if let Some(existing) = self.outcomes.get(&trade_id) {
            return Some(existing.clone());
        }

        if self.outcomes.len() >= self.max_size {
            if let Some(oldest) = self.order.pop_front() {
                self.outcomes.remove(&oldest);
            }
        }

        self.outcomes.insert(trade_id, outcome);
        self.order.push_back(trade_id);
        None
    }

    #[must_use]
    pub fn get(&self, trade_id: &TradeId) -> Option<&V> {
        self.outcomes.get(trade_id)
    }

    #[must_use]
    pub fn contains(&self, trade_id: &TradeId) -> bool {
        self.outcomes.contains_key(trade_id)
    }

    /// Number of trades currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_record_ok() {
        let mut guard = IdempotencyGuard::new(100);
        let trade_id = TradeId::new();
        assert_eq!(guard.record(trade_id, "tx-1"), None);
        assert!(guard.contains(&trade_id));
        assert_eq!(guard.len(), 1);
    }

    #[test]
    fn repeat_returns_original_outcome() {
        let mut guard = IdempotencyGuard::new(100);
        let trade_id = TradeId::new();
        guard.record(trade_id, "tx-1");

        assert_eq!(guard.record(trade_id, "tx-2"), Some("tx-1"));
        assert_eq!(guard.get(&trade_id), Some(&"tx-1"));
        assert_eq!(guard.len(), 1);
    }

    #[test]
    fn evicts_oldest() {
        let mut guard = IdempotencyGuard::new(3);
        let ids: Vec<TradeId> = (0..4).map(|_| TradeId::new()).collect();
        for (i, id) in ids.iter().enumerate() {
            guard.record(*id, i);
        }
        assert_eq!(guard.len(), 3);
        assert!(!guard.contains(&ids[0]), "oldest should have been evicted");
        assert!(ids[1..].iter().all(|id| guard.contains(id)));
    }

    #[test]
    fn zero_size_holds_one() {
        let mut guard = IdempotencyGuard::new(0);
        guard.record(TradeId::new(), ());
        guard.record(TradeId::new(), ());
        assert_eq!(guard.len(), 1);
    }

    #[test]
    fn empty_guard() {
        let guard: IdempotencyGuard<u8> = IdempotencyGuard::new(10);
        assert!(guard.is_empty());
        assert!(!guard.contains(&TradeId::new()));
    }
}
