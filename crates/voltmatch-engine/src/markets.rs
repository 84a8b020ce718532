//! Market registry: one sequencer per configured market.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use voltmatch_types::{MarketConfig, MarketId, Result, VoltmatchError};

use crate::clock::Clock;
use crate::coordinator::EscrowQueue;
use crate::sequencer::{Sequencer, SequencerHandle};
use crate::store::Repository;

/// Routes commands to the sequencer that owns each market.
#[derive(Debug, Default)]
pub struct MarketRegistry {
    markets: BTreeMap<MarketId, SequencerHandle>,
}

impl MarketRegistry {
    /// Start a sequencer for every market in `configs`.
    pub(crate) async fn spawn(
        configs: &[MarketConfig],
        store: &Arc<dyn Repository>,
        clock: &Arc<dyn Clock>,
        escrow: &EscrowQueue,
        retry_limit: u32,
        shutdown: &broadcast::Sender<()>,
    ) -> Result<(Self, Vec<JoinHandle<()>>)> {
        let mut markets = BTreeMap::new();
        let mut tasks = Vec::with_capacity(configs.len());
        for config in configs {
            let (handle, task) = Sequencer::spawn(
                config,
                Arc::clone(store),
                Arc::clone(clock),
                escrow.clone(),
                retry_limit,
                shutdown.subscribe(),
            )
            .await?;
            markets.insert(config.id.clone(), handle);
            tasks.push(task);
        }
        Ok((Self { markets }, tasks))
    }

    pub fn get(&self, market: &MarketId) -> Result<&SequencerHandle> {
        self.markets
            .get(market)
            .ok_or_else(|| VoltmatchError::UnknownMarket(market.clone()))
    }

    pub fn handles(&self) -> impl Iterator<Item = &SequencerHandle> {
        self.markets.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &MarketId> {
        self.markets.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.markets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }
}
