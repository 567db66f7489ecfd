//! The polling loop.
//!
//! One task drives every chain in turn: load the persisted seen ids, baseline
//! chains that have none, then fetch, classify and notify once per tick until
//! the cancellation token fires. The monitor is the only writer of the seen
//! sets and of the state file.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::amount::Amount;
use crate::chains::{or_empty, ChainAdapter};
use crate::classifier::{classify, mark_seen};
use crate::error::FetchError;
use crate::metrics::Metrics;
use crate::models::{Chain, RawTransfer, TokenContract, WalletConfig};
use crate::notifier::Notifier;
use crate::state::{total_seen, SeenSet, SeenState, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Baselining,
    Polling,
    ShuttingDown,
}

/// Timing of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub poll_interval: Duration,
    /// Pause between two chains of the same tick.
    pub chain_pause: Duration,
    /// Save even without changes every this many ticks.
    pub persist_every_ticks: u64,
    pub heartbeat_every_ticks: u64,
}

impl Schedule {
    /// Whether tick number `tick` saves even if nothing changed.
    pub fn persist_due(&self, tick: u64) -> bool {
        tick % self.persist_every_ticks.max(1) == 0
    }

    /// Whether an idle tick number `tick` logs a heartbeat.
    pub fn heartbeat_due(&self, tick: u64) -> bool {
        tick % self.heartbeat_every_ticks.max(1) == 0
    }
}

/// One adapter together with the wallet and contracts it is polled for.
pub struct ChainWatch {
    adapter: Box<dyn ChainAdapter>,
    wallet: String,
    contracts: Vec<TokenContract>,
}

impl ChainWatch {
    pub fn new(adapter: Box<dyn ChainAdapter>, config: WalletConfig) -> Self {
        if adapter.chain() != config.chain {
            warn!(
                "{} adapter configured with a {} wallet",
                adapter.chain(),
                config.chain
            );
        }
        Self {
            adapter,
            wallet: config.wallet,
            contracts: config.contracts,
        }
    }

    pub fn chain(&self) -> Chain {
        self.adapter.chain()
    }
}

pub struct Monitor {
    watches: Vec<ChainWatch>,
    notifier: Arc<dyn Notifier>,
    store: StateStore,
    min_amount: Amount,
    schedule: Schedule,
    metrics: Arc<Metrics>,
    seen: SeenState,
    phase: Phase,
    pending_baseline: BTreeSet<Chain>,
    dirty: bool,
    ticks: u64,
}

impl Monitor {
    pub fn new(
        watches: Vec<ChainWatch>,
        notifier: Arc<dyn Notifier>,
        store: StateStore,
        min_amount: Amount,
        schedule: Schedule,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            watches,
            notifier,
            store,
            min_amount,
            schedule,
            metrics,
            seen: SeenState::new(),
            phase: Phase::Initializing,
            pending_baseline: BTreeSet::new(),
            dirty: false,
            ticks: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn seen(&self, chain: Chain) -> Option<&SeenSet> {
        self.seen.get(&chain)
    }

    /// Chains whose history has not been marked seen yet.
    pub fn pending_baseline(&self) -> impl Iterator<Item = Chain> + '_ {
        self.pending_baseline.iter().copied()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Runs until `cancel` fires, then saves one last time.
    pub async fn run(&mut self, cancel: &CancellationToken) {
        self.load_state();
        if !cancel.is_cancelled() {
            self.baseline(cancel).await;
        }

        self.phase = Phase::Polling;
        info!(
            "Polling {} chain(s) every {}s",
            self.watches.len(),
            self.schedule.poll_interval.as_secs()
        );
        while !cancel.is_cancelled() {
            self.tick(cancel).await;
            if !pause(self.schedule.poll_interval, cancel).await {
                break;
            }
        }

        self.shutdown();
    }

    /// Loads the seen ids and queues every chain without any for a baseline.
    pub fn load_state(&mut self) {
        self.phase = Phase::Initializing;
        self.seen = self.store.load();
        for watch in &self.watches {
            let chain = watch.chain();
            let known = self.seen.get(&chain).map_or(0, SeenSet::len);
            if known == 0 {
                self.pending_baseline.insert(chain);
            } else {
                debug!("[{}] baseline already established ({} ids)", chain, known);
            }
        }
    }

    /// Marks the current history of every pending chain as seen, without
    /// notifying, and saves if anything was baselined.
    pub async fn baseline(&mut self, cancel: &CancellationToken) {
        self.phase = Phase::Baselining;
        let pending: Vec<usize> = self.pending_indices();
        if pending.is_empty() {
            info!("Prior state loaded, skipping baseline");
            return;
        }

        for (n, index) in pending.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return;
            }
            if n > 0 && !pause(self.schedule.chain_pause, cancel).await {
                return;
            }
            self.baseline_chain(index).await;
        }
        if self.dirty {
            self.persist();
        }
    }

    /// One polling round over every chain. Returns the number of delivered
    /// notifications.
    pub async fn tick(&mut self, cancel: &CancellationToken) -> usize {
        self.phase = Phase::Polling;
        self.ticks += 1;
        let mut delivered = 0;

        for index in 0..self.watches.len() {
            if cancel.is_cancelled() {
                break;
            }
            if index > 0 && !pause(self.schedule.chain_pause, cancel).await {
                break;
            }
            if self.pending_baseline.contains(&self.watches[index].chain()) {
                self.baseline_chain(index).await;
            } else {
                delivered += self.poll_chain(index).await;
            }
        }

        if self.dirty || self.schedule.persist_due(self.ticks) {
            self.persist();
        }
        if delivered == 0 && self.schedule.heartbeat_due(self.ticks) {
            info!(
                "Tick {}: no new transactions, {} known",
                self.ticks,
                total_seen(&self.seen)
            );
        }
        delivered
    }

    /// Final save before exit.
    pub fn shutdown(&mut self) {
        self.phase = Phase::ShuttingDown;
        info!("Shutting down, saving state");
        self.persist();
    }

    fn pending_indices(&self) -> Vec<usize> {
        self.watches
            .iter()
            .enumerate()
            .filter(|(_, watch)| self.pending_baseline.contains(&watch.chain()))
            .map(|(index, _)| index)
            .collect()
    }

    /// Returns whether the chain's baseline is now established.
    async fn baseline_chain(&mut self, index: usize) -> bool {
        let watch = &self.watches[index];
        let chain = watch.chain();

        let mut history: Vec<RawTransfer> = Vec::new();
        for contract in &watch.contracts {
            match watch.adapter.try_fetch(&watch.wallet, contract).await {
                Ok(batch) => history.extend(batch),
                Err(FetchError::NoData) => {}
                Err(e) => {
                    self.metrics.fetch_failure(chain);
                    warn!(
                        "[{}] baseline fetch of {} failed, retrying next tick: {}",
                        chain, contract.token, e
                    );
                    return false;
                }
            }
        }

        let seen = self.seen.entry(chain).or_default();
        let added = mark_seen(&history, seen);
        self.pending_baseline.remove(&chain);
        self.metrics.transfers_seen(chain, added);
        if added > 0 {
            self.dirty = true;
        }
        info!("[{}] baseline established with {} transactions", chain, added);
        true
    }

    async fn poll_chain(&mut self, index: usize) -> usize {
        let watch = &self.watches[index];
        let chain = watch.chain();
        let mut delivered = 0;

        for contract in &watch.contracts {
            let result = watch.adapter.try_fetch(&watch.wallet, contract).await;
            if matches!(&result, Err(e) if !matches!(e, FetchError::NoData)) {
                self.metrics.fetch_failure(chain);
            }
            let batch = or_empty(chain, contract, result);
            if batch.is_empty() {
                continue;
            }

            let seen = self.seen.entry(chain).or_default();
            let before = seen.len();
            let qualifying = classify(&batch, &watch.wallet, &self.min_amount, seen);
            let added = seen.len() - before;
            if added > 0 {
                self.dirty = true;
                self.metrics.transfers_seen(chain, added);
            }
            self.metrics.transfers_qualified(chain, qualifying.len());

            for transfer in &qualifying {
                info!(
                    "[{}] new incoming {} {} from {}: {}",
                    chain,
                    transfer.amount,
                    transfer.token,
                    transfer.from,
                    transfer.short_id()
                );
                let ok = self
                    .notifier
                    .notify(&transfer.amount, &transfer.label())
                    .await;
                self.metrics.notification(chain, ok);
                if ok {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// A failed save leaves the state dirty so the next tick tries again.
    fn persist(&mut self) {
        match self.store.save(&self.seen) {
            Ok(()) => {
                self.dirty = false;
                self.metrics.state_saved(true);
                debug!("State saved to {}", self.store.path().display());
            }
            Err(e) => {
                self.metrics.state_saved(false);
                error!("Failed to save state: {}", e);
            }
        }
    }
}

/// Sleeps for `duration`. Returns `false` if cancelled first.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(persist_every_ticks: u64, heartbeat_every_ticks: u64) -> Schedule {
        Schedule {
            poll_interval: Duration::from_secs(30),
            chain_pause: Duration::from_secs(1),
            persist_every_ticks,
            heartbeat_every_ticks,
        }
    }

    #[test]
    fn periodic_save_and_heartbeat_follow_their_cadence() {
        let s = schedule(20, 10);
        let saves: Vec<u64> = (1..=45).filter(|&t| s.persist_due(t)).collect();
        assert_eq!(saves, [20, 40]);
        let beats: Vec<u64> = (1..=35).filter(|&t| s.heartbeat_due(t)).collect();
        assert_eq!(beats, [10, 20, 30]);
    }

    #[test]
    fn zero_cadence_means_every_tick() {
        let s = schedule(0, 0);
        assert!((1..=3).all(|t| s.persist_due(t) && s.heartbeat_due(t)));
    }

    #[tokio::test]
    async fn pause_returns_early_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!pause(Duration::from_secs(3600), &cancel).await);
    }

    #[tokio::test]
    async fn pause_completes_when_not_cancelled() {
        let cancel = CancellationToken::new();
        assert!(pause(Duration::ZERO, &cancel).await);
    }
}
