//! Discovery Listener
//!
//! Turns market lifecycle notifications into registry entries, persisted
//! market records and subscription requests. Duplicate notifications are
//! harmless: registration is idempotent and subscribing twice is a no-op.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::DiscoveryConfig;
use crate::feed::messages::{LifecycleEvent, LifecycleFrame};
use crate::feed::FeedHandle;
use crate::ingest::write_buffer::RecordSender;
use crate::models::{Market, MarketStatus, TimestampMs};
use crate::registry::{MarketRegistry, RegisterOutcome};
use crate::storage::StorageRecord;

#[derive(Debug, Default)]
pub struct DiscoveryStats {
    pub markets_discovered: AtomicU64,
    pub markets_activated: AtomicU64,
    pub markets_closed: AtomicU64,
    pub subscriptions_requested: AtomicU64,
    pub duplicates: AtomicU64,
}

impl DiscoveryStats {
    pub fn summary(&self) -> String {
        format!(
            "discovered={}, activated={}, closed={}, subscribe_requests={}, duplicates={}",
            self.markets_discovered.load(Ordering::Relaxed),
            self.markets_activated.load(Ordering::Relaxed),
            self.markets_closed.load(Ordering::Relaxed),
            self.subscriptions_requested.load(Ordering::Relaxed),
            self.duplicates.load(Ordering::Relaxed),
        )
    }
}

/// What a lifecycle notification did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutcome {
    Registered { subscribed: bool },
    Activated { subscribed: bool },
    Ended(MarketStatus),
    Ignored,
}

#[derive(Clone)]
pub struct DiscoveryListener {
    registry: Arc<MarketRegistry>,
    feed: FeedHandle,
    records: RecordSender,
    config: DiscoveryConfig,
    stats: Arc<DiscoveryStats>,
}

impl DiscoveryListener {
    pub fn new(
        registry: Arc<MarketRegistry>,
        feed: FeedHandle,
        records: RecordSender,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            registry,
            feed,
            records,
            config,
            stats: Arc::new(DiscoveryStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<DiscoveryStats> {
        Arc::clone(&self.stats)
    }

    pub async fn on_lifecycle(&self, frame: &LifecycleFrame) -> LifecycleOutcome {
        match frame.event {
            LifecycleEvent::Created => self.on_created(frame).await,
            LifecycleEvent::Activated => self.on_activated(frame).await,
            LifecycleEvent::Closed => self.on_ended(frame, MarketStatus::Closed).await,
            LifecycleEvent::Settled => self.on_ended(frame, MarketStatus::Settled).await,
            LifecycleEvent::Other => {
                debug!(ticker = %frame.market_ticker, "Ignoring lifecycle event");
                LifecycleOutcome::Ignored
            }
        }
    }

    async fn on_created(&self, frame: &LifecycleFrame) -> LifecycleOutcome {
        let market = Market::new(frame.market_ticker.clone(), frame.ts);
        if self.registry.register(market.clone()) == RegisterOutcome::AlreadyKnown {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(ticker = %frame.market_ticker, "Market already known");
            return LifecycleOutcome::Ignored;
        }

        self.stats.markets_discovered.fetch_add(1, Ordering::Relaxed);
        self.records.send(StorageRecord::Market(market)).await;
        let subscribed = self.maybe_subscribe(&frame.market_ticker).await;
        info!(ticker = %frame.market_ticker, subscribed, "Discovered market");
        LifecycleOutcome::Registered { subscribed }
    }

    async fn on_activated(&self, frame: &LifecycleFrame) -> LifecycleOutcome {
        let ticker = &frame.market_ticker;
        let inserted = self.registry.register(Market::new(ticker.clone(), frame.ts))
            == RegisterOutcome::Inserted;

        let changed = self.registry.with_cell(ticker, |cell| {
            let changed = inserted || cell.market.status != MarketStatus::Active;
            if changed {
                cell.market.status = MarketStatus::Active;
                cell.market.updated_at = cell.market.updated_at.max(frame.ts);
            }
            changed.then(|| cell.market.clone())
        });

        let Some(Some(market)) = changed else {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            return LifecycleOutcome::Ignored;
        };

        self.stats.markets_activated.fetch_add(1, Ordering::Relaxed);
        self.records.send(StorageRecord::Market(market)).await;
        let subscribed = self.maybe_subscribe(ticker).await;
        info!(ticker = %ticker, subscribed, "Market active");
        LifecycleOutcome::Activated { subscribed }
    }

    async fn on_ended(&self, frame: &LifecycleFrame, status: MarketStatus) -> LifecycleOutcome {
        let ticker = &frame.market_ticker;
        // Unknown markets are still recorded so their history is addressable.
        self.registry.register(Market::new(ticker.clone(), frame.ts));

        let update = self.registry.with_cell(ticker, |cell| {
            if cell.market.status == status {
                return None;
            }
            cell.market.status = status;
            cell.market.updated_at = cell.market.updated_at.max(frame.ts);
            Some((cell.market.clone(), cell.subscribed))
        });

        let Some(Some((market, was_subscribed))) = update else {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            return LifecycleOutcome::Ignored;
        };

        self.stats.markets_closed.fetch_add(1, Ordering::Relaxed);
        self.records.send(StorageRecord::Market(market)).await;
        if was_subscribed {
            self.feed.unsubscribe(vec![ticker.clone()]).await;
        }
        info!(ticker = %ticker, status = status.as_str(), "Market ended");
        LifecycleOutcome::Ended(status)
    }

    async fn maybe_subscribe(&self, ticker: &str) -> bool {
        if !self.config.auto_subscribe || !self.config.is_eligible(ticker) {
            return false;
        }
        self.stats.subscriptions_requested.fetch_add(1, Ordering::Relaxed);
        self.feed.subscribe(vec![ticker.to_string()]).await
    }

    /// Startup: register markets persisted as active by a previous run plus
    /// the configured seed tickers, and request subscriptions for them.
    /// Returns the tickers requested.
    pub async fn bootstrap(&self, restored: Vec<Market>, now: TimestampMs) -> Vec<String> {
        let mut tickers = Vec::new();

        if self.config.restore_active {
            for market in restored {
                if market.status != MarketStatus::Active {
                    continue;
                }
                tickers.push(market.ticker.clone());
                self.registry.register(market);
            }
        }

        for ticker in &self.config.seed_tickers {
            if self.registry.register(Market::new(ticker.clone(), now)) == RegisterOutcome::Inserted {
                if let Some(market) = self.registry.with_cell(ticker, |c| c.market.clone()) {
                    self.records.send(StorageRecord::Market(market)).await;
                }
            }
            if !tickers.contains(ticker) {
                tickers.push(ticker.clone());
            }
        }

        if !tickers.is_empty() {
            info!(markets = tickers.len(), "Restoring subscriptions");
            self.feed.subscribe(tickers.clone()).await;
        }
        tickers
    }
}
