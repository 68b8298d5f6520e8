//! Periodic background work for the cache server.
//!
//! - full resync: re-enqueue every RuleSet and Engine, catching anything a
//!   lagging watch might have dropped
//! - manifest rescan: reload the manifest directory into the in-memory
//!   cluster when one is configured
//! - subscription pruning: forget engines that stopped polling

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use chrono::{DateTime, Utc};

use crate::cluster::ManifestLoader;
use crate::reconciler::Context;
use crate::telemetry::{SubscriptionTracker, DEFAULT_SUBSCRIPTION_TTL};

/// Configuration for the background scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between full resyncs
    pub resync_interval: Duration,
    /// Interval between manifest directory scans
    pub manifest_rescan_interval: Duration,
    /// Subscriptions idle for longer than this are dropped
    pub subscription_ttl: Duration,
    /// Interval between subscription prunes
    pub prune_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(5 * 60),
            manifest_rescan_interval: Duration::from_secs(10),
            subscription_ttl: DEFAULT_SUBSCRIPTION_TTL,
            prune_interval: Duration::from_secs(60),
        }
    }
}

pub struct ResyncScheduler {
    ctx: Arc<Context>,
    subscriptions: Arc<SubscriptionTracker>,
    manifests: Option<Arc<ManifestLoader>>,
    config: SchedulerConfig,
    last_resync_at: RwLock<Option<DateTime<Utc>>>,
}

impl ResyncScheduler {
    pub fn new(
        ctx: Arc<Context>,
        subscriptions: Arc<SubscriptionTracker>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            ctx,
            subscriptions,
            manifests: None,
            config,
            last_resync_at: RwLock::new(None),
        }
    }

    pub fn with_manifests(mut self, loader: Arc<ManifestLoader>) -> Self {
        self.manifests = Some(loader);
        self
    }

    /// Timestamp of the last successful full resync.
    pub fn last_resync(&self) -> Option<DateTime<Utc>> {
        *self.last_resync_at.read()
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "scheduler started: resync every {}s, subscription TTL {}s",
            self.config.resync_interval.as_secs(),
            self.config.subscription_ttl.as_secs()
        );

        let mut resync = interval(self.config.resync_interval);
        let mut rescan = interval(self.config.manifest_rescan_interval);
        let mut prune = interval(self.config.prune_interval);
        for ticker in [&mut resync, &mut rescan, &mut prune] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        // The controller enqueues everything on start; skip the immediate tick.
        resync.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler stopped");
                        return;
                    }
                }
                _ = resync.tick() => self.resync().await,
                _ = rescan.tick(), if self.manifests.is_some() => self.rescan().await,
                _ = prune.tick() => self.prune(),
            }
        }
    }

    async fn resync(&self) {
        match self.ctx.enqueue_all().await {
            Ok(count) => {
                debug!("periodic resync queued {} objects", count);
                *self.last_resync_at.write() = Some(Utc::now());
            }
            Err(e) => warn!("periodic resync failed: {}", e),
        }
    }

    async fn rescan(&self) {
        let Some(loader) = self.manifests.clone() else {
            return;
        };
        match tokio::task::spawn_blocking(move || loader.load_once()).await {
            Ok(Ok(stats)) => debug!("manifest rescan: {:?}", stats),
            Ok(Err(e)) => warn!("manifest rescan failed: {}", e),
            Err(e) => error!("manifest rescan task failed: {}", e),
        }
    }

    fn prune(&self) {
        let pruned = self.subscriptions.prune_idle(self.config.subscription_ttl);
        if pruned > 0 {
            info!("pruned {} idle poll subscriptions", pruned);
        }
    }
}
