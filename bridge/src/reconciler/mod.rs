//! # Reconciler
//!
//! Watches RuleSets, Engines and ConfigMaps and drives every RuleSet towards
//! a compiled, published version.
//!
//! Watch events only enqueue keys; a fixed pool of workers drains the
//! [`WorkQueue`]. The queue never hands the same key to two workers, so
//! reconciles of one RuleSet are serialized while different RuleSets
//! proceed in parallel.

mod engine;
mod index;
mod queue;
mod ruleset;
mod status;

pub use engine::{
    wasm_plugin_name, BindingRegistry, EngineBinding, EnginePhase, REASON_RULES_AVAILABLE,
    REASON_RULE_SET_NOT_FOUND, REASON_SPEC_INVALID, REASON_WAITING_FOR_RULE_SET,
    WASM_PLUGIN_API_VERSION, WASM_PLUGIN_KIND,
};
pub use index::{GenerationCounters, SourceIndex};
pub use queue::WorkQueue;
pub use ruleset::{
    RuleSetPhase, REASON_COMPILATION_FAILED, REASON_INVALID_RULE_SET, REASON_RULES_COMPILED,
    REASON_SERVING_LAST_KNOWN_GOOD, REASON_SOURCE_INVALID, REASON_SOURCE_UNAVAILABLE,
};
pub use status::{CONDITION_DEGRADED, CONDITION_PROGRESSING, CONDITION_READY};

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use rule_engine::RuleSetCompiler;
use tokio::sync::{broadcast, mpsc, watch};

use crate::cache::RuleSetCache;
use crate::cluster::{ClusterClient, ClusterError, ObjectKey, ResourceKind, WatchEvent};
use crate::error::ReconcileError;
use crate::retry::RetryConfig;
use crate::source_reader::{SourceReader, DEFAULT_FETCH_CONCURRENCY};

/// Tuning knobs for the reconciler.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub workers: usize,
    pub source_fetch_concurrency: usize,
    /// Backoff for optimistic-concurrency status writes.
    pub status_retry: RetryConfig,
    /// Delay before a degraded RuleSet is retried.
    pub error_requeue: Duration,
    /// Consecutive "API server unreachable" reconciles before giving up.
    pub max_consecutive_cluster_failures: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            source_fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            status_retry: RetryConfig::with_max_attempts(5),
            error_requeue: Duration::from_secs(15),
            max_consecutive_cluster_failures: 10,
        }
    }
}

/// State shared by all workers.
pub struct Context {
    pub cluster: Arc<dyn ClusterClient>,
    pub cache: Arc<RuleSetCache>,
    pub reader: SourceReader,
    pub compiler: RuleSetCompiler,
    pub bindings: BindingRegistry,
    pub source_index: SourceIndex,
    pub generations: GenerationCounters,
    pub queue: Arc<WorkQueue>,
    pub config: ControllerConfig,
    consecutive_unavailable: AtomicU32,
}

impl Context {
    /// Enqueue every RuleSet and Engine currently in the cluster, plus
    /// anything still held locally that the cluster no longer lists. The
    /// latter reconcile as NotFound and are cleaned up, which covers deletes
    /// whose watch event was dropped.
    pub async fn enqueue_all(&self) -> Result<usize, ClusterError> {
        let mut keys: HashSet<ObjectKey> = HashSet::new();
        for rule_set in self.cluster.list_rule_sets().await? {
            keys.insert(ObjectKey::rule_set(rule_set.namespace(), rule_set.name()));
        }
        for engine in self.cluster.list_engines().await? {
            keys.insert(ObjectKey::engine(engine.namespace(), engine.name()));
        }
        let listed = keys.len();

        for rule_set in self.cache.keys() {
            keys.insert(ObjectKey::rule_set(rule_set.namespace, rule_set.name));
        }
        for engine in self.bindings.engines() {
            keys.insert(ObjectKey::engine(engine.namespace, engine.name));
        }
        let orphaned = keys.len() - listed;
        if orphaned > 0 {
            info!("resync found {} objects no longer in the cluster", orphaned);
        }

        let total = keys.len();
        for key in keys {
            self.queue.add(key);
        }
        debug!("enqueued {} objects for full resync", total);
        Ok(total)
    }

    /// Map a watch event to the keys that need reconciling.
    pub fn route_event(&self, event: &WatchEvent) {
        let key = event.key();
        match key.kind {
            ResourceKind::RuleSet => {
                self.queue.add(key.clone());
                for engine in self.bindings.engines_for(&key.namespaced_name()) {
                    self.queue.add(ObjectKey::engine(engine.namespace, engine.name));
                }
            }
            ResourceKind::Engine => {
                self.queue.add(key.clone());
            }
            ResourceKind::ConfigMap => {
                for rule_set in self.source_index.rule_sets_for(&key.namespaced_name()) {
                    debug!("ConfigMap {} changed, recompiling {}", key, rule_set);
                    self.queue.add(ObjectKey::rule_set(rule_set.namespace, rule_set.name));
                }
            }
        }
    }

    /// Reconcile one key. Returns a delay when the key should be retried.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Option<Duration>, ReconcileError> {
        let name = key.namespaced_name();
        let requeue = match key.kind {
            ResourceKind::RuleSet => match ruleset::reconcile(self, &name).await? {
                RuleSetPhase::Degraded { retryable: true, .. } => Some(self.config.error_requeue),
                _ => None,
            },
            ResourceKind::Engine => {
                engine::reconcile(self, &name).await?;
                None
            }
            // ConfigMaps are routed to RuleSets and never queued themselves.
            ResourceKind::ConfigMap => None,
        };
        Ok(requeue)
    }

    /// Record the result of a reconcile against the unreachable-cluster
    /// budget. Returns an error once the budget is exhausted.
    fn track_availability(&self, result: &Result<Option<Duration>, ReconcileError>) -> Result<(), ReconcileError> {
        match result {
            Err(e) if e.is_unavailable() => {
                let failures = self.consecutive_unavailable.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.max_consecutive_cluster_failures {
                    return Err(ReconcileError::ClusterUnreachable { failures });
                }
                Ok(())
            }
            _ => {
                self.consecutive_unavailable.store(0, Ordering::SeqCst);
                Ok(())
            }
        }
    }
}

/// Owns the worker pool and the watch loop.
pub struct Controller {
    ctx: Arc<Context>,
}

impl Controller {
    pub fn new(cluster: Arc<dyn ClusterClient>, cache: Arc<RuleSetCache>, config: ControllerConfig) -> Self {
        let reader =
            SourceReader::new(Arc::clone(&cluster)).with_concurrency(config.source_fetch_concurrency);
        let ctx = Context {
            cluster,
            cache,
            reader,
            compiler: RuleSetCompiler::new(),
            bindings: BindingRegistry::new(),
            source_index: SourceIndex::new(),
            generations: GenerationCounters::new(),
            queue: Arc::new(WorkQueue::new()),
            config,
            consecutive_unavailable: AtomicU32::new(0),
        };
        Self { ctx: Arc::new(ctx) }
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.ctx.queue)
    }

    pub fn context(&self) -> Arc<Context> {
        Arc::clone(&self.ctx)
    }

    /// Run until `shutdown` flips to true or a fatal error occurs.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ReconcileError> {
        let ctx = self.ctx;

        // Subscribe before listing so nothing between the two is missed.
        let mut events = ctx.cluster.watch();
        let queued = ctx.enqueue_all().await?;
        info!(
            "reconciler starting with {} workers, {} objects queued",
            ctx.config.workers, queued
        );

        let (fatal_tx, mut fatal_rx) = mpsc::channel::<ReconcileError>(1);
        let workers: Vec<_> = (0..ctx.config.workers.max(1))
            .map(|id| tokio::spawn(worker(id, Arc::clone(&ctx), fatal_tx.clone())))
            .collect();
        drop(fatal_tx);

        let result = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("reconciler shutting down");
                        break Ok(());
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => ctx.route_event(&event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("watch lagged by {} events, resyncing", missed);
                        if let Err(e) = ctx.enqueue_all().await {
                            warn!("resync after lag failed: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break Err(ReconcileError::WatchClosed),
                },
                Some(fatal) = fatal_rx.recv() => {
                    error!("reconciler stopping: {}", fatal);
                    break Err(fatal);
                }
            }
        };

        ctx.queue.shutdown();
        for handle in workers {
            if let Err(e) = handle.await {
                error!("reconcile worker panicked: {}", e);
            }
        }
        result
    }
}

async fn worker(id: usize, ctx: Arc<Context>, fatal: mpsc::Sender<ReconcileError>) {
    debug!("reconcile worker {} started", id);
    while let Some(key) = ctx.queue.next().await {
        let result = ctx.reconcile(&key).await;

        match &result {
            Ok(Some(delay)) => {
                debug!("{} degraded, retrying in {}s", key, delay.as_secs());
                ctx.queue.add_after(key.clone(), *delay);
            }
            Ok(None) => {}
            Err(e) => {
                warn!("reconcile of {} failed: {}", key, e);
                ctx.queue.add_after(key.clone(), ctx.config.error_requeue);
            }
        }
        ctx.queue.done(&key);

        if let Err(e) = ctx.track_availability(&result) {
            let _ = fatal.try_send(e);
        }
    }
    debug!("reconcile worker {} stopped", id);
}
