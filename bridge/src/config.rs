//! Command-line and environment configuration for `ruleset-cache-server`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::ServerError;
use crate::reconciler::ControllerConfig;
use crate::refresh::SchedulerConfig;

/// RuleSet reconciler and pull-based ruleset cache server for Coraza WAF engines
#[derive(Parser, Debug, Clone)]
#[command(name = "ruleset-cache-server", version, about, long_about = None)]
pub struct ServerConfig {
    /// Address the distribution gRPC API listens on
    #[arg(long, env = "RULESET_GRPC_ADDR", default_value = "0.0.0.0:50051")]
    pub grpc_addr: String,

    /// Directory of RuleSet, Engine and ConfigMap manifests to load
    #[arg(long, env = "RULESET_MANIFEST_DIR")]
    pub manifest_dir: Option<PathBuf>,

    /// Seconds between manifest directory scans
    #[arg(long, env = "RULESET_MANIFEST_RESCAN_SECS", default_value_t = 10)]
    pub manifest_rescan_secs: u64,

    /// Seconds between full resyncs of every RuleSet and Engine
    #[arg(long, env = "RULESET_RESYNC_SECS", default_value_t = 300)]
    pub resync_secs: u64,

    /// Compiled versions kept per RuleSet
    #[arg(long, env = "RULESET_HISTORY_SIZE", default_value_t = 10)]
    pub history_size: usize,

    /// Reconcile workers
    #[arg(long, env = "RULESET_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Seconds after which an engine that stopped polling is forgotten
    #[arg(long, env = "RULESET_SUBSCRIPTION_TTL_SECS", default_value_t = 3600)]
    pub subscription_ttl_secs: u64,

    /// Concurrent ConfigMap reads per RuleSet compilation
    #[arg(long, env = "RULESET_SOURCE_FETCH_CONCURRENCY", default_value_t = 16)]
    pub source_fetch_concurrency: usize,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "RULESET_LOG_FILTER", default_value = "info")]
    pub log_filter: String,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ServerError> {
        let positive = [
            ("manifest-rescan-secs", self.manifest_rescan_secs as usize),
            ("resync-secs", self.resync_secs as usize),
            ("history-size", self.history_size),
            ("workers", self.workers),
            ("subscription-ttl-secs", self.subscription_ttl_secs as usize),
            ("source-fetch-concurrency", self.source_fetch_concurrency),
        ];
        if let Some((flag, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ServerError::Config(format!("--{flag} must be greater than zero")));
        }
        if let Some(dir) = &self.manifest_dir {
            if !dir.is_dir() {
                return Err(ServerError::Config(format!(
                    "manifest directory {} does not exist",
                    dir.display()
                )));
            }
        }
        self.socket_addr()?;
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.grpc_addr.parse()?)
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            source_fetch_concurrency: self.source_fetch_concurrency,
            ..Default::default()
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            resync_interval: Duration::from_secs(self.resync_secs),
            manifest_rescan_interval: Duration::from_secs(self.manifest_rescan_secs),
            subscription_ttl: Duration::from_secs(self.subscription_ttl_secs),
            ..Default::default()
        }
    }
}
