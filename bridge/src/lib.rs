//! # WAF RuleSet Bridge
//!
//! Reconciles `RuleSet` and `Engine` resources into compiled rulesets and
//! serves them to polling Coraza WAF engines.

// Core modules
pub mod cache;
pub mod cluster;
pub mod config;
pub mod distribution;
pub mod error;
pub mod grpc_server;
pub mod reconciler;
pub mod refresh;
pub mod retry;
pub mod source_reader;
pub mod telemetry;

// Re-export commonly used types
pub use cache::RuleSetCache;
pub use cluster::{ClusterClient, ClusterError, InMemoryCluster, NamespacedName, ObjectKey};
pub use distribution::{DistributionServer, PollOutcome};
pub use error::{ReconcileError, ServerError};
pub use reconciler::{Controller, ControllerConfig};
