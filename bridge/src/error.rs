//! Error types for the reconciler and the server binary.
//!
//! Source and compilation failures are not here: they are caught inside the
//! reconciler and surface only as status conditions.

use thiserror::Error;

use crate::cluster::{ClusterError, ManifestError};

/// Failures that escape a single reconcile.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Status writes kept failing with the API server unreachable.
    #[error("cluster unreachable after {failures} consecutive failures")]
    ClusterUnreachable { failures: u32 },

    #[error("watch stream closed")]
    WatchClosed,
}

impl ReconcileError {
    /// Whether the failure indicates the API server is unreachable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Cluster(ClusterError::Unavailable(_)))
    }
}

/// Top-level errors of the `ruleset-cache-server` binary.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid listen address: {0}")]
    Address(#[from] std::net::AddrParseError),

    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
