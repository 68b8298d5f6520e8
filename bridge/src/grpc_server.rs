//! # gRPC Server for RuleSet Distribution
//!
//! Serves compiled rulesets to WAF engines over a pull protocol:
//! 1. `Poll` compares the engine's fingerprint with the current version
//! 2. `GetRuleSetHistory` and `ListSubscriptions` expose what was served
//! 3. `RefreshRuleSet` forces a recompilation
//!
//! Handlers never block on compilation; they read whatever is current.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info};
use rule_engine::DEFAULT_MAX_BODY_BYTES;
use tokio::sync::watch;
use tonic::{transport::Server, Request, Response, Status};

use crate::cluster::NamespacedName;
use crate::distribution::{DistributionServer, PollOutcome};
use crate::refresh::RefreshService;

// Include the generated protobuf code
pub mod ruleset_distribution {
    tonic::include_proto!("ruleset_distribution");
}

use ruleset_distribution::{
    rule_set_distribution_server::{RuleSetDistribution, RuleSetDistributionServer},
    HistoryEntry, HistoryRequest, HistoryResponse, ListSubscriptionsRequest,
    ListSubscriptionsResponse, PollRequest, PollResponse, PollStatus, RefreshRuleSetRequest,
    RefreshRuleSetResponse, Subscription,
};

const ANONYMOUS_CLIENT: &str = "anonymous";

/// Largest response the server will encode: a full compiled body plus the
/// small fixed fields around it. Stock gRPC clients decode at most 4 MiB, so
/// engines must raise their limit to at least this.
pub const MAX_RESPONSE_BYTES: usize = DEFAULT_MAX_BODY_BYTES + 64 * 1024;

/// Requests are small; this is tonic's default.
const MAX_REQUEST_BYTES: usize = 4 * 1024 * 1024;

// ================================================================================================
// DISTRIBUTION SERVICE IMPLEMENTATION
// ================================================================================================

pub struct RuleSetDistributionService {
    distribution: Arc<DistributionServer>,
    refresh: Arc<RefreshService>,
}

impl RuleSetDistributionService {
    pub fn new(distribution: Arc<DistributionServer>, refresh: Arc<RefreshService>) -> Self {
        Self {
            distribution,
            refresh,
        }
    }
}

#[tonic::async_trait]
impl RuleSetDistribution for RuleSetDistributionService {
    async fn poll(&self, request: Request<PollRequest>) -> Result<Response<PollResponse>, Status> {
        let remote = request.remote_addr();
        let req = request.into_inner();
        let rule_set = rule_set_name(&req.namespace, &req.name)?;
        let client_id = client_identity(&req.client_id, remote);

        let outcome = self
            .distribution
            .poll(&rule_set, &req.last_fingerprint, &client_id);
        let server_id = self.distribution.server_id().to_string();

        let response = match outcome {
            PollOutcome::Modified(record) => {
                let ruleset = record.ruleset();
                PollResponse {
                    status: PollStatus::Modified as i32,
                    fingerprint: ruleset.fingerprint.clone(),
                    generation: ruleset.generation,
                    rules: ruleset.body().to_string(),
                    compiled_at_unix_ms: ruleset.compiled_at.timestamp_millis(),
                    server_id,
                }
            }
            PollOutcome::NotModified {
                fingerprint,
                generation,
            } => PollResponse {
                status: PollStatus::NotModified as i32,
                fingerprint,
                generation,
                rules: String::new(),
                compiled_at_unix_ms: 0,
                server_id,
            },
            PollOutcome::Unavailable => PollResponse {
                status: PollStatus::Unavailable as i32,
                fingerprint: String::new(),
                generation: 0,
                rules: String::new(),
                compiled_at_unix_ms: 0,
                server_id,
            },
        };
        Ok(Response::new(response))
    }

    async fn get_rule_set_history(
        &self,
        request: Request<HistoryRequest>,
    ) -> Result<Response<HistoryResponse>, Status> {
        let req = request.into_inner();
        let rule_set = rule_set_name(&req.namespace, &req.name)?;
        let limit = if req.limit == 0 {
            usize::MAX
        } else {
            req.limit as usize
        };

        let entries = self
            .distribution
            .history(&rule_set, limit)
            .iter()
            .map(|record| {
                let ruleset = record.ruleset();
                HistoryEntry {
                    fingerprint: ruleset.fingerprint.clone(),
                    generation: ruleset.generation,
                    compiled_at_unix_ms: ruleset.compiled_at.timestamp_millis(),
                    source_count: ruleset.source_count() as u32,
                }
            })
            .collect();
        Ok(Response::new(HistoryResponse { entries }))
    }

    async fn list_subscriptions(
        &self,
        request: Request<ListSubscriptionsRequest>,
    ) -> Result<Response<ListSubscriptionsResponse>, Status> {
        let req = request.into_inner();
        let namespace = non_empty(&req.namespace);
        let name = non_empty(&req.name);

        let subscriptions = self
            .distribution
            .subscriptions(namespace, name)
            .into_iter()
            .map(|s| Subscription {
                client_id: s.client_id,
                namespace: s.rule_set.namespace,
                name: s.rule_set.name,
                last_fingerprint: s.last_fingerprint,
                last_poll_unix_ms: s.last_poll.timestamp_millis(),
                poll_count: s.poll_count,
            })
            .collect();
        Ok(Response::new(ListSubscriptionsResponse { subscriptions }))
    }

    async fn refresh_rule_set(
        &self,
        request: Request<RefreshRuleSetRequest>,
    ) -> Result<Response<RefreshRuleSetResponse>, Status> {
        let req = request.into_inner();
        let rule_set = rule_set_name(&req.namespace, &req.name)?;

        match self.refresh.refresh(&rule_set).await {
            Ok(stats) => Ok(Response::new(RefreshRuleSetResponse {
                queued: true,
                message: if stats.newly_queued {
                    format!("RuleSet {} queued for recompilation", rule_set)
                } else {
                    format!("RuleSet {} was already queued", rule_set)
                },
            })),
            Err(e) if e.is_not_found() => Err(Status::not_found(format!(
                "RuleSet {} not found",
                rule_set
            ))),
            Err(e) => Err(Status::unavailable(format!("Refresh failed: {}", e))),
        }
    }
}

// ================================================================================================
// HELPER FUNCTIONS
// ================================================================================================

fn rule_set_name(namespace: &str, name: &str) -> Result<NamespacedName, Status> {
    if namespace.is_empty() || name.is_empty() {
        return Err(Status::invalid_argument(
            "namespace and name of the RuleSet are required",
        ));
    }
    Ok(NamespacedName::new(namespace, name))
}

/// Engines that do not send an id are tracked by peer IP. The port changes
/// with every connection, so it is left out.
fn client_identity(client_id: &str, remote: Option<SocketAddr>) -> String {
    if !client_id.is_empty() {
        return client_id.to_string();
    }
    remote
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| ANONYMOUS_CLIENT.to_string())
}

fn non_empty(value: &str) -> Option<&str> {
    (!value.is_empty()).then_some(value)
}

// ================================================================================================
// SERVER STARTUP
// ================================================================================================

/// Serve the distribution API on `addr` until `shutdown` flips to true.
pub async fn start_grpc_server(
    addr: SocketAddr,
    service: RuleSetDistributionService,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), tonic::transport::Error> {
    info!("Starting RuleSet distribution gRPC server on {}", addr);

    Server::builder()
        .add_service(
            RuleSetDistributionServer::new(service)
                .max_encoding_message_size(MAX_RESPONSE_BYTES)
                .max_decoding_message_size(MAX_REQUEST_BYTES),
        )
        .serve_with_shutdown(addr, async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            debug!("gRPC server draining");
        })
        .await?;

    info!("gRPC server stopped");
    Ok(())
}
