//! # Source Reader
//!
//! Resolves a RuleSet's ordered source references into `RuleSource`
//! snapshots. Fetches run concurrently but results keep input order, and
//! any single failure fails the whole read.

use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use futures::FutureExt;
use log::debug;
use rule_engine::crd::{validate_source_reference, ObjectReference};
use rule_engine::{RuleSource, SourceError, SourceRef, RULES_DATA_KEY};

use crate::cluster::{ClusterClient, ClusterError};

/// Default number of concurrent source fetches per read.
pub const DEFAULT_FETCH_CONCURRENCY: usize = 16;

pub struct SourceReader {
    cluster: Arc<dyn ClusterClient>,
    concurrency: usize,
}

impl SourceReader {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self {
            cluster,
            concurrency: DEFAULT_FETCH_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Read every referenced source in `namespace`, preserving order.
    pub async fn read(
        &self,
        namespace: &str,
        references: &[ObjectReference],
    ) -> Result<Vec<RuleSource>, SourceError> {
        for (index, reference) in references.iter().enumerate() {
            check_reference(index, reference)?;
        }

        let fetches: Vec<_> = references
            .iter()
            .map(|reference| self.fetch(namespace, reference).boxed())
            .collect();
        let sources: Vec<RuleSource> = stream::iter(fetches)
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        debug!("read {} rule sources from namespace {}", sources.len(), namespace);
        Ok(sources)
    }

    async fn fetch(
        &self,
        namespace: &str,
        reference: &ObjectReference,
    ) -> Result<RuleSource, SourceError> {
        let source_ref = SourceRef::config_map(reference.name.clone());

        let config_map = self
            .cluster
            .get_config_map(namespace, &reference.name)
            .await
            .map_err(|e| SourceError::Unavailable {
                reference: source_ref.clone(),
                reason: match e {
                    ClusterError::NotFound(_) => "not found".to_string(),
                    other => other.to_string(),
                },
            })?;

        let content = config_map
            .data
            .get(RULES_DATA_KEY)
            .ok_or_else(|| SourceError::Invalid {
                reference: source_ref.clone(),
                reason: format!("missing data key '{RULES_DATA_KEY}'"),
            })?;

        RuleSource::new(source_ref, content.clone())
    }
}

/// The same admission rules the RuleSet resource enforces.
fn check_reference(index: usize, reference: &ObjectReference) -> Result<(), SourceError> {
    validate_source_reference(index, reference).map_err(|e| SourceError::Invalid {
        reference: SourceRef::new(reference.kind.clone(), reference.name.clone()),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use rule_engine::crd::ConfigMap;

    fn cluster_with(sources: &[(&str, &str)]) -> Arc<InMemoryCluster> {
        let cluster = Arc::new(InMemoryCluster::new());
        for (name, rules) in sources {
            cluster.apply_config_map(ConfigMap::new("waf", *name).with_data(RULES_DATA_KEY, *rules));
        }
        cluster
    }

    fn refs(names: &[&str]) -> Vec<ObjectReference> {
        names.iter().map(|n| ObjectReference::config_map(*n)).collect()
    }

    #[tokio::test]
    async fn preserves_reference_order() {
        let names: Vec<String> = (0..40).map(|i| format!("cm-{i:02}")).collect();
        let contents: Vec<String> = (0..40).map(|i| format!("SecAction \"id:{i}\"\n")).collect();
        let pairs: Vec<(&str, &str)> = names
            .iter()
            .zip(&contents)
            .map(|(n, c)| (n.as_str(), c.as_str()))
            .collect();
        let cluster = cluster_with(&pairs);

        let mut order: Vec<&str> = names.iter().map(String::as_str).collect();
        order.reverse();
        let reader = SourceReader::new(cluster).with_concurrency(8);
        let sources = reader.read("waf", &refs(&order)).await.unwrap();

        let read: Vec<&str> = sources.iter().map(|s| s.reference().name.as_str()).collect();
        assert_eq!(read, order);
    }

    #[tokio::test]
    async fn missing_source_is_unavailable() {
        let reader = SourceReader::new(cluster_with(&[("base", "rule1\n")]));
        let err = reader.read("waf", &refs(&["base", "custom"])).await.unwrap_err();
        assert!(matches!(err, SourceError::Unavailable { .. }));
        assert_eq!(err.reference().name, "custom");
    }

    #[tokio::test]
    async fn missing_rules_key_is_invalid() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.apply_config_map(ConfigMap::new("waf", "base").with_data("other", "x"));
        let reader = SourceReader::new(cluster);
        let err = reader.read("waf", &refs(&["base"])).await.unwrap_err();
        assert_eq!(err.reason_code(), "SourceInvalid");
    }

    #[tokio::test]
    async fn cross_namespace_reference_is_invalid_without_fetching() {
        let cluster = cluster_with(&[("base", "rule1\n")]);
        cluster.set_available(false);
        let mut reference = ObjectReference::config_map("base");
        reference.namespace = "other".to_string();

        let reader = SourceReader::new(cluster);
        let err = reader.read("waf", &[reference]).await.unwrap_err();
        assert!(matches!(err, SourceError::Invalid { .. }));
    }

    #[tokio::test]
    async fn explicit_namespace_and_missing_api_version_are_invalid() {
        let reader = SourceReader::new(cluster_with(&[("base", "rule1\n")]));

        let mut local = ObjectReference::config_map("base");
        local.namespace = "waf".to_string();
        let err = reader.read("waf", &[local]).await.unwrap_err();
        assert_eq!(err.reason_code(), "SourceInvalid");

        let mut bare = ObjectReference::config_map("base");
        bare.api_version.clear();
        let err = reader.read("waf", &[bare]).await.unwrap_err();
        assert_eq!(err.reason_code(), "SourceInvalid");
    }

    #[tokio::test]
    async fn read_can_run_on_a_spawned_task() {
        let reader = Arc::new(SourceReader::new(cluster_with(&[("base", "rule1\n")])));
        let references = refs(&["base"]);
        let handle = tokio::spawn({
            let reader = Arc::clone(&reader);
            async move { reader.read("waf", &references).await }
        });
        let sources = handle.await.unwrap().unwrap();
        assert_eq!(sources[0].content(), "rule1\n");
    }

    #[tokio::test]
    async fn cluster_outage_is_unavailable() {
        let cluster = cluster_with(&[("base", "rule1\n")]);
        cluster.set_available(false);
        let reader = SourceReader::new(cluster);
        let err = reader.read("waf", &refs(&["base"])).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
