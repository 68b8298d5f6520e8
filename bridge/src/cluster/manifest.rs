//! Directory-backed object source.
//!
//! Loads `RuleSet`, `Engine` and `ConfigMap` manifests (`.yaml`, `.yml`,
//! `.json`, multi-document YAML allowed) into an [`InMemoryCluster`]. Each
//! scan applies what changed and deletes objects whose manifests are gone.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use rule_engine::crd::{ConfigMap, Engine, RuleSet};
use serde::Deserialize;
use thiserror::Error;

use super::{InMemoryCluster, ObjectKey, ResourceKind};

const MANIFEST_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

/// Result of one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub files: usize,
    pub objects: usize,
    pub deleted: usize,
    /// Files or documents skipped because they could not be parsed or
    /// failed validation.
    pub rejected: usize,
}

enum Manifest {
    RuleSet(RuleSet),
    Engine(Engine),
    ConfigMap(ConfigMap),
}

impl Manifest {
    fn key(&self) -> ObjectKey {
        let (kind, meta) = match self {
            Self::RuleSet(o) => (ResourceKind::RuleSet, &o.metadata),
            Self::Engine(o) => (ResourceKind::Engine, &o.metadata),
            Self::ConfigMap(o) => (ResourceKind::ConfigMap, &o.metadata),
        };
        ObjectKey::new(kind, meta.namespace_or_default(), meta.name.clone())
    }
}

pub struct ManifestLoader {
    dir: PathBuf,
    cluster: Arc<InMemoryCluster>,
    /// Keys loaded by the previous scan; anything missing next time is deleted.
    loaded: Mutex<HashSet<ObjectKey>>,
}

impl ManifestLoader {
    pub fn new(dir: impl Into<PathBuf>, cluster: Arc<InMemoryCluster>) -> Self {
        Self {
            dir: dir.into(),
            cluster,
            loaded: Mutex::new(HashSet::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Scan the directory once and reconcile the cluster with it.
    ///
    /// Deletions are skipped when any file failed to parse, so a manifest
    /// caught mid-edit does not remove its objects.
    pub fn load_once(&self) -> Result<LoadStats, ManifestError> {
        let mut stats = LoadStats::default();
        let mut files = Vec::new();
        collect_manifest_files(&self.dir, &mut files)?;
        files.sort();

        let mut manifests = Vec::new();
        for path in &files {
            stats.files += 1;
            match parse_file(path) {
                Ok((parsed, rejected)) => {
                    manifests.extend(parsed);
                    stats.rejected += rejected;
                }
                Err(e) => {
                    warn!("{}", e);
                    stats.rejected += 1;
                }
            }
        }

        let mut seen = HashSet::new();
        for manifest in manifests {
            seen.insert(manifest.key());
            stats.objects += 1;
            match manifest {
                Manifest::RuleSet(o) => {
                    self.cluster.apply_rule_set(o);
                }
                Manifest::Engine(o) => {
                    self.cluster.apply_engine(o);
                }
                Manifest::ConfigMap(o) => {
                    self.cluster.apply_config_map(o);
                }
            }
        }

        let mut loaded = self.loaded.lock();
        if stats.rejected == 0 {
            for key in loaded.difference(&seen) {
                if self.cluster.delete(key) {
                    info!("manifest for {} removed, deleted object", key);
                    stats.deleted += 1;
                }
            }
            *loaded = seen;
        } else {
            loaded.extend(seen);
        }

        debug!(
            "manifest scan of {}: {} files, {} objects, {} deleted, {} rejected",
            self.dir.display(),
            stats.files,
            stats.objects,
            stats.deleted,
            stats.rejected
        );
        Ok(stats)
    }
}

fn collect_manifest_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), ManifestError> {
    let io_err = |source| ManifestError::Io {
        path: dir.to_path_buf(),
        source,
    };

    for entry in fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_dir() {
            collect_manifest_files(&path, out)?;
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| MANIFEST_EXTENSIONS.contains(&e))
        {
            out.push(path);
        }
    }
    Ok(())
}

/// Parse every document in a file. Returns the accepted manifests and the
/// number of documents rejected.
fn parse_file(path: &Path) -> Result<(Vec<Manifest>, usize), ManifestError> {
    let text = fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_err = |reason: String| ManifestError::Parse {
        path: path.to_path_buf(),
        reason,
    };

    let mut manifests = Vec::new();
    let mut rejected = 0;

    // JSON is a subset of YAML, so one parser handles both.
    for document in serde_yaml::Deserializer::from_str(&text) {
        let value = serde_yaml::Value::deserialize(document).map_err(|e| parse_err(e.to_string()))?;
        if value.is_null() {
            continue;
        }

        let kind = value
            .get("kind")
            .and_then(|k| k.as_str())
            .map(str::to_string)
            .unwrap_or_default();

        let manifest = match ResourceKind::from_kind(&kind) {
            Some(ResourceKind::RuleSet) => serde_yaml::from_value(value)
                .map_err(|e| parse_err(e.to_string()))
                .and_then(|rs: RuleSet| match rs.validate() {
                    Ok(()) => Ok(Manifest::RuleSet(rs)),
                    Err(e) => Err(parse_err(format!("RuleSet {}: {}", rs.name(), e))),
                }),
            Some(ResourceKind::Engine) => serde_yaml::from_value(value)
                .map_err(|e| parse_err(e.to_string()))
                .and_then(|engine: Engine| match engine.validate() {
                    Ok(()) => Ok(Manifest::Engine(engine)),
                    Err(e) => Err(parse_err(format!("Engine {}: {}", engine.name(), e))),
                }),
            Some(ResourceKind::ConfigMap) => serde_yaml::from_value(value)
                .map(Manifest::ConfigMap)
                .map_err(|e| parse_err(e.to_string())),
            None => {
                debug!("{}: skipping document of kind '{}'", path.display(), kind);
                continue;
            }
        };

        match manifest {
            Ok(manifest) => manifests.push(manifest),
            Err(e) => {
                warn!("{}", e);
                rejected += 1;
            }
        }
    }

    Ok((manifests, rejected))
}
