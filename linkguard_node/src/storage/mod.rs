//! # Storage Module for the LinkGuard Node
//!
//! Durable storage of clusters together with the three attribute indices
//! (fingerprint, account id and ip to owning cluster) the merger and the
//! operator read API share.
//!
//! ## Backends
//!
//! * `MemoryClusterStore`: clusters and indices in process memory behind one
//!   lock, for development and tests
//! * `SqlClusterStore`: SQLite-backed, one table per index with the attribute
//!   value as primary key
//!
//! ## Atomicity
//!
//! Every `ClusterWrite` is applied as one transaction. A write that fails for
//! any reason (unknown cluster, a loser that vanished, an attribute owned by a
//! cluster outside the write) leaves the store exactly as it was. Both
//! backends refuse writes that would break disjointness, independently of the
//! merger's own serialization.

use crate::config::{StorageConfig, StorageEngineKind};
use crate::error::{LinkGuardError, Result};
use crate::types::{AttributeKind, Cluster, ClusterId, Signal, StoreStats};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// In-memory cluster storage
pub mod memory_storage;
/// SQLite-based persistent cluster storage
pub mod sql_storage;

pub use memory_storage::MemoryClusterStore;
pub use sql_storage::SqlClusterStore;

/// One atomic change to the cluster set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterWrite {
    /// Insert a new cluster; the store assigns its id. The id on the carried
    /// cluster is ignored.
    Create { cluster: Cluster },
    /// Replace an existing cluster's attribute sets with a superset.
    Extend { cluster: Cluster },
    /// Write the survivor's (superset) attributes and delete every loser.
    Merge {
        survivor: Cluster,
        losers: Vec<ClusterId>,
    },
}

/// Core interface for cluster storage backends.
///
/// Lookups go through the attribute indices; nothing scans the full cluster
/// table except `list`, which exists for operator dumps.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// All clusters owning the signal's fingerprint, account id or ip, in
    /// ascending id order without duplicates.
    async fn find_matching(&self, signal: &Signal) -> Result<Vec<Cluster>>;

    /// Apply one write atomically and return the id of the cluster it
    /// produced (new id, extended id or survivor id).
    async fn apply(&self, write: ClusterWrite) -> Result<ClusterId>;

    /// Fetch a cluster by id.
    async fn get(&self, id: ClusterId) -> Result<Option<Cluster>>;

    /// Point lookup of the cluster owning `value`. Without a kind the
    /// fingerprint, account id and ip indices are consulted in that order.
    async fn lookup(&self, kind: Option<AttributeKind>, value: &str) -> Result<Option<Cluster>>;

    /// Clusters in ascending id order.
    async fn list(&self, limit: Option<usize>, offset: Option<usize>) -> Result<Vec<Cluster>>;

    /// Cluster and index entry counts.
    async fn stats(&self) -> Result<StoreStats>;
}

/// Build the storage backend named by the configuration.
pub fn create_store(config: &StorageConfig) -> Result<Arc<dyn ClusterStore>> {
    match config.engine {
        StorageEngineKind::Sqlite => {
            info!(
                "Initializing SQLite cluster store at {:?}",
                config.database_path
            );
            Ok(Arc::new(SqlClusterStore::new(&config.database_path)?))
        }
        StorageEngineKind::Memory => {
            info!("Initializing in-memory cluster store");
            Ok(Arc::new(MemoryClusterStore::new()))
        }
    }
}

/// Checks shared by both backends before anything is written.
pub(crate) fn validate_write(write: &ClusterWrite) -> Result<()> {
    match write {
        ClusterWrite::Create { cluster } | ClusterWrite::Extend { cluster } => {
            if cluster.is_empty() {
                return Err(LinkGuardError::Storage(
                    "Refusing to store an empty cluster".to_string(),
                ));
            }
        }
        ClusterWrite::Merge { survivor, losers } => {
            if survivor.is_empty() {
                return Err(LinkGuardError::Storage(
                    "Refusing to store an empty cluster".to_string(),
                ));
            }
            if losers.is_empty() {
                return Err(LinkGuardError::Storage(
                    "Merge without losers".to_string(),
                ));
            }
            if losers.contains(&survivor.id) {
                return Err(LinkGuardError::Storage(format!(
                    "Cluster {} cannot absorb itself",
                    survivor.id
                )));
            }
            let mut unique = losers.clone();
            unique.sort_unstable();
            unique.dedup();
            if unique.len() != losers.len() {
                return Err(LinkGuardError::Storage(
                    "Merge names a loser twice".to_string(),
                ));
            }
        }
    }
    Ok(())
}
