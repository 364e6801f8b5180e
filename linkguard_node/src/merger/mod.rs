//! # Cluster Merger
//!
//! Folds one verified signal into the cluster set. A signal links its
//! fingerprint, account id and source ip; every cluster already owning any of
//! them belongs with the signal, so the clusters are the connected components
//! of everything ingested so far.
//!
//! * no matching cluster: create one
//! * one matching cluster: union the signal into it
//! * several: union them all into the cluster with the lowest id and delete
//!   the rest, in one store transaction
//!
//! Finding the matches and applying the write happen under one global lock.
//! Without it two concurrent signals could each create or extend clusters
//! against a stale view and leave a value in two clusters.

use crate::error::Result;
use crate::storage::{ClusterStore, ClusterWrite};
use crate::types::{Cluster, ClusterId, Signal};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// What the merger decided to do with a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    Write(ClusterWrite),
    /// The signal adds nothing to the one cluster it matched.
    Unchanged(ClusterId),
}

/// Result of ingesting one signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Created(ClusterId),
    Extended(ClusterId),
    Unchanged(ClusterId),
    Merged {
        survivor: ClusterId,
        absorbed: Vec<ClusterId>,
    },
}

impl MergeOutcome {
    /// Cluster now holding the signal.
    pub fn cluster_id(&self) -> ClusterId {
        match self {
            MergeOutcome::Created(id)
            | MergeOutcome::Extended(id)
            | MergeOutcome::Unchanged(id) => *id,
            MergeOutcome::Merged { survivor, .. } => *survivor,
        }
    }
}

/// Decide the write for `signal` given the clusters that currently own any of
/// its attributes.
pub fn plan_write(signal: &Signal, mut matches: Vec<Cluster>) -> Plan {
    matches.sort_by_key(|cluster| cluster.id);
    matches.dedup_by_key(|cluster| cluster.id);

    let mut matches = matches.into_iter();
    let Some(mut survivor) = matches.next() else {
        return Plan::Write(ClusterWrite::Create {
            cluster: Cluster::from_signal(ClusterId(0), signal),
        });
    };

    let losers: Vec<Cluster> = matches.collect();
    if losers.is_empty() {
        return if survivor.absorb_signal(signal) {
            Plan::Write(ClusterWrite::Extend { cluster: survivor })
        } else {
            Plan::Unchanged(survivor.id)
        };
    }

    let loser_ids = losers.iter().map(|cluster| cluster.id).collect();
    for loser in losers {
        survivor.absorb(loser);
    }
    survivor.absorb_signal(signal);

    Plan::Write(ClusterWrite::Merge {
        survivor,
        losers: loser_ids,
    })
}

/// Serializes cluster maintenance over a shared store.
pub struct ClusterMerger {
    store: Arc<dyn ClusterStore>,
    critical: Mutex<()>,
}

impl ClusterMerger {
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self {
            store,
            critical: Mutex::new(()),
        }
    }

    /// The store this merger writes to; reads may go straight to it.
    pub fn store(&self) -> &Arc<dyn ClusterStore> {
        &self.store
    }

    /// Fold one signal into the cluster set.
    pub async fn ingest(&self, signal: &Signal) -> Result<MergeOutcome> {
        let _guard = self.critical.lock().await;

        let matches = self.store.find_matching(signal).await?;
        debug!("Signal matched {} clusters", matches.len());

        let outcome = match plan_write(signal, matches) {
            Plan::Unchanged(id) => MergeOutcome::Unchanged(id),
            Plan::Write(write) => {
                let losers = match &write {
                    ClusterWrite::Merge { losers, .. } => Some(losers.clone()),
                    _ => None,
                };
                let extended = matches!(write, ClusterWrite::Extend { .. });
                let id = self.store.apply(write).await?;

                match losers {
                    Some(absorbed) => MergeOutcome::Merged {
                        survivor: id,
                        absorbed,
                    },
                    None if extended => MergeOutcome::Extended(id),
                    None => MergeOutcome::Created(id),
                }
            }
        };

        match &outcome {
            MergeOutcome::Created(id) => info!("Created cluster {}", id),
            MergeOutcome::Extended(id) => info!("Extended cluster {}", id),
            MergeOutcome::Unchanged(id) => debug!("Cluster {} already holds signal", id),
            MergeOutcome::Merged { survivor, absorbed } => {
                info!("Merged clusters {:?} into cluster {}", absorbed, survivor)
            }
        }

        Ok(outcome)
    }
}
