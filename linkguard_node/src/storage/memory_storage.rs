use crate::error::{LinkGuardError, Result};
use crate::storage::{validate_write, ClusterStore, ClusterWrite};
use crate::types::{AttributeKind, Cluster, ClusterId, Signal, StoreStats};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

#[derive(Debug)]
struct MemoryState {
    clusters: BTreeMap<ClusterId, Cluster>,
    fingerprints: HashMap<String, ClusterId>,
    account_ids: HashMap<String, ClusterId>,
    ips: HashMap<String, ClusterId>,
    next_id: i64,
}

impl MemoryState {
    fn index(&self, kind: AttributeKind) -> &HashMap<String, ClusterId> {
        match kind {
            AttributeKind::Fingerprint => &self.fingerprints,
            AttributeKind::AccountId => &self.account_ids,
            AttributeKind::Ip => &self.ips,
        }
    }

    fn index_mut(&mut self, kind: AttributeKind) -> &mut HashMap<String, ClusterId> {
        match kind {
            AttributeKind::Fingerprint => &mut self.fingerprints,
            AttributeKind::AccountId => &mut self.account_ids,
            AttributeKind::Ip => &mut self.ips,
        }
    }

    fn owner(&self, kind: AttributeKind, value: &str) -> Option<ClusterId> {
        self.index(kind).get(value).copied()
    }

    fn existing(&self, id: ClusterId) -> Result<&Cluster> {
        self.clusters
            .get(&id)
            .ok_or_else(|| LinkGuardError::Storage(format!("Cluster {} does not exist", id)))
    }

    /// Every attribute of `cluster` must be unowned or owned by a member of
    /// `group`.
    fn check_ownership(&self, cluster: &Cluster, group: &BTreeSet<ClusterId>) -> Result<()> {
        for (kind, value) in cluster.iter_attributes() {
            if let Some(owner) = self.owner(kind, value) {
                if !group.contains(&owner) {
                    return Err(LinkGuardError::Storage(format!(
                        "{} is already owned by cluster {}",
                        kind.as_str(),
                        owner
                    )));
                }
            }
        }
        Ok(())
    }

    /// Validate the whole write against the current state. Nothing is mutated
    /// until this has passed.
    fn check(&self, write: &ClusterWrite) -> Result<()> {
        validate_write(write)?;
        match write {
            ClusterWrite::Create { cluster } => self.check_ownership(cluster, &BTreeSet::new()),
            ClusterWrite::Extend { cluster } => {
                let current = self.existing(cluster.id)?;
                if !cluster.is_superset_of(current) {
                    return Err(LinkGuardError::Storage(format!(
                        "Extending cluster {} would drop attributes",
                        cluster.id
                    )));
                }
                self.check_ownership(cluster, &BTreeSet::from([cluster.id]))
            }
            ClusterWrite::Merge { survivor, losers } => {
                let mut group = BTreeSet::from([survivor.id]);
                for id in std::iter::once(&survivor.id).chain(losers.iter()) {
                    let current = self.existing(*id)?;
                    if !survivor.is_superset_of(current) {
                        return Err(LinkGuardError::Storage(format!(
                            "Merged cluster {} would drop attributes of cluster {}",
                            survivor.id, id
                        )));
                    }
                    group.insert(*id);
                }
                self.check_ownership(survivor, &group)
            }
        }
    }

    fn put(&mut self, cluster: Cluster) {
        let id = cluster.id;
        for kind in AttributeKind::ALL {
            for value in cluster.attributes(kind) {
                self.index_mut(kind).insert(value.clone(), id);
            }
        }
        self.clusters.insert(id, cluster);
    }
}

/// Cluster store held entirely in process memory.
///
/// All state sits behind a single lock; each write is validated and then
/// applied while the write guard is held, so readers never observe a half
/// applied merge.
#[derive(Debug)]
pub struct MemoryClusterStore {
    state: RwLock<MemoryState>,
}

impl Default for MemoryClusterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClusterStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState {
                clusters: BTreeMap::new(),
                fingerprints: HashMap::new(),
                account_ids: HashMap::new(),
                ips: HashMap::new(),
                next_id: 1,
            }),
        }
    }
}

#[async_trait]
impl ClusterStore for MemoryClusterStore {
    async fn find_matching(&self, signal: &Signal) -> Result<Vec<Cluster>> {
        let state = self.state.read();
        let ids: BTreeSet<ClusterId> = AttributeKind::ALL
            .into_iter()
            .filter_map(|kind| state.owner(kind, signal.attribute(kind)))
            .collect();

        ids.into_iter()
            .map(|id| state.existing(id).cloned())
            .collect()
    }

    async fn apply(&self, write: ClusterWrite) -> Result<ClusterId> {
        let mut state = self.state.write();
        state.check(&write)?;

        let id = match write {
            ClusterWrite::Create { mut cluster } => {
                cluster.id = ClusterId(state.next_id);
                state.next_id += 1;
                let id = cluster.id;
                state.put(cluster);
                id
            }
            ClusterWrite::Extend { cluster } => {
                let id = cluster.id;
                state.put(cluster);
                id
            }
            ClusterWrite::Merge { survivor, losers } => {
                for loser in &losers {
                    state.clusters.remove(loser);
                }
                // Every loser attribute is in the survivor, so `put` re-points
                // all of their index entries
                let id = survivor.id;
                state.put(survivor);
                id
            }
        };

        debug!("Applied cluster write, result cluster {}", id);
        Ok(id)
    }

    async fn get(&self, id: ClusterId) -> Result<Option<Cluster>> {
        Ok(self.state.read().clusters.get(&id).cloned())
    }

    async fn lookup(&self, kind: Option<AttributeKind>, value: &str) -> Result<Option<Cluster>> {
        let state = self.state.read();
        let kinds = match kind {
            Some(kind) => vec![kind],
            None => AttributeKind::ALL.to_vec(),
        };

        for kind in kinds {
            if let Some(id) = state.owner(kind, value) {
                return Ok(Some(state.existing(id)?.clone()));
            }
        }
        Ok(None)
    }

    async fn list(&self, limit: Option<usize>, offset: Option<usize>) -> Result<Vec<Cluster>> {
        let state = self.state.read();
        Ok(state
            .clusters
            .values()
            .skip(offset.unwrap_or(0))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let state = self.state.read();
        Ok(StoreStats {
            clusters: state.clusters.len(),
            fingerprints: state.fingerprints.len(),
            account_ids: state.account_ids.len(),
            ips: state.ips.len(),
        })
    }
}
