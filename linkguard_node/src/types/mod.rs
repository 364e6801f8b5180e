// Core types for the LinkGuard node
//
// Signals are the per-request observations; clusters are the persisted groups
// of identifiers linked by shared values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

/// Store-assigned cluster identifier. Ids are never reused, so the lowest id
/// in a merge is also the oldest cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub i64);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The three identifier kinds a cluster tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    Fingerprint,
    AccountId,
    Ip,
}

impl AttributeKind {
    /// Lookup order used when the caller does not name a kind.
    pub const ALL: [AttributeKind; 3] = [
        AttributeKind::Fingerprint,
        AttributeKind::AccountId,
        AttributeKind::Ip,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeKind::Fingerprint => "fingerprint",
            AttributeKind::AccountId => "account_id",
            AttributeKind::Ip => "ip",
        }
    }
}

/// Decrypted ingest payload as produced by the trusted backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimPayload {
    /// Device/browser fingerprint
    pub fingerprint: String,
    /// Account id claim
    pub id: String,
    /// Hex HMAC-SHA256 of `id` under the shared server secret
    pub hash: String,
}

/// One `(fingerprint, account id, source ip)` observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub fingerprint: String,
    pub account_id: String,
    pub source_ip: String,
    pub claim_hash: String,
}

impl Signal {
    /// Build a signal directly from its three attributes.
    pub fn new(
        fingerprint: impl Into<String>,
        account_id: impl Into<String>,
        source_ip: impl Into<String>,
    ) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            account_id: account_id.into(),
            source_ip: source_ip.into(),
            claim_hash: String::new(),
        }
    }

    /// Combine a verified claim with the source address of the request.
    pub fn from_claim(claim: ClaimPayload, source_ip: IpAddr) -> Self {
        Self {
            fingerprint: claim.fingerprint,
            account_id: claim.id,
            source_ip: source_ip.to_string(),
            claim_hash: claim.hash,
        }
    }

    pub fn attribute(&self, kind: AttributeKind) -> &str {
        match kind {
            AttributeKind::Fingerprint => &self.fingerprint,
            AttributeKind::AccountId => &self.account_id,
            AttributeKind::Ip => &self.source_ip,
        }
    }
}

/// A set of transitively linked identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub fingerprints: BTreeSet<String>,
    pub account_ids: BTreeSet<String>,
    pub ips: BTreeSet<String>,
}

impl Cluster {
    /// Empty cluster shell; callers fill it before handing it to a store.
    pub fn new(id: ClusterId) -> Self {
        Self {
            id,
            fingerprints: BTreeSet::new(),
            account_ids: BTreeSet::new(),
            ips: BTreeSet::new(),
        }
    }

    /// Cluster holding exactly the attributes of one signal.
    pub fn from_signal(id: ClusterId, signal: &Signal) -> Self {
        let mut cluster = Self::new(id);
        cluster.absorb_signal(signal);
        cluster
    }

    pub fn attributes(&self, kind: AttributeKind) -> &BTreeSet<String> {
        match kind {
            AttributeKind::Fingerprint => &self.fingerprints,
            AttributeKind::AccountId => &self.account_ids,
            AttributeKind::Ip => &self.ips,
        }
    }

    pub fn attributes_mut(&mut self, kind: AttributeKind) -> &mut BTreeSet<String> {
        match kind {
            AttributeKind::Fingerprint => &mut self.fingerprints,
            AttributeKind::AccountId => &mut self.account_ids,
            AttributeKind::Ip => &mut self.ips,
        }
    }

    /// Every `(kind, value)` pair in the cluster.
    pub fn iter_attributes(&self) -> impl Iterator<Item = (AttributeKind, &str)> + '_ {
        AttributeKind::ALL.into_iter().flat_map(move |kind| {
            self.attributes(kind)
                .iter()
                .map(move |value| (kind, value.as_str()))
        })
    }

    pub fn contains(&self, kind: AttributeKind, value: &str) -> bool {
        self.attributes(kind).contains(value)
    }

    /// Union the signal's attributes in. Returns whether anything was added.
    pub fn absorb_signal(&mut self, signal: &Signal) -> bool {
        let mut changed = false;
        for kind in AttributeKind::ALL {
            changed |= self
                .attributes_mut(kind)
                .insert(signal.attribute(kind).to_string());
        }
        changed
    }

    /// Union another cluster's attributes in, keeping this cluster's id.
    pub fn absorb(&mut self, other: Cluster) {
        self.fingerprints.extend(other.fingerprints);
        self.account_ids.extend(other.account_ids);
        self.ips.extend(other.ips);
    }

    /// True when every attribute of `other` is also in `self`.
    pub fn is_superset_of(&self, other: &Cluster) -> bool {
        self.fingerprints.is_superset(&other.fingerprints)
            && self.account_ids.is_superset(&other.account_ids)
            && self.ips.is_superset(&other.ips)
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty() && self.account_ids.is_empty() && self.ips.is_empty()
    }

    pub fn attribute_count(&self) -> usize {
        self.fingerprints.len() + self.account_ids.len() + self.ips.len()
    }
}

/// Wire shape of a cluster on the operator read API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub fingerprints: Vec<String>,
    pub ids: Vec<String>,
    pub ips: Vec<String>,
}

impl From<Cluster> for ClusterRecord {
    fn from(cluster: Cluster) -> Self {
        Self {
            fingerprints: cluster.fingerprints.into_iter().collect(),
            ids: cluster.account_ids.into_iter().collect(),
            ips: cluster.ips.into_iter().collect(),
        }
    }
}

/// Row and index counts reported by a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub clusters: usize,
    pub fingerprints: usize,
    pub account_ids: usize,
    pub ips: usize,
}
