//! # galena-hashspace: consistent-hash partitioning
//!
//! Maps 64-bit key fingerprints to ordered replica lists over the live
//! server nodes. Two instances of [`HashSpace`] coexist on every node:
//! the write view and the read view. They agree except during rebalance,
//! when writes must already reach the new owners while reads are still
//! served by the old ones.
//!
//! The ring is a deterministic function of the [`HsSeed`]: every node
//! that holds the same seed computes identical replica lists, with no
//! coordination. Seeds carry a logical clock so stale views are
//! recognized and rejected during `HashSpaceSync`.

use serde::{Deserialize, Serialize};

use galena_types::{ClockTime, KeyHash, NodeId};

/// Number of ring points each node contributes.
///
/// More points smooth the key distribution at the cost of ring size.
/// This value is baked into the placement function and must match
/// across the cluster.
pub const VIRTUAL_POINTS: u32 = 128;

/// Default replica-list length (coordinator plus two replicators).
pub const DEFAULT_REPLICATION: usize = 3;

/// One cluster member as carried in a seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedNode {
    /// RPC address of the node.
    pub node: NodeId,
    /// Bumped each time the node rejoins, so a restarted node lands on
    /// fresh ring points.
    pub incarnation: u32,
    /// Inactive nodes stay in the seed but contribute no ring points.
    pub active: bool,
}

/// Serializable cluster membership plus the logical clock of the view.
///
/// This is the unit exchanged by `HashSpaceSync` and compared across
/// nodes to decide which view is current.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsSeed {
    pub nodes: Vec<SeedNode>,
    pub clocktime: ClockTime,
}

impl HsSeed {
    /// Builds a seed from a plain address list, all nodes active at
    /// incarnation zero. Used to bootstrap before the first sync.
    pub fn bootstrap(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            nodes: nodes
                .into_iter()
                .map(|node| SeedNode {
                    node,
                    incarnation: 0,
                    active: true,
                })
                .collect(),
            clocktime: ClockTime::ZERO,
        }
    }

    /// Compares an incoming seed against this one by logical clock.
    pub fn compare(&self, incoming: &HsSeed) -> SeedOrder {
        if incoming.clocktime > self.clocktime {
            SeedOrder::Newer
        } else if incoming.clocktime == self.clocktime {
            SeedOrder::Same
        } else {
            SeedOrder::Obsolete
        }
    }
}

/// Result of comparing an incoming seed against the local view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOrder {
    /// Incoming view is strictly newer; adopt it.
    Newer,
    /// Same logical clock; confirm and keep the local view.
    Same,
    /// Incoming view is older than ours; reject as obsolete.
    Obsolete,
}

/// A built ring: sorted 64-bit points, each owned by one seed node.
#[derive(Debug, Clone)]
pub struct HashSpace {
    /// Ring points sorted ascending; the payload indexes into `nodes`.
    ring: Vec<(u64, usize)>,
    nodes: Vec<SeedNode>,
    clocktime: ClockTime,
}

impl HashSpace {
    /// Builds the ring from a seed.
    ///
    /// Only active nodes contribute points. Point values derive from the
    /// node address and incarnation, so every holder of the seed builds
    /// an identical ring.
    pub fn from_seed(seed: &HsSeed) -> Self {
        let mut ring = Vec::new();
        for (idx, member) in seed.nodes.iter().enumerate() {
            if !member.active {
                continue;
            }
            let base = format!("{}/{}", member.node, member.incarnation);
            for vp in 0..VIRTUAL_POINTS {
                let mut buf = base.clone().into_bytes();
                buf.extend_from_slice(&vp.to_be_bytes());
                ring.push((rapidhash::rapidhash(&buf), idx));
            }
        }
        ring.sort_unstable();
        Self {
            ring,
            nodes: seed.nodes.clone(),
            clocktime: seed.clocktime,
        }
    }

    /// The logical clock of the view this ring was built from.
    pub fn clocktime(&self) -> ClockTime {
        self.clocktime
    }

    /// Reconstructs the seed this ring was built from.
    pub fn seed(&self) -> HsSeed {
        HsSeed {
            nodes: self.nodes.clone(),
            clocktime: self.clocktime,
        }
    }

    /// Returns true when no active node contributes ring points.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// All active node identities, in seed order.
    pub fn active_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().filter(|m| m.active).map(|m| m.node)
    }

    /// Walks the ring from `h` and collects up to `count` distinct nodes.
    ///
    /// The first entry is the coordinator for the key; the rest are
    /// replicators in ring order. The list never contains the same node
    /// twice, and is a pure function of (seed, hash).
    pub fn replicators_for(&self, h: KeyHash, count: usize) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = Vec::with_capacity(count);
        if self.ring.is_empty() || count == 0 {
            return out;
        }
        let start = self
            .ring
            .partition_point(|&(point, _)| point < h.as_u64());
        for i in 0..self.ring.len() {
            let (_, idx) = self.ring[(start + i) % self.ring.len()];
            let node = self.nodes[idx].node;
            if !out.contains(&node) {
                out.push(node);
                if out.len() == count {
                    break;
                }
            }
        }
        out
    }

    /// The coordinator (first write replica) for a key, if any node is live.
    pub fn coordinator_for(&self, h: KeyHash) -> Option<NodeId> {
        self.replicators_for(h, 1).first().copied()
    }

    /// True iff `node` coordinates writes for `h` under this view.
    pub fn check_coordinator_assign(&self, h: KeyHash, node: NodeId) -> bool {
        self.coordinator_for(h) == Some(node)
    }

    /// True iff `node` must acknowledge writes for `h` under this view,
    /// with `count` replicas per key.
    pub fn check_replicator_assign(&self, h: KeyHash, node: NodeId, count: usize) -> bool {
        self.test_replicator_assign(h, node, count)
    }

    /// Replica-membership predicate against an arbitrary target.
    ///
    /// Used by the rebalance scan to decide which keys move where.
    pub fn test_replicator_assign(&self, h: KeyHash, target: NodeId, count: usize) -> bool {
        self.replicators_for(h, count).contains(&target)
    }
}
