//! Load-balancing policies
//!
//! A policy does not pick one server; it orders the whole candidate list by
//! preference. The router tries the first entry and walks down the list on
//! failover, so every policy also defines its failover order.
//!
//! Consistent hashing maps `SHA-256(routing key)` (first eight bytes, big
//! endian) onto a ring of `virtual_nodes × weight` points per server, each
//! point hashed from `"<server id>#<n>"`. A ring that would exceed
//! [`MAX_RING_POINTS`] is scaled down proportionally, keeping at least one
//! point per server. Rings are cached per capability and
//! rebuilt only when the candidate set changes.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use switchyard_core_resilience::ShardedMap;

use crate::error::GatewayError;
use crate::registry::{Registry, ServerRecord};

/// Upper bound on points in one consistent-hash ring
pub const MAX_RING_POINTS: u64 = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancePolicy {
    /// Rotate a per-capability cursor over the candidates
    #[default]
    RoundRobin,
    /// Random, proportional to each server's weight
    Weighted,
    /// Fewest leased pool connections first
    LeastConnections,
    Random,
    /// Same routing key, same server while membership is stable
    ConsistentHash,
}

impl BalancePolicy {
    pub const ALL: [BalancePolicy; 5] = [
        BalancePolicy::RoundRobin,
        BalancePolicy::Weighted,
        BalancePolicy::LeastConnections,
        BalancePolicy::Random,
        BalancePolicy::ConsistentHash,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BalancePolicy::RoundRobin => "round_robin",
            BalancePolicy::Weighted => "weighted",
            BalancePolicy::LeastConnections => "least_connections",
            BalancePolicy::Random => "random",
            BalancePolicy::ConsistentHash => "consistent_hash",
        }
    }

    fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(value: u8) -> Self {
        Self::ALL
            .get(usize::from(value))
            .copied()
            .unwrap_or_default()
    }
}

impl fmt::Display for BalancePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BalancePolicy {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| GatewayError::Config(format!("unknown balancing policy '{s}'")))
    }
}

/// First eight bytes of SHA-256, big endian
pub fn hash_key(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

#[derive(Debug)]
struct HashRing {
    /// (id, weight) sorted by id; identifies the candidate set
    members: Vec<(String, u32)>,
    /// (point, index into members) sorted by point
    points: Vec<(u64, usize)>,
}

impl HashRing {
    fn build(members: Vec<(String, u32)>, virtual_nodes: u32) -> Self {
        let wanted: Vec<u64> = members
            .iter()
            .map(|(_, weight)| u64::from(virtual_nodes) * u64::from(*weight))
            .collect();
        let total: u64 = wanted.iter().sum();

        let mut points = Vec::new();
        for (idx, (id, _)) in members.iter().enumerate() {
            let count = if total > MAX_RING_POINTS {
                let scaled = u128::from(wanted[idx]) * u128::from(MAX_RING_POINTS) / u128::from(total);
                u64::try_from(scaled).unwrap_or(MAX_RING_POINTS).max(1)
            } else {
                wanted[idx]
            };
            for n in 0..count {
                points.push((hash_key(&format!("{id}#{n}")), idx));
            }
        }
        points.sort_unstable();
        Self { members, points }
    }

    /// Member indexes in ring order, starting at the owner of `hash`
    fn walk(&self, hash: u64) -> Vec<usize> {
        let start = self.points.partition_point(|(p, _)| *p < hash);
        let mut seen = vec![false; self.members.len()];
        let mut order = Vec::with_capacity(self.members.len());
        for i in 0..self.points.len() {
            let (_, idx) = self.points[(start + i) % self.points.len()];
            if !seen[idx] {
                seen[idx] = true;
                order.push(idx);
                if order.len() == self.members.len() {
                    break;
                }
            }
        }
        order
    }
}

/// Per-capability balancing state shared by all dispatches
pub struct Balancer {
    policy: AtomicU8,
    virtual_nodes: u32,
    cursors: ShardedMap<Arc<AtomicUsize>>,
    rings: ShardedMap<Arc<HashRing>>,
    rng: Mutex<StdRng>,
}

impl Balancer {
    pub fn new(policy: BalancePolicy, virtual_nodes: u32) -> Self {
        Self::with_rng(policy, virtual_nodes, StdRng::from_os_rng())
    }

    /// Deterministic randomness for tests
    pub fn with_seed(policy: BalancePolicy, virtual_nodes: u32, seed: u64) -> Self {
        Self::with_rng(policy, virtual_nodes, StdRng::seed_from_u64(seed))
    }

    fn with_rng(policy: BalancePolicy, virtual_nodes: u32, rng: StdRng) -> Self {
        Self {
            policy: AtomicU8::new(policy.to_u8()),
            virtual_nodes: virtual_nodes.max(1),
            cursors: ShardedMap::new(),
            rings: ShardedMap::new(),
            rng: Mutex::new(rng),
        }
    }

    pub fn policy(&self) -> BalancePolicy {
        BalancePolicy::from_u8(self.policy.load(Ordering::Relaxed))
    }

    /// Switch policy for subsequent dispatches
    pub fn set_policy(&self, policy: BalancePolicy) {
        self.policy.store(policy.to_u8(), Ordering::Relaxed);
    }

    /// Order `candidates` by preference under the current policy
    ///
    /// `in_flight` reports leased connections per server id for
    /// least-connections. Candidates are expected sorted by id.
    pub fn order(
        &self,
        capability: &str,
        routing_key: &str,
        candidates: Vec<ServerRecord>,
        in_flight: impl Fn(&str) -> usize,
    ) -> Vec<ServerRecord> {
        if candidates.len() <= 1 {
            return candidates;
        }
        match self.policy() {
            BalancePolicy::RoundRobin => self.round_robin(capability, candidates),
            BalancePolicy::Weighted => self.weighted(candidates),
            BalancePolicy::LeastConnections => least_connections(candidates, in_flight),
            BalancePolicy::Random => {
                let mut candidates = candidates;
                let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
                candidates.shuffle(&mut *rng);
                candidates
            }
            BalancePolicy::ConsistentHash => {
                self.consistent_hash(capability, routing_key, candidates)
            }
        }
    }

    fn round_robin(&self, capability: &str, mut candidates: Vec<ServerRecord>) -> Vec<ServerRecord> {
        let cursor = self
            .cursors
            .get_or_insert_with(capability, || Arc::new(AtomicUsize::new(0)));
        let start = cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates.rotate_left(start);
        candidates
    }

    /// Weighted sampling without replacement
    fn weighted(&self, mut candidates: Vec<ServerRecord>) -> Vec<ServerRecord> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ordered = Vec::with_capacity(candidates.len());
        while !candidates.is_empty() {
            let total: u64 = candidates
                .iter()
                .map(|c| u64::from(c.effective_weight()))
                .sum();
            let mut target = rng.random_range(0..total);
            let mut pick = candidates.len() - 1;
            for (i, c) in candidates.iter().enumerate() {
                let w = u64::from(c.effective_weight());
                if target < w {
                    pick = i;
                    break;
                }
                target -= w;
            }
            ordered.push(candidates.remove(pick));
        }
        ordered
    }

    fn consistent_hash(
        &self,
        capability: &str,
        routing_key: &str,
        candidates: Vec<ServerRecord>,
    ) -> Vec<ServerRecord> {
        let mut members: Vec<(String, u32)> = candidates
            .iter()
            .map(|c| (c.id.clone(), c.effective_weight()))
            .collect();
        members.sort();

        let ring = match self.rings.get_cloned(capability) {
            Some(ring) if ring.members == members => ring,
            _ => {
                let ring = Arc::new(HashRing::build(members, self.virtual_nodes));
                self.rings.insert(capability, ring.clone());
                ring
            }
        };

        let mut slots: Vec<Option<ServerRecord>> = vec![None; ring.members.len()];
        for c in candidates {
            if let Ok(idx) = ring.members.binary_search_by(|(id, _)| id.as_str().cmp(&c.id)) {
                slots[idx] = Some(c);
            }
        }
        ring.walk(hash_key(routing_key))
            .into_iter()
            .filter_map(|idx| slots[idx].take())
            .collect()
    }

    /// Drop cached state for a capability nobody serves anymore
    pub fn forget(&self, capability: &str) {
        self.cursors.remove(capability);
        self.rings.remove(capability);
    }

    /// [`forget`](Self::forget) each of `capabilities` no server in `registry` declares
    pub fn forget_unserved<'a>(
        &self,
        registry: &Registry,
        capabilities: impl IntoIterator<Item = &'a String>,
    ) {
        for capability in capabilities {
            if !registry.has_capability(capability) {
                self.forget(capability);
            }
        }
    }

    /// Whether a cursor or ring is cached for `capability`
    pub fn is_tracking(&self, capability: &str) -> bool {
        self.cursors.contains_key(capability) || self.rings.contains_key(capability)
    }
}

/// Fewest in-flight, then lowest average latency, then lowest id
fn least_connections(
    mut candidates: Vec<ServerRecord>,
    in_flight: impl Fn(&str) -> usize,
) -> Vec<ServerRecord> {
    let mut keyed: Vec<(usize, ServerRecord)> = candidates
        .drain(..)
        .map(|c| (in_flight(&c.id), c))
        .collect();
    keyed.sort_by(|(la, a), (lb, b)| {
        la.cmp(lb)
            .then(a.avg_response_time_ms.total_cmp(&b.avg_response_time_ms))
            .then_with(|| a.id.cmp(&b.id))
    });
    keyed.into_iter().map(|(_, c)| c).collect()
}
