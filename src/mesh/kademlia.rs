//! Kademlia-style lookups for peer location
//!
//! Application messages never route through here; the mesh relay carries
//! them. The DHT exists so the discovery collaborator can translate a peer
//! id into reachable endpoints: 160-bit node ids (SHA-256 of the public key
//! truncated), XOR metric, k-buckets with a replacement cache, and
//! iterative FIND_NODE with bounded parallelism.

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;

use crate::config::DhtConfig;
use crate::crypto;
use crate::error::Result;
use crate::protocol::PeerId;
use crate::utils::with_deadline;

/// Node id length in bytes (160 bits)
pub const NODE_ID_LEN: usize = 20;

/// Bits in the id space; one k-bucket per bit
pub const BITS: usize = NODE_ID_LEN * 8;

/// Contact failures after which a node is considered dead
const MAX_FAILURES: u32 = 3;

/// 160-bit DHT node id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

impl NodeId {
    /// Derive a node id from an identity public key: SHA-256 truncated to
    /// 160 bits
    pub fn from_public_key(public_key: &PeerId) -> Self {
        let digest = crypto::sha256(public_key);
        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(&digest[..NODE_ID_LEN]);
        Self(id)
    }
}

/// XOR distance between two node ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance([u8; NODE_ID_LEN]);

impl Distance {
    pub fn between(a: &NodeId, b: &NodeId) -> Self {
        let mut distance = [0u8; NODE_ID_LEN];
        for i in 0..NODE_ID_LEN {
            distance[i] = a.0[i] ^ b.0[i];
        }
        Distance(distance)
    }

    /// Leading zero bits of the distance
    pub fn leading_zeros(&self) -> u32 {
        let mut zeros = 0u32;
        for byte in &self.0 {
            if *byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros();
                break;
            }
        }
        zeros
    }

    /// Bucket index for this distance; identical ids map to bucket 0
    pub fn bucket_index(&self) -> usize {
        let lz = self.leading_zeros();
        if lz as usize >= BITS {
            0
        } else {
            BITS - 1 - lz as usize
        }
    }
}

/// A reachable node: DHT id, identity key, and transport endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub public_key: PeerId,
    /// Endpoint in peer-URI form, e.g. `sc://<pubkey-hex>@host:port`
    pub endpoint: String,
    pub last_seen: u64,
    pub failures: u32,
}

impl NodeInfo {
    pub fn new(public_key: PeerId, endpoint: String, now_ms: u64) -> Self {
        Self {
            id: NodeId::from_public_key(&public_key),
            public_key,
            endpoint,
            last_seen: now_ms,
            failures: 0,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.failures < MAX_FAILURES
    }

    pub fn record_success(&mut self, now_ms: u64) {
        self.last_seen = now_ms;
        self.failures = 0;
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
    }
}

/// K-bucket holding up to k nodes at one distance range, most recently
/// seen at the back, with a replacement cache for overflow
#[derive(Debug, Clone)]
pub struct KBucket {
    nodes: Vec<NodeInfo>,
    capacity: usize,
    replacement_cache: VecDeque<NodeInfo>,
}

impl KBucket {
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            capacity,
            replacement_cache: VecDeque::with_capacity(capacity),
        }
    }

    /// Add or refresh a node; returns false if it went to the cache
    pub fn add_node(&mut self, node: NodeInfo) -> bool {
        if let Some(idx) = self.nodes.iter().position(|n| n.id == node.id) {
            self.nodes.remove(idx);
            self.nodes.push(node);
            return true;
        }

        if self.nodes.len() < self.capacity {
            self.nodes.push(node);
            return true;
        }

        // Evict the least recently seen node if it looks dead
        if let Some(first) = self.nodes.first() {
            if !first.is_alive() {
                self.nodes.remove(0);
                self.nodes.push(node);
                return true;
            }
        }

        if !self.replacement_cache.iter().any(|n| n.id == node.id) {
            self.replacement_cache.push_back(node);
            if self.replacement_cache.len() > self.capacity {
                self.replacement_cache.pop_front();
            }
        }
        false
    }

    pub fn remove_node(&mut self, id: &NodeId) {
        self.nodes.retain(|n| n.id != *id);
        while self.nodes.len() < self.capacity {
            match self.replacement_cache.pop_front() {
                Some(candidate) if candidate.is_alive() => self.nodes.push(candidate),
                Some(_) => continue,
                None => break,
            }
        }
    }

    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }
}

/// The local view of the DHT: one k-bucket per distance bit
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<KBucket>,
    k: usize,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, k: usize) -> Self {
        let mut buckets = Vec::with_capacity(BITS);
        for _ in 0..BITS {
            buckets.push(KBucket::new(k));
        }
        Self {
            local_id,
            buckets,
            k,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn add_node(&mut self, node: NodeInfo) {
        if node.id == self.local_id {
            return;
        }
        let idx = Distance::between(&self.local_id, &node.id).bucket_index();
        self.buckets[idx].add_node(node);
    }

    pub fn remove_node(&mut self, id: &NodeId) {
        let idx = Distance::between(&self.local_id, id).bucket_index();
        self.buckets[idx].remove_node(id);
    }

    /// The k (or `count`) closest live nodes to a target
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<NodeInfo> {
        let mut all: Vec<(Distance, NodeInfo)> = self
            .buckets
            .iter()
            .flat_map(|bucket| bucket.nodes().iter())
            .filter(|node| node.is_alive())
            .map(|node| (Distance::between(&node.id, target), node.clone()))
            .collect();
        all.sort_by_key(|(distance, _)| *distance);
        all.truncate(count);
        all.into_iter().map(|(_, node)| node).collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.nodes().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transport-side of a FIND_NODE query, supplied by the discovery
/// collaborator
#[async_trait]
pub trait FindNodeClient: Send + Sync {
    async fn find_node(&self, via: &NodeInfo, target: &NodeId) -> Result<Vec<NodeInfo>>;
}

/// Iterative FIND_NODE: query α nodes in parallel per iteration, walking
/// toward the target until the k closest known nodes have all answered
pub async fn iterative_find_node(
    table: &parking_lot::RwLock<RoutingTable>,
    target: NodeId,
    client: &dyn FindNodeClient,
    config: &DhtConfig,
) -> Vec<NodeInfo> {
    let mut queried: HashSet<NodeId> = HashSet::new();
    let mut shortlist = table.read().closest(&target, config.k);

    loop {
        let batch: Vec<NodeInfo> = shortlist
            .iter()
            .filter(|node| !queried.contains(&node.id))
            .take(config.alpha)
            .cloned()
            .collect();
        if batch.is_empty() {
            break;
        }

        let queries = batch.iter().map(|node| {
            let target = target;
            async move {
                with_deadline(
                    "dht find_node",
                    config.iteration_deadline,
                    client.find_node(node, &target),
                )
                .await
            }
        });
        let results = futures::future::join_all(queries).await;

        for (node, result) in batch.iter().zip(results) {
            queried.insert(node.id);
            match result {
                Ok(found) => {
                    let mut table = table.write();
                    for candidate in found {
                        table.add_node(candidate.clone());
                        if candidate.id != table.local_id()
                            && !shortlist.iter().any(|n| n.id == candidate.id)
                        {
                            shortlist.push(candidate);
                        }
                    }
                }
                Err(_) => {
                    table.write().remove_node(&node.id);
                }
            }
        }

        shortlist.sort_by_key(|node| Distance::between(&node.id, &target));
        shortlist.truncate(config.k);

        // Converged once every shortlist member has been queried
        if shortlist.iter().all(|node| queried.contains(&node.id)) {
            break;
        }
    }

    shortlist
}

/// Join the DHT through seed contacts: insert them, then walk toward our
/// own id so the nearby neighborhood fills in. Returns how many nodes the
/// table holds afterwards.
pub async fn bootstrap(
    table: &parking_lot::RwLock<RoutingTable>,
    seeds: Vec<NodeInfo>,
    client: &dyn FindNodeClient,
    config: &DhtConfig,
) -> crate::error::Result<usize> {
    with_deadline("dht bootstrap", config.bootstrap_deadline, async {
        {
            let mut table = table.write();
            for seed in seeds {
                table.add_node(seed);
            }
        }
        let local = table.read().local_id();
        let _ = iterative_find_node(table, local, client, config).await;
        Ok(table.read().len())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;
    use std::collections::HashMap;

    fn node(tag: u8) -> NodeInfo {
        NodeInfo::new([tag; 32], format!("sc://{:02x}@host:9000", tag), 0)
    }

    #[test]
    fn test_distance_properties() {
        let a = NodeId::from_public_key(&[1u8; 32]);
        let b = NodeId::from_public_key(&[2u8; 32]);

        assert_eq!(Distance::between(&a, &a), Distance([0u8; NODE_ID_LEN]));
        assert_eq!(Distance::between(&a, &b), Distance::between(&b, &a));
        assert!(Distance::between(&a, &b) > Distance::between(&a, &a));
    }

    #[test]
    fn test_bucket_index_bounds() {
        let zero = Distance([0u8; NODE_ID_LEN]);
        assert_eq!(zero.bucket_index(), 0);

        let mut max = [0u8; NODE_ID_LEN];
        max[0] = 0x80;
        assert_eq!(Distance(max).bucket_index(), BITS - 1);
    }

    #[test]
    fn test_kbucket_eviction_to_cache() {
        let mut bucket = KBucket::new(2);
        assert!(bucket.add_node(node(1)));
        assert!(bucket.add_node(node(2)));
        // Full of live nodes: the newcomer goes to the replacement cache
        assert!(!bucket.add_node(node(3)));
        assert_eq!(bucket.nodes().len(), 2);

        // Removing one promotes from the cache
        let gone = NodeId::from_public_key(&[1u8; 32]);
        bucket.remove_node(&gone);
        assert_eq!(bucket.nodes().len(), 2);
        assert!(bucket.nodes().iter().any(|n| n.public_key == [3u8; 32]));
    }

    #[test]
    fn test_closest_ordering() {
        let local = NodeId::from_public_key(&[0u8; 32]);
        let mut table = RoutingTable::new(local, 20);
        for tag in 1..=30u8 {
            table.add_node(node(tag));
        }

        let target = NodeId::from_public_key(&[17u8; 32]);
        let closest = table.closest(&target, 5);
        assert_eq!(closest.len(), 5);
        assert_eq!(closest[0].public_key, [17u8; 32]);

        for window in closest.windows(2) {
            assert!(
                Distance::between(&window[0].id, &target)
                    <= Distance::between(&window[1].id, &target)
            );
        }
    }

    /// A fully connected mock network: every node answers FIND_NODE with
    /// its k closest global neighbors.
    struct MockNetwork {
        nodes: HashMap<NodeId, NodeInfo>,
    }

    #[async_trait]
    impl FindNodeClient for MockNetwork {
        async fn find_node(&self, _via: &NodeInfo, target: &NodeId) -> Result<Vec<NodeInfo>> {
            let mut all: Vec<NodeInfo> = self.nodes.values().cloned().collect();
            all.sort_by_key(|n| Distance::between(&n.id, target));
            all.truncate(20);
            Ok(all)
        }
    }

    #[tokio::test]
    async fn test_iterative_lookup_converges() {
        let config = DhtConfig::default();
        let local = NodeId::from_public_key(&[0u8; 32]);
        let table = RwLock::new(RoutingTable::new(local, config.k));

        let network = MockNetwork {
            nodes: (1..=100u8)
                .map(|tag| {
                    let info = node(tag);
                    (info.id, info)
                })
                .collect(),
        };

        // Seed the table with a few bootstrap contacts
        {
            let mut t = table.write();
            for tag in 1..=3u8 {
                t.add_node(node(tag));
            }
        }

        let target = NodeId::from_public_key(&[77u8; 32]);
        let found = iterative_find_node(&table, target, &network, &config).await;

        assert_eq!(found.len(), config.k);
        // The globally closest node to the target is the target itself
        assert_eq!(found[0].public_key, [77u8; 32]);
    }

    #[tokio::test]
    async fn test_bootstrap_fills_neighborhood() {
        let config = DhtConfig::default();
        let local = NodeId::from_public_key(&[0u8; 32]);
        let table = RwLock::new(RoutingTable::new(local, config.k));

        let network = MockNetwork {
            nodes: (1..=50u8)
                .map(|tag| {
                    let info = node(tag);
                    (info.id, info)
                })
                .collect(),
        };

        let discovered = bootstrap(&table, vec![node(1)], &network, &config)
            .await
            .unwrap();
        assert!(discovered >= config.k);
    }
}
