//! The DHT routing table: a binary-split bucket tree over the 160 bit id
//! space.
//!
//! Each bucket covers a half-open range of ids described by a prefix and
//! holds at most `K` nodes; only the bucket containing our own id may split.
//! Buckets tile the id space without overlap at all times.

use std::{fmt, net::SocketAddr};

use rand::Rng;

/// The number of nodes a bucket holds, and the `k` of `find_closest`.
pub(crate) const K: usize = 8;

pub(crate) const NODE_ID_LEN: usize = 20;
const NODE_ID_BITS: usize = NODE_ID_LEN * 8;

/// A node fails this many queries in a row before it is considered bad and
/// becomes evictable.
const MAX_NODE_FAILS: u8 = 2;

/// A 160 bit DHT node id. Also used for info hashes when measuring
/// distances to a torrent.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct NodeId(pub [u8; NODE_ID_LEN]);

impl NodeId {
    pub fn random() -> Self {
        let mut id = [0; NODE_ID_LEN];
        rand::thread_rng().fill(&mut id[..]);
        Self(id)
    }

    /// The XOR metric of BEP-5.
    pub fn distance(&self, other: &NodeId) -> NodeId {
        let mut distance = [0; NODE_ID_LEN];
        for (i, d) in distance.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        NodeId(distance)
    }

    /// Returns the bit at the index, counting from the most significant.
    fn bit(&self, index: usize) -> bool {
        debug_assert!(index < NODE_ID_BITS);
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// True if the top `depth` bits of the two ids are equal.
    fn shares_prefix(&self, other: &NodeId, depth: usize) -> bool {
        let full_bytes = depth / 8;
        if self.0[..full_bytes] != other.0[..full_bytes] {
            return false;
        }
        let rest = depth % 8;
        if rest == 0 {
            return true;
        }
        let mask = 0xffu8 << (8 - rest);
        self.0[full_bytes] & mask == other.0[full_bytes] & mask
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum NodeState {
    /// Responded to our last query.
    Good,
    /// Timed out once; next on the list for a liveness check.
    Questionable,
    /// Repeatedly failed to answer; evictable.
    Bad,
}

/// A remote DHT node.
#[derive(Clone, Debug)]
pub(crate) struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    fails: u8,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr, fails: 0 }
    }

    pub fn state(&self) -> NodeState {
        if self.fails == 0 {
            NodeState::Good
        } else if self.fails < MAX_NODE_FAILS {
            NodeState::Questionable
        } else {
            NodeState::Bad
        }
    }

    pub fn mark_good(&mut self) {
        self.fails = 0;
    }

    pub fn mark_fail(&mut self) {
        self.fails = self.fails.saturating_add(1);
    }
}

/// A bucket covering the ids that share the top `depth` bits of `prefix`.
#[derive(Debug)]
struct Bucket {
    prefix: NodeId,
    depth: usize,
    nodes: Vec<Node>,
}

impl Bucket {
    fn contains(&self, id: &NodeId) -> bool {
        id.shares_prefix(&self.prefix, self.depth)
    }

    fn is_full(&self) -> bool {
        self.nodes.len() >= K
    }

    /// A bucket can split while its id range is still larger than its
    /// capacity.
    fn can_split(&self) -> bool {
        self.depth < NODE_ID_BITS - 3
    }

    /// Splits into the two half-range children, partitioning the nodes by
    /// the next prefix bit.
    fn split(self) -> (Bucket, Bucket) {
        let zero_prefix = {
            let mut prefix = self.prefix;
            prefix.0[self.depth / 8] &= !(0x80 >> (self.depth % 8));
            prefix
        };
        let one_prefix = {
            let mut prefix = self.prefix;
            prefix.0[self.depth / 8] |= 0x80 >> (self.depth % 8);
            prefix
        };
        let mut zero = Bucket {
            prefix: zero_prefix,
            depth: self.depth + 1,
            nodes: Vec::new(),
        };
        let mut one = Bucket {
            prefix: one_prefix,
            depth: self.depth + 1,
            nodes: Vec::new(),
        };
        for node in self.nodes {
            if node.id.bit(zero.depth - 1) {
                one.nodes.push(node);
            } else {
                zero.nodes.push(node);
            }
        }
        (zero, one)
    }
}

#[derive(Debug)]
pub(crate) struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            // the root bucket covers the whole id space
            buckets: vec![Bucket {
                prefix: NodeId([0; NODE_ID_LEN]),
                depth: 0,
                nodes: Vec::new(),
            }],
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.bucket_of(id).nodes.iter().any(|n| n.id == *id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.buckets.iter().flat_map(|b| b.nodes.iter())
    }

    fn bucket_of(&self, id: &NodeId) -> &Bucket {
        self.buckets
            .iter()
            .find(|b| b.contains(id))
            .expect("buckets tile the id space")
    }

    fn bucket_of_mut(&mut self, id: &NodeId) -> &mut Bucket {
        self.buckets
            .iter_mut()
            .find(|b| b.contains(id))
            .expect("buckets tile the id space")
    }

    /// Records a node that just responded to us. An existing entry is
    /// refreshed; otherwise insertion walks to the node's bucket, splitting
    /// the bucket containing our own id as needed, and falls back to
    /// evicting a bad node. Returns false if the node was dropped because
    /// its bucket is full of good nodes.
    pub fn touch(&mut self, id: NodeId, addr: SocketAddr) -> bool {
        if id == self.local_id {
            return false;
        }

        loop {
            let local_id = self.local_id;
            let index = self
                .buckets
                .iter()
                .position(|b| b.contains(&id))
                .expect("buckets tile the id space");
            let bucket = &mut self.buckets[index];

            if let Some(node) =
                bucket.nodes.iter_mut().find(|n| n.id == id)
            {
                node.addr = addr;
                node.mark_good();
                return true;
            }

            if !bucket.is_full() {
                let mut node = Node::new(id, addr);
                node.mark_good();
                bucket.nodes.push(node);
                return true;
            }

            // full: split if this is our own bucket and it can still halve
            if bucket.contains(&local_id) && bucket.can_split() {
                let bucket = self.buckets.swap_remove(index);
                let (zero, one) = bucket.split();
                self.buckets.push(zero);
                self.buckets.push(one);
                continue;
            }

            // otherwise make room by evicting a bad node
            if let Some(bad) = bucket
                .nodes
                .iter()
                .position(|n| n.state() == NodeState::Bad)
            {
                bucket.nodes.swap_remove(bad);
                let mut node = Node::new(id, addr);
                node.mark_good();
                bucket.nodes.push(node);
                return true;
            }

            return false;
        }
    }

    pub fn mark_good(&mut self, id: &NodeId) {
        if let Some(node) = self
            .bucket_of_mut(id)
            .nodes
            .iter_mut()
            .find(|n| n.id == *id)
        {
            node.mark_good();
        }
    }

    pub fn mark_fail(&mut self, id: &NodeId) {
        if let Some(node) = self
            .bucket_of_mut(id)
            .nodes
            .iter_mut()
            .find(|n| n.id == *id)
        {
            node.mark_fail();
        }
    }

    /// Returns the `k` nodes of the table closest to the target by the XOR
    /// metric, bad nodes excluded.
    pub fn find_closest(&self, target: &NodeId, k: usize) -> Vec<&Node> {
        let mut nodes: Vec<&Node> = self
            .nodes()
            .filter(|n| n.state() != NodeState::Bad)
            .collect();
        nodes.sort_by_key(|n| n.id.distance(target));
        nodes.truncate(k);
        nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(i: u16) -> SocketAddr {
        format!("10.0.{}.{}:6881", i / 256, i % 256).parse().unwrap()
    }

    fn id_with_top_byte(byte: u8, rest: u8) -> NodeId {
        let mut id = [rest; NODE_ID_LEN];
        id[0] = byte;
        NodeId(id)
    }

    #[test]
    fn test_distance_is_xor() {
        let a = NodeId([0b1100_0000; 20]);
        let b = NodeId([0b1010_0000; 20]);
        assert_eq!(a.distance(&b), NodeId([0b0110_0000; 20]));
        assert_eq!(a.distance(&a), NodeId([0; 20]));
    }

    #[test]
    fn test_buckets_tile_id_space() {
        let local = NodeId([0; NODE_ID_LEN]);
        let mut table = RoutingTable::new(local);

        // enough inserts to force several splits along the local prefix
        let mut rng_state = 1u64;
        for i in 0..500u16 {
            rng_state = rng_state.wrapping_mul(6364136223846793005).wrapping_add(1);
            let mut id = [0u8; NODE_ID_LEN];
            for (j, byte) in id.iter_mut().enumerate() {
                *byte = ((rng_state >> ((j % 8) * 8)) ^ i as u64) as u8;
            }
            table.touch(NodeId(id), addr(i));
        }

        // every bucket's nodes lie in its declared range
        for bucket in table.buckets.iter() {
            for node in bucket.nodes.iter() {
                assert!(bucket.contains(&node.id));
            }
        }

        // every probe id falls into exactly one bucket
        for i in 0..=255u8 {
            for j in [0u8, 1, 127, 128, 255].iter() {
                let probe = id_with_top_byte(i, *j);
                let containing = table
                    .buckets
                    .iter()
                    .filter(|b| b.contains(&probe))
                    .count();
                assert_eq!(containing, 1, "probe {:?}", probe);
            }
        }
    }

    #[test]
    fn test_only_local_bucket_splits() {
        // our id starts with a zero bit: ids with the top bit set all land
        // in the "1" half which can never split
        let local = NodeId([0; NODE_ID_LEN]);
        let mut table = RoutingTable::new(local);

        for i in 0..100u16 {
            let mut id = [0u8; NODE_ID_LEN];
            id[0] = 0x80;
            id[18] = (i / 256) as u8;
            id[19] = (i % 256) as u8;
            table.touch(NodeId(id), addr(i));
        }

        // at most K of those made it in: the far bucket filled up and never
        // split
        let far_nodes = table
            .nodes()
            .filter(|n| n.id.0[0] & 0x80 != 0)
            .count();
        assert_eq!(far_nodes, K);
    }

    #[test]
    fn test_find_closest_is_exact() {
        let local = id_with_top_byte(0, 0);
        let mut table = RoutingTable::new(local);
        let mut all = Vec::new();
        for i in 1..=100u16 {
            let mut id = [0u8; NODE_ID_LEN];
            id[0] = (i % 251) as u8;
            id[10] = (i * 7 % 256) as u8;
            id[19] = (i % 256) as u8;
            let id = NodeId(id);
            if table.touch(id, addr(i)) {
                all.push(id);
            }
        }

        let target = id_with_top_byte(42, 0xaa);
        let closest = table.find_closest(&target, K);
        assert_eq!(closest.len(), K.min(all.len()));

        // brute force reference: the k smallest XOR distances among all
        // nodes that the table kept
        let mut reference: Vec<NodeId> = all.clone();
        reference.sort_by_key(|id| id.distance(&target));
        let reference: Vec<NodeId> =
            reference.into_iter().take(K).collect();
        let closest_ids: Vec<NodeId> =
            closest.iter().map(|n| n.id).collect();
        assert_eq!(closest_ids, reference);
    }

    #[test]
    fn test_eviction_prefers_bad_nodes() {
        // fill the far half-bucket, then fail one node until it is bad
        let local = NodeId([0; NODE_ID_LEN]);
        let mut table = RoutingTable::new(local);
        let mut far_ids = Vec::new();
        for i in 0..K as u16 {
            let mut id = [0xffu8; NODE_ID_LEN];
            id[19] = i as u8;
            far_ids.push(NodeId(id));
            assert!(table.touch(NodeId(id), addr(i)));
        }

        // bucket is full of good nodes: a new far node is dropped
        let mut extra = [0xffu8; NODE_ID_LEN];
        extra[19] = 0xee;
        let extra = NodeId(extra);
        // the "1" prefix bucket cannot split (it doesn't contain local)
        // once the tree has split at the root; force a split by adding
        // a near node first
        let mut near = [0u8; NODE_ID_LEN];
        near[19] = 1;
        table.touch(NodeId(near), addr(999));

        assert!(!table.touch(extra, addr(1000)));

        table.mark_fail(&far_ids[0]);
        assert_eq!(
            table.bucket_of(&far_ids[0]).nodes[0].state(),
            NodeState::Questionable
        );
        table.mark_fail(&far_ids[0]);

        // now there's a bad node to evict
        assert!(table.touch(extra, addr(1000)));
        assert!(table.contains(&extra));
        assert!(!table.contains(&far_ids[0]));
    }

    #[test]
    fn test_own_id_is_never_inserted() {
        let local = NodeId([7; NODE_ID_LEN]);
        let mut table = RoutingTable::new(local);
        assert!(!table.touch(local, addr(1)));
        assert_eq!(table.node_count(), 0);
    }
}
