// Bucket tree keyed by shared-prefix length with the local node ID,
// following spec.md's K=8 Kademlia routing table rather than a full
// binary trie: one bucket per possible prefix length (0..=160) is simple,
// bounded, and sufficient at the node counts a BitTorrent client's DHT
// actually reaches.
use std::{net::SocketAddr, time::Instant};

use super::NodeId;

pub const K: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketStatus {
    Good,
    Questionable,
    Bad,
}

#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_seen: Instant,
    pub status: BucketStatus,
}

pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Vec<NodeEntry>>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        RoutingTable { local_id, buckets: (0..=160).map(|_| Vec::new()).collect() }
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        self.local_id.shared_prefix_len(id) as usize
    }

    // Inserts or refreshes a node. If its bucket is full, the least
    // recently seen entry is evicted only if it's already `Bad`;
    // otherwise the new node is dropped (Kademlia prefers long-lived nodes).
    pub fn insert(&mut self, id: NodeId, addr: SocketAddr) {
        if id == self.local_id {
            return;
        }
        let idx = self.bucket_index(&id);
        let bucket = &mut self.buckets[idx];

        if let Some(entry) = bucket.iter_mut().find(|e| e.id == id) {
            entry.addr = addr;
            entry.last_seen = Instant::now();
            entry.status = BucketStatus::Good;
            return;
        }

        if bucket.len() < K {
            bucket.push(NodeEntry { id, addr, last_seen: Instant::now(), status: BucketStatus::Good });
            return;
        }

        if let Some(bad_idx) = bucket.iter().position(|e| e.status == BucketStatus::Bad) {
            bucket[bad_idx] = NodeEntry { id, addr, last_seen: Instant::now(), status: BucketStatus::Good };
        }
    }

    pub fn mark_bad(&mut self, id: &NodeId) {
        let idx = self.bucket_index(id);
        if let Some(entry) = self.buckets[idx].iter_mut().find(|e| &e.id == id) {
            entry.status = BucketStatus::Bad;
        }
    }

    // The `count` nodes (across all buckets) closest to `target` by XOR distance.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<NodeEntry> {
        let mut all: Vec<&NodeEntry> = self.buckets.iter().flatten().collect();
        all.sort_by_key(|e| target.distance(&e.id));
        all.into_iter().take(count).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(Ipv4Addr::new(127, 0, 0, 1).into(), port)
    }

    #[test]
    fn insert_and_find_closest() {
        let local = NodeId([0u8; 20]);
        let mut table = RoutingTable::new(local);
        let target = NodeId([1u8; 20]);
        for port in 0..5u16 {
            let mut id = [0u8; 20];
            id[19] = port as u8;
            table.insert(NodeId(id), addr(6881 + port));
        }
        let closest = table.closest(&target, 3);
        assert_eq!(closest.len(), 3);
    }

    #[test]
    fn does_not_insert_self() {
        let local = NodeId([3u8; 20]);
        let mut table = RoutingTable::new(local);
        table.insert(local, addr(6881));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn bucket_caps_at_k_unless_evicting_bad_entries() {
        let local = NodeId([0u8; 20]);
        let mut table = RoutingTable::new(local);
        // All of these share the same prefix length (differ only in the last byte),
        // so they land in the same bucket.
        for i in 0..(K as u8 + 2) {
            let mut id = [0xffu8; 20];
            id[19] = i;
            table.insert(NodeId(id), addr(6881 + i as u16));
        }
        assert_eq!(table.len(), K);
    }
}
