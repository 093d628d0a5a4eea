// Mainline DHT (BEP 5): a bucket-based routing table keyed by XOR
// distance from the local node, and an actor that drives ping/find_node/
// get_peers/announce_peer queries over a single UDP socket.
use std::net::{Ipv4Addr, SocketAddr};
use serde::{de, Deserializer, Serializer};
use serde_bytes::ByteBuf;

mod message;
mod node;
mod routing_table;

pub use message::{Envelope, QueryArgs, ResponseValues};
pub use node::{DhtHandle, DhtNode};
pub use routing_table::{BucketStatus, NodeEntry, RoutingTable, K};

pub type Result<T> = std::result::Result<T, DhtError>;

#[derive(Debug, thiserror::Error)]
pub enum DhtError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] bencode::Error),

    #[error("request timed out")]
    Timeout,

    #[error("malformed compact node/peer entry")]
    MalformedCompact,

    #[error("channel error: {0}")]
    Channel(String),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for DhtError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        DhtError::Channel(e.to_string())
    }
}

// A 160-bit node/info-hash identifier, transmitted as a raw 20-byte
// bencoded string rather than serde's default fixed-array-as-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    pub fn random() -> Self {
        let mut id = [0u8; 20];
        rand::Rng::fill(&mut rand::thread_rng(), &mut id);
        NodeId(id)
    }

    pub fn from_info_hash(info_hash: [u8; 20]) -> Self {
        NodeId(info_hash)
    }

    // XOR distance, itself a valid 160-bit quantity orderable like a node ID.
    pub fn distance(&self, other: &NodeId) -> NodeId {
        let mut out = [0u8; 20];
        for i in 0..20 {
            out[i] = self.0[i] ^ other.0[i];
        }
        NodeId(out)
    }

    // Number of leading zero bits in the distance to `other`; used as the
    // routing table's bucket index.
    pub fn shared_prefix_len(&self, other: &NodeId) -> u32 {
        let distance = self.distance(other);
        for (i, byte) in distance.0.iter().enumerate() {
            if *byte != 0 {
                return (i as u32) * 8 + byte.leading_zeros();
            }
        }
        160
    }
}

impl serde::Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serde_bytes::Bytes::new(&self.0).serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let buf = ByteBuf::deserialize(deserializer)?;
        let arr: [u8; 20] = buf
            .into_vec()
            .try_into()
            .map_err(|_| de::Error::custom("expected a 20-byte node id"))?;
        Ok(NodeId(arr))
    }
}

// Parses a BEP 5 compact node-info blob (26 bytes/entry: id[20] + ipv4[4] + port[2]).
pub fn parse_compact_nodes(buf: &[u8]) -> Result<Vec<(NodeId, SocketAddr)>> {
    if buf.len() % 26 != 0 {
        return Err(DhtError::MalformedCompact);
    }
    Ok(buf
        .chunks_exact(26)
        .map(|entry| {
            let mut id = [0u8; 20];
            id.copy_from_slice(&entry[..20]);
            let ip = Ipv4Addr::new(entry[20], entry[21], entry[22], entry[23]);
            let port = u16::from_be_bytes([entry[24], entry[25]]);
            (NodeId(id), SocketAddr::new(ip.into(), port))
        })
        .collect())
}

pub fn encode_compact_nodes(nodes: &[(NodeId, SocketAddr)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(nodes.len() * 26);
    for (id, addr) in nodes {
        buf.extend_from_slice(&id.0);
        if let SocketAddr::V4(v4) = addr {
            buf.extend_from_slice(&v4.ip().octets());
            buf.extend_from_slice(&v4.port().to_be_bytes());
        }
    }
    buf
}

// Parses BEP 5 compact peer-info blobs (6 bytes/entry: ipv4[4] + port[2]).
pub fn parse_compact_peers(values: &[ByteBuf]) -> Result<Vec<SocketAddr>> {
    let mut peers = Vec::with_capacity(values.len());
    for entry in values {
        if entry.len() != 6 {
            return Err(DhtError::MalformedCompact);
        }
        let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
        let port = u16::from_be_bytes([entry[4], entry[5]]);
        peers.push(SocketAddr::new(ip.into(), port));
    }
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_of_identical_ids_is_zero() {
        let id = NodeId::random();
        assert_eq!(id.distance(&id), NodeId([0u8; 20]));
    }

    #[test]
    fn shared_prefix_len_is_160_for_identical_ids() {
        let id = NodeId::random();
        assert_eq!(id.shared_prefix_len(&id), 160);
    }

    #[test]
    fn shared_prefix_len_detects_differing_leading_bit() {
        let a = NodeId([0u8; 20]);
        let mut b = [0u8; 20];
        b[0] = 0x80;
        assert_eq!(a.shared_prefix_len(&NodeId(b)), 0);
    }

    #[test]
    fn compact_nodes_roundtrip() {
        let nodes = vec![
            (NodeId::random(), SocketAddr::new(Ipv4Addr::new(1, 2, 3, 4).into(), 6881)),
            (NodeId::random(), SocketAddr::new(Ipv4Addr::new(5, 6, 7, 8).into(), 51413)),
        ];
        let encoded = encode_compact_nodes(&nodes);
        let decoded = parse_compact_nodes(&encoded).unwrap();
        assert_eq!(decoded, nodes);
    }

    #[test]
    fn compact_peers_rejects_malformed_entry() {
        let bad = vec![ByteBuf::from(vec![1, 2, 3])];
        assert!(parse_compact_peers(&bad).is_err());
    }
}
