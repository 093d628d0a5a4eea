// BEP 9 metadata exchange extension, layered on the BEP 10 extension
// protocol. Lets a torrent added from a magnet link recover the info
// dict from any peer that advertises `ut_metadata`.
use std::{collections::HashMap, net::SocketAddr, time::Duration};
use serde_derive::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::{net::TcpStream, time};
use tokio_util::codec::{Framed, FramedParts};
use futures::{SinkExt, StreamExt};
use url::Url;
use crate::{
    metainfo::{MetaInfo, MetaInfoError},
    p2p::{
        handshake::{Handshake, HandshakeCodec},
        message::{Message, MessageCodec},
    },
};

pub const EXTENSION_MSG_ID: u8 = 20;
pub const UT_METADATA_NAME: &str = "ut_metadata";
const METADATA_PIECE_LEN: usize = 16 * 1024;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
pub struct ExtensionHandshake {
    pub m: HashMap<String, u8>,
    #[serde(default)]
    pub metadata_size: Option<u64>,
}

impl ExtensionHandshake {
    pub fn supporting_ut_metadata() -> Self {
        let mut m = HashMap::new();
        m.insert(UT_METADATA_NAME.to_string(), 1);
        Self { m, metadata_size: None }
    }

    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.m.get(UT_METADATA_NAME).copied()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataHeader {
    msg_type: u8,
    piece: u32,
    #[serde(default)]
    total_size: Option<u64>,
}

const MSG_REQUEST: u8 = 0;
const MSG_DATA: u8 = 1;
const MSG_REJECT: u8 = 2;

// Walks one bencoded value from the front of `buf`, returning how many
// bytes it occupies. Used only to find where a metadata header dict
// ends and the raw piece bytes that follow it begin.
fn bencode_value_len(buf: &[u8]) -> Option<usize> {
    match *buf.first()? {
        b'i' => {
            let end = buf.iter().position(|&b| b == b'e')?;
            Some(end + 1)
        }
        b'l' | b'd' => {
            let mut pos = 1;
            loop {
                if *buf.get(pos)? == b'e' {
                    return Some(pos + 1);
                }
                pos += bencode_value_len(&buf[pos..])?;
            }
        }
        b'0'..=b'9' => {
            let colon = buf.iter().position(|&b| b == b':')?;
            let len: usize = std::str::from_utf8(&buf[..colon]).ok()?.parse().ok()?;
            Some(colon + 1 + len)
        }
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct MetadataAssembler {
    total_size: usize,
    num_pieces: usize,
    pieces: Vec<Option<Vec<u8>>>,
}

impl MetadataAssembler {
    pub fn new(total_size: usize) -> Self {
        let num_pieces = (total_size + METADATA_PIECE_LEN - 1) / METADATA_PIECE_LEN;
        Self { total_size, num_pieces, pieces: vec![None; num_pieces] }
    }

    pub fn insert(&mut self, piece: usize, data: Vec<u8>) {
        if piece < self.pieces.len() {
            self.pieces[piece] = Some(data);
        }
    }

    pub fn next_missing(&self) -> Option<usize> {
        self.pieces.iter().position(|p| p.is_none())
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(Option::is_some)
    }

    // Concatenates collected pieces and checks the result hashes to `info_hash`.
    pub fn finish(self, info_hash: [u8; 20]) -> Result<Vec<u8>, MetaInfoError> {
        let mut buf = Vec::with_capacity(self.total_size);
        for piece in self.pieces {
            buf.extend_from_slice(&piece.ok_or_else(|| MetaInfoError::InvalidMagnet("incomplete metadata".to_string()))?);
        }
        let mut hasher = Sha1::new();
        hasher.update(&buf);
        let digest: [u8; 20] = hasher.finalize().into();
        if digest != info_hash {
            return Err(MetaInfoError::InvalidMagnet("metadata info-hash mismatch".to_string()));
        }
        Ok(buf)
    }
}

pub fn encode_request(ut_metadata_id: u8, piece: u32) -> Result<(u8, Vec<u8>), MetaInfoError> {
    let header = MetadataHeader { msg_type: MSG_REQUEST, piece, total_size: None };
    Ok((ut_metadata_id, bencode::encode_to_raw(&header)?))
}

// Parses a ut_metadata extended-message payload into either a data piece
// (index, bytes) or a rejection.
pub fn decode_payload(payload: &[u8]) -> Result<(u32, Option<Vec<u8>>), MetaInfoError> {
    let header_len = bencode_value_len(payload)
        .ok_or_else(|| MetaInfoError::InvalidMagnet("malformed metadata message".to_string()))?;
    let header: MetadataHeader = bencode::decode_bytes(&payload[..header_len])?;
    match header.msg_type {
        MSG_DATA => Ok((header.piece, Some(payload[header_len..].to_vec()))),
        MSG_REJECT => Ok((header.piece, None)),
        _ => Err(MetaInfoError::InvalidMagnet(format!("unexpected metadata msg_type {}", header.msg_type))),
    }
}

// Connects to a single peer, performs the wire handshake, the BEP 10
// extension handshake, then requests every metadata piece in order.
// Returns a fully-verified `MetaInfo` once the info dict hashes to
// `info_hash`.
pub async fn fetch_from_peer(
    address: SocketAddr,
    info_hash: [u8; 20],
    client_id: [u8; 20],
    trackers: Vec<Url>,
) -> Result<MetaInfo, MetaInfoError> {

    let stream = time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(address))
        .await
        .map_err(|_| MetaInfoError::InvalidMagnet("connect timeout".to_string()))??;

    let mut handshake_io = Framed::new(stream, HandshakeCodec);
    let mut our_handshake = Handshake::new(info_hash, client_id);
    our_handshake.reserved[5] |= 0x10; // BEP 10 extension protocol bit.
    handshake_io.send(our_handshake).await.map_err(|e| MetaInfoError::InvalidMagnet(e.to_string()))?;

    let their_handshake = time::timeout(HANDSHAKE_TIMEOUT, handshake_io.next())
        .await
        .map_err(|_| MetaInfoError::InvalidMagnet("handshake timeout".to_string()))?
        .ok_or_else(|| MetaInfoError::InvalidMagnet("peer closed during handshake".to_string()))?
        .map_err(|e| MetaInfoError::InvalidMagnet(e.to_string()))?;

    if their_handshake.info_hash != info_hash {
        return Err(MetaInfoError::InvalidMagnet("info-hash mismatch".to_string()));
    }
    if their_handshake.reserved[5] & 0x10 == 0 {
        return Err(MetaInfoError::InvalidMagnet("peer does not support extensions".to_string()));
    }

    // Re-frame the same socket with the message codec, carrying over any
    // bytes already buffered past the 68-byte handshake.
    let old_parts = handshake_io.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, MessageCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    let mut conn = Framed::from_parts(new_parts);

    let our_ext_hs = bencode::encode_to_raw(&ExtensionHandshake::supporting_ut_metadata())?;
    conn.send(Message::Extended { id: 0, payload: our_ext_hs }).await
        .map_err(|e| MetaInfoError::InvalidMagnet(e.to_string()))?;

    let mut peer_ut_metadata_id = None;
    let mut assembler = None;

    loop {
        let msg = time::timeout(EXCHANGE_TIMEOUT, conn.next())
            .await
            .map_err(|_| MetaInfoError::InvalidMagnet("metadata exchange timeout".to_string()))?
            .ok_or_else(|| MetaInfoError::InvalidMagnet("peer closed during metadata exchange".to_string()))?
            .map_err(|e| MetaInfoError::InvalidMagnet(e.to_string()))?;

        match msg {
            Message::Extended { id: 0, payload } => {
                let ext_hs: ExtensionHandshake = bencode::decode_bytes(&payload)?;
                let ut_id = ext_hs.ut_metadata_id()
                    .ok_or_else(|| MetaInfoError::InvalidMagnet("peer lacks ut_metadata".to_string()))?;
                let size = ext_hs.metadata_size
                    .ok_or_else(|| MetaInfoError::InvalidMagnet("peer omitted metadata_size".to_string()))? as usize;
                peer_ut_metadata_id = Some(ut_id);
                assembler = Some(MetadataAssembler::new(size));

                let (id, payload) = encode_request(ut_id, 0)?;
                conn.send(Message::Extended { id, payload }).await
                    .map_err(|e| MetaInfoError::InvalidMagnet(e.to_string()))?;
            }
            Message::Extended { id, payload } if Some(id) == peer_ut_metadata_id => {
                let assembler = assembler.as_mut()
                    .ok_or_else(|| MetaInfoError::InvalidMagnet("data before handshake".to_string()))?;
                let (piece, data) = decode_payload(&payload)?;
                match data {
                    Some(data) => assembler.insert(piece as usize, data),
                    None => return Err(MetaInfoError::InvalidMagnet("peer rejected metadata request".to_string())),
                }

                if assembler.is_complete() {
                    break;
                }
                let next = assembler.next_missing().expect("incomplete assembler has a missing piece");
                let ut_id = peer_ut_metadata_id.expect("set alongside assembler");
                let (id, payload) = encode_request(ut_id, next as u32)?;
                conn.send(Message::Extended { id, payload }).await
                    .map_err(|e| MetaInfoError::InvalidMagnet(e.to_string()))?;
            }
            _ => {}
        }
    }

    let info_bytes = assembler
        .expect("loop only exits after assembler is set and complete")
        .finish(info_hash)?;

    MetaInfo::from_info_bytes(info_hash, info_bytes, trackers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bencode_value_len_spans_nested_dict() {
        let header = bencode::encode_to_raw(&MetadataHeader { msg_type: MSG_DATA, piece: 3, total_size: Some(100) }).unwrap();
        let mut payload = header.clone();
        payload.extend_from_slice(b"trailing-piece-bytes");
        assert_eq!(bencode_value_len(&payload).unwrap(), header.len());
    }

    #[test]
    fn decode_payload_splits_header_from_piece_bytes() {
        let header = bencode::encode_to_raw(&MetadataHeader { msg_type: MSG_DATA, piece: 2, total_size: None }).unwrap();
        let mut payload = header;
        payload.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
        let (piece, data) = decode_payload(&payload).unwrap();
        assert_eq!(piece, 2);
        assert_eq!(data.unwrap(), vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn decode_payload_reports_rejection() {
        let payload = bencode::encode_to_raw(&MetadataHeader { msg_type: MSG_REJECT, piece: 1, total_size: None }).unwrap();
        let (piece, data) = decode_payload(&payload).unwrap();
        assert_eq!(piece, 1);
        assert!(data.is_none());
    }

    #[test]
    fn assembler_verifies_against_info_hash() {
        let info = b"some fake info dict bytes".to_vec();
        let mut hasher = Sha1::new();
        hasher.update(&info);
        let hash: [u8; 20] = hasher.finalize().into();

        let mut assembler = MetadataAssembler::new(info.len());
        assert_eq!(assembler.next_missing(), Some(0));
        assembler.insert(0, info.clone());
        assert!(assembler.is_complete());
        assert_eq!(assembler.finish(hash).unwrap(), info);
    }

    #[test]
    fn assembler_rejects_hash_mismatch() {
        let mut assembler = MetadataAssembler::new(4);
        assembler.insert(0, vec![1, 2, 3, 4]);
        assert!(assembler.finish([0u8; 20]).is_err());
    }

    #[test]
    fn extension_handshake_roundtrips_through_bencode() {
        let hs = ExtensionHandshake::supporting_ut_metadata();
        let bytes = bencode::encode_to_raw(&hs).unwrap();
        let decoded: ExtensionHandshake = bencode::decode_bytes(&bytes).unwrap();
        assert_eq!(decoded.ut_metadata_id(), Some(1));
    }
}
