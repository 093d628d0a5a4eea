#![allow(unused)]

use serde_bytes::ByteBuf;
use serde_derive::{self, Deserialize, Serialize};

use crate::{decode_bytes, encode_to_raw, encode_to_string, Result};

#[derive(Debug, Deserialize, Serialize)]
struct Node(String, i64);

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
struct File {
    path: Vec<String>,
    length: i64,
    #[serde(default)]
    md5sum: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct Info {
    name: String,
    #[serde(with = "serde_bytes")]
    pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    piece_length: i64,
    #[serde(default)]
    md5sum: Option<String>,
    #[serde(default)]
    length: Option<i64>,
    #[serde(default)]
    files: Option<Vec<File>>,
    #[serde(default)]
    private: Option<u8>,
}

#[derive(Debug, Deserialize, Serialize)]
struct Torrent {
    announce: String,
    info: Info,
    #[serde(default)]
    nodes: Option<Vec<Node>>,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
    #[serde(default)]
    #[serde(rename = "creation date")]
    creation_date: Option<i64>,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    #[serde(rename = "created by")]
    created_by: Option<String>,
}

// Single-piece, single-file torrent built by hand rather than loaded from a
// fixture, so the test carries its own input.
fn sample_torrent() -> Torrent {
    Torrent {
        announce: "http://tracker.example.org:6969/announce".to_string(),
        info: Info {
            name: "sample.iso".to_string(),
            pieces: vec![0xAB; 20],
            piece_length: 32_768,
            md5sum: None,
            length: Some(32_768),
            files: None,
            private: None,
        },
        nodes: None,
        encoding: Some("UTF-8".to_string()),
        announce_list: Some(vec![vec!["http://tracker.example.org:6969/announce".to_string()]]),
        creation_date: Some(1_700_000_000),
        comment: None,
        created_by: Some("ccbt".to_string()),
    }
}

#[test]
fn single_file_torrent_roundtrip() {
    let torrent = sample_torrent();
    let encoded = encode_to_raw(&torrent).unwrap();
    let decoded: Torrent = decode_bytes(&encoded).unwrap();

    assert_eq!(decoded.announce, torrent.announce);
    assert_eq!(decoded.encoding, Some("UTF-8".to_string()));
    assert_eq!(decoded.info.name, "sample.iso");
    assert_eq!(decoded.info.piece_length, 32_768);
    assert!(decoded.info.files.is_none());
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
struct TrackerResponse {
    #[serde(default)]
    interval: Option<i64>,
    #[serde(rename = "min interval", default)]
    min_interval: Option<i64>,
    #[serde(default)]
    complete: Option<i64>,
    #[serde(default)]
    incomplete: Option<i64>,
    #[serde(with = "serde_bytes")]
    peers: Vec<u8>,
}

// Compact-peers tracker announce response, hand-bencoded; exercises the
// same decode path a real HTTP tracker reply would go through.
#[test]
fn test_parse_tracker_response() {
    let mut raw = Vec::new();
    raw.extend_from_slice(b"d8:completei7e10:incompletei1e8:intervali1800e12:min intervali900e5:peers12:");
    raw.extend_from_slice(&[0x52, 0x45, 0x4D, 0x05, 0x1A, 0xE1, 0x61, 0x75, 0x86, 0x49, 0xC3, 0x50]);
    raw.extend_from_slice(b"e");

    let response: TrackerResponse = decode_bytes(&raw).unwrap();
    assert_eq!(response.interval, Some(1800));
    assert_eq!(response.min_interval, Some(900));
    assert_eq!(response.complete, Some(7));
    assert_eq!(response.incomplete, Some(1));
    assert_eq!(response.peers.len(), 12);
}
