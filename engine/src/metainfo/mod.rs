use rand::seq::SliceRandom;
use serde_derive::{Deserialize, Serialize};
use crate::{store::FileInfo, tracker::Tracker};

pub mod magnet;
pub mod ut_metadata;
pub use magnet::MagnetLink;

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    BencodeError(#[from] bencode::Error),

    #[error("invalid file extension, expected .torrent")]
    InvalidExtension,

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("invalid pieces length, must be divisible by 20")]
    InvalidPiecesLength,

    #[error("file(s) with size 0")]
    FileNoSize,

    #[error("file(s) with no path")]
    FileEmptyPath,

    #[error("file has absolute path")]
    FileAbsolutePath,

    #[error("invalid magnet uri: {0}")]
    InvalidMagnet(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {

    // #[serde(deserialize_with = "crate::de::path_deserialize")]
    pub path: Vec<String>,

    pub length: u64,

    pub md5sum: Option<String>,

}

#[derive(Clone, Deserialize, Serialize)]
pub struct Info {

    // File namepub .
    pub name: String,
    
    // String consisting of the concatenation of all 20-byte SHA1 hash values, one per piece.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    // Number of bytes in each piece (integer).
    #[serde(rename = "piece length")]
    pub piece_length: u32,

    // A 32-character hexadecimal string corresponding to the MD5 sum of the file.
    #[serde(default)]
    pub md5sum: Option<String>,
    
    // Length of the file in bytes (integer).
    #[serde(default)]
    pub length: Option<u64>,

    // A list of dictionaries, one for each file.
    #[serde(default)]
    pub files: Option<Vec<File>>,
    
    // If it is set to "1", the client MUST publish its presence to get other peers ONLY 
    // via the trackers explicitly described in the metainfo file. If this field is set to 
    // "0" or is not present, the client may obtain peer from other means, e.g. PEX peer exchange, dht.
    #[serde(default)]
    pub private: Option<u8>,

    #[serde(default)]
    #[serde(rename = "root hash")]
    pub root_hash: Option<String>,

    // BEP 52 (v2 / hybrid torrents). `meta version` being present is what
    // distinguishes a v2 or hybrid torrent from a plain v1 one.
    #[serde(default)]
    #[serde(rename = "meta version")]
    pub meta_version: Option<u8>,

    // v2 file tree, keyed by path segment; left as raw bencode bytes since
    // its shape is recursive and only consulted once a v2 torrent is
    // confirmed, not on every v1 parse.
    #[serde(default)]
    #[serde(rename = "file tree")]
    #[serde(with = "serde_bytes")]
    pub file_tree: Option<Vec<u8>>,

    // v2 per-piece-layer merkle hashes, one blob per file root hash.
    #[serde(default)]
    #[serde(rename = "piece layers")]
    #[serde(with = "serde_bytes")]
    pub piece_layers: Option<Vec<u8>>,

}

impl Info {
    // Calculates the sha1 hash of info dict to verify torrent integrity.
    fn info_hash(&self) -> Result<[u8; 20], MetaInfoError> {
        use sha1::Digest;
        let mut hasher = sha1::Sha1::new();
        // Serialize info dict into bencode.
        let info_data = bencode::encode_to_raw(&self)?;
        hasher.update(info_data);
        Ok(hasher.finalize().into())
    }    
}

#[allow(dead_code)]
#[derive(Deserialize, Clone)]
pub struct MetaInfo {
    
    // The announce URL of the tracker (string).
    #[serde(deserialize_with = "crate::de::url_deserialize")]
    pub announce: url::Url,
    
    // A dictionary that describes the file(s) of the torrent.
    pub info: Info,
    
    // sha1 hash of info dict
    #[serde(skip)] 
    pub info_hash: [u8; 20],
    
    // (optional) the string encoding format used to generate the pieces part of the info 
    // dictionary in the .torrent metafile (string).
    #[serde(default)]
    pub encoding: Option<String>,
    
    // (optional) this is an extention to the official specification, offering backwards-compatibility.
    #[serde(default)]
    #[serde(rename = "announce-list")]
    #[serde(deserialize_with = "crate::de::announce_list_deserialize")]
    pub announce_list: Option<Vec<Vec<url::Url>>>,
    
    // (optional) the creation time of the torrent, in standard UNIX epoch format.
    #[serde(default)]
    #[serde(rename = "creation date")]
    pub creation_date: Option<i64>,
    
    // (optional) free-form textual comments of the author (string).
    #[serde(rename = "comment")]
    pub comment: Option<String>,
    
    // (optional) name and version of the program used to create the .torrent (string).
    #[serde(default)]
    #[serde(rename = "created by")]
    pub created_by: Option<String>,
    
}

impl MetaInfo {

    pub fn new<P: AsRef<std::path::Path>>(path: P) -> Result<MetaInfo, MetaInfoError> {
        
        if path.as_ref().extension().unwrap_or_default() != "torrent" {
            return Err(MetaInfoError::InvalidExtension);
        }

        let mut metainfo: MetaInfo = bencode::decode_bytes(&std::fs::read(path)?)?;

        // A pure v2 torrent (BEP 52) carries piece hashes in `piece layers`
        // instead of the v1 `pieces` string; a hybrid torrent carries both.
        let is_v2_only = metainfo.info.meta_version == Some(2) && metainfo.info.piece_layers.is_some();
        if !is_v2_only && (metainfo.info.pieces.len() % 20 != 0 || metainfo.info.pieces.is_empty()) {
            return Err(MetaInfoError::InvalidPiecesLength);
        }

        metainfo.info_hash = metainfo.info.info_hash()?;
        tracing::debug!("metainfo created: {:#?}", metainfo);
        Ok(metainfo)
    }

    // Builds a MetaInfo from a raw info dict recovered via ut_metadata,
    // once its SHA-1 has already been checked against `info_hash` by the
    // caller. `trackers` comes from the originating magnet link.
    pub fn from_info_bytes(info_hash: [u8; 20], info_bytes: Vec<u8>, trackers: Vec<url::Url>) -> Result<MetaInfo, MetaInfoError> {
        let info: Info = bencode::decode_bytes(&info_bytes)?;

        let is_v2_only = info.meta_version == Some(2) && info.piece_layers.is_some();
        if !is_v2_only && (info.pieces.len() % 20 != 0 || info.pieces.is_empty()) {
            return Err(MetaInfoError::InvalidPiecesLength);
        }

        let mut trackers = trackers.into_iter();
        let announce = trackers.next().ok_or_else(|| {
            MetaInfoError::InvalidMagnet("magnet carried no trackers to resolve metadata over".to_string())
        })?;
        let announce_list: Vec<url::Url> = trackers.collect();

        Ok(MetaInfo {
            announce,
            info,
            info_hash,
            encoding: None,
            announce_list: if announce_list.is_empty() { None } else { Some(vec![announce_list]) },
            creation_date: None,
            comment: None,
            created_by: None,
        })
    }

    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.info.pieces
            .chunks_exact(20)
            // Safe as we have already checked length is a multiple of 20, in new.
            .map(|c| c.try_into().unwrap())
            .collect()
    }

    pub fn piece_len(&self) -> usize { self.info.piece_length as usize }

    pub fn num_pieces(&self) -> u32 { self.info.pieces.len() as u32 / 20 }

    pub fn is_multi_file(&self) -> bool { self.info.files.is_some() }

    // Whether this torrent carries BEP 52 v2 (or hybrid v1+v2) metadata.
    pub fn is_v2(&self) -> bool { self.info.meta_version.is_some() }

    pub fn is_hybrid(&self) -> bool { self.is_v2() && !self.info.pieces.is_empty() }
    
    pub fn single_file_len(&self) -> Option<u64> { self.info.length }

    pub fn total_len(&self) -> u64 {
        if let Some(files) = &self.info.files {
            files.iter().map(|f| f.length as u64).sum()
        } else {
            self.info.length.unwrap_or(0) as u64
        }
    }

    pub fn info_hash(&self) -> [u8; 20] { self.info_hash }
    
    pub fn name(&self) -> &str { &self.info.name }

    pub fn trackers(&self) -> Vec<Vec<Tracker>> {
        // If announce_list is present, we use that.
        if let Some(announce_list) = self.announce_list.clone() {
            let mut trackers = Vec::new();
            for mut tier in announce_list {
                let mut tier_trackers = Vec::new();
                // Randomly shuffle the trackers in the tier.
                tier.shuffle(&mut rand::thread_rng());
                for url in tier {
                    tier_trackers.push(Tracker::new(url));
                }
                trackers.push(tier_trackers);
            }
            trackers
        // Otherwise we just use the announce key.
        } else {
            vec![vec![Tracker::new(self.announce.clone())]]
        }
    }

    pub fn files(&self) -> Vec<FileInfo> {
        if let Some(files) = &self.info.files {
            let mut offset = 0;
            files.iter().map(|f| {
                let file_info = FileInfo {
                    path: f.path.join("/").into(),
                    length: f.length as usize,
                    offset,
                    md5sum: f.md5sum.clone(),
                };
                offset += f.length as usize;
                file_info
            }).collect()
        } else {
            vec![FileInfo {
                path: self.info.name.clone().into(),
                length: self.info.length.unwrap() as usize,
                offset: 0,
                md5sum: None,
            }]
        }
    }

    // Formatting methods.

    pub fn creation_date_fmt(&self) -> Option<String> {
        self.creation_date.map(|v| {
            let date = chrono::NaiveDateTime::from_timestamp_opt(v, 0);
            date.map(|v| v.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "Invalid date".to_string())
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(&self.info_hash)
    }

    pub fn size_fmt(&self) -> String {
        if self.is_multi_file() {
            let size = self.info.files.as_ref().unwrap().iter()
                .map(|f| f.length)
                .sum::<u64>();
            format_size(size)
        } else {
            format_size(self.info.length.unwrap())
        }
    }
}

fn format_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    let mut unit = "B";
    if size > 1024.0 {
        size /= 1024.0;
        unit = "KiB";
    }
    if size > 1024.0 {
        size /= 1024.0;
        unit = "MiB";
    }
    if size > 1024.0 {
        size /= 1024.0;
        unit = "GiB";
    }
    if size > 1024.0 {
        size /= 1024.0;
        unit = "TiB";
    }
    format!("{:.2} {}", size, unit)
}

impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaInfo")
            .field("announce", &self.announce.as_str())
            .field("info", &self.info)
            .field("info_hash", &self.info_hash_hex())
            .field("encoding", &self.encoding)
            // Change urls to strings for printing.
            .field("announce_list", &self.announce_list.as_ref().map(|v| 
                v.iter().map(|v| 
                    v.iter().map(|v| 
                        v.as_str()
                    ).collect()
                ).collect::<Vec<Vec<&str>>>()
            ))
            .field("creation_date", &self.creation_date_fmt())
            .field("comment", &self.comment)
            .field("created_by", &self.created_by)
            .finish()
    }
}

// Dont want to print out the pieces field, so we implement Debug manually.
impl std::fmt::Debug for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Info")
            .field("name", &self.name)
            .field("num pieces", &(&self.pieces.len() / 20))
            .field("piece_length", &self.piece_length)
            .field("md5sum", &self.md5sum)
            .field("length", &self.length)
            .field("files", &self.files)
            .field("private", &self.private)
            .field("root_hash", &self.root_hash)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> Info {
        Info {
            name: "sample.iso".to_string(),
            pieces: vec![0xAB; 40],
            piece_length: 32_768,
            md5sum: None,
            length: Some(65_000),
            files: None,
            private: None,
            root_hash: None,
            meta_version: None,
            file_tree: None,
            piece_layers: None,
        }
    }

    #[test]
    fn num_pieces_and_total_len_single_file() {
        let mut info = MetaInfo {
            announce: url::Url::parse("http://tracker.example.org:6969/announce").unwrap(),
            info: sample_info(),
            info_hash: [0; 20],
            encoding: None,
            announce_list: None,
            creation_date: None,
            comment: None,
            created_by: None,
        };
        info.info_hash = info.info.info_hash().unwrap();
        assert_eq!(info.num_pieces(), 2);
        assert_eq!(info.piece_len(), 32_768);
        assert_eq!(info.total_len(), 65_000);
        assert!(!info.is_multi_file());
        assert_eq!(info.info_hash_hex().len(), 40);
    }

    #[test]
    fn trackers_falls_back_to_announce_when_no_announce_list() {
        let info = MetaInfo {
            announce: url::Url::parse("http://tracker.example.org:6969/announce").unwrap(),
            info: sample_info(),
            info_hash: [1; 20],
            encoding: None,
            announce_list: None,
            creation_date: None,
            comment: None,
            created_by: None,
        };
        let trackers = info.trackers();
        assert_eq!(trackers.len(), 1);
        assert_eq!(trackers[0].len(), 1);
    }
}
