// BEP 9 / magnet URI parsing. A magnet link identifies a torrent by its
// info-hash alone and relies on peers (via ut_metadata) or the DHT to
// supply the actual metainfo dict.
use url::Url;
use super::MetaInfoError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {

    // 20-byte (v1, btih) or 32-byte (v2, btmh) info-hash.
    pub info_hash: InfoHash,

    // Display name hint (`dn`), not authoritative.
    pub display_name: Option<String>,

    // Tracker URLs (`tr`), tried in addition to any learned via DHT/PEX.
    pub trackers: Vec<Url>,

    // Web seed URLs (`ws`), not yet consumed by this engine but retained
    // for forward compatibility.
    pub web_seeds: Vec<Url>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoHash {
    V1([u8; 20]),
    V2([u8; 32]),
}

impl InfoHash {
    // The 20-byte hash used to key torrents and wire-protocol handshakes;
    // a v2 hash is truncated per BEP 52's hybrid-compat rule.
    pub fn as_v1(&self) -> [u8; 20] {
        match self {
            InfoHash::V1(h) => *h,
            InfoHash::V2(h) => {
                let mut out = [0u8; 20];
                out.copy_from_slice(&h[..20]);
                out
            }
        }
    }
}

impl MagnetLink {

    pub fn parse(uri: &str) -> Result<Self, MetaInfoError> {

        let url = Url::parse(uri).map_err(|e| MetaInfoError::InvalidMagnet(e.to_string()))?;
        if url.scheme() != "magnet" {
            return Err(MetaInfoError::InvalidMagnet("scheme must be magnet:".to_string()));
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        let mut web_seeds = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => info_hash = Some(parse_xt(&value)?),
                "dn" => display_name = Some(value.into_owned()),
                "tr" => {
                    if let Ok(url) = Url::parse(&value) {
                        trackers.push(url);
                    }
                }
                "ws" => {
                    if let Ok(url) = Url::parse(&value) {
                        web_seeds.push(url);
                    }
                }
                _ => {}
            }
        }

        Ok(MagnetLink {
            info_hash: info_hash.ok_or_else(|| MetaInfoError::InvalidMagnet("missing xt parameter".to_string()))?,
            display_name,
            trackers,
            web_seeds,
        })
    }
}

// `xt=urn:btih:<hex or base32>` for v1, `xt=urn:btmh:<multihash hex>` for v2.
fn parse_xt(xt: &str) -> Result<InfoHash, MetaInfoError> {

    let hash_str = xt
        .strip_prefix("urn:btih:")
        .map(|h| (h, false))
        .or_else(|| xt.strip_prefix("urn:btmh:").map(|h| (h, true)))
        .ok_or_else(|| MetaInfoError::InvalidMagnet(format!("unsupported xt urn: {}", xt)))?;

    let (hash_str, is_v2) = hash_str;

    if is_v2 {
        let bytes = hex::decode(hash_str).map_err(|_| MetaInfoError::InvalidMagnet("invalid btmh hex".to_string()))?;
        // multihash: 1-byte function code + 1-byte length prefix + digest.
        if bytes.len() < 2 || bytes.len() - 2 != 32 {
            return Err(MetaInfoError::InvalidMagnet("unexpected btmh digest length".to_string()));
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[2..]);
        return Ok(InfoHash::V2(hash));
    }

    let bytes = if hash_str.len() == 40 {
        hex::decode(hash_str).map_err(|_| MetaInfoError::InvalidMagnet("invalid btih hex".to_string()))?
    } else if hash_str.len() == 32 {
        base32_decode(hash_str).ok_or_else(|| MetaInfoError::InvalidMagnet("invalid btih base32".to_string()))?
    } else {
        return Err(MetaInfoError::InvalidMagnet("btih must be 40 hex or 32 base32 chars".to_string()));
    };

    if bytes.len() != 20 {
        return Err(MetaInfoError::InvalidMagnet("btih digest must be 20 bytes".to_string()));
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&bytes);
    Ok(InfoHash::V1(hash))
}

// Minimal RFC 4648 base32 decoder (uppercase alphabet, no padding), enough
// for the btih encoding BEP 9 allows as an alternative to hex.
fn base32_decode(s: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut bits: u64 = 0;
    let mut bit_count = 0;
    let mut out = Vec::new();

    for c in s.to_ascii_uppercase().bytes() {
        let val = ALPHABET.iter().position(|&a| a == c)? as u64;
        bits = (bits << 5) | val;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push((bits >> bit_count) as u8);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_btih_with_trackers_and_name() {
        let uri = "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a&dn=ubuntu.iso&tr=http%3A%2F%2Ftracker.example.org%3A6969%2Fannounce";
        let magnet = MagnetLink::parse(uri).unwrap();
        assert_eq!(magnet.display_name, Some("ubuntu.iso".to_string()));
        assert_eq!(magnet.trackers.len(), 1);
        match magnet.info_hash {
            InfoHash::V1(h) => assert_eq!(hex::encode(h), "c12fe1c06bba254a9dc9f519b335aa7c1367a88a"),
            InfoHash::V2(_) => panic!("expected v1 hash"),
        }
    }

    #[test]
    fn rejects_non_magnet_scheme() {
        assert!(MagnetLink::parse("http://example.org").is_err());
    }

    #[test]
    fn rejects_missing_xt() {
        assert!(MagnetLink::parse("magnet:?dn=foo").is_err());
    }

    #[test]
    fn base32_btih_decodes_to_20_bytes() {
        let hex_hash = "c12fe1c06bba254a9dc9f519b335aa7c1367a88a";
        let bytes = hex::decode(hex_hash).unwrap();
        let b32 = base32_encode_for_test(&bytes);
        let uri = format!("magnet:?xt=urn:btih:{}", b32);
        let magnet = MagnetLink::parse(&uri).unwrap();
        assert_eq!(magnet.info_hash.as_v1().to_vec(), bytes);
    }

    // Test-only encoder, mirroring base32_decode, to exercise the decode path.
    fn base32_encode_for_test(data: &[u8]) -> String {
        const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
        let mut bits: u64 = 0;
        let mut bit_count = 0;
        let mut out = String::new();
        for &byte in data {
            bits = (bits << 8) | byte as u64;
            bit_count += 8;
            while bit_count >= 5 {
                bit_count -= 5;
                out.push(ALPHABET[((bits >> bit_count) & 0x1f) as usize] as char);
            }
        }
        if bit_count > 0 {
            out.push(ALPHABET[((bits << (5 - bit_count)) & 0x1f) as usize] as char);
        }
        out
    }
}
