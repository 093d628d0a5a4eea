// BEP 5 KRPC messages: bencoded dicts with a transaction id `t`, a type
// `y` (query/response/error), and type-specific payloads. Real KRPC
// messages mix heterogeneous keys under `a`/`r` depending on which query
// or response is in play, so (like the wire dicts elsewhere in this
// crate) this models it as one struct per dict with the fields each
// variant actually uses left `None`, rather than a tagged enum.
use serde_bytes::ByteBuf;
use serde_derive::{Deserialize, Serialize};

use super::NodeId;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,

    #[serde(rename = "y")]
    pub kind: String,

    #[serde(rename = "q", default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    #[serde(rename = "a", default, skip_serializing_if = "Option::is_none")]
    pub args: Option<QueryArgs>,

    #[serde(rename = "r", default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseValues>,

    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<(i64, String)>,
}

impl Envelope {
    pub fn query(transaction_id: Vec<u8>, query: &str, args: QueryArgs) -> Self {
        Envelope {
            transaction_id,
            kind: "q".to_string(),
            query: Some(query.to_string()),
            args: Some(args),
            response: None,
            error: None,
        }
    }

    pub fn response(transaction_id: Vec<u8>, response: ResponseValues) -> Self {
        Envelope {
            transaction_id,
            kind: "r".to_string(),
            query: None,
            args: None,
            response: Some(response),
            error: None,
        }
    }

    pub fn error(transaction_id: Vec<u8>, code: i64, message: String) -> Self {
        Envelope {
            transaction_id,
            kind: "e".to_string(),
            query: None,
            args: None,
            response: None,
            error: Some((code, message)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryArgs {
    pub id: NodeId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<NodeId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info_hash: Option<NodeId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implied_port: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<ByteBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseValues {
    pub id: NodeId,

    // Compact node info: concatenated 26-byte (id[20] + ipv4[4] + port[2]) entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<ByteBuf>,

    // Compact peer info: list of 6-byte (ipv4[4] + port[2]) entries, one per peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<ByteBuf>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<ByteBuf>,
}

pub fn encode(envelope: &Envelope) -> crate::dht::Result<Vec<u8>> {
    Ok(bencode::encode_to_raw(envelope)?)
}

pub fn decode(bytes: &[u8]) -> crate::dht::Result<Envelope> {
    Ok(bencode::decode_bytes(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_query_roundtrips() {
        let args = QueryArgs { id: NodeId([7u8; 20]), ..Default::default() };
        let envelope = Envelope::query(b"aa".to_vec(), "ping", args.clone());
        let encoded = encode(&envelope).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.kind, "q");
        assert_eq!(decoded.query.as_deref(), Some("ping"));
        assert_eq!(decoded.args, Some(args));
    }

    #[test]
    fn get_peers_response_roundtrips_with_values() {
        let response = ResponseValues {
            id: NodeId([1u8; 20]),
            nodes: None,
            values: Some(vec![ByteBuf::from(vec![127, 0, 0, 1, 0x1a, 0xe1])]),
            token: Some(ByteBuf::from(b"tok".to_vec())),
        };
        let envelope = Envelope::response(b"bb".to_vec(), response.clone());
        let encoded = encode(&envelope).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.response, Some(response));
    }

    #[test]
    fn error_message_roundtrips() {
        let envelope = Envelope::error(b"cc".to_vec(), 201, "Generic Error".to_string());
        let encoded = encode(&envelope).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.error, Some((201, "Generic Error".to_string())));
    }
}
