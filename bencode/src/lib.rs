#![allow(unused)]

// Convention from https://serde.rs/conventions.html
mod decode;
mod encode;
mod error;
mod token;

pub use decode::{decode_bytes, decode_str, DecodedType};
pub use encode::{encode_to_raw, encode_to_string};
pub use error::{Error, Result};
pub use token::Token;

#[cfg(test)]
mod torrent_test;

#[cfg(test)]
mod roundtrip_test {
    use super::*;
    use serde_derive::{Deserialize, Serialize};

    // Testable property: for every parsed bencode value v, bdecode(bencode(v)) == v.
    #[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
    struct Nested {
        name: String,
        count: i64,
        tags: Vec<String>,
    }

    #[test]
    fn integer_roundtrip() {
        let encoded = encode_to_raw(&42i64).unwrap();
        assert_eq!(encoded, b"i42e");
        let decoded: i64 = decode_bytes(&encoded).unwrap();
        assert_eq!(decoded, 42);
    }

    #[test]
    fn byte_string_roundtrip() {
        let encoded = encode_to_raw(&"spam".to_string()).unwrap();
        assert_eq!(encoded, b"4:spam");
        let decoded: String = decode_bytes(&encoded).unwrap();
        assert_eq!(decoded, "spam");
    }

    #[test]
    fn nested_struct_roundtrip() {
        let value = Nested {
            name: "torrent".to_string(),
            count: 7,
            tags: vec!["a".to_string(), "bb".to_string()],
        };
        let encoded = encode_to_raw(&value).unwrap();
        let decoded: Nested = decode_bytes(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn dictionary_keys_are_lexicographically_ordered() {
        #[derive(Serialize)]
        struct Unordered {
            zeta: i64,
            alpha: i64,
        }
        let encoded = encode_to_raw(&Unordered { zeta: 1, alpha: 2 }).unwrap();
        // "alpha" sorts before "zeta" regardless of struct field order.
        assert!(encoded.starts_with(b"d5:alpha"));
    }
}
