//! MsgPack codec using `rmp-serde`.
//!
//! Always uses `to_vec_named`: structs go on the wire as maps with field
//! names, so workers can ignore fields they do not know and the `cmd` tag of
//! a [`Command`](crate::envelope::Command) stays readable next to its payload.

use crate::error::{GatewayError, Result};

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map format).
    #[inline]
    pub fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Decode an arbitrary structured value.
    ///
    /// An empty payload decodes to `null`. Any failure is reported as
    /// [`GatewayError::Decode`] so it can be handed to the waiting caller.
    pub fn decode_value(bytes: &[u8]) -> Result<serde_json::Value> {
        if bytes.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        rmp_serde::from_slice(bytes).map_err(|e| GatewayError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Note {
        id: String,
        title: String,
    }

    #[test]
    fn test_encode_decode_struct() {
        let original = Note {
            id: "1".to_string(),
            title: "groceries".to_string(),
        };

        let encoded = MsgPackCodec::encode(&original).unwrap();
        let decoded: Note = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_to_vec_named_produces_map_format() {
        let encoded = MsgPackCodec::encode(&Note {
            id: "1".to_string(),
            title: "x".to_string(),
        })
        .unwrap();

        // 0x82 = fixmap with 2 elements; array format would be 0x92
        assert_eq!(encoded[0], 0x82, "Expected fixmap, got {:02X}", encoded[0]);
    }

    #[test]
    fn test_decode_value_from_struct() {
        let encoded = MsgPackCodec::encode(&Note {
            id: "7".to_string(),
            title: "hello".to_string(),
        })
        .unwrap();

        let value = MsgPackCodec::decode_value(&encoded).unwrap();
        assert_eq!(value, serde_json::json!({ "id": "7", "title": "hello" }));
    }

    #[test]
    fn test_decode_value_empty_is_null() {
        assert_eq!(
            MsgPackCodec::decode_value(&[]).unwrap(),
            serde_json::Value::Null
        );
    }

    #[test]
    fn test_decode_value_invalid_is_decode_error() {
        // 0xc1 is never used in MsgPack
        let result = MsgPackCodec::decode_value(&[0xc1]);
        assert!(matches!(result, Err(GatewayError::Decode(_))));
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let result: Result<Note> = MsgPackCodec::decode(b"not valid msgpack");
        assert!(result.is_err());
    }

    #[test]
    fn test_binary_buffer_roundtrip() {
        let data: Vec<u8> = vec![0x89, 0x50, 0x4e, 0x47];
        let encoded = MsgPackCodec::encode(&serde_bytes::Bytes::new(&data)).unwrap();

        // bin8 format
        assert_eq!(encoded[0], 0xc4);

        let decoded: serde_bytes::ByteBuf = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded.as_ref(), &data[..]);
    }
}
