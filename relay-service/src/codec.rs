//! Payload encoding for queue messages
//!
//! Byte and string payloads cross the broker untouched; everything else goes
//! through the [`Json`] adapter and serde. An absent payload encodes as the
//! JSON `null` literal so consumers can always rely on a non-empty body.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Literal body produced for an absent payload
const NULL_BODY: &[u8] = b"null";

/// Conversion from a payload value to a message body.
pub trait Encode {
    /// Encode the payload into the wire body.
    fn encode(&self) -> Result<Vec<u8>>;
}

/// Conversion from a message body back to a payload value.
pub trait Decode: Sized {
    /// Decode the wire body into a payload value.
    fn decode(body: &[u8]) -> Result<Self>;
}

impl Encode for [u8] {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.to_vec())
    }
}

impl Encode for Vec<u8> {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.clone())
    }
}

impl Encode for str {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.as_bytes().to_vec())
    }
}

impl Encode for String {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.as_bytes().to_vec())
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Some(value) => value.encode(),
            None => Ok(NULL_BODY.to_vec()),
        }
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self) -> Result<Vec<u8>> {
        (**self).encode()
    }
}

impl Encode for serde_json::Value {
    fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Codec(e.to_string()))
    }
}

/// Adapter routing an arbitrary serde value through the JSON fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T: Serialize> Encode for Json<T> {
    fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.0).map_err(|e| Error::Codec(e.to_string()))
    }
}

impl Decode for Vec<u8> {
    fn decode(body: &[u8]) -> Result<Self> {
        Ok(body.to_vec())
    }
}

impl Decode for String {
    fn decode(body: &[u8]) -> Result<Self> {
        String::from_utf8(body.to_vec()).map_err(|e| Error::Codec(e.to_string()))
    }
}

impl<T: DeserializeOwned> Decode for Json<T> {
    fn decode(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map(Json)
            .map_err(|e| Error::Codec(e.to_string()))
    }
}

/// Decode a byte body into a preallocated buffer, reusing its allocation.
///
/// The destination is cleared, not reallocated, so a caller that sized the
/// buffer ahead of time keeps its capacity across messages.
pub fn decode_into(body: &[u8], dst: &mut Vec<u8>) {
    dst.clear();
    dst.extend_from_slice(body);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u32,
        sku: String,
    }

    #[test]
    fn test_byte_slice_identity() {
        let body = vec![0u8, 1, 2, 254, 255];
        assert_eq!(body.encode().unwrap(), body);
        assert_eq!(Vec::<u8>::decode(&body).unwrap(), body);
    }

    #[test]
    fn test_string_identity() {
        let s = "three messages in, three out".to_string();
        let encoded = s.encode().unwrap();
        assert_eq!(encoded, s.as_bytes());
        assert_eq!(String::decode(&encoded).unwrap(), s);
    }

    #[test]
    fn test_none_encodes_as_null_literal() {
        let none: Option<String> = None;
        assert_eq!(none.encode().unwrap(), b"null");
    }

    #[test]
    fn test_json_fallback_round_trip() {
        let order = Order {
            id: 7,
            sku: "sku-7".to_string(),
        };
        let encoded = Json(&order).encode().unwrap();
        let Json(decoded) = Json::<Order>::decode(&encoded).unwrap();
        assert_eq!(decoded, order);
    }

    #[test]
    fn test_decode_into_preserves_capacity() {
        let mut dst = Vec::with_capacity(1024);
        decode_into(b"short body", &mut dst);
        assert_eq!(dst, b"short body");
        assert_eq!(dst.capacity(), 1024);

        decode_into(b"next", &mut dst);
        assert_eq!(dst, b"next");
        assert_eq!(dst.capacity(), 1024);
    }

    #[test]
    fn test_invalid_utf8_fails_cleanly() {
        let err = String::decode(&[0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }

    #[test]
    fn test_invalid_json_fails_cleanly() {
        let err = Json::<Order>::decode(b"{not json").unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }
}
