//! MsgPack serializer using `rmp-serde`.
//!
//! Always uses `to_vec_named`, never `to_vec`: structs travel as maps with
//! field names, so peers built against a reordered struct still decode them.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Serializer;
use crate::error::Result;

/// MessagePack serializer for structured data.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackSerializer;

impl MsgPackSerializer {
    /// Name advertised in endpoint descriptions.
    pub const NAME: &'static str = "msgpack";

    /// Encode a value to MsgPack bytes (struct-as-map).
    #[inline]
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

impl Serializer for MsgPackSerializer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn serialize_args<A: Serialize + ?Sized>(&self, args: &A) -> Result<Vec<u8>> {
        Self::encode(args)
    }

    fn deserialize_args<A: DeserializeOwned>(&self, bytes: &[u8]) -> Result<A> {
        Self::decode(bytes)
    }

    fn serialize_return<R: Serialize + ?Sized>(&self, value: &R) -> Result<Vec<u8>> {
        Self::encode(value)
    }

    fn deserialize_return<R: DeserializeOwned>(&self, bytes: &[u8]) -> Result<R> {
        Self::decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct TestStruct {
        id: u32,
        name: String,
        active: bool,
    }

    #[test]
    fn test_args_tuple() {
        let codec = MsgPackSerializer;
        let encoded = codec.serialize_args(&(7i64, 42i64, true)).unwrap();
        let decoded: (i64, i64, bool) = codec.deserialize_args(&encoded).unwrap();
        assert_eq!(decoded, (7, 42, true));
    }

    #[test]
    fn test_unit_args() {
        let codec = MsgPackSerializer;
        let encoded = codec.serialize_args(&()).unwrap();
        let _: () = codec.deserialize_args(&encoded).unwrap();
    }

    #[test]
    fn test_service_error_payload() {
        let codec = MsgPackSerializer;
        let err = ServiceError::with_kind("illegal_argument", "7 and 42 share a factor");
        let encoded = codec.serialize_return(&err).unwrap();
        let decoded: ServiceError = codec.deserialize_return(&encoded).unwrap();
        assert_eq!(decoded, err);
    }

    #[test]
    fn test_to_vec_named_produces_map_format() {
        let test = TestStruct {
            id: 1,
            name: "x".to_string(),
            active: false,
        };

        let encoded = MsgPackSerializer::encode(&test).unwrap();

        // fixmap with 3 elements, not fixarray
        assert_eq!(
            encoded[0] & 0xF0,
            0x80,
            "Expected map format (0x8X), got {:02X}",
            encoded[0]
        );
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let result: Result<TestStruct> = MsgPackSerializer.deserialize_return(b"not valid msgpack");
        assert!(result.is_err());
    }

    #[test]
    fn test_binary_buffer() {
        let data: Vec<u8> = vec![0x01, 0x02, 0x03, 0x04, 0x05];
        let encoded = MsgPackSerializer::encode(&serde_bytes::Bytes::new(&data)).unwrap();

        // bin8 format
        assert_eq!(encoded[0], 0xc4);

        let decoded: serde_bytes::ByteBuf = MsgPackSerializer::decode(&encoded).unwrap();
        assert_eq!(decoded.as_ref(), &data);
    }
}
