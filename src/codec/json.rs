//! JSON serializer using `serde_json`.
//!
//! Slower and larger than MsgPack but readable on the wire, which is handy
//! when debugging a peer written against another stack.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Serializer;
use crate::error::Result;

/// JSON serializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    /// Name advertised in endpoint descriptions.
    pub const NAME: &'static str = "json";
}

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn serialize_args<A: Serialize + ?Sized>(&self, args: &A) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(args)?)
    }

    fn deserialize_args<A: DeserializeOwned>(&self, bytes: &[u8]) -> Result<A> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn serialize_return<R: Serialize + ?Sized>(&self, value: &R) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize_return<R: DeserializeOwned>(&self, bytes: &[u8]) -> Result<R> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_are_json_arrays() {
        let bytes = JsonSerializer.serialize_args(&(1, "two")).unwrap();
        assert_eq!(bytes, br#"[1,"two"]"#);
    }

    #[test]
    fn test_return_mismatch_is_error() {
        let bytes = JsonSerializer.serialize_return(&"text").unwrap();
        let result: Result<u32> = JsonSerializer.deserialize_return(&bytes);
        assert!(result.is_err());
    }
}
