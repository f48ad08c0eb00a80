//! Command-specific payload layouts.
//!
//! ```text
//! CALL_*                 method_index u16 BE | serialized args
//! ASYNC_PARAM_*          param_index u8      | serialized value / failure
//! CLIENT_OPEN            [initial_credit i32 BE]
//! CLIENT_BACK_PRESSURE   credit i32 BE
//! SUCCESS (stream)       service_id 16B | call_id i32 BE
//! error-class            UTF-8 message, at most 256 chars
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use super::wire_format::CacheKey;
use crate::error::{Error, Result};

/// Maximum number of characters kept in an error-class message.
pub const MAX_MESSAGE_CHARS: usize = 256;

/// Size of an encoded stream key.
pub const STREAM_KEY_SIZE: usize = 20;

/// Encode a call payload: method index followed by serialized arguments.
pub fn encode_call(method_index: u16, args: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + args.len());
    buf.put_u16(method_index);
    buf.extend_from_slice(args);
    buf.freeze()
}

/// Split a call payload into method index and argument bytes.
pub fn decode_call(payload: &Bytes) -> Result<(u16, Bytes)> {
    if payload.len() < 2 {
        return Err(Error::Protocol(
            "Call payload is missing the method index".to_string(),
        ));
    }
    let index = u16::from_be_bytes([payload[0], payload[1]]);
    Ok((index, payload.slice(2..)))
}

/// Encode an async-parameter payload.
pub fn encode_param(param_index: u8, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + data.len());
    buf.put_u8(param_index);
    buf.extend_from_slice(data);
    buf.freeze()
}

/// Split an async-parameter payload into index and data.
pub fn decode_param(payload: &Bytes) -> Result<(u8, Bytes)> {
    let Some(&index) = payload.first() else {
        return Err(Error::Protocol(
            "Async parameter payload is empty".to_string(),
        ));
    };
    Ok((index, payload.slice(1..)))
}

/// Encode a signed credit value (CLIENT_OPEN, CLIENT_BACK_PRESSURE).
pub fn encode_credit(credit: i32) -> Bytes {
    Bytes::copy_from_slice(&credit.to_be_bytes())
}

/// Decode a signed credit value. Empty payloads yield `None`.
pub fn decode_credit(payload: &[u8]) -> Result<Option<i32>> {
    match payload.len() {
        0 => Ok(None),
        4 => Ok(Some(i32::from_be_bytes([
            payload[0], payload[1], payload[2], payload[3],
        ]))),
        n => Err(Error::Protocol(format!(
            "Credit payload must be 4 bytes, got {}",
            n
        ))),
    }
}

/// Encode a stream key as the SUCCESS payload of a streaming call.
pub fn encode_stream_key(key: CacheKey) -> Bytes {
    let mut buf = BytesMut::with_capacity(STREAM_KEY_SIZE);
    buf.extend_from_slice(key.service_id.as_bytes());
    buf.put_i32(key.call_id);
    buf.freeze()
}

/// Decode a stream key.
pub fn decode_stream_key(payload: &[u8]) -> Result<CacheKey> {
    if payload.len() != STREAM_KEY_SIZE {
        return Err(Error::Protocol(format!(
            "Stream key must be {} bytes, got {}",
            STREAM_KEY_SIZE,
            payload.len()
        )));
    }
    let service_id = Uuid::from_slice(&payload[..16])
        .map_err(|e| Error::Protocol(format!("Bad stream key: {}", e)))?;
    let call_id = i32::from_be_bytes([payload[16], payload[17], payload[18], payload[19]]);
    Ok(CacheKey::new(service_id, call_id))
}

/// Truncate `message` to [`MAX_MESSAGE_CHARS`] characters.
pub fn truncate_message(message: &str) -> &str {
    match message.char_indices().nth(MAX_MESSAGE_CHARS) {
        Some((cut, _)) => &message[..cut],
        None => message,
    }
}

/// Encode an error-class message.
pub fn encode_message(message: &str) -> Bytes {
    Bytes::copy_from_slice(truncate_message(message).as_bytes())
}

/// Decode an error-class message, replacing invalid UTF-8.
pub fn decode_message(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_payload() {
        let payload = encode_call(0x0102, b"args");
        assert_eq!(&payload[..2], &[0x01, 0x02]);

        let (index, args) = decode_call(&payload).unwrap();
        assert_eq!(index, 0x0102);
        assert_eq!(&args[..], b"args");

        assert!(decode_call(&Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn test_param_payload() {
        let (index, data) = decode_param(&encode_param(3, b"v")).unwrap();
        assert_eq!(index, 3);
        assert_eq!(&data[..], b"v");
        assert!(decode_param(&Bytes::new()).is_err());
    }

    #[test]
    fn test_credit_payload() {
        assert_eq!(decode_credit(&encode_credit(-1)).unwrap(), Some(-1));
        assert_eq!(decode_credit(&encode_credit(64)).unwrap(), Some(64));
        assert_eq!(decode_credit(&[]).unwrap(), None);
        assert!(decode_credit(&[1, 2]).is_err());
    }

    #[test]
    fn test_stream_key_payload() {
        let key = CacheKey::new(Uuid::from_u128(77), -3);
        let encoded = encode_stream_key(key);
        assert_eq!(encoded.len(), STREAM_KEY_SIZE);
        assert_eq!(decode_stream_key(&encoded).unwrap(), key);
        assert!(decode_stream_key(&encoded[..19]).is_err());
    }

    #[test]
    fn test_message_truncated_to_256_chars() {
        let long = "é".repeat(300);
        let encoded = encode_message(&long);
        assert_eq!(decode_message(&encoded).chars().count(), MAX_MESSAGE_CHARS);

        assert_eq!(truncate_message("short"), "short");
    }
}
