//! Wire format encoding and decoding.
//!
//! Implements the 25-byte header format:
//! ```text
//! ┌─────────┬──────────┬─────────┬────────────────┬──────────┐
//! │ Version │ Length   │ Command │ Service ID     │ Call ID  │
//! │ 1 byte  │ 3 bytes  │ 1 byte  │ 16 bytes       │ 4 bytes  │
//! │         │ u24 BE   │         │ msb/lsb u64 BE │ i32 BE   │
//! └─────────┴──────────┴─────────┴────────────────┴──────────┘
//! ```
//!
//! `Length` counts every byte after the length field itself: command,
//! service id, call id and payload. All multi-byte integers are Big Endian.

use uuid::Uuid;

use crate::error::{Error, Result};

/// Header size in bytes (fixed, exactly 25).
pub const HEADER_SIZE: usize = 25;

/// Bytes before the length-counted region (version + length).
pub const PREFIX_SIZE: usize = 4;

/// Bytes counted by `length` that belong to the header.
pub const COUNTED_HEADER_SIZE: u32 = (HEADER_SIZE - PREFIX_SIZE) as u32;

/// Largest value the 24-bit length field can carry.
pub const MAX_LENGTH: u32 = 0x00FF_FFFF;

/// Largest payload a single frame can carry.
pub const ABSOLUTE_MAX_PAYLOAD_SIZE: u32 = MAX_LENGTH - COUNTED_HEADER_SIZE;

/// Default maximum payload size accepted by a frame buffer (8 MB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 8 * 1024 * 1024;

/// Calls, cancel and call responses only.
pub const VERSION_1: u8 = 1;

/// Adds async parameters and streaming.
pub const VERSION_2: u8 = 2;

/// Highest version this implementation understands. Also what we write.
pub const MAX_VERSION: u8 = VERSION_2;

/// Command byte of a frame.
///
/// Requests flow towards the exporting side, responses towards the caller.
/// Request and response are not paired one-to-one: fire-and-forget calls get
/// nothing back and streaming calls get many frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Invoke, response expected.
    CallWithReturn = 1,
    /// Invoke, fire-and-forget.
    CallWithoutReturn = 2,
    /// Cancel the in-flight call with this call id.
    Cancel = 3,
    /// Resolve an async argument of a dispatched call with a value.
    AsyncParamData = 4,
    /// Resolve an async argument of a dispatched call with a failure.
    AsyncParamFailure = 5,
    /// Start receiving data for a stream.
    ClientOpen = 6,
    /// Stop a stream.
    ClientClose = 7,
    /// Grant stream credit (negative stops the stream).
    ClientBackPressure = 8,

    /// Call result value.
    Success = 64,
    /// Call raised an application failure.
    Failure = 65,
    /// No service under this id.
    NoService = 66,
    /// Method index out of range.
    NoMethod = 67,
    /// Arguments could not be decoded.
    ArgsSerializationError = 68,
    /// Return value could not be encoded.
    ReturnSerializationError = 69,
    /// Failure could not be encoded.
    FailureSerializationError = 70,
    /// Unclassified error.
    UnknownError = 71,
    /// Worker pool saturated.
    ServerOverloaded = 72,
    /// Async argument frame could not be processed.
    AsyncParamError = 73,
    /// One stream element.
    StreamData = 80,
    /// Stream ended normally.
    StreamClose = 81,
    /// Stream ended abnormally.
    StreamError = 82,
}

impl Command {
    /// Parse a command byte.
    pub fn from_u8(value: u8) -> Result<Self> {
        let command = match value {
            1 => Command::CallWithReturn,
            2 => Command::CallWithoutReturn,
            3 => Command::Cancel,
            4 => Command::AsyncParamData,
            5 => Command::AsyncParamFailure,
            6 => Command::ClientOpen,
            7 => Command::ClientClose,
            8 => Command::ClientBackPressure,
            64 => Command::Success,
            65 => Command::Failure,
            66 => Command::NoService,
            67 => Command::NoMethod,
            68 => Command::ArgsSerializationError,
            69 => Command::ReturnSerializationError,
            70 => Command::FailureSerializationError,
            71 => Command::UnknownError,
            72 => Command::ServerOverloaded,
            73 => Command::AsyncParamError,
            80 => Command::StreamData,
            81 => Command::StreamClose,
            82 => Command::StreamError,
            other => return Err(Error::UnknownCommand(other)),
        };
        Ok(command)
    }

    /// Wire value.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Check if this command travels towards the exporting side.
    #[inline]
    pub fn is_request(self) -> bool {
        (self as u8) < 64
    }

    /// Lowest protocol version allowed to carry this command.
    pub fn min_version(self) -> u8 {
        match self {
            Command::AsyncParamData
            | Command::AsyncParamFailure
            | Command::ClientOpen
            | Command::ClientClose
            | Command::ClientBackPressure
            | Command::AsyncParamError
            | Command::StreamData
            | Command::StreamClose
            | Command::StreamError => VERSION_2,
            _ => VERSION_1,
        }
    }

    /// Check if the payload is a short human-readable message.
    pub fn is_error_class(self) -> bool {
        matches!(
            self,
            Command::NoService
                | Command::NoMethod
                | Command::ArgsSerializationError
                | Command::ReturnSerializationError
                | Command::FailureSerializationError
                | Command::UnknownError
                | Command::ServerOverloaded
                | Command::AsyncParamError
                | Command::StreamError
        )
    }
}

/// Lookup key for in-flight invocations and open streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Exported service instance.
    pub service_id: Uuid,
    /// Caller-chosen correlation token.
    pub call_id: i32,
}

impl CacheKey {
    /// Create a new key.
    pub fn new(service_id: Uuid, call_id: i32) -> Self {
        Self {
            service_id,
            call_id,
        }
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version (1..=MAX_VERSION).
    pub version: u8,
    /// Frame command.
    pub command: Command,
    /// Target or originating service.
    pub service_id: Uuid,
    /// Correlation token.
    pub call_id: i32,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header at the current protocol version.
    pub fn new(command: Command, service_id: Uuid, call_id: i32, payload_length: u32) -> Self {
        Self {
            version: MAX_VERSION,
            command,
            service_id,
            call_id,
            payload_length,
        }
    }

    /// The `(service_id, call_id)` pair this frame belongs to.
    #[inline]
    pub fn key(&self) -> CacheKey {
        CacheKey::new(self.service_id, self.call_id)
    }

    /// Value of the 24-bit length field.
    #[inline]
    pub fn length_field(&self) -> u32 {
        COUNTED_HEADER_SIZE + self.payload_length
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use remotewire::protocol::{Command, Header, HEADER_SIZE};
    /// use uuid::Uuid;
    ///
    /// let header = Header::new(Command::Success, Uuid::nil(), 42, 100);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), HEADER_SIZE);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (25 bytes).
    ///
    /// The length field keeps only 24 bits. Frames above
    /// [`ABSOLUTE_MAX_PAYLOAD_SIZE`] are refused by the writer before they
    /// reach the socket.
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        let length = self.length_field().to_be_bytes();
        let (msb, lsb) = self.service_id.as_u64_pair();

        buf[0] = self.version;
        buf[1..4].copy_from_slice(&length[1..4]);
        buf[4] = self.command.as_u8();
        buf[5..13].copy_from_slice(&msb.to_be_bytes());
        buf[13..21].copy_from_slice(&lsb.to_be_bytes());
        buf[21..25].copy_from_slice(&self.call_id.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// The version byte is checked first, before anything else is looked at,
    /// so a frame from a newer peer is rejected even if it is truncated.
    /// Returns `Ok(None)` if the buffer does not yet hold a full header.
    ///
    /// # Example
    ///
    /// ```
    /// use remotewire::protocol::{Command, Header};
    /// use uuid::Uuid;
    ///
    /// let original = Header::new(Command::CallWithReturn, Uuid::from_u128(7), 42, 3);
    /// let header = Header::decode(&original.encode()).unwrap().unwrap();
    /// assert_eq!(header.call_id, 42);
    /// assert_eq!(header.payload_length, 3);
    /// ```
    pub fn decode(buf: &[u8]) -> Result<Option<Self>> {
        let Some(&version) = buf.first() else {
            return Ok(None);
        };
        check_version(version)?;

        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([0, buf[1], buf[2], buf[3]]);
        if length < COUNTED_HEADER_SIZE {
            return Err(Error::CorruptedFrame(format!(
                "Length {} is shorter than the header",
                length
            )));
        }

        let command = Command::from_u8(buf[4])?;
        if version < command.min_version() {
            return Err(Error::Protocol(format!(
                "Command {:?} requires version {}, frame has version {}",
                command,
                command.min_version(),
                version
            )));
        }

        let msb = u64::from_be_bytes(to_array(&buf[5..13]));
        let lsb = u64::from_be_bytes(to_array(&buf[13..21]));
        let call_id = i32::from_be_bytes([buf[21], buf[22], buf[23], buf[24]]);

        Ok(Some(Self {
            version,
            command,
            service_id: Uuid::from_u64_pair(msb, lsb),
            call_id,
            payload_length: length - COUNTED_HEADER_SIZE,
        }))
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Version is understood
    /// - Payload length doesn't exceed max
    /// - Command is allowed at this version
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        check_version(self.version)?;

        if self.payload_length > max_payload_size.min(ABSOLUTE_MAX_PAYLOAD_SIZE) {
            return Err(Error::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }

        if self.version < self.command.min_version() {
            return Err(Error::Protocol(format!(
                "Command {:?} not allowed at version {}",
                self.command, self.version
            )));
        }

        Ok(())
    }

    /// Check if this is a request (towards the exporting side).
    #[inline]
    pub fn is_request(&self) -> bool {
        self.command.is_request()
    }
}

fn check_version(version: u8) -> Result<()> {
    if version == 0 || version > MAX_VERSION {
        return Err(Error::CorruptedFrame(format!(
            "Unsupported protocol version {} (max {})",
            version, MAX_VERSION
        )));
    }
    Ok(())
}

#[inline]
fn to_array(slice: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(slice);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> Uuid {
        Uuid::from_u128(0x0102_0304_0506_0708_090A_0B0C_0D0E_0F10)
    }

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::new(Command::CallWithReturn, service(), -7, 100);
        let encoded = original.encode();
        let decoded = Header::decode(&encoded).unwrap().unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_byte_layout() {
        let header = Header::new(Command::Success, service(), 0x0A0B0C0D, 0x10);
        let bytes = header.encode();

        assert_eq!(bytes[0], MAX_VERSION);
        // Length: 21 + 16 = 37 as u24 BE
        assert_eq!(&bytes[1..4], &[0x00, 0x00, 37]);
        assert_eq!(bytes[4], 64);
        // Service id, msb first
        assert_eq!(bytes[5], 0x01);
        assert_eq!(bytes[12], 0x08);
        assert_eq!(bytes[13], 0x09);
        assert_eq!(bytes[20], 0x10);
        // Call id
        assert_eq!(&bytes[21..25], &[0x0A, 0x0B, 0x0C, 0x0D]);
    }

    #[test]
    fn test_header_size_is_exactly_25() {
        assert_eq!(HEADER_SIZE, 25);
        let header = Header::new(Command::Cancel, Uuid::nil(), 1, 0);
        assert_eq!(header.encode().len(), 25);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let header = Header::new(Command::Cancel, Uuid::nil(), 1, 0);
        let bytes = header.encode();
        assert!(Header::decode(&bytes[..24]).unwrap().is_none());
        assert!(Header::decode(&[]).unwrap().is_none());
    }

    #[test]
    fn test_version_rejected_before_length() {
        // A single byte with an unknown version is enough to reject.
        let err = Header::decode(&[3]).unwrap_err();
        assert!(matches!(err, Error::CorruptedFrame(_)));

        let err = Header::decode(&[0, 0xFF, 0xFF]).unwrap_err();
        assert!(matches!(err, Error::CorruptedFrame(_)));
    }

    #[test]
    fn test_short_length_is_corrupted() {
        let mut bytes = Header::new(Command::Cancel, Uuid::nil(), 1, 0).encode();
        bytes[3] = 5;
        assert!(matches!(
            Header::decode(&bytes),
            Err(Error::CorruptedFrame(_))
        ));
    }

    #[test]
    fn test_unknown_command() {
        let mut bytes = Header::new(Command::Cancel, Uuid::nil(), 1, 0).encode();
        bytes[4] = 200;
        assert!(matches!(
            Header::decode(&bytes),
            Err(Error::UnknownCommand(200))
        ));
    }

    #[test]
    fn test_version_one_rejects_streaming_commands() {
        let mut header = Header::new(Command::ClientOpen, Uuid::nil(), 1, 0);
        header.version = VERSION_1;
        let bytes = header.encode();
        assert!(matches!(Header::decode(&bytes), Err(Error::Protocol(_))));

        let mut call = Header::new(Command::CallWithReturn, Uuid::nil(), 1, 0);
        call.version = VERSION_1;
        assert_eq!(Header::decode(&call.encode()).unwrap().unwrap(), call);
    }

    #[test]
    fn test_validate_payload_too_large() {
        let header = Header::new(Command::Success, Uuid::nil(), 1, 1_000);
        let result = header.validate(100);
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_command_classification() {
        assert!(Command::CallWithReturn.is_request());
        assert!(Command::ClientBackPressure.is_request());
        assert!(!Command::Success.is_request());
        assert!(Command::NoMethod.is_error_class());
        assert!(Command::StreamError.is_error_class());
        assert!(!Command::Failure.is_error_class());
        assert!(!Command::StreamData.is_error_class());
    }

    #[test]
    fn test_command_from_u8_covers_alphabet() {
        for byte in 0u8..=255 {
            if let Ok(command) = Command::from_u8(byte) {
                assert_eq!(command.as_u8(), byte);
            }
        }
        assert!(Command::from_u8(0).is_err());
    }

    #[test]
    fn test_cache_key_equality() {
        let a = CacheKey::new(service(), 5);
        let b = CacheKey::new(service(), 5);
        let c = CacheKey::new(service(), 6);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(Header::new(Command::Cancel, service(), 5, 0).key(), a);
    }
}
