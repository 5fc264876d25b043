use std::fmt;

use crate::{EncodingVersion, ProtocolVersion};

/// The four magic bytes opening every frame.
pub const MAGIC: [u8; 4] = *b"IceP";

/// Size of the fixed frame header, in bytes.
pub const HEADER_SIZE: usize = 14;

/// Kind of a frame, byte 8 of the header.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// A twoway or oneway request.
    Request = 0,
    /// A batch of oneway requests sharing one frame.
    BatchRequest = 1,
    /// The reply to a twoway request.
    Reply = 2,
    /// Connection validation, also reused as a zero-payload heartbeat.
    ValidateConnection = 3,
    /// Graceful close announcement.
    CloseConnection = 4,
}

impl MessageType {
    /// Convert from the wire byte. Returns `None` for unknown values.
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => MessageType::Request,
            1 => MessageType::BatchRequest,
            2 => MessageType::Reply,
            3 => MessageType::ValidateConnection,
            4 => MessageType::CloseConnection,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::Request => "request",
            MessageType::BatchRequest => "batch request",
            MessageType::Reply => "reply",
            MessageType::ValidateConnection => "validate connection",
            MessageType::CloseConnection => "close connection",
        };
        f.write_str(s)
    }
}

/// Compression status, byte 9 of the header.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompressionStatus {
    /// Sender cannot decompress.
    None = 0,
    /// Payload is not compressed but the sender accepts compressed frames.
    Supported = 1,
    /// Payload after the header is a raw deflate stream.
    Compressed = 2,
}

impl CompressionStatus {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => CompressionStatus::None,
            1 => CompressionStatus::Supported,
            2 => CompressionStatus::Compressed,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// The fixed 14-byte frame header.
///
/// ```text
/// offset  size  field
///   0      4    magic 'I' 'c' 'e' 'P'
///   4      2    protocol version (major, minor)
///   6      2    encoding version (major, minor)
///   8      1    message type
///   9      1    compression status
///  10      4    frame size, little-endian, header included
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub protocol: ProtocolVersion,
    pub encoding: EncodingVersion,
    pub message_type: MessageType,
    pub compression: CompressionStatus,
    /// Total frame size including these 14 bytes.
    pub size: i32,
}

/// Why a header failed to parse. The connection maps these onto its
/// protocol error taxonomy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeaderError {
    BadMagic([u8; 4]),
    UnsupportedProtocol(ProtocolVersion),
    UnsupportedEncoding(EncodingVersion),
    UnknownMessageType(u8),
    UnknownCompression(u8),
    IllegalSize(i32),
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderError::BadMagic(m) => write!(f, "bad frame magic: {m:02x?}"),
            HeaderError::UnsupportedProtocol(v) => write!(f, "unsupported protocol version: {v}"),
            HeaderError::UnsupportedEncoding(v) => write!(f, "unsupported encoding version: {v}"),
            HeaderError::UnknownMessageType(t) => write!(f, "unknown message type: {t}"),
            HeaderError::UnknownCompression(c) => write!(f, "unknown compression status: {c}"),
            HeaderError::IllegalSize(s) => write!(f, "illegal frame size: {s}"),
        }
    }
}

impl std::error::Error for HeaderError {}

impl MessageHeader {
    pub fn new(message_type: MessageType, encoding: EncodingVersion, size: i32) -> Self {
        MessageHeader {
            protocol: crate::PROTOCOL_1_0,
            encoding,
            message_type,
            compression: CompressionStatus::None,
            size,
        }
    }

    /// Serialize into the fixed wire layout.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut b = [0u8; HEADER_SIZE];
        b[0..4].copy_from_slice(&MAGIC);
        b[4] = self.protocol.major;
        b[5] = self.protocol.minor;
        b[6] = self.encoding.major;
        b[7] = self.encoding.minor;
        b[8] = self.message_type.as_u8();
        b[9] = self.compression.as_u8();
        b[10..14].copy_from_slice(&self.size.to_le_bytes());
        b
    }

    /// Parse and validate the fixed wire layout.
    ///
    /// The size is checked for the structural minimum only; the connection
    /// enforces its configured maximum separately.
    pub fn from_bytes(b: &[u8; HEADER_SIZE]) -> Result<Self, HeaderError> {
        let magic: [u8; 4] = [b[0], b[1], b[2], b[3]];
        if magic != MAGIC {
            return Err(HeaderError::BadMagic(magic));
        }
        let protocol = ProtocolVersion { major: b[4], minor: b[5] };
        if !protocol.is_supported() {
            return Err(HeaderError::UnsupportedProtocol(protocol));
        }
        let encoding = EncodingVersion { major: b[6], minor: b[7] };
        if !encoding.is_supported() {
            return Err(HeaderError::UnsupportedEncoding(encoding));
        }
        let message_type =
            MessageType::from_u8(b[8]).ok_or(HeaderError::UnknownMessageType(b[8]))?;
        let compression =
            CompressionStatus::from_u8(b[9]).ok_or(HeaderError::UnknownCompression(b[9]))?;
        let size = i32::from_le_bytes([b[10], b[11], b[12], b[13]]);
        if size < HEADER_SIZE as i32 {
            return Err(HeaderError::IllegalSize(size));
        }
        Ok(MessageHeader { protocol, encoding, message_type, compression, size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ENCODING_1_1;

    #[test]
    fn header_roundtrip() {
        let hdr = MessageHeader::new(MessageType::Request, ENCODING_1_1, 42);
        let bytes = hdr.to_bytes();
        assert_eq!(&bytes[0..4], b"IceP");
        assert_eq!(MessageHeader::from_bytes(&bytes).unwrap(), hdr);
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut bytes = MessageHeader::new(MessageType::Reply, ENCODING_1_1, 14).to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            MessageHeader::from_bytes(&bytes),
            Err(HeaderError::BadMagic(_))
        ));
    }

    #[test]
    fn header_rejects_unknown_message_type() {
        let mut bytes = MessageHeader::new(MessageType::Reply, ENCODING_1_1, 14).to_bytes();
        bytes[8] = 9;
        assert_eq!(
            MessageHeader::from_bytes(&bytes),
            Err(HeaderError::UnknownMessageType(9))
        );
    }

    #[test]
    fn header_rejects_undersized_frame() {
        let mut bytes = MessageHeader::new(MessageType::Reply, ENCODING_1_1, 14).to_bytes();
        bytes[10..14].copy_from_slice(&13i32.to_le_bytes());
        assert_eq!(
            MessageHeader::from_bytes(&bytes),
            Err(HeaderError::IllegalSize(13))
        );
    }

    #[test]
    fn size_is_little_endian() {
        let hdr = MessageHeader::new(MessageType::Request, ENCODING_1_1, 0x0102_0304);
        let bytes = hdr.to_bytes();
        assert_eq!(&bytes[10..14], &[0x04, 0x03, 0x02, 0x01]);
    }
}
