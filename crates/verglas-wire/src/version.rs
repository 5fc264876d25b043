use std::fmt;

/// Protocol version carried in every frame header.
///
/// Only protocol 1.0 exists on the wire today; anything else is rejected
/// during connection validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

/// The protocol version this runtime speaks.
pub const PROTOCOL_1_0: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

impl ProtocolVersion {
    /// Whether this peer can talk to a peer advertising `self`.
    pub fn is_supported(self) -> bool {
        self == PROTOCOL_1_0
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Encoding version of an encapsulation or frame payload.
///
/// The connection uses the header's encoding version for the frame while
/// each encapsulation carries its own, possibly different, version. Both
/// sides must tolerate the asymmetry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EncodingVersion {
    pub major: u8,
    pub minor: u8,
}

/// The 1.0 encoding: no tagged members, table-based class references.
pub const ENCODING_1_0: EncodingVersion = EncodingVersion { major: 1, minor: 0 };

/// The 1.1 encoding: inline class instances, tagged members, slice flags.
pub const ENCODING_1_1: EncodingVersion = EncodingVersion { major: 1, minor: 1 };

impl EncodingVersion {
    /// The runtime recognizes exactly 1.0 and 1.1.
    pub fn is_supported(self) -> bool {
        self == ENCODING_1_0 || self == ENCODING_1_1
    }

    /// Parse an `M.m` version string, as found in proxy strings (`-e 1.1`).
    pub fn parse(s: &str) -> Option<Self> {
        let (major, minor) = s.split_once('.')?;
        Some(EncodingVersion {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }
}

impl fmt::Display for EncodingVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_encodings() {
        assert!(ENCODING_1_0.is_supported());
        assert!(ENCODING_1_1.is_supported());
        assert!(!EncodingVersion { major: 1, minor: 2 }.is_supported());
        assert!(!EncodingVersion { major: 2, minor: 0 }.is_supported());
    }

    #[test]
    fn encoding_parse() {
        assert_eq!(EncodingVersion::parse("1.1"), Some(ENCODING_1_1));
        assert_eq!(EncodingVersion::parse("1.0"), Some(ENCODING_1_0));
        assert_eq!(EncodingVersion::parse("1"), None);
        assert_eq!(EncodingVersion::parse("x.y"), None);
    }

    #[test]
    fn version_display() {
        assert_eq!(PROTOCOL_1_0.to_string(), "1.0");
        assert_eq!(ENCODING_1_1.to_string(), "1.1");
    }
}
