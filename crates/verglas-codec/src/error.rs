use std::fmt;

use verglas_wire::EncodingVersion;

/// Errors raised while marshaling or unmarshaling.
///
/// On the client side these fail the current invocation; on the server side
/// they additionally close the connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EncodingError {
    /// A read ran past the end of the buffer, or a length field was
    /// structurally impossible (negative size, sequence larger than the
    /// remaining bytes).
    UnmarshalOutOfBounds,
    /// Marshaling constraint violated: class graph too deep, cyclic data in
    /// a format that cannot express it, inconsistent slice state.
    Marshal(String),
    /// Encapsulation header or size did not line up with the bytes
    /// consumed.
    Encapsulation(String),
    /// The stream or an encapsulation advertised an encoding this runtime
    /// does not speak.
    UnsupportedEncoding(EncodingVersion),
    /// No factory produced an instance for a concrete type id and slicing
    /// was not possible.
    NoValueFactory { type_id: String },
    /// The injected string converter rejected a string.
    StringConversion(String),
}

impl fmt::Display for EncodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingError::UnmarshalOutOfBounds => {
                f.write_str("unmarshaling ran out of bounds")
            }
            EncodingError::Marshal(reason) => write!(f, "marshal error: {reason}"),
            EncodingError::Encapsulation(reason) => {
                write!(f, "encapsulation error: {reason}")
            }
            EncodingError::UnsupportedEncoding(v) => {
                write!(f, "unsupported encoding version: {v}")
            }
            EncodingError::NoValueFactory { type_id } => {
                write!(f, "no value factory for type id `{type_id}`")
            }
            EncodingError::StringConversion(reason) => {
                write!(f, "string conversion failed: {reason}")
            }
        }
    }
}

impl std::error::Error for EncodingError {}

impl EncodingError {
    pub(crate) fn marshal(reason: impl Into<String>) -> Self {
        EncodingError::Marshal(reason.into())
    }

    pub(crate) fn encaps(reason: impl Into<String>) -> Self {
        EncodingError::Encapsulation(reason.into())
    }
}
