use std::fmt;
use std::io;

use verglas_wire::{EncodingVersion, Identity, ProtocolVersion, ReplyStatus};

pub use verglas_codec::EncodingError;

/// Violations of the framing and message rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    BadMagic([u8; 4]),
    UnsupportedProtocol(ProtocolVersion),
    UnsupportedEncoding(EncodingVersion),
    /// Frame size below the header size or above `MessageSizeMax`.
    IllegalMessageSize(i32),
    UnknownMessageType(u8),
    UnknownReplyStatus(u8),
    /// A compressed frame arrived and no compressor is available, or the
    /// compression status byte is out of range.
    CompressionNotSupported(u8),
    /// The application closed the connection while the request was in
    /// flight; `graceful` distinguishes drain from abort.
    ConnectionManuallyClosed { graceful: bool },
    /// The peer announced a graceful close.
    CloseConnection,
    /// A reply or message violated the correlation rules (unknown request
    /// id, validation mismatch, garbled frame).
    Violation(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::BadMagic(m) => write!(f, "bad frame magic: {m:02x?}"),
            ProtocolError::UnsupportedProtocol(v) => {
                write!(f, "unsupported protocol version: {v}")
            }
            ProtocolError::UnsupportedEncoding(v) => {
                write!(f, "unsupported encoding version: {v}")
            }
            ProtocolError::IllegalMessageSize(sz) => write!(f, "illegal message size: {sz}"),
            ProtocolError::UnknownMessageType(t) => write!(f, "unknown message type: {t}"),
            ProtocolError::UnknownReplyStatus(s) => write!(f, "unknown reply status: {s}"),
            ProtocolError::CompressionNotSupported(s) => {
                write!(f, "compressed message not supported (status {s})")
            }
            ProtocolError::ConnectionManuallyClosed { graceful } => write!(
                f,
                "connection manually closed ({})",
                if *graceful { "gracefully" } else { "forcefully" }
            ),
            ProtocolError::CloseConnection => f.write_str("connection closed by peer"),
            ProtocolError::Violation(reason) => write!(f, "protocol violation: {reason}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Socket-level failures.
#[derive(Debug)]
pub enum TransportError {
    ConnectFailed(io::Error),
    ConnectTimeout,
    /// Closed by activity-based connection management after the idle
    /// timeout elapsed.
    ConnectionTimeout,
    /// The peer went away without a graceful close.
    ConnectionLost(Option<io::Error>),
    Socket(io::Error),
    Dns { host: String, error: String },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::ConnectFailed(e) => write!(f, "connect failed: {e}"),
            TransportError::ConnectTimeout => f.write_str("connect timed out"),
            TransportError::ConnectionTimeout => f.write_str("connection timed out"),
            TransportError::ConnectionLost(Some(e)) => write!(f, "connection lost: {e}"),
            TransportError::ConnectionLost(None) => f.write_str("connection lost"),
            TransportError::Socket(e) => write!(f, "socket error: {e}"),
            TransportError::Dns { host, error } => {
                write!(f, "could not resolve `{host}`: {error}")
            }
        }
    }
}

impl std::error::Error for TransportError {}

/// Failures of a single invocation that leave the connection healthy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvocationError {
    ObjectNotExist { identity: Identity, facet: String, operation: String },
    FacetNotExist { identity: Identity, facet: String, operation: String },
    OperationNotExist { identity: Identity, facet: String, operation: String },
    /// The reply did not arrive within `invocation_timeout`.
    InvocationTimeout,
    /// The caller cancelled before the reply arrived.
    InvocationCanceled,
    /// A twoway-only operation was invoked on a oneway or datagram proxy.
    TwowayOnly { operation: String },
    /// The server reported a failure it could not classify further.
    UnknownException { kind: ReplyStatus, message: String },
    /// No endpoint was usable for the proxy's requirements.
    NoEndpoint { proxy: String },
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationError::ObjectNotExist { identity, facet, operation } => {
                write!(f, "object does not exist: {identity} -f {facet} {operation}")
            }
            InvocationError::FacetNotExist { identity, facet, operation } => {
                write!(f, "facet does not exist: {identity} -f {facet} {operation}")
            }
            InvocationError::OperationNotExist { identity, facet, operation } => {
                write!(f, "operation does not exist: {identity} -f {facet} {operation}")
            }
            InvocationError::InvocationTimeout => f.write_str("invocation timed out"),
            InvocationError::InvocationCanceled => f.write_str("invocation canceled"),
            InvocationError::TwowayOnly { operation } => {
                write!(f, "operation `{operation}` requires a twoway proxy")
            }
            InvocationError::UnknownException { kind, message } => {
                write!(f, "{kind}: {message}")
            }
            InvocationError::NoEndpoint { proxy } => {
                write!(f, "no usable endpoint for proxy `{proxy}`")
            }
        }
    }
}

impl std::error::Error for InvocationError {}

/// Failures caused by the runtime shutting down around the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifecycleError {
    CommunicatorDestroyed,
    ObjectAdapterDeactivated { name: String },
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleError::CommunicatorDestroyed => f.write_str("communicator destroyed"),
            LifecycleError::ObjectAdapterDeactivated { name } => {
                write!(f, "object adapter `{name}` deactivated")
            }
        }
    }
}

impl std::error::Error for LifecycleError {}

/// Any runtime-produced failure; the taxonomy an invocation can surface.
#[derive(Debug)]
pub enum LocalError {
    Encoding(EncodingError),
    Protocol(ProtocolError),
    Transport(TransportError),
    Invocation(InvocationError),
    Lifecycle(LifecycleError),
    /// A requested capability is not built into this runtime.
    FeatureNotSupported(String),
    /// Endpoint or proxy string could not be parsed.
    ParseError(String),
}

impl fmt::Display for LocalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalError::Encoding(e) => e.fmt(f),
            LocalError::Protocol(e) => e.fmt(f),
            LocalError::Transport(e) => e.fmt(f),
            LocalError::Invocation(e) => e.fmt(f),
            LocalError::Lifecycle(e) => e.fmt(f),
            LocalError::FeatureNotSupported(what) => {
                write!(f, "feature not supported: {what}")
            }
            LocalError::ParseError(reason) => write!(f, "parse error: {reason}"),
        }
    }
}

impl std::error::Error for LocalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LocalError::Encoding(e) => Some(e),
            LocalError::Protocol(e) => Some(e),
            LocalError::Transport(e) => Some(e),
            LocalError::Invocation(e) => Some(e),
            LocalError::Lifecycle(e) => Some(e),
            _ => None,
        }
    }
}

impl From<EncodingError> for LocalError {
    fn from(e: EncodingError) -> Self {
        LocalError::Encoding(e)
    }
}

impl From<ProtocolError> for LocalError {
    fn from(e: ProtocolError) -> Self {
        LocalError::Protocol(e)
    }
}

impl From<TransportError> for LocalError {
    fn from(e: TransportError) -> Self {
        LocalError::Transport(e)
    }
}

impl From<InvocationError> for LocalError {
    fn from(e: InvocationError) -> Self {
        LocalError::Invocation(e)
    }
}

impl From<LifecycleError> for LocalError {
    fn from(e: LifecycleError) -> Self {
        LocalError::Lifecycle(e)
    }
}

impl LocalError {
    /// Whether the retry policy may consider another attempt at all.
    /// Non-idempotent operations additionally require that the request
    /// was never handed to the peer.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LocalError::Transport(TransportError::ConnectFailed(_))
                | LocalError::Transport(TransportError::ConnectionLost(_))
                | LocalError::Protocol(ProtocolError::CloseConnection)
        )
    }

    /// Clone-ish duplication for fan-out to several waiters. `io::Error`
    /// does not implement `Clone`, so the io detail degrades to text.
    pub fn duplicate(&self) -> LocalError {
        match self {
            LocalError::Encoding(e) => LocalError::Encoding(e.clone()),
            LocalError::Protocol(e) => LocalError::Protocol(e.clone()),
            LocalError::Transport(e) => LocalError::Transport(match e {
                TransportError::ConnectFailed(io) => {
                    TransportError::ConnectFailed(io::Error::new(io.kind(), io.to_string()))
                }
                TransportError::ConnectTimeout => TransportError::ConnectTimeout,
                TransportError::ConnectionTimeout => TransportError::ConnectionTimeout,
                TransportError::ConnectionLost(io) => TransportError::ConnectionLost(
                    io.as_ref().map(|io| io::Error::new(io.kind(), io.to_string())),
                ),
                TransportError::Socket(io) => {
                    TransportError::Socket(io::Error::new(io.kind(), io.to_string()))
                }
                TransportError::Dns { host, error } => {
                    TransportError::Dns { host: host.clone(), error: error.clone() }
                }
            }),
            LocalError::Invocation(e) => LocalError::Invocation(e.clone()),
            LocalError::Lifecycle(e) => LocalError::Lifecycle(e.clone()),
            LocalError::FeatureNotSupported(s) => LocalError::FeatureNotSupported(s.clone()),
            LocalError::ParseError(s) => LocalError::ParseError(s.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(LocalError::from(TransportError::ConnectFailed(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "refused"
        )))
        .is_retryable());
        assert!(LocalError::from(ProtocolError::CloseConnection).is_retryable());
        assert!(!LocalError::from(InvocationError::InvocationTimeout).is_retryable());
        assert!(!LocalError::from(InvocationError::InvocationCanceled).is_retryable());
        assert!(!LocalError::from(LifecycleError::CommunicatorDestroyed).is_retryable());
    }

    #[test]
    fn duplicate_keeps_kind() {
        let original = LocalError::Transport(TransportError::ConnectFailed(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "refused",
        )));
        match original.duplicate() {
            LocalError::Transport(TransportError::ConnectFailed(e)) => {
                assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused);
            }
            other => panic!("unexpected duplicate: {other}"),
        }
    }
}
