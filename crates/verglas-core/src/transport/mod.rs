//! Transport backends. Each backend lives in its own module and
//! implements the internal [`Transport`] trait; the connection state
//! machine is written against the trait and never names a backend.

use std::io;

use mio::{Interest, Registry, Token};

pub mod tcp;
pub mod udp;

pub use tcp::TcpTransport;
pub use udp::UdpTransport;

/// Outcome of one [`Transport::initialize`] step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitStatus {
    /// Connected and any tunnel prologue exchanged.
    Done,
    NeedRead,
    NeedWrite,
}

/// Byte-stream or datagram endpoint of one connection.
///
/// All calls are non-blocking: `read` and `write` return
/// `io::ErrorKind::WouldBlock` when the socket has nothing to offer, and
/// the connection re-arms selector interest instead of spinning.
pub(crate) trait Transport: Send {
    /// Drive connection establishment (and a configured proxy tunnel
    /// handshake) forward. Call again on the indicated readiness until it
    /// reports [`InitStatus::Done`].
    fn initialize(&mut self) -> io::Result<InitStatus>;

    /// Read available bytes. For datagram transports a single call
    /// returns a whole datagram; `Ok(0)` on a stream means the peer
    /// closed its half.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn close(&mut self);

    fn is_datagram(&self) -> bool {
        false
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn register(&mut self, registry: &Registry, token: Token, interest: Interest)
        -> io::Result<()>;

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()>;

    fn deregister(&mut self, registry: &Registry) -> io::Result<()>;

    fn describe(&self) -> String;
}
