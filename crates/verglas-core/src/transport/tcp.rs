use std::io::{self, Read, Write};
use std::net::SocketAddr;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use super::{InitStatus, Transport};

/// Tunnel handshake written before any payload when a network proxy is
/// configured between us and the target.
#[derive(Clone, Debug)]
pub enum ProxyPrologue {
    /// SOCKS4 CONNECT to an IPv4 target.
    Socks4 { target: SocketAddr },
    /// HTTP `CONNECT host:port` with a 200 response expected.
    HttpConnect { host: String, port: u16 },
}

enum HandshakeState {
    Connecting,
    /// Prologue bytes queued, `sent` of them written so far.
    SendPrologue { bytes: Vec<u8>, sent: usize, kind: PrologueKind },
    RecvResponse { kind: PrologueKind, received: Vec<u8> },
    Ready,
}

#[derive(Clone, Copy)]
enum PrologueKind {
    Socks4,
    Http,
}

/// TCP stream transport.
pub struct TcpTransport {
    stream: TcpStream,
    state: HandshakeState,
    prologue: Option<ProxyPrologue>,
    desc: String,
}

impl TcpTransport {
    /// Wrap a stream with a non-blocking connect in flight.
    pub fn connecting(stream: TcpStream, peer: SocketAddr, prologue: Option<ProxyPrologue>) -> Self {
        TcpTransport {
            stream,
            state: HandshakeState::Connecting,
            prologue,
            desc: format!("tcp -h {} -p {}", peer.ip(), peer.port()),
        }
    }

    /// Wrap an accepted (already connected) stream.
    pub fn accepted(stream: TcpStream, peer: SocketAddr) -> Self {
        TcpTransport {
            stream,
            state: HandshakeState::Ready,
            prologue: None,
            desc: format!("tcp -h {} -p {} (incoming)", peer.ip(), peer.port()),
        }
    }

    fn connect_finished(&mut self) -> io::Result<bool> {
        // A non-blocking connect resolves to writable; the error, if any,
        // surfaces through take_error / peer_addr.
        if let Some(e) = self.stream.take_error()? {
            return Err(e);
        }
        match self.stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(e)
                if e.kind() == io::ErrorKind::NotConnected
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn prologue_bytes(prologue: &ProxyPrologue) -> (Vec<u8>, PrologueKind) {
        match prologue {
            ProxyPrologue::Socks4 { target } => {
                let mut bytes = vec![4u8, 1u8];
                bytes.extend_from_slice(&target.port().to_be_bytes());
                match target.ip() {
                    std::net::IpAddr::V4(ip) => bytes.extend_from_slice(&ip.octets()),
                    std::net::IpAddr::V6(_) => {
                        // The resolver never hands a V6 target to a SOCKS4
                        // proxy; encode the reserved invalid address.
                        bytes.extend_from_slice(&[0, 0, 0, 1]);
                    }
                }
                bytes.push(0); // Empty user id.
                (bytes, PrologueKind::Socks4)
            }
            ProxyPrologue::HttpConnect { host, port } => (
                format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n")
                    .into_bytes(),
                PrologueKind::Http,
            ),
        }
    }

    fn response_complete(kind: PrologueKind, received: &[u8]) -> io::Result<bool> {
        match kind {
            PrologueKind::Socks4 => {
                if received.len() < 8 {
                    return Ok(false);
                }
                // Reply code 90 is "request granted".
                if received[1] != 90 {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        format!("SOCKS proxy refused the tunnel (code {})", received[1]),
                    ));
                }
                Ok(true)
            }
            PrologueKind::Http => {
                let Some(end) = received.windows(4).position(|w| w == b"\r\n\r\n") else {
                    return Ok(false);
                };
                let head = String::from_utf8_lossy(&received[..end]);
                let ok = head
                    .split_whitespace()
                    .nth(1)
                    .is_some_and(|code| code.starts_with('2'));
                if !ok {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        format!("HTTP proxy refused the tunnel: {}", head.lines().next().unwrap_or("")),
                    ));
                }
                Ok(true)
            }
        }
    }
}

impl Transport for TcpTransport {
    fn initialize(&mut self) -> io::Result<InitStatus> {
        loop {
            match &mut self.state {
                HandshakeState::Connecting => {
                    if !self.connect_finished()? {
                        return Ok(InitStatus::NeedWrite);
                    }
                    self.state = match self.prologue.take() {
                        Some(prologue) => {
                            let (bytes, kind) = Self::prologue_bytes(&prologue);
                            HandshakeState::SendPrologue { bytes, sent: 0, kind }
                        }
                        None => HandshakeState::Ready,
                    };
                }
                HandshakeState::SendPrologue { bytes, sent, kind } => {
                    while *sent < bytes.len() {
                        match self.stream.write(&bytes[*sent..]) {
                            Ok(n) => *sent += n,
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                return Ok(InitStatus::NeedWrite)
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    self.state =
                        HandshakeState::RecvResponse { kind: *kind, received: Vec::new() };
                }
                HandshakeState::RecvResponse { kind, received } => {
                    let kind = *kind;
                    loop {
                        if Self::response_complete(kind, received)? {
                            break;
                        }
                        let mut chunk = [0u8; 256];
                        match self.stream.read(&mut chunk) {
                            Ok(0) => {
                                return Err(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "proxy closed during tunnel handshake",
                                ))
                            }
                            Ok(n) => received.extend_from_slice(&chunk[..n]),
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                return Ok(InitStatus::NeedRead)
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    self.state = HandshakeState::Ready;
                }
                HandshakeState::Ready => return Ok(InitStatus::Done),
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        registry.register(&mut self.stream, token, interest)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        registry.reregister(&mut self.stream, token, interest)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    fn describe(&self) -> String {
        self.desc.clone()
    }
}
