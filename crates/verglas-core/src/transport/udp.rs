use std::io;
use std::net::SocketAddr;

use mio::net::UdpSocket;
use mio::{Interest, Registry, Token};

use super::{InitStatus, Transport};

/// Datagram transport. One `read` returns one datagram, which must hold a
/// whole frame; writes that exceed the kernel's datagram limit fail the
/// message rather than fragmenting it.
pub struct UdpTransport {
    socket: UdpSocket,
    /// Set for client sockets connected to one peer; unset for a bound
    /// server socket, which replies to nobody.
    peer: Option<SocketAddr>,
    desc: String,
}

impl UdpTransport {
    pub fn client(socket: UdpSocket, peer: SocketAddr) -> Self {
        UdpTransport {
            socket,
            peer: Some(peer),
            desc: format!("udp -h {} -p {}", peer.ip(), peer.port()),
        }
    }

    pub fn server(socket: UdpSocket, bound: SocketAddr) -> Self {
        UdpTransport {
            socket,
            peer: None,
            desc: format!("udp -h {} -p {} (server)", bound.ip(), bound.port()),
        }
    }
}

impl Transport for UdpTransport {
    fn initialize(&mut self) -> io::Result<InitStatus> {
        // Datagram sockets have no connection establishment.
        Ok(InitStatus::Done)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.peer {
            Some(_) => self.socket.recv(buf),
            None => self.socket.recv_from(buf).map(|(n, _)| n),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.socket.send(buf)?;
        if n != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "datagram truncated by the kernel",
            ));
        }
        Ok(n)
    }

    fn close(&mut self) {
        // Dropping the socket closes it; nothing to flush.
    }

    fn is_datagram(&self) -> bool {
        true
    }

    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        registry.register(&mut self.socket, token, interest)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        registry.reregister(&mut self.socket, token, interest)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.socket)
    }

    fn describe(&self) -> String {
        self.desc.clone()
    }
}
