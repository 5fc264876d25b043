use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};

use crate::endpoint::{EndpointProtocol, EndpointSpec};
use crate::transport::tcp::ProxyPrologue;
use crate::transport::{TcpTransport, Transport, UdpTransport};
use crate::{LocalError, TransportError};

/// A single resolved address, ready to produce a transport.
///
/// The resolver emits one connector per usable address, already ordered
/// by the selection policy; the outgoing connection factory walks the
/// list until one connects.
#[derive(Debug)]
pub(crate) struct Connector {
    pub addr: SocketAddr,
    pub spec: EndpointSpec,
    pub prologue: Option<ProxyPrologue>,
}

impl Connector {
    /// Start a non-blocking connect; completion is driven through the
    /// transport's `initialize` by the thread pool.
    pub fn connect(&self) -> Result<Box<dyn Transport>, LocalError> {
        match self.spec.protocol {
            EndpointProtocol::Tcp => self.connect_tcp(),
            EndpointProtocol::Udp => self.connect_udp(),
        }
    }

    fn connect_tcp(&self) -> Result<Box<dyn Transport>, LocalError> {
        let domain = Domain::for_address(self.addr);
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(TransportError::ConnectFailed)?;
        socket
            .set_nonblocking(true)
            .map_err(TransportError::ConnectFailed)?;
        socket.set_nodelay(true).map_err(TransportError::ConnectFailed)?;
        if let Some(source) = self.spec.source_address {
            let bind_addr = SocketAddr::new(source, 0);
            socket
                .bind(&bind_addr.into())
                .map_err(TransportError::ConnectFailed)?;
        }
        match socket.connect(&self.addr.into()) {
            Ok(()) => {}
            Err(e) if in_progress(&e) => {}
            Err(e) => return Err(TransportError::ConnectFailed(e).into()),
        }
        let stream = mio::net::TcpStream::from_std(socket.into());
        Ok(Box::new(TcpTransport::connecting(
            stream,
            self.addr,
            self.prologue.clone(),
        )))
    }

    fn connect_udp(&self) -> Result<Box<dyn Transport>, LocalError> {
        let domain = Domain::for_address(self.addr);
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(TransportError::ConnectFailed)?;
        socket
            .set_nonblocking(true)
            .map_err(TransportError::ConnectFailed)?;
        if let Some(source) = self.spec.source_address {
            let bind_addr = SocketAddr::new(source, 0);
            socket
                .bind(&bind_addr.into())
                .map_err(TransportError::ConnectFailed)?;
        }
        socket
            .connect(&self.addr.into())
            .map_err(TransportError::ConnectFailed)?;
        let socket = mio::net::UdpSocket::from_std(socket.into());
        Ok(Box::new(UdpTransport::client(socket, self.addr)))
    }

    /// Connection-partitioning key: same transport target, same tunnel.
    pub fn key(&self) -> String {
        match &self.prologue {
            None => format!("{}/{}", self.spec.protocol.keyword(), self.addr),
            Some(ProxyPrologue::Socks4 { target }) => {
                format!("{}/{}+socks/{}", self.spec.protocol.keyword(), self.addr, target)
            }
            Some(ProxyPrologue::HttpConnect { host, port }) => {
                format!("{}/{}+http/{host}:{port}", self.spec.protocol.keyword(), self.addr)
            }
        }
    }
}

fn in_progress(e: &std::io::Error) -> bool {
    // EINPROGRESS is the normal answer to a non-blocking connect; the
    // raw values cover Linux, the BSDs and Windows (WSAEWOULDBLOCK).
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::NotConnected
    ) || matches!(e.raw_os_error(), Some(115) | Some(36) | Some(10035) | Some(10036))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_key_distinguishes_tunnels() {
        let spec = EndpointSpec::new(EndpointProtocol::Tcp, "example.com", 80);
        let addr: SocketAddr = "192.0.2.1:80".parse().unwrap();
        let direct = Connector { addr, spec: spec.clone(), prologue: None };
        let tunneled = Connector {
            addr,
            spec,
            prologue: Some(ProxyPrologue::HttpConnect {
                host: "example.com".into(),
                port: 80,
            }),
        };
        assert_ne!(direct.key(), tunneled.key());
    }
}
