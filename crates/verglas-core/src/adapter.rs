use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use mio::net::TcpListener;
use mio::{Interest, Registry, Token};
use parking_lot::{Condvar, Mutex};

use verglas_codec::{EncodingError, InputStream, OutputStream};
use verglas_wire::{EncodingVersion, Identity, OperationMode, ReplyStatus};

use crate::connection::{CloseMode, Connection, ConnectionConfig, IncomingDispatcher};
use crate::endpoint::{EndpointProtocol, EndpointSpec};
use crate::message::{Context, ParsedRequest};
use crate::reference::Reference;
use crate::selector::{EventHandler, Ready};
use crate::thread_pool::{ThreadPool, ThreadPoolCurrent};
use crate::timer::Timer;
use crate::transport::{TcpTransport, UdpTransport};
use crate::{LifecycleError, LocalError, ObjectPrx, TransportError};

/// Per-dispatch information handed to a servant.
pub struct Current {
    pub identity: Identity,
    pub facet: String,
    pub operation: String,
    pub mode: OperationMode,
    pub context: Context,
    /// Encoding of the enclosing request; replies use the same.
    pub encoding: EncodingVersion,
    pub adapter_name: String,
}

/// What a dispatch produced, wire-ready.
pub enum DispatchResult {
    /// The out-parameters encapsulation.
    Ok(Bytes),
    /// A marshaled user exception encapsulation.
    UserException(Bytes),
}

/// A local object implementation registered with an adapter.
///
/// `params` is positioned at the in-parameters encapsulation; the servant
/// opens it, reads its arguments, and builds its result with the helpers
/// on [`Current`].
pub trait Servant: Send + Sync {
    fn dispatch(
        &self,
        current: &Current,
        params: &mut InputStream,
    ) -> Result<DispatchResult, LocalError>;
}

impl Current {
    /// Start the out-parameters (or exception) encapsulation.
    pub fn reply_stream(&self) -> OutputStream {
        let mut out = OutputStream::new(self.encoding);
        // Errors only arise for unsupported versions, checked on receive.
        let _ = out.start_encapsulation();
        out
    }

    /// Finish a stream from [`Current::reply_stream`].
    pub fn finish_reply(&self, mut out: OutputStream) -> Result<Bytes, LocalError> {
        out.end_encapsulation()?;
        Ok(out.finished())
    }

    /// An empty out-parameters encapsulation.
    pub fn empty_reply(&self) -> Bytes {
        let mut out = OutputStream::new(self.encoding);
        let _ = out.write_empty_encapsulation(self.encoding);
        out.finished()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum AdapterPhase {
    Created,
    Active,
    Holding,
    Deactivated,
    Destroyed,
}

struct AdapterState {
    phase: AdapterPhase,
    servants: HashMap<(Identity, String), Arc<dyn Servant>>,
    /// Endpoints to advertise in proxies, fixed once activated.
    published: Vec<EndpointSpec>,
    acceptors: Vec<(Token, Arc<Acceptor>)>,
    connections: Vec<Arc<Connection>>,
}

/// Accepts inbound connections and demultiplexes requests to servants
/// registered under (identity, facet).
pub struct ObjectAdapter {
    name: String,
    instance: Weak<crate::instance::Instance>,
    pool: Arc<ThreadPool>,
    timer: Arc<Timer>,
    conn_config: ConnectionConfig,
    default_encoding: EncodingVersion,
    endpoints: Vec<EndpointSpec>,
    support_ipv4: bool,
    support_ipv6: bool,
    state: Mutex<AdapterState>,
    cond: Condvar,
}

impl ObjectAdapter {
    pub(crate) fn new(
        name: String,
        endpoints: Vec<EndpointSpec>,
        instance: &Arc<crate::instance::Instance>,
    ) -> Result<Arc<Self>, LocalError> {
        for endpoint in &endpoints {
            if endpoint.source_address.is_some() {
                return Err(LocalError::ParseError(format!(
                    "`--sourceAddress` is not valid for object adapter endpoint `{endpoint}`"
                )));
            }
        }
        Ok(Arc::new(ObjectAdapter {
            name,
            instance: Arc::downgrade(instance),
            pool: instance.pool.clone(),
            timer: instance.timer.clone(),
            conn_config: instance.config.connection_config(),
            default_encoding: instance.config.default_encoding,
            endpoints,
            support_ipv4: instance.config.support.ipv4,
            support_ipv6: instance.config.support.ipv6,
            state: Mutex::new(AdapterState {
                phase: AdapterPhase::Created,
                servants: HashMap::new(),
                published: Vec::new(),
                acceptors: Vec::new(),
                connections: Vec::new(),
            }),
            cond: Condvar::new(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a servant under `identity` with the default facet.
    pub fn add(
        self: &Arc<Self>,
        identity: Identity,
        servant: Arc<dyn Servant>,
    ) -> Result<ObjectPrx, LocalError> {
        self.add_facet(identity, String::new(), servant)
    }

    pub fn add_facet(
        self: &Arc<Self>,
        identity: Identity,
        facet: String,
        servant: Arc<dyn Servant>,
    ) -> Result<ObjectPrx, LocalError> {
        if identity.is_null() {
            return Err(LocalError::ParseError("servant identity has no name".into()));
        }
        let mut st = self.state.lock();
        if st.phase >= AdapterPhase::Deactivated {
            return Err(LifecycleError::ObjectAdapterDeactivated {
                name: self.name.clone(),
            }
            .into());
        }
        let key = (identity.clone(), facet);
        if st.servants.contains_key(&key) {
            return Err(LocalError::ParseError(format!(
                "a servant for `{identity}` is already registered"
            )));
        }
        st.servants.insert(key, servant);
        drop(st);
        self.create_proxy(identity)
    }

    pub fn remove(&self, identity: &Identity, facet: &str) -> Option<Arc<dyn Servant>> {
        self.state
            .lock()
            .servants
            .remove(&(identity.clone(), facet.to_string()))
    }

    /// Endpoints this adapter advertises, with bound ports filled in
    /// after activation.
    pub fn published_endpoints(&self) -> Vec<EndpointSpec> {
        let st = self.state.lock();
        if st.published.is_empty() { self.endpoints.clone() } else { st.published.clone() }
    }

    /// A proxy addressing `identity` through this adapter's endpoints.
    pub fn create_proxy(self: &Arc<Self>, identity: Identity) -> Result<ObjectPrx, LocalError> {
        let st = self.state.lock();
        let endpoints =
            if st.published.is_empty() { self.endpoints.clone() } else { st.published.clone() };
        drop(st);
        let mut reference = Reference::new(identity);
        reference.encoding = self.default_encoding;
        reference.endpoints = endpoints;
        Ok(ObjectPrx::new(reference, self.instance.clone()))
    }

    /// Bind listeners and start dispatching. On a held adapter this is
    /// equivalent to [`ObjectAdapter::resume`].
    pub fn activate(self: &Arc<Self>) -> Result<(), LocalError> {
        {
            let st = self.state.lock();
            match st.phase {
                AdapterPhase::Created => {}
                AdapterPhase::Active => return Ok(()),
                AdapterPhase::Holding => {
                    drop(st);
                    self.resume();
                    return Ok(());
                }
                _ => {
                    return Err(LifecycleError::ObjectAdapterDeactivated {
                        name: self.name.clone(),
                    }
                    .into())
                }
            }
        }
        // Bind everything before flipping the phase, register with the
        // pool only after: a request must never observe a half-activated
        // adapter.
        let mut published = Vec::new();
        let mut acceptors = Vec::new();
        let mut datagram_connections = Vec::new();
        for endpoint in &self.endpoints {
            for host in endpoint.expand_wildcard(self.support_ipv4, self.support_ipv6) {
                let mut spec = endpoint.clone();
                match endpoint.protocol {
                    EndpointProtocol::Tcp => {
                        let (acceptor, actual) = self.open_tcp(endpoint, &host)?;
                        acceptors.push(acceptor);
                        spec.host = host;
                        spec.port = actual;
                    }
                    EndpointProtocol::Udp => {
                        let (connection, actual) = self.open_udp(endpoint, &host)?;
                        datagram_connections.push(connection);
                        spec.host = host;
                        spec.port = actual;
                    }
                }
                published.push(spec);
            }
        }

        {
            let mut st = self.state.lock();
            st.phase = AdapterPhase::Active;
            st.published = published;
        }
        for acceptor in acceptors {
            let token = self
                .pool
                .initialize(acceptor.clone(), Ready::READ)
                .map_err(TransportError::Socket)?;
            self.state.lock().acceptors.push((token, acceptor));
        }
        for connection in datagram_connections {
            connection.start()?;
            self.state.lock().connections.push(connection);
        }
        tracing::debug!(adapter = %self.name, "adapter activated");
        Ok(())
    }

    fn open_tcp(
        self: &Arc<Self>,
        endpoint: &EndpointSpec,
        host: &str,
    ) -> Result<(Arc<Acceptor>, u16), LocalError> {
        let addr = resolve_bind_addr(host, endpoint.port)?;
        let listener = TcpListener::bind(addr).map_err(TransportError::Socket)?;
        let actual_port = listener.local_addr().map_err(TransportError::Socket)?.port();
        let acceptor = Arc::new(Acceptor {
            listener: Mutex::new(Some(listener)),
            adapter: Arc::downgrade(self),
            desc: format!("tcp accept -h {host} -p {actual_port}"),
        });
        Ok((acceptor, actual_port))
    }

    fn open_udp(
        self: &Arc<Self>,
        endpoint: &EndpointSpec,
        host: &str,
    ) -> Result<(Arc<Connection>, u16), LocalError> {
        let addr = resolve_bind_addr(host, endpoint.port)?;
        let socket = mio::net::UdpSocket::bind(addr).map_err(TransportError::Socket)?;
        let bound = socket.local_addr().map_err(TransportError::Socket)?;
        let transport = Box::new(UdpTransport::server(socket, bound));
        let connection = Connection::new(
            transport,
            self.pool.clone(),
            self.timer.clone(),
            self.conn_config.clone(),
            self.default_encoding,
            false,
            false,
        );
        connection.set_dispatcher(self.clone() as Arc<dyn IncomingDispatcher>);
        Ok((connection, bound.port()))
    }

    /// Queue new requests without dispatching them.
    pub fn hold(&self) {
        let connections = {
            let mut st = self.state.lock();
            if st.phase != AdapterPhase::Active {
                return;
            }
            st.phase = AdapterPhase::Holding;
            st.connections.clone()
        };
        for connection in connections {
            connection.hold();
        }
    }

    pub fn resume(&self) {
        let connections = {
            let mut st = self.state.lock();
            if st.phase != AdapterPhase::Holding {
                return;
            }
            st.phase = AdapterPhase::Active;
            st.connections.clone()
        };
        for connection in connections {
            connection.resume();
        }
    }

    /// Stop accepting, close inbound connections gracefully, and reject
    /// further dispatches.
    pub fn deactivate(self: &Arc<Self>) {
        let (acceptors, connections) = {
            let mut st = self.state.lock();
            if st.phase >= AdapterPhase::Deactivated {
                return;
            }
            st.phase = AdapterPhase::Deactivated;
            (
                std::mem::take(&mut st.acceptors),
                std::mem::take(&mut st.connections),
            )
        };
        for (token, acceptor) in acceptors {
            // Stop listening right now; the selector entry goes away
            // asynchronously.
            acceptor.close();
            self.pool.finish(token);
        }
        for connection in &connections {
            connection.close(CloseMode::GracefullyWithWait);
        }
        for connection in &connections {
            connection.wait_finished();
        }
        let mut st = self.state.lock();
        st.phase = AdapterPhase::Destroyed;
        self.cond.notify_all();
        tracing::debug!(adapter = %self.name, "adapter deactivated");
    }

    /// Block until `deactivate` completed (possibly from another thread).
    pub fn wait_for_deactivate(&self) {
        let mut st = self.state.lock();
        while st.phase < AdapterPhase::Destroyed {
            self.cond.wait(&mut st);
        }
    }

    fn register_connection(&self, connection: Arc<Connection>) {
        let mut st = self.state.lock();
        // Drop entries for connections that already finished.
        st.connections.retain(|c| c.is_usable());
        st.connections.push(connection);
    }
}

impl IncomingDispatcher for ObjectAdapter {
    fn dispatch(&self, connection: &Arc<Connection>, request: ParsedRequest) {
        let result = self.dispatch_request(&request);
        if request.request_id != 0 {
            let (status, body) = result;
            connection.send_reply(request.request_id, status, body);
        }
        connection.dispatch_finished();
    }
}

impl ObjectAdapter {
    fn dispatch_request(&self, request: &ParsedRequest) -> (ReplyStatus, Bytes) {
        let servant = {
            let st = self.state.lock();
            if st.phase != AdapterPhase::Active && st.phase != AdapterPhase::Holding {
                let message = LifecycleError::ObjectAdapterDeactivated {
                    name: self.name.clone(),
                }
                .to_string();
                return (
                    ReplyStatus::UnknownLocalException,
                    encode_string_reply(request.encoding, &message),
                );
            }
            match st
                .servants
                .get(&(request.identity.clone(), request.facet.clone()))
            {
                Some(servant) => servant.clone(),
                None => {
                    // Distinguish a missing facet from a missing object.
                    let any_facet = st
                        .servants
                        .keys()
                        .any(|(identity, _)| *identity == request.identity);
                    let status = if any_facet {
                        ReplyStatus::FacetNotExist
                    } else {
                        ReplyStatus::ObjectNotExist
                    };
                    let mut out = OutputStream::new(request.encoding);
                    let body = encode_request_failed(&mut out, request)
                        .map(|()| out.finished())
                        .unwrap_or_default();
                    return (status, body);
                }
            }
        };

        let current = Current {
            identity: request.identity.clone(),
            facet: request.facet.clone(),
            operation: request.operation.clone(),
            mode: request.mode,
            context: request.context.clone(),
            encoding: request.encoding,
            adapter_name: self.name.clone(),
        };
        let mut params = InputStream::new(request.params.clone(), request.encoding);
        if let Some(instance) = self.instance.upgrade() {
            params.set_factories(instance.factories.clone());
            params.set_class_graph_depth_max(instance.config.class_graph_depth_max);
        }
        match servant.dispatch(&current, &mut params) {
            Ok(DispatchResult::Ok(body)) => (ReplyStatus::Ok, body),
            Ok(DispatchResult::UserException(body)) => (ReplyStatus::UserException, body),
            Err(LocalError::Invocation(crate::InvocationError::OperationNotExist {
                ..
            })) => {
                let mut out = OutputStream::new(request.encoding);
                let body = encode_request_failed(&mut out, request)
                    .map(|()| out.finished())
                    .unwrap_or_default();
                (ReplyStatus::OperationNotExist, body)
            }
            Err(e) => {
                tracing::warn!(
                    adapter = %self.name,
                    operation = %request.operation,
                    error = %e,
                    "dispatch failed"
                );
                (
                    ReplyStatus::UnknownLocalException,
                    encode_string_reply(request.encoding, &e.to_string()),
                )
            }
        }
    }
}

/// Reply body for the three request-failed statuses: identity, facet
/// path, operation.
pub(crate) fn encode_request_failed(
    out: &mut OutputStream,
    request: &ParsedRequest,
) -> Result<(), EncodingError> {
    out.write_string(&request.identity.name)?;
    out.write_string(&request.identity.category)?;
    if request.facet.is_empty() {
        out.write_size(0)?;
    } else {
        out.write_size(1)?;
        out.write_string(&request.facet)?;
    }
    out.write_string(&request.operation)?;
    Ok(())
}

fn encode_string_reply(encoding: EncodingVersion, message: &str) -> Bytes {
    let mut out = OutputStream::new(encoding);
    match out.write_string(message) {
        Ok(()) => out.finished(),
        Err(_) => Bytes::new(),
    }
}

fn resolve_bind_addr(host: &str, port: u16) -> Result<std::net::SocketAddr, LocalError> {
    use std::net::ToSocketAddrs;
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(std::net::SocketAddr::new(ip, port));
    }
    (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| {
            TransportError::Dns { host: host.to_string(), error: "no addresses".into() }.into()
        })
}

/// Listener handler: accepts sockets and turns each into a server-side
/// connection owned by the adapter.
struct Acceptor {
    listener: Mutex<Option<TcpListener>>,
    adapter: Weak<ObjectAdapter>,
    desc: String,
}

impl Acceptor {
    /// Drop the socket; refusals start immediately.
    fn close(&self) {
        self.listener.lock().take();
    }
}

impl EventHandler for Acceptor {
    fn message(
        self: Arc<Self>,
        _pool: &Arc<ThreadPool>,
        _ready: Ready,
        _current: &mut ThreadPoolCurrent,
    ) {
        loop {
            let accepted = {
                let guard = self.listener.lock();
                let Some(listener) = guard.as_ref() else {
                    return; // Closed under us.
                };
                listener.accept()
            };
            match accepted {
                Ok((stream, peer)) => {
                    let Some(adapter) = self.adapter.upgrade() else {
                        return;
                    };
                    let transport = Box::new(TcpTransport::accepted(stream, peer));
                    let connection = Connection::new(
                        transport,
                        adapter.pool.clone(),
                        adapter.timer.clone(),
                        adapter.conn_config.clone(),
                        adapter.default_encoding,
                        false,
                        false,
                    );
                    connection.set_dispatcher(adapter.clone() as Arc<dyn IncomingDispatcher>);
                    if let Err(e) = connection.start() {
                        tracing::warn!(acceptor = %self.desc, error = %e, "cannot start connection");
                        continue;
                    }
                    adapter.register_connection(connection);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(acceptor = %self.desc, error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn finished(self: Arc<Self>, _pool: &Arc<ThreadPool>) {
        tracing::debug!(acceptor = %self.desc, "acceptor closed");
    }

    fn register_source(
        &self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        match self.listener.lock().as_mut() {
            Some(listener) => registry.register(listener, token, interest),
            None => Ok(()),
        }
    }

    fn reregister_source(
        &self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        match self.listener.lock().as_mut() {
            Some(listener) => registry.reregister(listener, token, interest),
            None => Ok(()),
        }
    }

    fn deregister_source(&self, registry: &Registry) -> io::Result<()> {
        match self.listener.lock().as_mut() {
            Some(listener) => registry.deregister(listener),
            None => Ok(()),
        }
    }

    fn description(&self) -> String {
        self.desc.clone()
    }
}
