use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rand::seq::SliceRandom;

use verglas_wire::EndpointSelection;

use crate::connector::Connector;
use crate::endpoint::EndpointSpec;
use crate::transport::tcp::ProxyPrologue;
use crate::{LifecycleError, LocalError, TransportError};

/// SOCKS or HTTP CONNECT intermediary configured for all outgoing
/// connections.
#[derive(Clone, Debug)]
pub enum NetworkProxy {
    Socks { host: String, port: u16 },
    HttpConnect { host: String, port: u16 },
}

/// Address family gating from the `IPv4`/`IPv6` properties.
#[derive(Clone, Copy, Debug)]
pub struct ProtocolSupport {
    pub ipv4: bool,
    pub ipv6: bool,
    pub prefer_ipv6: bool,
}

impl Default for ProtocolSupport {
    fn default() -> Self {
        ProtocolSupport { ipv4: true, ipv6: true, prefer_ipv6: false }
    }
}

type ResolveCallback = Box<dyn FnOnce(Result<Vec<Connector>, LocalError>) + Send>;

struct ResolveEntry {
    spec: EndpointSpec,
    selection: EndpointSelection,
    callback: ResolveCallback,
}

struct ResolverState {
    queue: VecDeque<ResolveEntry>,
    destroyed: bool,
}

/// Asynchronous name resolution on one dedicated thread.
///
/// A numeric host is resolved synchronously on the caller thread; anything
/// needing DNS is queued FIFO to the resolver thread, keeping the number
/// of concurrent lookup syscalls at one.
pub(crate) struct HostResolver {
    state: Mutex<ResolverState>,
    cond: Condvar,
    support: ProtocolSupport,
    proxy: Option<NetworkProxy>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl HostResolver {
    pub fn new(support: ProtocolSupport, proxy: Option<NetworkProxy>) -> Arc<Self> {
        let resolver = Arc::new(HostResolver {
            state: Mutex::new(ResolverState { queue: VecDeque::new(), destroyed: false }),
            cond: Condvar::new(),
            support,
            proxy,
            thread: Mutex::new(None),
        });
        let runner = resolver.clone();
        let handle = std::thread::Builder::new()
            .name("verglas-resolver".into())
            .spawn(move || runner.run())
            .expect("failed to spawn resolver thread");
        *resolver.thread.lock() = Some(handle);
        resolver
    }

    /// Resolve `spec` into an ordered connector list. The callback runs
    /// on the caller thread for the numeric fast path, on the resolver
    /// thread otherwise.
    pub fn resolve(
        &self,
        spec: EndpointSpec,
        selection: EndpointSelection,
        callback: ResolveCallback,
    ) {
        // Numeric addresses skip the queue entirely, unless a proxy is in
        // play (its own host may need the thread).
        if self.proxy.is_none() {
            if let Ok(ip) = spec.host.parse::<IpAddr>() {
                let addrs = self.filter_order(vec![SocketAddr::new(ip, spec.port)], selection);
                callback(self.to_connectors(&spec, addrs, None));
                return;
            }
        }
        let mut state = self.state.lock();
        if state.destroyed {
            drop(state);
            callback(Err(LifecycleError::CommunicatorDestroyed.into()));
            return;
        }
        state.queue.push_back(ResolveEntry { spec, selection, callback });
        self.cond.notify_one();
    }

    /// Fail queued entries and join the thread.
    pub fn destroy(&self) {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
        }
        self.cond.notify_all();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn run(self: Arc<Self>) {
        loop {
            let entry = {
                let mut state = self.state.lock();
                loop {
                    if let Some(entry) = state.queue.pop_front() {
                        break entry;
                    }
                    if state.destroyed {
                        return;
                    }
                    self.cond.wait(&mut state);
                }
            };
            let result = self.resolve_blocking(&entry.spec, entry.selection);
            (entry.callback)(result);

            // Drain with a terminal error once destroyed.
            let drained: Vec<ResolveEntry> = {
                let mut state = self.state.lock();
                if state.destroyed {
                    state.queue.drain(..).collect()
                } else {
                    Vec::new()
                }
            };
            for entry in drained {
                (entry.callback)(Err(LifecycleError::CommunicatorDestroyed.into()));
            }
        }
    }

    fn resolve_blocking(
        &self,
        spec: &EndpointSpec,
        selection: EndpointSelection,
    ) -> Result<Vec<Connector>, LocalError> {
        match &self.proxy {
            None => {
                let addrs = self.lookup(&spec.host, spec.port)?;
                let addrs = self.filter_order(addrs, selection);
                self.to_connectors(spec, addrs, None)
            }
            Some(NetworkProxy::HttpConnect { host, port }) => {
                // The proxy resolves the target; we only resolve the proxy.
                let proxy_addrs = self.lookup(host, *port)?;
                let proxy_addrs = self.filter_order(proxy_addrs, EndpointSelection::Ordered);
                self.to_connectors(
                    spec,
                    proxy_addrs,
                    Some(PrologueFor::Http { host: spec.host.clone(), port: spec.port }),
                )
            }
            Some(NetworkProxy::Socks { host, port }) => {
                // SOCKS4 carries the target address, so both sides resolve.
                let targets = self.lookup(&spec.host, spec.port)?;
                let targets = self.filter_order(targets, selection);
                let proxy_addrs = self.lookup(host, *port)?;
                let proxy_addr = proxy_addrs
                    .into_iter()
                    .find(|a| a.is_ipv4())
                    .ok_or_else(|| TransportError::Dns {
                        host: host.clone(),
                        error: "SOCKS proxy has no IPv4 address".into(),
                    })?;
                let mut connectors = Vec::with_capacity(targets.len());
                for target in targets.into_iter().filter(|t| t.is_ipv4()) {
                    connectors.push(Connector {
                        addr: proxy_addr,
                        spec: spec.clone(),
                        prologue: Some(ProxyPrologue::Socks4 { target }),
                    });
                }
                if connectors.is_empty() {
                    return Err(TransportError::Dns {
                        host: spec.host.clone(),
                        error: "no IPv4 address usable through the SOCKS proxy".into(),
                    }
                    .into());
                }
                Ok(connectors)
            }
        }
    }

    fn lookup(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, LocalError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }
        let host_owned = if host.is_empty() { "localhost" } else { host };
        match (host_owned, port).to_socket_addrs() {
            Ok(iter) => {
                let addrs: Vec<SocketAddr> = iter.collect();
                if addrs.is_empty() {
                    Err(TransportError::Dns {
                        host: host_owned.to_string(),
                        error: "no addresses".into(),
                    }
                    .into())
                } else {
                    Ok(addrs)
                }
            }
            Err(e) => Err(TransportError::Dns {
                host: host_owned.to_string(),
                error: e.to_string(),
            }
            .into()),
        }
    }

    /// Apply family gating, family preference and the selection policy.
    fn filter_order(
        &self,
        addrs: Vec<SocketAddr>,
        selection: EndpointSelection,
    ) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = addrs
            .into_iter()
            .filter(|a| (a.is_ipv4() && self.support.ipv4) || (a.is_ipv6() && self.support.ipv6))
            .collect();
        match selection {
            EndpointSelection::Random => {
                addrs.shuffle(&mut rand::thread_rng());
            }
            EndpointSelection::Ordered => {
                if self.support.prefer_ipv6 {
                    // Stable partition: v6 first, resolver order otherwise.
                    addrs.sort_by_key(|a| a.is_ipv4());
                }
            }
        }
        addrs
    }

    fn to_connectors(
        &self,
        spec: &EndpointSpec,
        addrs: Vec<SocketAddr>,
        prologue: Option<PrologueFor>,
    ) -> Result<Vec<Connector>, LocalError> {
        if addrs.is_empty() {
            return Err(TransportError::Dns {
                host: spec.host.clone(),
                error: "no addresses match the enabled protocol families".into(),
            }
            .into());
        }
        Ok(addrs
            .into_iter()
            .map(|addr| Connector {
                addr,
                spec: spec.clone(),
                prologue: match &prologue {
                    None => None,
                    Some(PrologueFor::Http { host, port }) => {
                        Some(ProxyPrologue::HttpConnect { host: host.clone(), port: *port })
                    }
                },
            })
            .collect())
    }
}

enum PrologueFor {
    Http { host: String, port: u16 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointProtocol;
    use std::sync::mpsc;

    fn resolver() -> Arc<HostResolver> {
        HostResolver::new(ProtocolSupport::default(), None)
    }

    #[test]
    fn numeric_host_resolves_on_caller_thread() {
        let resolver = resolver();
        let caller = std::thread::current().id();
        let (tx, rx) = mpsc::channel();
        let spec = EndpointSpec::new(EndpointProtocol::Tcp, "127.0.0.1", 4061);
        resolver.resolve(
            spec,
            EndpointSelection::Ordered,
            Box::new(move |result| {
                tx.send((std::thread::current().id(), result)).unwrap();
            }),
        );
        let (thread, result) = rx.recv().unwrap();
        assert_eq!(thread, caller);
        let connectors = result.unwrap();
        assert_eq!(connectors.len(), 1);
        assert_eq!(connectors[0].addr, "127.0.0.1:4061".parse().unwrap());
        resolver.destroy();
    }

    #[test]
    fn localhost_resolves_via_thread() {
        let resolver = resolver();
        let (tx, rx) = mpsc::channel();
        let spec = EndpointSpec::new(EndpointProtocol::Tcp, "localhost", 1);
        resolver.resolve(
            spec,
            EndpointSelection::Ordered,
            Box::new(move |result| {
                tx.send(result).unwrap();
            }),
        );
        let result = rx.recv_timeout(std::time::Duration::from_secs(10)).unwrap();
        let connectors = result.unwrap();
        assert!(!connectors.is_empty());
        for c in &connectors {
            assert!(c.addr.ip().is_loopback());
        }
        resolver.destroy();
    }

    #[test]
    fn family_gating_filters_addresses() {
        let support = ProtocolSupport { ipv4: false, ipv6: true, prefer_ipv6: false };
        let resolver = HostResolver::new(support, None);
        let (tx, rx) = mpsc::channel();
        let spec = EndpointSpec::new(EndpointProtocol::Tcp, "127.0.0.1", 1);
        resolver.resolve(
            spec,
            EndpointSelection::Ordered,
            Box::new(move |result| {
                tx.send(result).unwrap();
            }),
        );
        assert!(rx.recv().unwrap().is_err());
        resolver.destroy();
    }

    #[test]
    fn destroyed_resolver_fails_new_requests() {
        let resolver = resolver();
        resolver.destroy();
        let (tx, rx) = mpsc::channel();
        let spec = EndpointSpec::new(EndpointProtocol::Tcp, "localhost", 1);
        resolver.resolve(
            spec,
            EndpointSelection::Ordered,
            Box::new(move |result| {
                tx.send(result).unwrap();
            }),
        );
        assert!(matches!(
            rx.recv().unwrap(),
            Err(LocalError::Lifecycle(LifecycleError::CommunicatorDestroyed))
        ));
    }

    #[test]
    fn prefer_ipv6_orders_v6_first() {
        let support = ProtocolSupport { ipv4: true, ipv6: true, prefer_ipv6: true };
        let resolver = HostResolver::new(support, None);
        let v4: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let v6: SocketAddr = "[::1]:1".parse().unwrap();
        let ordered = resolver.filter_order(vec![v4, v6], EndpointSelection::Ordered);
        assert_eq!(ordered, vec![v6, v4]);
        resolver.destroy();
    }
}
