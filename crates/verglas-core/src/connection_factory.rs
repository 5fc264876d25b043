use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;

use verglas_wire::EndpointSelection;

use crate::connection::{CloseMode, Connection, ConnectionConfig, ConnectCallback};
use crate::connector::Connector;
use crate::endpoint::EndpointSpec;
use crate::reference::Reference;
use crate::resolver::HostResolver;
use crate::thread_pool::ThreadPool;
use crate::timer::Timer;
use crate::{InvocationError, LifecycleError, LocalError, ToStringMode};

struct FactoryState {
    /// Live (or establishing) connections by connector key and
    /// connection id.
    connections: HashMap<String, Arc<Connection>>,
    destroyed: bool,
}

/// Creates and caches client connections.
///
/// Invocations never own a connection; they ask here with their proxy's
/// reference, and racing invocations to the same target share one
/// establishment attempt through the connection's waiter list.
pub(crate) struct OutgoingConnectionFactory {
    pool: Arc<ThreadPool>,
    timer: Arc<Timer>,
    resolver: Arc<HostResolver>,
    config: ConnectionConfig,
    connect_timeout: Option<Duration>,
    state: Mutex<FactoryState>,
}

impl OutgoingConnectionFactory {
    pub fn new(
        pool: Arc<ThreadPool>,
        timer: Arc<Timer>,
        resolver: Arc<HostResolver>,
        config: ConnectionConfig,
        connect_timeout: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(OutgoingConnectionFactory {
            pool,
            timer,
            resolver,
            config,
            connect_timeout,
            state: Mutex::new(FactoryState { connections: HashMap::new(), destroyed: false }),
        })
    }

    /// Produce a usable connection for `reference`, reusing a cached one
    /// when the connector and connection id match. The callback runs once
    /// with either an Active connection or the terminal error of the last
    /// attempt.
    pub fn get_connection(self: &Arc<Self>, reference: &Reference, callback: ConnectCallback) {
        if self.state.lock().destroyed {
            callback(Err(LifecycleError::CommunicatorDestroyed.into()));
            return;
        }
        let mut endpoints = reference.usable_endpoints();
        if endpoints.is_empty() {
            callback(Err(InvocationError::NoEndpoint {
                proxy: reference.to_proxy_string(ToStringMode::Unicode),
            }
            .into()));
            return;
        }
        if reference.selection == EndpointSelection::Random {
            endpoints.shuffle(&mut rand::thread_rng());
        }
        let attempt = Attempt {
            factory: self.clone(),
            endpoints,
            selection: reference.selection,
            connection_id: reference.connection_id.clone(),
            timeout_override: reference.timeout,
            callback,
        };
        attempt.try_endpoint(0, None);
    }

    fn lookup_or_connect(
        self: &Arc<Self>,
        connector: &Connector,
        connection_id: &str,
        timeout_override: Option<i32>,
    ) -> Result<Arc<Connection>, LocalError> {
        let key = format!("{}#{connection_id}", connector.key());
        let mut st = self.state.lock();
        if st.destroyed {
            return Err(LifecycleError::CommunicatorDestroyed.into());
        }
        if let Some(existing) = st.connections.get(&key) {
            if existing.is_usable() {
                return Ok(existing.clone());
            }
            st.connections.remove(&key);
        }

        let transport = connector.connect()?;
        let connection = Connection::new(
            transport,
            self.pool.clone(),
            self.timer.clone(),
            self.config.clone(),
            verglas_wire::ENCODING_1_1,
            true,
            connector.spec.compress,
        );
        connection.start()?;
        st.connections.insert(key, connection.clone());
        drop(st);

        // Endpoint timeout overrides the configured connect timeout;
        // -1 means wait forever.
        let timeout = match timeout_override.or(connector.spec.timeout) {
            Some(-1) => None,
            Some(ms) => Some(Duration::from_millis(ms.max(0) as u64)),
            None => self.connect_timeout,
        };
        if let Some(timeout) = timeout {
            let weak = Arc::downgrade(&connection);
            self.timer.schedule(timeout, move || {
                if let Some(connection) = weak.upgrade() {
                    if connection.phase() < crate::connection::Phase::Active {
                        connection.fail(crate::TransportError::ConnectTimeout.into());
                    }
                }
            });
        }
        Ok(connection)
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Flush every connection's batch buffer.
    pub fn flush_batch_requests(&self) {
        let connections: Vec<Arc<Connection>> =
            self.state.lock().connections.values().cloned().collect();
        for connection in connections {
            if let Err(e) = connection.flush_batch() {
                tracing::debug!(connection = %connection.describe(), error = %e, "batch flush failed");
            }
        }
    }

    /// Close every connection gracefully and wait for them to finish.
    pub fn destroy(&self) {
        let connections: Vec<Arc<Connection>> = {
            let mut st = self.state.lock();
            if st.destroyed {
                return;
            }
            st.destroyed = true;
            st.connections.drain().map(|(_, c)| c).collect()
        };
        for connection in &connections {
            connection.close(CloseMode::GracefullyWithWait);
        }
        for connection in &connections {
            connection.wait_finished();
        }
    }
}

/// One invocation's walk over its candidate endpoints and addresses.
struct Attempt {
    factory: Arc<OutgoingConnectionFactory>,
    endpoints: Vec<EndpointSpec>,
    selection: EndpointSelection,
    connection_id: String,
    timeout_override: Option<i32>,
    callback: ConnectCallback,
}

impl Attempt {
    /// Resolve endpoint `index` and try its connectors; on failure fall
    /// through to the next endpoint, reporting the last error when all
    /// are exhausted.
    fn try_endpoint(self, index: usize, last_error: Option<LocalError>) {
        if index >= self.endpoints.len() {
            let error = last_error.unwrap_or_else(|| {
                crate::TransportError::Dns {
                    host: String::new(),
                    error: "no endpoints".into(),
                }
                .into()
            });
            (self.callback)(Err(error));
            return;
        }
        let spec = self.endpoints[index].clone();
        let selection = self.selection;
        let resolver = self.factory.resolver.clone();
        resolver.resolve(
            spec,
            selection,
            Box::new(move |result| match result {
                Ok(connectors) => self.try_connectors(index, connectors, 0, None),
                Err(e) => self.try_endpoint(index + 1, Some(e)),
            }),
        );
    }

    fn try_connectors(
        self,
        endpoint_index: usize,
        connectors: Vec<Connector>,
        connector_index: usize,
        last_error: Option<LocalError>,
    ) {
        if connector_index >= connectors.len() {
            self.try_endpoint(endpoint_index + 1, last_error);
            return;
        }
        let connection = match self.factory.lookup_or_connect(
            &connectors[connector_index],
            &self.connection_id,
            self.timeout_override,
        ) {
            Ok(connection) => connection,
            Err(e) => {
                return self.try_connectors(
                    endpoint_index,
                    connectors,
                    connector_index + 1,
                    Some(e),
                );
            }
        };
        connection.on_established(Box::new(move |result| match result {
            Ok(connection) => (self.callback)(Ok(connection)),
            Err(e) => {
                self.try_connectors(endpoint_index, connectors, connector_index + 1, Some(e))
            }
        }));
    }
}
