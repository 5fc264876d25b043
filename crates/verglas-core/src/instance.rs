use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;

use verglas_codec::FactoryRegistry;
use verglas_wire::{EncodingVersion, ToStringMode, ENCODING_1_1};

use crate::adapter::ObjectAdapter;
use crate::connection::ConnectionConfig;
use crate::connection_factory::OutgoingConnectionFactory;
use crate::resolver::{HostResolver, NetworkProxy, ProtocolSupport};
use crate::thread_pool::ThreadPool;
use crate::timer::Timer;
use crate::{LifecycleError, LocalError, Properties};

/// Configuration distilled from [`Properties`] at startup.
#[derive(Clone, Debug)]
pub(crate) struct RuntimeConfig {
    pub message_size_max: usize,
    pub batch_auto_flush_size: usize,
    pub class_graph_depth_max: usize,
    pub acm_timeout: Duration,
    pub retry_intervals: Vec<i64>,
    pub default_encoding: EncodingVersion,
    pub to_string_mode: ToStringMode,
    pub support: ProtocolSupport,
    pub connect_timeout: Option<Duration>,
    pub warn_connections: bool,
}

impl RuntimeConfig {
    fn from_properties(properties: &Properties) -> Result<Self, LocalError> {
        let message_size_max =
            properties.get_int_with_default("MessageSizeMax", 1024).max(1) as usize * 1024;
        let batch_auto_flush_size =
            properties.get_int_with_default("BatchAutoFlushSize", 1024).max(1) as usize * 1024;
        let class_graph_depth_max =
            properties.get_int_with_default("ClassGraphDepthMax", 100).max(1) as usize;
        let acm_secs = properties.get_int_with_default("ACM.Timeout", 60).max(0);
        let retry_intervals: Vec<i64> = {
            let list = properties.get_list("RetryIntervals");
            if list.is_empty() {
                vec![0]
            } else {
                let mut intervals = Vec::with_capacity(list.len());
                for entry in list {
                    intervals.push(entry.parse().map_err(|_| {
                        LocalError::ParseError(format!("bad RetryIntervals entry `{entry}`"))
                    })?);
                }
                intervals
            }
        };
        let default_encoding = {
            let value = properties.get_with_default("Default.EncodingVersion", "1.1");
            let parsed = EncodingVersion::parse(&value)
                .filter(|v| v.is_supported())
                .ok_or_else(|| {
                    LocalError::ParseError(format!("bad Default.EncodingVersion `{value}`"))
                })?;
            parsed
        };
        let to_string_mode = match properties.get_with_default("ToStringMode", "Unicode").as_str()
        {
            "Unicode" => ToStringMode::Unicode,
            "ASCII" => ToStringMode::Ascii,
            "Compat" => ToStringMode::Compat,
            other => {
                return Err(LocalError::ParseError(format!(
                    "ToStringMode must be Unicode, ASCII or Compat, not `{other}`"
                )))
            }
        };
        let support = ProtocolSupport {
            ipv4: properties.get_int_with_default("IPv4", 1) > 0,
            ipv6: properties.get_int_with_default("IPv6", 1) > 0,
            prefer_ipv6: properties.get_bool("PreferIPv6Address"),
        };
        if !support.ipv4 && !support.ipv6 {
            return Err(LocalError::ParseError(
                "both IPv4 and IPv6 are disabled".into(),
            ));
        }
        let connect_timeout = match properties.get_int_with_default("ConnectTimeout", 10) {
            t if t <= 0 => None,
            t => Some(Duration::from_secs(t as u64)),
        };
        Ok(RuntimeConfig {
            message_size_max,
            batch_auto_flush_size,
            class_graph_depth_max,
            acm_timeout: Duration::from_secs(acm_secs as u64),
            retry_intervals,
            default_encoding: if default_encoding.is_supported() {
                default_encoding
            } else {
                ENCODING_1_1
            },
            to_string_mode,
            support,
            connect_timeout,
            warn_connections: properties.get_bool("Warn.Connections"),
        })
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            message_size_max: self.message_size_max,
            batch_auto_flush_size: self.batch_auto_flush_size,
            acm_timeout: self.acm_timeout,
            accept_compressed: true,
            warn_connections: self.warn_connections,
        }
    }
}

fn network_proxy(properties: &Properties) -> Option<NetworkProxy> {
    if let Some(host) = properties.get("SOCKSProxyHost") {
        let port = properties.get_int_with_default("SOCKSProxyPort", 1080) as u16;
        return Some(NetworkProxy::Socks { host, port });
    }
    if let Some(host) = properties.get("HTTPProxyHost") {
        let port = properties.get_int_with_default("HTTPProxyPort", 1080) as u16;
        return Some(NetworkProxy::HttpConnect { host, port });
    }
    None
}

/// Shared state behind one communicator: the pools, the resolver, the
/// timer, the factories and the live adapters.
pub(crate) struct Instance {
    pub properties: Arc<Properties>,
    pub config: RuntimeConfig,
    pub timer: Arc<Timer>,
    pub pool: Arc<ThreadPool>,
    pub resolver: Arc<HostResolver>,
    pub factories: Arc<FactoryRegistry>,
    outgoing: OnceLock<Arc<OutgoingConnectionFactory>>,
    adapters: Mutex<Vec<Arc<ObjectAdapter>>>,
    destroyed: AtomicBool,
}

impl Instance {
    pub fn new(properties: Properties) -> Result<Arc<Self>, LocalError> {
        let config = RuntimeConfig::from_properties(&properties)?;
        let pool = ThreadPool::new(&properties, "ThreadPool")
            .map_err(crate::TransportError::Socket)?;
        let resolver = HostResolver::new(config.support, network_proxy(&properties));
        let instance = Arc::new(Instance {
            properties: Arc::new(properties),
            config,
            timer: Timer::new(),
            pool,
            resolver,
            factories: Arc::new(FactoryRegistry::new()),
            outgoing: OnceLock::new(),
            adapters: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        });
        let factory = OutgoingConnectionFactory::new(
            instance.pool.clone(),
            instance.timer.clone(),
            instance.resolver.clone(),
            instance.config.connection_config(),
            instance.config.connect_timeout,
        );
        instance
            .outgoing
            .set(factory)
            .map_err(|_| LocalError::ParseError("instance initialized twice".into()))?;
        Ok(instance)
    }

    pub fn outgoing(&self) -> Arc<OutgoingConnectionFactory> {
        self.outgoing
            .get()
            .expect("outgoing factory installed at construction")
            .clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn check_destroyed(&self) -> Result<(), LocalError> {
        if self.is_destroyed() {
            Err(LifecycleError::CommunicatorDestroyed.into())
        } else {
            Ok(())
        }
    }

    pub fn register_adapter(&self, adapter: Arc<ObjectAdapter>) {
        self.adapters.lock().push(adapter);
    }

    pub fn adapters(&self) -> Vec<Arc<ObjectAdapter>> {
        self.adapters.lock().clone()
    }

    /// Deactivate adapters, drain connections, stop the machinery and
    /// join every thread. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let adapters: Vec<Arc<ObjectAdapter>> =
            std::mem::take(&mut *self.adapters.lock());
        for adapter in &adapters {
            adapter.deactivate();
        }
        self.outgoing().destroy();
        self.resolver.destroy();
        self.timer.destroy();
        self.pool.destroy();
        self.pool.join_with_all_threads();
        tracing::debug!("communicator runtime destroyed");
    }
}
