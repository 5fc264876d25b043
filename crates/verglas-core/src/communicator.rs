use std::sync::Arc;

use verglas_codec::FactoryRegistry;
use verglas_wire::Identity;

use crate::adapter::ObjectAdapter;
use crate::endpoint::EndpointSpec;
use crate::instance::Instance;
use crate::proxy::ObjectPrx;
use crate::reference::Reference;
use crate::{LocalError, Properties};

/// Diagnostics hook: observe communicator lifecycles without any global
/// mutable state. Installed per communicator through [`InitData`].
pub trait CommunicatorObserver: Send + Sync {
    fn created(&self, communicator: &Communicator);
    fn destroyed(&self, communicator: &Communicator);
}

/// Everything `Communicator::init` needs up front.
#[derive(Default)]
pub struct InitData {
    pub properties: Properties,
    pub observer: Option<Arc<dyn CommunicatorObserver>>,
}

/// The entry point of the runtime: owns the thread pool, the timer, the
/// resolver, the value factories, the outgoing connection cache and the
/// object adapters. Destroying it (explicitly or by drop) drains all of
/// them and joins every thread.
pub struct Communicator {
    instance: Arc<Instance>,
    observer: Option<Arc<dyn CommunicatorObserver>>,
}

impl Communicator {
    pub fn new() -> Result<Self, LocalError> {
        Self::with_properties(Properties::new())
    }

    pub fn with_properties(properties: Properties) -> Result<Self, LocalError> {
        Self::init(InitData { properties, observer: None })
    }

    pub fn init(init: InitData) -> Result<Self, LocalError> {
        let instance = Instance::new(init.properties)?;
        let communicator = Communicator { instance, observer: init.observer };
        if let Some(observer) = &communicator.observer {
            observer.created(&communicator);
        }
        Ok(communicator)
    }

    pub fn properties(&self) -> Arc<Properties> {
        self.instance.properties.clone()
    }

    /// The process-wide class and exception factories used when decoding
    /// class-typed data.
    pub fn factories(&self) -> Arc<FactoryRegistry> {
        self.instance.factories.clone()
    }

    /// Parse a stringified proxy against this runtime's defaults.
    pub fn string_to_proxy(&self, s: &str) -> Result<ObjectPrx, LocalError> {
        self.instance.check_destroyed()?;
        let mut reference = Reference::parse(s, self.instance.config.default_encoding)?;
        if let Some(host) = self.instance.properties.get("Default.Host") {
            for endpoint in &mut reference.endpoints {
                if endpoint.host.is_empty() {
                    endpoint.host = host.clone();
                }
            }
        }
        Ok(ObjectPrx::new(reference, Arc::downgrade(&self.instance)))
    }

    pub fn proxy_to_string(&self, proxy: &ObjectPrx) -> String {
        proxy.to_proxy_string()
    }

    /// Build a proxy programmatically from an identity and endpoints.
    pub fn create_proxy(
        &self,
        identity: Identity,
        endpoints: Vec<EndpointSpec>,
    ) -> Result<ObjectPrx, LocalError> {
        self.instance.check_destroyed()?;
        let mut reference = Reference::new(identity);
        reference.encoding = self.instance.config.default_encoding;
        reference.endpoints = endpoints;
        Ok(ObjectPrx::new(reference, Arc::downgrade(&self.instance)))
    }

    /// An adapter listening on `endpoints` (endpoint-string syntax,
    /// colon-separated).
    pub fn create_object_adapter_with_endpoints(
        &self,
        name: &str,
        endpoints: &str,
    ) -> Result<Arc<ObjectAdapter>, LocalError> {
        self.instance.check_destroyed()?;
        let mut specs = Vec::new();
        for part in endpoints.split(':') {
            let part = part.trim();
            if !part.is_empty() {
                specs.push(EndpointSpec::parse(part)?);
            }
        }
        if specs.is_empty() {
            return Err(LocalError::ParseError(format!(
                "adapter `{name}` has no endpoints"
            )));
        }
        let adapter = ObjectAdapter::new(name.to_string(), specs, &self.instance)?;
        self.instance.register_adapter(adapter.clone());
        Ok(adapter)
    }

    /// Send every queued batch request on every outgoing connection.
    pub fn flush_batch_requests(&self) -> Result<(), LocalError> {
        self.instance.check_destroyed()?;
        self.instance.outgoing().flush_batch_requests();
        Ok(())
    }

    /// Deactivate every adapter; in-flight dispatches finish first.
    pub fn shutdown(&self) {
        for adapter in self.instance.adapters() {
            adapter.deactivate();
        }
    }

    /// Block until `shutdown` (from any thread) completed.
    pub fn wait_for_shutdown(&self) {
        for adapter in self.instance.adapters() {
            adapter.wait_for_deactivate();
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.instance.is_destroyed()
    }

    /// Tear the runtime down: adapters, connections, resolver, timer,
    /// thread pool, in that order, joining every thread.
    pub fn destroy(&self) {
        if self.instance.is_destroyed() {
            return;
        }
        self.instance.destroy();
        if let Some(observer) = &self.observer {
            observer.destroyed(self);
        }
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn init_and_destroy() {
        let communicator = Communicator::new().unwrap();
        assert!(!communicator.is_destroyed());
        communicator.destroy();
        assert!(communicator.is_destroyed());
        // Idempotent.
        communicator.destroy();
    }

    #[test]
    fn observer_sees_lifecycle() {
        struct Counter {
            created: AtomicUsize,
            destroyed: AtomicUsize,
        }
        impl CommunicatorObserver for Counter {
            fn created(&self, _: &Communicator) {
                self.created.fetch_add(1, Ordering::SeqCst);
            }
            fn destroyed(&self, _: &Communicator) {
                self.destroyed.fetch_add(1, Ordering::SeqCst);
            }
        }
        let counter = Arc::new(Counter {
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
        });
        let communicator = Communicator::init(InitData {
            properties: Properties::new(),
            observer: Some(counter.clone()),
        })
        .unwrap();
        assert_eq!(counter.created.load(Ordering::SeqCst), 1);
        communicator.destroy();
        assert_eq!(counter.destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn proxy_string_roundtrip_through_communicator() {
        let communicator = Communicator::new().unwrap();
        let proxy = communicator
            .string_to_proxy("greeter:tcp -h 127.0.0.1 -p 4061")
            .unwrap();
        let s = communicator.proxy_to_string(&proxy);
        let reparsed = communicator.string_to_proxy(&s).unwrap();
        assert_eq!(proxy, reparsed);
        communicator.destroy();
    }

    #[test]
    fn string_to_proxy_after_destroy_fails() {
        let communicator = Communicator::new().unwrap();
        communicator.destroy();
        assert!(communicator.string_to_proxy("x:tcp -h h -p 1").is_err());
    }

    #[test]
    fn bad_configuration_is_rejected() {
        let properties = Properties::from_pairs([("ToStringMode", "Wrong")]);
        assert!(Communicator::with_properties(properties).is_err());

        let properties = Properties::from_pairs([("IPv4", "0"), ("IPv6", "0")]);
        assert!(Communicator::with_properties(properties).is_err());
    }
}
