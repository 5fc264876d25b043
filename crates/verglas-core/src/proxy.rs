use std::sync::Weak;

use bytes::Bytes;

use verglas_codec::{InputStream, OutputStream};
use verglas_wire::{
    EncodingVersion, EndpointSelection, Identity, InvocationMode, OperationMode, ReplyStatus,
};

use crate::instance::Instance;
use crate::invocation::{InvocationFuture, Outgoing};
use crate::message::{Context, ReplyData};
use crate::reference::Reference;
use crate::{InvocationError, LifecycleError, LocalError};

/// A reply's encapsulated payload, ready to be decoded by a stub.
pub struct Encapsulation {
    bytes: Bytes,
    encoding: EncodingVersion,
    factories: Option<std::sync::Arc<verglas_codec::FactoryRegistry>>,
    class_graph_depth_max: usize,
}

impl Encapsulation {
    pub fn encoding(&self) -> EncodingVersion {
        self.encoding
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// A stream over the encapsulation, with the runtime's value
    /// factories and limits installed; call `start_encapsulation` first.
    pub fn reader(&self) -> InputStream {
        let mut input = InputStream::new(self.bytes.clone(), self.encoding);
        if let Some(factories) = &self.factories {
            input.set_factories(factories.clone());
        }
        input.set_class_graph_depth_max(self.class_graph_depth_max);
        input
    }
}

/// Terminal result of a successful wire exchange.
pub enum InvocationOutcome {
    /// Out-parameters follow.
    Ok(Encapsulation),
    /// A declared exception was raised by the servant.
    UserException(Encapsulation),
}

/// The client-side handle: an immutable [`Reference`] plus the runtime it
/// invokes through. Every mutator clones the reference; sharing a proxy
/// across threads needs no synchronization.
#[derive(Clone)]
pub struct ObjectPrx {
    reference: Reference,
    instance: Weak<Instance>,
}

impl PartialEq for ObjectPrx {
    fn eq(&self, other: &Self) -> bool {
        self.reference == other.reference
    }
}

impl Eq for ObjectPrx {}

impl std::fmt::Debug for ObjectPrx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ObjectPrx").field(&self.to_proxy_string()).finish()
    }
}

impl std::fmt::Display for ObjectPrx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_proxy_string())
    }
}

impl ObjectPrx {
    pub(crate) fn new(reference: Reference, instance: Weak<Instance>) -> Self {
        ObjectPrx { reference, instance }
    }

    pub fn identity(&self) -> &Identity {
        &self.reference.identity
    }

    pub fn facet(&self) -> &str {
        &self.reference.facet
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn to_proxy_string(&self) -> String {
        let mode = self
            .instance
            .upgrade()
            .map(|i| i.config.to_string_mode)
            .unwrap_or_default();
        self.reference.to_proxy_string(mode)
    }

    // --- mutators -----------------------------------------------------

    fn with_reference(&self, mutate: impl FnOnce(&mut Reference)) -> Self {
        let mut reference = self.reference.clone();
        mutate(&mut reference);
        ObjectPrx { reference, instance: self.instance.clone() }
    }

    pub fn with_identity(&self, identity: Identity) -> Self {
        self.with_reference(|r| r.identity = identity)
    }

    pub fn with_facet(&self, facet: impl Into<String>) -> Self {
        self.with_reference(|r| r.facet = facet.into())
    }

    pub fn twoway(&self) -> Self {
        self.with_reference(|r| r.mode = InvocationMode::Twoway)
    }

    pub fn oneway(&self) -> Self {
        self.with_reference(|r| r.mode = InvocationMode::Oneway)
    }

    pub fn batch_oneway(&self) -> Self {
        self.with_reference(|r| r.mode = InvocationMode::BatchOneway)
    }

    pub fn datagram(&self) -> Self {
        self.with_reference(|r| r.mode = InvocationMode::Datagram)
    }

    pub fn batch_datagram(&self) -> Self {
        self.with_reference(|r| r.mode = InvocationMode::BatchDatagram)
    }

    pub fn with_secure(&self, secure: bool) -> Self {
        self.with_reference(|r| r.secure = secure)
    }

    pub fn with_compress(&self, compress: bool) -> Self {
        self.with_reference(|r| r.compress = Some(compress))
    }

    pub fn with_timeout(&self, ms: i32) -> Self {
        self.with_reference(|r| r.timeout = Some(ms))
    }

    pub fn with_invocation_timeout(&self, ms: i32) -> Self {
        self.with_reference(|r| r.invocation_timeout = Some(ms))
    }

    pub fn with_endpoint_selection(&self, selection: EndpointSelection) -> Self {
        self.with_reference(|r| r.selection = selection)
    }

    pub fn with_connection_id(&self, id: impl Into<String>) -> Self {
        self.with_reference(|r| r.connection_id = id.into())
    }

    pub fn with_encoding(&self, encoding: EncodingVersion) -> Self {
        self.with_reference(|r| r.encoding = encoding)
    }

    // --- invocation ---------------------------------------------------

    /// A stream for the in-parameters, with the encapsulation open; hand
    /// it back to [`ObjectPrx::invoke`].
    pub fn start_params(&self) -> Result<OutputStream, LocalError> {
        let mut out = OutputStream::new(self.reference.encoding);
        out.start_encapsulation()?;
        Ok(out)
    }

    /// Invoke `operation` and block for the outcome.
    pub fn invoke(
        &self,
        operation: &str,
        mode: OperationMode,
        expects_results: bool,
        params: Option<OutputStream>,
        context: Option<Context>,
    ) -> Result<InvocationOutcome, LocalError> {
        let future = self.invoke_async(operation, mode, expects_results, params, context)?;
        let reply = future.wait()?;
        let (factories, depth_max) = match self.instance.upgrade() {
            Some(instance) => (
                Some(instance.factories.clone()),
                instance.config.class_graph_depth_max,
            ),
            None => (None, verglas_codec::DEFAULT_CLASS_GRAPH_DEPTH_MAX),
        };
        Ok(interpret_reply(reply, factories, depth_max))
    }

    /// Invoke `operation`; the returned future resolves when the reply
    /// (or a terminal error) arrives, driven by the pool's completions.
    pub fn invoke_async(
        &self,
        operation: &str,
        mode: OperationMode,
        expects_results: bool,
        params: Option<OutputStream>,
        context: Option<Context>,
    ) -> Result<InvocationFuture, LocalError> {
        let instance = self
            .instance
            .upgrade()
            .ok_or(LifecycleError::CommunicatorDestroyed)?;
        instance.check_destroyed()?;
        if expects_results && !self.reference.mode.is_twoway() {
            return Err(InvocationError::TwowayOnly { operation: operation.to_string() }.into());
        }

        let params = match params {
            Some(mut out) => {
                out.end_encapsulation()?;
                out.finished()
            }
            None => {
                let mut out = OutputStream::new(self.reference.encoding);
                out.write_empty_encapsulation(self.reference.encoding)?;
                out.finished()
            }
        };

        Ok(Outgoing::start(
            instance.outgoing(),
            instance.timer.clone(),
            self.reference.clone(),
            operation.to_string(),
            mode,
            context.unwrap_or_default(),
            params,
            instance.config.retry_intervals.clone(),
        ))
    }

    /// Flush this proxy's batched requests on their connection(s).
    pub fn flush_batch_requests(&self) -> Result<(), LocalError> {
        let instance = self
            .instance
            .upgrade()
            .ok_or(LifecycleError::CommunicatorDestroyed)?;
        instance.outgoing().flush_batch_requests();
        Ok(())
    }
}

/// Turn a raw reply into the caller-visible outcome.
fn interpret_reply(
    reply: ReplyData,
    factories: Option<std::sync::Arc<verglas_codec::FactoryRegistry>>,
    class_graph_depth_max: usize,
) -> InvocationOutcome {
    let encapsulation = Encapsulation {
        bytes: reply.body,
        encoding: reply.encoding,
        factories,
        class_graph_depth_max,
    };
    match reply.status {
        ReplyStatus::UserException => InvocationOutcome::UserException(encapsulation),
        // Terminal error statuses were turned into errors by the
        // invocation driver; whatever reaches here succeeded.
        _ => InvocationOutcome::Ok(encapsulation),
    }
}
