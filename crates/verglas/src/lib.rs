//! Object-oriented RPC: clients hold typed remote references (proxies)
//! and invoke operations on servants living in object adapters, over a
//! length-framed binary wire protocol multiplexing concurrent calls on
//! each connection.
//!
//! This crate re-exports the three layers:
//!
//! - [`verglas_wire`]: wire-level types (versions, headers, identities)
//! - [`verglas_codec`]: the Slice binary encoding, 1.0 and 1.1
//! - [`verglas_core`]: the connection runtime (thread pool, transports,
//!   connections, proxies, adapters)
//!
//! A minimal exchange:
//!
//! ```no_run
//! use std::sync::Arc;
//! use verglas::{
//!     Communicator, Current, DispatchResult, Identity, LocalError, OperationMode, Servant,
//! };
//! use verglas_codec::InputStream;
//!
//! struct Greeter;
//!
//! impl Servant for Greeter {
//!     fn dispatch(
//!         &self,
//!         current: &Current,
//!         _params: &mut InputStream,
//!     ) -> Result<DispatchResult, LocalError> {
//!         match current.operation.as_str() {
//!             "sayHello" => Ok(DispatchResult::Ok(current.empty_reply())),
//!             _ => Err(verglas::InvocationError::OperationNotExist {
//!                 identity: current.identity.clone(),
//!                 facet: current.facet.clone(),
//!                 operation: current.operation.clone(),
//!             }
//!             .into()),
//!         }
//!     }
//! }
//!
//! fn main() -> Result<(), LocalError> {
//!     let communicator = Communicator::new()?;
//!     let adapter = communicator
//!         .create_object_adapter_with_endpoints("Greeter", "tcp -h 127.0.0.1 -p 0")?;
//!     let proxy = adapter.add(Identity::named("greeter"), Arc::new(Greeter))?;
//!     adapter.activate()?;
//!
//!     proxy.invoke("sayHello", OperationMode::Idempotent, true, None, None)?;
//!     communicator.destroy();
//!     Ok(())
//! }
//! ```

pub use verglas_codec;
pub use verglas_core;
pub use verglas_wire;

pub use verglas_core::{
    CancelHandle, CloseMode, Communicator, CommunicatorObserver, Connection, Context, Current,
    DispatchResult, Encapsulation, EncodingError, EndpointProtocol, EndpointSpec, InitData,
    InvocationError, InvocationFuture, InvocationOutcome, LifecycleError, LocalError,
    NetworkProxy, ObjectAdapter, ObjectPrx, Phase, Properties, ProtocolError, ProtocolSupport,
    Reference, ReplyData, Servant, TransportError,
};

pub use verglas_wire::{
    EncodingVersion, EndpointSelection, Identity, InvocationMode, OperationMode, ReplyStatus,
    ToStringMode, ValueFormat, ENCODING_1_0, ENCODING_1_1,
};

/// Everything a typical application file needs in scope.
pub mod prelude {
    pub use crate::{
        Communicator, Context, Current, DispatchResult, Identity, InvocationOutcome, LocalError,
        ObjectAdapter, ObjectPrx, OperationMode, Properties, Servant,
    };
    pub use verglas_codec::{InputStream, OutputStream};
}
