//! The Verglas connection runtime.
//!
//! Everything between a proxy invocation and the servant that answers it
//! lives here:
//!
//! - a leader/follower reactor thread pool driving all socket I/O
//! - TCP and UDP transports behind one narrow capability trait
//! - endpoint parsing, asynchronous host resolution and connectors
//! - the connection state machine: validation, request multiplexing,
//!   reply correlation, batching, ACM and the three close modes
//! - immutable proxies with blocking and future-style invocation,
//!   retries, timeouts and cancellation
//! - object adapters dispatching requests to registered servants
//!
//! [`Communicator`] ties the pieces together and owns their lifetime.

mod adapter;
mod communicator;
mod connection;
mod connection_factory;
mod connector;
mod endpoint;
mod error;
mod instance;
mod invocation;
mod message;
mod properties;
mod proxy;
mod reference;
mod resolver;
mod selector;
mod thread_pool;
mod timer;
mod transport;

pub use adapter::{Current, DispatchResult, ObjectAdapter, Servant};
pub use communicator::{Communicator, CommunicatorObserver, InitData};
pub use connection::{CloseMode, Connection, Phase};
pub use endpoint::{EndpointProtocol, EndpointSpec};
pub use error::{
    EncodingError, InvocationError, LifecycleError, LocalError, ProtocolError, TransportError,
};
pub use invocation::{CancelHandle, InvocationFuture};
pub use message::{Context, ReplyData};
pub use properties::Properties;
pub use proxy::{Encapsulation, InvocationOutcome, ObjectPrx};
pub use reference::Reference;
pub use resolver::{NetworkProxy, ProtocolSupport};

// Wire-level names that show up in this crate's public signatures.
pub use verglas_wire::{
    EncodingVersion, EndpointSelection, Identity, InvocationMode, OperationMode, ReplyStatus,
    ToStringMode, ENCODING_1_0, ENCODING_1_1,
};
