//! Wire-level types shared by the codec and the connection runtime.
//!
//! Everything in this crate maps one-to-one onto bytes: frame headers,
//! protocol and encoding versions, message and reply kinds, identities and
//! the per-slice metadata carried by the class encoding. No I/O happens
//! here; the codec and runtime crates do the reading and writing.

mod header;
mod identity;
mod mode;
mod reply;
mod slicing;
mod version;

pub use header::*;
pub use identity::*;
pub use mode::*;
pub use reply::*;
pub use slicing::*;
pub use version::*;
