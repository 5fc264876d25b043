//! Marshaling for the Slice binary encoding, versions 1.0 and 1.1.
//!
//! The two entry points are [`OutputStream`] and [`InputStream`]. Both keep
//! an explicit encapsulation stack and the class/exception slice machinery
//! behind `start_value`/`start_slice`-style calls, so hand-written and
//! generated marshaling code share one surface.
//!
//! Encoding rules in brief:
//! - multi-byte integers and floats are little-endian
//! - `size` is one byte below 255, otherwise `255` + non-negative i32
//! - encapsulations carry a 6-byte header (i32 size including itself,
//!   encoding major, encoding minor) and nest
//! - tagged members exist only under 1.1 and end with `0xFF`
//! - class graphs may contain cycles; instances marshal once and are
//!   referenced by integer id afterwards

mod buffer;
mod error;
mod factory;
mod input;
mod output;
mod value;

pub use buffer::*;
pub use error::*;
pub use factory::*;
pub use input::*;
pub use output::*;
pub use value::*;
