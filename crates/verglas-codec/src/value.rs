use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use crate::{EncodingError, InputStream, OutputStream};

/// A class instance travelling through a stream.
///
/// Instances are reference-counted and single-threaded: a graph is decoded
/// on one thread and handed off whole. Interior mutability is required
/// because cyclic graphs patch members after the instance was created.
pub type ValuePtr = Rc<RefCell<dyn Value>>;

/// Callback resolving a class reference once the instance is available.
///
/// `None` means a nil reference. Decoders queue these for forward
/// references and run them as instances materialize.
pub type PatchFn = Box<dyn FnOnce(Option<ValuePtr>) -> Result<(), EncodingError>>;

/// A concrete Slice class.
///
/// Implementations mirror what a code generator would emit: `marshal`
/// brackets the members with `start_value`/`start_slice` calls, one slice
/// per inheritance level from most derived to the root.
pub trait Value: Any {
    /// Most-derived type id, e.g. `::Demo::Node`.
    fn type_id(&self) -> &str;

    /// Numeric compact type id, or -1 when the class has none.
    fn compact_id(&self) -> i32 {
        -1
    }

    fn marshal(&self, out: &mut OutputStream) -> Result<(), EncodingError>;

    fn unmarshal(&mut self, input: &mut InputStream) -> Result<(), EncodingError>;

    /// Slices preserved from a previous decode, re-marshaled under the
    /// sliced format.
    fn sliced_data(&self) -> Option<&SlicedData> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Holder for a class-typed member.
///
/// Class references may resolve after the owning instance's `unmarshal`
/// returned (forward references, 1.0 pending batches), and may resolve
/// while the owning instance is still mutably borrowed (cycles). The slot
/// gives the decoder a stable, independently borrowable place to patch.
#[derive(Clone, Default)]
pub struct ValueSlot(Rc<RefCell<Option<ValuePtr>>>);

impl ValueSlot {
    pub fn new(v: Option<ValuePtr>) -> Self {
        ValueSlot(Rc::new(RefCell::new(v)))
    }

    pub fn get(&self) -> Option<ValuePtr> {
        self.0.borrow().clone()
    }

    pub fn set(&self, v: Option<ValuePtr>) {
        *self.0.borrow_mut() = v;
    }

    pub fn is_nil(&self) -> bool {
        self.0.borrow().is_none()
    }

    /// Patch function writing into this slot.
    pub fn patch(&self) -> PatchFn {
        let slot = self.0.clone();
        Box::new(move |v| {
            *slot.borrow_mut() = v;
            Ok(())
        })
    }
}

impl std::fmt::Debug for ValueSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.0.borrow() {
            Some(_) => f.write_str("ValueSlot(..)"),
            None => f.write_str("ValueSlot(nil)"),
        }
    }
}

/// One preserved slice of a class or exception.
#[derive(Clone)]
pub struct SliceInfo {
    /// Slice type id; empty when only a compact id was sent.
    pub type_id: String,
    /// Compact type id, or -1.
    pub compact_id: i32,
    /// The slice body, optional members included, header excluded.
    pub bytes: Vec<u8>,
    /// Instances referenced from within this slice.
    pub instances: Vec<ValuePtr>,
    pub has_optional_members: bool,
    pub is_last_slice: bool,
}

/// All slices preserved while decoding an instance of a partially known
/// type, kept so an intermediary can re-marshal them verbatim.
#[derive(Clone, Default)]
pub struct SlicedData {
    pub slices: Vec<SliceInfo>,
}

/// Placeholder instance for a type with no registered factory, decoded
/// under the sliced format. It carries the preserved slices and nothing
/// else.
pub struct UnknownSlicedValue {
    type_id: String,
    sliced_data: SlicedData,
}

impl UnknownSlicedValue {
    pub fn new(type_id: String) -> Self {
        UnknownSlicedValue { type_id, sliced_data: SlicedData::default() }
    }

    pub(crate) fn set_sliced_data(&mut self, data: SlicedData) {
        self.sliced_data = data;
    }
}

impl Value for UnknownSlicedValue {
    fn type_id(&self) -> &str {
        &self.type_id
    }

    fn marshal(&self, out: &mut OutputStream) -> Result<(), EncodingError> {
        out.start_value(Some(&self.sliced_data))?;
        out.end_value()
    }

    fn unmarshal(&mut self, _input: &mut InputStream) -> Result<(), EncodingError> {
        // The decoder never calls this; unknown instances are built from
        // the preserved slices directly.
        Err(EncodingError::marshal("unknown sliced value cannot unmarshal itself"))
    }

    fn sliced_data(&self) -> Option<&SlicedData> {
        Some(&self.sliced_data)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A declared exception raised by a servant and carried in a reply.
pub trait UserException {
    /// Most-derived type id.
    fn type_id(&self) -> &str;

    /// Whether any member, at any inheritance level, is class-typed. Under
    /// the 1.0 encoding this gates the trailing pending-values block.
    fn uses_classes(&self) -> bool {
        false
    }

    fn marshal(&self, out: &mut OutputStream) -> Result<(), EncodingError>;

    fn unmarshal(&mut self, input: &mut InputStream) -> Result<(), EncodingError>;
}

/// Hook applied to every string crossing the stream, for installations
/// whose native narrow encoding is not UTF-8.
pub trait StringConverter: Send + Sync {
    /// Convert a host string to its wire (UTF-8) form.
    fn to_wire(&self, s: &str) -> Result<String, EncodingError>;

    /// Convert a wire string to its host form.
    fn from_wire(&self, s: String) -> Result<String, EncodingError>;
}
