//! Class and exception marshaling across both encodings: linked structures,
//! cycles, type-id compression, slicing with preservation, and the graph
//! depth bound.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use verglas_codec::{
    EncodingError, FactoryRegistry, InputStream, OutputStream, SlicedData, UserException, Value,
    ValuePtr, ValueSlot,
};
use verglas_wire::{ValueFormat, ENCODING_1_0, ENCODING_1_1};

const NODE_ID: &str = "::Test::Node";
const BASE_ID: &str = "::Test::Base";
const DERIVED_ID: &str = "::Test::Derived";

/// A singly linked node; `next` may form cycles.
#[derive(Default)]
struct Node {
    value: i32,
    next: ValueSlot,
}

impl Node {
    fn new_ptr(value: i32) -> ValuePtr {
        Rc::new(RefCell::new(Node { value, next: ValueSlot::default() }))
    }
}

impl Value for Node {
    fn type_id(&self) -> &str {
        NODE_ID
    }

    fn marshal(&self, out: &mut OutputStream) -> Result<(), EncodingError> {
        out.start_value(None)?;
        out.start_slice(NODE_ID, -1, true)?;
        out.write_i32(self.value);
        out.write_value(self.next.get().as_ref())?;
        out.end_slice()?;
        out.end_value()
    }

    fn unmarshal(&mut self, input: &mut InputStream) -> Result<(), EncodingError> {
        input.start_value()?;
        input.start_slice()?;
        self.value = input.read_i32()?;
        input.read_value_into(&self.next)?;
        input.end_slice()?;
        input.end_value(false)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Base of a two-level hierarchy; keeps slices of unknown derived types.
#[derive(Default)]
struct Base {
    b: i32,
    preserved: Option<SlicedData>,
}

impl Value for Base {
    fn type_id(&self) -> &str {
        BASE_ID
    }

    fn marshal(&self, out: &mut OutputStream) -> Result<(), EncodingError> {
        out.start_value(self.preserved.as_ref())?;
        out.start_slice(BASE_ID, -1, true)?;
        out.write_i32(self.b);
        out.end_slice()?;
        out.end_value()
    }

    fn unmarshal(&mut self, input: &mut InputStream) -> Result<(), EncodingError> {
        input.start_value()?;
        input.start_slice()?;
        self.b = input.read_i32()?;
        input.end_slice()?;
        self.preserved = input.end_value(true)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Default)]
struct Derived {
    b: i32,
    d: String,
}

impl Value for Derived {
    fn type_id(&self) -> &str {
        DERIVED_ID
    }

    fn marshal(&self, out: &mut OutputStream) -> Result<(), EncodingError> {
        out.start_value(None)?;
        out.start_slice(DERIVED_ID, -1, false)?;
        out.write_string(&self.d)?;
        out.end_slice()?;
        out.start_slice(BASE_ID, -1, true)?;
        out.write_i32(self.b);
        out.end_slice()?;
        out.end_value()
    }

    fn unmarshal(&mut self, input: &mut InputStream) -> Result<(), EncodingError> {
        input.start_value()?;
        input.start_slice()?;
        self.d = input.read_string()?;
        input.end_slice()?;
        input.start_slice()?;
        self.b = input.read_i32()?;
        input.end_slice()?;
        input.end_value(false)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Default)]
struct PingError {
    reason: String,
    node: ValueSlot,
}

const PING_ERROR_ID: &str = "::Test::PingError";

impl UserException for PingError {
    fn type_id(&self) -> &str {
        PING_ERROR_ID
    }

    fn uses_classes(&self) -> bool {
        true
    }

    fn marshal(&self, out: &mut OutputStream) -> Result<(), EncodingError> {
        out.start_exception()?;
        out.start_slice(PING_ERROR_ID, -1, true)?;
        out.write_string(&self.reason)?;
        out.write_value(self.node.get().as_ref())?;
        out.end_slice()?;
        out.end_exception()
    }

    fn unmarshal(&mut self, input: &mut InputStream) -> Result<(), EncodingError> {
        input.start_exception()?;
        input.start_slice()?;
        self.reason = input.read_string()?;
        input.read_value_into(&self.node)?;
        input.end_slice()?;
        input.end_exception(false)?;
        Ok(())
    }
}

fn registry() -> Arc<FactoryRegistry> {
    let registry = FactoryRegistry::new();
    registry.add_value::<Node>(NODE_ID);
    registry.add_value::<Base>(BASE_ID);
    registry.add_value::<Derived>(DERIVED_ID);
    registry.add_exception::<PingError>(PING_ERROR_ID);
    Arc::new(registry)
}

fn node_value(v: &ValuePtr) -> i32 {
    v.borrow().as_any().downcast_ref::<Node>().unwrap().value
}

fn node_next(v: &ValuePtr) -> Option<ValuePtr> {
    v.borrow().as_any().downcast_ref::<Node>().unwrap().next.get()
}

fn decode_one(
    bytes: bytes::Bytes,
    encoding: verglas_wire::EncodingVersion,
) -> Result<ValuePtr, EncodingError> {
    let mut input = InputStream::new(bytes, encoding);
    input.set_factories(registry());
    let slot = ValueSlot::default();
    input.read_value_into(&slot)?;
    input.read_pending_values()?;
    Ok(slot.get().expect("non-nil instance"))
}

#[test]
fn linked_list_roundtrip_1_1() {
    let a = Node::new_ptr(1);
    let b = Node::new_ptr(2);
    a.borrow().as_any().downcast_ref::<Node>().unwrap().next.set(Some(b.clone()));

    let mut out = OutputStream::new(ENCODING_1_1);
    out.write_value(Some(&a)).unwrap();
    out.write_pending_values().unwrap();

    let decoded = decode_one(out.finished(), ENCODING_1_1).unwrap();
    assert_eq!(node_value(&decoded), 1);
    let next = node_next(&decoded).unwrap();
    assert_eq!(node_value(&next), 2);
    assert!(node_next(&next).is_none());
}

#[test]
fn linked_list_roundtrip_1_0() {
    let a = Node::new_ptr(10);
    let b = Node::new_ptr(20);
    a.borrow().as_any().downcast_ref::<Node>().unwrap().next.set(Some(b.clone()));

    let mut out = OutputStream::new(ENCODING_1_0);
    out.write_value(Some(&a)).unwrap();
    out.write_pending_values().unwrap();

    let decoded = decode_one(out.finished(), ENCODING_1_0).unwrap();
    assert_eq!(node_value(&decoded), 10);
    assert_eq!(node_value(&node_next(&decoded).unwrap()), 20);
}

#[test]
fn cycle_preserves_identity() {
    for format in [ValueFormat::Compact, ValueFormat::Sliced] {
        let a = Node::new_ptr(1);
        let b = Node::new_ptr(2);
        a.borrow().as_any().downcast_ref::<Node>().unwrap().next.set(Some(b.clone()));
        b.borrow().as_any().downcast_ref::<Node>().unwrap().next.set(Some(a.clone()));

        let mut out = OutputStream::new(ENCODING_1_1);
        out.set_format(format);
        out.write_value(Some(&a)).unwrap();
        out.write_pending_values().unwrap();

        let a2 = decode_one(out.finished(), ENCODING_1_1).unwrap();
        let b2 = node_next(&a2).unwrap();
        assert_eq!(node_value(&a2), 1);
        assert_eq!(node_value(&b2), 2);
        // The reference back from b must be the same instance, not a copy.
        let back = node_next(&b2).unwrap();
        assert!(Rc::ptr_eq(&a2, &back));
    }
}

#[test]
fn cycle_preserves_identity_1_0() {
    let a = Node::new_ptr(1);
    let b = Node::new_ptr(2);
    a.borrow().as_any().downcast_ref::<Node>().unwrap().next.set(Some(b.clone()));
    b.borrow().as_any().downcast_ref::<Node>().unwrap().next.set(Some(a.clone()));

    let mut out = OutputStream::new(ENCODING_1_0);
    out.write_value(Some(&a)).unwrap();
    out.write_pending_values().unwrap();

    let a2 = decode_one(out.finished(), ENCODING_1_0).unwrap();
    let b2 = node_next(&a2).unwrap();
    let back = node_next(&b2).unwrap();
    assert!(Rc::ptr_eq(&a2, &back));
}

#[test]
fn shared_reference_decodes_to_one_instance() {
    let shared = Node::new_ptr(7);
    let mut out = OutputStream::new(ENCODING_1_1);
    out.write_value(Some(&shared)).unwrap();
    out.write_value(Some(&shared)).unwrap();
    out.write_pending_values().unwrap();

    let mut input = InputStream::new(out.finished(), ENCODING_1_1);
    input.set_factories(registry());
    let first = ValueSlot::default();
    let second = ValueSlot::default();
    input.read_value_into(&first).unwrap();
    input.read_value_into(&second).unwrap();
    input.read_pending_values().unwrap();
    assert!(Rc::ptr_eq(&first.get().unwrap(), &second.get().unwrap()));
}

#[test]
fn nil_reference() {
    let mut out = OutputStream::new(ENCODING_1_1);
    out.write_value(None).unwrap();
    out.write_pending_values().unwrap();

    let mut input = InputStream::new(out.finished(), ENCODING_1_1);
    input.set_factories(registry());
    let slot = ValueSlot::new(Some(Node::new_ptr(9)));
    input.read_value_into(&slot).unwrap();
    assert!(slot.is_nil());
}

#[test]
fn unknown_derived_slices_to_base_and_remarshal_restores_it() {
    let derived: ValuePtr =
        Rc::new(RefCell::new(Derived { b: 5, d: "payload".to_string() }));

    let mut out = OutputStream::new(ENCODING_1_1);
    out.set_format(ValueFormat::Sliced);
    out.write_value(Some(&derived)).unwrap();

    // The first receiver only knows Base.
    let partial = FactoryRegistry::new();
    partial.add_value::<Base>(BASE_ID);
    let mut input = InputStream::new(out.finished(), ENCODING_1_1);
    input.set_factories(Arc::new(partial));
    let slot = ValueSlot::default();
    input.read_value_into(&slot).unwrap();
    let sliced = slot.get().unwrap();
    {
        let v = sliced.borrow();
        let base = v.as_any().downcast_ref::<Base>().unwrap();
        assert_eq!(base.b, 5);
        let preserved = base.preserved.as_ref().expect("preserved slices");
        assert_eq!(preserved.slices.len(), 1);
        assert_eq!(preserved.slices[0].type_id, DERIVED_ID);
    }

    // Re-marshal through the intermediary and decode with full knowledge.
    let mut out = OutputStream::new(ENCODING_1_1);
    out.set_format(ValueFormat::Sliced);
    out.write_value(Some(&sliced)).unwrap();
    let full = decode_one(out.finished(), ENCODING_1_1).unwrap();
    let v = full.borrow();
    let derived2 = v.as_any().downcast_ref::<Derived>().unwrap();
    assert_eq!(derived2.b, 5);
    assert_eq!(derived2.d, "payload");
}

#[test]
fn fully_unknown_type_becomes_placeholder_with_slices() {
    let derived: ValuePtr =
        Rc::new(RefCell::new(Derived { b: 3, d: "x".to_string() }));
    let mut out = OutputStream::new(ENCODING_1_1);
    out.set_format(ValueFormat::Sliced);
    out.write_value(Some(&derived)).unwrap();

    let mut input = InputStream::new(out.finished(), ENCODING_1_1);
    input.set_factories(Arc::new(FactoryRegistry::new()));
    let slot = ValueSlot::default();
    input.read_value_into(&slot).unwrap();
    let unknown = slot.get().unwrap();
    assert_eq!(Value::type_id(&*unknown.borrow()), DERIVED_ID);

    // Relay it onward and decode it fully.
    let mut out = OutputStream::new(ENCODING_1_1);
    out.set_format(ValueFormat::Sliced);
    out.write_value(Some(&unknown)).unwrap();
    let full = decode_one(out.finished(), ENCODING_1_1).unwrap();
    let v = full.borrow();
    let derived2 = v.as_any().downcast_ref::<Derived>().unwrap();
    assert_eq!(derived2.b, 3);
    assert_eq!(derived2.d, "x");
}

#[test]
fn unknown_type_without_slicing_is_no_value_factory() {
    let derived: ValuePtr = Rc::new(RefCell::new(Derived { b: 1, d: String::new() }));
    let mut out = OutputStream::new(ENCODING_1_1);
    out.set_format(ValueFormat::Sliced);
    out.write_value(Some(&derived)).unwrap();

    let mut input = InputStream::new(out.finished(), ENCODING_1_1);
    input.set_factories(Arc::new(FactoryRegistry::new()));
    input.set_slice_values(false);
    let slot = ValueSlot::default();
    assert!(matches!(
        input.read_value_into(&slot),
        Err(EncodingError::NoValueFactory { .. })
    ));
}

#[test]
fn graph_depth_at_limit_succeeds_and_beyond_fails() {
    let build_chain = |len: usize| {
        let head = Node::new_ptr(0);
        let mut tail = head.clone();
        for i in 1..len {
            let next = Node::new_ptr(i as i32);
            tail.borrow().as_any().downcast_ref::<Node>().unwrap().next.set(Some(next.clone()));
            tail = next;
        }
        head
    };

    let encode = |head: &ValuePtr| {
        let mut out = OutputStream::new(ENCODING_1_1);
        out.write_value(Some(head)).unwrap();
        out.finished()
    };

    let max = 8;

    let ok = build_chain(max);
    let mut input = InputStream::new(encode(&ok), ENCODING_1_1);
    input.set_factories(registry());
    input.set_class_graph_depth_max(max);
    let slot = ValueSlot::default();
    input.read_value_into(&slot).unwrap();

    let too_deep = build_chain(max + 1);
    let mut input = InputStream::new(encode(&too_deep), ENCODING_1_1);
    input.set_factories(registry());
    input.set_class_graph_depth_max(max);
    let slot = ValueSlot::default();
    assert!(matches!(
        input.read_value_into(&slot),
        Err(EncodingError::Marshal(_))
    ));
}

#[test]
fn exception_roundtrip_both_encodings() {
    for encoding in [ENCODING_1_0, ENCODING_1_1] {
        let node = Node::new_ptr(44);
        let ex = PingError { reason: "down".to_string(), node: ValueSlot::new(Some(node)) };

        let mut out = OutputStream::new(encoding);
        out.write_exception(&ex).unwrap();

        let mut input = InputStream::new(out.finished(), encoding);
        input.set_factories(registry());
        let decoded = input.read_exception().unwrap();
        assert_eq!(UserException::type_id(&*decoded), PING_ERROR_ID);
    }
}

#[test]
fn unknown_exception_reports_most_derived_id() {
    let ex = PingError { reason: "gone".to_string(), node: ValueSlot::default() };
    let mut out = OutputStream::new(ENCODING_1_1);
    out.write_exception(&ex).unwrap();

    let mut input = InputStream::new(out.finished(), ENCODING_1_1);
    input.set_factories(Arc::new(FactoryRegistry::new()));
    let err = input.read_exception().err().expect("decode should fail");
    match err {
        EncodingError::NoValueFactory { type_id } => assert_eq!(type_id, PING_ERROR_ID),
        other => panic!("expected NoValueFactory, got {other}"),
    }
}
