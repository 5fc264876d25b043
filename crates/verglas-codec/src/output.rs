use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use verglas_wire::{
    EncodingVersion, SliceFlags, TagFormat, ValueFormat, ENCODING_1_0, TAG_END_MARKER,
};

use crate::{Buffer, EncodingError, SlicedData, StringConverter, UserException, ValuePtr};

/// Type id of the root class slice, terminating 1.0 instance encodings.
pub(crate) const OBJECT_TYPE_ID: &str = "::Ice::Object";

/// Stream writing the binary encoding.
///
/// The stream owns a [`Buffer`] that only ever grows; sizes that cannot be
/// known upfront (encapsulations, slice sizes) are written as placeholders
/// and patched when the enclosing scope ends.
///
/// Class instances marshal themselves by calling back into the stream, so
/// the slice machinery keeps its state here rather than in the instances:
/// at most one encoder exists per stream, owned by the innermost
/// encapsulation.
pub struct OutputStream {
    buf: Buffer,
    encoding: EncodingVersion,
    format: ValueFormat,
    converter: Option<Arc<dyn StringConverter>>,
    encaps: Option<Box<Encaps>>,
}

struct Encaps {
    start: usize,
    encoding: EncodingVersion,
    format: ValueFormat,
    encoder: Option<Encoder>,
    previous: Option<Box<Encaps>>,
}

enum Encoder {
    V10(Encoder10),
    V11(Encoder11),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum EncoderKind {
    V10,
    V11,
}

/// Marker for a pending four-byte length patched by [`OutputStream::end_size`].
#[derive(Debug)]
#[must_use]
pub struct SizePatch {
    pos: usize,
}

impl OutputStream {
    pub fn new(encoding: EncodingVersion) -> Self {
        OutputStream {
            buf: Buffer::new(),
            encoding,
            format: ValueFormat::default(),
            converter: None,
            encaps: None,
        }
    }

    pub fn with_capacity(encoding: EncodingVersion, cap: usize) -> Self {
        let mut stream = Self::new(encoding);
        stream.buf = Buffer::with_capacity(cap);
        stream
    }

    /// Select the class marshaling format for encapsulations started after
    /// this call.
    pub fn set_format(&mut self, format: ValueFormat) {
        self.format = format;
    }

    pub fn set_string_converter(&mut self, converter: Arc<dyn StringConverter>) {
        self.converter = Some(converter);
    }

    /// Encoding of the innermost open encapsulation, or of the stream.
    pub fn encoding(&self) -> EncodingVersion {
        match &self.encaps {
            Some(e) => e.encoding,
            None => self.encoding,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_slice()
    }

    /// Consume the stream, returning the marshaled bytes.
    pub fn finished(self) -> Bytes {
        self.buf.freeze()
    }

    // --- primitives ---------------------------------------------------

    pub fn write_u8(&mut self, v: u8) {
        self.buf.append(&[v]);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.append(&[u8::from(v)]);
    }

    pub fn write_i16(&mut self, v: i16) {
        self.buf.append(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.append(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.append(&v.to_le_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.append(&v.to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.append(&v.to_le_bytes());
    }

    /// Append raw bytes with no length prefix.
    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.buf.append(bytes);
    }

    /// Write a `size`: one byte below 255, else the 255 escape plus i32.
    pub fn write_size(&mut self, v: i32) -> Result<(), EncodingError> {
        if v < 0 {
            return Err(EncodingError::marshal("negative size"));
        }
        if v < 255 {
            self.write_u8(v as u8);
        } else {
            self.write_u8(255);
            self.write_i32(v);
        }
        Ok(())
    }

    pub fn write_string(&mut self, v: &str) -> Result<(), EncodingError> {
        match self.converter.clone() {
            Some(conv) => {
                let converted = conv.to_wire(v)?;
                self.write_string_raw(&converted)
            }
            None => self.write_string_raw(v),
        }
    }

    /// Write a string bypassing the converter; type ids always use this.
    pub(crate) fn write_string_raw(&mut self, v: &str) -> Result<(), EncodingError> {
        self.write_size(v.len() as i32)?;
        self.buf.append(v.as_bytes());
        Ok(())
    }

    /// Write an enumerator. Under 1.0 the width is chosen from the enum's
    /// maximum value; under 1.1 it is a `size`.
    pub fn write_enum(&mut self, v: i32, max_value: i32) -> Result<(), EncodingError> {
        if self.encoding() == ENCODING_1_0 {
            if max_value < 127 {
                self.write_u8(v as u8);
            } else if max_value < 32767 {
                self.write_i16(v as i16);
            } else {
                self.write_i32(v);
            }
            Ok(())
        } else {
            self.write_size(v)
        }
    }

    // --- sequences ----------------------------------------------------

    pub fn write_byte_seq(&mut self, v: &[u8]) -> Result<(), EncodingError> {
        self.write_size(v.len() as i32)?;
        self.buf.append(v);
        Ok(())
    }

    pub fn write_bool_seq(&mut self, v: &[bool]) -> Result<(), EncodingError> {
        self.write_size(v.len() as i32)?;
        for &b in v {
            self.write_bool(b);
        }
        Ok(())
    }

    pub fn write_i16_seq(&mut self, v: &[i16]) -> Result<(), EncodingError> {
        self.write_size(v.len() as i32)?;
        for &x in v {
            self.write_i16(x);
        }
        Ok(())
    }

    pub fn write_i32_seq(&mut self, v: &[i32]) -> Result<(), EncodingError> {
        self.write_size(v.len() as i32)?;
        for &x in v {
            self.write_i32(x);
        }
        Ok(())
    }

    pub fn write_i64_seq(&mut self, v: &[i64]) -> Result<(), EncodingError> {
        self.write_size(v.len() as i32)?;
        for &x in v {
            self.write_i64(x);
        }
        Ok(())
    }

    pub fn write_f32_seq(&mut self, v: &[f32]) -> Result<(), EncodingError> {
        self.write_size(v.len() as i32)?;
        for &x in v {
            self.write_f32(x);
        }
        Ok(())
    }

    pub fn write_f64_seq(&mut self, v: &[f64]) -> Result<(), EncodingError> {
        self.write_size(v.len() as i32)?;
        for &x in v {
            self.write_f64(x);
        }
        Ok(())
    }

    pub fn write_string_seq<S: AsRef<str>>(&mut self, v: &[S]) -> Result<(), EncodingError> {
        self.write_size(v.len() as i32)?;
        for s in v {
            self.write_string(s.as_ref())?;
        }
        Ok(())
    }

    /// Write a `dict<string, string>`; iteration order is the map's, which
    /// for a `BTreeMap` keeps the wire form deterministic.
    pub fn write_string_dict(
        &mut self,
        v: &std::collections::BTreeMap<String, String>,
    ) -> Result<(), EncodingError> {
        self.write_size(v.len() as i32)?;
        for (key, value) in v {
            self.write_string(key)?;
            self.write_string(value)?;
        }
        Ok(())
    }

    // --- deferred sizes -----------------------------------------------

    /// Write a four-byte placeholder; [`OutputStream::end_size`] patches it
    /// with the number of bytes written in between.
    pub fn start_size(&mut self) -> SizePatch {
        self.write_i32(0);
        SizePatch { pos: self.buf.len() }
    }

    pub fn end_size(&mut self, patch: SizePatch) {
        let len = (self.buf.len() - patch.pos) as i32;
        self.buf.patch(patch.pos - 4, &len.to_le_bytes());
    }

    // --- encapsulations -----------------------------------------------

    /// Open an encapsulation inheriting the current encoding and format.
    pub fn start_encapsulation(&mut self) -> Result<(), EncodingError> {
        match &self.encaps {
            Some(e) => {
                let (encoding, format) = (e.encoding, e.format);
                self.start_encapsulation_with(encoding, Some(format))
            }
            None => self.start_encapsulation_with(self.encoding, None),
        }
    }

    /// Open an encapsulation with an explicit encoding; `format` defaults
    /// to the stream's.
    pub fn start_encapsulation_with(
        &mut self,
        encoding: EncodingVersion,
        format: Option<ValueFormat>,
    ) -> Result<(), EncodingError> {
        if !encoding.is_supported() {
            return Err(EncodingError::UnsupportedEncoding(encoding));
        }
        let encaps = Box::new(Encaps {
            start: self.buf.len(),
            encoding,
            format: format.unwrap_or(self.format),
            encoder: None,
            previous: self.encaps.take(),
        });
        self.encaps = Some(encaps);
        self.write_i32(0); // Placeholder for the size, includes itself.
        self.write_u8(encoding.major);
        self.write_u8(encoding.minor);
        Ok(())
    }

    /// Close the innermost encapsulation, patching its size.
    pub fn end_encapsulation(&mut self) -> Result<(), EncodingError> {
        let encaps = self
            .encaps
            .take()
            .ok_or_else(|| EncodingError::encaps("no open encapsulation"))?;
        let sz = (self.buf.len() - encaps.start) as i32;
        self.buf.patch(encaps.start, &sz.to_le_bytes());
        self.encaps = encaps.previous;
        Ok(())
    }

    /// Write the six header bytes of an empty encapsulation.
    pub fn write_empty_encapsulation(
        &mut self,
        encoding: EncodingVersion,
    ) -> Result<(), EncodingError> {
        if !encoding.is_supported() {
            return Err(EncodingError::UnsupportedEncoding(encoding));
        }
        self.write_i32(6);
        self.write_u8(encoding.major);
        self.write_u8(encoding.minor);
        Ok(())
    }

    // --- tagged members -----------------------------------------------

    /// Write the descriptor for a tagged member. Returns false (writing
    /// nothing) under the 1.0 encoding, which has no tagged members; the
    /// caller must then skip the value too.
    pub fn write_tag(&mut self, tag: i32, format: TagFormat) -> Result<bool, EncodingError> {
        if self.encoding() == ENCODING_1_0 {
            return Ok(false);
        }
        let fmt = format as u8;
        if tag < 30 {
            self.write_u8(fmt | ((tag as u8) << 3));
        } else {
            self.write_u8(fmt | 0xF0);
            self.write_size(tag)?;
        }
        let _ = self.enc11(|enc| {
            if let Some(current) = enc.instances.last_mut() {
                current.slice_flags |= SliceFlags::HAS_OPTIONAL_MEMBERS;
            }
        });
        Ok(true)
    }

    pub fn write_tagged_i32(&mut self, tag: i32, v: Option<i32>) -> Result<(), EncodingError> {
        if let Some(v) = v {
            if self.write_tag(tag, TagFormat::F4)? {
                self.write_i32(v);
            }
        }
        Ok(())
    }

    pub fn write_tagged_f64(&mut self, tag: i32, v: Option<f64>) -> Result<(), EncodingError> {
        if let Some(v) = v {
            if self.write_tag(tag, TagFormat::F8)? {
                self.write_f64(v);
            }
        }
        Ok(())
    }

    pub fn write_tagged_string(&mut self, tag: i32, v: Option<&str>) -> Result<(), EncodingError> {
        if let Some(v) = v {
            if self.write_tag(tag, TagFormat::VSize)? {
                self.write_string(v)?;
            }
        }
        Ok(())
    }

    pub fn write_tagged_byte_seq(
        &mut self,
        tag: i32,
        v: Option<&[u8]>,
    ) -> Result<(), EncodingError> {
        if let Some(v) = v {
            if self.write_tag(tag, TagFormat::VSize)? {
                self.write_byte_seq(v)?;
            }
        }
        Ok(())
    }

    /// End marker for the tagged members of a slice or encapsulation body.
    pub fn write_tag_end_marker(&mut self) {
        self.write_u8(TAG_END_MARKER);
    }

    // --- classes and exceptions ---------------------------------------

    /// Write a class reference. The instance itself is marshaled inline
    /// (1.1), through the slice indirection table (1.1 sliced), or in the
    /// trailing pending section (1.0).
    pub fn write_value(&mut self, v: Option<&ValuePtr>) -> Result<(), EncodingError> {
        self.init_encoder();
        match self.encoder_kind()? {
            EncoderKind::V10 => {
                let id = match v {
                    Some(v) => self.enc10(|enc| -enc.register(v))?,
                    None => 0,
                };
                self.write_i32(id);
                Ok(())
            }
            EncoderKind::V11 => {
                let Some(v) = v else {
                    return self.write_size(0); // Nil reference.
                };
                // Within a slice under the sliced format the reference is
                // an index into the slice's indirection table, emitted
                // after the body so unknown slices stay skippable.
                let table_index = self.enc11(|enc| {
                    if enc.format != ValueFormat::Sliced {
                        return None;
                    }
                    let current = enc.instances.last_mut()?;
                    let key = ptr_key(v);
                    Some(match current.indirection_ids.get(&key) {
                        Some(&idx) => idx,
                        None => {
                            current.indirection_table.push(v.clone());
                            let idx = current.indirection_table.len() as i32;
                            current.indirection_ids.insert(key, idx);
                            idx
                        }
                    })
                })?;
                match table_index {
                    Some(idx) => self.write_size(idx),
                    None => {
                        let v = v.clone();
                        self.write_instance_11(&v)
                    }
                }
            }
        }
    }

    /// Flush instances queued by 1.0 class references. Must be called at
    /// the end of any 1.0 encapsulation whose types use classes, even when
    /// no instance was written.
    pub fn write_pending_values(&mut self) -> Result<(), EncodingError> {
        match self.encoder_kind() {
            Ok(EncoderKind::V10) => {
                loop {
                    // Marshaling a batch can queue further instances;
                    // consider the current batch marshaled first so
                    // re-references resolve to it.
                    let batch = self.enc10(|enc| {
                        let batch = std::mem::take(&mut enc.to_be_marshaled);
                        for (v, id) in &batch {
                            enc.marshaled_ids.insert(ptr_key(v), *id);
                            enc.marshaled_roster.push(v.clone());
                        }
                        enc.to_be_marshaled_ids.clear();
                        batch
                    })?;
                    if batch.is_empty() {
                        break;
                    }
                    self.write_size(batch.len() as i32)?;
                    for (v, id) in &batch {
                        self.write_i32(*id);
                        let instance = v.borrow();
                        instance.marshal(self)?;
                    }
                }
                self.write_size(0) // End of the batches.
            }
            // 1.1 marshals instances inline; nothing is pending.
            Ok(EncoderKind::V11) => Ok(()),
            Err(_) if self.encoding() == ENCODING_1_0 => {
                // Class-typed data with no instance still requires the
                // empty pending sequence marker.
                self.write_size(0)
            }
            Err(_) => Ok(()),
        }
    }

    /// Marshal a user exception. The 1.0 encoding prefixes the uses-classes
    /// flag and flushes pending values afterwards.
    pub fn write_exception(&mut self, ex: &dyn UserException) -> Result<(), EncodingError> {
        self.init_encoder();
        if self.encoding() == ENCODING_1_0 {
            let uses_classes = ex.uses_classes();
            self.write_bool(uses_classes);
            ex.marshal(self)?;
            if uses_classes {
                self.write_pending_values()?;
            }
            Ok(())
        } else {
            ex.marshal(self)
        }
    }

    /// Begin marshaling an instance, optionally re-emitting preserved
    /// slices first.
    pub fn start_value(&mut self, sliced_data: Option<&SlicedData>) -> Result<(), EncodingError> {
        self.start_instance(SliceKind::Value, sliced_data)
    }

    pub fn end_value(&mut self) -> Result<(), EncodingError> {
        self.end_instance()
    }

    pub fn start_exception(&mut self) -> Result<(), EncodingError> {
        self.start_instance(SliceKind::Exception, None)
    }

    pub fn end_exception(&mut self) -> Result<(), EncodingError> {
        self.end_instance()
    }

    fn start_instance(
        &mut self,
        kind: SliceKind,
        sliced_data: Option<&SlicedData>,
    ) -> Result<(), EncodingError> {
        self.init_encoder();
        match self.encoder_kind()? {
            EncoderKind::V10 => self.enc10(|enc| {
                enc.slice_kind = kind;
                enc.has_slice = false;
            }),
            EncoderKind::V11 => {
                self.enc11(|enc| enc.instances.push(InstanceData::new(kind)))?;
                if let Some(data) = sliced_data {
                    let data = data.clone();
                    self.write_sliced_data_11(&data)?;
                }
                Ok(())
            }
        }
    }

    fn end_instance(&mut self) -> Result<(), EncodingError> {
        match self.encoder_kind()? {
            EncoderKind::V10 => {
                let kind = self.enc10(|enc| enc.slice_kind)?;
                if kind == SliceKind::Value {
                    // The terminating root slice; its empty member list
                    // survives for compatibility with very old dispatch
                    // implementations.
                    self.start_slice(OBJECT_TYPE_ID, -1, true)?;
                    self.write_size(0)?;
                    self.end_slice()?;
                }
                self.enc10(|enc| {
                    enc.slice_kind = SliceKind::Value;
                    enc.has_slice = false;
                })
            }
            EncoderKind::V11 => self
                .enc11(|enc| enc.instances.pop())?
                .map(|_| ())
                .ok_or_else(|| EncodingError::marshal("end_value without start_value")),
        }
    }

    /// Begin one slice of the instance being marshaled. `last` and
    /// `compact_id` only matter under the 1.1 encoding.
    pub fn start_slice(
        &mut self,
        type_id: &str,
        compact_id: i32,
        last: bool,
    ) -> Result<(), EncodingError> {
        match self.encoder_kind()? {
            EncoderKind::V10 => {
                let registered = self.enc10(|enc| {
                    if enc.slice_kind == SliceKind::Value {
                        Some(enc.type_ids.register(type_id))
                    } else {
                        None
                    }
                })?;
                match registered {
                    // Instance slices compress the type id; exception
                    // slices always carry the string.
                    Some(Some(index)) => {
                        self.write_bool(true);
                        self.write_size(index)?;
                    }
                    Some(None) => {
                        self.write_bool(false);
                        self.write_string_raw(type_id)?;
                    }
                    None => self.write_string_raw(type_id)?,
                }
                self.write_i32(0); // Placeholder for the slice size.
                let pos = self.buf.len();
                self.enc10(|enc| {
                    enc.write_slice = pos;
                    enc.has_slice = true;
                })
            }
            EncoderKind::V11 => self.start_slice_11(type_id, compact_id, last),
        }
    }

    pub fn end_slice(&mut self) -> Result<(), EncodingError> {
        match self.encoder_kind()? {
            EncoderKind::V10 => {
                let write_slice = self.enc10(|enc| enc.has_slice.then_some(enc.write_slice))?;
                let write_slice = write_slice
                    .ok_or_else(|| EncodingError::marshal("end_slice without start_slice"))?;
                // The slice size counts its own four bytes.
                let sz = (self.buf.len() - write_slice + 4) as i32;
                self.buf.patch(write_slice - 4, &sz.to_le_bytes());
                Ok(())
            }
            EncoderKind::V11 => self.end_slice_11(),
        }
    }

    // --- 1.1 slice machinery ------------------------------------------

    fn write_instance_11(&mut self, v: &ValuePtr) -> Result<(), EncodingError> {
        let existing = self.enc11(|enc| {
            let key = ptr_key(v);
            match enc.marshaled_ids.get(&key) {
                Some(&id) => Some(id),
                None => {
                    enc.value_id_index += 1;
                    enc.marshaled_ids.insert(key, enc.value_id_index);
                    enc.marshaled_roster.push(v.clone());
                    None
                }
            }
        })?;
        match existing {
            Some(id) => self.write_size(id),
            None => {
                self.write_size(1)?; // Instance marker; the slices follow.
                let instance = v.borrow();
                instance.marshal(self)
            }
        }
    }

    fn start_slice_11(
        &mut self,
        type_id: &str,
        compact_id: i32,
        last: bool,
    ) -> Result<(), EncodingError> {
        let (format, kind, first_slice) = self.enc11(|enc| {
            enc.instances
                .last()
                .map(|current| (enc.format, current.kind, current.first_slice))
        })?
        .ok_or_else(|| EncodingError::marshal("start_slice without start_value"))?;

        let flags_pos = self.buf.len();
        let mut flags = SliceFlags::empty();
        if format == ValueFormat::Sliced {
            flags |= SliceFlags::HAS_SLICE_SIZE;
        }
        if last {
            flags |= SliceFlags::IS_LAST_SLICE;
        }
        self.write_u8(0); // Placeholder for the slice flags.

        if kind == SliceKind::Value {
            // The compact format carries the type id only on the first
            // slice; the receiver is assumed to know the hierarchy.
            if format == ValueFormat::Sliced || first_slice {
                if compact_id >= 0 {
                    flags |= SliceFlags::HAS_TYPE_ID_COMPACT;
                    self.write_size(compact_id)?;
                } else {
                    match self.enc11(|enc| enc.type_ids.register(type_id))? {
                        Some(index) => {
                            flags |= SliceFlags::HAS_TYPE_ID_INDEX;
                            self.write_size(index)?;
                        }
                        None => {
                            flags |= SliceFlags::HAS_TYPE_ID_STRING;
                            self.write_string_raw(type_id)?;
                        }
                    }
                }
            }
        } else {
            self.write_string_raw(type_id)?;
        }

        if flags.contains(SliceFlags::HAS_SLICE_SIZE) {
            self.write_i32(0); // Placeholder for the slice size.
        }
        let write_slice = self.buf.len();
        self.enc11(|enc| {
            if let Some(current) = enc.instances.last_mut() {
                current.slice_flags = flags;
                current.slice_flags_pos = flags_pos;
                current.write_slice = write_slice;
                current.first_slice = false;
            }
        })
    }

    fn end_slice_11(&mut self) -> Result<(), EncodingError> {
        let state = self.enc11(|enc| {
            enc.instances.last_mut().map(|current| {
                current.indirection_ids.clear();
                (
                    current.slice_flags,
                    current.slice_flags_pos,
                    current.write_slice,
                    std::mem::take(&mut current.indirection_table),
                )
            })
        })?;
        let (mut flags, flags_pos, write_slice, table) =
            state.ok_or_else(|| EncodingError::marshal("end_slice without start_slice"))?;

        if flags.contains(SliceFlags::HAS_OPTIONAL_MEMBERS) {
            self.write_u8(TAG_END_MARKER);
        }
        if flags.contains(SliceFlags::HAS_SLICE_SIZE) {
            // The slice size counts its own four bytes; the optional end
            // marker is part of the slice, the indirection table is not.
            let sz = (self.buf.len() - write_slice + 4) as i32;
            self.buf.patch(write_slice - 4, &sz.to_le_bytes());
        }
        if !table.is_empty() {
            flags |= SliceFlags::HAS_INDIRECTION_TABLE;
            self.write_size(table.len() as i32)?;
            for v in &table {
                self.write_instance_11(v)?;
            }
        }
        self.buf.patch(flags_pos, &[flags.bits()]);
        Ok(())
    }

    fn write_sliced_data_11(&mut self, data: &SlicedData) -> Result<(), EncodingError> {
        // Preserved slices only make sense under the sliced format; the
        // compact format slices the instance to its known type instead.
        let format = self.enc11(|enc| enc.format)?;
        if format != ValueFormat::Sliced {
            return Ok(());
        }
        for info in &data.slices {
            self.start_slice_11(&info.type_id, info.compact_id, info.is_last_slice)?;
            self.write_blob(&info.bytes);
            self.enc11(|enc| {
                if let Some(current) = enc.instances.last_mut() {
                    if info.has_optional_members {
                        current.slice_flags |= SliceFlags::HAS_OPTIONAL_MEMBERS;
                    }
                    current.indirection_table = info.instances.clone();
                }
            })?;
            self.end_slice_11()?;
        }
        Ok(())
    }

    // --- encoder plumbing ---------------------------------------------

    fn init_encoder(&mut self) {
        if self.encaps.is_none() {
            // Top-level class data outside an explicit encapsulation.
            let encaps = Box::new(Encaps {
                start: self.buf.len(),
                encoding: self.encoding,
                format: self.format,
                encoder: None,
                previous: None,
            });
            self.encaps = Some(encaps);
        }
        if let Some(encaps) = self.encaps.as_mut() {
            if encaps.encoder.is_none() {
                encaps.encoder = Some(if encaps.encoding == ENCODING_1_0 {
                    Encoder::V10(Encoder10::default())
                } else {
                    Encoder::V11(Encoder11::new(encaps.format))
                });
            }
        }
    }

    fn encoder_kind(&mut self) -> Result<EncoderKind, EncodingError> {
        match self.encaps.as_ref().and_then(|e| e.encoder.as_ref()) {
            Some(Encoder::V10(_)) => Ok(EncoderKind::V10),
            Some(Encoder::V11(_)) => Ok(EncoderKind::V11),
            None => Err(EncodingError::marshal("no class data in progress")),
        }
    }

    fn enc10<T>(&mut self, f: impl FnOnce(&mut Encoder10) -> T) -> Result<T, EncodingError> {
        match self.encaps.as_mut().and_then(|e| e.encoder.as_mut()) {
            Some(Encoder::V10(enc)) => Ok(f(enc)),
            _ => Err(EncodingError::marshal("no class data in progress")),
        }
    }

    fn enc11<T>(&mut self, f: impl FnOnce(&mut Encoder11) -> T) -> Result<T, EncodingError> {
        match self.encaps.as_mut().and_then(|e| e.encoder.as_mut()) {
            Some(Encoder::V11(enc)) => Ok(f(enc)),
            _ => Err(EncodingError::marshal("no class data in progress")),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SliceKind {
    Value,
    Exception,
}

fn ptr_key(v: &ValuePtr) -> usize {
    std::rc::Rc::as_ptr(v) as *const () as usize
}

/// Shared type-id compression table: first occurrence is written as a
/// string, later occurrences as a 1-based index.
#[derive(Default)]
struct TypeIdTable {
    ids: HashMap<String, i32>,
}

impl TypeIdTable {
    /// Returns the existing index, or None after registering a new id.
    fn register(&mut self, type_id: &str) -> Option<i32> {
        if let Some(&index) = self.ids.get(type_id) {
            return Some(index);
        }
        let index = self.ids.len() as i32 + 1;
        self.ids.insert(type_id.to_owned(), index);
        None
    }
}

/// 1.0 encoder state: references are negative table indices; instances are
/// flushed in trailing pending batches.
struct Encoder10 {
    slice_kind: SliceKind,
    has_slice: bool,
    type_ids: TypeIdTable,
    /// Instances referenced but not yet marshaled, in reference order.
    to_be_marshaled: Vec<(ValuePtr, i32)>,
    to_be_marshaled_ids: HashMap<usize, i32>,
    marshaled_ids: HashMap<usize, i32>,
    /// Keeps marshaled instances alive so their addresses stay unique.
    marshaled_roster: Vec<ValuePtr>,
    value_id_index: i32,
    write_slice: usize,
}

impl Default for Encoder10 {
    fn default() -> Self {
        Encoder10 {
            slice_kind: SliceKind::Value,
            has_slice: false,
            type_ids: TypeIdTable::default(),
            to_be_marshaled: Vec::new(),
            to_be_marshaled_ids: HashMap::new(),
            marshaled_ids: HashMap::new(),
            marshaled_roster: Vec::new(),
            value_id_index: 0,
            write_slice: 0,
        }
    }
}

impl Encoder10 {
    fn register(&mut self, v: &ValuePtr) -> i32 {
        let key = ptr_key(v);
        if let Some(&id) = self.to_be_marshaled_ids.get(&key) {
            return id;
        }
        if let Some(&id) = self.marshaled_ids.get(&key) {
            return id;
        }
        self.value_id_index += 1;
        let id = self.value_id_index;
        self.to_be_marshaled.push((v.clone(), id));
        self.to_be_marshaled_ids.insert(key, id);
        id
    }
}

/// 1.1 encoder state: instances marshal inline once and are referenced by
/// id afterwards; slices carry a flags byte and optional indirection
/// tables.
struct Encoder11 {
    format: ValueFormat,
    type_ids: TypeIdTable,
    marshaled_ids: HashMap<usize, i32>,
    marshaled_roster: Vec<ValuePtr>,
    value_id_index: i32,
    instances: Vec<InstanceData>,
}

struct InstanceData {
    kind: SliceKind,
    first_slice: bool,
    slice_flags: SliceFlags,
    slice_flags_pos: usize,
    write_slice: usize,
    indirection_table: Vec<ValuePtr>,
    indirection_ids: HashMap<usize, i32>,
}

impl InstanceData {
    fn new(kind: SliceKind) -> Self {
        InstanceData {
            kind,
            first_slice: true,
            slice_flags: SliceFlags::empty(),
            slice_flags_pos: 0,
            write_slice: 0,
            indirection_table: Vec::new(),
            indirection_ids: HashMap::new(),
        }
    }
}

impl Encoder11 {
    fn new(format: ValueFormat) -> Self {
        Encoder11 {
            format,
            type_ids: TypeIdTable::default(),
            marshaled_ids: HashMap::new(),
            marshaled_roster: Vec::new(),
            value_id_index: 1,
            instances: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verglas_wire::ENCODING_1_1;

    #[test]
    fn size_one_byte_form() {
        let mut out = OutputStream::new(ENCODING_1_1);
        out.write_size(254).unwrap();
        assert_eq!(out.as_slice(), &[254]);
    }

    #[test]
    fn size_five_byte_form() {
        let mut out = OutputStream::new(ENCODING_1_1);
        out.write_size(255).unwrap();
        assert_eq!(out.as_slice(), &[255, 255, 0, 0, 0]);
    }

    #[test]
    fn negative_size_is_rejected() {
        let mut out = OutputStream::new(ENCODING_1_1);
        assert!(out.write_size(-1).is_err());
    }

    #[test]
    fn primitives_are_little_endian() {
        let mut out = OutputStream::new(ENCODING_1_1);
        out.write_i32(0x0102_0304);
        out.write_i16(0x0506);
        assert_eq!(out.as_slice(), &[0x04, 0x03, 0x02, 0x01, 0x06, 0x05]);
    }

    #[test]
    fn empty_encapsulation_is_six_bytes() {
        let mut out = OutputStream::new(ENCODING_1_1);
        out.write_empty_encapsulation(ENCODING_1_1).unwrap();
        assert_eq!(out.as_slice(), &[6, 0, 0, 0, 1, 1]);
    }

    #[test]
    fn encapsulation_size_is_patched() {
        let mut out = OutputStream::new(ENCODING_1_1);
        out.start_encapsulation().unwrap();
        out.write_i32(7);
        out.end_encapsulation().unwrap();
        assert_eq!(out.as_slice(), &[10, 0, 0, 0, 1, 1, 7, 0, 0, 0]);
    }

    #[test]
    fn nested_encapsulations_patch_independently() {
        let mut out = OutputStream::new(ENCODING_1_1);
        out.start_encapsulation().unwrap();
        out.start_encapsulation().unwrap();
        out.write_u8(9);
        out.end_encapsulation().unwrap();
        out.end_encapsulation().unwrap();
        assert_eq!(out.as_slice(), &[13, 0, 0, 0, 1, 1, 7, 0, 0, 0, 1, 1, 9]);
    }

    #[test]
    fn tag_byte_forms() {
        let mut out = OutputStream::new(ENCODING_1_1);
        assert!(out.write_tag(2, TagFormat::F4).unwrap());
        assert_eq!(out.as_slice(), &[0x12]); // 2 << 3 | 2

        let mut out = OutputStream::new(ENCODING_1_1);
        assert!(out.write_tag(29, TagFormat::F1).unwrap());
        assert_eq!(out.as_slice(), &[0xE8]); // 29 << 3 | 0

        let mut out = OutputStream::new(ENCODING_1_1);
        assert!(out.write_tag(30, TagFormat::F1).unwrap());
        assert_eq!(out.as_slice(), &[0xF0, 30]); // escape form + size
    }

    #[test]
    fn tags_do_not_exist_under_1_0() {
        let mut out = OutputStream::new(ENCODING_1_0);
        assert!(!out.write_tag(2, TagFormat::F4).unwrap());
        assert!(out.as_slice().is_empty());
    }

    #[test]
    fn deferred_size_counts_following_bytes() {
        let mut out = OutputStream::new(ENCODING_1_1);
        let patch = out.start_size();
        out.write_blob(&[1, 2, 3]);
        out.end_size(patch);
        assert_eq!(out.as_slice(), &[3, 0, 0, 0, 1, 2, 3]);
    }

    #[test]
    fn string_sequence() {
        let mut out = OutputStream::new(ENCODING_1_1);
        out.write_string_seq(&["ab", "c"]).unwrap();
        assert_eq!(out.as_slice(), &[2, 2, b'a', b'b', 1, b'c']);
    }
}
