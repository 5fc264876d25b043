use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;
use verglas_wire::{
    EncodingVersion, SliceFlags, TagFormat, ENCODING_1_0, TAG_END_MARKER,
};

use crate::output::OBJECT_TYPE_ID;
use crate::{
    EncodingError, FactoryRegistry, PatchFn, SliceInfo, SlicedData, StringConverter,
    UnknownSlicedValue, UserException, ValuePtr,
};

/// Default bound on class graph nesting while unmarshaling.
pub const DEFAULT_CLASS_GRAPH_DEPTH_MAX: usize = 100;

/// Stream reading the binary encoding.
///
/// Reads advance an absolute cursor and fail with
/// [`EncodingError::UnmarshalOutOfBounds`] when fewer bytes remain than
/// requested; nothing is ever consumed past a failure point by design of
/// the callers (a failed decode poisons the whole message).
///
/// Like the write side, at most one class decoder exists per stream, owned
/// by the innermost encapsulation.
pub struct InputStream {
    data: Bytes,
    pos: usize,
    encoding: EncodingVersion,
    factories: Option<Arc<FactoryRegistry>>,
    converter: Option<Arc<dyn StringConverter>>,
    class_graph_depth_max: usize,
    slice_values: bool,
    encaps: Option<Box<InEncaps>>,
    trailing_byte_logged: bool,
}

struct InEncaps {
    /// One past the last byte of the encapsulation.
    end: usize,
    encoding: EncodingVersion,
    decoder: Option<Decoder>,
    previous: Option<Box<InEncaps>>,
}

impl InputStream {
    pub fn new(data: impl Into<Bytes>, encoding: EncodingVersion) -> Self {
        InputStream {
            data: data.into(),
            pos: 0,
            encoding,
            factories: None,
            converter: None,
            class_graph_depth_max: DEFAULT_CLASS_GRAPH_DEPTH_MAX,
            slice_values: true,
            encaps: None,
            trailing_byte_logged: false,
        }
    }

    pub fn set_factories(&mut self, factories: Arc<FactoryRegistry>) {
        self.factories = Some(factories);
    }

    pub fn set_string_converter(&mut self, converter: Arc<dyn StringConverter>) {
        self.converter = Some(converter);
    }

    /// Bound class graph nesting; hostile input cannot recurse deeper.
    pub fn set_class_graph_depth_max(&mut self, max: usize) {
        self.class_graph_depth_max = max;
    }

    /// When disabled, instances of unknown concrete types fail with
    /// `NoValueFactory` instead of decoding to a placeholder.
    pub fn set_slice_values(&mut self, slice: bool) {
        self.slice_values = slice;
    }

    /// Encoding of the innermost open encapsulation, or of the stream.
    pub fn encoding(&self) -> EncodingVersion {
        match &self.encaps {
            Some(e) => e.encoding,
            None => self.encoding,
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    // --- primitives ---------------------------------------------------

    fn take(&mut self, n: usize) -> Result<Bytes, EncodingError> {
        if self.remaining() < n {
            return Err(EncodingError::UnmarshalOutOfBounds);
        }
        let b = self.data.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(b)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), EncodingError> {
        if self.remaining() < n {
            return Err(EncodingError::UnmarshalOutOfBounds);
        }
        self.pos += n;
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, EncodingError> {
        let b = self.take(1)?;
        Ok(b[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, EncodingError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i16(&mut self) -> Result<i16, EncodingError> {
        let b = self.take(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, EncodingError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i64(&mut self) -> Result<i64, EncodingError> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_f32(&mut self) -> Result<f32, EncodingError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_f64(&mut self) -> Result<f64, EncodingError> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Read a `size`: one byte below 255, else the 255 escape plus a
    /// non-negative i32.
    pub fn read_size(&mut self) -> Result<i32, EncodingError> {
        let b = self.read_u8()?;
        if b == 255 {
            let v = self.read_i32()?;
            if v < 0 {
                return Err(EncodingError::UnmarshalOutOfBounds);
            }
            Ok(v)
        } else {
            Ok(i32::from(b))
        }
    }

    /// Read a sequence size and reject it if `size * min_element_size`
    /// exceeds the remaining bytes, bounding allocation under hostile
    /// input.
    pub fn read_and_check_seq_size(&mut self, min_element_size: usize) -> Result<usize, EncodingError> {
        let sz = self.read_size()? as usize;
        if sz.saturating_mul(min_element_size) > self.remaining() {
            return Err(EncodingError::UnmarshalOutOfBounds);
        }
        Ok(sz)
    }

    pub fn read_blob(&mut self, n: usize) -> Result<Vec<u8>, EncodingError> {
        Ok(self.take(n)?.to_vec())
    }

    pub fn read_string(&mut self) -> Result<String, EncodingError> {
        let s = self.read_string_raw()?;
        match &self.converter {
            Some(conv) => conv.from_wire(s),
            None => Ok(s),
        }
    }

    /// Read a string bypassing the converter; type ids always use this.
    pub(crate) fn read_string_raw(&mut self) -> Result<String, EncodingError> {
        let n = self.read_and_check_seq_size(1)?;
        let bytes = self.take(n)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| EncodingError::StringConversion("invalid UTF-8".into()))
    }

    /// Read an enumerator; see [`crate::OutputStream::write_enum`].
    pub fn read_enum(&mut self, max_value: i32) -> Result<i32, EncodingError> {
        if self.encoding() == ENCODING_1_0 {
            if max_value < 127 {
                Ok(i32::from(self.read_u8()?))
            } else if max_value < 32767 {
                Ok(i32::from(self.read_i16()?))
            } else {
                self.read_i32()
            }
        } else {
            self.read_size()
        }
    }

    // --- sequences ----------------------------------------------------

    pub fn read_byte_seq(&mut self) -> Result<Vec<u8>, EncodingError> {
        let n = self.read_and_check_seq_size(1)?;
        self.read_blob(n)
    }

    pub fn read_bool_seq(&mut self) -> Result<Vec<bool>, EncodingError> {
        let n = self.read_and_check_seq_size(1)?;
        let mut v = Vec::with_capacity(n);
        for _ in 0..n {
            v.push(self.read_bool()?);
        }
        Ok(v)
    }

    pub fn read_i16_seq(&mut self) -> Result<Vec<i16>, EncodingError> {
        let n = self.read_and_check_seq_size(2)?;
        let mut v = Vec::with_capacity(n);
        for _ in 0..n {
            v.push(self.read_i16()?);
        }
        Ok(v)
    }

    pub fn read_i32_seq(&mut self) -> Result<Vec<i32>, EncodingError> {
        let n = self.read_and_check_seq_size(4)?;
        let mut v = Vec::with_capacity(n);
        for _ in 0..n {
            v.push(self.read_i32()?);
        }
        Ok(v)
    }

    pub fn read_i64_seq(&mut self) -> Result<Vec<i64>, EncodingError> {
        let n = self.read_and_check_seq_size(8)?;
        let mut v = Vec::with_capacity(n);
        for _ in 0..n {
            v.push(self.read_i64()?);
        }
        Ok(v)
    }

    pub fn read_f32_seq(&mut self) -> Result<Vec<f32>, EncodingError> {
        let n = self.read_and_check_seq_size(4)?;
        let mut v = Vec::with_capacity(n);
        for _ in 0..n {
            v.push(self.read_f32()?);
        }
        Ok(v)
    }

    pub fn read_f64_seq(&mut self) -> Result<Vec<f64>, EncodingError> {
        let n = self.read_and_check_seq_size(8)?;
        let mut v = Vec::with_capacity(n);
        for _ in 0..n {
            v.push(self.read_f64()?);
        }
        Ok(v)
    }

    pub fn read_string_seq(&mut self) -> Result<Vec<String>, EncodingError> {
        let n = self.read_and_check_seq_size(1)?;
        let mut v = Vec::with_capacity(n);
        for _ in 0..n {
            v.push(self.read_string()?);
        }
        Ok(v)
    }

    pub fn read_string_dict(
        &mut self,
    ) -> Result<std::collections::BTreeMap<String, String>, EncodingError> {
        let n = self.read_and_check_seq_size(2)?;
        let mut map = std::collections::BTreeMap::new();
        for _ in 0..n {
            let key = self.read_string()?;
            let value = self.read_string()?;
            map.insert(key, value);
        }
        Ok(map)
    }

    // --- encapsulations -----------------------------------------------

    fn encaps_end(&self) -> usize {
        match &self.encaps {
            Some(e) => e.end,
            None => self.data.len(),
        }
    }

    /// Open the encapsulation at the cursor and return its encoding.
    pub fn start_encapsulation(&mut self) -> Result<EncodingVersion, EncodingError> {
        let start = self.pos;
        let sz = self.read_i32()?;
        if sz < 6 {
            return Err(EncodingError::UnmarshalOutOfBounds);
        }
        let end = start + sz as usize;
        if end > self.data.len() {
            return Err(EncodingError::UnmarshalOutOfBounds);
        }
        let encoding = EncodingVersion { major: self.read_u8()?, minor: self.read_u8()? };
        if !encoding.is_supported() {
            return Err(EncodingError::UnsupportedEncoding(encoding));
        }
        self.encaps = Some(Box::new(InEncaps {
            end,
            encoding,
            decoder: None,
            previous: self.encaps.take(),
        }));
        Ok(encoding)
    }

    /// Close the innermost encapsulation. The declared size must exactly
    /// match the bytes consumed; under 1.0 a single trailing byte is
    /// tolerated for compatibility with a historical sender defect, logged
    /// once per stream.
    pub fn end_encapsulation(&mut self) -> Result<(), EncodingError> {
        let encaps = self
            .encaps
            .take()
            .ok_or_else(|| EncodingError::encaps("no open encapsulation"))?;
        let end = encaps.end;
        if encaps.encoding != ENCODING_1_0 {
            if self.pos < end {
                // Whatever trails the known members must be tagged data.
                self.skip_remaining_tags(end)?;
            }
            if self.pos != end {
                return Err(EncodingError::encaps("size mismatch"));
            }
            self.encaps = encaps.previous;
        } else {
            if self.pos != end {
                if self.pos + 1 != end {
                    return Err(EncodingError::encaps("size mismatch"));
                }
                // Old senders emitted one stray byte after 1.0 user
                // exceptions with class members.
                self.pos += 1;
                if !self.trailing_byte_logged {
                    self.trailing_byte_logged = true;
                    tracing::warn!("tolerating extra trailing byte in 1.0 encapsulation");
                }
            }
            self.encaps = encaps.previous;
        }
        Ok(())
    }

    /// Skip an encapsulation that must be empty.
    pub fn skip_empty_encapsulation(&mut self) -> Result<EncodingVersion, EncodingError> {
        let sz = self.read_i32()?;
        if sz < 6 {
            return Err(EncodingError::encaps("size below header"));
        }
        if self.pos + (sz as usize - 4) > self.data.len() {
            return Err(EncodingError::UnmarshalOutOfBounds);
        }
        let encoding = EncodingVersion { major: self.read_u8()?, minor: self.read_u8()? };
        if !encoding.is_supported() {
            return Err(EncodingError::UnsupportedEncoding(encoding));
        }
        if encoding == ENCODING_1_0 {
            if sz != 6 {
                return Err(EncodingError::encaps("1.0 empty encapsulation with payload"));
            }
        } else {
            // Tagged members may trail even an "empty" encapsulation.
            self.skip(sz as usize - 6)?;
        }
        Ok(encoding)
    }

    /// Read a whole encapsulation as an opaque blob, header included.
    pub fn read_encapsulation(&mut self) -> Result<(Bytes, EncodingVersion), EncodingError> {
        let start = self.pos;
        let sz = self.read_i32()?;
        if sz < 6 {
            return Err(EncodingError::encaps("size below header"));
        }
        let end = start + sz as usize;
        if end > self.data.len() {
            return Err(EncodingError::UnmarshalOutOfBounds);
        }
        let encoding = EncodingVersion { major: self.read_u8()?, minor: self.read_u8()? };
        if !encoding.is_supported() {
            return Err(EncodingError::UnsupportedEncoding(encoding));
        }
        self.pos = end;
        Ok((self.data.slice(start..end), encoding))
    }

    /// Skip over an encapsulation, returning its encoding.
    pub fn skip_encapsulation(&mut self) -> Result<EncodingVersion, EncodingError> {
        let (_, encoding) = self.read_encapsulation()?;
        Ok(encoding)
    }

    // --- tagged members -----------------------------------------------

    /// Position the stream at the value of the tagged member `tag`, if
    /// present. Absent members consume nothing. A present member whose
    /// wire format differs from `format` is a marshaling error.
    pub fn read_tag(&mut self, tag: i32, format: TagFormat) -> Result<bool, EncodingError> {
        if self.encoding() == ENCODING_1_0 {
            return Ok(false);
        }
        if let Some(flags) = self.current_slice_flags() {
            if !flags.contains(SliceFlags::HAS_OPTIONAL_MEMBERS) {
                return Ok(false);
            }
        }
        let end = self.encaps_end();
        loop {
            if self.pos >= end {
                return Ok(false);
            }
            let save = self.pos;
            let b = self.read_u8()?;
            if b == TAG_END_MARKER {
                self.pos = save;
                return Ok(false);
            }
            let fmt = TagFormat::from_u8(b & 0x07)
                .ok_or_else(|| EncodingError::marshal("invalid tag format"))?;
            let mut t = i32::from(b >> 3);
            if t == 30 {
                t = self.read_size()?;
            }
            if t > tag {
                // Tags appear in ascending order; ours is absent.
                self.pos = save;
                return Ok(false);
            }
            if t < tag {
                self.skip_tagged(fmt)?;
                continue;
            }
            if fmt != format {
                return Err(EncodingError::marshal("mismatched tag format"));
            }
            return Ok(true);
        }
    }

    pub fn read_tagged_i32(&mut self, tag: i32) -> Result<Option<i32>, EncodingError> {
        Ok(if self.read_tag(tag, TagFormat::F4)? {
            Some(self.read_i32()?)
        } else {
            None
        })
    }

    pub fn read_tagged_f64(&mut self, tag: i32) -> Result<Option<f64>, EncodingError> {
        Ok(if self.read_tag(tag, TagFormat::F8)? {
            Some(self.read_f64()?)
        } else {
            None
        })
    }

    pub fn read_tagged_string(&mut self, tag: i32) -> Result<Option<String>, EncodingError> {
        Ok(if self.read_tag(tag, TagFormat::VSize)? {
            Some(self.read_string()?)
        } else {
            None
        })
    }

    pub fn read_tagged_byte_seq(&mut self, tag: i32) -> Result<Option<Vec<u8>>, EncodingError> {
        Ok(if self.read_tag(tag, TagFormat::VSize)? {
            Some(self.read_byte_seq()?)
        } else {
            None
        })
    }

    /// Skip one tagged value of the given format.
    fn skip_tagged(&mut self, format: TagFormat) -> Result<(), EncodingError> {
        match format {
            TagFormat::F1 => self.skip(1),
            TagFormat::F2 => self.skip(2),
            TagFormat::F4 => self.skip(4),
            TagFormat::F8 => self.skip(8),
            TagFormat::Size => self.read_size().map(|_| ()),
            TagFormat::VSize => {
                let n = self.read_size()?;
                self.skip(n as usize)
            }
            TagFormat::FSize => {
                let n = self.read_i32()?;
                if n < 0 {
                    return Err(EncodingError::UnmarshalOutOfBounds);
                }
                self.skip(n as usize)
            }
            TagFormat::Class => {
                // The only way past a class-typed member is to decode it.
                self.read_value(Box::new(|_| Ok(())))
            }
        }
    }

    /// Consume tag descriptors and values until the end marker or `end`.
    fn skip_remaining_tags(&mut self, end: usize) -> Result<(), EncodingError> {
        while self.pos < end {
            let b = self.read_u8()?;
            if b == TAG_END_MARKER {
                return Ok(());
            }
            let fmt = TagFormat::from_u8(b & 0x07)
                .ok_or_else(|| EncodingError::marshal("invalid tag format"))?;
            let t = b >> 3;
            if i32::from(t) == 30 {
                self.read_size()?;
            }
            self.skip_tagged(fmt)?;
        }
        Ok(())
    }

    // --- classes ------------------------------------------------------

    /// Read a class reference. `patch` runs with the instance (or `None`
    /// for a nil reference) as soon as it is available, which for cyclic
    /// graphs can be before the instance finished unmarshaling its own
    /// members.
    pub fn read_value(&mut self, patch: PatchFn) -> Result<(), EncodingError> {
        self.init_decoder();
        match self.decoder_kind()? {
            DecoderKind::V10 => {
                let index = self.read_i32()?;
                if index > 0 {
                    return Err(EncodingError::marshal("invalid instance id"));
                }
                if index == 0 {
                    patch(None)
                } else {
                    self.add_patch_entry(-index, patch)
                }
            }
            DecoderKind::V11 => {
                let index = self.read_size()?;
                if index == 0 {
                    return patch(None);
                }
                let indirect = self.dec11(|dec| {
                    dec.instances.last().is_some_and(|current| {
                        current.slice_flags.contains(SliceFlags::HAS_INDIRECTION_TABLE)
                    })
                })?;
                if indirect {
                    // The reference is a local index into this slice's
                    // indirection table; resolve it at end_slice.
                    self.dec11(|dec| {
                        if let Some(current) = dec.instances.last_mut() {
                            current.indirect_patches.push((index, patch));
                        }
                    })
                } else {
                    self.read_instance_11(index, Some(patch)).map(|_| ())
                }
            }
        }
    }

    /// Read a class reference into a member slot.
    pub fn read_value_into(
        &mut self,
        slot: &crate::ValueSlot,
    ) -> Result<(), EncodingError> {
        self.read_value(slot.patch())
    }

    /// Drain the 1.0 pending-instance batches and run the queued patch
    /// callbacks. Under 1.1 this is a no-op.
    pub fn read_pending_values(&mut self) -> Result<(), EncodingError> {
        match self.decoder_kind() {
            Ok(DecoderKind::V10) => {
                loop {
                    let num = self.read_size()?;
                    for _ in 0..num {
                        self.read_instance_10()?;
                    }
                    if num == 0 {
                        break;
                    }
                }
                let unresolved = self.with_common(|c| !c.patch_map.is_empty())?;
                if unresolved {
                    return Err(EncodingError::marshal("instance reference never arrived"));
                }
                Ok(())
            }
            Ok(DecoderKind::V11) => Ok(()),
            Err(_) if self.encoding() == ENCODING_1_0 => {
                // No instance was written; consume the empty marker.
                let num = self.read_size()?;
                if num != 0 {
                    return Err(EncodingError::marshal("unexpected pending instances"));
                }
                Ok(())
            }
            Err(_) => Ok(()),
        }
    }

    /// Decode a user exception from the current encapsulation.
    ///
    /// Unknown most-derived slices are skipped until a registered type is
    /// found; running out of slices yields `NoValueFactory` with the
    /// most-derived type id, which the protocol layer reports as an
    /// unknown user exception.
    pub fn read_exception(&mut self) -> Result<Box<dyn UserException>, EncodingError> {
        self.init_decoder();
        match self.decoder_kind()? {
            DecoderKind::V10 => {
                let uses_classes = self.read_bool()?;
                let ex = self.read_exception_10()?;
                if uses_classes {
                    self.read_pending_values()?;
                }
                Ok(ex)
            }
            DecoderKind::V11 => self.read_exception_11(),
        }
    }

    /// Begin unmarshaling an instance; the matching decoder state was set
    /// up by the reference that led here.
    pub fn start_value(&mut self) -> Result<(), EncodingError> {
        self.decoder_kind().map(|_| ())
    }

    /// Finish unmarshaling an instance. With `preserve`, any slices that
    /// were skipped for this instance are returned for re-marshaling.
    pub fn end_value(&mut self, preserve: bool) -> Result<Option<SlicedData>, EncodingError> {
        match self.decoder_kind()? {
            DecoderKind::V10 => {
                // Consume the terminating root slice.
                let type_id = self.start_slice()?;
                if type_id != OBJECT_TYPE_ID {
                    return Err(EncodingError::marshal("missing root slice"));
                }
                let sz = self.read_size()?;
                if sz != 0 {
                    return Err(EncodingError::marshal("malformed root slice"));
                }
                self.end_slice()?;
                Ok(None)
            }
            DecoderKind::V11 => self.dec11(|dec| {
                let current = dec.instances.pop();
                current.and_then(|c| {
                    (preserve && !c.slices.is_empty())
                        .then_some(SlicedData { slices: c.slices })
                })
            }),
        }
    }

    pub fn start_exception(&mut self) -> Result<(), EncodingError> {
        self.decoder_kind().map(|_| ())
    }

    pub fn end_exception(&mut self, preserve: bool) -> Result<Option<SlicedData>, EncodingError> {
        match self.decoder_kind()? {
            DecoderKind::V10 => Ok(None),
            DecoderKind::V11 => self.end_value(preserve),
        }
    }

    /// Read the header of the next slice and return its type id.
    pub fn start_slice(&mut self) -> Result<String, EncodingError> {
        match self.decoder_kind()? {
            DecoderKind::V10 => self.start_slice_10(),
            DecoderKind::V11 => self.start_slice_11(),
        }
    }

    pub fn end_slice(&mut self) -> Result<(), EncodingError> {
        match self.decoder_kind()? {
            DecoderKind::V10 => Ok(()),
            DecoderKind::V11 => self.end_slice_11(),
        }
    }

    /// Skip the current slice, preserving it when the format allows.
    pub fn skip_slice(&mut self) -> Result<(), EncodingError> {
        match self.decoder_kind()? {
            DecoderKind::V10 => {
                let sz = self.dec10(|dec| dec.slice_size)?;
                self.skip(sz as usize - 4)
            }
            DecoderKind::V11 => self.skip_slice_11(),
        }
    }

    // --- 1.0 decoder --------------------------------------------------

    fn read_instance_10(&mut self) -> Result<(), EncodingError> {
        let index = self.read_i32()?;
        if index <= 0 {
            return Err(EncodingError::marshal("invalid instance id"));
        }
        self.dec10(|dec| {
            dec.slice_kind = SliceKind::Value;
            dec.skip_first_slice = false;
        })?;
        let mut type_id = self.start_slice_10()?;
        let most_derived = type_id.clone();
        loop {
            if type_id == OBJECT_TYPE_ID {
                // The whole hierarchy was unknown.
                return Err(EncodingError::NoValueFactory { type_id: most_derived });
            }
            if let Some(v) = self.create_value(&type_id) {
                self.register_instance(index, &v)?;
                self.dec10(|dec| dec.skip_first_slice = true)?;
                {
                    let mut instance = v.borrow_mut();
                    instance.unmarshal(self)?;
                }
                return Ok(());
            }
            self.skip_slice()?;
            type_id = self.start_slice_10()?;
        }
    }

    fn read_exception_10(&mut self) -> Result<Box<dyn UserException>, EncodingError> {
        self.dec10(|dec| {
            dec.slice_kind = SliceKind::Exception;
            dec.skip_first_slice = false;
        })?;
        let mut type_id = self.start_slice_10()?;
        let most_derived = type_id.clone();
        loop {
            if let Some(mut ex) = self.create_exception(&type_id) {
                self.dec10(|dec| dec.skip_first_slice = true)?;
                ex.unmarshal(self)?;
                return Ok(ex);
            }
            self.skip_slice()?;
            // 1.0 slices carry no last-slice flag; running off the end of
            // the encapsulation is how an all-unknown hierarchy presents.
            type_id = match self.start_slice_10() {
                Ok(id) => id,
                Err(EncodingError::UnmarshalOutOfBounds) => {
                    return Err(EncodingError::NoValueFactory { type_id: most_derived })
                }
                Err(e) => return Err(e),
            };
        }
    }

    fn start_slice_10(&mut self) -> Result<String, EncodingError> {
        let (kind, skip_first, current_id) = self.dec10(|dec| {
            (dec.slice_kind, dec.skip_first_slice, dec.type_id.clone())
        })?;
        if skip_first {
            self.dec10(|dec| dec.skip_first_slice = false)?;
            return Ok(current_id);
        }
        let type_id = if kind == SliceKind::Value {
            if self.read_bool()? {
                let index = self.read_size()?;
                self.with_common(|c| c.type_ids.get(index as usize - 1).cloned())?
                    .ok_or_else(|| EncodingError::marshal("unknown type id index"))?
            } else {
                let id = self.read_string_raw()?;
                self.with_common(|c| c.type_ids.push(id.clone()))?;
                id
            }
        } else {
            self.read_string_raw()?
        };
        let slice_size = self.read_i32()?;
        if slice_size < 4 {
            return Err(EncodingError::UnmarshalOutOfBounds);
        }
        if slice_size as usize - 4 > self.remaining() {
            return Err(EncodingError::UnmarshalOutOfBounds);
        }
        self.dec10(|dec| {
            dec.type_id = type_id.clone();
            dec.slice_size = slice_size;
        })?;
        Ok(type_id)
    }

    // --- 1.1 decoder --------------------------------------------------

    fn read_instance_11(
        &mut self,
        index: i32,
        patch: Option<PatchFn>,
    ) -> Result<i32, EncodingError> {
        if index > 1 {
            // Reference to an instance that appeared (or will appear)
            // earlier in the wire order.
            if let Some(patch) = patch {
                self.add_patch_entry(index, patch)?;
            }
            return Ok(index);
        }
        if index != 1 {
            return Err(EncodingError::marshal("invalid instance id"));
        }

        let id = self.dec11(|dec| {
            dec.value_id_index += 1;
            dec.value_id_index
        })?;

        let depth = self.with_common(|c| {
            c.depth += 1;
            c.depth
        })?;
        if depth > self.class_graph_depth_max {
            return Err(EncodingError::marshal("maximum class graph depth reached"));
        }

        self.dec11(|dec| dec.instances.push(InstanceData11::new(SliceKind::Value)))?;
        self.start_slice_11()?;
        let most_derived = self.current_type_id_11()?;

        let v = loop {
            let type_id = self.current_type_id_11()?;
            if !type_id.is_empty() {
                if let Some(v) = self.create_value(&type_id) {
                    break v;
                }
            }
            // Unknown type: skip this slice if the sender made that
            // possible, otherwise give up.
            if !self.slice_values {
                return Err(EncodingError::NoValueFactory { type_id: most_derived });
            }
            let (has_size, is_last) = self.dec11(|dec| {
                dec.instances
                    .last()
                    .map(|c| {
                        (
                            c.slice_flags.contains(SliceFlags::HAS_SLICE_SIZE),
                            c.slice_flags.contains(SliceFlags::IS_LAST_SLICE),
                        )
                    })
                    .unwrap_or((false, true))
            })?;
            if !has_size {
                return Err(EncodingError::NoValueFactory { type_id });
            }
            self.skip_slice_11()?;
            if is_last {
                // Nothing in the hierarchy was known; keep the preserved
                // slices in a placeholder.
                let slices = self.dec11(|dec| {
                    dec.instances
                        .pop()
                        .map(|c| c.slices)
                        .unwrap_or_default()
                })?;
                let mut unknown = UnknownSlicedValue::new(most_derived);
                unknown.set_sliced_data(SlicedData { slices });
                let v: ValuePtr = Rc::new(RefCell::new(unknown));
                self.register_instance(id, &v)?;
                self.with_common(|c| c.depth -= 1)?;
                if let Some(patch) = patch {
                    patch(Some(v))?;
                }
                return Ok(id);
            }
            self.start_slice_11()?;
        };

        // Register before unmarshaling so references back to this
        // instance, including cycles, resolve to it.
        self.register_instance(id, &v)?;
        self.dec11(|dec| {
            if let Some(current) = dec.instances.last_mut() {
                current.skip_first_slice = true;
            }
        })?;
        {
            let mut instance = v.borrow_mut();
            instance.unmarshal(self)?;
        }
        self.with_common(|c| c.depth -= 1)?;
        if let Some(patch) = patch {
            patch(Some(v))?;
        }
        Ok(id)
    }

    fn read_exception_11(&mut self) -> Result<Box<dyn UserException>, EncodingError> {
        self.dec11(|dec| dec.instances.push(InstanceData11::new(SliceKind::Exception)))?;
        self.start_slice_11()?;
        let most_derived = self.current_type_id_11()?;
        loop {
            let type_id = self.current_type_id_11()?;
            if let Some(mut ex) = self.create_exception(&type_id) {
                self.dec11(|dec| {
                    if let Some(current) = dec.instances.last_mut() {
                        current.skip_first_slice = true;
                    }
                })?;
                ex.unmarshal(self)?;
                return Ok(ex);
            }
            let (has_size, is_last) = self.dec11(|dec| {
                dec.instances
                    .last()
                    .map(|c| {
                        (
                            c.slice_flags.contains(SliceFlags::HAS_SLICE_SIZE),
                            c.slice_flags.contains(SliceFlags::IS_LAST_SLICE),
                        )
                    })
                    .unwrap_or((false, true))
            })?;
            if !has_size {
                return Err(EncodingError::NoValueFactory { type_id });
            }
            self.skip_slice_11()?;
            if is_last {
                self.dec11(|dec| {
                    dec.instances.pop();
                })?;
                return Err(EncodingError::NoValueFactory { type_id: most_derived });
            }
            self.start_slice_11()?;
        }
    }

    fn current_type_id_11(&mut self) -> Result<String, EncodingError> {
        let (type_id, compact_id) = self
            .dec11(|dec| {
                dec.instances
                    .last()
                    .map(|c| (c.type_id.clone(), c.compact_id))
            })?
            .ok_or_else(|| EncodingError::marshal("no instance in progress"))?;
        if !type_id.is_empty() || compact_id < 0 {
            return Ok(type_id);
        }
        // Only a numeric id was sent; map it back through the registry.
        Ok(self
            .factories
            .as_ref()
            .and_then(|f| f.resolve_compact_id(compact_id))
            .unwrap_or_default())
    }

    fn start_slice_11(&mut self) -> Result<String, EncodingError> {
        let (kind, skip_first, current_id) = self.dec11(|dec| {
            dec.instances
                .last()
                .map(|c| (c.kind, c.skip_first_slice, c.type_id.clone()))
                .ok_or_else(|| EncodingError::marshal("no instance in progress"))
        })??;
        if skip_first {
            self.dec11(|dec| {
                if let Some(current) = dec.instances.last_mut() {
                    current.skip_first_slice = false;
                }
            })?;
            return Ok(current_id);
        }

        let flags = SliceFlags::from_bits_truncate(self.read_u8()?);
        let mut type_id = String::new();
        let mut compact_id = -1;
        if kind == SliceKind::Value {
            let id_bits = flags & SliceFlags::HAS_TYPE_ID_COMPACT;
            if id_bits == SliceFlags::HAS_TYPE_ID_COMPACT {
                compact_id = self.read_size()?;
            } else if id_bits == SliceFlags::HAS_TYPE_ID_STRING {
                type_id = self.read_string_raw()?;
                let id = type_id.clone();
                self.with_common(|c| c.type_ids.push(id))?;
            } else if id_bits == SliceFlags::HAS_TYPE_ID_INDEX {
                let index = self.read_size()?;
                type_id = self
                    .with_common(|c| c.type_ids.get(index as usize - 1).cloned())?
                    .ok_or_else(|| EncodingError::marshal("unknown type id index"))?;
            }
            // Neither bit: a non-first slice in the compact format; the
            // receiver knows the hierarchy from the first slice.
        } else {
            type_id = self.read_string_raw()?;
        }

        let slice_size = if flags.contains(SliceFlags::HAS_SLICE_SIZE) {
            let sz = self.read_i32()?;
            if sz < 4 {
                return Err(EncodingError::UnmarshalOutOfBounds);
            }
            if sz as usize - 4 > self.remaining() {
                return Err(EncodingError::UnmarshalOutOfBounds);
            }
            sz
        } else {
            0
        };

        let returned = type_id.clone();
        self.dec11(|dec| {
            if let Some(current) = dec.instances.last_mut() {
                current.slice_flags = flags;
                current.type_id = type_id;
                current.compact_id = compact_id;
                current.slice_size = slice_size;
            }
        })?;
        Ok(returned)
    }

    fn end_slice_11(&mut self) -> Result<(), EncodingError> {
        let flags = self
            .dec11(|dec| dec.instances.last().map(|c| c.slice_flags))?
            .ok_or_else(|| EncodingError::marshal("no slice in progress"))?;
        if flags.contains(SliceFlags::HAS_OPTIONAL_MEMBERS) {
            let end = self.encaps_end();
            self.skip_remaining_tags(end)?;
        }
        if flags.contains(SliceFlags::HAS_INDIRECTION_TABLE) {
            let table = self.read_indirection_table()?;
            let patches = self.dec11(|dec| {
                dec.instances
                    .last_mut()
                    .map(|c| std::mem::take(&mut c.indirect_patches))
                    .unwrap_or_default()
            })?;
            for (local, patch) in patches {
                let id = table
                    .get(local as usize - 1)
                    .copied()
                    .ok_or_else(|| EncodingError::marshal("indirection index out of range"))?;
                self.add_patch_entry(id, patch)?;
            }
        }
        Ok(())
    }

    fn skip_slice_11(&mut self) -> Result<(), EncodingError> {
        let (flags, slice_size, type_id, compact_id) = self
            .dec11(|dec| {
                dec.instances
                    .last()
                    .map(|c| (c.slice_flags, c.slice_size, c.type_id.clone(), c.compact_id))
            })?
            .ok_or_else(|| EncodingError::marshal("no slice in progress"))?;
        if !flags.contains(SliceFlags::HAS_SLICE_SIZE) {
            return Err(EncodingError::NoValueFactory { type_id });
        }
        let mut body = self.read_blob(slice_size as usize - 4)?;
        if flags.contains(SliceFlags::HAS_OPTIONAL_MEMBERS) {
            // The optional-member end marker is re-written when the slice
            // is re-marshaled; keeping it would double it.
            match body.pop() {
                Some(TAG_END_MARKER) => {}
                _ => return Err(EncodingError::marshal("missing tagged member end marker")),
            }
        }

        let mut info = SliceInfo {
            type_id,
            compact_id,
            bytes: body,
            instances: Vec::new(),
            has_optional_members: flags.contains(SliceFlags::HAS_OPTIONAL_MEMBERS),
            is_last_slice: flags.contains(SliceFlags::IS_LAST_SLICE),
        };

        if flags.contains(SliceFlags::HAS_INDIRECTION_TABLE) {
            // Preserve the indirect instances so the slice can be
            // re-marshaled with its table intact.
            let table = self.read_indirection_table()?;
            let slots: Vec<Rc<RefCell<Option<ValuePtr>>>> =
                (0..table.len()).map(|_| Rc::new(RefCell::new(None))).collect();
            for (id, slot) in table.iter().zip(&slots) {
                let slot = slot.clone();
                self.add_patch_entry(
                    *id,
                    Box::new(move |v| {
                        *slot.borrow_mut() = v;
                        Ok(())
                    }),
                )?;
            }
            for slot in slots {
                let v = slot.borrow_mut().take().ok_or_else(|| {
                    EncodingError::marshal("indirection table entry never arrived")
                })?;
                info.instances.push(v);
            }
        }

        self.dec11(|dec| {
            if let Some(current) = dec.instances.last_mut() {
                current.slices.push(info);
            }
        })
    }

    /// Read an indirection table, returning the decoded instances' ids.
    fn read_indirection_table(&mut self) -> Result<Vec<i32>, EncodingError> {
        let count = self.read_and_check_seq_size(1)?;
        let mut table = Vec::with_capacity(count);
        for _ in 0..count {
            let index = self.read_size()?;
            if index < 1 {
                return Err(EncodingError::marshal("nil entry in indirection table"));
            }
            table.push(self.read_instance_11(index, None)?);
        }
        Ok(table)
    }

    // --- decoder plumbing ---------------------------------------------

    fn create_value(&self, type_id: &str) -> Option<ValuePtr> {
        self.factories.as_ref()?.create_value(type_id)
    }

    fn create_exception(&self, type_id: &str) -> Option<Box<dyn UserException>> {
        self.factories.as_ref()?.create_exception(type_id)
    }

    fn register_instance(&mut self, id: i32, v: &ValuePtr) -> Result<(), EncodingError> {
        let patches = self.with_common(|c| {
            c.unmarshaled.insert(id, v.clone());
            c.patch_map.remove(&id)
        })?;
        if let Some(patches) = patches {
            for patch in patches {
                patch(Some(v.clone()))?;
            }
        }
        Ok(())
    }

    fn add_patch_entry(&mut self, id: i32, patch: PatchFn) -> Result<(), EncodingError> {
        let existing = self.with_common(|c| c.unmarshaled.get(&id).cloned())?;
        match existing {
            Some(v) => patch(Some(v)),
            None => self.with_common(|c| {
                c.patch_map.entry(id).or_default().push(patch);
            }),
        }
    }

    fn current_slice_flags(&self) -> Option<SliceFlags> {
        match self.encaps.as_ref()?.decoder.as_ref()? {
            Decoder::V11(dec) => dec.instances.last().map(|c| c.slice_flags),
            Decoder::V10(_) => None,
        }
    }

    fn init_decoder(&mut self) {
        if self.encaps.is_none() {
            // Top-level class data outside an explicit encapsulation.
            self.encaps = Some(Box::new(InEncaps {
                end: self.data.len(),
                encoding: self.encoding,
                decoder: None,
                previous: None,
            }));
        }
        if let Some(encaps) = self.encaps.as_mut() {
            if encaps.decoder.is_none() {
                encaps.decoder = Some(if encaps.encoding == ENCODING_1_0 {
                    Decoder::V10(Decoder10::default())
                } else {
                    Decoder::V11(Decoder11::default())
                });
            }
        }
    }

    fn decoder_kind(&mut self) -> Result<DecoderKind, EncodingError> {
        match self.encaps.as_ref().and_then(|e| e.decoder.as_ref()) {
            Some(Decoder::V10(_)) => Ok(DecoderKind::V10),
            Some(Decoder::V11(_)) => Ok(DecoderKind::V11),
            None => Err(EncodingError::marshal("no class data in progress")),
        }
    }

    fn dec10<T>(&mut self, f: impl FnOnce(&mut Decoder10) -> T) -> Result<T, EncodingError> {
        match self.encaps.as_mut().and_then(|e| e.decoder.as_mut()) {
            Some(Decoder::V10(dec)) => Ok(f(dec)),
            _ => Err(EncodingError::marshal("no class data in progress")),
        }
    }

    fn dec11<T>(&mut self, f: impl FnOnce(&mut Decoder11) -> T) -> Result<T, EncodingError> {
        match self.encaps.as_mut().and_then(|e| e.decoder.as_mut()) {
            Some(Decoder::V11(dec)) => Ok(f(dec)),
            _ => Err(EncodingError::marshal("no class data in progress")),
        }
    }

    fn with_common<T>(
        &mut self,
        f: impl FnOnce(&mut DecoderCommon) -> T,
    ) -> Result<T, EncodingError> {
        match self.encaps.as_mut().and_then(|e| e.decoder.as_mut()) {
            Some(Decoder::V10(dec)) => Ok(f(&mut dec.common)),
            Some(Decoder::V11(dec)) => Ok(f(&mut dec.common)),
            None => Err(EncodingError::marshal("no class data in progress")),
        }
    }
}

enum Decoder {
    V10(Decoder10),
    V11(Decoder11),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum DecoderKind {
    V10,
    V11,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SliceKind {
    Value,
    Exception,
}

/// State shared by both decoder generations.
#[derive(Default)]
struct DecoderCommon {
    /// Instance id to decoded instance.
    unmarshaled: HashMap<i32, ValuePtr>,
    /// References waiting for their instance.
    patch_map: HashMap<i32, Vec<PatchFn>>,
    /// Type ids in first-occurrence order, for index compression.
    type_ids: Vec<String>,
    depth: usize,
}

struct Decoder10 {
    common: DecoderCommon,
    slice_kind: SliceKind,
    skip_first_slice: bool,
    type_id: String,
    slice_size: i32,
}

impl Default for Decoder10 {
    fn default() -> Self {
        Decoder10 {
            common: DecoderCommon::default(),
            slice_kind: SliceKind::Value,
            skip_first_slice: false,
            type_id: String::new(),
            slice_size: 0,
        }
    }
}

struct Decoder11 {
    common: DecoderCommon,
    /// Mirrors the sender's id allocation: ids start at 2, so the counter
    /// starts at 1 and pre-increments.
    value_id_index: i32,
    instances: Vec<InstanceData11>,
}

impl Default for Decoder11 {
    fn default() -> Self {
        Decoder11 {
            common: DecoderCommon::default(),
            value_id_index: 1,
            instances: Vec::new(),
        }
    }
}

struct InstanceData11 {
    kind: SliceKind,
    skip_first_slice: bool,
    slice_flags: SliceFlags,
    slice_size: i32,
    type_id: String,
    compact_id: i32,
    indirect_patches: Vec<(i32, PatchFn)>,
    slices: Vec<SliceInfo>,
}

impl InstanceData11 {
    fn new(kind: SliceKind) -> Self {
        InstanceData11 {
            kind,
            skip_first_slice: false,
            slice_flags: SliceFlags::empty(),
            slice_size: 0,
            type_id: String::new(),
            compact_id: -1,
            indirect_patches: Vec::new(),
            slices: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OutputStream;
    use verglas_wire::{ENCODING_1_0, ENCODING_1_1};

    fn stream(bytes: &[u8]) -> InputStream {
        InputStream::new(bytes.to_vec(), ENCODING_1_1)
    }

    #[test]
    fn primitives_roundtrip() {
        let mut out = OutputStream::new(ENCODING_1_1);
        out.write_bool(true);
        out.write_i16(-2);
        out.write_i32(70_000);
        out.write_i64(-5_000_000_000);
        out.write_f32(1.5);
        out.write_f64(-2.25);
        let mut input = InputStream::new(out.finished(), ENCODING_1_1);
        assert!(input.read_bool().unwrap());
        assert_eq!(input.read_i16().unwrap(), -2);
        assert_eq!(input.read_i32().unwrap(), 70_000);
        assert_eq!(input.read_i64().unwrap(), -5_000_000_000);
        assert_eq!(input.read_f32().unwrap(), 1.5);
        assert_eq!(input.read_f64().unwrap(), -2.25);
        assert_eq!(input.remaining(), 0);
    }

    #[test]
    fn size_boundary_254_and_255() {
        let mut input = stream(&[254]);
        assert_eq!(input.read_size().unwrap(), 254);

        let mut input = stream(&[255, 255, 0, 0, 0]);
        assert_eq!(input.read_size().unwrap(), 255);
    }

    #[test]
    fn negative_escaped_size_is_out_of_bounds() {
        let mut input = stream(&[255, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(
            input.read_size(),
            Err(EncodingError::UnmarshalOutOfBounds)
        );
    }

    #[test]
    fn sequence_size_guard_rejects_hostile_length() {
        // Claims 2^31-1 i32 elements with only two bytes behind it.
        let mut input = stream(&[255, 0xFF, 0xFF, 0xFF, 0x7F, 1, 2]);
        assert_eq!(
            input.read_i32_seq(),
            Err(EncodingError::UnmarshalOutOfBounds)
        );
    }

    #[test]
    fn string_roundtrip() {
        let mut out = OutputStream::new(ENCODING_1_1);
        out.write_string("héllo").unwrap();
        let mut input = InputStream::new(out.finished(), ENCODING_1_1);
        assert_eq!(input.read_string().unwrap(), "héllo");
    }

    #[test]
    fn string_dict_roundtrip() {
        let mut ctx = std::collections::BTreeMap::new();
        ctx.insert("a".to_string(), "1".to_string());
        ctx.insert("b".to_string(), "2".to_string());
        let mut out = OutputStream::new(ENCODING_1_1);
        out.write_string_dict(&ctx).unwrap();
        let mut input = InputStream::new(out.finished(), ENCODING_1_1);
        assert_eq!(input.read_string_dict().unwrap(), ctx);
    }

    #[test]
    fn encapsulation_cursor_lands_on_declared_end() {
        let mut out = OutputStream::new(ENCODING_1_1);
        out.start_encapsulation().unwrap();
        out.write_i32_seq(&[1, 2, 3]).unwrap();
        out.end_encapsulation().unwrap();
        let bytes = out.finished();
        let declared = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;

        let mut input = InputStream::new(bytes, ENCODING_1_1);
        input.start_encapsulation().unwrap();
        assert_eq!(input.read_i32_seq().unwrap(), vec![1, 2, 3]);
        input.end_encapsulation().unwrap();
        assert_eq!(input.pos(), declared);
    }

    #[test]
    fn encapsulation_smaller_than_header_is_rejected() {
        let mut input = stream(&[5, 0, 0, 0, 1, 1]);
        assert!(input.start_encapsulation().is_err());
    }

    #[test]
    fn undeclared_trailing_bytes_fail_the_encapsulation() {
        let mut out = OutputStream::new(ENCODING_1_1);
        out.start_encapsulation().unwrap();
        out.write_i32(5);
        out.end_encapsulation().unwrap();
        let mut input = InputStream::new(out.finished(), ENCODING_1_1);
        input.start_encapsulation().unwrap();
        // Read less than was written: the remainder is not tagged data.
        input.read_i16().unwrap();
        assert!(input.end_encapsulation().is_err());
    }

    #[test]
    fn trailing_byte_tolerated_under_1_0() {
        let mut out = OutputStream::new(ENCODING_1_0);
        out.start_encapsulation().unwrap();
        out.write_i32(5);
        out.write_u8(0); // The historical stray byte.
        out.end_encapsulation().unwrap();
        let mut input = InputStream::new(out.finished(), ENCODING_1_0);
        input.start_encapsulation().unwrap();
        assert_eq!(input.read_i32().unwrap(), 5);
        input.end_encapsulation().unwrap();
    }

    #[test]
    fn skip_empty_encapsulation_checks_encoding() {
        let mut out = OutputStream::new(ENCODING_1_1);
        out.write_empty_encapsulation(ENCODING_1_0).unwrap();
        let mut input = InputStream::new(out.finished(), ENCODING_1_1);
        assert_eq!(input.skip_empty_encapsulation().unwrap(), ENCODING_1_0);
    }

    #[test]
    fn read_encapsulation_returns_blob_with_header() {
        let mut out = OutputStream::new(ENCODING_1_1);
        out.start_encapsulation().unwrap();
        out.write_u8(42);
        out.end_encapsulation().unwrap();
        let bytes = out.finished();
        let mut input = InputStream::new(bytes.clone(), ENCODING_1_1);
        let (blob, encoding) = input.read_encapsulation().unwrap();
        assert_eq!(&blob[..], &bytes[..]);
        assert_eq!(encoding, ENCODING_1_1);
        assert_eq!(input.remaining(), 0);
    }

    #[test]
    fn tagged_member_present_and_absent() {
        let mut out = OutputStream::new(ENCODING_1_1);
        out.write_tagged_i32(2, Some(7)).unwrap();
        out.write_tagged_string(5, Some("x")).unwrap();
        out.write_tag_end_marker();
        let mut input = InputStream::new(out.finished(), ENCODING_1_1);
        // Tag 1 is absent: nothing consumed, cursor still at tag 2.
        assert_eq!(input.read_tagged_i32(1).unwrap(), None);
        assert_eq!(input.read_tagged_i32(2).unwrap(), Some(7));
        // Tag 3 absent, tag 5 present after it.
        assert_eq!(input.read_tagged_i32(3).unwrap(), None);
        assert_eq!(input.read_tagged_string(5).unwrap().as_deref(), Some("x"));
    }

    #[test]
    fn tagged_reader_skips_smaller_tags() {
        let mut out = OutputStream::new(ENCODING_1_1);
        out.write_tagged_i32(1, Some(1)).unwrap();
        out.write_tagged_i32(4, Some(4)).unwrap();
        out.write_tag_end_marker();
        let mut input = InputStream::new(out.finished(), ENCODING_1_1);
        assert_eq!(input.read_tagged_i32(4).unwrap(), Some(4));
    }

    #[test]
    fn tag_escape_form_roundtrip() {
        let mut out = OutputStream::new(ENCODING_1_1);
        out.write_tagged_i32(29, Some(29)).unwrap();
        out.write_tagged_i32(30, Some(30)).unwrap();
        out.write_tagged_i32(200, Some(200)).unwrap();
        out.write_tag_end_marker();
        let mut input = InputStream::new(out.finished(), ENCODING_1_1);
        assert_eq!(input.read_tagged_i32(29).unwrap(), Some(29));
        assert_eq!(input.read_tagged_i32(30).unwrap(), Some(30));
        assert_eq!(input.read_tagged_i32(200).unwrap(), Some(200));
    }

    #[test]
    fn mismatched_tag_format_is_an_error() {
        let mut out = OutputStream::new(ENCODING_1_1);
        out.write_tagged_i32(2, Some(7)).unwrap();
        let mut input = InputStream::new(out.finished(), ENCODING_1_1);
        assert!(matches!(
            input.read_tag(2, TagFormat::F8),
            Err(EncodingError::Marshal(_))
        ));
    }

    #[test]
    fn enum_widths_follow_encoding() {
        let mut out = OutputStream::new(ENCODING_1_0);
        out.write_enum(3, 100).unwrap();
        out.write_enum(3, 1000).unwrap();
        out.write_enum(3, 100_000).unwrap();
        assert_eq!(out.len(), 1 + 2 + 4);
        let mut input = InputStream::new(out.finished(), ENCODING_1_0);
        assert_eq!(input.read_enum(100).unwrap(), 3);
        assert_eq!(input.read_enum(1000).unwrap(), 3);
        assert_eq!(input.read_enum(100_000).unwrap(), 3);

        let mut out = OutputStream::new(ENCODING_1_1);
        out.write_enum(3, 100_000).unwrap();
        assert_eq!(out.len(), 1);
    }
}
