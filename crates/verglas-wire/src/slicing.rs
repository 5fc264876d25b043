use bitflags::bitflags;

bitflags! {
    /// Per-slice flag byte of the 1.1 class and exception encoding.
    ///
    /// The two type-id bits combine: STRING|INDEX means the type id is a
    /// compact numeric id.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SliceFlags: u8 {
        const HAS_TYPE_ID_STRING = 0x01;
        const HAS_TYPE_ID_INDEX = 0x02;
        const HAS_OPTIONAL_MEMBERS = 0x04;
        const HAS_INDIRECTION_TABLE = 0x08;
        const HAS_SLICE_SIZE = 0x10;
        const IS_LAST_SLICE = 0x20;
    }
}

impl SliceFlags {
    /// The combined compact-id encoding of the two type-id bits.
    pub const HAS_TYPE_ID_COMPACT: SliceFlags =
        SliceFlags::HAS_TYPE_ID_STRING.union(SliceFlags::HAS_TYPE_ID_INDEX);
}

/// Terminates a run of tagged members within a slice or encapsulation.
pub const TAG_END_MARKER: u8 = 0xFF;

/// Wire format of a tagged member's value, low three bits of the tag byte.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TagFormat {
    /// Fixed 1 byte.
    F1 = 0,
    /// Fixed 2 bytes.
    F2 = 1,
    /// Fixed 4 bytes.
    F4 = 2,
    /// Fixed 8 bytes.
    F8 = 3,
    /// A single `size`.
    Size = 4,
    /// A `size` count of fixed-size elements; skippable as size bytes.
    VSize = 5,
    /// A fixed 4-byte length followed by that many bytes.
    FSize = 6,
    /// A class reference; only skippable by reading it.
    Class = 7,
}

impl TagFormat {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => TagFormat::F1,
            1 => TagFormat::F2,
            2 => TagFormat::F4,
            3 => TagFormat::F8,
            4 => TagFormat::Size,
            5 => TagFormat::VSize,
            6 => TagFormat::FSize,
            7 => TagFormat::Class,
            _ => return None,
        })
    }
}

/// Marshaling format selected when writing class instances.
///
/// Compact writes only the most-derived slices the receiver is assumed to
/// know. Sliced writes per-slice sizes and indirection tables so unknown
/// slices can be preserved and re-marshaled by intermediaries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ValueFormat {
    #[default]
    Compact,
    Sliced,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_is_both_type_id_bits() {
        assert_eq!(SliceFlags::HAS_TYPE_ID_COMPACT.bits(), 0x03);
    }

    #[test]
    fn tag_format_roundtrip() {
        for v in 0..=7 {
            assert_eq!(TagFormat::from_u8(v).unwrap() as u8, v);
        }
        assert_eq!(TagFormat::from_u8(8), None);
    }
}
