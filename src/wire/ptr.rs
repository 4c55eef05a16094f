// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! The 8-byte tagged reference linking all objects in a message.
//!
//! A pointer word is never interpreted in place. Reading a word produces a
//! decoded [`Ptr`]; writing encodes one back. The two low bits of the lower
//! half select the variant, the rest of the lower half is a signed word
//! offset (struct/list) or a pad position (far), and the upper half carries
//! variant-specific payload. A word of all zeros is the null pointer, which
//! decode represents as `None` rather than as a variant.

use crate::wire::units::{BITS_PER_POINTER, WORDS_PER_POINTER};
use crate::{Error, ErrorKind, Result};

/// Lists and inline-composite bodies are limited to 2^29 elements/words by
/// the width of the count field.
pub const MAX_LIST_COUNT: u32 = (1 << 29) - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementSize {
    Void,
    Bit,
    Byte,
    TwoBytes,
    FourBytes,
    EightBytes,
    Pointer,
    InlineComposite,
}

impl ElementSize {
    pub(crate) fn from_code(code: u8) -> ElementSize {
        match code & 7 {
            0 => Self::Void,
            1 => Self::Bit,
            2 => Self::Byte,
            3 => Self::TwoBytes,
            4 => Self::FourBytes,
            5 => Self::EightBytes,
            6 => Self::Pointer,
            _ => Self::InlineComposite,
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            Self::Void => 0,
            Self::Bit => 1,
            Self::Byte => 2,
            Self::TwoBytes => 3,
            Self::FourBytes => 4,
            Self::EightBytes => 5,
            Self::Pointer => 6,
            Self::InlineComposite => 7,
        }
    }

    /// Bits of element data. Zero for pointers and inline composites, whose
    /// sizes live elsewhere.
    pub fn data_bits(self) -> u32 {
        match self {
            Self::Void => 0,
            Self::Bit => 1,
            Self::Byte => 8,
            Self::TwoBytes => 16,
            Self::FourBytes => 32,
            Self::EightBytes => 64,
            Self::Pointer | Self::InlineComposite => 0,
        }
    }

    pub fn pointer_count(self) -> u32 {
        if self == Self::Pointer {
            1
        } else {
            0
        }
    }

    /// The element stride in bits.
    pub(crate) fn step_bits(self) -> u32 {
        self.data_bits() + self.pointer_count() * BITS_PER_POINTER as u32
    }
}

/// A struct's section sizes: data words plus pointer slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StructSize {
    pub data: u16,
    pub pointers: u16,
}

impl StructSize {
    pub const fn new(data: u16, pointers: u16) -> Self {
        Self { data, pointers }
    }

    pub fn total(&self) -> u32 {
        u32::from(self.data) + u32::from(self.pointers) * WORDS_PER_POINTER as u32
    }
}

/// A decoded, non-null pointer word.
///
/// For struct and list pointers, `offset` counts words from the word after
/// the pointer to the object body, so an adjacent body has offset zero. An
/// inline-composite list's `count` is the body's word count excluding the
/// tag; the tag itself reuses the struct encoding with the element count in
/// the offset field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ptr {
    Struct {
        offset: i32,
        size: StructSize,
    },
    List {
        offset: i32,
        elem: ElementSize,
        count: u32,
    },
    Far {
        double: bool,
        pad: u32,
        seg: u32,
    },
}

impl Ptr {
    /// Decodes a pointer word. `Ok(None)` is the null pointer; the reserved
    /// kind (3) is rejected here, before anything can interpret it.
    pub fn parse(word: u64) -> Result<Option<Ptr>> {
        if word == 0 {
            return Ok(None);
        }
        let lower = word as u32;
        let upper = (word >> 32) as u32;
        let decoded = match lower & 3 {
            0 => Self::Struct {
                offset: (lower as i32) >> 2,
                size: StructSize::new(upper as u16, (upper >> 16) as u16),
            },
            1 => Self::List {
                offset: (lower as i32) >> 2,
                elem: ElementSize::from_code(upper as u8),
                count: upper >> 3,
            },
            2 => Self::Far {
                double: lower & 4 != 0,
                pad: lower >> 3,
                seg: upper,
            },
            _ => return Err(Error::from_kind(ErrorKind::ReservedPointerKind)),
        };
        Ok(Some(decoded))
    }

    pub fn encode(self) -> u64 {
        let (lower, upper) = match self {
            Self::Struct { offset, size } => (
                (offset as u32) << 2,
                u32::from(size.data) | (u32::from(size.pointers) << 16),
            ),
            Self::List {
                offset,
                elem,
                count,
            } => (((offset as u32) << 2) | 1, (count << 3) | u32::from(elem.code())),
            Self::Far { double, pad, seg } => {
                ((pad << 3) | (u32::from(double) << 2) | 2, seg)
            }
        };
        u64::from(lower) | (u64::from(upper) << 32)
    }

    /// The same pointer re-aimed at a body `offset` words past its slot.
    /// Far pointers have no offset and pass through unchanged.
    pub(crate) fn with_offset(self, offset: i32) -> Ptr {
        match self {
            Self::Struct { size, .. } => Self::Struct { offset, size },
            Self::List { elem, count, .. } => Self::List {
                offset,
                elem,
                count,
            },
            far @ Self::Far { .. } => far,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_decodes_to_none() {
        assert_eq!(Ptr::parse(0).unwrap(), None);
    }

    #[test]
    fn reserved_kind_is_rejected() {
        let err = Ptr::parse(3).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ReservedPointerKind);
    }

    #[test]
    fn struct_round_trip() {
        let p = Ptr::Struct {
            offset: -2,
            size: StructSize::new(3, 1),
        };
        assert_eq!(Ptr::parse(p.encode()).unwrap(), Some(p));
    }

    #[test]
    fn list_round_trip() {
        let p = Ptr::List {
            offset: 11,
            elem: ElementSize::TwoBytes,
            count: 1000,
        };
        assert_eq!(Ptr::parse(p.encode()).unwrap(), Some(p));
    }

    #[test]
    fn far_round_trip() {
        let p = Ptr::Far {
            double: true,
            pad: 1234,
            seg: 7,
        };
        assert_eq!(Ptr::parse(p.encode()).unwrap(), Some(p));
    }

    #[test]
    fn empty_struct_is_not_null() {
        // Zero-size structs encode with offset -1 so the word is nonzero.
        let p = Ptr::Struct {
            offset: -1,
            size: StructSize::new(0, 0),
        };
        assert_ne!(p.encode(), 0);
        assert_eq!(Ptr::parse(p.encode()).unwrap(), Some(p));
    }
}
