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

//! Zero-copy, arena-based binary message layout.
//!
//! A message is a set of 8-byte-aligned segments linked by tagged wire
//! pointers. Readers interpret the bytes in place, charging a traversal
//! budget as they follow pointers; builders write directly into
//! arena-allocated segments. The [`serialize`] module frames a message for a
//! byte stream and [`packed`] applies a zero-run compression codec on top.

pub mod data;
pub mod message;
pub mod object;
pub mod packed;
pub mod serialize;
pub mod text;
pub mod wire;

use core::fmt;

/// Eight bytes, aligned as the wire layout requires.
///
/// Messages are addressed in units of words; every object starts on a word
/// boundary. Allocating segment storage as `Vec<Word>` guarantees the
/// alignment that the reader side checks for.
#[repr(C, align(8))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Word {
    raw_content: [u8; 8],
}

/// Constructs a word from its bytes, in wire (little-endian) order.
#[allow(clippy::too_many_arguments)]
pub const fn word(b0: u8, b1: u8, b2: u8, b3: u8, b4: u8, b5: u8, b6: u8, b7: u8) -> Word {
    Word {
        raw_content: [b0, b1, b2, b3, b4, b5, b6, b7],
    }
}

impl Word {
    pub fn allocate_zeroed_vec(length: usize) -> Vec<Word> {
        vec![word(0, 0, 0, 0, 0, 0, 0, 0); length]
    }

    pub fn words_to_bytes(words: &[Word]) -> &[u8] {
        unsafe { core::slice::from_raw_parts(words.as_ptr() as *const u8, words.len() * 8) }
    }

    pub fn words_to_bytes_mut(words: &mut [Word]) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(words.as_mut_ptr() as *mut u8, words.len() * 8) }
    }
}

#[cfg(test)]
impl quickcheck::Arbitrary for Word {
    fn arbitrary(g: &mut quickcheck::Gen) -> Word {
        word(
            u8::arbitrary(g),
            u8::arbitrary(g),
            u8::arbitrary(g),
            u8::arbitrary(g),
            u8::arbitrary(g),
            u8::arbitrary(g),
            u8::arbitrary(g),
            u8::arbitrary(g),
        )
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// Things that can go wrong while decoding or traversing a message.
///
/// Every variant here is a *validation* failure: the input bytes were
/// malformed, hostile, or truncated. The library never panics on input;
/// panics are reserved for misuse of the builder API.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Generic failure, usually wrapping an I/O error. See `Error::detail`.
    Failed,
    /// A pointer's target does not lie within its segment.
    PointerOutOfBounds,
    /// A far pointer names a segment id the message does not contain.
    UnknownSegment(u32),
    /// A reader segment did not start on an 8-byte boundary.
    UnalignedSegment,
    /// The traversal word budget was exhausted.
    TraversalLimitExceeded,
    /// Pointer dereferences nested deeper than the configured limit.
    NestingLimitExceeded,
    /// Kind 3 pointers are reserved and never valid.
    ReservedPointerKind,
    /// A far pointer appeared where only an object pointer may.
    UnexpectedFarPointer,
    ExpectedStructPointer,
    ExpectedListPointer,
    /// Text and data must be encoded as byte lists.
    ExpectedByteList,
    TextMissingNulTerminator,
    /// Inline composite lists may only hold struct elements.
    NonStructInlineComposite,
    /// An inline composite list's elements overrun its declared word count.
    InlineCompositeOverrun,
    /// An existing list's element size cannot satisfy the requested view.
    IncompatibleListElement,
    BitListWhereStructListExpected,
    StructListWhereBitListExpected,
    /// Expected a primitive list but found pointer-only struct elements.
    PointerOnlyStructList,
    /// Expected a pointer list but found data-only struct elements.
    DataOnlyStructList,
    /// The stream header declared more segments than permitted.
    TooManySegments(usize),
    /// The declared message size exceeds the reader's traversal limit.
    MessageTooLarge(usize),
    /// The input ended before the declared segments were complete.
    MessageEndsPrematurely,
    /// The packed input ended inside a word, count byte, or literal run.
    PrematureEndOfPackedInput,
    /// A packed run extended past the expected output boundary.
    PackedRunOverrun,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed => write!(f, "operation failed"),
            Self::PointerOutOfBounds => write!(f, "pointer out of bounds"),
            Self::UnknownSegment(id) => write!(f, "unknown segment id: {id}"),
            Self::UnalignedSegment => write!(f, "segment start is not 8-byte aligned"),
            Self::TraversalLimitExceeded => write!(f, "read limit exceeded"),
            Self::NestingLimitExceeded => write!(f, "nesting limit exceeded"),
            Self::ReservedPointerKind => write!(f, "reserved pointer kind"),
            Self::UnexpectedFarPointer => write!(f, "unexpected far pointer"),
            Self::ExpectedStructPointer => write!(f, "expected a struct pointer"),
            Self::ExpectedListPointer => write!(f, "expected a list pointer"),
            Self::ExpectedByteList => write!(f, "expected a byte list"),
            Self::TextMissingNulTerminator => write!(f, "text is not NUL-terminated"),
            Self::NonStructInlineComposite => {
                write!(f, "non-struct inline composite elements are not supported")
            }
            Self::InlineCompositeOverrun => {
                write!(f, "inline composite elements overrun the list word count")
            }
            Self::IncompatibleListElement => {
                write!(f, "existing list has an incompatible element type")
            }
            Self::BitListWhereStructListExpected => {
                write!(f, "found bit list where struct list was expected")
            }
            Self::StructListWhereBitListExpected => {
                write!(f, "found struct list where bit list was expected")
            }
            Self::PointerOnlyStructList => {
                write!(f, "expected a primitive list, got pointer-only structs")
            }
            Self::DataOnlyStructList => {
                write!(f, "expected a pointer list, got data-only structs")
            }
            Self::TooManySegments(n) => write!(f, "too many segments: {n}"),
            Self::MessageTooLarge(n) => write!(f, "message too large: {n} words"),
            Self::MessageEndsPrematurely => write!(f, "message ends prematurely"),
            Self::PrematureEndOfPackedInput => write!(f, "premature end of packed input"),
            Self::PackedRunOverrun => {
                write!(f, "packed input did not end cleanly on a word boundary")
            }
        }
    }
}

/// A validation failure, carrying an optional free-form detail string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub detail: String,
}

impl Error {
    pub fn from_kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            detail: String::new(),
        }
    }

    pub fn failed(detail: String) -> Self {
        Self {
            kind: ErrorKind::Failed,
            detail,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.detail)
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        // The packed codec surfaces its own errors through std::io; unwrap
        // them so callers see the original kind.
        if let Some(e) = err.get_ref().and_then(|inner| inner.downcast_ref::<Error>()) {
            return e.clone();
        }
        Error::failed(err.to_string())
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, err)
    }
}

/// The borrowed in-use prefixes of a builder's segments, in id order.
///
/// Single-segment messages are by far the most common, so that case avoids
/// a heap allocation.
pub enum OutputSegments<'a> {
    SingleSegment([&'a [u8]; 1]),
    MultiSegment(Vec<&'a [u8]>),
}

impl<'a> core::ops::Deref for OutputSegments<'a> {
    type Target = [&'a [u8]];
    fn deref(&self) -> &[&'a [u8]] {
        match self {
            Self::SingleSegment(s) => s,
            Self::MultiSegment(v) => v,
        }
    }
}

impl<'s> message::ReaderSegments for OutputSegments<'s> {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        self.get(id as usize).copied()
    }

    fn len(&self) -> usize {
        match self {
            Self::SingleSegment(_) => 1,
            Self::MultiSegment(v) => v.len(),
        }
    }
}
