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

//! Zero-copy traversal of untrusted messages.
//!
//! Every step works the same way: decode a pointer word, resolve it to a
//! `(segment, word index)` target, claim the target's span against both the
//! segment's bounds and the traversal budget, and only then hand out a
//! typed view over the claimed bytes. Nothing in this module performs
//! pointer arithmetic; all addressing is integer indices into segment byte
//! slices.

use crate::text;
use crate::wire::arena::{ReadArena, SegmentId};
use crate::wire::ptr::{ElementSize, Ptr, StructSize};
use crate::wire::scalar::Scalar;
use crate::wire::units::*;
use crate::{data, Error, ErrorKind, Result, Word};

/// What a dynamically-inspected pointer turned out to be.
pub enum PointerType {
    Null,
    Struct,
    List,
}

/// A single zeroed word: the backing store for synthesized null views.
static NULL_WORD: [u8; BYTES_PER_WORD] = [0; BYTES_PER_WORD];

/// Where a reader gets its bytes: a full multi-segment message, or a flat
/// blob of trusted words (a schema default). Blobs are a single segment
/// with no budget; they were emitted by trusted code and hold no far
/// pointers.
#[derive(Clone, Copy)]
pub(crate) enum ArenaRef<'a> {
    Full(&'a dyn ReadArena),
    Blob(&'a [u8]),
}

impl<'a> std::fmt::Debug for ArenaRef<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full(_) => f.write_str("ArenaRef::Full(..)"),
            Self::Blob(bytes) => f.debug_tuple("ArenaRef::Blob").field(bytes).finish(),
        }
    }
}

impl<'a> ArenaRef<'a> {
    pub(crate) fn segment(self, id: SegmentId) -> Result<&'a [u8]> {
        match self {
            Self::Full(arena) => arena.segment(id),
            Self::Blob(bytes) if id == 0 => Ok(bytes),
            Self::Blob(_) => Err(Error::from_kind(ErrorKind::UnknownSegment(id))),
        }
    }

    pub(crate) fn charge(self, words: u64) -> Result<()> {
        match self {
            Self::Full(arena) => arena.charge(words),
            Self::Blob(_) => Ok(()),
        }
    }

    pub(crate) fn refund(self, words: u64) {
        if let Self::Full(arena) = self {
            arena.refund(words);
        }
    }
}

fn out_of_bounds() -> Error {
    Error::from_kind(ErrorKind::PointerOutOfBounds)
}

/// The word at index `at`, bounds-checked against the segment.
pub(crate) fn load_word(seg: &[u8], at: u32) -> Result<u64> {
    let start = at as usize * BYTES_PER_WORD;
    match seg.get(start..start + BYTES_PER_WORD) {
        Some(bytes) => Ok(u64::from_le_bytes(bytes.try_into().unwrap())),
        None => Err(out_of_bounds()),
    }
}

/// The bytes of `words` words starting at word `at`, bounds-checked.
fn span(seg: &[u8], at: u32, words: u32) -> Result<&[u8]> {
    let start = at as usize * BYTES_PER_WORD;
    let len = words as usize * BYTES_PER_WORD;
    seg.get(start..start + len).ok_or_else(out_of_bounds)
}

/// `span` plus a traversal-budget charge for the claimed words.
fn claim<'s>(arena: ArenaRef<'_>, seg: &'s [u8], at: u32, words: u32) -> Result<&'s [u8]> {
    let bytes = span(seg, at, words)?;
    arena.charge(u64::from(words))?;
    Ok(bytes)
}

/// A non-far pointer together with its object's location.
#[derive(Clone, Copy)]
struct Resolved<'a> {
    seg_id: SegmentId,
    seg: &'a [u8],
    at: u32,
    ptr: Ptr,
}

/// Word index of a positional pointer's body, given the pointer's own
/// index. The result may sit at the segment's end (empty objects); anything
/// past that is caught when the body is claimed.
fn body_index(ptr_at: u32, ptr: Ptr) -> Result<u32> {
    let offset = match ptr {
        Ptr::Struct { offset, .. } | Ptr::List { offset, .. } => offset,
        Ptr::Far { .. } => unreachable!("far pointers have no body offset"),
    };
    let target = i64::from(ptr_at) + 1 + i64::from(offset);
    u32::try_from(target).map_err(|_| out_of_bounds())
}

/// Decodes the pointer word at `(seg_id, at)` and follows far hops to the
/// object it describes. `Ok(None)` is a null pointer. On success the
/// returned pointer is never `Far`.
fn resolve<'a>(arena: ArenaRef<'a>, seg_id: SegmentId, at: u32) -> Result<Option<Resolved<'a>>> {
    let seg = arena.segment(seg_id)?;
    let Some(ptr) = Ptr::parse(load_word(seg, at)?)? else {
        return Ok(None);
    };

    let Ptr::Far {
        double,
        pad,
        seg: far_id,
    } = ptr
    else {
        return Ok(Some(Resolved {
            seg_id,
            seg,
            at: body_index(at, ptr)?,
            ptr,
        }));
    };

    let far_seg = arena.segment(far_id)?;
    arena.charge(if double { 2 } else { 1 })?;
    let Some(pad_ptr) = Ptr::parse(load_word(far_seg, pad)?)? else {
        return Ok(None);
    };

    if !double {
        // The pad is an ordinary pointer to the object, in its segment.
        if matches!(pad_ptr, Ptr::Far { .. }) {
            return Err(Error::from_kind(ErrorKind::UnexpectedFarPointer));
        }
        return Ok(Some(Resolved {
            seg_id: far_id,
            seg: far_seg,
            at: body_index(pad, pad_ptr)?,
            ptr: pad_ptr,
        }));
    }

    // Double-far: the pad is itself a far pointer giving the object's
    // absolute position, and the following word is a tag carrying the
    // object's kind and sizes with a meaningless offset.
    let Ptr::Far {
        double: false,
        pad: body_at,
        seg: body_seg_id,
    } = pad_ptr
    else {
        return Err(Error::from_kind(ErrorKind::UnexpectedFarPointer));
    };
    let tag = Ptr::parse(load_word(far_seg, pad + 1)?)?.unwrap_or(Ptr::Struct {
        offset: 0,
        size: StructSize::new(0, 0),
    });
    if matches!(tag, Ptr::Far { .. }) {
        return Err(Error::from_kind(ErrorKind::UnexpectedFarPointer));
    }
    Ok(Some(Resolved {
        seg_id: body_seg_id,
        seg: arena.segment(body_seg_id)?,
        at: body_at,
        ptr: tag,
    }))
}

fn flat_is_null(words: &[Word]) -> bool {
    match words.first() {
        Some(first) => Word::words_to_bytes(core::slice::from_ref(first))
            .iter()
            .all(|&b| b == 0),
        None => true,
    }
}

pub(crate) fn read_struct<'a>(
    arena: ArenaRef<'a>,
    seg_id: SegmentId,
    at: u32,
    default: Option<&'a [Word]>,
    depth: i32,
) -> Result<StructReader<'a>> {
    let Some(r) = resolve(arena, seg_id, at)? else {
        return match default {
            Some(d) if !flat_is_null(d) => {
                read_struct(ArenaRef::Blob(Word::words_to_bytes(d)), 0, 0, None, depth)
            }
            _ => Ok(StructReader::empty()),
        };
    };

    if depth <= 0 {
        return Err(Error::from_kind(ErrorKind::NestingLimitExceeded));
    }

    let Ptr::Struct { size, .. } = r.ptr else {
        return Err(Error::from_kind(ErrorKind::ExpectedStructPointer));
    };

    let body = claim(arena, r.seg, r.at, size.total())?;
    Ok(StructReader {
        arena,
        seg: r.seg_id,
        data: &body[..size.data as usize * BYTES_PER_WORD],
        data_bits: u32::from(size.data) * BITS_PER_WORD as u32,
        ptrs_at: r.at + u32::from(size.data),
        ptr_count: size.pointers,
        depth: depth - 1,
    })
}

pub(crate) fn read_list<'a>(
    arena: ArenaRef<'a>,
    seg_id: SegmentId,
    at: u32,
    expected: Option<ElementSize>,
    default: Option<&'a [Word]>,
    depth: i32,
) -> Result<ListReader<'a>> {
    let Some(r) = resolve(arena, seg_id, at)? else {
        return match default {
            Some(d) if !flat_is_null(d) => read_list(
                ArenaRef::Blob(Word::words_to_bytes(d)),
                0,
                0,
                expected,
                None,
                depth,
            ),
            _ => Ok(ListReader::empty()),
        };
    };

    if depth <= 0 {
        return Err(Error::from_kind(ErrorKind::NestingLimitExceeded));
    }

    let Ptr::List { elem, count, .. } = r.ptr else {
        return Err(Error::from_kind(ErrorKind::ExpectedListPointer));
    };

    if elem == ElementSize::InlineComposite {
        // `count` is the body's word count; the element count and the
        // per-element sections come from the tag word in front of it.
        let with_tag = claim(arena, r.seg, r.at, count + 1)?;
        let Ptr::Struct {
            offset: raw_count,
            size,
        } = Ptr::parse(load_word(r.seg, r.at)?)?.unwrap_or(Ptr::Struct {
            offset: 0,
            size: StructSize::new(0, 0),
        })
        else {
            return Err(Error::from_kind(ErrorKind::NonStructInlineComposite));
        };
        let elements = raw_count as u32;

        if u64::from(elements) * u64::from(size.total()) > u64::from(count) {
            return Err(Error::from_kind(ErrorKind::InlineCompositeOverrun));
        }
        if size.total() == 0 {
            // Zero-sized elements occupy no wire space; charge for them so
            // huge claimed counts cannot amplify for free.
            arena.charge(u64::from(elements))?;
        }

        // A primitive or pointer view into struct elements is permitted
        // when each element's leading section can satisfy it; the view then
        // reads each element's first field through the struct stride.
        match expected {
            None | Some(ElementSize::Void | ElementSize::InlineComposite) => {}
            Some(ElementSize::Bit) => {
                return Err(Error::from_kind(ErrorKind::StructListWhereBitListExpected));
            }
            Some(
                ElementSize::Byte
                | ElementSize::TwoBytes
                | ElementSize::FourBytes
                | ElementSize::EightBytes,
            ) => {
                if size.data == 0 {
                    return Err(Error::from_kind(ErrorKind::PointerOnlyStructList));
                }
            }
            Some(ElementSize::Pointer) => {
                if size.pointers == 0 {
                    return Err(Error::from_kind(ErrorKind::DataOnlyStructList));
                }
            }
        }

        Ok(ListReader {
            arena,
            seg: r.seg_id,
            body: &with_tag[BYTES_PER_WORD..],
            at: r.at + 1,
            count: elements,
            step_bits: size.total() * BITS_PER_WORD as u32,
            elem_data_bits: u32::from(size.data) * BITS_PER_WORD as u32,
            elem_ptrs: size.pointers,
            elem,
            depth: depth - 1,
        })
    } else {
        let step = elem.step_bits();
        let words = words_for_bits(u64::from(count) * u64::from(step));
        let body = claim(arena, r.seg, r.at, words)?;
        if elem == ElementSize::Void {
            arena.charge(u64::from(count))?;
        }

        if let Some(exp) = expected {
            if elem == ElementSize::Bit && exp != ElementSize::Bit {
                return Err(Error::from_kind(ErrorKind::BitListWhereStructListExpected));
            }
            // An expected InlineComposite has zero expected sizes here and
            // is bounds-checked at field access instead; this covers the
            // expected primitive and pointer views.
            if exp.data_bits() > elem.data_bits() || exp.pointer_count() > elem.pointer_count() {
                return Err(Error::from_kind(ErrorKind::IncompatibleListElement));
            }
        }

        Ok(ListReader {
            arena,
            seg: r.seg_id,
            body,
            at: r.at,
            count,
            step_bits: step,
            elem_data_bits: elem.data_bits(),
            elem_ptrs: elem.pointer_count() as u16,
            elem,
            depth: depth - 1,
        })
    }
}

/// Resolves a byte-list pointer and claims its body. Shared by text and
/// data reads, which differ only in terminator handling.
fn read_blob<'a>(arena: ArenaRef<'a>, seg_id: SegmentId, at: u32) -> Result<Option<&'a [u8]>> {
    let Some(r) = resolve(arena, seg_id, at)? else {
        return Ok(None);
    };
    let Ptr::List { elem, count, .. } = r.ptr else {
        return Err(Error::from_kind(ErrorKind::ExpectedListPointer));
    };
    if elem != ElementSize::Byte {
        return Err(Error::from_kind(ErrorKind::ExpectedByteList));
    }
    let body = claim(arena, r.seg, r.at, words_for_bytes(count))?;
    Ok(Some(&body[..count as usize]))
}

pub(crate) fn read_text<'a>(
    arena: ArenaRef<'a>,
    seg_id: SegmentId,
    at: u32,
    default: Option<&'a [Word]>,
) -> Result<text::Reader<'a>> {
    match read_blob(arena, seg_id, at)? {
        None => match default {
            Some(d) if !flat_is_null(d) => {
                read_text(ArenaRef::Blob(Word::words_to_bytes(d)), 0, 0, None)
            }
            _ => Ok("".into()),
        },
        // The final byte must be a NUL terminator; it is not content.
        Some(bytes) => match bytes.split_last() {
            Some((0, content)) => Ok(text::Reader(content)),
            _ => Err(Error::from_kind(ErrorKind::TextMissingNulTerminator)),
        },
    }
}

pub(crate) fn read_data<'a>(
    arena: ArenaRef<'a>,
    seg_id: SegmentId,
    at: u32,
    default: Option<&'a [Word]>,
) -> Result<data::Reader<'a>> {
    match read_blob(arena, seg_id, at)? {
        None => match default {
            Some(d) if !flat_is_null(d) => {
                read_data(ArenaRef::Blob(Word::words_to_bytes(d)), 0, 0, None)
            }
            _ => Ok(&[]),
        },
        Some(bytes) => Ok(bytes),
    }
}

/// Words reachable through the pointer at `(seg_id, at)`, charging the
/// budget as it walks. Callers that only wanted the number should refund
/// what the walk consumed.
pub(crate) fn total_size(
    arena: ArenaRef<'_>,
    seg_id: SegmentId,
    at: u32,
    depth: i32,
) -> Result<u64> {
    let Some(r) = resolve(arena, seg_id, at)? else {
        return Ok(0);
    };
    if depth <= 0 {
        return Err(Error::from_kind(ErrorKind::NestingLimitExceeded));
    }

    match r.ptr {
        Ptr::Struct { size, .. } => {
            claim(arena, r.seg, r.at, size.total())?;
            let mut words = u64::from(size.total());
            for i in 0..u32::from(size.pointers) {
                words += total_size(arena, r.seg_id, r.at + u32::from(size.data) + i, depth - 1)?;
            }
            Ok(words)
        }
        Ptr::List { elem, count, .. } => match elem {
            ElementSize::Void => Ok(0),
            ElementSize::Pointer => {
                claim(arena, r.seg, r.at, count)?;
                let mut words = u64::from(count);
                for i in 0..count {
                    words += total_size(arena, r.seg_id, r.at + i, depth - 1)?;
                }
                Ok(words)
            }
            ElementSize::InlineComposite => {
                claim(arena, r.seg, r.at, count + 1)?;
                let Ptr::Struct {
                    offset: raw_count,
                    size,
                } = Ptr::parse(load_word(r.seg, r.at)?)?.unwrap_or(Ptr::Struct {
                    offset: 0,
                    size: StructSize::new(0, 0),
                })
                else {
                    return Err(Error::from_kind(ErrorKind::NonStructInlineComposite));
                };
                let elements = raw_count as u32;
                let per = u64::from(size.total());
                if u64::from(elements) * per > u64::from(count) {
                    return Err(Error::from_kind(ErrorKind::InlineCompositeOverrun));
                }

                // Count the element-derived size, tag included; a copy of
                // this list would occupy exactly that.
                let mut words = u64::from(elements) * per + POINTER_SIZE_IN_WORDS as u64;
                if size.pointers > 0 {
                    for i in 0..elements {
                        let element_at = r.at + 1 + i * size.total();
                        for p in 0..u32::from(size.pointers) {
                            words += total_size(
                                arena,
                                r.seg_id,
                                element_at + u32::from(size.data) + p,
                                depth - 1,
                            )?;
                        }
                    }
                }
                Ok(words)
            }
            _ => {
                let words = words_for_bits(u64::from(count) * u64::from(elem.data_bits()));
                claim(arena, r.seg, r.at, words)?;
                Ok(u64::from(words))
            }
        },
        Ptr::Far { .. } => unreachable!("resolve() never yields a far pointer"),
    }
}

/// An untyped reference slot in a message being read.
#[derive(Clone, Copy)]
pub struct PointerReader<'a> {
    arena: ArenaRef<'a>,
    seg: SegmentId,
    at: u32,
    depth: i32,
}

impl<'a> PointerReader<'a> {
    pub(crate) fn new(arena: ArenaRef<'a>, seg: SegmentId, at: u32, depth: i32) -> Self {
        Self {
            arena,
            seg,
            at,
            depth,
        }
    }

    /// A reader of nothing: reads as a null pointer.
    pub fn null() -> PointerReader<'static> {
        PointerReader {
            arena: ArenaRef::Blob(&NULL_WORD),
            seg: 0,
            at: 0,
            depth: i32::MAX,
        }
    }

    /// The root pointer of a segment: its word 0, validated and charged.
    pub fn get_root(
        arena: &'a dyn ReadArena,
        seg: SegmentId,
        depth: i32,
    ) -> Result<PointerReader<'a>> {
        let arena = ArenaRef::Full(arena);
        let bytes = arena.segment(seg)?;
        span(bytes, 0, POINTER_SIZE_IN_WORDS as u32)?;
        arena.charge(POINTER_SIZE_IN_WORDS as u64)?;
        Ok(PointerReader {
            arena,
            seg,
            at: 0,
            depth,
        })
    }

    /// Wraps a flat, trusted word sequence (such as a schema default blob)
    /// whose first word is the pointer to read.
    pub fn from_words(words: &'a [Word]) -> PointerReader<'a> {
        PointerReader {
            arena: ArenaRef::Blob(Word::words_to_bytes(words)),
            seg: 0,
            at: 0,
            depth: i32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        match self.arena.segment(self.seg).and_then(|s| load_word(s, self.at)) {
            Ok(word) => word == 0,
            Err(_) => true,
        }
    }

    /// Total words reachable through this pointer. The budget is charged
    /// during the walk and refunded before returning, since the caller will
    /// typically traverse the same objects again.
    pub fn total_size(&self) -> Result<u64> {
        let words = total_size(self.arena, self.seg, self.at, self.depth)?;
        self.arena.refund(words);
        Ok(words)
    }

    /// Identifies what this pointer references without committing to a
    /// schema.
    pub fn pointer_type(&self) -> Result<PointerType> {
        match resolve(self.arena, self.seg, self.at)? {
            None => Ok(PointerType::Null),
            Some(r) => match r.ptr {
                Ptr::Struct { .. } => Ok(PointerType::Struct),
                Ptr::List { .. } => Ok(PointerType::List),
                Ptr::Far { .. } => Err(Error::from_kind(ErrorKind::UnexpectedFarPointer)),
            },
        }
    }

    pub fn get_struct(self, default: Option<&'a [Word]>) -> Result<StructReader<'a>> {
        read_struct(self.arena, self.seg, self.at, default, self.depth)
    }

    pub fn get_list(
        self,
        expected: ElementSize,
        default: Option<&'a [Word]>,
    ) -> Result<ListReader<'a>> {
        read_list(self.arena, self.seg, self.at, Some(expected), default, self.depth)
    }

    /// Reads a list of whatever element size it was encoded with.
    pub fn get_list_of_any_size(self, default: Option<&'a [Word]>) -> Result<ListReader<'a>> {
        read_list(self.arena, self.seg, self.at, None, default, self.depth)
    }

    pub fn get_text(self, default: Option<&'a [Word]>) -> Result<text::Reader<'a>> {
        read_text(self.arena, self.seg, self.at, default)
    }

    pub fn get_data(self, default: Option<&'a [Word]>) -> Result<data::Reader<'a>> {
        read_data(self.arena, self.seg, self.at, default)
    }
}

/// Typed view over a struct's data and pointer sections, for reading.
///
/// Reads past the encoded sections yield defaults; that is the
/// forward-compatibility rule letting old data satisfy grown schemas.
#[derive(Clone, Copy, Debug)]
pub struct StructReader<'a> {
    arena: ArenaRef<'a>,
    seg: SegmentId,
    /// The encoded data section.
    data: &'a [u8],
    /// Encoded data size in bits; 1 for bool-list elements viewed as
    /// structs, otherwise a multiple of 64.
    data_bits: u32,
    /// Word index of the pointer section.
    ptrs_at: u32,
    ptr_count: u16,
    depth: i32,
}

impl<'a> StructReader<'a> {
    /// Assembles a view from parts a builder already validated.
    pub(crate) fn from_parts(
        arena: ArenaRef<'a>,
        seg: SegmentId,
        data: &'a [u8],
        data_bits: u32,
        ptrs_at: u32,
        ptr_count: u16,
    ) -> Self {
        Self {
            arena,
            seg,
            data,
            data_bits,
            ptrs_at,
            ptr_count,
            depth: i32::MAX,
        }
    }

    /// The all-default struct: zero-length sections.
    pub fn empty() -> StructReader<'static> {
        StructReader {
            arena: ArenaRef::Blob(&NULL_WORD),
            seg: 0,
            data: &[],
            data_bits: 0,
            ptrs_at: 0,
            ptr_count: 0,
            depth: i32::MAX,
        }
    }

    pub fn data_bits(&self) -> u32 {
        self.data_bits
    }

    pub fn pointer_count(&self) -> u16 {
        self.ptr_count
    }

    /// The raw encoded data section.
    pub fn data_section(&self) -> &'a [u8] {
        self.data
    }

    #[inline]
    pub fn get_data_field<T: Scalar>(&self, offset: usize) -> T {
        let start = offset * T::BYTES;
        if (offset + 1) * T::BYTES * BITS_PER_BYTE <= self.data_bits as usize {
            T::read_le(&self.data[start..start + T::BYTES])
        } else {
            T::default()
        }
    }

    #[inline]
    pub fn get_data_field_mask<T: Scalar>(&self, offset: usize, mask: T::Mask) -> T {
        self.get_data_field::<T>(offset).mask(mask)
    }

    #[inline]
    pub fn get_bool_field(&self, offset: usize) -> bool {
        if (offset as u32) < self.data_bits {
            self.data[offset / BITS_PER_BYTE] & (1 << (offset % BITS_PER_BYTE)) != 0
        } else {
            false
        }
    }

    #[inline]
    pub fn get_bool_field_mask(&self, offset: usize, mask: bool) -> bool {
        self.get_bool_field(offset) ^ mask
    }

    #[inline]
    pub fn get_pointer_field(&self, index: usize) -> PointerReader<'a> {
        if index < self.ptr_count as usize {
            PointerReader {
                arena: self.arena,
                seg: self.seg,
                at: self.ptrs_at + index as u32,
                depth: self.depth,
            }
        } else {
            PointerReader::null()
        }
    }

    pub fn is_pointer_field_null(&self, index: usize) -> bool {
        self.get_pointer_field(index).is_null()
    }

    /// Words occupied by this struct and everything reachable from it, with
    /// the budget refunded afterwards.
    pub fn total_size(&self) -> Result<u64> {
        let mut words = u64::from(words_for_bits(u64::from(self.data_bits)))
            + u64::from(self.ptr_count) * WORDS_PER_POINTER as u64;
        for i in 0..self.ptr_count as u32 {
            words += total_size(self.arena, self.seg, self.ptrs_at + i, self.depth)?;
        }
        self.arena.refund(words);
        Ok(words)
    }
}

/// Typed view over a list, for reading. The uniform stride makes every
/// encoding addressable the same way, including struct views of primitive
/// lists and primitive views of struct lists.
#[derive(Clone, Copy, Debug)]
pub struct ListReader<'a> {
    arena: ArenaRef<'a>,
    seg: SegmentId,
    /// The element region (excluding any tag word).
    body: &'a [u8],
    /// Word index of `body` within the segment.
    at: u32,
    count: u32,
    step_bits: u32,
    elem_data_bits: u32,
    elem_ptrs: u16,
    elem: ElementSize,
    depth: i32,
}

impl<'a> ListReader<'a> {
    /// Assembles a view from parts a builder already validated.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        arena: ArenaRef<'a>,
        seg: SegmentId,
        body: &'a [u8],
        at: u32,
        count: u32,
        step_bits: u32,
        elem_data_bits: u32,
        elem_ptrs: u16,
        elem: ElementSize,
    ) -> Self {
        Self {
            arena,
            seg,
            body,
            at,
            count,
            step_bits,
            elem_data_bits,
            elem_ptrs,
            elem,
            depth: i32::MAX,
        }
    }

    pub fn empty() -> ListReader<'static> {
        ListReader {
            arena: ArenaRef::Blob(&NULL_WORD),
            seg: 0,
            body: &[],
            at: 0,
            count: 0,
            step_bits: 0,
            elem_data_bits: 0,
            elem_ptrs: 0,
            elem: ElementSize::Void,
            depth: i32::MAX,
        }
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn element_size(&self) -> ElementSize {
        self.elem
    }

    pub(crate) fn elem_data_bits(&self) -> u32 {
        self.elem_data_bits
    }

    pub(crate) fn elem_pointer_count(&self) -> u16 {
        self.elem_ptrs
    }

    pub(crate) fn step_bits(&self) -> u32 {
        self.step_bits
    }

    /// The bytes the elements occupy, rounded up to whole bytes.
    pub fn as_raw_bytes(&self) -> &'a [u8] {
        let len = bytes_for_bits(u64::from(self.count) * u64::from(self.step_bits)) as usize;
        &self.body[..len]
    }

    fn element_byte(&self, index: u32) -> usize {
        (u64::from(index) * u64::from(self.step_bits) / BITS_PER_BYTE as u64) as usize
    }

    /// Reads element `index` as a scalar. The index must be in range.
    #[inline]
    pub fn get<T: Scalar>(&self, index: u32) -> T {
        let start = self.element_byte(index);
        T::read_le(&self.body[start..start + T::BYTES])
    }

    /// Reads element `index` of a bit list. The index must be in range.
    #[inline]
    pub fn get_bool(&self, index: u32) -> bool {
        let bit = u64::from(index) * u64::from(self.step_bits);
        self.body[(bit / 8) as usize] & (1 << (bit % 8)) != 0
    }

    /// Views element `index` as a struct; primitive elements appear as the
    /// struct's first data field.
    pub fn get_struct_element(&self, index: u32) -> StructReader<'a> {
        let byte = self.element_byte(index);
        let data_len = bytes_for_bits(u64::from(self.elem_data_bits)) as usize;
        StructReader {
            arena: self.arena,
            seg: self.seg,
            data: &self.body[byte..byte + data_len],
            data_bits: self.elem_data_bits,
            ptrs_at: self.at + ((byte + data_len) / BYTES_PER_WORD) as u32,
            ptr_count: self.elem_ptrs,
            depth: self.depth - 1,
        }
    }

    pub fn get_pointer_element(&self, index: u32) -> PointerReader<'a> {
        let byte = u64::from(self.elem_data_bits) / BITS_PER_BYTE as u64
            + u64::from(index) * u64::from(self.step_bits) / BITS_PER_BYTE as u64;
        PointerReader {
            arena: self.arena,
            seg: self.seg,
            at: self.at + (byte / BYTES_PER_WORD as u64) as u32,
            depth: self.depth,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::bool_assert_comparison)]

    use super::*;
    use crate::{word, Word};

    #[test]
    fn simple_raw_data_struct() {
        let blob: &[Word] = &[
            // Struct pointer: offset 0, one data word, no pointers.
            word(0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00),
            word(0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef),
        ];

        let reader = PointerReader::from_words(blob).get_struct(None).unwrap();

        assert_eq!(0xefcd_ab89_6745_2301u64, reader.get_data_field::<u64>(0));
        assert_eq!(0, reader.get_data_field::<u64>(1)); // past end --> default

        assert_eq!(0x6745_2301u32, reader.get_data_field::<u32>(0));
        assert_eq!(0xefcd_ab89u32, reader.get_data_field::<u32>(1));
        assert_eq!(0, reader.get_data_field::<u32>(2)); // past end --> default

        assert_eq!(0x2301u16, reader.get_data_field::<u16>(0));
        assert_eq!(0x6745u16, reader.get_data_field::<u16>(1));
        assert_eq!(0xab89u16, reader.get_data_field::<u16>(2));
        assert_eq!(0xefcdu16, reader.get_data_field::<u16>(3));
        assert_eq!(0u16, reader.get_data_field::<u16>(4)); // past end --> default

        // The default mask XORs against the stored bits.
        assert_eq!(
            0x2301u16 ^ 0xffff,
            reader.get_data_field_mask::<u16>(0, 0xffff)
        );
        assert_eq!(0xffffu16, reader.get_data_field_mask::<u16>(4, 0xffff));

        // Bits.
        assert_eq!(reader.get_bool_field(0), true);
        for bit in 1..8 {
            assert_eq!(reader.get_bool_field(bit), false);
        }
        assert_eq!(reader.get_bool_field(8), true);
        assert_eq!(reader.get_bool_field(9), true);
        assert_eq!(reader.get_bool_field(10), false);
        assert_eq!(reader.get_bool_field(13), true);
        assert_eq!(reader.get_bool_field(63), true);
        assert_eq!(reader.get_bool_field(64), false); // past end --> default

        assert_eq!(reader.get_bool_field_mask(0, true), false);
        assert_eq!(reader.get_bool_field_mask(1, true), true);
        assert_eq!(reader.get_bool_field_mask(64, true), true);
    }

    #[test]
    fn bool_list() {
        // [true, false, true, false, true, true, true, false, false, true]
        let blob: &[Word] = &[
            // List pointer: offset 0, element size BIT, count 10.
            word(0x01, 0x00, 0x00, 0x00, 0x51, 0x00, 0x00, 0x00),
            word(0x75, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00),
        ];

        let list = PointerReader::from_words(blob)
            .get_list(ElementSize::Bit, None)
            .unwrap();

        assert_eq!(list.len(), 10);
        let expected = [
            true, false, true, false, true, true, true, false, false, true,
        ];
        for (i, &want) in expected.iter().enumerate() {
            assert_eq!(list.get_bool(i as u32), want);
        }
    }

    #[test]
    fn u16_list() {
        let blob: &[Word] = &[
            // List pointer: offset 0, element size TWO_BYTES, count 3.
            word(0x01, 0x00, 0x00, 0x00, 0x1b, 0x00, 0x00, 0x00),
            word(0x10, 0x20, 0x30, 0x40, 0x50, 0x60, 0x00, 0x00),
        ];

        let list = PointerReader::from_words(blob)
            .get_list(ElementSize::TwoBytes, None)
            .unwrap();

        assert_eq!(list.len(), 3);
        assert_eq!(list.get::<u16>(0), 0x2010);
        assert_eq!(list.get::<u16>(1), 0x4030);
        assert_eq!(list.get::<u16>(2), 0x6050);
    }

    #[test]
    fn struct_size() {
        let blob: &[Word] = &[
            // Struct pointer: two data words, one pointer.
            word(0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x01, 0x00),
            word(0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00),
            word(0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00),
            word(0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00),
        ];

        assert_eq!(PointerReader::from_words(blob).total_size().unwrap(), 3);
    }

    #[test]
    fn struct_list_size() {
        let blob: &[Word] = &[
            // Inline-composite list pointer claiming three body words.
            word(0x01, 0x00, 0x00, 0x00, 0x1f, 0x00, 0x00, 0x00),
            // Tag: one element of one data word.
            word(0x04, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00),
            word(0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00),
            word(0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00),
            word(0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00),
        ];

        // The list pointer and the tag disagree about the body size. The
        // size derived from the tag is what a copy would produce, so that
        // is what total_size() reports (plus the tag word itself).
        assert_eq!(PointerReader::from_words(blob).total_size().unwrap(), 2);
    }

    #[test]
    fn empty_struct_list_size() {
        let blob: &[Word] = &[
            // Struct with one pointer.
            word(0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00),
            // Inline-composite list, zero words long.
            word(0x01, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00),
            // Tag.
            word(0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00),
        ];

        assert_eq!(PointerReader::from_words(blob).total_size().unwrap(), 2);
    }

    #[test]
    fn element_size_mismatch_is_rejected() {
        let blob: &[Word] = &[
            // List pointer: element size BYTE, count 4.
            word(0x01, 0x00, 0x00, 0x00, 0x22, 0x00, 0x00, 0x00),
            word(0x61, 0x62, 0x63, 0x00, 0x00, 0x00, 0x00, 0x00),
        ];

        // A wider view than the encoding supports must not be granted.
        assert!(PointerReader::from_words(blob)
            .get_list(ElementSize::EightBytes, None)
            .is_err());
        assert!(PointerReader::from_words(blob)
            .get_list(ElementSize::Byte, None)
            .is_ok());
    }

    #[test]
    fn reserved_pointer_kind_is_rejected() {
        let blob: &[Word] = &[word(0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00)];

        assert!(PointerReader::from_words(blob).get_struct(None).is_err());
        assert!(PointerReader::from_words(blob).pointer_type().is_err());
    }
}
