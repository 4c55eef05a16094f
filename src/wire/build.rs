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

//! Construction and mutation of messages: allocation behind pointer slots,
//! recursive zeroing of replaced objects, pointer transfer between
//! segments, deep copies from readers, and in-place schema upgrades.
//!
//! The builder trusts its own output. Pointer words it reads back were
//! written by this module, so decoding failures and range misses here are
//! programmer errors, not validation failures.

use crate::text;
use crate::wire::arena::{BuildArena, SegmentId};
use crate::wire::ptr::{ElementSize, Ptr, StructSize, MAX_LIST_COUNT};
use crate::wire::read::{ArenaRef, ListReader, PointerReader, PointerType, StructReader};
use crate::wire::scalar::Scalar;
use crate::wire::units::*;
use crate::{data, Error, ErrorKind, Result, Word};

/// A pointer word's location in a message under construction.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Slot {
    pub seg: SegmentId,
    pub at: u32,
}

impl Slot {
    fn new(seg: SegmentId, at: u32) -> Self {
        Self { seg, at }
    }
}

fn load(arena: &dyn BuildArena, slot: Slot) -> u64 {
    let start = slot.at as usize * BYTES_PER_WORD;
    let bytes = &arena.bytes(slot.seg)[start..start + BYTES_PER_WORD];
    u64::from_le_bytes(bytes.try_into().unwrap())
}

fn store(arena: &mut dyn BuildArena, slot: Slot, word: u64) {
    let start = slot.at as usize * BYTES_PER_WORD;
    arena.bytes_mut(slot.seg)[start..start + BYTES_PER_WORD].copy_from_slice(&word.to_le_bytes());
}

fn store_ptr(arena: &mut dyn BuildArena, slot: Slot, ptr: Ptr) {
    store(arena, slot, ptr.encode());
}

fn parse_at(arena: &dyn BuildArena, slot: Slot) -> Option<Ptr> {
    Ptr::parse(load(arena, slot)).expect("builder segments never hold reserved pointers")
}

fn clear_words(arena: &mut dyn BuildArena, seg: SegmentId, at: u32, words: u32) {
    let start = at as usize * BYTES_PER_WORD;
    let len = words as usize * BYTES_PER_WORD;
    arena.bytes_mut(seg)[start..start + len].fill(0);
}

/// Word-by-word copy between two locations of the same message, possibly
/// in different segments. The regions never overlap: destinations are
/// always freshly reserved.
fn move_words(arena: &mut dyn BuildArena, dst: Slot, src: Slot, words: u32) {
    for i in 0..words {
        let w = load(arena, Slot::new(src.seg, src.at + i));
        store(arena, Slot::new(dst.seg, dst.at + i), w);
    }
}

/// Word index of a positional pointer's body within its own segment.
fn body_of(slot: Slot, ptr: Ptr) -> Slot {
    let offset = match ptr {
        Ptr::Struct { offset, .. } | Ptr::List { offset, .. } => offset,
        Ptr::Far { .. } => unreachable!("far pointers have no body offset"),
    };
    Slot::new(slot.seg, (i64::from(slot.at) + 1 + i64::from(offset)) as u32)
}

/// Offset field value aiming a pointer at `slot.at + 1 + offset == body`.
fn offset_to(slot: Slot, body: Slot) -> i32 {
    debug_assert_eq!(slot.seg, body.seg);
    (i64::from(body.at) - i64::from(slot.at) - 1) as i32
}

/// Resolves the pointer at `slot` to the described object: the decoded
/// non-far pointer plus the object's location. `None` means null.
fn follow(arena: &dyn BuildArena, slot: Slot) -> Option<(Ptr, Slot)> {
    let ptr = parse_at(arena, slot)?;
    match ptr {
        Ptr::Far {
            double: false,
            pad,
            seg,
        } => {
            let pad_slot = Slot::new(seg, pad);
            let inner = parse_at(arena, pad_slot).expect("landing pads are never null");
            (inner, body_of(pad_slot, inner)).into()
        }
        Ptr::Far {
            double: true,
            pad,
            seg,
        } => {
            let Some(Ptr::Far {
                double: false,
                pad: body_at,
                seg: body_seg,
            }) = parse_at(arena, Slot::new(seg, pad))
            else {
                unreachable!("double-far pads always start with a single far")
            };
            let tag = parse_at(arena, Slot::new(seg, pad + 1)).unwrap_or(Ptr::Struct {
                offset: 0,
                size: StructSize::new(0, 0),
            });
            (tag, Slot::new(body_seg, body_at)).into()
        }
        _ => (ptr, body_of(slot, ptr)).into(),
    }
}

/// What an allocation's descriptor pointer should say about the object.
#[derive(Clone, Copy)]
enum Shape {
    Struct(StructSize),
    List(ElementSize, u32),
    /// An inline-composite list body of this many words, tag excluded; the
    /// caller writes the tag itself.
    Composite(u32),
}

impl Shape {
    fn ptr(self, offset: i32) -> Ptr {
        match self {
            Self::Struct(size) => Ptr::Struct { offset, size },
            Self::List(elem, count) => Ptr::List {
                offset,
                elem,
                count,
            },
            Self::Composite(words) => Ptr::List {
                offset,
                elem: ElementSize::InlineComposite,
                count: words,
            },
        }
    }
}

/// Reserves `words` words for a new object and wires `origin` up to it,
/// spilling behind a far pointer when the origin's segment is full. Any
/// object the origin previously referenced is zeroed first so it cannot
/// leak into the output. Returns where the body starts.
fn allocate(arena: &mut dyn BuildArena, origin: Slot, words: u32, shape: Shape) -> Slot {
    if parse_at(arena, origin).is_some() {
        zero_object(arena, origin);
    }

    if words == 0 {
        // Zero-size bodies (empty structs, void lists) reserve nothing,
        // but an empty struct at offset zero would encode as all-zero and
        // read back as null. Aim one word backwards, at the origin itself.
        store_ptr(arena, origin, shape.ptr(-1));
        return origin;
    }

    match arena.reserve(origin.seg, words) {
        Some(at) => {
            let body = Slot::new(origin.seg, at);
            store_ptr(arena, origin, shape.ptr(offset_to(origin, body)));
            body
        }
        None => {
            // Reserve one extra word in front of the object as the far
            // pointer's landing pad.
            let (seg, pad_at) = arena.reserve_anywhere(words + POINTER_SIZE_IN_WORDS as u32);
            let pad = Slot::new(seg, pad_at);
            let body = Slot::new(seg, pad_at + 1);
            store_ptr(
                arena,
                origin,
                Ptr::Far {
                    double: false,
                    pad: pad_at,
                    seg,
                },
            );
            store_ptr(arena, pad, shape.ptr(0));
            body
        }
    }
}

/// Recursively zeroes the object `slot` references, so that overwriting the
/// pointer leaves no unreachable bytes behind (and the packing codec can
/// elide the freed words).
pub(crate) fn zero_object(arena: &mut dyn BuildArena, slot: Slot) {
    let Some(ptr) = parse_at(arena, slot) else {
        return;
    };
    match ptr {
        Ptr::Far {
            double,
            pad,
            seg,
        } => {
            let pad_slot = Slot::new(seg, pad);
            if double {
                let Some(Ptr::Far {
                    double: false,
                    pad: body_at,
                    seg: body_seg,
                }) = parse_at(arena, pad_slot)
                else {
                    unreachable!("double-far pads always start with a single far")
                };
                let tag = parse_at(arena, Slot::new(seg, pad + 1)).unwrap_or(Ptr::Struct {
                    offset: 0,
                    size: StructSize::new(0, 0),
                });
                zero_body(arena, tag, Slot::new(body_seg, body_at));
                clear_words(arena, seg, pad, 2);
            } else {
                zero_object(arena, pad_slot);
                clear_words(arena, seg, pad, 1);
            }
        }
        _ => zero_body(arena, ptr, body_of(slot, ptr)),
    }
}

fn zero_body(arena: &mut dyn BuildArena, ptr: Ptr, body: Slot) {
    match ptr {
        Ptr::Struct { size, .. } => {
            for i in 0..u32::from(size.pointers) {
                zero_object(arena, Slot::new(body.seg, body.at + u32::from(size.data) + i));
            }
            clear_words(arena, body.seg, body.at, size.total());
        }
        Ptr::List { elem, count, .. } => match elem {
            ElementSize::Void => {}
            ElementSize::Pointer => {
                for i in 0..count {
                    zero_object(arena, Slot::new(body.seg, body.at + i));
                }
                clear_words(arena, body.seg, body.at, count);
            }
            ElementSize::InlineComposite => {
                let tag = parse_at(arena, body).unwrap_or(Ptr::Struct {
                    offset: 0,
                    size: StructSize::new(0, 0),
                });
                let Ptr::Struct {
                    offset: raw_count,
                    size,
                } = tag
                else {
                    unreachable!("inline composite tags are always struct-shaped")
                };
                for i in 0..raw_count as u32 {
                    let element = body.at + 1 + i * size.total();
                    for p in 0..u32::from(size.pointers) {
                        zero_object(
                            arena,
                            Slot::new(body.seg, element + u32::from(size.data) + p),
                        );
                    }
                }
                // The whole claimed allocation, tag included.
                clear_words(arena, body.seg, body.at, count + 1);
            }
            _ => {
                let words = words_for_bits(u64::from(count) * u64::from(elem.data_bits()));
                clear_words(arena, body.seg, body.at, words);
            }
        },
        Ptr::Far { .. } => unreachable!("handled by zero_object"),
    }
}

/// Zeroes a pointer word and its landing pads, leaving the object body
/// intact; used during upgrades, where the body is about to be moved out.
fn zero_descriptor(arena: &mut dyn BuildArena, slot: Slot) {
    if let Some(Ptr::Far { double, pad, seg }) = parse_at(arena, slot) {
        clear_words(arena, seg, pad, if double { 2 } else { 1 });
    }
    store(arena, slot, 0);
}

/// Makes `dst` reference the object `src` references without copying its
/// body, so the object's address stays stable. Same-segment endpoints get a
/// direct pointer; otherwise a pad goes next to the object (single far) or,
/// failing that, a pad pair goes wherever there is room (double far).
///
/// The caller zeroes the source pointer afterwards; upgrade loops transfer
/// a whole section and then clear it in one sweep.
fn transfer(arena: &mut dyn BuildArena, dst: Slot, src: Slot) {
    debug_assert!(
        parse_at(arena, dst).is_none(),
        "transfer would leak the destination's referent"
    );
    match parse_at(arena, src) {
        None => store(arena, dst, 0),
        // An existing far pointer moves verbatim; its pads stay put.
        Some(far @ Ptr::Far { .. }) => store_ptr(arena, dst, far),
        Some(ptr) => relink(arena, dst, ptr, body_of(src, ptr)),
    }
}

fn relink(arena: &mut dyn BuildArena, dst: Slot, ptr: Ptr, body: Slot) {
    if dst.seg == body.seg {
        let direct = if matches!(ptr, Ptr::Struct { size, .. } if size.total() == 0) {
            ptr.with_offset(-1)
        } else {
            ptr.with_offset(offset_to(dst, body))
        };
        store_ptr(arena, dst, direct);
        return;
    }

    match arena.reserve(body.seg, 1) {
        Some(pad_at) => {
            let pad = Slot::new(body.seg, pad_at);
            store_ptr(arena, pad, ptr.with_offset(offset_to(pad, body)));
            store_ptr(
                arena,
                dst,
                Ptr::Far {
                    double: false,
                    pad: pad_at,
                    seg: body.seg,
                },
            );
        }
        None => {
            let (pad_seg, pad_at) = arena.reserve_anywhere(2);
            store_ptr(
                arena,
                Slot::new(pad_seg, pad_at),
                Ptr::Far {
                    double: false,
                    pad: body.at,
                    seg: body.seg,
                },
            );
            store_ptr(arena, Slot::new(pad_seg, pad_at + 1), ptr.with_offset(0));
            store_ptr(
                arena,
                dst,
                Ptr::Far {
                    double: true,
                    pad: pad_at,
                    seg: pad_seg,
                },
            );
        }
    }
}

pub(crate) fn init_struct<'a>(
    arena: &'a mut dyn BuildArena,
    slot: Slot,
    size: StructSize,
) -> StructBuilder<'a> {
    let body = allocate(arena, slot, size.total(), Shape::Struct(size));
    StructBuilder {
        arena,
        seg: body.seg,
        data_off: body.at * BYTES_PER_WORD as u32,
        data_bits: u32::from(size.data) * BITS_PER_WORD as u32,
        ptrs_at: body.at + u32::from(size.data),
        ptr_count: size.pointers,
    }
}

/// Returns the existing struct writable, upgrading its storage in place if
/// the caller's schema has outgrown it. A reader could bounds-check each
/// access against the smaller encoding, but a writer cannot, so the struct
/// moves to a roomier allocation now.
pub(crate) fn mutable_struct<'a>(
    arena: &'a mut dyn BuildArena,
    slot: Slot,
    want: StructSize,
    default: Option<&'a [Word]>,
) -> Result<StructBuilder<'a>> {
    if parse_at(arena, slot).is_none() {
        match default {
            Some(d) if !PointerReader::from_words(d).is_null() => {
                copy_from(arena, slot, &PointerReader::from_words(d))?;
            }
            _ => return Ok(init_struct(arena, slot, want)),
        }
    }

    let (ptr, body) = follow(arena, slot).expect("slot was just ensured non-null");
    let Ptr::Struct { size: old, .. } = ptr else {
        return Err(Error::from_kind(ErrorKind::ExpectedStructPointer));
    };

    if old.data >= want.data && old.pointers >= want.pointers {
        return Ok(StructBuilder {
            arena,
            seg: body.seg,
            data_off: body.at * BYTES_PER_WORD as u32,
            data_bits: u32::from(old.data) * BITS_PER_WORD as u32,
            ptrs_at: body.at + u32::from(old.data),
            ptr_count: old.pointers,
        });
    }

    let grown = StructSize::new(old.data.max(want.data), old.pointers.max(want.pointers));

    // The old body must survive until it is moved out, so only the pointer
    // and its pads are cleared before reallocating.
    zero_descriptor(arena, slot);
    let new_body = allocate(arena, slot, grown.total(), Shape::Struct(grown));

    move_words(arena, new_body, body, u32::from(old.data));
    for i in 0..u32::from(old.pointers) {
        transfer(
            arena,
            Slot::new(new_body.seg, new_body.at + u32::from(grown.data) + i),
            Slot::new(body.seg, body.at + u32::from(old.data) + i),
        );
    }
    clear_words(arena, body.seg, body.at, old.total());

    Ok(StructBuilder {
        arena,
        seg: new_body.seg,
        data_off: new_body.at * BYTES_PER_WORD as u32,
        data_bits: u32::from(grown.data) * BITS_PER_WORD as u32,
        ptrs_at: new_body.at + u32::from(grown.data),
        ptr_count: grown.pointers,
    })
}

pub(crate) fn init_list<'a>(
    arena: &'a mut dyn BuildArena,
    slot: Slot,
    elem: ElementSize,
    count: u32,
) -> ListBuilder<'a> {
    assert!(
        elem != ElementSize::InlineComposite,
        "struct lists are initialized through init_struct_list()"
    );
    assert!(count <= MAX_LIST_COUNT, "lists are limited to 2**29 elements");

    let step = elem.step_bits();
    let words = words_for_bits(u64::from(count) * u64::from(step));
    let body = allocate(arena, slot, words, Shape::List(elem, count));
    ListBuilder {
        arena,
        seg: body.seg,
        at: body.at,
        count,
        step_bits: step,
        elem_data_bits: elem.data_bits(),
        elem_ptrs: elem.pointer_count() as u16,
        elem,
    }
}

pub(crate) fn init_struct_list<'a>(
    arena: &'a mut dyn BuildArena,
    slot: Slot,
    count: u32,
    size: StructSize,
) -> ListBuilder<'a> {
    let per = size.total();
    let body_words = u64::from(count) * u64::from(per);
    assert!(
        count <= MAX_LIST_COUNT && body_words <= u64::from(MAX_LIST_COUNT),
        "inline composite lists are limited to 2**29 words"
    );
    let body_words = body_words as u32;

    let tag_slot = allocate(
        arena,
        slot,
        body_words + POINTER_SIZE_IN_WORDS as u32,
        Shape::Composite(body_words),
    );
    store_ptr(
        arena,
        tag_slot,
        Ptr::Struct {
            offset: count as i32,
            size,
        },
    );

    ListBuilder {
        arena,
        seg: tag_slot.seg,
        at: tag_slot.at + 1,
        count,
        step_bits: per * BITS_PER_WORD as u32,
        elem_data_bits: u32::from(size.data) * BITS_PER_WORD as u32,
        elem_ptrs: size.pointers,
        elem: ElementSize::InlineComposite,
    }
}

/// Returns an existing non-struct list writable. Nothing upgrades *to* a
/// non-struct encoding, so the encoding found merely has to satisfy the
/// request; struct elements satisfy any primitive view their leading
/// section covers.
pub(crate) fn mutable_list<'a>(
    arena: &'a mut dyn BuildArena,
    slot: Slot,
    want: ElementSize,
    default: Option<&'a [Word]>,
) -> Result<ListBuilder<'a>> {
    assert!(
        want != ElementSize::InlineComposite,
        "struct lists are obtained through mutable_struct_list()"
    );

    if parse_at(arena, slot).is_none() {
        match default {
            Some(d) if !PointerReader::from_words(d).is_null() => {
                copy_from(arena, slot, &PointerReader::from_words(d))?;
            }
            _ => return Ok(ListBuilder::detached(arena)),
        }
    }

    let (ptr, body) = follow(arena, slot).expect("slot was just ensured non-null");
    let Ptr::List { elem, count, .. } = ptr else {
        return Err(Error::from_kind(ErrorKind::ExpectedListPointer));
    };

    if elem == ElementSize::InlineComposite {
        let Some(Ptr::Struct {
            offset: raw_count,
            size,
        }) = parse_at(arena, body)
        else {
            unreachable!("inline composite tags are always struct-shaped")
        };

        match want {
            ElementSize::Void => {}
            ElementSize::Bit => {
                return Err(Error::from_kind(ErrorKind::StructListWhereBitListExpected));
            }
            ElementSize::Pointer => {
                if size.pointers == 0 {
                    return Err(Error::from_kind(ErrorKind::IncompatibleListElement));
                }
            }
            _ => {
                if size.data == 0 {
                    return Err(Error::from_kind(ErrorKind::IncompatibleListElement));
                }
            }
        }

        Ok(ListBuilder {
            arena,
            seg: body.seg,
            at: body.at + 1,
            count: raw_count as u32,
            step_bits: size.total() * BITS_PER_WORD as u32,
            elem_data_bits: u32::from(size.data) * BITS_PER_WORD as u32,
            elem_ptrs: size.pointers,
            elem: ElementSize::InlineComposite,
        })
    } else {
        if elem.data_bits() < want.data_bits() || elem.pointer_count() < want.pointer_count() {
            return Err(Error::from_kind(ErrorKind::IncompatibleListElement));
        }
        Ok(ListBuilder {
            arena,
            seg: body.seg,
            at: body.at,
            count,
            step_bits: elem.step_bits(),
            elem_data_bits: elem.data_bits(),
            elem_ptrs: elem.pointer_count() as u16,
            elem,
        })
    }
}

/// Returns an existing struct list writable, widening its elements in place
/// if the caller's schema has outgrown them, or expanding a primitive
/// encoding into struct elements.
pub(crate) fn mutable_struct_list<'a>(
    arena: &'a mut dyn BuildArena,
    slot: Slot,
    want: StructSize,
    default: Option<&'a [Word]>,
) -> Result<ListBuilder<'a>> {
    if parse_at(arena, slot).is_none() {
        match default {
            Some(d) if !PointerReader::from_words(d).is_null() => {
                copy_from(arena, slot, &PointerReader::from_words(d))?;
            }
            _ => return Ok(ListBuilder::detached(arena)),
        }
    }

    let (ptr, body) = follow(arena, slot).expect("slot was just ensured non-null");
    let Ptr::List { elem, count, .. } = ptr else {
        return Err(Error::from_kind(ErrorKind::ExpectedListPointer));
    };

    if elem == ElementSize::InlineComposite {
        let Some(Ptr::Struct {
            offset: raw_count,
            size: old,
        }) = parse_at(arena, body)
        else {
            unreachable!("inline composite tags are always struct-shaped")
        };
        let elements = raw_count as u32;

        if old.data >= want.data && old.pointers >= want.pointers {
            return Ok(ListBuilder {
                arena,
                seg: body.seg,
                at: body.at + 1,
                count: elements,
                step_bits: old.total() * BITS_PER_WORD as u32,
                elem_data_bits: u32::from(old.data) * BITS_PER_WORD as u32,
                elem_ptrs: old.pointers,
                elem: ElementSize::InlineComposite,
            });
        }

        // Written under an older schema: rebuild with widened sections and
        // move every element across, keeping the old bodies alive until
        // each has been moved.
        let grown = StructSize::new(old.data.max(want.data), old.pointers.max(want.pointers));
        let per_old = old.total();
        let per_new = grown.total();
        let new_words = per_new * elements;

        zero_descriptor(arena, slot);
        let tag_slot = allocate(
            arena,
            slot,
            new_words + POINTER_SIZE_IN_WORDS as u32,
            Shape::Composite(new_words),
        );
        store_ptr(
            arena,
            tag_slot,
            Ptr::Struct {
                offset: elements as i32,
                size: grown,
            },
        );

        for i in 0..elements {
            let src = body.at + 1 + i * per_old;
            let dst = tag_slot.at + 1 + i * per_new;
            move_words(
                arena,
                Slot::new(tag_slot.seg, dst),
                Slot::new(body.seg, src),
                u32::from(old.data),
            );
            for p in 0..u32::from(old.pointers) {
                transfer(
                    arena,
                    Slot::new(tag_slot.seg, dst + u32::from(grown.data) + p),
                    Slot::new(body.seg, src + u32::from(old.data) + p),
                );
            }
        }
        // The old allocation is dead in its entirety, tag included.
        clear_words(arena, body.seg, body.at, per_old * elements + 1);

        Ok(ListBuilder {
            arena,
            seg: tag_slot.seg,
            at: tag_slot.at + 1,
            count: elements,
            step_bits: per_new * BITS_PER_WORD as u32,
            elem_data_bits: u32::from(grown.data) * BITS_PER_WORD as u32,
            elem_ptrs: grown.pointers,
            elem: ElementSize::InlineComposite,
        })
    } else {
        match elem {
            // Nothing to move out of a void list.
            ElementSize::Void => Ok(init_struct_list(arena, slot, count, want)),
            ElementSize::Bit => Err(Error::from_kind(ErrorKind::BitListWhereStructListExpected)),
            _ => {
                // Expand primitive or pointer elements into struct
                // elements: old data lands in each element's first data
                // word, old pointers in its first pointer slot.
                let mut grown = want;
                if elem == ElementSize::Pointer {
                    grown.pointers = grown.pointers.max(1);
                } else {
                    grown.data = grown.data.max(1);
                }
                let per = grown.total();
                let old_step_bits = elem.step_bits();

                zero_descriptor(arena, slot);
                let tag_slot = allocate(
                    arena,
                    slot,
                    per * count + POINTER_SIZE_IN_WORDS as u32,
                    Shape::Composite(per * count),
                );
                store_ptr(
                    arena,
                    tag_slot,
                    Ptr::Struct {
                        offset: count as i32,
                        size: grown,
                    },
                );

                if elem == ElementSize::Pointer {
                    for i in 0..count {
                        transfer(
                            arena,
                            Slot::new(
                                tag_slot.seg,
                                tag_slot.at + 1 + i * per + u32::from(grown.data),
                            ),
                            Slot::new(body.seg, body.at + i),
                        );
                    }
                } else {
                    let elem_bytes = (elem.data_bits() as usize) / BITS_PER_BYTE;
                    for i in 0..count {
                        let mut buf = [0u8; BYTES_PER_WORD];
                        let src = body.at as usize * BYTES_PER_WORD + i as usize * elem_bytes;
                        buf[..elem_bytes]
                            .copy_from_slice(&arena.bytes(body.seg)[src..src + elem_bytes]);
                        let dst = (tag_slot.at + 1 + i * per) as usize * BYTES_PER_WORD;
                        arena.bytes_mut(tag_slot.seg)[dst..dst + elem_bytes]
                            .copy_from_slice(&buf[..elem_bytes]);
                    }
                }

                // Zero the old body, partial trailing byte included.
                let old_len =
                    bytes_for_bits(u64::from(count) * u64::from(old_step_bits)) as usize;
                let start = body.at as usize * BYTES_PER_WORD;
                arena.bytes_mut(body.seg)[start..start + old_len].fill(0);

                Ok(ListBuilder {
                    arena,
                    seg: tag_slot.seg,
                    at: tag_slot.at + 1,
                    count,
                    step_bits: per * BITS_PER_WORD as u32,
                    elem_data_bits: u32::from(grown.data) * BITS_PER_WORD as u32,
                    elem_ptrs: grown.pointers,
                    elem: ElementSize::InlineComposite,
                })
            }
        }
    }
}

pub(crate) fn init_text<'a>(
    arena: &'a mut dyn BuildArena,
    slot: Slot,
    len: u32,
) -> text::Builder<'a> {
    // One extra byte holds the NUL terminator.
    let body = allocate(
        arena,
        slot,
        words_for_bytes(len + 1),
        Shape::List(ElementSize::Byte, len + 1),
    );
    let start = body.at as usize * BYTES_PER_WORD;
    text::Builder::new(&mut arena.bytes_mut(body.seg)[start..start + len as usize])
}

pub(crate) fn set_text<'a>(
    arena: &'a mut dyn BuildArena,
    slot: Slot,
    value: text::Reader<'_>,
) -> text::Builder<'a> {
    let mut builder = init_text(arena, slot, value.len() as u32);
    builder.reborrow().as_bytes_mut().copy_from_slice(value.as_bytes());
    builder
}

pub(crate) fn mutable_text<'a>(
    arena: &'a mut dyn BuildArena,
    slot: Slot,
    default: Option<&'a [Word]>,
) -> Result<text::Builder<'a>> {
    if parse_at(arena, slot).is_none() {
        match default {
            Some(d) if !PointerReader::from_words(d).is_null() => {
                copy_from(arena, slot, &PointerReader::from_words(d))?;
            }
            _ => return Ok(text::Builder::new(&mut [])),
        }
    }

    let (ptr, body) = follow(arena, slot).expect("slot was just ensured non-null");
    let count = expect_byte_list(ptr)?;

    let start = body.at as usize * BYTES_PER_WORD;
    match arena.bytes(body.seg)[start..start + count as usize].split_last() {
        Some((0, _)) => {}
        _ => return Err(Error::from_kind(ErrorKind::TextMissingNulTerminator)),
    }
    // The terminator is not part of the logical content; the cursor starts
    // at the end so pushes append.
    let content_len = count as usize - 1;
    Ok(text::Builder::continued(
        &mut arena.bytes_mut(body.seg)[start..start + content_len],
        content_len,
    ))
}

pub(crate) fn init_data<'a>(
    arena: &'a mut dyn BuildArena,
    slot: Slot,
    len: u32,
) -> data::Builder<'a> {
    let body = allocate(
        arena,
        slot,
        words_for_bytes(len),
        Shape::List(ElementSize::Byte, len),
    );
    let start = body.at as usize * BYTES_PER_WORD;
    &mut arena.bytes_mut(body.seg)[start..start + len as usize]
}

pub(crate) fn set_data<'a>(
    arena: &'a mut dyn BuildArena,
    slot: Slot,
    value: &[u8],
) -> data::Builder<'a> {
    let builder = init_data(arena, slot, value.len() as u32);
    builder.copy_from_slice(value);
    builder
}

pub(crate) fn mutable_data<'a>(
    arena: &'a mut dyn BuildArena,
    slot: Slot,
    default: Option<&'a [Word]>,
) -> Result<data::Builder<'a>> {
    if parse_at(arena, slot).is_none() {
        match default {
            Some(d) if !PointerReader::from_words(d).is_null() => {
                copy_from(arena, slot, &PointerReader::from_words(d))?;
            }
            _ => return Ok(&mut []),
        }
    }

    let (ptr, body) = follow(arena, slot).expect("slot was just ensured non-null");
    let count = expect_byte_list(ptr)?;
    let start = body.at as usize * BYTES_PER_WORD;
    Ok(&mut arena.bytes_mut(body.seg)[start..start + count as usize])
}

fn expect_byte_list(ptr: Ptr) -> Result<u32> {
    let Ptr::List { elem, count, .. } = ptr else {
        return Err(Error::from_kind(ErrorKind::ExpectedListPointer));
    };
    if elem != ElementSize::Byte {
        return Err(Error::from_kind(ErrorKind::ExpectedByteList));
    }
    Ok(count)
}

/// Deep-copies whatever `src` references into a fresh allocation at `slot`,
/// validating the source as it goes. The source's own nesting budget bounds
/// the recursion.
pub(crate) fn copy_from(
    arena: &mut dyn BuildArena,
    slot: Slot,
    src: &PointerReader<'_>,
) -> Result<()> {
    match src.pointer_type()? {
        PointerType::Null => {
            if parse_at(arena, slot).is_some() {
                zero_object(arena, slot);
                store(arena, slot, 0);
            }
            Ok(())
        }
        PointerType::Struct => set_struct(arena, slot, &src.get_struct(None)?),
        PointerType::List => set_list(arena, slot, &src.get_list_of_any_size(None)?),
    }
}

/// Deep-copies `value` into a fresh allocation referenced by `slot`.
pub(crate) fn set_struct(
    arena: &mut dyn BuildArena,
    slot: Slot,
    value: &StructReader<'_>,
) -> Result<()> {
    let data_len = bytes_for_bits(u64::from(value.data_bits()));
    let size = StructSize::new(words_for_bytes(data_len) as u16, value.pointer_count());
    let body = allocate(arena, slot, size.total(), Shape::Struct(size));

    let start = body.at as usize * BYTES_PER_WORD;
    if value.data_bits() == 1 {
        // A single-bit data section arises from bool lists viewed as
        // structs; copy the bit, not a byte.
        if value.get_bool_field(0) {
            arena.bytes_mut(body.seg)[start] = 1;
        }
    } else {
        arena.bytes_mut(body.seg)[start..start + data_len as usize]
            .copy_from_slice(value.data_section());
    }

    for i in 0..u32::from(size.pointers) {
        copy_from(
            arena,
            Slot::new(body.seg, body.at + u32::from(size.data) + i),
            &value.get_pointer_field(i as usize),
        )?;
    }
    Ok(())
}

/// Deep-copies `value` into a fresh list allocation referenced by `slot`.
pub(crate) fn set_list(
    arena: &mut dyn BuildArena,
    slot: Slot,
    value: &ListReader<'_>,
) -> Result<()> {
    match value.element_size() {
        ElementSize::InlineComposite => {
            let size = StructSize::new(
                (value.elem_data_bits() as usize / BITS_PER_WORD) as u16,
                value.elem_pointer_count(),
            );
            let per = size.total();
            let body_words = per * value.len();
            let tag_slot = allocate(
                arena,
                slot,
                body_words + POINTER_SIZE_IN_WORDS as u32,
                Shape::Composite(body_words),
            );
            store_ptr(
                arena,
                tag_slot,
                Ptr::Struct {
                    offset: value.len() as i32,
                    size,
                },
            );

            let data_len = u32::from(size.data) as usize * BYTES_PER_WORD;
            for i in 0..value.len() {
                let element = value.get_struct_element(i);
                let at = tag_slot.at + 1 + i * per;
                let start = at as usize * BYTES_PER_WORD;
                arena.bytes_mut(tag_slot.seg)[start..start + data_len]
                    .copy_from_slice(element.data_section());
                for p in 0..u32::from(size.pointers) {
                    copy_from(
                        arena,
                        Slot::new(tag_slot.seg, at + u32::from(size.data) + p),
                        &element.get_pointer_field(p as usize),
                    )?;
                }
            }
            Ok(())
        }
        ElementSize::Pointer => {
            let body = allocate(
                arena,
                slot,
                value.len(),
                Shape::List(ElementSize::Pointer, value.len()),
            );
            for i in 0..value.len() {
                copy_from(
                    arena,
                    Slot::new(body.seg, body.at + i),
                    &value.get_pointer_element(i),
                )?;
            }
            Ok(())
        }
        elem => {
            let bits = u64::from(value.len()) * u64::from(value.step_bits());
            let body = allocate(
                arena,
                slot,
                words_for_bits(bits),
                Shape::List(elem, value.len()),
            );
            let src = value.as_raw_bytes();
            let start = body.at as usize * BYTES_PER_WORD;
            let whole = (bits / BITS_PER_BYTE as u64) as usize;
            let dst = arena.bytes_mut(body.seg);
            dst[start..start + whole].copy_from_slice(&src[..whole]);
            // Mask the trailing partial byte so bits past the list's end
            // stay zero.
            let spare_bits = (bits % BITS_PER_BYTE as u64) as u8;
            if spare_bits > 0 {
                dst[start + whole] = src[whole] & ((1 << spare_bits) - 1);
            }
            Ok(())
        }
    }
}

/// An untyped reference slot in a message being built.
pub struct PointerBuilder<'a> {
    arena: &'a mut dyn BuildArena,
    slot: Slot,
}

impl<'a> PointerBuilder<'a> {
    pub(crate) fn new(arena: &'a mut dyn BuildArena, seg: SegmentId, at: u32) -> Self {
        Self {
            arena,
            slot: Slot::new(seg, at),
        }
    }

    pub fn reborrow(&mut self) -> PointerBuilder<'_> {
        PointerBuilder {
            arena: self.arena,
            slot: self.slot,
        }
    }

    pub fn is_null(&self) -> bool {
        load(&*self.arena, self.slot) == 0
    }

    pub fn init_struct(self, size: StructSize) -> StructBuilder<'a> {
        init_struct(self.arena, self.slot, size)
    }

    pub fn get_struct(
        self,
        size: StructSize,
        default: Option<&'a [Word]>,
    ) -> Result<StructBuilder<'a>> {
        mutable_struct(self.arena, self.slot, size, default)
    }

    pub fn init_list(self, elem: ElementSize, count: u32) -> ListBuilder<'a> {
        init_list(self.arena, self.slot, elem, count)
    }

    pub fn get_list(
        self,
        elem: ElementSize,
        default: Option<&'a [Word]>,
    ) -> Result<ListBuilder<'a>> {
        mutable_list(self.arena, self.slot, elem, default)
    }

    pub fn init_struct_list(self, count: u32, size: StructSize) -> ListBuilder<'a> {
        init_struct_list(self.arena, self.slot, count, size)
    }

    pub fn get_struct_list(
        self,
        size: StructSize,
        default: Option<&'a [Word]>,
    ) -> Result<ListBuilder<'a>> {
        mutable_struct_list(self.arena, self.slot, size, default)
    }

    pub fn init_text(self, len: u32) -> text::Builder<'a> {
        init_text(self.arena, self.slot, len)
    }

    pub fn get_text(self, default: Option<&'a [Word]>) -> Result<text::Builder<'a>> {
        mutable_text(self.arena, self.slot, default)
    }

    pub fn set_text(&mut self, value: text::Reader<'_>) {
        set_text(self.arena, self.slot, value);
    }

    pub fn init_data(self, len: u32) -> data::Builder<'a> {
        init_data(self.arena, self.slot, len)
    }

    pub fn get_data(self, default: Option<&'a [Word]>) -> Result<data::Builder<'a>> {
        mutable_data(self.arena, self.slot, default)
    }

    pub fn set_data(&mut self, value: &[u8]) {
        set_data(self.arena, self.slot, value);
    }

    pub fn set_struct(&mut self, value: &StructReader<'_>) -> Result<()> {
        set_struct(self.arena, self.slot, value)
    }

    pub fn set_list(&mut self, value: &ListReader<'_>) -> Result<()> {
        set_list(self.arena, self.slot, value)
    }

    /// Deep-copies from another message.
    pub fn copy_from(&mut self, other: PointerReader<'_>) -> Result<()> {
        copy_from(self.arena, self.slot, &other)
    }

    /// Zeroes the referenced subtree and nulls the pointer.
    pub fn clear(&mut self) {
        zero_object(self.arena, self.slot);
        store(self.arena, self.slot, 0);
    }

    pub fn as_reader(&self) -> PointerReader<'_> {
        let arena: &dyn BuildArena = &*self.arena;
        PointerReader::new(
            ArenaRef::Full(arena.as_read()),
            self.slot.seg,
            self.slot.at,
            i32::MAX,
        )
    }

    pub fn into_reader(self) -> PointerReader<'a> {
        let arena: &'a dyn BuildArena = self.arena;
        PointerReader::new(
            ArenaRef::Full(arena.as_read()),
            self.slot.seg,
            self.slot.at,
            i32::MAX,
        )
    }
}

/// Typed view over a struct's sections, for writing.
pub struct StructBuilder<'a> {
    arena: &'a mut dyn BuildArena,
    seg: SegmentId,
    /// Byte offset of the data section within the segment.
    data_off: u32,
    data_bits: u32,
    /// Word index of the pointer section.
    ptrs_at: u32,
    ptr_count: u16,
}

impl<'a> StructBuilder<'a> {
    pub fn reborrow(&mut self) -> StructBuilder<'_> {
        StructBuilder {
            arena: self.arena,
            seg: self.seg,
            data_off: self.data_off,
            data_bits: self.data_bits,
            ptrs_at: self.ptrs_at,
            ptr_count: self.ptr_count,
        }
    }

    fn data_range(&self, start: usize, len: usize) -> core::ops::Range<usize> {
        debug_assert!((start + len) * BITS_PER_BYTE <= self.data_bits as usize + 7);
        let base = self.data_off as usize + start;
        base..base + len
    }

    #[inline]
    pub fn set_data_field<T: Scalar>(&mut self, offset: usize, value: T) {
        let range = self.data_range(offset * T::BYTES, T::BYTES);
        value.write_le(&mut self.arena.bytes_mut(self.seg)[range]);
    }

    #[inline]
    pub fn set_data_field_mask<T: Scalar>(&mut self, offset: usize, value: T, mask: T::Mask) {
        self.set_data_field(offset, value.mask(mask));
    }

    #[inline]
    pub fn get_data_field<T: Scalar>(&self, offset: usize) -> T {
        let range = self.data_range(offset * T::BYTES, T::BYTES);
        T::read_le(&self.arena.bytes(self.seg)[range])
    }

    #[inline]
    pub fn get_data_field_mask<T: Scalar>(&self, offset: usize, mask: T::Mask) -> T {
        self.get_data_field::<T>(offset).mask(mask)
    }

    #[inline]
    pub fn set_bool_field(&mut self, offset: usize, value: bool) {
        let range = self.data_range(offset / BITS_PER_BYTE, 1);
        let byte = &mut self.arena.bytes_mut(self.seg)[range][0];
        let bit = offset % BITS_PER_BYTE;
        *byte = (*byte & !(1 << bit)) | (u8::from(value) << bit);
    }

    #[inline]
    pub fn set_bool_field_mask(&mut self, offset: usize, value: bool, mask: bool) {
        self.set_bool_field(offset, value ^ mask);
    }

    #[inline]
    pub fn get_bool_field(&self, offset: usize) -> bool {
        let range = self.data_range(offset / BITS_PER_BYTE, 1);
        self.arena.bytes(self.seg)[range][0] & (1 << (offset % BITS_PER_BYTE)) != 0
    }

    #[inline]
    pub fn get_bool_field_mask(&self, offset: usize, mask: bool) -> bool {
        self.get_bool_field(offset) ^ mask
    }

    #[inline]
    pub fn get_pointer_field(self, index: usize) -> PointerBuilder<'a> {
        assert!(index < self.ptr_count as usize, "pointer field out of range");
        PointerBuilder {
            arena: self.arena,
            slot: Slot::new(self.seg, self.ptrs_at + index as u32),
        }
    }

    #[inline]
    pub fn get_pointer_field_mut(&mut self, index: usize) -> PointerBuilder<'_> {
        assert!(index < self.ptr_count as usize, "pointer field out of range");
        PointerBuilder {
            arena: self.arena,
            slot: Slot::new(self.seg, self.ptrs_at + index as u32),
        }
    }

    pub fn is_pointer_field_null(&self, index: usize) -> bool {
        index >= self.ptr_count as usize
            || load(&*self.arena, Slot::new(self.seg, self.ptrs_at + index as u32)) == 0
    }

    /// Overwrites this struct's content from a reader, zero-extending
    /// sections the reader lacks and truncating the rest.
    pub fn copy_content_from(&mut self, other: &StructReader<'_>) -> Result<()> {
        let own_bytes = bytes_for_bits(u64::from(self.data_bits)) as usize;
        let shared_bits = self.data_bits.min(other.data_bits());

        if shared_bits == 1 {
            let value = other.get_bool_field(0);
            let start = self.data_off as usize;
            self.arena.bytes_mut(self.seg)[start..start + own_bytes].fill(0);
            self.set_bool_field(0, value);
        } else {
            let shared_bytes = (shared_bits as usize) / BITS_PER_BYTE;
            let start = self.data_off as usize;
            let dst = &mut self.arena.bytes_mut(self.seg)[start..start + own_bytes];
            dst[..shared_bytes].copy_from_slice(&other.data_section()[..shared_bytes]);
            dst[shared_bytes..].fill(0);
        }

        for i in 0..self.ptr_count as usize {
            let slot = Slot::new(self.seg, self.ptrs_at + i as u32);
            zero_object(self.arena, slot);
            store(self.arena, slot, 0);
        }
        let shared_ptrs = self.ptr_count.min(other.pointer_count());
        for i in 0..shared_ptrs as usize {
            copy_from(
                self.arena,
                Slot::new(self.seg, self.ptrs_at + i as u32),
                &other.get_pointer_field(i),
            )?;
        }
        Ok(())
    }

    pub fn as_reader(&self) -> StructReader<'_> {
        let arena: &dyn BuildArena = &*self.arena;
        let data_len = bytes_for_bits(u64::from(self.data_bits)) as usize;
        let start = self.data_off as usize;
        StructReader::from_parts(
            ArenaRef::Full(arena.as_read()),
            self.seg,
            &arena.bytes(self.seg)[start..start + data_len],
            self.data_bits,
            self.ptrs_at,
            self.ptr_count,
        )
    }

    pub fn into_reader(self) -> StructReader<'a> {
        let arena: &'a dyn BuildArena = self.arena;
        let data_len = bytes_for_bits(u64::from(self.data_bits)) as usize;
        let start = self.data_off as usize;
        StructReader::from_parts(
            ArenaRef::Full(arena.as_read()),
            self.seg,
            &arena.bytes(self.seg)[start..start + data_len],
            self.data_bits,
            self.ptrs_at,
            self.ptr_count,
        )
    }
}

/// Typed view over a list, for writing.
pub struct ListBuilder<'a> {
    arena: &'a mut dyn BuildArena,
    seg: SegmentId,
    /// Word index of the element region.
    at: u32,
    count: u32,
    step_bits: u32,
    elem_data_bits: u32,
    elem_ptrs: u16,
    elem: ElementSize,
}

impl<'a> std::fmt::Debug for ListBuilder<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListBuilder")
            .field("seg", &self.seg)
            .field("at", &self.at)
            .field("count", &self.count)
            .field("step_bits", &self.step_bits)
            .field("elem_data_bits", &self.elem_data_bits)
            .field("elem_ptrs", &self.elem_ptrs)
            .field("elem", &self.elem)
            .finish()
    }
}

impl<'a> ListBuilder<'a> {
    /// An empty list view backed by nothing, for null slots read without a
    /// default.
    pub(crate) fn detached(arena: &'a mut dyn BuildArena) -> Self {
        Self {
            arena,
            seg: 0,
            at: 0,
            count: 0,
            step_bits: 0,
            elem_data_bits: 0,
            elem_ptrs: 0,
            elem: ElementSize::Void,
        }
    }

    pub fn reborrow(&mut self) -> ListBuilder<'_> {
        ListBuilder {
            arena: self.arena,
            seg: self.seg,
            at: self.at,
            count: self.count,
            step_bits: self.step_bits,
            elem_data_bits: self.elem_data_bits,
            elem_ptrs: self.elem_ptrs,
            elem: self.elem,
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

    fn element_byte(&self, index: u32) -> usize {
        self.at as usize * BYTES_PER_WORD
            + (u64::from(index) * u64::from(self.step_bits) / BITS_PER_BYTE as u64) as usize
    }

    /// Writes element `index`. The index must be in range.
    #[inline]
    pub fn set<T: Scalar>(&mut self, index: u32, value: T) {
        let start = self.element_byte(index);
        value.write_le(&mut self.arena.bytes_mut(self.seg)[start..start + T::BYTES]);
    }

    /// Reads element `index` back. The index must be in range.
    #[inline]
    pub fn get<T: Scalar>(&self, index: u32) -> T {
        let start = self.element_byte(index);
        T::read_le(&self.arena.bytes(self.seg)[start..start + T::BYTES])
    }

    #[inline]
    pub fn set_bool(&mut self, index: u32, value: bool) {
        let bit = u64::from(index) * u64::from(self.step_bits);
        let start = self.at as usize * BYTES_PER_WORD + (bit / 8) as usize;
        let byte = &mut self.arena.bytes_mut(self.seg)[start];
        let bitnum = (bit % 8) as u8;
        *byte = (*byte & !(1 << bitnum)) | (u8::from(value) << bitnum);
    }

    #[inline]
    pub fn get_bool(&self, index: u32) -> bool {
        let bit = u64::from(index) * u64::from(self.step_bits);
        let start = self.at as usize * BYTES_PER_WORD + (bit / 8) as usize;
        self.arena.bytes(self.seg)[start] & (1 << (bit % 8)) != 0
    }

    pub fn get_struct_element(self, index: u32) -> StructBuilder<'a> {
        let data_off = self.element_byte(index) as u32;
        let data_len = bytes_for_bits(u64::from(self.elem_data_bits));
        StructBuilder {
            arena: self.arena,
            seg: self.seg,
            data_off,
            data_bits: self.elem_data_bits,
            ptrs_at: (data_off + data_len) / BYTES_PER_WORD as u32,
            ptr_count: self.elem_ptrs,
        }
    }

    pub fn get_pointer_element(self, index: u32) -> PointerBuilder<'a> {
        let byte = u64::from(self.elem_data_bits) / BITS_PER_BYTE as u64
            + u64::from(index) * u64::from(self.step_bits) / BITS_PER_BYTE as u64;
        PointerBuilder {
            arena: self.arena,
            slot: Slot::new(self.seg, self.at + (byte / BYTES_PER_WORD as u64) as u32),
        }
    }

    pub fn into_reader(self) -> ListReader<'a> {
        let arena: &'a dyn BuildArena = self.arena;
        let start = self.at as usize * BYTES_PER_WORD;
        let len = bytes_for_bits(u64::from(self.count) * u64::from(self.step_bits)) as usize;
        ListReader::from_parts(
            ArenaRef::Full(arena.as_read()),
            self.seg,
            &arena.bytes(self.seg)[start..start + len],
            self.at,
            self.count,
            self.step_bits,
            self.elem_data_bits,
            self.elem_ptrs,
            self.elem,
        )
    }
}
