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

//! The collection of segments backing one message.
//!
//! Segment memory is always handed out as byte slices, so every bounds
//! question reduces to an integer range check against a slice length; the
//! traversal code contains no pointer arithmetic of its own.

use core::slice;

use crate::message::{Allocator, ReaderOptions, ReaderSegments};
use crate::wire::limit::ReadLimiter;
use crate::wire::units::BYTES_PER_WORD;
use crate::OutputSegments;
use crate::{Error, ErrorKind, Result};

pub type SegmentId = u32;

/// Read access to a message's segments plus its traversal accounting.
pub trait ReadArena {
    /// The bytes of segment `id`, truncated to whole words. Unknown ids and
    /// misaligned buffers are validation failures.
    fn segment(&self, id: SegmentId) -> Result<&[u8]>;

    /// Charges words against the traversal budget.
    fn charge(&self, words: u64) -> Result<()>;

    /// Returns words to the budget after a known double-count.
    fn refund(&self, words: u64);

    fn depth_limit(&self) -> i32;
}

#[derive(Debug)]
pub struct ReaderArenaImpl<S> {
    segments: S,
    limiter: ReadLimiter,
    depth_limit: i32,
}

impl<S> ReaderArenaImpl<S>
where
    S: ReaderSegments,
{
    pub fn new(segments: S, options: ReaderOptions) -> Self {
        Self {
            segments,
            limiter: ReadLimiter::new(options.traversal_limit_in_words),
            depth_limit: options.nesting_limit,
        }
    }

    pub fn into_segments(self) -> S {
        self.segments
    }
}

impl<S> ReadArena for ReaderArenaImpl<S>
where
    S: ReaderSegments,
{
    fn segment(&self, id: SegmentId) -> Result<&[u8]> {
        let Some(seg) = self.segments.get_segment(id) else {
            log::debug!("message references unknown segment {id}");
            return Err(Error::from_kind(ErrorKind::UnknownSegment(id)));
        };
        if seg.as_ptr() as usize % BYTES_PER_WORD != 0 {
            return Err(Error::from_kind(ErrorKind::UnalignedSegment));
        }
        // A ragged tail is not addressable by any word-aligned object.
        let whole = seg.len() / BYTES_PER_WORD * BYTES_PER_WORD;
        Ok(&seg[..whole])
    }

    fn charge(&self, words: u64) -> Result<()> {
        self.limiter
            .charge(usize::try_from(words).unwrap_or(usize::MAX))
    }

    fn refund(&self, words: u64) {
        self.limiter
            .refund(usize::try_from(words).unwrap_or(usize::MAX));
    }

    fn depth_limit(&self) -> i32 {
        self.depth_limit
    }
}

/// Write access to a message under construction. Layered over [`ReadArena`]
/// conceptually, but a separate trait so builder views can still hand out
/// plain readers of themselves via [`as_read`](Self::as_read).
pub trait BuildArena {
    /// Reserves `words` words at the end of the given segment, returning
    /// the word index of the reservation, or `None` if it does not fit.
    fn reserve(&mut self, id: SegmentId, words: u32) -> Option<u32>;

    /// Reserves `words` words wherever they fit, growing the message by a
    /// segment if nothing has room.
    fn reserve_anywhere(&mut self, words: u32) -> (SegmentId, u32);

    /// The in-use bytes of a segment. Builder-side ids were produced by
    /// this arena itself, so an invalid id is a programmer error.
    fn bytes(&self, id: SegmentId) -> &[u8];

    fn bytes_mut(&mut self, id: SegmentId) -> &mut [u8];

    fn as_read(&self) -> &dyn ReadArena;
}

/// One owned segment: the allocator's buffer plus a watermark of how much
/// of it has been handed out.
struct OwnedSegment {
    ptr: *mut u8,
    capacity: u32,
    used: u32,
}

impl OwnedSegment {
    fn free(&self) -> u32 {
        self.capacity - self.used
    }
}

pub struct BuilderArenaImpl<A>
where
    A: Allocator,
{
    // `None` once the allocator has been extracted.
    allocator: Option<A>,
    segments: Vec<OwnedSegment>,
}

impl<A> BuilderArenaImpl<A>
where
    A: Allocator,
{
    pub fn new(allocator: A) -> Self {
        Self {
            allocator: Some(allocator),
            segments: Vec::new(),
        }
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The in-use prefix of every segment, in id order. Idempotent; the
    /// borrow it holds keeps the message from being mutated underneath it.
    pub fn get_segments_for_output(&self) -> OutputSegments<'_> {
        let view = |seg: &OwnedSegment| unsafe {
            slice::from_raw_parts(seg.ptr as *const u8, seg.used as usize * BYTES_PER_WORD)
        };
        match self.segments.as_slice() {
            [single] => OutputSegments::SingleSegment([view(single)]),
            many => OutputSegments::MultiSegment(many.iter().map(view).collect()),
        }
    }

    /// Releases every segment back to the allocator and returns it.
    pub fn into_allocator(mut self) -> A {
        self.release_all();
        self.allocator.take().unwrap()
    }

    fn grow(&mut self, min_words: u32) -> SegmentId {
        let allocator = self
            .allocator
            .as_mut()
            .expect("arena used after allocator extraction");
        let (ptr, capacity) = allocator.allocate_segment(min_words);
        self.segments.push(OwnedSegment {
            ptr,
            capacity,
            used: 0,
        });
        (self.segments.len() - 1) as SegmentId
    }

    fn release_all(&mut self) {
        if let Some(allocator) = &mut self.allocator {
            for seg in self.segments.drain(..) {
                unsafe {
                    allocator.deallocate_segment(seg.ptr, seg.capacity, seg.used);
                }
            }
        }
    }
}

impl<A> ReadArena for BuilderArenaImpl<A>
where
    A: Allocator,
{
    fn segment(&self, id: SegmentId) -> Result<&[u8]> {
        Ok(self.bytes(id))
    }

    // A builder wrote everything it reads back, so no budget applies.

    fn charge(&self, _words: u64) -> Result<()> {
        Ok(())
    }

    fn refund(&self, _words: u64) {}

    fn depth_limit(&self) -> i32 {
        i32::MAX
    }
}

impl<A> BuildArena for BuilderArenaImpl<A>
where
    A: Allocator,
{
    fn reserve(&mut self, id: SegmentId, words: u32) -> Option<u32> {
        let seg = &mut self.segments[id as usize];
        if words > seg.free() {
            return None;
        }
        let at = seg.used;
        seg.used += words;
        Some(at)
    }

    fn reserve_anywhere(&mut self, words: u32) -> (SegmentId, u32) {
        // The root segment usually has the most slack and the newest one
        // holds whatever remains of the last growth step; segments in
        // between are fragmented remainders not worth scanning.
        if !self.segments.is_empty() {
            if let Some(at) = self.reserve(0, words) {
                return (0, at);
            }
            let newest = (self.segments.len() - 1) as SegmentId;
            if newest != 0 {
                if let Some(at) = self.reserve(newest, words) {
                    return (newest, at);
                }
            }
        }

        let id = self.grow(words);
        let at = self
            .reserve(id, words)
            .expect("a fresh segment must satisfy its minimum size");
        (id, at)
    }

    fn bytes(&self, id: SegmentId) -> &[u8] {
        let seg = &self.segments[id as usize];
        unsafe { slice::from_raw_parts(seg.ptr as *const u8, seg.used as usize * BYTES_PER_WORD) }
    }

    fn bytes_mut(&mut self, id: SegmentId) -> &mut [u8] {
        let seg = &self.segments[id as usize];
        unsafe { slice::from_raw_parts_mut(seg.ptr, seg.used as usize * BYTES_PER_WORD) }
    }

    fn as_read(&self) -> &dyn ReadArena {
        self
    }
}

impl<A> Drop for BuilderArenaImpl<A>
where
    A: Allocator,
{
    fn drop(&mut self) {
        self.release_all();
    }
}
