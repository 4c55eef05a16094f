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

//! Top-level containers for reading and building messages.

use crate::object;
use crate::wire::arena::{BuildArena, BuilderArenaImpl, ReaderArenaImpl};
use crate::wire::units::BYTES_PER_WORD;
use crate::wire::{PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize};
use crate::{OutputSegments, Result, Word};

/// Options controlling how a message is read.
#[derive(Clone, Copy, Debug)]
pub struct ReaderOptions {
    /// Total words of data a reader may traverse before getters start
    /// failing. Traversal is counted each time a struct or list view is
    /// obtained, so re-reading the same sub-object is double-counted.
    ///
    /// This bound exists because a hostile message can aim many pointers at
    /// one region, making a tiny message arbitrarily expensive to walk. Set
    /// it comfortably above the size of messages you expect; `None`
    /// disables the check entirely (only for trusted input).
    pub traversal_limit_in_words: Option<usize>,

    /// Maximum pointer-dereference depth. Legal messages are trees, but a
    /// hostile message can approximate a cycle; recursive traversal code
    /// would otherwise blow the stack. 64 is deep enough for any schema
    /// seen in practice.
    pub nesting_limit: i32,
}

pub const DEFAULT_READER_OPTIONS: ReaderOptions = ReaderOptions {
    traversal_limit_in_words: Some(8 * 1024 * 1024),
    nesting_limit: 64,
};

impl Default for ReaderOptions {
    fn default() -> Self {
        DEFAULT_READER_OPTIONS
    }
}

impl ReaderOptions {
    pub fn new() -> Self {
        DEFAULT_READER_OPTIONS
    }
}

/// The source of a reader's segment buffers.
///
/// Segment ids are dense from zero; `get_segment` returns `None` past the
/// end. Buffers must be whole words and, since readers interpret them in
/// place, 8-byte aligned.
pub trait ReaderSegments {
    fn get_segment(&self, id: u32) -> Option<&[u8]>;

    fn len(&self) -> usize {
        (0usize..)
            .find(|&id| self.get_segment(id as u32).is_none())
            .unwrap()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A borrowed array of segments.
pub struct SegmentArray<'a> {
    segments: &'a [&'a [u8]],
}

impl<'a> SegmentArray<'a> {
    pub fn new(segments: &'a [&'a [u8]]) -> SegmentArray<'a> {
        SegmentArray { segments }
    }
}

impl<'b> ReaderSegments for SegmentArray<'b> {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        self.segments.get(id as usize).copied()
    }

    fn len(&self) -> usize {
        self.segments.len()
    }
}

impl<'b> ReaderSegments for [&'b [u8]] {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        self.get(id as usize).copied()
    }

    fn len(&self) -> usize {
        self.len()
    }
}

/// A message being read. The root is pointer 0 of segment 0.
#[derive(Debug)]
pub struct Reader<S>
where
    S: ReaderSegments,
{
    arena: ReaderArenaImpl<S>,
    nesting_limit: i32,
}

impl<S> Reader<S>
where
    S: ReaderSegments,
{
    pub fn new(segments: S, options: ReaderOptions) -> Self {
        Self {
            arena: ReaderArenaImpl::new(segments, options),
            nesting_limit: options.nesting_limit,
        }
    }

    /// The root pointer, validated against segment 0's bounds.
    pub fn root(&self) -> Result<PointerReader<'_>> {
        PointerReader::get_root(&self.arena, 0, self.nesting_limit)
    }

    /// Reads the root as a struct.
    pub fn get_root_struct(&self) -> Result<StructReader<'_>> {
        self.root()?.get_struct(None)
    }

    /// Reads the root as a dynamically-typed value.
    pub fn get_root_object(&self) -> Result<object::Reader<'_>> {
        object::Reader::read_from(self.root()?)
    }

    pub fn into_segments(self) -> S {
        self.arena.into_segments()
    }
}

/// Supplies zeroed segment memory to a message builder.
///
/// # Safety
///
/// `allocate_segment` must return memory that is zeroed, 8-byte aligned,
/// valid until the matching `deallocate_segment` call (or until the
/// allocator is dropped), and disjoint from every other live segment.
pub unsafe trait Allocator {
    /// Allocates a segment of at least `minimum_size` words, returning its
    /// base address and actual size in words.
    fn allocate_segment(&mut self, minimum_size: u32) -> (*mut u8, u32);

    /// Releases a segment previously returned from `allocate_segment`.
    /// `words_used` is how much of it the builder actually wrote; an
    /// allocator that intends to reuse the memory must re-zero that prefix.
    ///
    /// # Safety
    ///
    /// Called at most once per allocated segment, with that segment's exact
    /// base pointer and size.
    unsafe fn deallocate_segment(&mut self, ptr: *mut u8, word_size: u32, words_used: u32);
}

/// A message being built. The root lives at segment-0 word 0 and is
/// allocated lazily on first access.
pub struct Builder<A>
where
    A: Allocator,
{
    arena: BuilderArenaImpl<A>,
}

// The arena stores raw segment pointers, which suppresses the auto impl;
// the segments themselves are owned by the allocator, which must be Send.
unsafe impl<A> Send for Builder<A> where A: Send + Allocator {}

fn _assert_kinds() {
    fn _assert_send<T: Send>() {}
    fn _assert_reader<S: ReaderSegments + Send>() {
        _assert_send::<Reader<S>>();
    }
    fn _assert_builder<A: Allocator + Send>() {
        _assert_send::<Builder<A>>();
    }
}

impl<A> Builder<A>
where
    A: Allocator,
{
    pub fn new(allocator: A) -> Self {
        Self {
            arena: BuilderArenaImpl::new(allocator),
        }
    }

    /// The root pointer slot, allocating segment 0 on first use.
    pub fn root(&mut self) -> PointerBuilder<'_> {
        if self.arena.is_empty() {
            let reservation = self.arena.reserve_anywhere(1);
            debug_assert_eq!(reservation, (0, 0));
        }
        PointerBuilder::new(&mut self.arena, 0, 0)
    }

    /// Initializes the root as a struct of the given size, discarding any
    /// existing root object.
    pub fn init_root_struct(&mut self, size: StructSize) -> StructBuilder<'_> {
        self.root().init_struct(size)
    }

    /// Returns the existing root struct, upgrading it in place if `size`
    /// exceeds what was written, or initializing it if null.
    pub fn get_root_struct(&mut self, size: StructSize) -> Result<StructBuilder<'_>> {
        self.root().get_struct(size, None)
    }

    /// Sets the root to a deep copy of the given struct.
    pub fn set_root(&mut self, value: &StructReader) -> Result<()> {
        self.root().set_struct(value)
    }

    /// A read-only view of the root without consuming the builder. Limits
    /// are not enforced; the builder's own output is trusted.
    pub fn root_as_reader(&self) -> Result<PointerReader<'_>> {
        if self.arena.is_empty() {
            Ok(PointerReader::null())
        } else {
            PointerReader::get_root(self.arena.as_read(), 0, i32::MAX)
        }
    }

    /// The in-use prefix of every segment, in id order. Idempotent; call it
    /// once construction is complete and hand the result to a serializer.
    pub fn get_segments_for_output(&self) -> OutputSegments<'_> {
        self.arena.get_segments_for_output()
    }

    /// Re-wraps the finished message as a reader over its own segments.
    pub fn into_reader(self) -> Reader<Self> {
        Reader::new(
            self,
            ReaderOptions {
                traversal_limit_in_words: None,
                nesting_limit: i32::MAX,
            },
        )
    }

    /// Tears down all segments and hands back the allocator for reuse.
    pub fn into_allocator(self) -> A {
        self.arena.into_allocator()
    }
}

impl<A> ReaderSegments for Builder<A>
where
    A: Allocator,
{
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        self.get_segments_for_output().get(id as usize).copied()
    }

    fn len(&self) -> usize {
        self.get_segments_for_output().len()
    }
}

pub const SUGGESTED_FIRST_SEGMENT_WORDS: u32 = 1024;
pub const SUGGESTED_ALLOCATION_STRATEGY: AllocationStrategy = AllocationStrategy::GrowHeuristically;

#[derive(Clone, Copy, Debug)]
pub enum AllocationStrategy {
    /// Every segment gets the configured size (or the request, if larger).
    FixedSize,
    /// Each segment doubles the total allocated so far, so a message of any
    /// size needs O(log n) segments.
    GrowHeuristically,
}

/// The default allocator: zeroed heap buffers with heuristic growth.
#[derive(Debug)]
pub struct HeapAllocator {
    buffers: Vec<Vec<Word>>,
    first_segment_words: u32,
    strategy: AllocationStrategy,
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self {
            buffers: Vec::new(),
            first_segment_words: SUGGESTED_FIRST_SEGMENT_WORDS,
            strategy: SUGGESTED_ALLOCATION_STRATEGY,
        }
    }

    /// Sets the size of the first segment. When the final message size is
    /// known in advance, passing it here keeps the message in one segment.
    pub fn first_segment_words(mut self, words: u32) -> Self {
        self.first_segment_words = words;
        self
    }

    pub fn allocation_strategy(mut self, strategy: AllocationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    fn words_held(&self) -> u32 {
        self.buffers.iter().map(|buffer| buffer.len() as u32).sum()
    }
}

unsafe impl Allocator for HeapAllocator {
    fn allocate_segment(&mut self, minimum_size: u32) -> (*mut u8, u32) {
        let target = match self.strategy {
            AllocationStrategy::FixedSize => self.first_segment_words,
            // Matching everything held so far doubles the message per
            // added segment.
            AllocationStrategy::GrowHeuristically => {
                self.words_held().max(self.first_segment_words)
            }
        };
        let size = minimum_size.max(target);
        let mut buffer = Word::allocate_zeroed_vec(size as usize);
        let ptr = buffer.as_mut_ptr() as *mut u8;
        self.buffers.push(buffer);
        (ptr, size)
    }

    unsafe fn deallocate_segment(&mut self, ptr: *mut u8, _word_size: u32, _words_used: u32) {
        self.buffers
            .retain(|buffer| buffer.as_ptr() as *const u8 != ptr as *const u8);
    }
}

impl Builder<HeapAllocator> {
    pub fn new_default() -> Self {
        Self::new(HeapAllocator::new())
    }
}

/// Caller-provided storage for a message's first segment, letting small
/// messages avoid the heap entirely. Zeroed when released, so the same
/// scratch space can back one message after another.
#[derive(Debug)]
pub struct ScratchSpace<'a> {
    words: &'a mut [Word],
    lent: bool,
}

impl<'a> ScratchSpace<'a> {
    /// `words` must be zeroed.
    pub fn new(words: &'a mut [Word]) -> ScratchSpace<'a> {
        ScratchSpace { words, lent: false }
    }
}

/// Hands out the scratch space as segment 0, then falls back to the heap.
pub struct ScratchSpaceHeapAllocator<'a, 'b: 'a> {
    scratch: &'a mut ScratchSpace<'b>,
    heap: HeapAllocator,
}

impl<'a, 'b: 'a> ScratchSpaceHeapAllocator<'a, 'b> {
    pub fn new(scratch: &'a mut ScratchSpace<'b>) -> ScratchSpaceHeapAllocator<'a, 'b> {
        ScratchSpaceHeapAllocator {
            scratch,
            heap: HeapAllocator::new(),
        }
    }

    /// Sets the size of the first *heap* segment, used once the scratch
    /// space is exhausted.
    pub fn second_segment_words(mut self, words: u32) -> ScratchSpaceHeapAllocator<'a, 'b> {
        self.heap = self.heap.first_segment_words(words);
        self
    }

    pub fn allocation_strategy(
        mut self,
        strategy: AllocationStrategy,
    ) -> ScratchSpaceHeapAllocator<'a, 'b> {
        self.heap = self.heap.allocation_strategy(strategy);
        self
    }
}

unsafe impl<'a, 'b: 'a> Allocator for ScratchSpaceHeapAllocator<'a, 'b> {
    fn allocate_segment(&mut self, minimum_size: u32) -> (*mut u8, u32) {
        if self.scratch.lent || minimum_size as usize > self.scratch.words.len() {
            return self.heap.allocate_segment(minimum_size);
        }
        self.scratch.lent = true;
        (
            self.scratch.words.as_mut_ptr() as *mut u8,
            self.scratch.words.len() as u32,
        )
    }

    unsafe fn deallocate_segment(&mut self, ptr: *mut u8, word_size: u32, words_used: u32) {
        if ptr != self.scratch.words.as_mut_ptr() as *mut u8 {
            return self.heap.deallocate_segment(ptr, word_size, words_used);
        }
        // Rewind: zero what was written so the scratch space is ready to
        // back a new message.
        std::ptr::write_bytes(ptr, 0u8, words_used as usize * BYTES_PER_WORD);
        self.scratch.lent = false;
    }
}
