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

//! Stream framing: a message is preceded by a segment table giving the
//! number of segments and each one's size in words.
//!
//! Table layout: one `u32` holding `segment_count - 1`, then one `u32` per
//! segment with its word size, then one `u32` of zero padding if needed to
//! reach a word boundary (i.e. whenever the segment count is even). The
//! segment bodies follow in id order.

use std::io::{Read, Write};
use std::ops::Deref;

use crate::message;
use crate::wire::units::BYTES_PER_WORD;
use crate::{Error, ErrorKind, Result, Word};

/// Refuse headers declaring this many segments or more. A legitimate
/// message approaches this only through pathological allocator behavior; a
/// hostile one uses it to make the receiver reserve absurd table space.
pub const SEGMENTS_COUNT_LIMIT: usize = 512;

/// A parsed segment table: each segment's length in words, in id order.
struct SegmentTable {
    lengths: Vec<usize>,
}

impl SegmentTable {
    fn total_words(&self) -> usize {
        self.lengths.iter().sum()
    }

    /// Per-segment `(start, end)` word ranges within the concatenated body.
    fn word_ranges(&self) -> Vec<(usize, usize)> {
        let mut ranges = Vec::with_capacity(self.lengths.len());
        let mut start = 0;
        for &len in &self.lengths {
            ranges.push((start, start + len));
            start += len;
        }
        ranges
    }

    /// Allocates one aligned buffer big enough for the whole body.
    fn into_owned_segments(self) -> OwnedSegments {
        OwnedSegments {
            owned_space: Word::allocate_zeroed_vec(self.total_words()),
            ranges: self.word_ranges(),
        }
    }
}

/// A message's segments, read into a single owned, word-aligned buffer.
#[derive(Debug)]
pub struct OwnedSegments {
    /// Per-segment word ranges within `owned_space`.
    ranges: Vec<(usize, usize)>,
    owned_space: Vec<Word>,
}

impl Deref for OwnedSegments {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        Word::words_to_bytes(&self.owned_space[..])
    }
}

impl std::ops::DerefMut for OwnedSegments {
    fn deref_mut(&mut self) -> &mut [u8] {
        Word::words_to_bytes_mut(&mut self.owned_space[..])
    }
}

impl message::ReaderSegments for OwnedSegments {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        let &(start, end) = self.ranges.get(id as usize)?;
        Some(&self[start * BYTES_PER_WORD..end * BYTES_PER_WORD])
    }

    fn len(&self) -> usize {
        self.ranges.len()
    }
}

/// Segments backed by a caller-owned contiguous buffer holding a whole
/// framed message, so nothing is copied.
///
/// The buffer must be 8-byte aligned for reads to succeed; an unaligned
/// buffer produces `ErrorKind::UnalignedSegment` at traversal time.
pub struct BufferSegments<T> {
    buffer: T,
    /// Length of the segment table prefix, in bytes.
    table_bytes: usize,
    /// Per-segment word ranges, relative to the table's end.
    ranges: Vec<(usize, usize)>,
}

impl<T: Deref<Target = [u8]>> BufferSegments<T> {
    /// Parses the segment table at the start of `buffer` and takes
    /// ownership. The buffer may extend beyond the end of the message.
    pub fn new(buffer: T, options: message::ReaderOptions) -> Result<Self> {
        let mut bytes = &*buffer;

        let Some(table) = read_segment_table(&mut bytes, options)? else {
            return Err(Error::from_kind(ErrorKind::MessageEndsPrematurely));
        };
        let table_bytes = buffer.len() - bytes.len();

        if table.total_words() * BYTES_PER_WORD > buffer.len() - table_bytes {
            return Err(Error::from_kind(ErrorKind::MessageEndsPrematurely));
        }
        Ok(Self {
            buffer,
            table_bytes,
            ranges: table.word_ranges(),
        })
    }

    pub fn into_buffer(self) -> T {
        self.buffer
    }
}

impl<T: Deref<Target = [u8]>> message::ReaderSegments for BufferSegments<T> {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        let &(start, end) = self.ranges.get(id as usize)?;
        Some(
            &self.buffer
                [self.table_bytes + start * BYTES_PER_WORD..self.table_bytes + end * BYTES_PER_WORD],
        )
    }

    fn len(&self) -> usize {
        self.ranges.len()
    }
}

/// Reads a framed message from a stream. For performance, `read` should be
/// buffered.
pub fn read_message<R>(
    mut read: R,
    options: message::ReaderOptions,
) -> Result<message::Reader<OwnedSegments>>
where
    R: Read,
{
    let Some(table) = read_segment_table(&mut read, options)? else {
        return Err(Error::from_kind(ErrorKind::MessageEndsPrematurely));
    };
    read_segments(&mut read, table.into_owned_segments(), options)
}

/// Like `read_message()`, but returns `None` on a clean EOF at a message
/// boundary. Useful for draining a stream holding an unknown number of
/// messages.
pub fn try_read_message<R>(
    mut read: R,
    options: message::ReaderOptions,
) -> Result<Option<message::Reader<OwnedSegments>>>
where
    R: Read,
{
    let Some(table) = read_segment_table(&mut read, options)? else {
        return Ok(None);
    };
    Ok(Some(read_segments(
        &mut read,
        table.into_owned_segments(),
        options,
    )?))
}

/// Reads a framed message out of a flat byte slice without copying. On
/// success, `slice` is advanced past the consumed message, so consecutive
/// messages can be read back to back.
pub fn read_message_from_flat_slice<'a>(
    slice: &mut &'a [u8],
    options: message::ReaderOptions,
) -> Result<message::Reader<BufferSegments<&'a [u8]>>> {
    let all_bytes = *slice;
    let mut bytes = *slice;
    let Some(table) = read_segment_table(&mut bytes, options)? else {
        return Err(Error::from_kind(ErrorKind::MessageEndsPrematurely));
    };
    let table_bytes = all_bytes.len() - bytes.len();
    debug_assert_eq!(table_bytes % BYTES_PER_WORD, 0);

    let body_bytes = table.total_words() * BYTES_PER_WORD;
    let message_len = table_bytes + body_bytes;
    if all_bytes.len() < message_len {
        return Err(Error::from_kind(ErrorKind::MessageEndsPrematurely));
    }
    *slice = &all_bytes[message_len..];
    Ok(message::Reader::new(
        BufferSegments {
            buffer: &all_bytes[..message_len],
            table_bytes,
            ranges: table.word_ranges(),
        },
        options,
    ))
}

/// Parses the segment table, returning `None` on clean EOF before the first
/// byte. Validates the segment count and checks the declared total size
/// against the traversal limit, so a hostile header cannot force a huge
/// allocation.
fn read_segment_table<R>(
    read: &mut R,
    options: message::ReaderOptions,
) -> Result<Option<SegmentTable>>
where
    R: Read,
{
    // First word: segment count and the first segment's length.
    let mut buf: [u8; 8] = [0; 8];
    {
        let mut n = 0;
        loop {
            match read.read(&mut buf[n..]) {
                Ok(0) => {
                    if n == 0 {
                        // Clean EOF on a message boundary.
                        return Ok(None);
                    }
                    return Err(Error::from_kind(ErrorKind::MessageEndsPrematurely));
                }
                Ok(k) => {
                    n += k;
                    if n == 8 {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    let segment_count = u32::from_le_bytes(buf[0..4].try_into().unwrap()).wrapping_add(1) as usize;

    if segment_count >= SEGMENTS_COUNT_LIMIT || segment_count == 0 {
        log::debug!("rejecting message header declaring {segment_count} segments");
        return Err(Error::from_kind(ErrorKind::TooManySegments(segment_count)));
    }

    let mut lengths = Vec::with_capacity(segment_count);
    lengths.push(u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize);

    if segment_count > 1 {
        // The remaining lengths, rounded up to a whole word: one padding
        // u32 follows them whenever the segment count is even.
        let padded_slots = segment_count / 2 * 2;
        let mut rest = vec![0u8; padded_slots * 4];
        read.read_exact(&mut rest[..])?;
        for slot in rest.chunks_exact(4).take(segment_count - 1) {
            lengths.push(u32::from_le_bytes(slot.try_into().unwrap()) as usize);
        }
    }

    let table = SegmentTable { lengths };

    // A message the receiver could never finish traversing is rejected
    // before allocating space for it.
    if let Some(limit) = options.traversal_limit_in_words {
        if table.total_words() > limit {
            log::debug!(
                "rejecting message declaring {} words against a limit of {limit}",
                table.total_words()
            );
            return Err(Error::from_kind(ErrorKind::MessageTooLarge(
                table.total_words(),
            )));
        }
    }

    Ok(Some(table))
}

fn read_segments<R>(
    read: &mut R,
    mut owned_segments: OwnedSegments,
    options: message::ReaderOptions,
) -> Result<message::Reader<OwnedSegments>>
where
    R: Read,
{
    read.read_exact(&mut owned_segments[..])?;
    Ok(message::Reader::new(owned_segments, options))
}

/// Frames the message into a single flat byte vector.
pub fn write_message_to_words<A>(message: &message::Builder<A>) -> Vec<u8>
where
    A: message::Allocator,
{
    flatten_segments(&*message.get_segments_for_output())
}

/// Like `write_message_to_words()`, but usable with a `message::Reader`'s
/// segments (via `into_segments()`).
pub fn write_message_segments_to_words<R>(segments: &R) -> Vec<u8>
where
    R: message::ReaderSegments,
{
    flatten_segments(segments)
}

fn flatten_segments<R: message::ReaderSegments + ?Sized>(segments: &R) -> Vec<u8> {
    let mut result = Vec::with_capacity(compute_serialized_size(segments) * BYTES_PER_WORD);
    write_segment_table_internal(&mut result, segments)
        .expect("writing a segment table into a vector cannot fail");
    for i in 0..segments.len() {
        result.extend_from_slice(segments.get_segment(i as u32).unwrap());
    }
    result
}

/// Writes the framed message to a stream. For performance, `write` should
/// be buffered; `flush()` is not called.
pub fn write_message<W, A>(mut write: W, message: &message::Builder<A>) -> Result<()>
where
    W: Write,
    A: message::Allocator,
{
    let segments = message.get_segments_for_output();
    write_segment_table_internal(&mut write, &*segments)?;
    write_segments(&mut write, &*segments)
}

/// Like `write_message()`, but takes any `ReaderSegments`.
pub fn write_message_segments<W, R>(mut write: W, segments: &R) -> Result<()>
where
    W: Write,
    R: message::ReaderSegments,
{
    write_segment_table_internal(&mut write, segments)?;
    write_segments(&mut write, segments)
}

/// Writes a segment table. `segments` must contain at least one segment.
fn write_segment_table_internal<W, R>(write: &mut W, segments: &R) -> Result<()>
where
    W: Write,
    R: message::ReaderSegments + ?Sized,
{
    let segment_count = segments.len();

    // Build the table as u32 slots: the count, one length per segment, and
    // a padding slot whenever that leaves an odd total.
    let mut slots: Vec<u32> = Vec::with_capacity(segment_count + 2);
    slots.push(segment_count as u32 - 1);
    for id in 0..segment_count {
        let segment = segments.get_segment(id as u32).unwrap();
        slots.push((segment.len() / BYTES_PER_WORD) as u32);
    }
    if slots.len() % 2 == 1 {
        slots.push(0);
    }

    // Written as the reader consumes it: the first word, then the rest.
    // Keeping the chunks identical on both sides lets the packing codec
    // treat each as a self-contained unit.
    let as_bytes = |slots: &[u32]| {
        let mut bytes = Vec::with_capacity(slots.len() * 4);
        for slot in slots {
            bytes.extend_from_slice(&slot.to_le_bytes());
        }
        bytes
    };
    write.write_all(&as_bytes(&slots[..2]))?;
    if slots.len() > 2 {
        write.write_all(&as_bytes(&slots[2..]))?;
    }
    Ok(())
}

fn write_segments<W, R: message::ReaderSegments + ?Sized>(write: &mut W, segments: &R) -> Result<()>
where
    W: Write,
{
    for i in 0.. {
        if let Some(segment) = segments.get_segment(i) {
            write.write_all(segment)?;
        } else {
            break;
        }
    }
    Ok(())
}

fn compute_serialized_size<R: message::ReaderSegments + ?Sized>(segments: &R) -> usize {
    let len = segments.len();
    let mut size = len / 2 + 1; // the table
    for i in 0..len {
        let segment = segments.get_segment(i as u32).unwrap();
        size += segment.len() / BYTES_PER_WORD;
    }
    size
}

/// Words needed to frame the message, segment table included. Multiply by 8
/// for the byte count `write_message()` will produce.
pub fn compute_serialized_size_in_words<A>(message: &message::Builder<A>) -> usize
where
    A: message::Allocator,
{
    compute_serialized_size(&*message.get_segments_for_output())
}
