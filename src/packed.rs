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

//! The packing codec: a byte-oriented compression of the framed stream that
//! elides zero bytes, which dominate typical messages.
//!
//! Each word becomes a tag byte whose bit `i` says whether byte `i` is
//! nonzero, followed by the nonzero bytes. Two tag values extend into runs:
//! `0x00` is followed by a count of *additional* all-zero words, and `0xff`
//! by the word's eight bytes plus a count of words stored verbatim. A
//! truncation anywhere inside a word, a count byte, or a run is a
//! validation failure, never an over-read.

use std::io::{BufRead, Read, Write};

use crate::wire::units::BYTES_PER_WORD;
use crate::{message, serialize, Error, ErrorKind, Result};

fn validation(kind: ErrorKind) -> std::io::Error {
    Error::from_kind(kind).into()
}

/// A `BufRead` adapter that unpacks as it reads.
///
/// Every `read()` must be a whole number of words, and a read stopping
/// inside a run is an error; reads issued by `read_message()` mirror the
/// writer's chunks, so they always span runs cleanly.
struct PackedRead<R>
where
    R: BufRead,
{
    inner: R,
}

impl<R> PackedRead<R>
where
    R: BufRead,
{
    // TODO: decode whole words straight out of fill_buf()'s buffer when at
    // least ten bytes (tag + word + count) are available, instead of going
    // byte-at-a-time through consume().

    /// The next input byte, or `None` at end of stream.
    fn next_byte(&mut self) -> std::io::Result<Option<u8>> {
        let buf = self.inner.fill_buf()?;
        match buf.first() {
            Some(&byte) => {
                self.inner.consume(1);
                Ok(Some(byte))
            }
            None => Ok(None),
        }
    }

    /// The next input byte, where ending here would mean a truncated word
    /// or run.
    fn require_byte(&mut self) -> std::io::Result<u8> {
        self.next_byte()?
            .ok_or_else(|| validation(ErrorKind::PrematureEndOfPackedInput))
    }

    /// Expands one tag's word into `out`, which must be exactly one word.
    fn unpack_word(&mut self, tag: u8, out: &mut [u8]) -> std::io::Result<()> {
        for (bit, slot) in out.iter_mut().enumerate() {
            *slot = if tag & (1 << bit) != 0 {
                self.require_byte()?
            } else {
                0
            };
        }
        Ok(())
    }
}

impl<R> Read for PackedRead<R>
where
    R: BufRead,
{
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        assert!(
            out.len() % BYTES_PER_WORD == 0,
            "packed reads must be word-aligned"
        );

        let mut filled = 0;
        while filled < out.len() {
            let Some(tag) = self.next_byte()? else {
                if filled == 0 {
                    // Clean end of stream on a word boundary.
                    return Ok(0);
                }
                return Err(validation(ErrorKind::PrematureEndOfPackedInput));
            };

            self.unpack_word(tag, &mut out[filled..filled + BYTES_PER_WORD])?;
            filled += BYTES_PER_WORD;

            if tag == 0x00 {
                // A count of additional all-zero words.
                let run = self.require_byte()? as usize * BYTES_PER_WORD;
                if run > out.len() - filled {
                    return Err(validation(ErrorKind::PackedRunOverrun));
                }
                out[filled..filled + run].fill(0);
                filled += run;
            } else if tag == 0xff {
                // A count of words stored verbatim.
                let run = self.require_byte()? as usize * BYTES_PER_WORD;
                if run > out.len() - filled {
                    return Err(validation(ErrorKind::PackedRunOverrun));
                }
                self.inner
                    .read_exact(&mut out[filled..filled + run])
                    .map_err(|e| {
                        if e.kind() == std::io::ErrorKind::UnexpectedEof {
                            validation(ErrorKind::PrematureEndOfPackedInput)
                        } else {
                            e
                        }
                    })?;
                filled += run;
            }
        }
        Ok(filled)
    }
}

/// Reads a packed message from a buffered stream.
pub fn read_message<R>(
    read: R,
    options: message::ReaderOptions,
) -> Result<message::Reader<serialize::OwnedSegments>>
where
    R: BufRead,
{
    serialize::read_message(PackedRead { inner: read }, options)
}

/// Like `read_message()`, but returns `None` on a clean EOF at a message
/// boundary.
pub fn try_read_message<R>(
    read: R,
    options: message::ReaderOptions,
) -> Result<Option<message::Reader<serialize::OwnedSegments>>>
where
    R: BufRead,
{
    serialize::try_read_message(PackedRead { inner: read }, options)
}

fn word_at(buf: &[u8], index: usize) -> &[u8] {
    &buf[index * BYTES_PER_WORD..(index + 1) * BYTES_PER_WORD]
}

/// Words from `word` onward that are entirely zero, capped at a count
/// byte's range.
fn zero_run(buf: &[u8], word: usize, word_count: usize) -> usize {
    (word..word_count.min(word + u8::MAX as usize))
        .take_while(|&w| word_at(buf, w).iter().all(|&b| b == 0))
        .count()
}

/// Words from `word` onward worth storing verbatim: the run ends at the
/// first word with two or more zero bytes, where packing becomes a net win
/// again. Capped at a count byte's range.
fn literal_run(buf: &[u8], word: usize, word_count: usize) -> usize {
    (word..word_count.min(word + u8::MAX as usize))
        .take_while(|&w| word_at(buf, w).iter().filter(|&&b| b == 0).count() < 2)
        .count()
}

/// A `Write` adapter that packs each (word-aligned) chunk it is handed.
struct PackedWrite<W>
where
    W: Write,
{
    inner: W,
}

impl<W> Write for PackedWrite<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        assert!(
            buf.len() % BYTES_PER_WORD == 0,
            "packed writes must be word-aligned"
        );
        let word_count = buf.len() / BYTES_PER_WORD;

        // Worst case is a tag plus a count byte per word on top of the
        // payload; one output buffer per call keeps the inner writes large.
        let mut out: Vec<u8> = Vec::with_capacity(buf.len() + buf.len() / 4 + 2);

        let mut i = 0;
        while i < word_count {
            let tag_pos = out.len();
            out.push(0); // placeholder for the tag
            let mut tag = 0u8;
            for (bit, &byte) in word_at(buf, i).iter().enumerate() {
                if byte != 0 {
                    tag |= 1 << bit;
                    out.push(byte);
                }
            }
            out[tag_pos] = tag;
            i += 1;

            if tag == 0x00 {
                let run = zero_run(buf, i, word_count);
                out.push(run as u8);
                i += run;
            } else if tag == 0xff {
                let run = literal_run(buf, i, word_count);
                out.push(run as u8);
                out.extend_from_slice(&buf[i * BYTES_PER_WORD..(i + run) * BYTES_PER_WORD]);
                i += run;
            }
        }

        self.inner.write_all(&out)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Writes a packed message to a stream.
///
/// The only errors this can produce are propagated `write` errors.
pub fn write_message<W, A>(write: W, message: &message::Builder<A>) -> Result<()>
where
    W: Write,
    A: message::Allocator,
{
    serialize::write_message(PackedWrite { inner: write }, message)
}

#[cfg(test)]
mod tests {
    use quickcheck::{quickcheck, TestResult};
    use std::io::{Read, Write};

    use super::{read_message, PackedRead, PackedWrite};
    use crate::message::{ReaderOptions, ReaderSegments};
    use crate::serialize::test::write_message_segments_from_words;
    use crate::{ErrorKind, Word};

    #[test]
    fn empty_input_cannot_fill_a_word() {
        let mut unpacker = PackedRead { inner: &[][..] };

        let mut out: Vec<u8> = vec![0; 8];
        assert!(unpacker.read_exact(&mut out[..]).is_err());
    }

    fn check_unpacks_to(packed: &[u8], unpacked: &[u8]) {
        let mut packed_read = PackedRead { inner: packed };

        let mut bytes: Vec<u8> = vec![0; unpacked.len()];
        packed_read.read_exact(&mut bytes[..]).unwrap();

        assert!(packed_read.inner.is_empty()); // nothing left over
        assert_eq!(bytes, unpacked);
    }

    fn check_packing(unpacked: &[u8], packed: &[u8]) {
        // write
        let mut bytes: Vec<u8> = Vec::with_capacity(packed.len());
        {
            let mut packed_write = PackedWrite { inner: &mut bytes };
            packed_write.write(unpacked).unwrap();
        }
        assert_eq!(bytes, packed);

        // read
        check_unpacks_to(packed, unpacked);
    }

    #[test]
    fn packing_table() {
        // Each case: (unpacked words, their packed form).
        let cases: &[(&[u8], &[u8])] = &[
            (&[], &[]),
            // Zero words collapse to a tag and a run count.
            (&[0; 8], &[0, 0]),
            (&[0; 16], &[0, 1]),
            (&[0; 24], &[0, 2]),
            // Sparse words keep only their nonzero bytes.
            (&[0, 0, 12, 0, 0, 34, 0, 0], &[0x24, 12, 34]),
            // Dense words go verbatim behind an 0xff tag.
            (&[1, 3, 2, 4, 5, 7, 6, 8], &[0xff, 1, 3, 2, 4, 5, 7, 6, 8, 0]),
            (
                &[0, 0, 0, 0, 0, 0, 0, 0, 1, 3, 2, 4, 5, 7, 6, 8],
                &[0, 0, 0xff, 1, 3, 2, 4, 5, 7, 6, 8, 0],
            ),
            (
                &[0, 0, 12, 0, 0, 34, 0, 0, 1, 3, 2, 4, 5, 7, 6, 8],
                &[0x24, 12, 34, 0xff, 1, 3, 2, 4, 5, 7, 6, 8, 0],
            ),
            (
                &[1, 3, 2, 4, 5, 7, 6, 8, 8, 6, 7, 4, 5, 2, 3, 1],
                &[0xff, 1, 3, 2, 4, 5, 7, 6, 8, 1, 8, 6, 7, 4, 5, 2, 3, 1],
            ),
            // A literal run ends at the first word with two zero bytes.
            (
                &[
                    1, 2, 3, 4, 5, 6, 7, 8, 1, 2, 3, 4, 5, 6, 7, 8, 1, 2, 3, 4, 5, 6, 7, 8, 1,
                    2, 3, 4, 5, 6, 7, 8, 0, 2, 4, 0, 9, 0, 5, 1,
                ],
                &[
                    0xff, 1, 2, 3, 4, 5, 6, 7, 8, 3, 1, 2, 3, 4, 5, 6, 7, 8, 1, 2, 3, 4, 5, 6,
                    7, 8, 1, 2, 3, 4, 5, 6, 7, 8, 0xd6, 2, 4, 9, 5, 1,
                ],
            ),
            // A single zero byte does not end a literal run.
            (
                &[
                    1, 2, 3, 4, 5, 6, 7, 8, 1, 2, 3, 4, 5, 6, 7, 8, 6, 2, 4, 3, 9, 0, 5, 1, 1,
                    2, 3, 4, 5, 6, 7, 8, 0, 2, 4, 0, 9, 0, 5, 1,
                ],
                &[
                    0xff, 1, 2, 3, 4, 5, 6, 7, 8, 3, 1, 2, 3, 4, 5, 6, 7, 8, 6, 2, 4, 3, 9, 0,
                    5, 1, 1, 2, 3, 4, 5, 6, 7, 8, 0xd6, 2, 4, 9, 5, 1,
                ],
            ),
            // Mixed sparse, zero-run, and sparse again.
            (
                &[
                    8, 0, 100, 6, 0, 1, 1, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
                    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 2, 0, 3, 1,
                ],
                &[0xed, 8, 100, 6, 1, 1, 2, 0, 2, 0xd4, 1, 2, 3, 1],
            ),
        ];

        for (unpacked, packed) in cases {
            check_packing(unpacked, packed);
        }
    }

    quickcheck! {
        fn packed_framing_round_trips(segments: Vec<Vec<Word>>) -> TestResult {
            if segments.is_empty() {
                return TestResult::discard();
            }
            let mut buf: Vec<u8> = Vec::new();

            write_message_segments_from_words(
                &mut PackedWrite { inner: &mut buf },
                &segments,
            );
            let message = read_message(&mut &buf[..], ReaderOptions::new()).unwrap();
            let result_segments = message.into_segments();

            TestResult::from_bool(segments.iter().enumerate().all(|(i, segment)| {
                Word::words_to_bytes(&segment[..])
                    == result_segments.get_segment(i as u32).unwrap()
            }))
        }

        fn arbitrary_bytes_never_crash(packed: Vec<u8>) -> TestResult {
            // Unpacking hostile bytes must fail gracefully, never panic.
            let out_len = packed.len() * 8;
            let mut unpacker = PackedRead { inner: &packed[..] };

            let mut out: Vec<u8> = vec![0; out_len];
            let _ = unpacker.read_exact(&mut out);
            TestResult::from_bool(true)
        }
    }

    fn expect_failure(packed: &[u8], kind: ErrorKind) {
        let mut unpacker = PackedRead { inner: packed };
        let mut out: Vec<u8> = vec![0; 200];
        let err = unpacker
            .read_exact(&mut out[..])
            .expect_err("unpacking should have failed");
        assert_eq!(crate::Error::from(err).kind, kind);
    }

    #[test]
    fn runs_must_fit_the_requested_read() {
        expect_failure(
            &[0xff, 1, 2, 3, 4, 5, 6, 7, 8, 37, 1, 2],
            ErrorKind::PackedRunOverrun,
        );
    }

    #[test]
    fn truncated_input_is_rejected() {
        // Cut off inside a word's data bytes.
        expect_failure(&[0xf0, 1, 2], ErrorKind::PrematureEndOfPackedInput);
        // Cut off before a run's count byte.
        expect_failure(&[0], ErrorKind::PrematureEndOfPackedInput);
        expect_failure(
            &[0xff, 1, 2, 3, 4, 5, 6, 7, 8],
            ErrorKind::PrematureEndOfPackedInput,
        );
        // Self-consistent input that simply ends before the output is full.
        expect_failure(&[1, 1], ErrorKind::PrematureEndOfPackedInput);
    }

    #[test]
    fn segment_table_spans_runs() {
        let packed_buf = &[0x11, 4, 1, 0, 1, 0, 0];

        check_unpacks_to(
            packed_buf,
            &[
                4, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
                0, 0, 0, 0, 0,
            ],
        );

        // The segment table itself must be readable through the unpacker
        // even when a single read spans multiple runs.
        read_message(&mut &packed_buf[..], Default::default()).unwrap();
    }
}
