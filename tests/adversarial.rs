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

//! Hostile input: overlapping pointers, pointer cycles, lying headers.
//! Every one of these must end in a clean error, never a hang, a panic, or
//! an out-of-bounds read.

use zerogram::message::{Reader, ReaderOptions, SegmentArray};
use zerogram::{word, ErrorKind, Word};

#[test]
fn overlapping_pointers_exhaust_the_budget() {
    // A root struct with two pointers, both aimed at the same ten-word
    // blob. Walking the blob repeatedly must charge the budget every time
    // and cut off, rather than looping or amplifying.
    let mut words = vec![
        // Root: struct, offset 0, no data, two pointers.
        word(0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00),
        // Pointer 0: byte list of 80 at offset 1 (-> word 3).
        word(0x05, 0x00, 0x00, 0x00, 0x82, 0x02, 0x00, 0x00),
        // Pointer 1: the same bytes at offset 0 (-> word 3).
        word(0x01, 0x00, 0x00, 0x00, 0x82, 0x02, 0x00, 0x00),
    ];
    words.extend(std::iter::repeat(word(1, 2, 3, 4, 5, 6, 7, 8)).take(10));

    let options = ReaderOptions {
        traversal_limit_in_words: Some(64),
        nesting_limit: 64,
    };

    let bytes = Word::words_to_bytes(&words);
    let segments = [bytes];
    let reader = Reader::new(SegmentArray::new(&segments), options);

    let mut limit_hit = false;
    for _ in 0..1000 {
        let root = match reader.get_root_struct() {
            Ok(root) => root,
            Err(e) => {
                assert_eq!(e.kind, ErrorKind::TraversalLimitExceeded);
                limit_hit = true;
                break;
            }
        };
        for i in 0..2 {
            if let Err(e) = root.get_pointer_field(i).get_data(None) {
                assert_eq!(e.kind, ErrorKind::TraversalLimitExceeded);
                limit_hit = true;
            }
        }
        if limit_hit {
            break;
        }
    }
    assert!(limit_hit, "the traversal budget never tripped");
}

#[test]
fn pointer_cycle_hits_the_nesting_limit() {
    // Word 0 points at word 1 as a one-pointer struct; word 1 points back
    // at word 0 the same way. A legal message cannot encode this, but a
    // reader must survive it.
    let words = [
        word(0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00),
        word(0xf8, 0xff, 0xff, 0xff, 0x00, 0x00, 0x01, 0x00),
    ];

    let bytes = Word::words_to_bytes(&words);
    let segments = [bytes];
    let reader = Reader::new(SegmentArray::new(&segments), ReaderOptions::new());

    let mut depth = 0usize;
    let mut current = reader.get_root_struct().unwrap();
    let err = loop {
        assert!(depth < 1000, "cycle was not cut off");
        match current.get_pointer_field(0).get_struct(None) {
            Ok(next) => {
                current = next;
                depth += 1;
            }
            Err(e) => break e,
        }
    };
    assert_eq!(err.kind, ErrorKind::NestingLimitExceeded);
    assert!(depth < 100, "nesting limit should trip near 64 levels");
}

#[test]
fn out_of_bounds_object_pointer() {
    // A struct pointer whose body would extend past the segment.
    let words = [word(0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00)];
    let bytes = Word::words_to_bytes(&words);
    let segments = [bytes];
    let reader = Reader::new(SegmentArray::new(&segments), ReaderOptions::new());
    let err = reader.get_root_struct().unwrap_err();
    assert_eq!(err.kind, ErrorKind::PointerOutOfBounds);
}

#[test]
fn giant_zero_size_list_is_charged() {
    // A void list claiming half a billion elements occupies no wire space;
    // the amplification charge must trip the budget anyway.
    let words = [
        word(0x01, 0x00, 0x00, 0x00, 0xf8, 0xff, 0xff, 0xff),
    ];
    let bytes = Word::words_to_bytes(&words);
    let segments = [bytes];
    let options = ReaderOptions {
        traversal_limit_in_words: Some(1024),
        nesting_limit: 64,
    };
    let reader = Reader::new(SegmentArray::new(&segments), options);
    let err = reader
        .root()
        .unwrap()
        .get_list(zerogram::wire::ElementSize::Void, None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::TraversalLimitExceeded);
}

#[test]
fn text_without_terminator_is_rejected() {
    let words = [
        // Byte list of 4, offset 0.
        word(0x01, 0x00, 0x00, 0x00, 0x22, 0x00, 0x00, 0x00),
        word(b'o', b'o', b'p', b's', 0x00, 0x00, 0x00, 0x00),
    ];
    let bytes = Word::words_to_bytes(&words);
    let segments = [bytes];
    let reader = Reader::new(SegmentArray::new(&segments), ReaderOptions::new());
    let err = reader.root().unwrap().get_text(None).unwrap_err();
    assert_eq!(err.kind, ErrorKind::TextMissingNulTerminator);

    // The same bytes are perfectly fine as data.
    let payload = reader.root().unwrap().get_data(None).unwrap();
    assert_eq!(payload, b"oops");
}

#[test]
fn lying_inline_composite_tag_is_rejected() {
    let words = [
        // Inline composite list, body word count 2.
        word(0x01, 0x00, 0x00, 0x00, 0x17, 0x00, 0x00, 0x00),
        // Tag claims 5 elements of one word each: overruns the body.
        word(0x14, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00),
        word(0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00),
        word(0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00),
    ];
    let bytes = Word::words_to_bytes(&words);
    let segments = [bytes];
    let reader = Reader::new(SegmentArray::new(&segments), ReaderOptions::new());
    let err = reader
        .root()
        .unwrap()
        .get_list_of_any_size(None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InlineCompositeOverrun);
}

#[test]
fn truncated_stream_is_rejected() {
    use zerogram::serialize;
    use zerogram::wire::StructSize;

    let mut message = zerogram::message::Builder::new_default();
    {
        let mut root = message.init_root_struct(StructSize::new(2, 0));
        root.set_data_field::<u64>(0, 1);
    }
    let bytes = serialize::write_message_to_words(&message);

    for cut in 1..bytes.len() {
        let truncated = &bytes[..bytes.len() - cut];
        assert!(
            serialize::read_message(truncated, ReaderOptions::new()).is_err(),
            "accepted a stream truncated by {cut} bytes"
        );
    }
}

#[test]
fn header_declaring_too_much_is_rejected() {
    // One segment of 2^30 words.
    let mut bytes = vec![0u8; 8];
    bytes[4..8].copy_from_slice(&(1u32 << 30).to_le_bytes());
    let err = zerogram::serialize::read_message(&bytes[..], ReaderOptions::new()).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::MessageTooLarge(_)));
}
