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

//! Multi-segment messages: far pointers, landing pads, and double-fars.

use zerogram::message::{AllocationStrategy, Builder, HeapAllocator, ReaderOptions};
use zerogram::serialize;
use zerogram::wire::StructSize;

fn tiny_segment_builder(first_segment_words: u32) -> Builder<HeapAllocator> {
    Builder::new(
        HeapAllocator::new()
            .first_segment_words(first_segment_words)
            .allocation_strategy(AllocationStrategy::FixedSize),
    )
}

#[test]
fn forced_far_pointer() {
    // A two-word first segment holds only the root pointer, so the root
    // struct must spill into a second segment behind a far pointer.
    let mut message = tiny_segment_builder(2);
    {
        let mut root = message.init_root_struct(StructSize::new(3, 0));
        root.set_data_field::<u64>(0, 0x1111);
        root.set_data_field::<u64>(1, 0x2222);
        root.set_data_field::<u64>(2, 0x3333);
    }

    {
        let segments = message.get_segments_for_output();
        assert_eq!(segments.len(), 2);

        // Segment 0: a single-far pointer to segment 1, word 0.
        assert_eq!(
            segments[0],
            &[0x02, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
        );

        // Segment 1: the landing pad (a direct struct pointer, offset 0,
        // three data words) followed by the data.
        assert_eq!(segments[1].len(), 4 * 8);
        assert_eq!(
            &segments[1][0..8],
            &[0x00, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00]
        );
    }

    // The reader resolves the far pointer transparently.
    let bytes = serialize::write_message_to_words(&message);
    let reader = serialize::read_message(&bytes[..], ReaderOptions::new()).unwrap();
    let root = reader.get_root_struct().unwrap();
    assert_eq!(root.get_data_field::<u64>(0), 0x1111);
    assert_eq!(root.get_data_field::<u64>(1), 0x2222);
    assert_eq!(root.get_data_field::<u64>(2), 0x3333);
}

#[test]
fn double_far_on_upgrade() {
    // Fill a four-word first segment completely: root pointer, a 1/1 root
    // struct, and a one-word child it points at.
    let mut message = tiny_segment_builder(4);
    {
        let mut root = message.init_root_struct(StructSize::new(1, 1));
        root.set_data_field::<u64>(0, 0x5150);
        let mut child = root
            .get_pointer_field_mut(0)
            .init_struct(StructSize::new(1, 0));
        child.set_data_field::<u64>(0, 0xabcd);
    }

    // Growing the root forces it into a new segment. Its child pointer must
    // be re-homed, but the old segment has no room for a landing pad next
    // to the child, so a double-far pad pair lands in a third segment.
    {
        let root = message.get_root_struct(StructSize::new(2, 1)).unwrap();
        assert_eq!(root.get_data_field::<u64>(0), 0x5150);
    }

    {
        let segments = message.get_segments_for_output();
        assert_eq!(segments.len(), 3);

        // The old root struct's words are zeroed; the child body stays put.
        assert_eq!(&segments[0][8..24], &[0u8; 16]);
        assert_eq!(
            &segments[0][24..32],
            &[0xcd, 0xab, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );

        // The relocated root's pointer field is a double-far to segment 2.
        assert_eq!(
            &segments[1][24..32],
            &[0x06, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]
        );

        // Segment 2 holds the pad pair: a single-far to the child's word in
        // segment 0, then a tag carrying the child's kind and size.
        assert_eq!(
            &segments[2][0..8],
            &[0x1a, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            &segments[2][8..16],
            &[0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
        );
    }

    // The whole chain still reads back.
    let bytes = serialize::write_message_to_words(&message);
    let reader = serialize::read_message(&bytes[..], ReaderOptions::new()).unwrap();
    let root = reader.get_root_struct().unwrap();
    assert_eq!(root.get_data_field::<u64>(0), 0x5150);
    let child = root.get_pointer_field(0).get_struct(None).unwrap();
    assert_eq!(child.get_data_field::<u64>(0), 0xabcd);
}

#[test]
fn far_pointer_chain_survives_packing() {
    let mut message = tiny_segment_builder(2);
    {
        let mut root = message.init_root_struct(StructSize::new(1, 1));
        root.set_data_field::<u64>(0, 42);
        let mut text_field = root.get_pointer_field_mut(0);
        text_field.set_text("spread across segments".into());
    }

    let mut packed_bytes: Vec<u8> = Vec::new();
    zerogram::packed::write_message(&mut packed_bytes, &message).unwrap();
    let reader =
        zerogram::packed::read_message(&packed_bytes[..], ReaderOptions::new()).unwrap();
    let root = reader.get_root_struct().unwrap();
    assert_eq!(root.get_data_field::<u64>(0), 42);
    assert_eq!(
        root.get_pointer_field(0).get_text(None).unwrap(),
        "spread across segments"
    );
}

#[test]
fn hostile_far_pointer_is_rejected() {
    // A far pointer into a segment that does not exist.
    let seg0 = [zerogram::word(0x02, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00)];
    let segments = [zerogram::Word::words_to_bytes(&seg0)];
    let reader = zerogram::message::Reader::new(
        zerogram::message::SegmentArray::new(&segments),
        ReaderOptions::new(),
    );
    let err = reader.get_root_struct().unwrap_err();
    assert_eq!(err.kind, zerogram::ErrorKind::UnknownSegment(7));
}

#[test]
fn hostile_landing_pad_out_of_bounds() {
    // A far pointer whose landing pad position (word 16) lies past the end
    // of the one-word segment it names.
    let seg0 = [zerogram::word(0x82, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00)];
    let seg1 = [zerogram::word(0, 0, 0, 0, 0, 0, 0, 0)];
    let segments = [
        zerogram::Word::words_to_bytes(&seg0),
        zerogram::Word::words_to_bytes(&seg1),
    ];
    let reader = zerogram::message::Reader::new(
        zerogram::message::SegmentArray::new(&segments),
        ReaderOptions::new(),
    );
    let err = reader.get_root_struct().unwrap_err();
    assert_eq!(err.kind, zerogram::ErrorKind::PointerOutOfBounds);
}
