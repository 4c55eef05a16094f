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

//! Schema upgrades on mutation: data written under an old, smaller layout
//! must survive being reopened under a grown one.

use zerogram::message;
use zerogram::serialize;
use zerogram::wire::{ElementSize, StructSize};

#[test]
fn struct_upgrade_preserves_content() {
    let mut message = message::Builder::new_default();
    {
        let mut root = message.init_root_struct(StructSize::new(1, 1));
        root.set_data_field::<u64>(0, 0xfeed_f00d);
        let mut text_field = root.get_pointer_field_mut(0);
        text_field.set_text("kept".into());
    }

    // Reopen with a grown schema: two data words, two pointers.
    {
        let mut root = message.get_root_struct(StructSize::new(2, 2)).unwrap();
        assert_eq!(root.get_data_field::<u64>(0), 0xfeed_f00d);
        // The new field reads as zero and is writable.
        assert_eq!(root.get_data_field::<u64>(1), 0);
        root.set_data_field::<u64>(1, 7);
        assert!(!root.is_pointer_field_null(0));
        assert!(root.is_pointer_field_null(1));
        let mut second = root.get_pointer_field_mut(1);
        second.set_text("new".into());
    }

    let bytes = serialize::write_message_to_words(&message);
    let reader = serialize::read_message(&bytes[..], message::ReaderOptions::new()).unwrap();
    let root = reader.get_root_struct().unwrap();
    assert_eq!(root.get_data_field::<u64>(0), 0xfeed_f00d);
    assert_eq!(root.get_data_field::<u64>(1), 7);
    assert_eq!(root.get_pointer_field(0).get_text(None).unwrap(), "kept");
    assert_eq!(root.get_pointer_field(1).get_text(None).unwrap(), "new");
}

#[test]
fn struct_list_upgrade() {
    let mut message = message::Builder::new_default();
    {
        let mut list = message.root().init_struct_list(4, StructSize::new(1, 0));
        for i in 0..4 {
            let mut element = list.reborrow().get_struct_element(i);
            element.set_data_field::<u64>(0, u64::from(i) + 1);
        }
    }

    // Reopen the list under a schema with two data words and one pointer
    // per element. A new inline-composite list is allocated and the old
    // elements move into it.
    {
        let mut list = message
            .root()
            .get_struct_list(StructSize::new(2, 1), None)
            .unwrap();
        assert_eq!(list.len(), 4);
        for i in 0..4 {
            let element = list.reborrow().get_struct_element(i);
            assert_eq!(element.get_data_field::<u64>(0), u64::from(i) + 1);
            assert_eq!(element.get_data_field::<u64>(1), 0);
            assert!(element.is_pointer_field_null(0));
        }
    }

    let segments = message.get_segments_for_output();
    assert_eq!(segments.len(), 1);
    let seg = segments[0];

    // Old storage (tag word plus four one-word elements, right after the
    // root pointer) must be entirely zero.
    assert_eq!(&seg[8..48], &[0u8; 40]);

    // The new list body follows: a tag declaring four elements of three
    // words each.
    assert_eq!(
        &seg[48..56],
        &[0x10, 0x00, 0x00, 0x00, 0x02, 0x00, 0x01, 0x00]
    );

    // Values live at each element's first data word.
    let reader = message.into_reader();
    let zerogram::object::Reader::List(list) = reader.get_root_object().unwrap() else {
        panic!("expected a list at the root");
    };
    for i in 0..4 {
        assert_eq!(
            list.get_struct_element(i).get_data_field::<u64>(0),
            u64::from(i) + 1
        );
    }
}

#[test]
fn primitive_list_to_struct_list_upgrade() {
    let mut message = message::Builder::new_default();
    {
        let mut list = message.root().init_list(ElementSize::EightBytes, 3);
        for i in 0..3 {
            list.set(i, 1000 + u64::from(i));
        }
    }

    // Viewing a primitive list as a struct list expands it: each element's
    // old value lands in the first data word.
    {
        let mut list = message
            .root()
            .get_struct_list(StructSize::new(1, 1), None)
            .unwrap();
        assert_eq!(list.len(), 3);
        for i in 0..3 {
            let element = list.reborrow().get_struct_element(i);
            assert_eq!(element.get_data_field::<u64>(0), 1000 + u64::from(i));
            assert!(element.is_pointer_field_null(0));
        }
    }
}

#[test]
fn pointer_list_to_struct_list_upgrade() {
    let mut message = message::Builder::new_default();
    {
        let mut list = message.root().init_list(ElementSize::Pointer, 2);
        for i in 0..2 {
            let mut p = list.reborrow().get_pointer_element(i);
            p.set_text(if i == 0 { "zero" } else { "one" }.into());
        }
    }

    // The old pointers land in each element's pointer slot 0.
    {
        let mut list = message
            .root()
            .get_struct_list(StructSize::new(1, 1), None)
            .unwrap();
        assert_eq!(list.len(), 2);
        let e0 = list.reborrow().get_struct_element(0);
        assert_eq!(
            e0.as_reader().get_pointer_field(0).get_text(None).unwrap(),
            "zero"
        );
        let e1 = list.reborrow().get_struct_element(1);
        assert_eq!(
            e1.as_reader().get_pointer_field(0).get_text(None).unwrap(),
            "one"
        );
    }
}

#[test]
fn void_list_upgrade_costs_nothing_to_move() {
    let mut message = message::Builder::new_default();
    {
        let list = message.root().init_list(ElementSize::Void, 5);
        assert_eq!(list.len(), 5);
    }

    let mut list = message
        .root()
        .get_struct_list(StructSize::new(1, 0), None)
        .unwrap();
    assert_eq!(list.len(), 5);
    for i in 0..5 {
        let element = list.reborrow().get_struct_element(i);
        assert_eq!(element.get_data_field::<u64>(0), 0);
    }
}

#[test]
fn struct_list_reread_as_primitive_list() {
    // A struct list whose elements lead with a data word may be read as a
    // primitive list of that word.
    let mut message = message::Builder::new_default();
    {
        let mut list = message.root().init_struct_list(3, StructSize::new(1, 1));
        for i in 0..3 {
            let mut element = list.reborrow().get_struct_element(i);
            element.set_data_field::<u64>(0, 7 * (u64::from(i) + 1));
        }
    }

    let reader = message.into_reader();
    let list = reader
        .root()
        .unwrap()
        .get_list(ElementSize::EightBytes, None)
        .unwrap();
    assert_eq!(list.len(), 3);
    for i in 0..3 {
        assert_eq!(list.get::<u64>(i), 7 * (u64::from(i) + 1));
    }
}

#[test]
fn narrower_view_of_wider_list_is_allowed() {
    let mut message = message::Builder::new_default();
    {
        let mut list = message.root().init_list(ElementSize::EightBytes, 2);
        list.set::<u64>(0, 0x0102_0304_0506_0708);
        list.set::<u64>(1, 0x1112_1314_1516_1718);
    }

    let reader = message.into_reader();
    // An eight-byte encoding satisfies a one-byte view; elements re-read at
    // the wider stride's start.
    let list = reader
        .root()
        .unwrap()
        .get_list(ElementSize::Byte, None)
        .unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list.get::<u8>(0), 0x08);
    assert_eq!(list.get::<u8>(1), 0x18);
}

#[test]
fn incompatible_upgrades_are_rejected() {
    use zerogram::ErrorKind;

    // Bit lists cannot become struct lists.
    let mut message = message::Builder::new_default();
    {
        let mut list = message.root().init_list(ElementSize::Bit, 3);
        list.set_bool(0, true);
    }
    let err = message
        .root()
        .get_struct_list(StructSize::new(1, 0), None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::BitListWhereStructListExpected);

    // A byte list cannot be widened in place.
    let mut message = message::Builder::new_default();
    {
        message.root().init_list(ElementSize::Byte, 3);
    }
    let err = message
        .root()
        .get_list(ElementSize::EightBytes, None)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::IncompatibleListElement);
}
