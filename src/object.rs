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

//! Dynamically-typed access to a pointer field.
//!
//! An object field may hold any pointer kind. Reading yields a tagged
//! variant with the typed view embedded; writing back requires naming a
//! concrete shape, which is how dynamic callers re-project opaque payloads.

use crate::wire::{
    ElementSize, ListBuilder, ListReader, PointerBuilder, PointerReader, PointerType,
    StructBuilder, StructReader, StructSize,
};
use crate::{data, text, Result};

/// What an object pointer turned out to reference.
pub enum Reader<'a> {
    Null,
    Struct(StructReader<'a>),
    List(ListReader<'a>),
}

impl<'a> Reader<'a> {
    /// Inspects the pointer and produces the matching typed view. Reserved
    /// pointer kinds are a validation failure, not a variant.
    pub fn read_from(pointer: PointerReader<'a>) -> Result<Self> {
        match pointer.pointer_type()? {
            PointerType::Null => Ok(Self::Null),
            PointerType::Struct => Ok(Self::Struct(pointer.get_struct(None)?)),
            PointerType::List => Ok(Self::List(pointer.get_list_of_any_size(None)?)),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// Writable access to an object field.
pub struct Builder<'a> {
    pointer: PointerBuilder<'a>,
}

impl<'a> Builder<'a> {
    pub fn new(pointer: PointerBuilder<'a>) -> Self {
        Self { pointer }
    }

    pub fn reborrow(&mut self) -> Builder<'_> {
        Builder {
            pointer: self.pointer.reborrow(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.pointer.is_null()
    }

    /// Total words reachable from this field.
    pub fn target_size(&self) -> Result<u64> {
        self.pointer.as_reader().total_size()
    }

    pub fn init_struct(self, size: StructSize) -> StructBuilder<'a> {
        self.pointer.init_struct(size)
    }

    pub fn init_list(self, element_size: ElementSize, count: u32) -> ListBuilder<'a> {
        self.pointer.init_list(element_size, count)
    }

    pub fn init_struct_list(self, count: u32, size: StructSize) -> ListBuilder<'a> {
        self.pointer.init_struct_list(count, size)
    }

    pub fn init_text(self, len: u32) -> text::Builder<'a> {
        self.pointer.init_text(len)
    }

    pub fn init_data(self, len: u32) -> data::Builder<'a> {
        self.pointer.init_data(len)
    }

    pub fn set_struct(&mut self, value: &StructReader) -> Result<()> {
        self.pointer.set_struct(value)
    }

    pub fn set_list(&mut self, value: &ListReader) -> Result<()> {
        self.pointer.set_list(value)
    }

    pub fn set_text(&mut self, value: text::Reader<'_>) {
        self.pointer.set_text(value)
    }

    pub fn set_data(&mut self, value: &[u8]) {
        self.pointer.set_data(value)
    }

    /// Deep-copies another pointer's referent into this field.
    pub fn copy_from(&mut self, other: PointerReader) -> Result<()> {
        self.pointer.copy_from(other)
    }

    /// Zeroes the referenced subtree and nulls the pointer.
    pub fn clear(&mut self) {
        self.pointer.clear()
    }

    pub fn as_reader(&self) -> Result<Reader<'_>> {
        Reader::read_from(self.pointer.as_reader())
    }

    pub fn into_pointer(self) -> PointerBuilder<'a> {
        self.pointer
    }
}
