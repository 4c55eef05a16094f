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

//! UTF-8 text blobs.
//!
//! On the wire, text is a byte list whose final element is a NUL
//! terminator; the logical content excludes it. Content is expected to be
//! UTF-8 but exposed as bytes, since the wire format cannot guarantee
//! validity.

use core::str;

/// Borrowed text content (terminator excluded).
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Reader<'a>(pub &'a [u8]);

impl<'a> Reader<'a> {
    /// The content's length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(self) -> &'a [u8] {
        self.0
    }

    pub fn to_str(self) -> core::result::Result<&'a str, str::Utf8Error> {
        str::from_utf8(self.0)
    }
}

impl<'a> From<&'a str> for Reader<'a> {
    fn from(value: &'a str) -> Self {
        Self(value.as_bytes())
    }
}

impl PartialEq<&str> for Reader<'_> {
    fn eq(&self, other: &&str) -> bool {
        self.0 == other.as_bytes()
    }
}

impl PartialEq<Reader<'_>> for &str {
    fn eq(&self, other: &Reader<'_>) -> bool {
        self.as_bytes() == other.0
    }
}

impl core::fmt::Debug for Reader<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.to_str() {
            Ok(s) => write!(f, "{s:?}"),
            Err(_) => write!(f, "<invalid utf-8: {:?}>", self.0),
        }
    }
}

/// Writable text content with an append cursor.
pub struct Builder<'a> {
    /// The content region; the trailing NUL lives just past its end.
    content: &'a mut [u8],
    /// Bytes written so far; `push_str`/`push_ascii` continue from here.
    fill: usize,
}

impl<'a> Builder<'a> {
    pub(crate) fn new(content: &'a mut [u8]) -> Self {
        Self { content, fill: 0 }
    }

    /// Wraps existing content with the cursor already at `fill`.
    pub(crate) fn continued(content: &'a mut [u8], fill: usize) -> Self {
        Self { content, fill }
    }

    /// The content's full length in bytes, regardless of the cursor.
    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn as_bytes(self) -> &'a [u8] {
        self.content
    }

    pub fn as_bytes_mut(self) -> &'a mut [u8] {
        self.content
    }

    pub fn to_str(self) -> core::result::Result<&'a str, str::Utf8Error> {
        str::from_utf8(self.content)
    }

    /// Appends one ASCII byte at the cursor.
    pub fn push_ascii(&mut self, ascii: u8) {
        assert!(ascii.is_ascii());
        self.content[self.fill] = ascii;
        self.fill += 1;
    }

    /// Appends a string at the cursor.
    pub fn push_str(&mut self, string: &str) {
        self.content[self.fill..][..string.len()].copy_from_slice(string.as_bytes());
        self.fill += string.len();
    }

    /// Zeroes everything written so far and rewinds the cursor.
    pub fn clear(&mut self) {
        self.content[..self.fill].fill(0);
        self.fill = 0;
    }

    pub fn reborrow(&mut self) -> Builder<'_> {
        Builder {
            content: self.content,
            fill: self.fill,
        }
    }

    pub fn into_reader(self) -> Reader<'a> {
        Reader(self.content)
    }

    pub fn reborrow_as_reader(&self) -> Reader<'_> {
        Reader(self.content)
    }
}

impl core::fmt::Debug for Builder<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.reborrow_as_reader().to_str() {
            Ok(s) => write!(f, "{s:?}"),
            Err(_) => write!(f, "<invalid utf-8>"),
        }
    }
}
