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

//! The wire layout engine.
//!
//! [`ptr`] defines the tagged pointer word, [`read`] walks untrusted
//! messages through it, and [`build`] constructs messages. The [`arena`]
//! owns the segments both sides operate on. The safe top-level entry points
//! live in [`crate::message`].

pub mod arena;
pub mod build;
pub mod limit;
pub mod ptr;
pub mod read;
pub mod scalar;
pub mod units;

pub use build::{ListBuilder, PointerBuilder, StructBuilder};
pub use ptr::{ElementSize, StructSize};
pub use read::{ListReader, PointerReader, PointerType, StructReader};
pub use scalar::Scalar;
