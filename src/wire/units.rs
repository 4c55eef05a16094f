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

//! Layout geometry. Offsets move between four units (bits, bytes, words,
//! pointers); quantities are plain integers, and every unit conversion goes
//! through one of the rounding helpers below so the divisions are not
//! scattered through the traversal code.

pub const BITS_PER_BYTE: usize = 8;
pub const BITS_PER_WORD: usize = 64;
pub const BYTES_PER_WORD: usize = 8;

// A pointer occupies exactly one word.
pub const BITS_PER_POINTER: usize = 64;
pub const WORDS_PER_POINTER: usize = 1;
pub const POINTER_SIZE_IN_WORDS: usize = 1;

/// Words needed to hold `bits` bits. Bit counts are 64-bit because a
/// maximum-size object measured in bits overflows 32 bits; the resulting
/// word count always fits in 32.
#[inline]
pub fn words_for_bits(bits: u64) -> u32 {
    bits.div_ceil(BITS_PER_WORD as u64) as u32
}

/// Words needed to hold `bytes` bytes.
#[inline]
pub fn words_for_bytes(bytes: u32) -> u32 {
    bytes.div_ceil(BYTES_PER_WORD as u32)
}

/// Bytes needed to hold `bits` bits.
#[inline]
pub fn bytes_for_bits(bits: u64) -> u32 {
    bits.div_ceil(BITS_PER_BYTE as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(words_for_bits(0), 0);
        assert_eq!(words_for_bits(1), 1);
        assert_eq!(words_for_bits(64), 1);
        assert_eq!(words_for_bits(65), 2);
        assert_eq!(words_for_bytes(0), 0);
        assert_eq!(words_for_bytes(8), 1);
        assert_eq!(words_for_bytes(9), 2);
        assert_eq!(bytes_for_bits(0), 0);
        assert_eq!(bytes_for_bits(1), 1);
        assert_eq!(bytes_for_bits(9), 2);
    }
}
