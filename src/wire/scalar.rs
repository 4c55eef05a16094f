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

//! Fixed-width values as they appear in a data section: little-endian, at
//! byte granularity, stored XORed with their schema default so that the
//! all-zero bit pattern always decodes to the default value.
//!
//! `bool` is deliberately not a [`Scalar`]: it packs at bit granularity and
//! the views provide dedicated accessors for it.

/// A numeric type storable in struct data sections and primitive lists.
pub trait Scalar: Copy + Default {
    /// Width on the wire, in bytes.
    const BYTES: usize;

    /// The integer type a schema default is XORed through. For floats this
    /// is the same-width integer, so masking cannot disturb NaN payloads.
    type Mask: Copy;

    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, bytes: &mut [u8]);
    fn mask(self, mask: Self::Mask) -> Self;
}

macro_rules! int_scalar {
    ($($t:ty),*) => {$(
        impl Scalar for $t {
            const BYTES: usize = core::mem::size_of::<$t>();
            type Mask = $t;

            #[inline]
            fn read_le(bytes: &[u8]) -> Self {
                Self::from_le_bytes(bytes.try_into().unwrap())
            }

            #[inline]
            fn write_le(self, bytes: &mut [u8]) {
                bytes.copy_from_slice(&self.to_le_bytes());
            }

            #[inline]
            fn mask(self, mask: Self::Mask) -> Self {
                self ^ mask
            }
        }
    )*};
}

int_scalar!(u8, i8, u16, i16, u32, i32, u64, i64);

impl Scalar for f32 {
    const BYTES: usize = 4;
    type Mask = u32;

    #[inline]
    fn read_le(bytes: &[u8]) -> Self {
        Self::from_le_bytes(bytes.try_into().unwrap())
    }

    #[inline]
    fn write_le(self, bytes: &mut [u8]) {
        bytes.copy_from_slice(&self.to_le_bytes());
    }

    #[inline]
    fn mask(self, mask: u32) -> Self {
        Self::from_bits(self.to_bits() ^ mask)
    }
}

impl Scalar for f64 {
    const BYTES: usize = 8;
    type Mask = u64;

    #[inline]
    fn read_le(bytes: &[u8]) -> Self {
        Self::from_le_bytes(bytes.try_into().unwrap())
    }

    #[inline]
    fn write_le(self, bytes: &mut [u8]) {
        bytes.copy_from_slice(&self.to_le_bytes());
    }

    #[inline]
    fn mask(self, mask: u64) -> Self {
        Self::from_bits(self.to_bits() ^ mask)
    }
}

#[cfg(test)]
mod tests {
    use super::Scalar;

    #[test]
    fn round_trips_little_endian() {
        let mut buf = [0u8; 8];
        0x0102_0304u32.write_le(&mut buf[..4]);
        assert_eq!(&buf[..4], &[4, 3, 2, 1]);
        assert_eq!(u32::read_le(&buf[..4]), 0x0102_0304);
    }

    #[test]
    fn masking_is_an_involution() {
        assert_eq!(7u16.mask(0xffff).mask(0xffff), 7);
        assert_eq!(0u16.mask(1234), 1234);
        let f = 2.5f64;
        assert_eq!(f.mask(u64::MAX).mask(u64::MAX), f);
    }
}
