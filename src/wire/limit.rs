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

use core::cell::Cell;

use crate::{Error, ErrorKind, Result};

/// The traversal budget: a per-message count of words a reader is willing
/// to dereference before giving up.
///
/// Hostile input can aim many pointers at one region, so a message that is
/// tiny on the wire may be enormous when walked. Rather than detect the
/// overlap, the limiter bounds the total work. Walking the same sub-object
/// twice is charged twice; callers that knowingly double-count (size
/// calculations, say) hand the words back with [`refund`](Self::refund).
///
/// The counter is a plain `Cell`. Concurrent readers could tear a charge
/// and under-count, which merely delays the cutoff; `refund` saturates, so
/// no interleaving can manufacture a spurious cutoff either.
#[derive(Debug)]
pub struct ReadLimiter {
    remaining: Cell<usize>,
    enforced: bool,
}

impl ReadLimiter {
    /// `None` disables enforcement (for traversing one's own output).
    pub fn new(budget: Option<usize>) -> Self {
        Self {
            remaining: Cell::new(budget.unwrap_or(usize::MAX)),
            enforced: budget.is_some(),
        }
    }

    #[inline]
    pub fn charge(&self, words: usize) -> Result<()> {
        if !self.enforced {
            return Ok(());
        }
        let left = self.remaining.get();
        if words > left {
            return Err(Error::from_kind(ErrorKind::TraversalLimitExceeded));
        }
        self.remaining.set(left - words);
        Ok(())
    }

    #[inline]
    pub fn refund(&self, words: usize) {
        self.remaining.set(self.remaining.get().saturating_add(words));
    }
}

#[cfg(test)]
mod tests {
    use super::ReadLimiter;
    use crate::ErrorKind;

    #[test]
    fn budget_is_enforced() {
        let limiter = ReadLimiter::new(Some(10));
        assert!(limiter.charge(6).is_ok());
        assert!(limiter.charge(4).is_ok());
        let err = limiter.charge(1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TraversalLimitExceeded);
    }

    #[test]
    fn refund_restores() {
        let limiter = ReadLimiter::new(Some(4));
        assert!(limiter.charge(4).is_ok());
        limiter.refund(4);
        assert!(limiter.charge(3).is_ok());
    }

    #[test]
    fn refund_saturates() {
        let limiter = ReadLimiter::new(Some(2));
        limiter.refund(usize::MAX);
        assert!(limiter.charge(100).is_ok());
    }

    #[test]
    fn unlimited() {
        let limiter = ReadLimiter::new(None);
        assert!(limiter.charge(usize::MAX).is_ok());
        assert!(limiter.charge(usize::MAX).is_ok());
    }
}
