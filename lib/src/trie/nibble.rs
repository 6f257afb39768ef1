// Bmv
// Copyright (C) 2024  Bmv contributors
// SPDX-License-Identifier: GPL-3.0-or-later WITH Classpath-exception-2.0

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use core::fmt;

/// A single nibble, i.e. a 4 bits value. Keys in the trie are made of nibbles.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Nibble(u8);

impl TryFrom<u8> for Nibble {
    type Error = NibbleFromU8Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if value < 16 {
            Ok(Nibble(value))
        } else {
            Err(NibbleFromU8Error::TooLarge)
        }
    }
}

impl From<Nibble> for u8 {
    fn from(nibble: Nibble) -> u8 {
        nibble.0
    }
}

impl From<Nibble> for usize {
    fn from(nibble: Nibble) -> usize {
        usize::from(nibble.0)
    }
}

impl fmt::LowerHex for Nibble {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Error when building a [`Nibble`] from a `u8`.
#[derive(Debug, Clone, derive_more::Display)]
pub enum NibbleFromU8Error {
    /// The integer value is too large.
    #[display(fmt = "value is superior or equal to 16")]
    TooLarge,
}

/// Turns an iterator of bytes into an iterator of nibbles corresponding to these bytes. For each
/// byte, the most significant nibble is yielded first.
pub fn bytes_to_nibbles<I>(bytes: I) -> BytesToNibbles<I> {
    BytesToNibbles {
        inner: bytes,
        next: None,
    }
}

/// Turns an iterator of bytes into an iterator of nibbles.
#[derive(Debug, Copy, Clone)]
pub struct BytesToNibbles<I> {
    inner: I,
    next: Option<Nibble>,
}

impl<I: Iterator<Item = u8>> Iterator for BytesToNibbles<I> {
    type Item = Nibble;

    fn next(&mut self) -> Option<Nibble> {
        if let Some(next) = self.next.take() {
            return Some(next);
        }

        let byte = self.inner.next()?;
        self.next = Some(Nibble(byte & 0xf));
        Some(Nibble(byte >> 4))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let (min, max) = self.inner.size_hint();
        let extra = usize::from(self.next.is_some());
        (
            min.saturating_mul(2).saturating_add(extra),
            max.and_then(|max| max.checked_mul(2))
                .and_then(|max| max.checked_add(extra)),
        )
    }
}

impl<I: ExactSizeIterator<Item = u8>> ExactSizeIterator for BytesToNibbles<I> {}

/// Turns an iterator of nibbles into an iterator of bytes.
///
/// If the number of nibbles is uneven, adds a `0` nibble at the beginning, similar to how the
/// partial key of a trie node is laid out when its length is odd.
pub fn nibbles_to_bytes_prefix_extend<I: ExactSizeIterator<Item = Nibble>>(
    mut nibbles: I,
) -> impl ExactSizeIterator<Item = u8> {
    let has_prefix = (nibbles.len() % 2) == 1;
    let mut first_nibble = None;
    if has_prefix {
        first_nibble = nibbles.next();
    }

    NibblesToBytes {
        first: first_nibble,
        inner: nibbles,
    }
}

struct NibblesToBytes<I> {
    // Nibble to emit alone in the low half of the first byte, if the total count was odd.
    first: Option<Nibble>,
    inner: I,
}

impl<I: ExactSizeIterator<Item = Nibble>> Iterator for NibblesToBytes<I> {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        if let Some(first) = self.first.take() {
            return Some(first.0);
        }

        let high = self.inner.next()?;
        // The caller guarantees an even number of remaining nibbles.
        let low = self.inner.next().unwrap_or(Nibble(0));
        Some((high.0 << 4) | low.0)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = usize::from(self.first.is_some()) + self.inner.len().div_ceil(2);
        (len, Some(len))
    }
}

impl<I: ExactSizeIterator<Item = Nibble>> ExactSizeIterator for NibblesToBytes<I> {}
