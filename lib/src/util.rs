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

//! Internal helpers shared by the various decoders of this library.

use core::hash::Hasher as _;

/// Returns a parser that decodes a SCALE-compact-encoded `usize`.
///
/// > **Note**: When using this function outside of a `nom` "context", you might have to explicit
/// >           the type of `E`. Use `nom::error::Error<&[u8]>`.
pub(crate) fn nom_scale_compact_usize<'a, E: nom::error::ParseError<&'a [u8]>>(
    bytes: &'a [u8],
) -> nom::IResult<&'a [u8], usize, E> {
    if bytes.is_empty() {
        return Err(nom::Err::Error(nom::error::make_error(
            bytes,
            nom::error::ErrorKind::Eof,
        )));
    }

    match bytes[0] & 0b11 {
        0b00 => {
            let value = usize::from(bytes[0] >> 2);
            Ok((&bytes[1..], value))
        }
        0b01 => {
            if bytes.len() < 2 {
                return Err(nom::Err::Error(nom::error::make_error(
                    bytes,
                    nom::error::ErrorKind::Eof,
                )));
            }

            let byte0 = usize::from(bytes[0] >> 2);
            let byte1 = usize::from(bytes[1]);

            // Value is invalid if it could have been encoded with fewer bytes.
            if byte1 == 0 {
                return Err(nom::Err::Error(nom::error::make_error(
                    bytes,
                    nom::error::ErrorKind::Satisfy,
                )));
            }

            let value = (byte1 << 6) | byte0;
            Ok((&bytes[2..], value))
        }
        0b10 => {
            if bytes.len() < 4 {
                return Err(nom::Err::Error(nom::error::make_error(
                    bytes,
                    nom::error::ErrorKind::Eof,
                )));
            }

            // The code below assumes that `usize` is at least 32 bits.
            assert!(usize::BITS >= 32);

            let byte0 = usize::from(bytes[0] >> 2);
            let byte1 = usize::from(bytes[1]);
            let byte2 = usize::from(bytes[2]);
            let byte3 = usize::from(bytes[3]);

            // Value is invalid if it could have been encoded with fewer bytes.
            if byte3 == 0 && byte2 == 0 {
                return Err(nom::Err::Error(nom::error::make_error(
                    bytes,
                    nom::error::ErrorKind::Satisfy,
                )));
            }

            let value = (byte3 << 22) | (byte2 << 14) | (byte1 << 6) | byte0;
            Ok((&bytes[4..], value))
        }
        0b11 => {
            let num_bytes = usize::from(bytes[0] >> 2) + 4;

            if bytes.len() < num_bytes + 1 {
                return Err(nom::Err::Error(nom::error::make_error(
                    bytes,
                    nom::error::ErrorKind::Eof,
                )));
            }

            // Value is invalid if highest byte is 0. It is also invalid if the value would
            // overflow a `usize`.
            if bytes[num_bytes] == 0 || num_bytes > core::mem::size_of::<usize>() {
                return Err(nom::Err::Error(nom::error::make_error(
                    bytes,
                    nom::error::ErrorKind::Satisfy,
                )));
            }

            let mut value = 0usize;
            for (n, byte) in bytes[1..=num_bytes].iter().enumerate() {
                value |= usize::from(*byte) << (8 * n);
            }

            Ok((&bytes[num_bytes + 1..], value))
        }
        _ => unreachable!(),
    }
}

/// Returns a buffer containing the SCALE-compact encoding of the given value.
pub(crate) fn encode_scale_compact_usize(mut value: usize) -> impl AsRef<[u8]> + Clone {
    const MAX_BITS: usize = 1 + (usize::BITS as usize) / 8;
    let mut array = arrayvec::ArrayVec::<u8, MAX_BITS>::new();

    if value < 64 {
        array.push(u8::try_from(value).unwrap() << 2);
    } else if value < (1 << 14) {
        array.push((u8::try_from(value & 0b111111).unwrap() << 2) | 0b01);
        array.push(u8::try_from((value >> 6) & 0xff).unwrap());
    } else if value < (1 << 30) {
        array.push((u8::try_from(value & 0b111111).unwrap() << 2) | 0b10);
        array.push(u8::try_from((value >> 6) & 0xff).unwrap());
        array.push(u8::try_from((value >> 14) & 0xff).unwrap());
        array.push(u8::try_from((value >> 22) & 0xff).unwrap());
    } else {
        array.push(0);
        while value != 0 {
            array.push(u8::try_from(value & 0xff).unwrap());
            value >>= 8;
        }
        array[0] = (u8::try_from(array.len() - 1 - 4).unwrap() << 2) | 0b11;
    }

    array
}

/// Returns a buffer containing the SCALE-compact encoding of the given `u64`.
pub(crate) fn encode_scale_compact_u64(value: u64) -> impl AsRef<[u8]> + Clone {
    // A `u64` always fits in a `usize` on the platforms this library targets.
    encode_scale_compact_usize(usize::try_from(value).unwrap_or_else(|_| unreachable!()))
}

/// Returns a parser that decodes a SCALE-compact-encoded `u64`.
pub(crate) fn nom_scale_compact_u64<'a, E: nom::error::ParseError<&'a [u8]>>(
    bytes: &'a [u8],
) -> nom::IResult<&'a [u8], u64, E> {
    // A `u64` always fits in a `usize` on the platforms this library targets.
    nom::combinator::map(nom_scale_compact_usize, |n| u64::try_from(n).unwrap())(bytes)
}

/// Implementation of the `BuildHasher` trait for the sip hasher.
///
/// Contrary to the default implementation of the standard library, a seed is explicitly passed
/// here, making the hashing predictable. This is a good thing for tests and no-no for real code.
#[derive(Debug, Clone)]
pub(crate) struct SipHasherBuild([u8; 16]);

impl SipHasherBuild {
    pub(crate) fn new(seed: [u8; 16]) -> SipHasherBuild {
        SipHasherBuild(seed)
    }
}

impl core::hash::BuildHasher for SipHasherBuild {
    type Hasher = SipHasher;

    fn build_hasher(&self) -> Self::Hasher {
        SipHasher(siphasher::sip::SipHasher13::new_with_key(&self.0))
    }
}

pub(crate) struct SipHasher(siphasher::sip::SipHasher13);

impl core::hash::Hasher for SipHasher {
    fn finish(&self) -> u64 {
        self.0.finish()
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.write(bytes)
    }
}
