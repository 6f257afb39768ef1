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

//! Source chain block header.
//!
//! Each block of the source chain is identified by its header, and each header is identified by
//! its hash: the blake2b-256 digest of the encoded header bytes. The fields that matter to the
//! verification pipeline are the parent hash (chain linkage), the block number (height
//! continuity), and the state root (anchor for storage proofs). Consensus-specific information
//! such as the round or the validator set id travels with the finality votes, not with the
//! header.
//!
//! A header is immutable once decoded, and its hash is a pure function of its encoding.

use crate::util;

use alloc::vec::Vec;
use core::fmt;

/// Attempt to decode the given encoded header.
pub fn decode(encoded: &[u8]) -> Result<BlockHeaderRef, DecodeError> {
    let (header, remainder) = decode_partial(encoded)?;
    if !remainder.is_empty() {
        return Err(DecodeError::TooLong);
    }
    Ok(header)
}

/// Attempt to decode the given encoded header.
///
/// Contrary to [`decode`], doesn't return an error if the slice is too long, but returns the
/// remainder.
pub fn decode_partial(encoded: &[u8]) -> Result<(BlockHeaderRef, &[u8]), DecodeError> {
    match nom::combinator::complete(header)(encoded) {
        Ok((remainder, parsed)) => {
            let consumed = encoded.len() - remainder.len();
            Ok((
                BlockHeaderRef {
                    scale_encoded: &encoded[..consumed],
                    ..parsed
                },
                remainder,
            ))
        }
        Err(nom::Err::Error(err) | nom::Err::Failure(err)) => Err(DecodeError::Header(err.code)),
        Err(_) => unreachable!(),
    }
}

/// Decoded block header, referencing the encoded bytes it was decoded from.
#[derive(Clone, PartialEq, Eq)]
pub struct BlockHeaderRef<'a> {
    /// Hash of the parent block's header.
    pub parent_hash: &'a [u8; 32],
    /// Height of the block in the chain.
    pub number: u64,
    /// Root of the state trie of the block. Storage proofs are verified against this value.
    pub state_root: &'a [u8; 32],
    /// Encoding this header was decoded from. The header hash is derived from these bytes.
    scale_encoded: &'a [u8],
}

impl<'a> BlockHeaderRef<'a> {
    /// Returns the hash of the header.
    ///
    /// This is the blake2b-256 digest of the encoded bytes, independently recomputed. It cannot
    /// be substituted by the submitter of a proof.
    pub fn hash(&self) -> [u8; 32] {
        hash_from_scale_encoded_header(self.scale_encoded)
    }

    /// Returns the encoding this header was decoded from.
    pub fn scale_encoded(&self) -> &'a [u8] {
        self.scale_encoded
    }

    /// Turns the reference into an owned header.
    pub fn into_owned(self) -> BlockHeader {
        BlockHeader {
            parent_hash: *self.parent_hash,
            number: self.number,
            state_root: *self.state_root,
        }
    }
}

impl<'a> fmt::Debug for BlockHeaderRef<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BlockHeaderRef")
            .field("parent_hash", &hex_fmt(self.parent_hash))
            .field("number", &self.number)
            .field("state_root", &hex_fmt(self.state_root))
            .finish()
    }
}

/// Owned equivalent of [`BlockHeaderRef`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub parent_hash: [u8; 32],
    pub number: u64,
    pub state_root: [u8; 32],
}

impl BlockHeader {
    /// Returns the encoding of this header.
    pub fn scale_encoding_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 8 + 32);
        out.extend_from_slice(&self.parent_hash);
        out.extend_from_slice(util::encode_scale_compact_usize(
            usize::try_from(self.number).unwrap(),
        ).as_ref());
        out.extend_from_slice(&self.state_root);
        out
    }

    /// Returns the hash of this header.
    pub fn hash(&self) -> [u8; 32] {
        hash_from_scale_encoded_header(self.scale_encoding_vec())
    }
}

impl<'a> From<BlockHeaderRef<'a>> for BlockHeader {
    fn from(h: BlockHeaderRef<'a>) -> BlockHeader {
        h.into_owned()
    }
}

/// Returns the hash of the header whose encoding is passed as parameter.
pub fn hash_from_scale_encoded_header(header: impl AsRef<[u8]>) -> [u8; 32] {
    let result = blake2_rfc::blake2b::blake2b(32, &[], header.as_ref());
    let mut out = [0; 32];
    out.copy_from_slice(result.as_bytes());
    out
}

/// Potential error when decoding a header.
#[derive(Debug, derive_more::Display)]
pub enum DecodeError {
    /// Header parsing error.
    #[display(fmt = "Header parsing error: {_0:?}")]
    Header(nom::error::ErrorKind),
    /// Data is superfluous after the header.
    TooLong,
}

/// `Nom` combinator that parses a header.
fn header(bytes: &[u8]) -> nom::IResult<&[u8], BlockHeaderRef> {
    nom::error::context(
        "header",
        nom::combinator::map(
            nom::sequence::tuple((
                nom::bytes::streaming::take(32u32),
                util::nom_scale_compact_u64,
                nom::bytes::streaming::take(32u32),
            )),
            |(parent_hash, number, state_root): (&[u8], u64, &[u8])| BlockHeaderRef {
                parent_hash: TryFrom::try_from(parent_hash).unwrap(),
                number,
                state_root: TryFrom::try_from(state_root).unwrap(),
                scale_encoded: &[],
            },
        ),
    )(bytes)
}

fn hex_fmt(bytes: &[u8]) -> impl fmt::Debug + '_ {
    struct HexFmt<'a>(&'a [u8]);
    impl<'a> fmt::Debug for HexFmt<'a> {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "0x")?;
            for byte in self.0 {
                write!(f, "{byte:02x}")?;
            }
            Ok(())
        }
    }
    HexFmt(bytes)
}
