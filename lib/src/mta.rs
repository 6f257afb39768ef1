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

//! Merkle tree accumulator.
//!
//! An append-only summary of the source chain's block history. Every accepted block hash is
//! pushed as a leaf; the accumulator keeps one digest per power-of-two level (the *roots*), the
//! hash of the most recently appended block, and a small FIFO cache of the most recent leaves.
//!
//! The structure behaves like a binary counter: appending a leaf combines it with the existing
//! root of level 0, the result with the root of level 1, and so on until a free level is found.
//! Combining is `blake2b-256(left ++ right)` with the older subtree on the left; a level with no
//! sibling carries its single child upward unchanged. The number of levels is bounded by
//! [`MerkleTreeAccumulator::root_size`]: when an append would overflow it, the oldest
//! power-of-two subtree is forgotten and [`MerkleTreeAccumulator::offset`] advances by its leaf
//! count.
//!
//! Witness verification ([`MerkleTreeAccumulator::verify_witness`]) proves that a given block
//! hash is a member of the accumulator at a claimed height, either against the stored roots or,
//! for very recent leaves, against the cache.

use alloc::vec::Vec;

/// Append-only accumulator over block hashes. One instance per tracked chain layer.
#[derive(Debug, Clone)]
pub struct MerkleTreeAccumulator {
    /// Height of the most recently appended block. Equal to `offset` while empty.
    height: u64,
    /// Height covered by subtrees that have been forgotten, plus the initial trust point.
    offset: u64,
    /// One digest per power-of-two level. `roots[i]`, when `Some`, summarizes `2^i` leaves.
    roots: Vec<Option<[u8; 32]>>,
    /// Maximum number of root levels kept. `0` means unbounded.
    root_size: usize,
    /// Maximum number of recent leaf hashes kept in `cache`.
    cache_size: usize,
    /// Hashes of the most recently appended blocks, oldest first.
    cache: Vec<[u8; 32]>,
    /// Policy flag: whether to accept witnesses built against a view of the accumulator that is
    /// more recent than ours.
    allow_newer_witness: bool,
    /// Hash of the most recently appended block.
    last_block_hash: [u8; 32],
}

/// Configuration for a fresh [`MerkleTreeAccumulator`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Height of the block the accumulator starts trusting from. The first appended leaf is
    /// `offset + 1`.
    pub offset: u64,
    /// See [`MerkleTreeAccumulator::root_size`]. `0` disables the bound.
    pub root_size: usize,
    /// Number of recent leaf hashes kept for cache-relative witness checks.
    pub cache_size: usize,
    /// See [`MerkleTreeAccumulator::allow_newer_witness`].
    pub allow_newer_witness: bool,
    /// Hash of the block at height `offset`.
    pub last_block_hash: [u8; 32],
}

/// Reason why a witness failed to verify. See [`MerkleTreeAccumulator::verify_witness`].
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum WitnessError {
    /// The recomputed path does not lead to the stored digest, or the leaf hash disagrees with
    /// the cache.
    #[display(fmt = "witness path does not match the accumulator")]
    Mismatch,
    /// The witness was built before the accumulator dropped the information required to check
    /// it. The relayer must rebuild it against the current state.
    #[display(fmt = "witness is older than the verifiable window")]
    Old,
    /// The witness was built against a more recent accumulator than ours, and
    /// [`MerkleTreeAccumulator::allow_newer_witness`] is disabled.
    #[display(fmt = "witness is newer than the local accumulator")]
    Newer,
    /// The claimed height is not covered by the accumulator at all.
    #[display(fmt = "height out of range")]
    HeightOutOfRange,
}

impl MerkleTreeAccumulator {
    /// Builds a new, empty accumulator.
    pub fn new(config: Config) -> Self {
        MerkleTreeAccumulator {
            height: config.offset,
            offset: config.offset,
            roots: Vec::with_capacity(config.root_size),
            root_size: config.root_size,
            cache_size: config.cache_size,
            cache: Vec::with_capacity(config.cache_size),
            allow_newer_witness: config.allow_newer_witness,
            last_block_hash: config.last_block_hash,
        }
    }

    /// Height of the most recently appended block.
    pub fn height(&self) -> u64 {
        self.height
    }

    /// Number of leading blocks not covered by the stored roots.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Hash of the most recently appended block.
    pub fn last_block_hash(&self) -> &[u8; 32] {
        &self.last_block_hash
    }

    /// Stored root digests, lowest level first. `None` entries are levels currently without a
    /// subtree.
    pub fn roots(&self) -> &[Option<[u8; 32]>] {
        &self.roots
    }

    /// Recent leaf hashes, oldest first.
    pub fn cache(&self) -> &[[u8; 32]] {
        &self.cache
    }

    /// Appends the hash of a newly accepted block.
    pub fn add(&mut self, hash: [u8; 32]) {
        if self.cache_size > 0 {
            if self.cache.len() == self.cache_size {
                self.cache.remove(0);
            }
            self.cache.push(hash);
        }

        self.last_block_hash = hash;

        let mut carried = hash;
        let mut placed = false;
        for level in 0..self.roots.len() {
            match self.roots[level] {
                None => {
                    self.roots[level] = Some(carried);
                    placed = true;
                    break;
                }
                Some(existing) => {
                    if self.root_size > 0 && self.root_size <= level + 1 {
                        // Root budget exhausted: the oldest subtree at this level is forgotten.
                        self.roots[level] = Some(carried);
                        self.offset += 1 << level;
                        placed = true;
                        break;
                    }
                    carried = combine(&existing, &carried);
                    self.roots[level] = None;
                }
            }
        }
        if !placed {
            self.roots.push(Some(carried));
        }

        self.height += 1;
    }

    /// Verifies that `hash` is the leaf at `leaf_height`.
    ///
    /// `at_height` is the accumulator height observed by the relayer when the witness was
    /// built; `witness` is the sibling path, leaf to root, valid for that view.
    pub fn verify_witness(
        &self,
        witness: &[&[u8; 32]],
        hash: &[u8; 32],
        leaf_height: u64,
        at_height: u64,
    ) -> Result<(), WitnessError> {
        if leaf_height <= self.offset || leaf_height > self.height {
            return Err(WitnessError::HeightOutOfRange);
        }

        if at_height == self.height {
            // The relayer's view matches ours: the witness length selects the root level.
            let root = self
                .roots
                .get(witness.len())
                .copied()
                .flatten()
                .ok_or(WitnessError::Mismatch)?;
            verify_path(witness, &root, hash, leaf_height - 1 - self.offset)
        } else if at_height > self.height {
            // The witness was built against a more recent accumulator.
            if !self.allow_newer_witness {
                return Err(WitnessError::Newer);
            }
            let root_idx = self.root_index_by_height(leaf_height)?;
            let root = self
                .roots
                .get(root_idx)
                .copied()
                .flatten()
                .ok_or(WitnessError::Mismatch)?;
            // Only the part of the path below our own root level is meaningful.
            let truncated = &witness[..core::cmp::min(witness.len(), root_idx)];
            verify_path(truncated, &root, hash, leaf_height - 1 - self.offset)
        } else {
            // The witness is older than our view. The path itself is stale, but very recent
            // leaves can still be checked against the cache.
            let window = u64::try_from(self.cache.len()).unwrap();
            if leaf_height + window <= self.height {
                return Err(WitnessError::Old);
            }
            let pos = usize::try_from(
                u64::try_from(self.cache.len()).unwrap() - (self.height - leaf_height) - 1,
            )
            .unwrap();
            if self.cache[pos] == *hash {
                Ok(())
            } else {
                Err(WitnessError::Mismatch)
            }
        }
    }

    /// Returns the root level covering the leaf at the given height.
    fn root_index_by_height(&self, leaf_height: u64) -> Result<usize, WitnessError> {
        let mut idx = leaf_height
            .checked_sub(1 + self.offset)
            .ok_or(WitnessError::HeightOutOfRange)?;

        let mut level = self.roots.len();
        while level > 0 {
            level -= 1;
            if self.roots[level].is_none() {
                continue;
            }
            let leaves = 1u64 << level;
            if idx < leaves {
                return Ok(level);
            }
            idx -= leaves;
        }
        Err(WitnessError::HeightOutOfRange)
    }
}

/// Combines two sibling digests into their parent digest.
fn combine(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut concat = [0; 64];
    concat[..32].copy_from_slice(left);
    concat[32..].copy_from_slice(right);
    let result = blake2_rfc::blake2b::blake2b(32, &[], &concat);
    let mut out = [0; 32];
    out.copy_from_slice(result.as_bytes());
    out
}

/// Walks the sibling path up from `hash` at in-tree index `idx` and compares against `root`.
fn verify_path(
    witness: &[&[u8; 32]],
    root: &[u8; 32],
    hash: &[u8; 32],
    mut idx: u64,
) -> Result<(), WitnessError> {
    let mut current = *hash;
    for sibling in witness {
        if idx % 2 == 0 {
            current = combine(&current, sibling);
        } else {
            current = combine(sibling, &current);
        }
        idx /= 2;
    }

    if current == *root {
        Ok(())
    } else {
        Err(WitnessError::Mismatch)
    }
}
