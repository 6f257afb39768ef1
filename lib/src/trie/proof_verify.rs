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

//! Verification of trie storage proofs.
//!
//! A storage proof is a list of node values. Verifying it consists in walking down the trie from
//! the root whose hash is known and trusted, matching at each step the expected Merkle value
//! against either the blake2b-256 hash of a supplied node value or, for node values shorter than
//! 32 bytes, the node value inlined in its parent. The walk follows the nibbles of the requested
//! key and ends at the node holding the storage value.

use super::{bytes_to_nibbles, trie_node, Nibble};
use crate::util;

use alloc::vec::Vec;

/// Configuration for [`verify_entry`].
pub struct Config<'a, I> {
    /// Hash of the root node of the trie, from a trusted source.
    pub trie_root_hash: &'a [u8; 32],

    /// Key whose storage value is being proven.
    pub key: &'a [u8],

    /// Iterator of node values that make up the proof.
    pub proof_nodes: I,
}

/// Verifies a storage proof and returns the storage value associated with the requested key.
pub fn verify_entry<'a>(
    config: Config<'a, impl Iterator<Item = &'a [u8]>>,
) -> Result<&'a [u8], Error> {
    // Index the proof nodes by their hash. Nodes shorter than 32 bytes never appear here, as
    // their value is inlined in their parent.
    let mut nodes_by_hash = hashbrown::HashMap::<[u8; 32], &'a [u8], _>::with_hasher(
        util::SipHasherBuild::new([0; 16]),
    );
    for node_value in config.proof_nodes {
        let hash = {
            let digest = blake2_rfc::blake2b::blake2b(32, &[], node_value);
            <[u8; 32]>::try_from(digest.as_bytes()).unwrap_or_else(|_| unreachable!())
        };
        if nodes_by_hash.insert(hash, node_value).is_some() {
            return Err(Error::DuplicateProofEntry);
        }
    }

    let key = bytes_to_nibbles(config.key.iter().copied()).collect::<Vec<_>>();
    let mut key_offset = 0;

    // Merkle value the next visited node must have. 32 bytes when the node is identified by its
    // hash, fewer when the node value was inlined in its parent.
    let mut expected_merkle_value: &'a [u8] = &config.trie_root_hash[..];

    loop {
        let node_value = if expected_merkle_value.len() == 32 {
            let hash = <&[u8; 32]>::try_from(expected_merkle_value)
                .unwrap_or_else(|_| unreachable!());
            *nodes_by_hash.get(hash).ok_or(Error::MissingProofEntry)?
        } else {
            expected_merkle_value
        };

        let decoded = trie_node::decode(node_value).map_err(Error::InvalidNodeValue)?;

        // The partial key of the visited node must be the next nibbles of the requested key.
        for partial_key_nibble in decoded.partial_key {
            if key.get(key_offset) != Some(&partial_key_nibble) {
                return Err(Error::MismatchedPartialKey);
            }
            key_offset += 1;
        }

        // Key entirely consumed. The storage value, if any, is the proven entry.
        let Some(&child_index) = key.get(key_offset) else {
            return decoded.storage_value.ok_or(Error::NoStorageValue);
        };

        // Otherwise, descend into the child corresponding to the next nibble of the key.
        match decoded.children[usize::from(child_index)] {
            Some(child_merkle_value) => {
                expected_merkle_value = child_merkle_value;
                key_offset += 1;
            }
            None => return Err(Error::MissingChild),
        }
    }
}

/// Possible error returned by [`verify_entry`].
#[derive(Debug, Clone, derive_more::Display)]
pub enum Error {
    /// Proof contains the same node value twice.
    DuplicateProofEntry,
    /// A node the key walk visits is absent from the proof.
    MissingProofEntry,
    /// One of the node values in the proof has an invalid format.
    #[display(fmt = "invalid node value: {_0}")]
    InvalidNodeValue(trie_node::Error),
    /// The partial key of a visited node diverges from the requested key.
    MismatchedPartialKey,
    /// A node on the key walk has no child at the next nibble of the requested key.
    MissingChild,
    /// The node the requested key designates has no storage value.
    NoStorageValue,
}

/// Builds the node values proving the given entry, plus the trie root hash, for a trie
/// containing exactly the given entries.
///
/// Only suitable for small tries. Intended for tests and for relayer-side tooling.
pub fn build_proof(
    entries: &[(&[u8], &[u8])],
    proven_key: &[u8],
) -> Option<(Vec<Vec<u8>>, [u8; 32])> {
    let keys = entries
        .iter()
        .map(|(key, _)| bytes_to_nibbles(key.iter().copied()).collect::<Vec<_>>())
        .collect::<Vec<_>>();

    let proven_nibbles = bytes_to_nibbles(proven_key.iter().copied()).collect::<Vec<_>>();
    let mut proof = Vec::new();
    let root_merkle = build_subtrie(entries, &keys, Vec::new(), &proven_nibbles, &mut proof, true)?;
    let root_hash = <[u8; 32]>::try_from(root_merkle.as_ref()).ok()?;
    proof.reverse();
    Some((proof, root_hash))
}

// Builds the node rooted at `prefix` and returns its Merkle value, appending to `proof` the node
// values on the path towards `proven_key` (deepest first).
fn build_subtrie(
    entries: &[(&[u8], &[u8])],
    keys: &[Vec<Nibble>],
    prefix: Vec<Nibble>,
    proven_key: &[Nibble],
    proof: &mut Vec<Vec<u8>>,
    is_root: bool,
) -> Option<trie_node::MerkleValueOutput> {
    let scoped = keys
        .iter()
        .enumerate()
        .filter(|(_, key)| key.starts_with(&prefix))
        .map(|(n, _)| n)
        .collect::<Vec<_>>();

    // The node key is the longest prefix common to all the entries below `prefix`.
    let mut node_key = keys[*scoped.first()?].clone();
    for n in &scoped {
        let common = node_key
            .iter()
            .zip(keys[*n].iter())
            .take_while(|(a, b)| a == b)
            .count();
        node_key.truncate(common);
    }

    let storage_value = scoped
        .iter()
        .find(|n| keys[**n] == node_key)
        .map(|n| entries[*n].1);

    let mut child_merkle_values: [Option<trie_node::MerkleValueOutput>; 16] =
        core::array::from_fn(|_| None);
    for child_index in 0..16u8 {
        let mut child_prefix = node_key.clone();
        child_prefix.push(Nibble::try_from(child_index).unwrap_or_else(|_| unreachable!()));
        child_merkle_values[usize::from(child_index)] =
            build_subtrie(entries, keys, child_prefix, proven_key, proof, false);
    }

    let partial_key = node_key[prefix.len()..].to_vec();
    let node_value = trie_node::encode_to_vec(trie_node::Decoded {
        partial_key: partial_key.iter().copied(),
        children: core::array::from_fn(|n| {
            child_merkle_values[n].as_ref().map(|mv| mv.as_ref().to_vec())
        }),
        storage_value,
    })
    .ok()?;

    let merkle_value = trie_node::calculate_merkle_value(
        trie_node::Decoded {
            partial_key: partial_key.iter().copied(),
            children: core::array::from_fn(|n| {
                child_merkle_values[n].as_ref().map(|mv| mv.as_ref().to_vec())
            }),
            storage_value,
        },
        is_root,
    )
    .ok()?;

    // Nodes identified by hash along the proven path are part of the proof. Inlined nodes are
    // carried by their parent.
    if proven_key.starts_with(&node_key) && merkle_value.as_ref().len() == 32 {
        proof.push(node_value);
    }

    Some(merkle_value)
}
