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

//! Radix-16 Merkle-Patricia trie.
//!
//! The source chain commits to its key-value storage with a radix-16 Merkle-Patricia trie. Each
//! block header carries the Merkle value of the root node of that trie, and a storage entry can
//! consequently be proven against a finalized header alone.
//!
//! Each node in the tree has a Merkle value associated to it. This Merkle value consists, in its
//! essence, in the combination of the storage value associated to that node and the Merkle
//! values of all of the node's children. The Merkle value of the root node therefore depends on
//! the storage values of all the nodes in the tree.
//!
//! # Keys and nodes
//!
//! A node is identified by a key, which consists in a sequence of 4-bits values called *nibbles*.
//! Example key: `[3, 12, 7, 0]`. A node A is an *ancestor* of another node B if the key of A is
//! a prefix of the key of B.
//!
//! Nodes exist only either if they contain a storage value, or if their key is the longest
//! shared prefix of two or more nodes that contain a storage value.
//!
//! # Proof of storage entry
//!
//! In the situation where we want to know the storage value associated to a node, but we only
//! know the Merkle value of the root of the trie, it is possible to ask a third-party for the
//! unhashed Merkle values of the desired node and all its ancestors. This is called a storage
//! proof. [`proof_verify::verify_entry`] checks such a proof. This is how the
//! [`Verifier`](crate::verifier::Verifier) extracts event records out of a foreign chain's
//! storage without holding any of that storage itself.

use core::iter;

mod nibble;

pub mod proof_verify;
pub mod trie_node;

pub use nibble::{bytes_to_nibbles, BytesToNibbles, Nibble, NibbleFromU8Error};

/// Returns the Merkle value of the root of an empty trie.
pub fn empty_trie_merkle_value() -> [u8; 32] {
    trie_node::calculate_merkle_value(
        trie_node::Decoded {
            children: [None::<&'static [u8]>; 16],
            partial_key: iter::empty(),
            storage_value: None,
        },
        true,
    )
    .unwrap_or_else(|_| panic!())
    .try_into()
    // Guaranteed to never panic when `is_root_node` is `true`.
    .unwrap_or_else(|_| panic!())
}
