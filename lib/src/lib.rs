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

//! Verification engine for cross-chain relay messages.
//!
//! This library lets a destination chain trust messages originating on a foreign source chain
//! without running a full node of that chain. The whole pipeline is pure computation over
//! already-supplied bytes: there is no I/O, no clock access, and no randomness influencing the
//! outcome. Two executions over identical inputs and identical starting state produce identical
//! outputs and state transitions.
//!
//! # Overview
//!
//! A so-called relayer (out of scope of this library) observes the source chain and periodically
//! submits a *relay message*: a batch of new block headers with finality votes, optionally a
//! membership proof for an older block, and optionally storage proofs carrying events. The
//! [`verifier::Verifier`] checks all of it against a compact, append-only summary of the source
//! chain's history (a [Merkle tree accumulator](mta)) and a rotating
//! [validator set](finality::ValidatorSet), then hands the extracted application messages back to
//! the caller in strict sequence order.
//!
//! The components, leaf to root:
//!
//! - [`relay_message`]: parses the wire payload.
//! - [`header`]: typed view of a source chain block header.
//! - [`mta`]: the accumulator over block hashes, including witness verification.
//! - [`finality`]: threshold-signature verification of finality votes.
//! - [`trie`]: verification of radix-16 trie storage proofs against a header's state root.
//! - [`events`]: per-chain-family decoding of the proven storage entries into typed events.
//! - [`verifier`]: the orchestrator tying everything together, with all-or-nothing state updates.
//!
//! For source chains whose blocks are only trusted once proven included in a separate relay
//! chain ("two-tier" chains), a block update embeds an entire relay-chain payload; see
//! [`relay_message::RelayChainDataRef`] and the [`verifier`] documentation.

#![no_std]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod chain_address;
pub mod events;
pub mod finality;
pub mod header;
pub mod mta;
pub mod relay_message;
pub mod trie;
pub mod verifier;

mod util;

pub use verifier::{Config, Error, Verifier};
