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

//! Relay message wire format.
//!
//! The payload submitted by a relayer is a nested, length-prefixed list structure:
//!
//! - A list of *block updates*, each carrying an encoded header, optionally finality votes, and,
//!   for two-tier chains, optionally an embedded relay-chain payload
//!   ([`RelayChainDataRef`]).
//! - An optional *block proof*: a header already within the tracked range together with a Merkle
//!   witness against the accumulator.
//! - A list of *state proofs*: trie membership proofs for storage entries under a proven
//!   header's state root.
//!
//! Lengths and counts use the SCALE compact encoding, options a single `0`/`1` byte prefix.
//! Decoding never copies: all types in this module borrow from the input buffer.
//!
//! The decoder only checks structure. Semantic requirements, such as the presence of at least
//! one piece of update evidence, are enforced by [`crate::verifier`].

use crate::util;

use alloc::vec::Vec;
use core::fmt;

/// Length in bytes of an encoded vote message: prefix, target hash, target number (little-endian
/// `u32`), round (little-endian `u64`), and validator set id (little-endian `u64`).
pub const VOTE_MESSAGE_ENCODED_LEN: usize = 1 + 32 + 4 + 8 + 8;

/// Attempt to decode the given encoded relay message.
pub fn decode(encoded: &[u8]) -> Result<RelayMessageRef, DecodeError> {
    match nom::combinator::complete(nom::combinator::all_consuming(relay_message))(encoded) {
        Ok((_, message)) => Ok(message),
        Err(nom::Err::Error(err) | nom::Err::Failure(err)) => Err(DecodeError(err.code)),
        Err(_) => unreachable!(),
    }
}

/// Decoded relay message, borrowing the encoded payload.
#[derive(Debug, Clone)]
pub struct RelayMessageRef<'a> {
    pub block_updates: Vec<BlockUpdateRef<'a>>,
    pub block_proof: Option<BlockProofRef<'a>>,
    pub state_proofs: Vec<StateProofRef<'a>>,
}

/// A new block of the tracked chain, submitted for inclusion in the accumulator.
#[derive(Debug, Clone)]
pub struct BlockUpdateRef<'a> {
    /// Encoded header of the new block. `None` only for the degenerate update that carries
    /// nothing but relay chain data (validator set rotation without tracked-chain progress).
    pub header: Option<&'a [u8]>,
    /// Finality votes over this block. Only required on the last update of a batch.
    pub votes: Option<VotesRef<'a>>,
    /// Embedded relay-chain payload proving inclusion of this block at the outer layer.
    /// Only present for two-tier chains.
    pub relay_chain_data: Option<RelayChainDataRef<'a>>,
}

/// Embedded relay-chain payload of a two-tier chain.
///
/// Shaped like a relay message of its own, but the recursion stops here: block updates at this
/// level can carry votes, never further nested chain data.
#[derive(Debug, Clone)]
pub struct RelayChainDataRef<'a> {
    pub block_updates: Vec<RelayBlockUpdateRef<'a>>,
    pub block_proof: Option<BlockProofRef<'a>>,
    pub state_proofs: Vec<StateProofRef<'a>>,
}

/// A new block of the relay-chain layer.
#[derive(Debug, Clone)]
pub struct RelayBlockUpdateRef<'a> {
    /// Encoded header of the new relay-chain block.
    pub header: &'a [u8],
    /// Finality votes over this block. Only required on the last update of a batch.
    pub votes: Option<VotesRef<'a>>,
}

/// Finality votes: one canonical vote message and the signatures of the validators that
/// signed it.
#[derive(Debug, Clone)]
pub struct VotesRef<'a> {
    /// Hash of the block being finalized, as carried by the vote message.
    pub target_hash: &'a [u8; 32],
    /// Height of the block being finalized, as carried by the vote message.
    pub target_number: u64,
    /// Consensus round of the vote.
    pub round: u64,
    /// Validator set id the signers claim to belong to.
    pub set_id: u64,
    /// The raw vote message, exactly [`VOTE_MESSAGE_ENCODED_LEN`] bytes. Every signature is
    /// over these bytes.
    pub message: &'a [u8],
    /// `(signature, signer public key)` pairs.
    pub signatures: Vec<(&'a [u8; 64], &'a [u8; 32])>,
}

/// Proof that a single block, not part of the current update batch, is a member of the
/// accumulator.
#[derive(Debug, Clone)]
pub struct BlockProofRef<'a> {
    /// Encoded header of the proven block.
    pub header: &'a [u8],
    /// Accumulator height observed by the relayer when the witness was built.
    pub accumulator_height: u64,
    /// Sibling hashes of the Merkle inclusion path, leaf to root.
    pub witness: Vec<&'a [u8; 32]>,
}

/// Trie membership proof for one storage entry.
#[derive(Debug, Clone)]
pub struct StateProofRef<'a> {
    /// Storage key being proven.
    pub key: &'a [u8],
    /// Trie node values, in no particular order. See [`crate::trie::proof_verify`].
    pub proof_nodes: Vec<&'a [u8]>,
}

/// Potential error when decoding a relay message.
#[derive(Debug, derive_more::Display)]
#[display(fmt = "Relay message parsing error: {_0:?}")]
pub struct DecodeError(nom::error::ErrorKind);

/// `Nom` combinator that parses a whole relay message.
fn relay_message(bytes: &[u8]) -> nom::IResult<&[u8], RelayMessageRef> {
    nom::error::context(
        "relay_message",
        nom::combinator::map(
            nom::sequence::tuple((
                nom_list(block_update),
                nom_option(block_proof),
                nom_list(state_proof),
            )),
            |(block_updates, block_proof, state_proofs)| RelayMessageRef {
                block_updates,
                block_proof,
                state_proofs,
            },
        ),
    )(bytes)
}

fn block_update(bytes: &[u8]) -> nom::IResult<&[u8], BlockUpdateRef> {
    nom::error::context(
        "block_update",
        nom::combinator::map(
            nom::sequence::tuple((
                nom_option(nom_bytes),
                nom_option(votes),
                nom_option(relay_chain_data),
            )),
            |(header, votes, relay_chain_data)| BlockUpdateRef {
                header,
                votes,
                relay_chain_data,
            },
        ),
    )(bytes)
}

fn relay_chain_data(bytes: &[u8]) -> nom::IResult<&[u8], RelayChainDataRef> {
    nom::error::context(
        "relay_chain_data",
        nom::combinator::map(
            nom::sequence::tuple((
                nom_list(relay_block_update),
                nom_option(block_proof),
                nom_list(state_proof),
            )),
            |(block_updates, block_proof, state_proofs)| RelayChainDataRef {
                block_updates,
                block_proof,
                state_proofs,
            },
        ),
    )(bytes)
}

fn relay_block_update(bytes: &[u8]) -> nom::IResult<&[u8], RelayBlockUpdateRef> {
    nom::error::context(
        "relay_block_update",
        nom::combinator::map(
            nom::sequence::tuple((nom_bytes, nom_option(votes))),
            |(header, votes)| RelayBlockUpdateRef { header, votes },
        ),
    )(bytes)
}

fn votes(bytes: &[u8]) -> nom::IResult<&[u8], VotesRef> {
    nom::error::context(
        "votes",
        nom::combinator::map_opt(
            nom::sequence::tuple((
                nom_bytes,
                nom::combinator::flat_map(util::nom_scale_compact_usize, |num_elems| {
                    nom::multi::many_m_n(
                        num_elems,
                        num_elems,
                        nom::combinator::map(
                            nom::sequence::tuple((
                                nom::bytes::streaming::take(64u32),
                                nom::bytes::streaming::take(32u32),
                            )),
                            |(sig, pubkey): (&[u8], &[u8])| {
                                (
                                    <&[u8; 64]>::try_from(sig).unwrap(),
                                    <&[u8; 32]>::try_from(pubkey).unwrap(),
                                )
                            },
                        ),
                    )
                }),
            )),
            |(message, signatures)| {
                let fields = vote_message_fields(message)?;
                Some(VotesRef {
                    target_hash: fields.0,
                    target_number: fields.1,
                    round: fields.2,
                    set_id: fields.3,
                    message,
                    signatures,
                })
            },
        ),
    )(bytes)
}

fn block_proof(bytes: &[u8]) -> nom::IResult<&[u8], BlockProofRef> {
    nom::error::context(
        "block_proof",
        nom::combinator::map(
            nom::sequence::tuple((
                nom_bytes,
                util::nom_scale_compact_u64,
                nom::combinator::flat_map(util::nom_scale_compact_usize, |num_elems| {
                    nom::multi::many_m_n(
                        num_elems,
                        num_elems,
                        nom::combinator::map(
                            nom::bytes::streaming::take(32u32),
                            |hash: &[u8]| <&[u8; 32]>::try_from(hash).unwrap(),
                        ),
                    )
                }),
            )),
            |(header, accumulator_height, witness)| BlockProofRef {
                header,
                accumulator_height,
                witness,
            },
        ),
    )(bytes)
}

fn state_proof(bytes: &[u8]) -> nom::IResult<&[u8], StateProofRef> {
    nom::error::context(
        "state_proof",
        nom::combinator::map(
            nom::sequence::tuple((nom_bytes, nom_list(nom_bytes))),
            |(key, proof_nodes)| StateProofRef { key, proof_nodes },
        ),
    )(bytes)
}

/// Parses the fields out of an encoded vote message. Returns `None` if the message is malformed.
fn vote_message_fields(message: &[u8]) -> Option<(&[u8; 32], u64, u64, u64)> {
    if message.len() != VOTE_MESSAGE_ENCODED_LEN || message[0] != 0x01 {
        return None;
    }

    let target_hash = <&[u8; 32]>::try_from(&message[1..33]).unwrap();
    let target_number = u64::from(u32::from_le_bytes(
        <[u8; 4]>::try_from(&message[33..37]).unwrap(),
    ));
    let round = u64::from_le_bytes(<[u8; 8]>::try_from(&message[37..45]).unwrap());
    let set_id = u64::from_le_bytes(<[u8; 8]>::try_from(&message[45..53]).unwrap());
    Some((target_hash, target_number, round, set_id))
}

/// `Nom` combinator that parses a length-prefixed byte string.
fn nom_bytes(bytes: &[u8]) -> nom::IResult<&[u8], &[u8]> {
    nom::multi::length_data(util::nom_scale_compact_usize)(bytes)
}

/// `Nom` combinator that parses a SCALE `Option`.
fn nom_option<'a, O>(
    inner: impl FnMut(&'a [u8]) -> nom::IResult<&'a [u8], O>,
) -> impl FnMut(&'a [u8]) -> nom::IResult<&'a [u8], Option<O>> {
    nom::branch::alt((
        nom::combinator::map(nom::bytes::streaming::tag(&[0][..]), |_| None),
        nom::combinator::map(
            nom::sequence::preceded(nom::bytes::streaming::tag(&[1][..]), inner),
            Some,
        ),
    ))
}

/// `Nom` combinator that parses a count-prefixed list.
fn nom_list<'a, O>(
    inner: impl FnMut(&'a [u8]) -> nom::IResult<&'a [u8], O> + Copy,
) -> impl FnMut(&'a [u8]) -> nom::IResult<&'a [u8], Vec<O>> {
    nom::combinator::flat_map(util::nom_scale_compact_usize, move |num_elems| {
        nom::multi::many_m_n(num_elems, num_elems, inner)
    })
}

// Encoding counterparts. These exist for the benefit of relayers and of the tests; the verifier
// itself never encodes a relay message.

/// Owned equivalent of [`RelayMessageRef`]. Used to build payloads.
#[derive(Debug, Clone, Default)]
pub struct RelayMessage {
    pub block_updates: Vec<BlockUpdate>,
    pub block_proof: Option<BlockProof>,
    pub state_proofs: Vec<StateProof>,
}

/// Owned equivalent of [`BlockUpdateRef`].
#[derive(Debug, Clone, Default)]
pub struct BlockUpdate {
    pub header: Option<Vec<u8>>,
    pub votes: Option<Votes>,
    pub relay_chain_data: Option<RelayChainData>,
}

/// Owned equivalent of [`RelayChainDataRef`].
#[derive(Debug, Clone, Default)]
pub struct RelayChainData {
    pub block_updates: Vec<RelayBlockUpdate>,
    pub block_proof: Option<BlockProof>,
    pub state_proofs: Vec<StateProof>,
}

/// Owned equivalent of [`RelayBlockUpdateRef`].
#[derive(Debug, Clone)]
pub struct RelayBlockUpdate {
    pub header: Vec<u8>,
    pub votes: Option<Votes>,
}

/// Owned equivalent of [`VotesRef`].
#[derive(Debug, Clone)]
pub struct Votes {
    pub message: Vec<u8>,
    pub signatures: Vec<([u8; 64], [u8; 32])>,
}

/// Owned equivalent of [`BlockProofRef`].
#[derive(Debug, Clone)]
pub struct BlockProof {
    pub header: Vec<u8>,
    pub accumulator_height: u64,
    pub witness: Vec<[u8; 32]>,
}

/// Owned equivalent of [`StateProofRef`].
#[derive(Debug, Clone)]
pub struct StateProof {
    pub key: Vec<u8>,
    pub proof_nodes: Vec<Vec<u8>>,
}

impl RelayMessage {
    /// Returns the wire encoding of this relay message.
    pub fn scale_encoding_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        encode_list(&mut out, &self.block_updates, |out, u| u.encode(out));
        encode_option(&mut out, self.block_proof.as_ref(), |out, p| p.encode(out));
        encode_list(&mut out, &self.state_proofs, |out, p| p.encode(out));
        out
    }
}

impl BlockUpdate {
    fn encode(&self, out: &mut Vec<u8>) {
        encode_option(&mut *out, self.header.as_deref(), encode_bytes);
        encode_option(&mut *out, self.votes.as_ref(), |out, v| v.encode(out));
        encode_option(&mut *out, self.relay_chain_data.as_ref(), |out, d| {
            d.encode(out)
        });
    }
}

impl RelayChainData {
    fn encode(&self, out: &mut Vec<u8>) {
        encode_list(&mut *out, &self.block_updates, |out, u| {
            encode_bytes(out, &u.header);
            encode_option(out, u.votes.as_ref(), |out, v| v.encode(out));
        });
        encode_option(&mut *out, self.block_proof.as_ref(), |out, p| p.encode(out));
        encode_list(&mut *out, &self.state_proofs, |out, p| p.encode(out));
    }
}

impl Votes {
    fn encode(&self, out: &mut Vec<u8>) {
        encode_bytes(&mut *out, &self.message);
        out.extend_from_slice(util::encode_scale_compact_usize(self.signatures.len()).as_ref());
        for (signature, public_key) in &self.signatures {
            out.extend_from_slice(signature);
            out.extend_from_slice(public_key);
        }
    }
}

impl BlockProof {
    fn encode(&self, out: &mut Vec<u8>) {
        encode_bytes(&mut *out, &self.header);
        out.extend_from_slice(
            util::encode_scale_compact_usize(usize::try_from(self.accumulator_height).unwrap())
                .as_ref(),
        );
        out.extend_from_slice(util::encode_scale_compact_usize(self.witness.len()).as_ref());
        for hash in &self.witness {
            out.extend_from_slice(hash);
        }
    }
}

impl StateProof {
    fn encode(&self, out: &mut Vec<u8>) {
        encode_bytes(&mut *out, &self.key);
        out.extend_from_slice(util::encode_scale_compact_usize(self.proof_nodes.len()).as_ref());
        for node in &self.proof_nodes {
            encode_bytes(&mut *out, node);
        }
    }
}

fn encode_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(util::encode_scale_compact_usize(bytes.len()).as_ref());
    out.extend_from_slice(bytes);
}

fn encode_option<T>(out: &mut Vec<u8>, value: Option<T>, encode: impl FnOnce(&mut Vec<u8>, T)) {
    match value {
        None => out.push(0),
        Some(value) => {
            out.push(1);
            encode(out, value);
        }
    }
}

fn encode_list<T>(out: &mut Vec<u8>, values: &[T], mut encode: impl FnMut(&mut Vec<u8>, &T)) {
    out.extend_from_slice(util::encode_scale_compact_usize(values.len()).as_ref());
    for value in values {
        encode(out, value);
    }
}

/// Returns the canonical encoding of a vote message over the given block.
pub fn encode_vote_message(
    target_hash: &[u8; 32],
    target_number: u64,
    round: u64,
    set_id: u64,
) -> [u8; VOTE_MESSAGE_ENCODED_LEN] {
    let mut message = [0; VOTE_MESSAGE_ENCODED_LEN];
    // The `1` prefix indicates which kind of message is being signed.
    message[0] = 0x01;
    message[1..33].copy_from_slice(target_hash);
    message[33..37].copy_from_slice(&u32::try_from(target_number).unwrap().to_le_bytes());
    message[37..45].copy_from_slice(&round.to_le_bytes());
    message[45..53].copy_from_slice(&set_id.to_le_bytes());
    message
}

impl<'a> fmt::Display for RelayMessageRef<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} block update(s), {} block proof, {} state proof(s)",
            self.block_updates.len(),
            if self.block_proof.is_some() { "1" } else { "no" },
            self.state_proofs.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header;

    fn dummy_header(number: u64) -> Vec<u8> {
        header::BlockHeader {
            parent_hash: [u8::try_from(number % 251).unwrap(); 32],
            number,
            state_root: [0x11; 32],
        }
        .scale_encoding_vec()
    }

    #[test]
    fn roundtrip_full_message() {
        let message = RelayMessage {
            block_updates: alloc::vec![
                BlockUpdate {
                    header: Some(dummy_header(10)),
                    votes: None,
                    relay_chain_data: None,
                },
                BlockUpdate {
                    header: Some(dummy_header(11)),
                    votes: Some(Votes {
                        message: encode_vote_message(&[0xaa; 32], 11, 4, 7).to_vec(),
                        signatures: alloc::vec![([0x3c; 64], [0x7b; 32])],
                    }),
                    relay_chain_data: Some(RelayChainData {
                        block_updates: alloc::vec![RelayBlockUpdate {
                            header: dummy_header(900),
                            votes: Some(Votes {
                                message: encode_vote_message(&[0xbb; 32], 900, 1, 2).to_vec(),
                                signatures: alloc::vec![([0x01; 64], [0x02; 32])],
                            }),
                        }],
                        block_proof: None,
                        state_proofs: alloc::vec![StateProof {
                            key: alloc::vec![0xde, 0xad],
                            proof_nodes: alloc::vec![alloc::vec![1, 2, 3]],
                        }],
                    }),
                },
            ],
            block_proof: Some(BlockProof {
                header: dummy_header(5),
                accumulator_height: 11,
                witness: alloc::vec![[0xcc; 32], [0xdd; 32]],
            }),
            state_proofs: alloc::vec![StateProof {
                key: alloc::vec![0x26, 0xaa],
                proof_nodes: alloc::vec![alloc::vec![9, 9], alloc::vec![8]],
            }],
        };

        let encoded = message.scale_encoding_vec();
        let decoded = decode(&encoded).unwrap();

        assert_eq!(decoded.block_updates.len(), 2);
        assert!(decoded.block_updates[0].votes.is_none());
        let votes = decoded.block_updates[1].votes.as_ref().unwrap();
        assert_eq!(votes.target_hash, &[0xaa; 32]);
        assert_eq!(votes.target_number, 11);
        assert_eq!(votes.round, 4);
        assert_eq!(votes.set_id, 7);
        assert_eq!(votes.signatures.len(), 1);

        let relay_data = decoded.block_updates[1].relay_chain_data.as_ref().unwrap();
        assert_eq!(relay_data.block_updates.len(), 1);
        assert_eq!(relay_data.state_proofs[0].key, &[0xde, 0xad][..]);

        let proof = decoded.block_proof.as_ref().unwrap();
        assert_eq!(proof.accumulator_height, 11);
        assert_eq!(proof.witness, alloc::vec![&[0xcc; 32], &[0xdd; 32]]);

        assert_eq!(decoded.state_proofs.len(), 1);
        assert_eq!(decoded.state_proofs[0].proof_nodes.len(), 2);
    }

    #[test]
    fn empty_message_is_structurally_valid() {
        // Evidence presence is a protocol-level concern, not a wire-format one.
        let encoded = RelayMessage::default().scale_encoding_vec();
        let decoded = decode(&encoded).unwrap();
        assert!(decoded.block_updates.is_empty());
        assert!(decoded.block_proof.is_none());
        assert!(decoded.state_proofs.is_empty());
    }

    #[test]
    fn truncated_message_rejected() {
        let encoded = RelayMessage {
            block_updates: alloc::vec![BlockUpdate {
                header: Some(dummy_header(1)),
                votes: None,
                relay_chain_data: None,
            }],
            ..Default::default()
        }
        .scale_encoding_vec();

        assert!(decode(&encoded[..encoded.len() - 3]).is_err());
    }

    #[test]
    fn superfluous_bytes_rejected() {
        let mut encoded = RelayMessage::default().scale_encoding_vec();
        encoded.push(0xff);
        assert!(decode(&encoded).is_err());
    }

    #[test]
    fn malformed_vote_message_rejected() {
        let encoded = RelayMessage {
            block_updates: alloc::vec![BlockUpdate {
                header: Some(dummy_header(1)),
                votes: Some(Votes {
                    // One byte short of a valid vote message.
                    message: alloc::vec![0x01; VOTE_MESSAGE_ENCODED_LEN - 1],
                    signatures: alloc::vec![],
                }),
                relay_chain_data: None,
            }],
            ..Default::default()
        }
        .scale_encoding_vec();

        assert!(decode(&encoded).is_err());
    }

    #[test]
    fn wrong_vote_message_prefix_rejected() {
        let mut message = encode_vote_message(&[0; 32], 1, 1, 1).to_vec();
        message[0] = 0x02;

        let encoded = RelayMessage {
            block_updates: alloc::vec![BlockUpdate {
                header: Some(dummy_header(1)),
                votes: Some(Votes {
                    message,
                    signatures: alloc::vec![],
                }),
                relay_chain_data: None,
            }],
            ..Default::default()
        }
        .scale_encoding_vec();

        assert!(decode(&encoded).is_err());
    }
}
