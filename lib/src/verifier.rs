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

//! Orchestration of the whole verification pipeline.
//!
//! A [`Verifier`] tracks one source chain on behalf of a message center: it owns that chain's
//! accumulator (and, for two-tier chains, the relay layer's), the current validator set, and the
//! height of the last block that yielded messages. [`Verifier::handle_relay_message`] is the
//! single entry point. It runs, in order:
//!
//! 1. Address and network access checks.
//! 2. Wire decoding ([`crate::relay_message`]).
//! 3. Block updates: header continuity, finality evidence on the last update of the batch
//!    (either votes, or for two-tier chains an embedded relay-chain payload proving inclusion),
//!    then one accumulator append per header.
//! 4. Block proof: witness verification of a header already within the tracked range.
//! 5. State proofs against the proven header's state root, event extraction, validator set
//!    rotation, and the message sequence gate.
//!
//! All mutations are performed on a clone of the verifier's state, committed only when every
//! step has succeeded. A failed call therefore leaves the verifier byte-identical to its
//! pre-call state, no matter how far the pipeline had progressed.
//!
//! The pipeline is pure computation over already-supplied bytes. There is no I/O, no clock
//! access, and no nondeterminism: two runs over the same inputs and starting state produce the
//! same outputs and state transitions.

use crate::{
    chain_address::ChainAddress,
    events::{Event, EventsDecoder},
    finality::{self, ValidatorSet},
    header,
    mta::{self, MerkleTreeAccumulator},
    relay_message, trie,
};

use alloc::{boxed::Box, string::String, string::ToString as _, vec::Vec};

/// Configuration for a new [`Verifier`].
pub struct Config {
    /// Address of the message center this verifier guards. Calls on behalf of any other address
    /// are rejected.
    pub bmc: ChainAddress,

    /// Network id of the source chain. Messages relayed from any other network are rejected.
    pub network: String,

    /// Initial state of the source chain's accumulator, anchored at the trust point.
    pub accumulator: mta::Config,

    /// Validator set in effect at the trust point. For two-tier chains, the relay layer's.
    pub validators: ValidatorSet,

    /// Decoder for the event records of the source chain's family.
    pub events_decoder: Box<dyn EventsDecoder>,

    /// Storage key under which the source chain keeps its event records.
    pub event_storage_key: Vec<u8>,

    /// `Some` if the source chain is two-tier, i.e. its blocks are only trusted once proven
    /// included in a relay layer's finalized state.
    pub relay_layer: Option<RelayLayerConfig>,

    /// Seed for a PRNG used during signature verification. The outcome of the verification
    /// doesn't depend on it.
    pub randomness_seed: [u8; 32],
}

/// Relay-layer parameters of a two-tier chain. See [`Config::relay_layer`].
pub struct RelayLayerConfig {
    /// Initial state of the relay layer's accumulator.
    pub accumulator: mta::Config,

    /// Id under which the tracked chain is registered at the relay layer. Inclusion events are
    /// matched against this value.
    pub para_id: u32,

    /// Decoder for the event records of the relay layer's family.
    pub events_decoder: Box<dyn EventsDecoder>,
}

/// Verifies relay messages against the history of one source chain.
pub struct Verifier {
    bmc: ChainAddress,
    network: String,
    event_storage_key: Vec<u8>,
    events_decoder: Box<dyn EventsDecoder>,
    relay: Option<RelayLayer>,
    randomness_seed: [u8; 32],
    state: State,
}

struct RelayLayer {
    para_id: u32,
    events_decoder: Box<dyn EventsDecoder>,
}

/// Everything [`Verifier::handle_relay_message`] mutates. Cloned at the start of each call and
/// committed on success only.
#[derive(Clone)]
struct State {
    chain_mta: MerkleTreeAccumulator,
    relay_mta: Option<MerkleTreeAccumulator>,
    validators: ValidatorSet,
    last_height: u64,
}

impl Verifier {
    /// Builds a new verifier from the given trust point.
    pub fn new(config: Config) -> Verifier {
        let last_height = config.accumulator.offset;
        Verifier {
            bmc: config.bmc,
            network: config.network,
            event_storage_key: config.event_storage_key,
            events_decoder: config.events_decoder,
            randomness_seed: config.randomness_seed,
            state: State {
                chain_mta: MerkleTreeAccumulator::new(config.accumulator),
                relay_mta: config
                    .relay_layer
                    .as_ref()
                    .map(|relay| MerkleTreeAccumulator::new(relay.accumulator.clone())),
                validators: config.validators,
                last_height,
            },
            relay: config.relay_layer.map(|relay| RelayLayer {
                para_id: relay.para_id,
                events_decoder: relay.events_decoder,
            }),
        }
    }

    /// Accumulator of the tracked chain.
    pub fn accumulator(&self) -> &MerkleTreeAccumulator {
        &self.state.chain_mta
    }

    /// Accumulator of the relay layer, if the tracked chain is two-tier.
    pub fn relay_accumulator(&self) -> Option<&MerkleTreeAccumulator> {
        self.state.relay_mta.as_ref()
    }

    /// Validator set currently in effect.
    pub fn validators(&self) -> &ValidatorSet {
        &self.state.validators
    }

    /// Height of the most recent block whose state proofs yielded messages.
    pub fn last_height(&self) -> u64 {
        self.state.last_height
    }

    /// Verifies a relay message and returns the payloads of the messages it carries, in
    /// sequence order.
    ///
    /// `bmc` is the address of the message center making the call, `prev` the address of the
    /// message center the message was relayed from, and `seq` the sequence number of the last
    /// message accepted over this link. The first extracted message must carry `seq + 1`, the
    /// next one `seq + 2`, and so on.
    ///
    /// On error, the state of the verifier is left untouched.
    pub fn handle_relay_message(
        &mut self,
        bmc: &ChainAddress,
        prev: &ChainAddress,
        seq: u64,
        payload: &[u8],
    ) -> Result<Vec<Vec<u8>>, Error> {
        if prev.network() != self.network {
            return Err(Error::NotAcceptedFromNetwork);
        }
        if *bmc != self.bmc {
            return Err(Error::NotAcceptedBmcAddress);
        }

        let message = relay_message::decode(payload).map_err(Error::Decode)?;
        if message.block_updates.is_empty() && message.block_proof.is_none() {
            return Err(Error::Protocol(ProtocolError::MissingEvidence));
        }

        // Every mutation below goes through this clone. It replaces `self.state` only once the
        // whole message has been accepted.
        let mut state = self.state.clone();

        let num_updates = message.block_updates.len();
        let mut last_update_header = None;
        for (update_index, update) in message.block_updates.iter().enumerate() {
            let is_last = update_index + 1 == num_updates;

            let Some(encoded_header) = update.header else {
                // Degenerate update: no tracked-chain progress, only a relay-layer payload,
                // typically a validator set rotation. Only allowed as the sole update of the
                // batch: in any other position it would exempt a real header from the
                // last-update finality check.
                if num_updates != 1 {
                    return Err(Error::Protocol(ProtocolError::MissingEvidence));
                }
                let relay_chain_data = update
                    .relay_chain_data
                    .as_ref()
                    .ok_or(Error::Protocol(ProtocolError::MissingEvidence))?;
                self.process_relay_chain_data(&mut state, relay_chain_data)?;
                continue;
            };

            let header = header::decode(encoded_header).map_err(Error::InvalidHeader)?;
            check_continuity(&state.chain_mta, &header)?;

            if is_last {
                if let Some(votes) = &update.votes {
                    finality::verify_finality(finality::VerifyConfig {
                        votes,
                        expected_block_hash: header.hash(),
                        expected_block_number: header.number,
                        validators: &state.validators,
                        randomness_seed: self.randomness_seed,
                    })
                    .map_err(Error::InvalidVotes)?;
                } else if let Some(relay_chain_data) = &update.relay_chain_data {
                    // Two-tier finality: the relay layer must prove that this very header was
                    // included under the id our chain is registered with.
                    let included = self.process_relay_chain_data(&mut state, relay_chain_data)?;
                    let para_id = self
                        .relay
                        .as_ref()
                        .map(|relay| relay.para_id)
                        .unwrap_or_else(|| unreachable!());
                    let header_hash = header.hash();
                    if !included
                        .iter()
                        .any(|(id, head)| *id == para_id && *head == header_hash)
                    {
                        return Err(Error::Protocol(ProtocolError::InclusionMismatch));
                    }
                } else {
                    return Err(Error::MissingVotes);
                }
            } else if let Some(relay_chain_data) = &update.relay_chain_data {
                self.process_relay_chain_data(&mut state, relay_chain_data)?;
            }

            state.chain_mta.add(header.hash());
            last_update_header = Some(header);
        }

        // The header whose state root the state proofs are checked against: the block proof's
        // when present, the last appended header otherwise.
        let proven_header = match &message.block_proof {
            Some(block_proof) => Some(verify_block_proof(&state.chain_mta, block_proof)?),
            None => last_update_header,
        };

        let mut extracted = Vec::new();
        if !message.state_proofs.is_empty() {
            let proven_header =
                proven_header.ok_or(Error::Protocol(ProtocolError::MissingEvidence))?;
            let events = self.decode_proven_events(
                &message.state_proofs,
                proven_header.state_root,
                &*self.events_decoder,
            )?;

            let own_address = self.bmc.to_string();
            for event in events {
                match event {
                    Event::NewAuthorities { set_id, validators } => {
                        apply_new_authorities(&mut state.validators, set_id, validators);
                    }
                    Event::Message {
                        next_hop,
                        sequence,
                        payload,
                    } if next_hop == own_address => {
                        let expected = seq
                            + 1
                            + u64::try_from(extracted.len()).unwrap_or_else(|_| unreachable!());
                        if sequence > expected {
                            return Err(Error::InvalidSequenceHigher {
                                expected,
                                found: sequence,
                            });
                        }
                        if sequence < expected {
                            return Err(Error::InvalidSequence {
                                expected,
                                found: sequence,
                            });
                        }
                        extracted.push(payload);
                    }
                    _ => {}
                }
            }

            if !extracted.is_empty() {
                state.last_height = proven_header.number;
            }
        }

        self.state = state;
        Ok(extracted)
    }

    /// Verifies an embedded relay-chain payload and returns the inclusion events it proves, as
    /// `(para_id, para_head)` pairs. Validator set rotations proven at this layer are applied
    /// to `state` directly.
    fn process_relay_chain_data(
        &self,
        state: &mut State,
        data: &relay_message::RelayChainDataRef,
    ) -> Result<Vec<(u32, [u8; 32])>, Error> {
        let relay = self
            .relay
            .as_ref()
            .ok_or(Error::Protocol(ProtocolError::UnexpectedRelayChainData))?;
        // `relay_mta` exists if and only if `self.relay` does. See `Verifier::new`.
        let relay_mta = state
            .relay_mta
            .as_mut()
            .unwrap_or_else(|| unreachable!());

        let num_updates = data.block_updates.len();
        let mut last_update_header = None;
        for (update_index, update) in data.block_updates.iter().enumerate() {
            let header = header::decode(update.header).map_err(Error::InvalidHeader)?;
            check_continuity(relay_mta, &header)?;

            if update_index + 1 == num_updates {
                let votes = update.votes.as_ref().ok_or(Error::MissingVotes)?;
                finality::verify_finality(finality::VerifyConfig {
                    votes,
                    expected_block_hash: header.hash(),
                    expected_block_number: header.number,
                    validators: &state.validators,
                    randomness_seed: self.randomness_seed,
                })
                .map_err(Error::InvalidVotes)?;
            }

            relay_mta.add(header.hash());
            last_update_header = Some(header);
        }

        let proven_header = match &data.block_proof {
            Some(block_proof) => Some(verify_block_proof(relay_mta, block_proof)?),
            None => last_update_header,
        };

        let mut included = Vec::new();
        if !data.state_proofs.is_empty() {
            let proven_header =
                proven_header.ok_or(Error::Protocol(ProtocolError::MissingEvidence))?;
            let events = self.decode_proven_events(
                &data.state_proofs,
                proven_header.state_root,
                &*relay.events_decoder,
            )?;

            for event in events {
                match event {
                    Event::NewAuthorities { set_id, validators } => {
                        apply_new_authorities(&mut state.validators, set_id, validators);
                    }
                    Event::CandidateIncluded { para_id, para_head } => {
                        included.push((para_id, para_head));
                    }
                    _ => {}
                }
            }
        }

        Ok(included)
    }

    /// Verifies every state proof against `state_root` and decodes the event records found
    /// under the registered event storage key. Proofs for other keys are verified then ignored.
    fn decode_proven_events(
        &self,
        state_proofs: &[relay_message::StateProofRef],
        state_root: &[u8; 32],
        decoder: &dyn EventsDecoder,
    ) -> Result<Vec<Event>, Error> {
        let mut out = Vec::new();
        for proof in state_proofs {
            let value = trie::proof_verify::verify_entry(trie::proof_verify::Config {
                trie_root_hash: state_root,
                key: proof.key,
                proof_nodes: proof.proof_nodes.iter().copied(),
            })
            .map_err(Error::InvalidTrieProof)?;

            if proof.key == &self.event_storage_key[..] {
                out.extend(decoder.decode_events(value).map_err(Error::InvalidEvents)?);
            }
        }
        Ok(out)
    }
}

/// Checks that `header` is the next block of the chain summarized by `accumulator`.
fn check_continuity(
    accumulator: &MerkleTreeAccumulator,
    header: &header::BlockHeaderRef,
) -> Result<(), Error> {
    let expected = accumulator.height() + 1;
    if header.number > expected {
        return Err(Error::InvalidBlockUpdateHeightHigher {
            expected,
            found: header.number,
        });
    }
    if header.number < expected {
        return Err(Error::InvalidBlockUpdateHeightLower {
            expected,
            found: header.number,
        });
    }
    if header.parent_hash != accumulator.last_block_hash() {
        return Err(Error::Protocol(ProtocolError::ParentHashMismatch));
    }
    Ok(())
}

/// Checks a block proof against the accumulator and returns its decoded header.
///
/// The header hash is recomputed from the encoded header bytes, never taken from the proof, so
/// that a witness can't be replayed for a substituted header.
fn verify_block_proof<'a>(
    accumulator: &MerkleTreeAccumulator,
    block_proof: &relay_message::BlockProofRef<'a>,
) -> Result<header::BlockHeaderRef<'a>, Error> {
    let header = header::decode(block_proof.header).map_err(Error::InvalidHeader)?;
    if header.number > accumulator.height() {
        return Err(Error::InvalidBlockProofHeightHigher {
            current: accumulator.height(),
            found: header.number,
        });
    }
    accumulator
        .verify_witness(
            &block_proof.witness,
            &header.hash(),
            header.number,
            block_proof.accumulator_height,
        )
        .map_err(Error::InvalidWitness)?;
    Ok(header)
}

/// Applies a proven validator set change. A `set_id` at or below the current one is a no-op:
/// the change it describes has already been applied, replaying it must not roll the roster back.
fn apply_new_authorities(validators: &mut ValidatorSet, set_id: u64, keys: Vec<[u8; 32]>) {
    if set_id <= validators.set_id {
        return;
    }
    *validators = ValidatorSet { keys, set_id };
}

/// Error potentially returned by [`Verifier::handle_relay_message`].
///
/// Every error aborts the whole invocation. None of them mutates the verifier.
#[derive(Debug, derive_more::Display)]
pub enum Error {
    /// Malformed relay message payload.
    #[display(fmt = "{_0}")]
    Decode(relay_message::DecodeError),
    /// Malformed encoded header inside the payload.
    #[display(fmt = "{_0}")]
    InvalidHeader(header::DecodeError),
    /// The message was relayed from a network this verifier is not bound to.
    NotAcceptedFromNetwork,
    /// The calling message center is not the registered one.
    NotAcceptedBmcAddress,
    /// Structural protocol violation.
    #[display(fmt = "{_0}")]
    Protocol(ProtocolError),
    /// A block update's height is above the next height of the chain.
    #[display(fmt = "block update at height {found}, expected {expected}")]
    InvalidBlockUpdateHeightHigher { expected: u64, found: u64 },
    /// A block update's height is below the next height of the chain.
    #[display(fmt = "block update at height {found}, expected {expected}")]
    InvalidBlockUpdateHeightLower { expected: u64, found: u64 },
    /// The last update of a batch carries no finality evidence.
    MissingVotes,
    /// The finality votes failed to verify.
    #[display(fmt = "invalid votes: {_0}")]
    InvalidVotes(finality::VotesError),
    /// A block proof targets a height beyond the current accumulator height.
    #[display(fmt = "block proof for height {found}, accumulator at {current}")]
    InvalidBlockProofHeightHigher { current: u64, found: u64 },
    /// A block proof's witness failed to verify.
    #[display(fmt = "invalid witness: {_0}")]
    InvalidWitness(mta::WitnessError),
    /// A state proof failed to verify.
    #[display(fmt = "invalid state proof: {_0}")]
    InvalidTrieProof(trie::proof_verify::Error),
    /// The proven event records failed to decode.
    #[display(fmt = "{_0}")]
    InvalidEvents(crate::events::EventsDecodeError),
    /// An extracted message skips ahead of the expected sequence number.
    #[display(fmt = "message sequence {found}, expected {expected}")]
    InvalidSequenceHigher { expected: u64, found: u64 },
    /// An extracted message repeats an already-accepted sequence number.
    #[display(fmt = "message sequence {found}, expected {expected}")]
    InvalidSequence { expected: u64, found: u64 },
}

/// Structural violations of the relay protocol. See [`Error::Protocol`].
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum ProtocolError {
    /// The message carries neither block updates nor a block proof, state proofs with no
    /// header to check them against, or a header-less block update that isn't the sole update
    /// of the batch.
    #[display(fmt = "missing update evidence")]
    MissingEvidence,
    /// A block update's parent hash doesn't match the last accepted block.
    #[display(fmt = "parent hash mismatch")]
    ParentHashMismatch,
    /// The message embeds a relay-chain payload, but this verifier tracks a single-tier chain.
    #[display(fmt = "unexpected relay chain data")]
    UnexpectedRelayChainData,
    /// The relay layer's inclusion events don't cover the block update being finalized.
    #[display(fmt = "inclusion mismatch")]
    InclusionMismatch,
}

#[cfg(test)]
mod tests {
    use super::{Config, Error, ProtocolError, RelayLayerConfig, Verifier};
    use crate::{
        chain_address::ChainAddress,
        events::{Event, IndexedEventsDecoder},
        finality::ValidatorSet,
        header::BlockHeader,
        mta,
        relay_message::{
            encode_vote_message, BlockProof, BlockUpdate, RelayBlockUpdate, RelayChainData,
            RelayMessage, StateProof, Votes,
        },
        trie::proof_verify::build_proof,
    };
    use alloc::{boxed::Box, string::String, string::ToString as _, vec, vec::Vec};

    const EVENTS_KEY: &[u8] = b":events";
    const CHAIN_GENESIS_HASH: [u8; 32] = [0x47; 32];
    const RELAY_GENESIS_HASH: [u8; 32] = [0x74; 32];

    struct Signer {
        key: ed25519_zebra::SigningKey,
        public: [u8; 32],
    }

    fn signers(count: usize) -> Vec<Signer> {
        (0..count)
            .map(|n| {
                let mut seed = [0; 32];
                seed[0] = u8::try_from(n).unwrap() + 1;
                let key = ed25519_zebra::SigningKey::from(seed);
                let public: [u8; 32] = ed25519_zebra::VerificationKey::from(&key).into();
                Signer { key, public }
            })
            .collect()
    }

    fn decoder() -> IndexedEventsDecoder {
        IndexedEventsDecoder {
            new_authorities: [0x0a, 0x00],
            candidate_included: [0x35, 0x03],
            message: [0x40, 0x01],
        }
    }

    fn bmc() -> ChainAddress {
        "btp://0x1.icon/cx87ed9048b594b95199f326fc76e76a9d33dd665b"
            .parse()
            .unwrap()
    }

    fn prev() -> ChainAddress {
        "btp://0x5.moon/0x5b9a7190e3090c7e78a2de1aea9b0816521255fa"
            .parse()
            .unwrap()
    }

    fn accumulator_config(offset: u64, last_block_hash: [u8; 32]) -> mta::Config {
        mta::Config {
            offset,
            root_size: 8,
            cache_size: 4,
            allow_newer_witness: false,
            last_block_hash,
        }
    }

    fn single_tier_verifier(signers: &[Signer]) -> Verifier {
        Verifier::new(Config {
            bmc: bmc(),
            network: String::from("0x5.moon"),
            accumulator: accumulator_config(100, CHAIN_GENESIS_HASH),
            validators: ValidatorSet {
                keys: signers.iter().map(|s| s.public).collect(),
                set_id: 9,
            },
            events_decoder: Box::new(decoder()),
            event_storage_key: EVENTS_KEY.to_vec(),
            relay_layer: None,
            randomness_seed: [42; 32],
        })
    }

    fn two_tier_verifier(signers: &[Signer]) -> Verifier {
        Verifier::new(Config {
            bmc: bmc(),
            network: String::from("0x5.moon"),
            accumulator: accumulator_config(100, CHAIN_GENESIS_HASH),
            validators: ValidatorSet {
                keys: signers.iter().map(|s| s.public).collect(),
                set_id: 9,
            },
            events_decoder: Box::new(decoder()),
            event_storage_key: EVENTS_KEY.to_vec(),
            relay_layer: Some(RelayLayerConfig {
                accumulator: accumulator_config(900, RELAY_GENESIS_HASH),
                para_id: 2000,
                events_decoder: Box::new(decoder()),
            }),
            randomness_seed: [42; 32],
        })
    }

    fn make_header(parent_hash: [u8; 32], number: u64, state_root: [u8; 32]) -> BlockHeader {
        BlockHeader {
            parent_hash,
            number,
            state_root,
        }
    }

    /// Headers `start..start + count`, chained from `parent_hash`, all sharing `state_root`.
    fn header_chain(
        parent_hash: [u8; 32],
        start: u64,
        count: u64,
        state_root: [u8; 32],
    ) -> Vec<BlockHeader> {
        let mut headers = Vec::new();
        let mut parent = parent_hash;
        for number in start..start + count {
            let header = make_header(parent, number, state_root);
            parent = header.hash();
            headers.push(header);
        }
        headers
    }

    fn sign_votes(signers: &[Signer], num: usize, header: &BlockHeader, set_id: u64) -> Votes {
        let message = encode_vote_message(&header.hash(), header.number, 1, set_id);
        Votes {
            message: message.to_vec(),
            signatures: signers
                .iter()
                .take(num)
                .map(|s| (<[u8; 64]>::from(s.key.sign(&message)), s.public))
                .collect(),
        }
    }

    fn updates_message(headers: &[BlockHeader], votes: Votes) -> RelayMessage {
        let last = headers.len() - 1;
        RelayMessage {
            block_updates: headers
                .iter()
                .enumerate()
                .map(|(n, header)| BlockUpdate {
                    header: Some(header.scale_encoding_vec()),
                    votes: if n == last { Some(votes.clone()) } else { None },
                    relay_chain_data: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    fn handle(verifier: &mut Verifier, seq: u64, message: &RelayMessage) -> Result<Vec<Vec<u8>>, Error> {
        verifier.handle_relay_message(&bmc(), &prev(), seq, &message.scale_encoding_vec())
    }

    fn events_trie(events: &[Event]) -> (Vec<Vec<u8>>, [u8; 32]) {
        let encoded = decoder().encode_events(events);
        build_proof(&[(EVENTS_KEY, &encoded[..])], EVENTS_KEY).unwrap()
    }

    fn combine(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
        let mut concat = [0; 64];
        concat[..32].copy_from_slice(left);
        concat[32..].copy_from_slice(right);
        <[u8; 32]>::try_from(blake2_rfc::blake2b::blake2b(32, &[], &concat).as_bytes()).unwrap()
    }

    fn message_event(sequence: u64, payload: &[u8]) -> Event {
        Event::Message {
            next_hop: bmc().to_string(),
            sequence,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn chain_continuity() {
        let signers = signers(4);
        let mut verifier = single_tier_verifier(&signers);

        let headers = header_chain(CHAIN_GENESIS_HASH, 101, 3, [0x11; 32]);
        let votes = sign_votes(&signers, 3, &headers[2], 9);
        assert!(handle(&mut verifier, 0, &updates_message(&headers, votes))
            .unwrap()
            .is_empty());

        assert_eq!(verifier.accumulator().height(), 103);
        assert_eq!(verifier.accumulator().last_block_hash(), &headers[2].hash());
    }

    #[test]
    fn batch_without_votes_rejected() {
        let signers = signers(4);
        let mut verifier = single_tier_verifier(&signers);

        let headers = header_chain(CHAIN_GENESIS_HASH, 101, 2, [0x11; 32]);
        let message = RelayMessage {
            block_updates: headers
                .iter()
                .map(|header| BlockUpdate {
                    header: Some(header.scale_encoding_vec()),
                    votes: None,
                    relay_chain_data: None,
                })
                .collect(),
            ..Default::default()
        };

        assert!(matches!(
            handle(&mut verifier, 0, &message),
            Err(Error::MissingVotes)
        ));
        // Nothing was committed, including the non-final first update.
        assert_eq!(verifier.accumulator().height(), 100);
    }

    #[test]
    fn insufficient_votes_rejected() {
        let signers = signers(4);
        let mut verifier = single_tier_verifier(&signers);

        let headers = header_chain(CHAIN_GENESIS_HASH, 101, 1, [0x11; 32]);
        let votes = sign_votes(&signers, 2, &headers[0], 9);
        assert!(matches!(
            handle(&mut verifier, 0, &updates_message(&headers, votes)),
            Err(Error::InvalidVotes(_))
        ));
    }

    #[test]
    fn height_discontinuities_rejected() {
        let signers = signers(4);
        let mut verifier = single_tier_verifier(&signers);

        let too_high = make_header(CHAIN_GENESIS_HASH, 105, [0x11; 32]);
        let votes = sign_votes(&signers, 3, &too_high, 9);
        assert!(matches!(
            handle(
                &mut verifier,
                0,
                &updates_message(core::slice::from_ref(&too_high), votes)
            ),
            Err(Error::InvalidBlockUpdateHeightHigher {
                expected: 101,
                found: 105
            })
        ));

        let too_low = make_header(CHAIN_GENESIS_HASH, 100, [0x11; 32]);
        let votes = sign_votes(&signers, 3, &too_low, 9);
        assert!(matches!(
            handle(
                &mut verifier,
                0,
                &updates_message(core::slice::from_ref(&too_low), votes)
            ),
            Err(Error::InvalidBlockUpdateHeightLower {
                expected: 101,
                found: 100
            })
        ));
    }

    #[test]
    fn parent_hash_mismatch_rejected() {
        let signers = signers(4);
        let mut verifier = single_tier_verifier(&signers);

        let orphan = make_header([0xbd; 32], 101, [0x11; 32]);
        let votes = sign_votes(&signers, 3, &orphan, 9);
        assert!(matches!(
            handle(
                &mut verifier,
                0,
                &updates_message(core::slice::from_ref(&orphan), votes)
            ),
            Err(Error::Protocol(ProtocolError::ParentHashMismatch))
        ));
    }

    #[test]
    fn access_checks() {
        let signers = signers(4);
        let mut verifier = single_tier_verifier(&signers);
        let payload = RelayMessage::default().scale_encoding_vec();

        let wrong_network: ChainAddress = "btp://0x9.dot/0x00".parse().unwrap();
        assert!(matches!(
            verifier.handle_relay_message(&bmc(), &wrong_network, 0, &payload),
            Err(Error::NotAcceptedFromNetwork)
        ));

        let wrong_bmc: ChainAddress = "btp://0x1.icon/cx00".parse().unwrap();
        assert!(matches!(
            verifier.handle_relay_message(&wrong_bmc, &prev(), 0, &payload),
            Err(Error::NotAcceptedBmcAddress)
        ));
    }

    #[test]
    fn empty_message_rejected() {
        let signers = signers(4);
        let mut verifier = single_tier_verifier(&signers);
        assert!(matches!(
            handle(&mut verifier, 0, &RelayMessage::default()),
            Err(Error::Protocol(ProtocolError::MissingEvidence))
        ));
    }

    #[test]
    fn messages_extracted_in_sequence() {
        let signers = signers(4);
        let mut verifier = single_tier_verifier(&signers);

        let (proof_nodes, state_root) = events_trie(&[
            message_event(113, b"first"),
            message_event(114, b"second"),
            message_event(115, b"third"),
        ]);

        let headers = header_chain(CHAIN_GENESIS_HASH, 101, 1, state_root);
        let votes = sign_votes(&signers, 3, &headers[0], 9);
        let mut message = updates_message(&headers, votes);
        message.state_proofs = vec![StateProof {
            key: EVENTS_KEY.to_vec(),
            proof_nodes,
        }];

        let extracted = handle(&mut verifier, 112, &message).unwrap();
        assert_eq!(
            extracted,
            vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
        );
        assert_eq!(verifier.last_height(), 101);
    }

    #[test]
    fn sequence_gaps_rejected() {
        let signers = signers(4);

        for (sequence, expect_higher) in [(120u64, true), (105, false)] {
            let mut verifier = single_tier_verifier(&signers);
            let (proof_nodes, state_root) = events_trie(&[message_event(sequence, b"x")]);
            let headers = header_chain(CHAIN_GENESIS_HASH, 101, 1, state_root);
            let votes = sign_votes(&signers, 3, &headers[0], 9);
            let mut message = updates_message(&headers, votes);
            message.state_proofs = vec![StateProof {
                key: EVENTS_KEY.to_vec(),
                proof_nodes,
            }];

            let result = handle(&mut verifier, 112, &message);
            if expect_higher {
                assert!(matches!(
                    result,
                    Err(Error::InvalidSequenceHigher {
                        expected: 113,
                        found: 120
                    })
                ));
            } else {
                assert!(matches!(
                    result,
                    Err(Error::InvalidSequence {
                        expected: 113,
                        found: 105
                    })
                ));
            }
            // The updates earlier in the pipeline were rolled back with everything else.
            assert_eq!(verifier.accumulator().height(), 100);
        }
    }

    #[test]
    fn messages_for_other_centers_skipped() {
        let signers = signers(4);
        let mut verifier = single_tier_verifier(&signers);

        let (proof_nodes, state_root) = events_trie(&[
            Event::Message {
                next_hop: String::from("btp://0x1.icon/cxsomeoneelse"),
                sequence: 55,
                payload: b"not ours".to_vec(),
            },
            message_event(113, b"ours"),
        ]);

        let headers = header_chain(CHAIN_GENESIS_HASH, 101, 1, state_root);
        let votes = sign_votes(&signers, 3, &headers[0], 9);
        let mut message = updates_message(&headers, votes);
        message.state_proofs = vec![StateProof {
            key: EVENTS_KEY.to_vec(),
            proof_nodes,
        }];

        assert_eq!(
            handle(&mut verifier, 112, &message).unwrap(),
            vec![b"ours".to_vec()]
        );
    }

    #[test]
    fn block_proof_proves_past_header() {
        let signers = signers(4);
        let mut verifier = single_tier_verifier(&signers);

        let (proof_nodes, state_root) = events_trie(&[message_event(113, b"later")]);

        // Height 102 is the one we will prove afterwards; give it the events state root.
        let h101 = make_header(CHAIN_GENESIS_HASH, 101, [0x11; 32]);
        let h102 = make_header(h101.hash(), 102, state_root);
        let h103 = make_header(h102.hash(), 103, [0x11; 32]);
        let h104 = make_header(h103.hash(), 104, [0x11; 32]);
        let headers = vec![h101.clone(), h102.clone(), h103.clone(), h104.clone()];

        let votes = sign_votes(&signers, 3, &h104, 9);
        handle(&mut verifier, 0, &updates_message(&headers, votes)).unwrap();
        assert_eq!(verifier.accumulator().height(), 104);

        // Witness for leaf 102 in the 4-leaf tree: sibling 101, then H(103 ++ 104).
        let witness = vec![h101.hash(), combine(&h103.hash(), &h104.hash())];

        let message = RelayMessage {
            block_proof: Some(BlockProof {
                header: h102.scale_encoding_vec(),
                accumulator_height: 104,
                witness,
            }),
            state_proofs: vec![StateProof {
                key: EVENTS_KEY.to_vec(),
                proof_nodes,
            }],
            ..Default::default()
        };

        assert_eq!(
            handle(&mut verifier, 112, &message).unwrap(),
            vec![b"later".to_vec()]
        );
        assert_eq!(verifier.last_height(), 102);
    }

    #[test]
    fn block_proof_beyond_height_rejected() {
        let signers = signers(4);
        let mut verifier = single_tier_verifier(&signers);

        let future = make_header(CHAIN_GENESIS_HASH, 150, [0x11; 32]);
        let message = RelayMessage {
            block_proof: Some(BlockProof {
                header: future.scale_encoding_vec(),
                accumulator_height: 150,
                witness: vec![],
            }),
            ..Default::default()
        };

        assert!(matches!(
            handle(&mut verifier, 0, &message),
            Err(Error::InvalidBlockProofHeightHigher {
                current: 100,
                found: 150
            })
        ));
    }

    #[test]
    fn tampered_block_proof_rejected() {
        let signers = signers(4);
        let mut verifier = single_tier_verifier(&signers);

        let headers = header_chain(CHAIN_GENESIS_HASH, 101, 2, [0x11; 32]);
        let votes = sign_votes(&signers, 3, &headers[1], 9);
        handle(&mut verifier, 0, &updates_message(&headers, votes)).unwrap();

        // Claim leaf 101 with a wrong witness.
        let message = RelayMessage {
            block_proof: Some(BlockProof {
                header: headers[0].scale_encoding_vec(),
                accumulator_height: 102,
                witness: vec![[0xee; 32]],
            }),
            ..Default::default()
        };

        assert!(matches!(
            handle(&mut verifier, 0, &message),
            Err(Error::InvalidWitness(_))
        ));
    }

    #[test]
    fn validator_set_rotation_is_monotonic() {
        let signers = signers(4);
        let mut verifier = single_tier_verifier(&signers);
        let original_keys = verifier.validators().keys.clone();

        // A proof carrying the already-active set id must leave the roster untouched.
        let (proof_nodes, state_root) = events_trie(&[Event::NewAuthorities {
            set_id: 9,
            validators: vec![[0xef; 32]],
        }]);
        let headers = header_chain(CHAIN_GENESIS_HASH, 101, 1, state_root);
        let votes = sign_votes(&signers, 3, &headers[0], 9);
        let mut message = updates_message(&headers, votes);
        message.state_proofs = vec![StateProof {
            key: EVENTS_KEY.to_vec(),
            proof_nodes,
        }];
        handle(&mut verifier, 0, &message).unwrap();
        assert_eq!(verifier.validators().set_id, 9);
        assert_eq!(verifier.validators().keys, original_keys);

        // A higher set id replaces it.
        let new_signers = signers_from(10);
        let (proof_nodes, state_root) = events_trie(&[Event::NewAuthorities {
            set_id: 10,
            validators: new_signers.iter().map(|s| s.public).collect(),
        }]);
        let parent = *verifier.accumulator().last_block_hash();
        let headers = header_chain(parent, 102, 1, state_root);
        let votes = sign_votes(&signers, 3, &headers[0], 9);
        let mut message = updates_message(&headers, votes);
        message.state_proofs = vec![StateProof {
            key: EVENTS_KEY.to_vec(),
            proof_nodes,
        }];
        handle(&mut verifier, 0, &message).unwrap();
        assert_eq!(verifier.validators().set_id, 10);

        // Votes signed by the old set are now rejected.
        let parent = *verifier.accumulator().last_block_hash();
        let headers = header_chain(parent, 103, 1, [0x11; 32]);
        let votes = sign_votes(&signers, 3, &headers[0], 10);
        assert!(matches!(
            handle(&mut verifier, 0, &updates_message(&headers, votes)),
            Err(Error::InvalidVotes(_))
        ));

        // The new set finalizes blocks.
        let votes = sign_votes(&new_signers, 3, &headers[0], 10);
        handle(&mut verifier, 0, &updates_message(&headers, votes)).unwrap();
        assert_eq!(verifier.accumulator().height(), 103);
    }

    fn signers_from(offset: u8) -> Vec<Signer> {
        (0..4u8)
            .map(|n| {
                let mut seed = [0; 32];
                seed[0] = offset + n + 1;
                let key = ed25519_zebra::SigningKey::from(seed);
                let public: [u8; 32] = ed25519_zebra::VerificationKey::from(&key).into();
                Signer { key, public }
            })
            .collect()
    }

    fn two_tier_message(
        para_header: &BlockHeader,
        relay_header: &BlockHeader,
        votes: Votes,
        relay_proof_nodes: Vec<Vec<u8>>,
    ) -> RelayMessage {
        RelayMessage {
            block_updates: vec![BlockUpdate {
                header: Some(para_header.scale_encoding_vec()),
                votes: None,
                relay_chain_data: Some(RelayChainData {
                    block_updates: vec![RelayBlockUpdate {
                        header: relay_header.scale_encoding_vec(),
                        votes: Some(votes),
                    }],
                    block_proof: None,
                    state_proofs: vec![StateProof {
                        key: EVENTS_KEY.to_vec(),
                        proof_nodes: relay_proof_nodes,
                    }],
                }),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn two_tier_inclusion_accepted() {
        let signers = signers(4);
        let mut verifier = two_tier_verifier(&signers);

        let para_header = make_header(CHAIN_GENESIS_HASH, 101, [0x11; 32]);
        let (proof_nodes, relay_state_root) = events_trie(&[Event::CandidateIncluded {
            para_id: 2000,
            para_head: para_header.hash(),
        }]);
        let relay_header = make_header(RELAY_GENESIS_HASH, 901, relay_state_root);
        let votes = sign_votes(&signers, 3, &relay_header, 9);

        handle(
            &mut verifier,
            0,
            &two_tier_message(&para_header, &relay_header, votes, proof_nodes),
        )
        .unwrap();

        assert_eq!(verifier.accumulator().height(), 101);
        assert_eq!(verifier.relay_accumulator().unwrap().height(), 901);
    }

    #[test]
    fn two_tier_inclusion_mismatch_rejected() {
        let signers = signers(4);

        // Wrong para head: the relay chain included some other block.
        let mut verifier = two_tier_verifier(&signers);
        let para_header = make_header(CHAIN_GENESIS_HASH, 101, [0x11; 32]);
        let (proof_nodes, relay_state_root) = events_trie(&[Event::CandidateIncluded {
            para_id: 2000,
            para_head: [0xba; 32],
        }]);
        let relay_header = make_header(RELAY_GENESIS_HASH, 901, relay_state_root);
        let votes = sign_votes(&signers, 3, &relay_header, 9);

        assert!(matches!(
            handle(
                &mut verifier,
                0,
                &two_tier_message(&para_header, &relay_header, votes, proof_nodes),
            ),
            Err(Error::Protocol(ProtocolError::InclusionMismatch))
        ));
        // The relay chain block verified fine, but nothing must have been committed.
        assert_eq!(verifier.accumulator().height(), 100);
        assert_eq!(verifier.relay_accumulator().unwrap().height(), 900);

        // Wrong para id: same thing.
        let mut verifier = two_tier_verifier(&signers);
        let (proof_nodes, relay_state_root) = events_trie(&[Event::CandidateIncluded {
            para_id: 2001,
            para_head: para_header.hash(),
        }]);
        let relay_header = make_header(RELAY_GENESIS_HASH, 901, relay_state_root);
        let votes = sign_votes(&signers, 3, &relay_header, 9);

        assert!(matches!(
            handle(
                &mut verifier,
                0,
                &two_tier_message(&para_header, &relay_header, votes, proof_nodes),
            ),
            Err(Error::Protocol(ProtocolError::InclusionMismatch))
        ));
    }

    #[test]
    fn relay_data_rejected_on_single_tier() {
        let signers = signers(4);
        let mut verifier = single_tier_verifier(&signers);

        let para_header = make_header(CHAIN_GENESIS_HASH, 101, [0x11; 32]);
        let relay_header = make_header(RELAY_GENESIS_HASH, 901, [0x22; 32]);
        let votes = sign_votes(&signers, 3, &relay_header, 9);

        assert!(matches!(
            handle(
                &mut verifier,
                0,
                &two_tier_message(&para_header, &relay_header, votes, vec![]),
            ),
            Err(Error::Protocol(ProtocolError::UnexpectedRelayChainData))
        ));
    }

    #[test]
    fn headerless_update_rejected_unless_sole() {
        let signers = signers(4);
        let mut verifier = two_tier_verifier(&signers);

        // A header-less update anywhere in a multi-update batch would exempt the real headers
        // from the last-update finality check. Here the first update carries no votes at all.
        let para_header = make_header(CHAIN_GENESIS_HASH, 101, [0x11; 32]);
        let message = RelayMessage {
            block_updates: vec![
                BlockUpdate {
                    header: Some(para_header.scale_encoding_vec()),
                    votes: None,
                    relay_chain_data: None,
                },
                BlockUpdate {
                    header: None,
                    votes: None,
                    relay_chain_data: Some(RelayChainData::default()),
                },
            ],
            ..Default::default()
        };

        assert!(matches!(
            handle(&mut verifier, 0, &message),
            Err(Error::Protocol(ProtocolError::MissingEvidence))
        ));
        assert_eq!(verifier.accumulator().height(), 100);
        assert_eq!(verifier.relay_accumulator().unwrap().height(), 900);

        // As the sole update of a batch it stays legitimate: a relay-layer validator rotation
        // without tracked-chain progress.
        let new_signers = signers_from(10);
        let (proof_nodes, relay_state_root) = events_trie(&[Event::NewAuthorities {
            set_id: 10,
            validators: new_signers.iter().map(|s| s.public).collect(),
        }]);
        let relay_header = make_header(RELAY_GENESIS_HASH, 901, relay_state_root);
        let votes = sign_votes(&signers, 3, &relay_header, 9);
        let message = RelayMessage {
            block_updates: vec![BlockUpdate {
                header: None,
                votes: None,
                relay_chain_data: Some(RelayChainData {
                    block_updates: vec![RelayBlockUpdate {
                        header: relay_header.scale_encoding_vec(),
                        votes: Some(votes),
                    }],
                    block_proof: None,
                    state_proofs: vec![StateProof {
                        key: EVENTS_KEY.to_vec(),
                        proof_nodes,
                    }],
                }),
            }],
            ..Default::default()
        };

        assert!(handle(&mut verifier, 0, &message).unwrap().is_empty());
        assert_eq!(verifier.accumulator().height(), 100);
        assert_eq!(verifier.relay_accumulator().unwrap().height(), 901);
        assert_eq!(verifier.validators().set_id, 10);
    }

    #[test]
    fn relay_block_proof_proves_inclusion() {
        let signers = signers(4);
        let mut verifier = two_tier_verifier(&signers);

        // The inclusion of the para block is recorded in the state of relay block 902, which
        // the relay layer learns about first, in a batch finalized at 904.
        let para_header = make_header(CHAIN_GENESIS_HASH, 101, [0x11; 32]);
        let (proof_nodes, relay_state_root) = events_trie(&[Event::CandidateIncluded {
            para_id: 2000,
            para_head: para_header.hash(),
        }]);
        let r901 = make_header(RELAY_GENESIS_HASH, 901, [0x22; 32]);
        let r902 = make_header(r901.hash(), 902, relay_state_root);
        let r903 = make_header(r902.hash(), 903, [0x22; 32]);
        let r904 = make_header(r903.hash(), 904, [0x22; 32]);
        let relay_headers = [&r901, &r902, &r903, &r904];

        let votes = sign_votes(&signers, 3, &r904, 9);
        let advance_relay = RelayMessage {
            block_updates: vec![BlockUpdate {
                header: None,
                votes: None,
                relay_chain_data: Some(RelayChainData {
                    block_updates: relay_headers
                        .iter()
                        .enumerate()
                        .map(|(n, header)| RelayBlockUpdate {
                            header: header.scale_encoding_vec(),
                            votes: if n == 3 { Some(votes.clone()) } else { None },
                        })
                        .collect(),
                    block_proof: None,
                    state_proofs: vec![],
                }),
            }],
            ..Default::default()
        };
        assert!(handle(&mut verifier, 0, &advance_relay).unwrap().is_empty());
        assert_eq!(verifier.relay_accumulator().unwrap().height(), 904);

        // Now finalize the para block through a relay-layer block proof for 902 rather than
        // fresh relay updates.
        let message = RelayMessage {
            block_updates: vec![BlockUpdate {
                header: Some(para_header.scale_encoding_vec()),
                votes: None,
                relay_chain_data: Some(RelayChainData {
                    block_updates: vec![],
                    block_proof: Some(BlockProof {
                        header: r902.scale_encoding_vec(),
                        accumulator_height: 904,
                        witness: vec![r901.hash(), combine(&r903.hash(), &r904.hash())],
                    }),
                    state_proofs: vec![StateProof {
                        key: EVENTS_KEY.to_vec(),
                        proof_nodes,
                    }],
                }),
            }],
            ..Default::default()
        };

        assert!(handle(&mut verifier, 0, &message).unwrap().is_empty());
        assert_eq!(verifier.accumulator().height(), 101);
        assert_eq!(verifier.accumulator().last_block_hash(), &para_header.hash());
        assert_eq!(verifier.relay_accumulator().unwrap().height(), 904);
    }

    #[test]
    fn bad_state_proof_rolls_everything_back() {
        let signers = signers(4);
        let mut verifier = single_tier_verifier(&signers);
        let roots_before = verifier.accumulator().roots().to_vec();

        let headers = header_chain(CHAIN_GENESIS_HASH, 101, 3, [0x11; 32]);
        let votes = sign_votes(&signers, 3, &headers[2], 9);
        let mut message = updates_message(&headers, votes);
        message.state_proofs = vec![StateProof {
            key: EVENTS_KEY.to_vec(),
            proof_nodes: vec![vec![0xde, 0xad, 0xbe, 0xef]],
        }];

        assert!(matches!(
            handle(&mut verifier, 0, &message),
            Err(Error::InvalidTrieProof(_))
        ));
        assert_eq!(verifier.accumulator().height(), 100);
        assert_eq!(verifier.accumulator().roots(), &roots_before[..]);
        assert_eq!(verifier.accumulator().last_block_hash(), &CHAIN_GENESIS_HASH);
        assert_eq!(verifier.validators().set_id, 9);
    }
}
