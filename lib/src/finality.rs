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

//! Finality verification.
//!
//! A block of the source chain is final once more than two thirds of the current validator set
//! have signed a vote message over its hash, height, consensus round and validator set id. This
//! module checks a decoded [`VotesRef`](crate::relay_message::VotesRef) against a
//! [`ValidatorSet`]: the vote message must match the block being finalized byte for byte, every
//! signature must verify, every signer must be a distinct member of the set, and the distinct
//! signer count must reach the `⌊2n/3⌋ + 1` threshold.

use crate::{relay_message, util};

use alloc::vec::Vec;
use rand_chacha::{
    rand_core::{RngCore as _, SeedableRng as _},
    ChaCha20Rng,
};

/// Current signer roster of the source chain (or of its relay layer, for two-tier chains).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorSet {
    /// Ed25519 public keys of the validators, in the chain's canonical order.
    pub keys: Vec<[u8; 32]>,
    /// Version counter of the roster. Only ever increases, via proven authority-change events.
    pub set_id: u64,
}

impl ValidatorSet {
    /// Number of distinct signatures required for finality.
    pub fn threshold(&self) -> usize {
        self.keys.len() * 2 / 3 + 1
    }
}

/// Configuration for a finality verification process.
#[derive(Debug)]
pub struct VerifyConfig<'a> {
    /// Decoded votes to verify.
    pub votes: &'a relay_message::VotesRef<'a>,

    /// Hash of the block the votes are expected to finalize.
    pub expected_block_hash: [u8; 32],

    /// Height of the block the votes are expected to finalize.
    pub expected_block_number: u64,

    /// Validator set the signers must belong to.
    pub validators: &'a ValidatorSet,

    /// Seed for a PRNG used for various purposes during the verification.
    ///
    /// > **Note**: The verification is nonetheless deterministic.
    pub randomness_seed: [u8; 32],
}

/// Verifies that the given votes finalize the given block.
pub fn verify_finality(config: VerifyConfig) -> Result<(), VotesError> {
    let votes = config.votes;

    // The carried vote message must be exactly the canonical message for the block being
    // finalized. Comparing the recomputed bytes covers the target hash, target number, and any
    // future extension of the message format in one go.
    let expected_message = relay_message::encode_vote_message(
        &config.expected_block_hash,
        config.expected_block_number,
        votes.round,
        votes.set_id,
    );
    if votes.message != expected_message {
        return Err(VotesError::BadTarget);
    }

    if votes.set_id != config.validators.set_id {
        return Err(VotesError::BadSetId {
            expected: config.validators.set_id,
            found: votes.set_id,
        });
    }

    let mut randomness = ChaCha20Rng::from_seed(config.randomness_seed);

    // Collect the validators in a map in order to be able to determine with a low complexity
    // whether a public key is a validator. The boolean indicates whether the validator has
    // already been seen in the signature list.
    let mut seen = {
        let mut list = hashbrown::HashMap::<&[u8; 32], bool, _>::with_capacity_and_hasher(
            config.validators.keys.len(),
            util::SipHasherBuild::new({
                let mut seed = [0; 16];
                randomness.fill_bytes(&mut seed);
                seed
            }),
        );
        for key in &config.validators.keys {
            list.insert(key, false);
        }
        list
    };

    // Verifying all the signatures together brings better performances than verifying them one
    // by one.
    // Note that batched Ed25519 verification has some issues. The code below uses a special
    // flavor of Ed25519 where ambiguities are removed.
    // See <https://docs.rs/ed25519-zebra/latest/ed25519_zebra/batch/index.html> and
    // <https://github.com/zcash/zips/blob/master/zip-0215.rst>
    let mut batch = ed25519_zebra::batch::Verifier::new();

    for (signature, public_key) in &votes.signatures {
        match seen.entry(*public_key) {
            hashbrown::hash_map::Entry::Occupied(mut entry) => {
                if entry.insert(true) {
                    return Err(VotesError::DuplicateSignature(**public_key));
                }
            }
            hashbrown::hash_map::Entry::Vacant(_) => {
                return Err(VotesError::NotValidator(**public_key));
            }
        }

        batch.queue(ed25519_zebra::batch::Item::from((
            ed25519_zebra::VerificationKeyBytes::from(**public_key),
            ed25519_zebra::Signature::from(**signature),
            votes.message,
        )));
    }

    if votes.signatures.len() < config.validators.threshold() {
        return Err(VotesError::NotEnoughSignatures {
            required: config.validators.threshold(),
            found: votes.signatures.len(),
        });
    }

    // Actual signatures verification performed here.
    batch
        .verify(&mut randomness)
        .map_err(|_| VotesError::BadSignature)?;

    Ok(())
}

/// Error that can happen while verifying finality votes.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum VotesError {
    /// The vote message doesn't refer to the block being finalized.
    BadTarget,
    /// The validator set id of the votes doesn't match the current one.
    #[display(fmt = "votes are for set id {}, current set id is {}", found, expected)]
    BadSetId {
        /// Set id of the roster the verifier currently tracks.
        expected: u64,
        /// Set id found in the votes.
        found: u64,
    },
    /// One of the signatures can't be verified.
    BadSignature,
    /// One validator has produced two signatures.
    #[display(fmt = "one validator has produced two signatures")]
    DuplicateSignature([u8; 32]),
    /// One of the public keys isn't in the validator set.
    #[display(fmt = "one of the public keys isn't in the validator set")]
    NotValidator([u8; 32]),
    /// Votes don't carry enough distinct signatures to reach the finality threshold.
    #[display(fmt = "{} signature(s), {} required", found, required)]
    NotEnoughSignatures {
        /// Finality threshold of the current validator set.
        required: usize,
        /// Number of signatures found in the votes.
        found: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::{verify_finality, ValidatorSet, VerifyConfig, VotesError};
    use crate::relay_message::{self, VotesRef};
    use alloc::{vec, vec::Vec};

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

    fn validator_set(signers: &[Signer], set_id: u64) -> ValidatorSet {
        ValidatorSet {
            keys: signers.iter().map(|s| s.public).collect(),
            set_id,
        }
    }

    fn signed_votes(
        signers: &[Signer],
        num_signatures: usize,
        block_hash: [u8; 32],
        block_number: u64,
        set_id: u64,
    ) -> relay_message::Votes {
        let message = relay_message::encode_vote_message(&block_hash, block_number, 1, set_id);
        relay_message::Votes {
            message: message.to_vec(),
            signatures: signers
                .iter()
                .take(num_signatures)
                .map(|s| (<[u8; 64]>::from(s.key.sign(&message)), s.public))
                .collect(),
        }
    }

    fn votes_ref(votes: &relay_message::Votes) -> VotesRef {
        let target_hash = <&[u8; 32]>::try_from(&votes.message[1..33]).unwrap();
        let target_number = u64::from(u32::from_le_bytes(
            <[u8; 4]>::try_from(&votes.message[33..37]).unwrap(),
        ));
        let round = u64::from_le_bytes(<[u8; 8]>::try_from(&votes.message[37..45]).unwrap());
        let set_id = u64::from_le_bytes(<[u8; 8]>::try_from(&votes.message[45..53]).unwrap());
        VotesRef {
            target_hash,
            target_number,
            round,
            set_id,
            message: &votes.message,
            signatures: votes
                .signatures
                .iter()
                .map(|(sig, pk)| (sig, pk))
                .collect(),
        }
    }

    fn verify(
        votes: &relay_message::Votes,
        validators: &ValidatorSet,
        block_hash: [u8; 32],
        block_number: u64,
    ) -> Result<(), VotesError> {
        verify_finality(VerifyConfig {
            votes: &votes_ref(votes),
            expected_block_hash: block_hash,
            expected_block_number: block_number,
            validators,
            randomness_seed: [42; 32],
        })
    }

    #[test]
    fn three_of_four_signatures_finalize() {
        let signers = signers(4);
        let validators = validator_set(&signers, 9);
        let votes = signed_votes(&signers, 3, [0xd1; 32], 55, 9);
        assert_eq!(verify(&votes, &validators, [0xd1; 32], 55), Ok(()));
    }

    #[test]
    fn two_of_four_signatures_do_not() {
        let signers = signers(4);
        let validators = validator_set(&signers, 9);
        let votes = signed_votes(&signers, 2, [0xd1; 32], 55, 9);
        assert_eq!(
            verify(&votes, &validators, [0xd1; 32], 55),
            Err(VotesError::NotEnoughSignatures {
                required: 3,
                found: 2
            })
        );
    }

    #[test]
    fn wrong_set_id_rejected() {
        let signers = signers(4);
        let validators = validator_set(&signers, 9);
        let votes = signed_votes(&signers, 3, [0xd1; 32], 55, 8);
        assert_eq!(
            verify(&votes, &validators, [0xd1; 32], 55),
            Err(VotesError::BadSetId {
                expected: 9,
                found: 8
            })
        );
    }

    #[test]
    fn wrong_target_rejected() {
        let signers = signers(4);
        let validators = validator_set(&signers, 9);
        let votes = signed_votes(&signers, 3, [0xd1; 32], 55, 9);
        assert_eq!(
            verify(&votes, &validators, [0xd2; 32], 55),
            Err(VotesError::BadTarget)
        );
    }

    #[test]
    fn duplicate_signer_rejected() {
        let signers = signers(4);
        let validators = validator_set(&signers, 9);
        let mut votes = signed_votes(&signers, 3, [0xd1; 32], 55, 9);
        votes.signatures[2] = votes.signatures[0];
        assert_eq!(
            verify(&votes, &validators, [0xd1; 32], 55),
            Err(VotesError::DuplicateSignature(signers[0].public))
        );
    }

    #[test]
    fn unknown_signer_rejected() {
        let four = signers(4);
        let five = signers(5);
        let validators = validator_set(&four, 9);
        // Signers 1..=4 sign, but the fifth key was never registered.
        let votes = signed_votes(&five[1..], 4, [0xd1; 32], 55, 9);
        assert_eq!(
            verify(&votes, &validators, [0xd1; 32], 55),
            Err(VotesError::NotValidator(five[4].public))
        );
    }

    #[test]
    fn tampered_signature_rejected() {
        let signers = signers(4);
        let validators = validator_set(&signers, 9);
        let mut votes = signed_votes(&signers, 3, [0xd1; 32], 55, 9);
        votes.signatures[1].0[0] ^= 0x01;
        assert_eq!(
            verify(&votes, &validators, [0xd1; 32], 55),
            Err(VotesError::BadSignature)
        );
    }

    #[test]
    fn threshold_formula() {
        for (n, required) in [(1usize, 1usize), (3, 3), (4, 3), (6, 5), (7, 5), (9, 7)] {
            let set = ValidatorSet {
                keys: vec![[0; 32]; n],
                set_id: 0,
            };
            assert_eq!(set.threshold(), required);
        }
    }
}
