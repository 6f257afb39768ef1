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

//! Decoding of the event records proven by state proofs.
//!
//! The storage entry proven by a state proof holds the list of events the source chain emitted
//! in a block. Its encoding is chain-family-specific: each record starts with a two-byte index
//! identifying the module and event type, followed by a length-prefixed payload. Which indices
//! correspond to which events varies between chain families, hence the [`EventsDecoder`] trait;
//! the [`Verifier`](crate::verifier::Verifier) is handed an implementation at construction.

use crate::util;

use alloc::{boxed::Box, string::String, vec::Vec};
use core::fmt;
use nom::Parser as _;

/// A single event record, once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The validator set of the chain changes. Subsequent finality votes must be verified
    /// against the new roster.
    NewAuthorities {
        /// Id of the new validator set.
        set_id: u64,
        /// Ed25519 public keys of the new validator set.
        validators: Vec<[u8; 32]>,
    },
    /// A block of a tracked application chain has been included in this (relay) chain.
    CandidateIncluded {
        /// Id of the application chain the candidate belongs to.
        para_id: u32,
        /// Hash of the header of the included block.
        para_head: [u8; 32],
    },
    /// A cross-chain message has been emitted by the message center of the source chain.
    Message {
        /// Address of the message center the message is destined to.
        next_hop: String,
        /// Sequence number of the message. Consecutive for a given link.
        sequence: u64,
        /// Opaque message payload, forwarded verbatim.
        payload: Vec<u8>,
    },
    /// Any event record whose index the decoder doesn't know about. Ignored by the verifier.
    Other,
}

/// Turns the raw value of the events storage entry into a list of [`Event`]s.
///
/// Implementations are per chain family. Object-safe, as the verifier stores one behind a
/// `Box<dyn EventsDecoder>`.
pub trait EventsDecoder {
    /// Decodes the list of event records found at the events storage key.
    fn decode_events(&self, encoded: &[u8]) -> Result<Vec<Event>, EventsDecodeError>;
}

impl<T: EventsDecoder + ?Sized> EventsDecoder for Box<T> {
    fn decode_events(&self, encoded: &[u8]) -> Result<Vec<Event>, EventsDecodeError> {
        (**self).decode_events(encoded)
    }
}

/// [`EventsDecoder`] implementation driven by a table of two-byte event indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedEventsDecoder {
    /// Index of the authority-change event.
    pub new_authorities: [u8; 2],
    /// Index of the candidate-inclusion event. Only meaningful on relay chains.
    pub candidate_included: [u8; 2],
    /// Index of the cross-chain message event.
    pub message: [u8; 2],
}

impl EventsDecoder for IndexedEventsDecoder {
    fn decode_events(&self, encoded: &[u8]) -> Result<Vec<Event>, EventsDecodeError> {
        let mut parser = nom::combinator::all_consuming(nom::combinator::complete(
            nom::combinator::flat_map(util::nom_scale_compact_usize, |count| {
                nom::multi::many_m_n(count, count, |bytes| self.nom_event(bytes))
            }),
        ));

        match nom::Finish::finish(parser.parse(encoded)) {
            Ok((_, events)) => Ok(events),
            Err(err) => Err(EventsDecodeError(err.code)),
        }
    }
}

impl IndexedEventsDecoder {
    fn nom_event<'a>(
        &self,
        bytes: &'a [u8],
    ) -> nom::IResult<&'a [u8], Event, nom::error::Error<&'a [u8]>> {
        let (bytes, index) = nom::bytes::streaming::take(2u32)(bytes)?;
        let (bytes, payload) = nom_bytes(bytes)?;

        let event = if index == self.new_authorities {
            let (_, event) = nom::combinator::all_consuming(nom_new_authorities)(payload)?;
            event
        } else if index == self.candidate_included {
            let (_, event) = nom::combinator::all_consuming(nom_candidate_included)(payload)?;
            event
        } else if index == self.message {
            let (_, event) = nom::combinator::all_consuming(nom_message)(payload)?;
            event
        } else {
            Event::Other
        };

        Ok((bytes, event))
    }

    /// Encodes a list of events into the wire representation [`decode_events`] accepts.
    ///
    /// Relayer-side counterpart of [`EventsDecoder::decode_events`]. Also used to build test
    /// fixtures.
    ///
    /// [`decode_events`]: EventsDecoder::decode_events
    pub fn encode_events(&self, events: &[Event]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(util::encode_scale_compact_usize(events.len()).as_ref());
        for event in events {
            let (index, payload) = match event {
                Event::NewAuthorities { set_id, validators } => {
                    let mut payload = Vec::with_capacity(16 + validators.len() * 32);
                    payload
                        .extend_from_slice(util::encode_scale_compact_u64(*set_id).as_ref());
                    payload.extend_from_slice(
                        util::encode_scale_compact_usize(validators.len()).as_ref(),
                    );
                    for validator in validators {
                        payload.extend_from_slice(validator);
                    }
                    (self.new_authorities, payload)
                }
                Event::CandidateIncluded { para_id, para_head } => {
                    let mut payload = Vec::with_capacity(36);
                    payload.extend_from_slice(&para_id.to_le_bytes());
                    payload.extend_from_slice(para_head);
                    (self.candidate_included, payload)
                }
                Event::Message {
                    next_hop,
                    sequence,
                    payload: message_payload,
                } => {
                    let mut payload = Vec::new();
                    payload.extend_from_slice(
                        util::encode_scale_compact_usize(next_hop.len()).as_ref(),
                    );
                    payload.extend_from_slice(next_hop.as_bytes());
                    payload
                        .extend_from_slice(util::encode_scale_compact_u64(*sequence).as_ref());
                    payload.extend_from_slice(
                        util::encode_scale_compact_usize(message_payload.len()).as_ref(),
                    );
                    payload.extend_from_slice(message_payload);
                    (self.message, payload)
                }
                Event::Other => (
                    [0xff, 0xff],
                    Vec::new(),
                ),
            };

            out.extend_from_slice(&index);
            out.extend_from_slice(util::encode_scale_compact_usize(payload.len()).as_ref());
            out.extend_from_slice(&payload);
        }
        out
    }
}

fn nom_bytes(bytes: &[u8]) -> nom::IResult<&[u8], &[u8], nom::error::Error<&[u8]>> {
    nom::multi::length_data(util::nom_scale_compact_usize)(bytes)
}

fn nom_new_authorities(bytes: &[u8]) -> nom::IResult<&[u8], Event, nom::error::Error<&[u8]>> {
    nom::combinator::map(
        nom::sequence::tuple((
            util::nom_scale_compact_u64,
            nom::combinator::flat_map(util::nom_scale_compact_usize, |count| {
                nom::multi::many_m_n(count, count, nom::combinator::map(
                    nom::bytes::streaming::take(32u32),
                    |key: &[u8]| {
                        <[u8; 32]>::try_from(key).unwrap_or_else(|_| unreachable!())
                    },
                ))
            }),
        )),
        |(set_id, validators)| Event::NewAuthorities { set_id, validators },
    )(bytes)
}

fn nom_candidate_included(bytes: &[u8]) -> nom::IResult<&[u8], Event, nom::error::Error<&[u8]>> {
    nom::combinator::map(
        nom::sequence::tuple((
            nom::number::streaming::le_u32,
            nom::combinator::map(nom::bytes::streaming::take(32u32), |head: &[u8]| {
                <[u8; 32]>::try_from(head).unwrap_or_else(|_| unreachable!())
            }),
        )),
        |(para_id, para_head)| Event::CandidateIncluded { para_id, para_head },
    )(bytes)
}

fn nom_message(bytes: &[u8]) -> nom::IResult<&[u8], Event, nom::error::Error<&[u8]>> {
    nom::combinator::map(
        nom::sequence::tuple((
            nom::combinator::map_opt(nom_bytes, |next_hop| {
                core::str::from_utf8(next_hop).ok()
            }),
            util::nom_scale_compact_u64,
            nom_bytes,
        )),
        |(next_hop, sequence, payload)| Event::Message {
            next_hop: String::from(next_hop),
            sequence,
            payload: payload.to_vec(),
        },
    )(bytes)
}

/// Error potentially returned by [`EventsDecoder::decode_events`].
#[derive(Clone, derive_more::Display)]
#[display(fmt = "events decoding error: {_0:?}")]
pub struct EventsDecodeError(pub nom::error::ErrorKind);

impl fmt::Debug for EventsDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("EventsDecodeError").field(&self.0).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Event, EventsDecoder as _, IndexedEventsDecoder};
    use alloc::{string::String, vec, vec::Vec};

    fn decoder() -> IndexedEventsDecoder {
        IndexedEventsDecoder {
            new_authorities: [0x0a, 0x00],
            candidate_included: [0x35, 0x03],
            message: [0x40, 0x01],
        }
    }

    #[test]
    fn roundtrip_all_event_kinds() {
        let events = vec![
            Event::NewAuthorities {
                set_id: 7,
                validators: vec![[0x11; 32], [0x22; 32]],
            },
            Event::CandidateIncluded {
                para_id: 2000,
                para_head: [0xcd; 32],
            },
            Event::Message {
                next_hop: String::from("btp://0x42.icon/cx01"),
                sequence: 19,
                payload: b"opaque".to_vec(),
            },
        ];

        let encoded = decoder().encode_events(&events);
        assert_eq!(decoder().decode_events(&encoded).unwrap(), events);
    }

    #[test]
    fn unknown_index_becomes_other() {
        let events = vec![Event::Other];
        let encoded = decoder().encode_events(&events);
        assert_eq!(decoder().decode_events(&encoded).unwrap(), vec![Event::Other]);
    }

    #[test]
    fn empty_list() {
        assert_eq!(decoder().decode_events(&[0x00]).unwrap(), Vec::new());
    }

    #[test]
    fn truncated_record_rejected() {
        let events = vec![Event::CandidateIncluded {
            para_id: 2000,
            para_head: [0xcd; 32],
        }];
        let mut encoded = decoder().encode_events(&events);
        encoded.pop();
        assert!(decoder().decode_events(&encoded).is_err());
    }

    #[test]
    fn superfluous_bytes_rejected() {
        let mut encoded = decoder().encode_events(&[]);
        encoded.push(0x00);
        assert!(decoder().decode_events(&encoded).is_err());
    }

    #[test]
    fn non_utf8_next_hop_rejected() {
        let events = vec![Event::Message {
            next_hop: String::from("btp"),
            sequence: 1,
            payload: Vec::new(),
        }];
        let mut encoded = decoder().encode_events(&events);
        // Corrupt the first byte of the next-hop string.
        let position = encoded
            .iter()
            .position(|byte| *byte == b'b')
            .unwrap();
        encoded[position] = 0xff;
        assert!(decoder().decode_events(&encoded).is_err());
    }
}
