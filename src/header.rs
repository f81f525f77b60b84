// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::MessageId;
use im::OrdSet;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::hash::Hash;

/// Application payload bytes. This crate never inspects them.
pub type Payload = Vec<u8>;

/// The four message kinds the protocol exchanges. Sequence numbers mean
/// different things per kind: a DATA message embeds the originator's clock
/// value as a hint for destination proposals, a PROPOSE carries the
/// destination's proposed delivery position back, and a FINAL carries the
/// agreed position out. A single-destination anycast has nothing to order
/// against and carries no sequence number at all.
///
/// The destination set travels on DATA only. Destinations do not need each
/// other's identities to do their own job; the set records the consensus
/// group the originator is collecting proposals from.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Header<Peer: Ord + Clone + Debug + Hash> {
    Data {
        id: MessageId<Peer>,
        seq: i64,
        destinations: OrdSet<Peer>,
    },
    Propose {
        id: MessageId<Peer>,
        seq: i64,
    },
    Final {
        id: MessageId<Peer>,
        seq: i64,
    },
    SingleDestination,
}

/// One point-to-point protocol message: a header plus the payload bytes it
/// travels with. PROPOSE and FINAL envelopes carry an empty payload; the
/// byte-level encoding of the whole envelope is the transport's concern.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<Peer: Ord + Clone + Debug + Hash> {
    pub header: Header<Peer>,
    pub payload: Payload,
}

impl<Peer: Ord + Clone + Debug + Hash> Envelope<Peer> {
    pub fn new(header: Header<Peer>, payload: Payload) -> Self {
        Envelope { header, payload }
    }

    /// Header-only envelope, for the payload-less protocol rounds.
    pub fn control(header: Header<Peer>) -> Self {
        Envelope {
            header,
            payload: Payload::new(),
        }
    }
}
