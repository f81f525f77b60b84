// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::MessageId;
use im::OrdSet;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Mutex;
use tracing::{debug, trace};

/// Sender-side bookkeeping for one in-flight anycast: who still owes us a
/// proposal, and the largest proposal seen so far. The entry lives from
/// `begin_send` until the FINAL fan-out for it has gone out.
#[derive(Debug)]
struct PendingSend<Peer: Ord + Clone + Debug + Hash> {
    destinations: OrdSet<Peer>,
    pending_acks: OrdSet<Peer>,
    highest_proposal: i64,
    final_sent: bool,
    deliver_to_self: bool,
}

/// `Coordinator` is the originator's half of the agreement: it tracks every
/// anycast this node has in flight, folds in PROPOSE messages as they
/// arrive, and decides the final delivery position as the max of all
/// proposals once the last destination has answered.
///
/// Membership change is the one escape hatch from waiting: a destination
/// reported departed is treated as implicitly agreeing, so a crashed
/// destination cannot leave the sender pending forever.
///
/// All state is owned here, behind a single internal lock; no operation
/// blocks beyond that lock.
#[derive(Debug)]
pub struct Coordinator<Peer: Ord + Clone + Debug + Hash> {
    local: Peer,
    pending: Mutex<BTreeMap<MessageId<Peer>, PendingSend<Peer>>>,
}

impl<Peer: Ord + Clone + Debug + Hash> Coordinator<Peer> {
    pub fn new(local: Peer) -> Self {
        Coordinator {
            local,
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a new in-flight anycast. `initial_seq` is the clock value
    /// embedded in the outgoing DATA header. If the local node is itself a
    /// destination it is recorded as having proposed already: its copy of
    /// the message is folded straight into the delivery buffer rather than
    /// sent over the wire.
    ///
    /// An empty destination set is a programming error and panics.
    pub fn begin_send(
        &self,
        id: MessageId<Peer>,
        destinations: OrdSet<Peer>,
        initial_seq: i64,
        deliver_to_self: bool,
    ) {
        assert!(
            !destinations.is_empty(),
            "anycast registered with no destinations"
        );
        let pending_acks = if deliver_to_self {
            destinations.without(&self.local)
        } else {
            destinations.clone()
        };
        let ps = PendingSend {
            destinations,
            pending_acks,
            highest_proposal: initial_seq,
            final_sent: false,
            deliver_to_self,
        };
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        trace!("{:?} pending, awaiting {} proposals", id, ps.pending_acks.len());
        pending.insert(id, ps);
    }

    /// Fold in one destination's proposal. Returns the final sequence
    /// number iff this proposal was the last one outstanding and no FINAL
    /// has been produced for this message yet; duplicate or late proposals
    /// return nothing.
    pub fn on_propose(&self, id: &MessageId<Peer>, from: &Peer, proposed: i64) -> Option<i64> {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        let ps = match pending.get_mut(id) {
            Some(ps) => ps,
            None => {
                // Expected under duplicate delivery or after a view-change
                // already completed the round.
                debug!("proposal for unknown message {:?}, ignoring", id);
                return None;
            }
        };
        if ps.final_sent {
            debug!("proposal for already-final message {:?}, ignoring", id);
            return None;
        }
        if proposed > ps.highest_proposal {
            ps.highest_proposal = proposed;
        }
        ps.pending_acks.remove(from);
        if ps.pending_acks.is_empty() {
            ps.final_sent = true;
            Some(ps.highest_proposal)
        } else {
            trace!(
                "{:?} still awaiting {} proposals",
                id,
                ps.pending_acks.len()
            );
            None
        }
    }

    /// Reconcile every in-flight anycast with a membership change: each
    /// departed peer is struck from the waiting sets, its silence standing
    /// in for agreement. Returns the messages that thereby became ready to
    /// finalize, with their final sequence numbers.
    pub fn on_view_change(&self, departed: &OrdSet<Peer>) -> Vec<(MessageId<Peer>, i64)> {
        let mut ready = Vec::new();
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        for (id, ps) in pending.iter_mut() {
            if ps.final_sent {
                continue;
            }
            let before = ps.pending_acks.len();
            for peer in departed.iter() {
                ps.pending_acks.remove(peer);
            }
            if ps.pending_acks.len() != before {
                debug!(
                    "{:?}: {} destination(s) departed before proposing",
                    id,
                    before - ps.pending_acks.len()
                );
            }
            if ps.pending_acks.is_empty() {
                ps.final_sent = true;
                ready.push((id.clone(), ps.highest_proposal));
            }
        }
        ready
    }

    /// The destination set recorded for an in-flight anycast, if any.
    pub fn destinations_of(&self, id: &MessageId<Peer>) -> Option<OrdSet<Peer>> {
        let pending = self.pending.lock().expect("pending lock poisoned");
        pending.get(id).map(|ps| ps.destinations.clone())
    }

    /// Drop the pending entry once its FINAL fan-out has gone out. Returns
    /// whether the local node was among the destinations, so the caller
    /// knows to promote its own buffered copy. Idempotent: a second call
    /// for the same id returns false.
    pub fn mark_sent(&self, id: &MessageId<Peer>) -> bool {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        match pending.remove(id) {
            Some(ps) => ps.deliver_to_self,
            None => false,
        }
    }

    /// Drop every pending send. Used on protocol stop/reset.
    pub fn clear(&self) {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.lock().expect("pending lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
