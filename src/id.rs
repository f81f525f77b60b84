// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

/// `MessageId` is the globally unique identifier of one anycast message:
/// the originating peer plus a counter that peer only ever counts upward.
/// It keys all per-message state on both the sender and receiver sides, and
/// it is never reused.
///
/// Ids are totally ordered, counter first and originator second. Two
/// distinct originators rarely collide on a counter value, but the
/// tie-break keeps the order strict, which the delivery buffer relies on
/// for its sort keys.
///
/// The `Peer` parameter is the same user-provided notion of a peer address
/// used throughout this crate: anything Ord+Clone, ideally something small
/// you don't mind transmitting in every header.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId<Peer: Ord + Clone + Debug + Hash> {
    pub counter: u64,
    pub origin: Peer,
}

impl<Peer: Ord + Clone + Debug + Hash> MessageId<Peer> {
    pub fn new(origin: Peer, counter: u64) -> Self {
        MessageId { counter, origin }
    }
}

/// Mints fresh `MessageId`s for the local peer. One per anycast, strictly
/// increasing; never blocks and never fails.
#[derive(Debug)]
pub struct IdSource<Peer: Ord + Clone + Debug + Hash> {
    origin: Peer,
    counter: AtomicU64,
}

impl<Peer: Ord + Clone + Debug + Hash> IdSource<Peer> {
    pub fn new(origin: Peer) -> Self {
        IdSource {
            origin,
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> MessageId<Peer> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        MessageId::new(self.origin.clone(), n)
    }
}
