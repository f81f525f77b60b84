// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{MessageId, Payload};
use im::OrdSet;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Condvar, Mutex};
use tracing::{debug, trace};

#[derive(Debug)]
struct Entry {
    payload: Payload,
    ready: bool,
}

#[derive(Debug)]
struct Inner<Peer: Ord + Clone + Debug + Hash> {
    /// Not-yet-delivered entries, ordered by (sequence number, id). The
    /// sequence number is provisional until the entry is promoted, so the
    /// same entry occupies exactly one key at a time but may move once.
    entries: BTreeMap<(i64, MessageId<Peer>), Entry>,
    /// Identity index: where each buffered message currently sorts. This is
    /// what lets a FINAL find its entry after the provisional key is gone.
    positions: HashMap<MessageId<Peer>, i64>,
    /// Side channel for single-destination messages, which bypass ordering
    /// entirely and are always drained first.
    express: VecDeque<Payload>,
    stopped: bool,
}

/// `DeliveryBuffer` is the receiver's half of the protocol: the per-node
/// ordered set of messages that have arrived but may not be handed to the
/// application yet.
///
/// An entry goes in provisional (not ready) when its DATA arrives, carrying
/// the local proposal as its sort key. When the matching FINAL arrives the
/// entry is re-keyed to the agreed position — remove-then-reinsert, under
/// the same lock — and marked ready. Delivery takes the longest prefix of
/// ready entries and must stop at the first non-ready one: that entry's
/// final position may yet be smaller than ready entries sorting after it.
///
/// One mutex guards all state; `next_batch` is the only blocking call and
/// waits on the paired condvar in the standard monitor pattern.
#[derive(Debug)]
pub struct DeliveryBuffer<Peer: Ord + Clone + Debug + Hash> {
    inner: Mutex<Inner<Peer>>,
    readable: Condvar,
}

impl<Peer: Ord + Clone + Debug + Hash> DeliveryBuffer<Peer> {
    pub fn new() -> Self {
        DeliveryBuffer {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                positions: HashMap::new(),
                express: VecDeque::new(),
                stopped: false,
            }),
            readable: Condvar::new(),
        }
    }

    /// Insert a not-ready entry at its provisional position. A duplicate id
    /// (the transport is at-least-once) leaves the existing entry alone.
    pub fn add_provisional(&self, id: MessageId<Peer>, payload: Payload, local_seq: i64) {
        let mut inner = self.inner.lock().expect("buffer lock poisoned");
        if inner.positions.contains_key(&id) {
            debug!("duplicate DATA for buffered message {:?}, ignoring", id);
            return;
        }
        trace!("{:?} buffered provisionally at #{}", id, local_seq);
        inner.positions.insert(id.clone(), local_seq);
        inner.entries.insert(
            (local_seq, id),
            Entry {
                payload,
                ready: false,
            },
        );
    }

    /// Move an entry to its agreed position and mark it deliverable. The
    /// entry is found by identity, not by its current sort key. A FINAL for
    /// an id we no longer (or never) hold is ignored; late retransmissions
    /// and view-change races make that an expected case.
    pub fn promote_to_final(&self, id: &MessageId<Peer>, final_seq: i64) {
        let mut inner = self.inner.lock().expect("buffer lock poisoned");
        let provisional = match inner.positions.get(id) {
            Some(seq) => *seq,
            None => {
                debug!("FINAL for unknown message {:?}, ignoring", id);
                return;
            }
        };
        let entry = match inner.entries.remove(&(provisional, id.clone())) {
            Some(mut entry) => {
                entry.ready = true;
                entry
            }
            None => {
                debug!("FINAL for unindexed message {:?}, ignoring", id);
                return;
            }
        };
        trace!("{:?} promoted #{} -> #{}", id, provisional, final_seq);
        inner.positions.insert(id.clone(), final_seq);
        inner.entries.insert((final_seq, id.clone()), entry);
        // Wake the delivery thread if the head is now deliverable: either
        // this entry became the ready head, or it moved off the head
        // position and exposed a ready entry that was fenced off behind it.
        let head_ready = inner.entries.values().next().map_or(false, |e| e.ready);
        if head_ready {
            self.readable.notify_all();
        }
    }

    /// Fast-path enqueue for a message with exactly one destination: no
    /// ordering, straight onto the side channel.
    pub fn deliver_single_destination(&self, payload: Payload) {
        let mut inner = self.inner.lock().expect("buffer lock poisoned");
        inner.express.push_back(payload);
        self.readable.notify_all();
    }

    /// Block until something is deliverable, then return it: the whole side
    /// channel if non-empty, otherwise the maximal ready prefix of the
    /// ordered set. Returns `None` once the buffer has been shut down.
    pub fn next_batch(&self) -> Option<Vec<Payload>> {
        let mut inner = self.inner.lock().expect("buffer lock poisoned");
        loop {
            if inner.stopped {
                return None;
            }
            if !inner.express.is_empty() {
                return Some(inner.express.drain(..).collect());
            }
            let head_ready = match inner.entries.values().next() {
                Some(entry) => entry.ready,
                None => false,
            };
            if head_ready {
                break;
            }
            inner = self.readable.wait(inner).expect("buffer lock poisoned");
        }
        let mut batch = Vec::new();
        loop {
            let key = match inner.entries.iter().next() {
                Some((key, entry)) if entry.ready => key.clone(),
                _ => break,
            };
            let entry = inner.entries.remove(&key).expect("entry key vanished");
            inner.positions.remove(&key.1);
            trace!("delivering {:?} at #{}", key.1, key.0);
            batch.push(entry.payload);
        }
        Some(batch)
    }

    /// Best-effort cleanup after a membership change: drop not-ready
    /// entries whose originator departed, since nobody is left to finalize
    /// them. Ready entries stay; they will be delivered normally. This is
    /// garbage collection, not the liveness mechanism — that is the
    /// sender-side view-change path.
    pub fn remove_leavers(&self, departed: &OrdSet<Peer>) {
        let mut inner = self.inner.lock().expect("buffer lock poisoned");
        let doomed: Vec<(i64, MessageId<Peer>)> = inner
            .entries
            .iter()
            .filter(|(key, entry)| !entry.ready && departed.contains(&key.1.origin))
            .map(|(key, _)| key.clone())
            .collect();
        if doomed.is_empty() {
            return;
        }
        debug!("dropping {} entr(ies) from departed originators", doomed.len());
        for key in doomed {
            inner.entries.remove(&key);
            inner.positions.remove(&key.1);
        }
        // The head may have become ready.
        self.readable.notify_all();
    }

    /// Empty the ordered set and the side channel. Used on reset.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("buffer lock poisoned");
        inner.entries.clear();
        inner.positions.clear();
        inner.express.clear();
    }

    /// Release any blocked `next_batch` call permanently; it (and all
    /// future calls) will return `None`.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("buffer lock poisoned");
        inner.stopped = true;
        self.readable.notify_all();
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("buffer lock poisoned");
        inner.entries.len() + inner.express.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<Peer: Ord + Clone + Debug + Hash> Default for DeliveryBuffer<Peer> {
    fn default() -> Self {
        DeliveryBuffer::new()
    }
}
