// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use std::sync::Mutex;
use tracing::trace;

/// `LogicalClock` is the per-node proposal counter: a single signed value
/// that only moves forward, advanced either by local use or by catching up
/// to a larger value observed from another peer.
///
/// The load-bearing operation is `update_and_get`, used when proposing a
/// delivery position for an incoming message: the value it hands out is at
/// least as large as anything this node has already proposed, issued or
/// observed. Once a FINAL value is chosen as the max of per-destination
/// proposals, no destination can later propose a smaller value for a
/// different message, so an entry that sorts before a finalized one is
/// always still awaiting its own FINAL; the delivery buffer's stop-at-first-
/// non-ready rule is safe exactly because of this.
#[derive(Debug, Default)]
pub struct LogicalClock {
    current: Mutex<i64>,
}

impl LogicalClock {
    pub fn new() -> Self {
        LogicalClock {
            current: Mutex::new(0),
        }
    }

    /// Take the current value for local use and advance past it.
    pub fn get_and_increment(&self) -> i64 {
        let mut cur = self.current.lock().expect("clock lock poisoned");
        let val = *cur;
        *cur += 1;
        trace!("clock advanced to #{} (local)", *cur);
        val
    }

    /// Catch up to a value observed elsewhere: the clock moves to one past
    /// `seen` unless it is already beyond that.
    pub fn update(&self, seen: i64) {
        let mut cur = self.current.lock().expect("clock lock poisoned");
        if seen + 1 > *cur {
            *cur = seen + 1;
            trace!("clock advanced to #{} (observed #{})", *cur, seen);
        }
    }

    /// Combined catch-up and take, for proposing: returns max(current,
    /// `seen`) and leaves the clock strictly past the returned value.
    pub fn update_and_get(&self, seen: i64) -> i64 {
        let mut cur = self.current.lock().expect("clock lock poisoned");
        if *cur >= seen {
            let val = *cur;
            *cur += 1;
            trace!("clock advanced to #{} (proposal)", *cur);
            val
        } else {
            *cur = seen + 1;
            trace!("clock advanced to #{} (proposal, caught up)", *cur);
            seen
        }
    }
}
