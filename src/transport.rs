// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::Envelope;
use std::fmt::Debug;
use std::hash::Hash;
use thiserror::Error;

/// The point-to-point send half this crate consumes. Implementations are
/// expected to be _reliable_ unicast: retransmission, fragmentation and
/// connection management all live below this seam, and each envelope is
/// assumed to arrive at-least-once, eventually, in per-link order.
///
/// A failed send is logged by the caller and not retried here; if the
/// destination never responds, membership change is the recovery path.
pub trait Transport<Peer: Ord + Clone + Debug + Hash>: Send + Sync {
    fn unicast(&self, to: &Peer, envelope: Envelope<Peer>) -> Result<(), TransportError>;
}

/// Errors surfaced by a [`Transport`] implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The destination is not currently reachable. The membership service
    /// will eventually report it departed if it stays that way.
    #[error("destination unreachable: {0}")]
    Unreachable(String),

    /// The transport has been shut down; no further sends are possible.
    #[error("transport closed")]
    Closed,

    /// Any other transport-specific failure, already rendered.
    #[error("transport error: {0}")]
    Other(String),
}

/// Error returned by an application's delivery handler. The delivery
/// pipeline logs it and moves on to the next message; one bad payload never
/// stalls ordering.
#[derive(Debug, Error)]
#[error("delivery handler failed: {0}")]
pub struct HandlerError(pub String);
