// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * This crate implements total-order _anycast_: a message is sent to an
 * arbitrary, sender-chosen subset of cluster members, and every member of
 * that subset delivers it in the same relative order as every other message
 * whose destination subset overlaps with it. The ordering protocol is the
 * classic two-round-trip one usually attributed to Skeen, which has some
 * desirable properties:
 *
 *   - There is no central sequencer: the delivery position of each message
 *     is agreed among exactly the members it is addressed to, so disjoint
 *     groups never synchronize with (or wait on) one another.
 *
 *   - Destination sets are chosen per-message and can be any subset of the
 *     cluster; two messages only pay an ordering cost where their sets
 *     actually intersect.
 *
 *   - An anycast to a single destination needs no agreement at all and
 *     short-circuits to a plain unicast.
 *
 * The price is the usual one for decentralized agreement:
 *
 *   - Two round trips (DATA out, PROPOSE back, FINAL out) before any
 *     destination may deliver.
 *
 *   - A sender waits on _every_ destination's proposal, so a destination
 *     that crashes mid-protocol stalls that message until the membership
 *     service reports the crash and the sender force-completes the round.
 *     Liveness is tied to failure-detector latency.
 *
 * Responsibility for moving bytes between peers is left to the client of
 * this library: it supplies a reliable point-to-point [`Transport`] and
 * feeds incoming envelopes and membership changes into the [`Endpoint`].
 * This layer assumes at-least-once, eventually-ordered delivery of each
 * individual point-to-point message and implements only the agreement and
 * ordering logic on top of that.
 *
 * ## Reference
 *
 * Défago, Schiper, Urbán. Total order broadcast and multicast algorithms:
 * Taxonomy and survey. ACM Computing Surveys 36(4), 2004. The protocol here
 * is their "destinations agreement" class, in the form first sketched by
 * Dale Skeen for the ISIS toolkit.
 *
 * ## Name
 *
 * Wikipedia:
 *
 * > In music, unison is two or more musical parts that sound either the
 * > same pitch or pitches separated by intervals of one or more octaves,
 * > usually at the same time.
 *
 * Every destination a message is addressed to delivers it at the same
 * position, at whatever tempo each plays.
 */

// TODO: batch FINAL fan-out for messages force-completed together by one
// view change; today each gets its own per-destination unicast pass.

mod buffer;
mod clock;
mod coordinator;
mod endpoint;
mod header;
mod id;
mod transport;

pub use buffer::DeliveryBuffer;
pub use clock::LogicalClock;
pub use coordinator::Coordinator;
pub use endpoint::{DeliveryHandler, Endpoint};
pub use header::{Envelope, Header, Payload};
pub use id::{IdSource, MessageId};
pub use transport::{HandlerError, Transport, TransportError};

#[cfg(test)]
mod tests;
