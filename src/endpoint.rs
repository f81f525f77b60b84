// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{
    Coordinator, DeliveryBuffer, Envelope, HandlerError, Header, IdSource, LogicalClock,
    MessageId, Payload, Transport,
};
use crossbeam::channel;
use im::OrdSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, trace, warn};

/// The application's receive side. Called once per delivered message, on
/// the endpoint's delivery thread, in the agreed total order. An error is
/// logged and the pipeline continues with the next message.
pub trait DeliveryHandler: Send {
    fn deliver(&mut self, payload: Payload) -> Result<(), HandlerError>;
}

/// Work items drained by the sender thread.
enum Work<Peer: Ord + Clone + Debug + Hash> {
    Fanout {
        id: MessageId<Peer>,
        seq: i64,
        destinations: OrdSet<Peer>,
        payload: Payload,
    },
    SingleDest {
        to: Peer,
        payload: Payload,
    },
    Shutdown,
}

/// State shared between the endpoint and its worker threads.
struct Core<Peer: Ord + Clone + Debug + Hash, T: Transport<Peer>> {
    local: Peer,
    ids: IdSource<Peer>,
    clock: LogicalClock,
    sends: Coordinator<Peer>,
    buffer: DeliveryBuffer<Peer>,
    transport: T,
    /// Last installed membership view; `None` until the first install.
    view: Mutex<Option<OrdSet<Peer>>>,
    outbox: channel::Sender<Work<Peer>>,
    stopping: AtomicBool,
}

/// `Endpoint` is one node's instance of the protocol. It wires the clock,
/// id source, sender-side [`Coordinator`] and receiver-side
/// [`DeliveryBuffer`] together, owns the two worker threads (outbound
/// fan-out and in-order delivery), and translates the transport's up/down
/// calls into protocol steps.
///
/// Down-calls ([`anycast`](Endpoint::anycast)) and up-calls
/// ([`receive`](Endpoint::receive), [`view_changed`](Endpoint::view_changed))
/// may arrive on any thread concurrently; apart from handing work to the
/// sender thread, header dispatch runs synchronously on the calling thread.
///
/// As with the rest of this crate, routing bytes between peers is the
/// embedding application's job: it implements [`Transport`] for the send
/// side and calls `receive` with whatever arrives.
pub struct Endpoint<Peer: Ord + Clone + Debug + Hash, T: Transport<Peer>> {
    core: Arc<Core<Peer, T>>,
    inbox: Mutex<Option<channel::Receiver<Work<Peer>>>>,
    sender_thread: Mutex<Option<thread::JoinHandle<()>>>,
    delivery_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<Peer, T> Endpoint<Peer, T>
where
    Peer: Ord + Clone + Debug + Hash + Send + Sync + 'static,
    T: Transport<Peer> + 'static,
{
    pub fn new(local: Peer, transport: T) -> Self {
        let (outbox, inbox) = channel::unbounded();
        let core = Core {
            ids: IdSource::new(local.clone()),
            clock: LogicalClock::new(),
            sends: Coordinator::new(local.clone()),
            buffer: DeliveryBuffer::new(),
            transport,
            view: Mutex::new(None),
            outbox,
            stopping: AtomicBool::new(false),
            local,
        };
        Endpoint {
            core: Arc::new(core),
            inbox: Mutex::new(Some(inbox)),
            sender_thread: Mutex::new(None),
            delivery_thread: Mutex::new(None),
        }
    }

    pub fn local(&self) -> &Peer {
        &self.core.local
    }

    /// Spawn the sender and delivery threads. May be called once per
    /// endpoint; calling it twice is a programming error.
    pub fn start<H: DeliveryHandler + 'static>(&self, handler: H) {
        let inbox = self
            .inbox
            .lock()
            .expect("inbox lock poisoned")
            .take()
            .expect("endpoint already started");

        let core = self.core.clone();
        let sender = thread::Builder::new()
            .name("unison-sender".into())
            .spawn(move || sender_loop(core, inbox))
            .expect("failed to spawn sender thread");
        *self.sender_thread.lock().expect("sender handle poisoned") = Some(sender);

        let core = self.core.clone();
        let delivery = thread::Builder::new()
            .name("unison-delivery".into())
            .spawn(move || delivery_loop(core, handler))
            .expect("failed to spawn delivery thread");
        *self.delivery_thread.lock().expect("delivery handle poisoned") = Some(delivery);
    }

    /// Fire-and-forget anycast to a sender-chosen destination set.
    /// Completion is signaled only by eventual delivery, possibly to self.
    /// An empty destination set is a programming error and panics.
    pub fn anycast(&self, destinations: OrdSet<Peer>, payload: Payload) {
        assert!(
            !destinations.is_empty(),
            "anycast requires at least one destination"
        );
        if destinations.len() == 1 {
            // Nothing to order against: skip agreement entirely.
            let dest = destinations.iter().next().expect("non-empty set").clone();
            if dest == self.core.local {
                trace!("single-destination anycast to self, delivering directly");
                self.core.buffer.deliver_single_destination(payload);
            } else {
                trace!("single-destination anycast to {:?}", dest);
                self.enqueue(Work::SingleDest { to: dest, payload });
            }
            return;
        }
        let deliver_to_self = destinations.contains(&self.core.local);
        let id = self.core.ids.next_id();
        let seq = self.core.clock.get_and_increment();
        debug!(
            "anycast {:?} to {} destinations, seq hint #{}",
            id,
            destinations.len(),
            seq
        );
        self.core
            .sends
            .begin_send(id.clone(), destinations.clone(), seq, deliver_to_self);
        if deliver_to_self {
            // Our own DATA is never sent to ourselves; fold it straight
            // into the delivery buffer with the hint as the proposal.
            self.core
                .buffer
                .add_provisional(id.clone(), payload.clone(), seq);
        }
        self.enqueue(Work::Fanout {
            id,
            seq,
            destinations,
            payload,
        });
    }

    /// Up-call from the transport: one incoming envelope, dispatched by
    /// header kind on the calling thread.
    pub fn receive(&self, from: Peer, envelope: Envelope<Peer>) {
        let Envelope { header, payload } = envelope;
        match header {
            Header::Data {
                id,
                seq,
                destinations: _,
            } => {
                let proposal = self.core.clock.update_and_get(seq);
                trace!("DATA {:?} from {:?}, proposing #{}", id, from, proposal);
                self.core.buffer.add_provisional(id.clone(), payload, proposal);
                let reply = Envelope::control(Header::Propose { id, seq: proposal });
                if let Err(e) = self.core.transport.unicast(&from, reply) {
                    warn!("PROPOSE send to {:?} failed: {}", from, e);
                }
            }
            Header::Propose { id, seq } => {
                trace!("PROPOSE #{} for {:?} from {:?}", seq, id, from);
                if let Some(final_seq) = self.core.sends.on_propose(&id, &from, seq) {
                    self.core.clock.update(final_seq);
                    self.finish_send(&id, final_seq);
                }
            }
            Header::Final { id, seq } => {
                trace!("FINAL #{} for {:?}", seq, id);
                self.core.clock.update(seq);
                self.core.buffer.promote_to_final(&id, seq);
            }
            Header::SingleDestination => {
                trace!("single-destination message from {:?}", from);
                self.core.buffer.deliver_single_destination(payload);
            }
        }
    }

    /// Up-call from the membership service: a new view was installed. The
    /// departed set is the previous view minus the new one; every pending
    /// send stops waiting on departed members, and any send thereby
    /// completed gets its FINAL fan-out here and now.
    pub fn view_changed<I: IntoIterator<Item = Peer>>(&self, new_view: I) {
        let members: OrdSet<Peer> = new_view.into_iter().collect();
        let departed: OrdSet<Peer> = {
            let mut view = self.core.view.lock().expect("view lock poisoned");
            match view.replace(members.clone()) {
                Some(previous) => previous
                    .iter()
                    .filter(|p| !members.contains(*p))
                    .cloned()
                    .collect(),
                None => OrdSet::new(),
            }
        };
        if departed.is_empty() {
            return;
        }
        debug!("view change: {} member(s) departed", departed.len());
        for (id, final_seq) in self.core.sends.on_view_change(&departed) {
            self.core.clock.update(final_seq);
            self.finish_send(&id, final_seq);
        }
        self.core.buffer.remove_leavers(&departed);
    }

    /// Stop both worker threads and reset protocol state. Idempotent. Any
    /// message not yet delivered is dropped.
    pub fn stop(&self) {
        self.core.stopping.store(true, Ordering::Relaxed);
        let _ = self.core.outbox.send(Work::Shutdown);
        self.core.buffer.shutdown();
        if let Some(handle) = self
            .sender_thread
            .lock()
            .expect("sender handle poisoned")
            .take()
        {
            let _ = handle.join();
        }
        if let Some(handle) = self
            .delivery_thread
            .lock()
            .expect("delivery handle poisoned")
            .take()
        {
            let _ = handle.join();
        }
        self.core.sends.clear();
        self.core.buffer.clear();
    }

    /// Fan out FINAL for a completed send and retire its pending entry.
    /// Departed members are filtered out of the fan-out; they cannot
    /// receive it anyway.
    fn finish_send(&self, id: &MessageId<Peer>, final_seq: i64) {
        let destinations = match self.core.sends.destinations_of(id) {
            Some(d) => d,
            None => {
                debug!("finalizing unknown message {:?}, ignoring", id);
                return;
            }
        };
        let live = {
            let view = self.core.view.lock().expect("view lock poisoned");
            match &*view {
                Some(members) => destinations.clone().intersection(members.clone()),
                None => destinations,
            }
        };
        debug!(
            "FINAL #{} for {:?}, fanning out to {} destination(s)",
            final_seq,
            id,
            live.len()
        );
        for peer in live.iter() {
            if *peer == self.core.local {
                continue;
            }
            let env = Envelope::control(Header::Final {
                id: id.clone(),
                seq: final_seq,
            });
            if let Err(e) = self.core.transport.unicast(peer, env) {
                warn!("FINAL send to {:?} failed: {}", peer, e);
            }
        }
        if self.core.sends.mark_sent(id) {
            self.core.buffer.promote_to_final(id, final_seq);
        }
    }

    fn enqueue(&self, work: Work<Peer>) {
        if self.core.outbox.send(work).is_err() {
            debug!("endpoint stopped, dropping outbound work");
        }
    }
}

impl<Peer: Ord + Clone + Debug + Hash, T: Transport<Peer>> Drop for Endpoint<Peer, T> {
    fn drop(&mut self) {
        self.core.stopping.store(true, Ordering::Relaxed);
        let _ = self.core.outbox.send(Work::Shutdown);
        self.core.buffer.shutdown();
        if let Ok(mut h) = self.sender_thread.lock() {
            if let Some(handle) = h.take() {
                let _ = handle.join();
            }
        }
        if let Ok(mut h) = self.delivery_thread.lock() {
            if let Some(handle) = h.take() {
                let _ = handle.join();
            }
        }
    }
}

fn sender_loop<Peer, T>(core: Arc<Core<Peer, T>>, inbox: channel::Receiver<Work<Peer>>)
where
    Peer: Ord + Clone + Debug + Hash + Send + Sync + 'static,
    T: Transport<Peer> + 'static,
{
    while let Ok(work) = inbox.recv() {
        match work {
            Work::Shutdown => break,
            Work::Fanout {
                id,
                seq,
                destinations,
                payload,
            } => {
                for peer in destinations.iter() {
                    // Re-check between unicasts so a stop request does not
                    // wait out a whole fan-out against a slow transport.
                    if core.stopping.load(Ordering::Relaxed) {
                        break;
                    }
                    if *peer == core.local {
                        continue;
                    }
                    let env = Envelope::new(
                        Header::Data {
                            id: id.clone(),
                            seq,
                            destinations: destinations.clone(),
                        },
                        payload.clone(),
                    );
                    if let Err(e) = core.transport.unicast(peer, env) {
                        warn!("DATA send to {:?} failed: {}", peer, e);
                    }
                }
            }
            Work::SingleDest { to, payload } => {
                let env = Envelope::new(Header::SingleDestination, payload);
                if let Err(e) = core.transport.unicast(&to, env) {
                    warn!("single-destination send to {:?} failed: {}", to, e);
                }
            }
        }
    }
    trace!("sender thread exiting");
}

fn delivery_loop<Peer, T, H>(core: Arc<Core<Peer, T>>, mut handler: H)
where
    Peer: Ord + Clone + Debug + Hash + Send + Sync + 'static,
    T: Transport<Peer> + 'static,
    H: DeliveryHandler,
{
    while let Some(batch) = core.buffer.next_batch() {
        for payload in batch {
            if let Err(e) = handler.deliver(payload) {
                warn!("application rejected a delivery: {}", e);
            }
        }
    }
    trace!("delivery thread exiting");
}
