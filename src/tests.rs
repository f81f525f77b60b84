// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::*;
use im::OrdSet;
use itertools::Itertools;
use std::collections::BTreeMap;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

type Peer = String;

fn init_logging() {
    let _ = tracing_subscriber::fmt::try_init();
}

fn set(names: &[&str]) -> OrdSet<Peer> {
    names.iter().map(|n| n.to_string()).collect()
}

fn mid(origin: &str, counter: u64) -> MessageId<Peer> {
    MessageId::new(origin.to_string(), counter)
}

/// In-process wiring: every peer's transport pushes onto one shared queue,
/// and the test pump pops envelopes and hands them to the addressee. Sends
/// to a crashed peer fall on the floor, like the real network.
#[derive(Clone, Default)]
struct Router {
    wires: Arc<Mutex<Vec<(Peer, Peer, Envelope<Peer>)>>>,
    headers: Arc<Mutex<Vec<Header<Peer>>>>,
}

impl Router {
    fn wire(&self, from: &str) -> Wire {
        Wire {
            from: from.to_string(),
            router: self.clone(),
        }
    }

    fn drain(&self) -> Vec<(Peer, Peer, Envelope<Peer>)> {
        let mut wires = self.wires.lock().unwrap();
        wires.drain(..).collect()
    }

    fn header_log(&self) -> Vec<Header<Peer>> {
        self.headers.lock().unwrap().clone()
    }
}

struct Wire {
    from: Peer,
    router: Router,
}

impl Transport<Peer> for Wire {
    fn unicast(&self, to: &Peer, envelope: Envelope<Peer>) -> Result<(), TransportError> {
        self.router
            .headers
            .lock()
            .unwrap()
            .push(envelope.header.clone());
        self.router
            .wires
            .lock()
            .unwrap()
            .push((self.from.clone(), to.clone(), envelope));
        Ok(())
    }
}

#[derive(Clone, Default)]
struct Recorder {
    log: Arc<Mutex<Vec<Payload>>>,
}

impl Recorder {
    fn delivered(&self) -> Vec<Payload> {
        self.log.lock().unwrap().clone()
    }
}

impl DeliveryHandler for Recorder {
    fn deliver(&mut self, payload: Payload) -> Result<(), HandlerError> {
        self.log.lock().unwrap().push(payload);
        Ok(())
    }
}

/// Records every attempt but rejects the first one.
#[derive(Clone, Default)]
struct FlakyRecorder {
    attempts: Arc<Mutex<Vec<Payload>>>,
}

impl FlakyRecorder {
    fn attempts(&self) -> Vec<Payload> {
        self.attempts.lock().unwrap().clone()
    }
}

impl DeliveryHandler for FlakyRecorder {
    fn deliver(&mut self, payload: Payload) -> Result<(), HandlerError> {
        let mut attempts = self.attempts.lock().unwrap();
        attempts.push(payload);
        if attempts.len() == 1 {
            Err(HandlerError("synthetic handler failure".into()))
        } else {
            Ok(())
        }
    }
}

struct Cluster {
    router: Router,
    peers: BTreeMap<Peer, Arc<Endpoint<Peer, Wire>>>,
    logs: BTreeMap<Peer, Recorder>,
}

impl Cluster {
    fn empty() -> Self {
        Cluster {
            router: Router::default(),
            peers: BTreeMap::new(),
            logs: BTreeMap::new(),
        }
    }

    fn new(names: &[&str]) -> Self {
        let mut cluster = Cluster::empty();
        for name in names {
            cluster.add_peer(name);
        }
        cluster.install_view(names);
        cluster
    }

    fn add_peer(&mut self, name: &str) {
        let log = Recorder::default();
        self.logs.insert(name.to_string(), log.clone());
        self.add_peer_with(name, log);
    }

    fn add_peer_with<H: DeliveryHandler + 'static>(&mut self, name: &str, handler: H) {
        let ep = Arc::new(Endpoint::new(name.to_string(), self.router.wire(name)));
        ep.start(handler);
        self.peers.insert(name.to_string(), ep);
    }

    fn install_view(&self, names: &[&str]) {
        for ep in self.peers.values() {
            ep.view_changed(names.iter().map(|n| n.to_string()));
        }
    }

    /// The peer stops receiving anything, silently, as a crashed node
    /// would. Its already-recorded deliveries stay inspectable.
    fn crash(&mut self, name: &str) {
        self.peers.remove(name);
    }

    fn anycast(&self, from: &str, to: &[&str], payload: &[u8]) {
        self.peers[from].anycast(set(to), payload.to_vec());
    }

    fn delivered(&self, name: &str) -> Vec<Payload> {
        self.logs[name].delivered()
    }

    /// Pump queued envelopes to their addressees until `done` holds or the
    /// time limit passes. Returns whether `done` ever held.
    fn settle_for<F>(&self, limit: Duration, done: F) -> bool
    where
        F: Fn(&Cluster) -> bool,
    {
        let deadline = Instant::now() + limit;
        loop {
            for (from, to, env) in self.router.drain() {
                if let Some(ep) = self.peers.get(&to) {
                    ep.receive(from, env);
                }
            }
            if done(self) {
                return true;
            }
            if Instant::now() > deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn settle<F>(&self, done: F) -> bool
    where
        F: Fn(&Cluster) -> bool,
    {
        self.settle_for(Duration::from_secs(5), done)
    }
}

// clock

#[test]
fn clock_is_strictly_monotonic() {
    let clock = LogicalClock::new();
    assert_eq!(clock.get_and_increment(), 0);
    assert_eq!(clock.get_and_increment(), 1);
    clock.update(10);
    assert_eq!(clock.get_and_increment(), 11);
    clock.update(3); // stale observation, no effect
    assert_eq!(clock.get_and_increment(), 12);
}

#[test]
fn proposals_never_regress() {
    let clock = LogicalClock::new();
    assert_eq!(clock.update_and_get(0), 0);
    assert_eq!(clock.update_and_get(5), 5);
    assert_eq!(clock.update_and_get(3), 6);
    assert_eq!(clock.update_and_get(6), 7);
}

// ids

#[test]
fn ids_are_fresh_and_counter_ordered() {
    let ids = IdSource::new("zebra".to_string());
    let first = ids.next_id();
    let second = ids.next_id();
    assert!(first < second);
    assert_eq!(first.origin, "zebra");
    // counter dominates; originator only breaks ties
    assert!(mid("zebra", 1) < mid("aardvark", 2));
    assert!(mid("aardvark", 1) < mid("zebra", 1));
}

// coordinator

#[test]
fn duplicate_or_late_proposals_are_ignored() {
    let coord = Coordinator::new("a".to_string());
    let id = mid("a", 0);
    coord.begin_send(id.clone(), set(&["b", "c"]), 0, false);
    assert_eq!(coord.on_propose(&id, &"b".to_string(), 3), None);
    // duplicate from b; its value still folds into the max
    assert_eq!(coord.on_propose(&id, &"b".to_string(), 9), None);
    assert_eq!(coord.on_propose(&id, &"c".to_string(), 4), Some(9));
    // post-finalization duplicates must not re-trigger a FINAL
    assert_eq!(coord.on_propose(&id, &"c".to_string(), 12), None);
    assert!(!coord.mark_sent(&id));
    assert!(!coord.mark_sent(&id));
    assert_eq!(coord.on_propose(&id, &"b".to_string(), 1), None);
}

#[test]
fn self_destination_counts_as_proposed() {
    let coord = Coordinator::new("a".to_string());
    let id = mid("a", 1);
    coord.begin_send(id.clone(), set(&["a", "b"]), 2, true);
    // only b's proposal is outstanding; the final is the max of b's value
    // and the embedded hint
    assert_eq!(coord.on_propose(&id, &"b".to_string(), 1), Some(2));
    assert!(coord.mark_sent(&id));
}

#[test]
fn view_change_forces_completion() {
    let coord = Coordinator::new("a".to_string());
    let id = mid("a", 2);
    coord.begin_send(id.clone(), set(&["b", "c", "d"]), 0, false);
    assert_eq!(coord.on_propose(&id, &"b".to_string(), 4), None);
    let ready = coord.on_view_change(&set(&["c", "d"]));
    assert_eq!(ready, vec![(id.clone(), 4)]);
    // a later view change must not finalize the same message again
    assert!(coord.on_view_change(&set(&["c"])).is_empty());
    assert!(!coord.mark_sent(&id));
    assert!(coord.is_empty());
}

#[test]
fn proposal_arrival_order_is_irrelevant() {
    let proposals: Vec<(&str, i64)> = vec![("b", 3), ("c", 1), ("d", 2)];
    for perm in proposals.iter().permutations(proposals.len()) {
        let coord = Coordinator::new("a".to_string());
        let id = mid("a", 7);
        coord.begin_send(id.clone(), set(&["b", "c", "d"]), 0, false);
        let mut finals = Vec::new();
        for p in perm {
            let (peer, seq) = *p;
            if let Some(f) = coord.on_propose(&id, &peer.to_string(), seq) {
                finals.push(f);
            }
        }
        // exactly one FINAL per message, and it is >= every proposal made
        assert_eq!(finals, vec![3]);
    }
}

#[test]
#[should_panic(expected = "no destinations")]
fn empty_destination_set_is_a_programming_error() {
    let coord = Coordinator::new("a".to_string());
    coord.begin_send(mid("a", 0), OrdSet::new(), 0, false);
}

// delivery buffer

#[test]
fn nothing_is_delivered_before_its_final() {
    let buffer = Arc::new(DeliveryBuffer::<Peer>::new());
    buffer.add_provisional(mid("a", 0), b"m1".to_vec(), 1);
    let (tx, rx) = mpsc::channel();
    let consumer_buffer = buffer.clone();
    let consumer = thread::spawn(move || {
        tx.send(consumer_buffer.next_batch()).unwrap();
    });
    // head entry is provisional: the consumer must stay blocked
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    buffer.promote_to_final(&mid("a", 0), 4);
    let batch = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(batch, Some(vec![b"m1".to_vec()]));
    consumer.join().unwrap();
}

#[test]
fn promotion_rekeys_past_ready_entries() {
    let buffer = Arc::new(DeliveryBuffer::<Peer>::new());
    buffer.add_provisional(mid("a", 0), b"m1".to_vec(), 1);
    buffer.add_provisional(mid("b", 0), b"m2".to_vec(), 2);
    buffer.promote_to_final(&mid("b", 0), 5);
    let (tx, rx) = mpsc::channel();
    let consumer_buffer = buffer.clone();
    let consumer = thread::spawn(move || {
        tx.send(consumer_buffer.next_batch()).unwrap();
    });
    // m2 is ready but fenced off by the still-provisional m1
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    // m1's final lands after m2's: both become deliverable, m2 first
    buffer.promote_to_final(&mid("a", 0), 7);
    let batch = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(batch, Some(vec![b"m2".to_vec(), b"m1".to_vec()]));
    consumer.join().unwrap();
}

#[test]
fn side_channel_is_drained_first() {
    let buffer = DeliveryBuffer::<Peer>::new();
    buffer.add_provisional(mid("a", 0), b"ordered".to_vec(), 1);
    buffer.promote_to_final(&mid("a", 0), 1);
    buffer.deliver_single_destination(b"express".to_vec());
    assert_eq!(buffer.next_batch(), Some(vec![b"express".to_vec()]));
    assert_eq!(buffer.next_batch(), Some(vec![b"ordered".to_vec()]));
    assert!(buffer.is_empty());
}

#[test]
fn shutdown_releases_a_blocked_consumer() {
    let buffer = Arc::new(DeliveryBuffer::<Peer>::new());
    let (tx, rx) = mpsc::channel();
    let consumer_buffer = buffer.clone();
    let consumer = thread::spawn(move || {
        tx.send(consumer_buffer.next_batch()).unwrap();
    });
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    buffer.shutdown();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), None);
    consumer.join().unwrap();
}

#[test]
fn leaver_cleanup_drops_only_unfinalized_entries() {
    let buffer = Arc::new(DeliveryBuffer::<Peer>::new());
    buffer.add_provisional(mid("x", 0), b"orphaned".to_vec(), 1);
    buffer.add_provisional(mid("y", 0), b"live".to_vec(), 2);
    buffer.promote_to_final(&mid("y", 0), 5);
    let (tx, rx) = mpsc::channel();
    let consumer_buffer = buffer.clone();
    let consumer = thread::spawn(move || {
        tx.send(consumer_buffer.next_batch()).unwrap();
    });
    // x's entry will never see a FINAL; until x is reported departed it
    // fences off everything behind it
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    buffer.remove_leavers(&set(&["x"]));
    let batch = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(batch, Some(vec![b"live".to_vec()]));
    consumer.join().unwrap();
}

// whole-protocol simulations

#[test]
fn anycast_reaches_every_destination() {
    init_logging();
    let cluster = Cluster::new(&["a", "b", "c"]);
    cluster.anycast("a", &["a", "b", "c"], b"m1");
    assert!(cluster.settle(|c| {
        ["a", "b", "c"]
            .iter()
            .all(|n| c.delivered(n) == vec![b"m1".to_vec()])
    }));
}

#[test]
fn interleaved_anycasts_deliver_in_one_order() {
    init_logging();
    let cluster = Cluster::new(&["a", "b", "c"]);
    for i in 0..5u8 {
        cluster.anycast("a", &["a", "b", "c"], &[b'a', i]);
        cluster.anycast("c", &["a", "b", "c"], &[b'c', i]);
    }
    assert!(cluster.settle(|c| ["a", "b", "c"].iter().all(|n| c.delivered(n).len() == 10)));
    let reference = cluster.delivered("a");
    assert_eq!(reference, cluster.delivered("b"));
    assert_eq!(reference, cluster.delivered("c"));
}

#[test]
fn only_shared_destinations_are_ordered_together() {
    init_logging();
    let cluster = Cluster::new(&["a", "b", "c"]);
    cluster.anycast("a", &["a", "b"], b"m1");
    cluster.anycast("c", &["b", "c"], b"m2");
    assert!(cluster.settle(|c| {
        c.delivered("b").len() == 2
            && c.delivered("a").len() == 1
            && c.delivered("c").len() == 1
    }));
    assert_eq!(cluster.delivered("a"), vec![b"m1".to_vec()]);
    assert_eq!(cluster.delivered("c"), vec![b"m2".to_vec()]);
}

#[test]
fn view_change_unblocks_a_stalled_sender() {
    init_logging();
    let mut cluster = Cluster::new(&["a", "b", "c"]);
    cluster.crash("b");
    cluster.anycast("a", &["a", "b", "c"], b"m1");
    // a holds its own proposal and c's, but b will never answer
    assert!(!cluster.settle_for(Duration::from_millis(200), |c| {
        !c.delivered("a").is_empty() || !c.delivered("c").is_empty()
    }));
    cluster.install_view(&["a", "c"]);
    assert!(cluster.settle(|c| {
        c.delivered("a") == vec![b"m1".to_vec()] && c.delivered("c") == vec![b"m1".to_vec()]
    }));
}

#[test]
fn single_destination_skips_agreement() {
    init_logging();
    let cluster = Cluster::new(&["a", "b"]);
    cluster.anycast("a", &["b"], b"express");
    assert!(cluster.settle(|c| c.delivered("b") == vec![b"express".to_vec()]));
    for header in cluster.router.header_log() {
        assert!(matches!(header, Header::SingleDestination));
    }
}

#[test]
fn self_only_anycast_never_touches_the_wire() {
    init_logging();
    let cluster = Cluster::new(&["a", "b"]);
    cluster.anycast("a", &["a"], b"note-to-self");
    assert!(cluster.settle(|c| c.delivered("a") == vec![b"note-to-self".to_vec()]));
    assert!(cluster.router.header_log().is_empty());
}

#[test]
fn handler_failure_does_not_stall_delivery() {
    init_logging();
    let mut cluster = Cluster::empty();
    cluster.add_peer("a");
    let flaky = FlakyRecorder::default();
    cluster.add_peer_with("b", flaky.clone());
    cluster.install_view(&["a", "b"]);
    cluster.anycast("a", &["a", "b"], b"first");
    cluster.anycast("a", &["a", "b"], b"second");
    assert!(cluster.settle(|c| c.delivered("a").len() == 2 && flaky.attempts().len() == 2));
    // the first delivery failed at the application, but both were offered
    // in order and the pipeline kept going
    assert_eq!(
        flaky.attempts(),
        vec![b"first".to_vec(), b"second".to_vec()]
    );
}

#[test]
fn stop_is_idempotent() {
    let router = Router::default();
    let ep = Endpoint::new("a".to_string(), router.wire("a"));
    ep.start(Recorder::default());
    ep.stop();
    ep.stop();
    // post-stop down-calls are quietly dropped
    ep.anycast(set(&["a", "b"]), b"dropped".to_vec());
}
