//! Full sessions against a hand-driven consumer.

use callprof_trace::{
    Aggregator, Channel, Collector, CollectorConfig, DeliveryPolicy, HarvestMode, ManualClock,
    MemoryChannel, Message, PROTOCOL_VERSION, Session, SessionConfig, SessionState,
    StatisticsSnapshot, TransportError, UnixChannel, decode_into,
};
use pretty_assertions::assert_eq;
use std::os::unix::net::UnixListener;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(2);

fn collector() -> (Arc<Collector>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let collector = Collector::new(
        Arc::new(Aggregator::new()),
        clock.clone(),
        CollectorConfig::default(),
    );
    (Arc::new(collector), clock)
}

fn config() -> SessionConfig {
    SessionConfig {
        harvest_interval: Duration::from_secs(3600),
        poll_interval: Duration::from_millis(5),
        handshake_timeout: Duration::from_secs(1),
        ..SessionConfig::default()
    }
}

fn accept(consumer: &mut impl Channel) {
    match consumer.recv(WAIT).unwrap() {
        Some(Message::Handshake {
            protocol_version,
            process,
        }) => {
            assert_eq!(protocol_version, PROTOCOL_VERSION);
            assert_eq!(process.pid, std::process::id());
        }
        other => panic!("expected handshake, got {other:?}"),
    }
}

fn ack() -> Message {
    Message::HandshakeAck {
        accepted: true,
        version: PROTOCOL_VERSION,
    }
}

fn next(consumer: &mut impl Channel) -> Message {
    let deadline = Instant::now() + WAIT;
    loop {
        if let Some(message) = consumer.recv(Duration::from_millis(50)).unwrap() {
            return message;
        }
        assert!(Instant::now() < deadline, "no message from session");
    }
}

fn call(collector: &Collector, clock: &ManualClock, address: u64, ticks: u64) {
    collector.enter(address);
    clock.advance(ticks);
    collector.exit(address);
}

#[test]
fn incremental_payloads_add_up_to_all_calls() {
    let (collector, clock) = collector();
    let (producer, mut consumer) = MemoryChannel::pair();
    consumer.send(&ack(), WAIT).unwrap();

    let mut session = Session::new(Arc::clone(&collector), config());
    session.open(producer).unwrap();
    accept(&mut consumer);

    let mut total = StatisticsSnapshot::new();
    for round in 1..=3u64 {
        call(&collector, &clock, 0x42, round);
        consumer.send(&Message::SnapshotRequest, WAIT).unwrap();
        match next(&mut consumer) {
            Message::SnapshotResponse {
                sequence,
                incremental,
                payload,
                ..
            } => {
                assert_eq!(sequence, round);
                assert!(incremental);
                decode_into(&payload, &mut total).unwrap();
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    let stats = total[&0x42].stats;
    assert_eq!(stats.times_called, 3);
    assert_eq!(stats.inclusive_time, 6);
    assert_eq!(stats.max_call_time, 3);

    consumer.send(&Message::CloseRequest, WAIT).unwrap();
    assert!(matches!(
        next(&mut consumer),
        Message::SnapshotResponse { sequence: 4, .. }
    ));
    assert_eq!(next(&mut consumer), Message::Ack);
    session.close();
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn cumulative_payloads_repeat_everything() {
    let (collector, clock) = collector();
    let (producer, mut consumer) = MemoryChannel::pair();
    consumer.send(&ack(), WAIT).unwrap();

    let mut session = Session::new(
        Arc::clone(&collector),
        SessionConfig {
            harvest_mode: HarvestMode::Cumulative,
            ..config()
        },
    );
    session.open(producer).unwrap();
    accept(&mut consumer);

    let mut last = StatisticsSnapshot::new();
    for _ in 0..2 {
        call(&collector, &clock, 7, 5);
        consumer.send(&Message::SnapshotRequest, WAIT).unwrap();
        if let Message::SnapshotResponse {
            incremental,
            payload,
            ..
        } = next(&mut consumer)
        {
            assert!(!incremental);
            last.clear();
            decode_into(&payload, &mut last).unwrap();
        }
    }
    assert_eq!(last[&7].stats.times_called, 2);
    assert_eq!(last[&7].stats.inclusive_time, 10);
    session.close();
}

#[test]
fn full_consumer_queue_drops_and_counts() {
    let (collector, _) = collector();
    // Room for the handshake reply only; nobody drains the producer side
    let (producer, mut consumer) = MemoryChannel::bounded_pair(1);
    consumer.send(&ack(), WAIT).unwrap();

    let mut session = Session::new(
        Arc::clone(&collector),
        SessionConfig {
            harvest_interval: Duration::from_millis(10),
            write_timeout: Duration::from_millis(5),
            ..config()
        },
    );
    session.open(producer).unwrap();

    let deadline = Instant::now() + WAIT;
    while collector.diagnostics().snapshot().dropped_snapshots < 2 {
        assert!(Instant::now() < deadline, "snapshots were not dropped");
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(session.state(), SessionState::Active);

    // The queue still holds the handshake; later snapshots report the losses
    accept(&mut consumer);
    let deadline = Instant::now() + WAIT;
    loop {
        if let Message::SnapshotResponse { diagnostics, .. } = next(&mut consumer)
            && diagnostics.dropped_snapshots > 0
        {
            break;
        }
        assert!(Instant::now() < deadline);
    }
    assert!(session.shutdown(WAIT));
}

/// Refuses the first `failures` snapshots as if the consumer were too slow
struct FlakyChannel {
    inner: MemoryChannel,
    failures: usize,
}

impl Channel for FlakyChannel {
    fn send(&mut self, message: &Message, timeout: Duration) -> Result<(), TransportError> {
        if self.failures > 0 && matches!(message, Message::SnapshotResponse { .. }) {
            self.failures -= 1;
            return Err(TransportError::TimedOut);
        }
        self.inner.send(message, timeout)
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Message>, TransportError> {
        self.inner.recv(timeout)
    }
}

fn undelivered_calls_ride_the_next_snapshot(delivery: DeliveryPolicy) {
    let (collector, clock) = collector();
    let (producer, mut consumer) = MemoryChannel::pair();
    consumer.send(&ack(), WAIT).unwrap();

    let mut session = Session::new(
        Arc::clone(&collector),
        SessionConfig {
            delivery,
            ..config()
        },
    );
    session
        .open(FlakyChannel {
            inner: producer,
            failures: 1,
        })
        .unwrap();
    accept(&mut consumer);

    for _ in 0..5 {
        call(&collector, &clock, 1, 2);
    }
    consumer.send(&Message::SnapshotRequest, WAIT).unwrap();
    let deadline = Instant::now() + WAIT;
    while collector.diagnostics().snapshot().dropped_snapshots == 0 {
        assert!(Instant::now() < deadline, "first snapshot was not dropped");
        thread::sleep(Duration::from_millis(5));
    }

    consumer.send(&Message::CloseRequest, WAIT).unwrap();
    let mut total = StatisticsSnapshot::new();
    loop {
        match next(&mut consumer) {
            Message::SnapshotResponse {
                sequence,
                diagnostics,
                payload,
                ..
            } => {
                assert_eq!(sequence, 2);
                assert_eq!(diagnostics.dropped_snapshots, 1);
                decode_into(&payload, &mut total).unwrap();
            }
            Message::Ack => break,
            other => panic!("unexpected {other:?}"),
        }
    }

    let stats = total[&1].stats;
    assert_eq!(stats.times_called, 5);
    assert_eq!(stats.inclusive_time, 10);
    session.close();
}

#[test]
fn dropped_incremental_snapshot_is_resent_with_the_next() {
    undelivered_calls_ride_the_next_snapshot(DeliveryPolicy::Drop);
}

#[test]
fn evicted_incremental_snapshot_is_resent_with_the_next() {
    undelivered_calls_ride_the_next_snapshot(DeliveryPolicy::Buffer { max_pending: 0 });
}

#[test]
fn buffered_snapshots_arrive_in_order() {
    let (collector, clock) = collector();
    let (producer, mut consumer) = MemoryChannel::bounded_pair(1);
    consumer.send(&ack(), WAIT).unwrap();

    let mut session = Session::new(
        Arc::clone(&collector),
        SessionConfig {
            write_timeout: Duration::from_millis(5),
            delivery: DeliveryPolicy::Buffer { max_pending: 16 },
            ..config()
        },
    );
    session.open(producer).unwrap();

    // Queue is full with the handshake: both snapshots are held back
    call(&collector, &clock, 1, 1);
    session.request_snapshot();
    thread::sleep(Duration::from_millis(50));
    call(&collector, &clock, 1, 1);
    session.request_snapshot();
    thread::sleep(Duration::from_millis(50));

    accept(&mut consumer);
    let mut sequences = Vec::new();
    let mut total = StatisticsSnapshot::new();
    while sequences.len() < 2 {
        // Each received frame frees a slot; a request makes the worker retry
        session.request_snapshot();
        if let Message::SnapshotResponse {
            sequence, payload, ..
        } = next(&mut consumer)
        {
            sequences.push(sequence);
            decode_into(&payload, &mut total).unwrap();
        }
    }
    assert_eq!(sequences, vec![1, 2]);
    assert_eq!(total[&1].stats.times_called, 2);
    assert_eq!(collector.diagnostics().snapshot().dropped_snapshots, 0);
    assert!(session.shutdown(WAIT));
}

#[test]
fn unix_socket_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("callprof.sock");
    let listener = UnixListener::bind(&path).unwrap();

    let (collector, clock) = collector();
    let producer_collector = Arc::clone(&collector);
    let producer = thread::spawn(move || {
        let channel = UnixChannel::connect(&path).unwrap();
        let mut session = Session::new(producer_collector, config());
        session.open(channel).unwrap();
        session
    });

    let (stream, _) = listener.accept().unwrap();
    let mut consumer = UnixChannel::new(stream);
    accept(&mut consumer);
    consumer.send(&ack(), WAIT).unwrap();
    let session = producer.join().unwrap();
    assert_eq!(session.state(), SessionState::Active);

    call(&collector, &clock, 0xBEEF, 12);
    consumer.send(&Message::CloseRequest, WAIT).unwrap();
    match next(&mut consumer) {
        Message::SnapshotResponse { payload, .. } => {
            let mut snapshot = StatisticsSnapshot::new();
            decode_into(&payload, &mut snapshot).unwrap();
            assert_eq!(snapshot[&0xBEEF].stats.inclusive_time, 12);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(next(&mut consumer), Message::Ack);

    session.close();
    assert_eq!(session.state(), SessionState::Closed);
}
