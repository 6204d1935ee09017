//! End-to-end scenarios across the reservation, creators, channels and response futures.

use crate::connection::dummy_transport::DummyTransport;
use crate::connection::{ChannelKind, ConnectionReservation, FutureChannelCreator};
use crate::future::{FailureReason, FutureState, ResponseFuture, ShutdownFuture};
use crate::message::{Message, MessageKind};
use crate::peer_address::PeerAddress;
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn peer(port: u16) -> PeerAddress {
    PeerAddress::with_port(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

fn me() -> PeerAddress {
    peer(4000)
}

#[test]
fn fifo_admission_example() {
    let pool = ConnectionReservation::new(10, Arc::new(DummyTransport::default()));
    let eight = pool.reserve(8);
    assert!(eight.is_success());
    assert_eq!(pool.available_permits(), 2);
    let five = pool.reserve(5);
    assert_eq!(five.state(), FutureState::Pending);
    pool.release(&eight.result().unwrap()).unwrap();
    assert!(five.is_success());
    assert_eq!(pool.available_permits(), 5);
}

#[test]
fn grants_follow_arrival_order() {
    let pool = ConnectionReservation::new(4, Arc::new(DummyTransport::default()));
    let holder = pool.reserve(4).result().unwrap();
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let queued: Vec<FutureChannelCreator> = (0..6)
        .map(|i| {
            let f = pool.reserve(1 + i % 3);
            let order = Arc::clone(&order);
            f.add_listener(move |_| order.lock().push(i));
            f
        })
        .collect();
    pool.release(&holder).unwrap();
    // 1 + 2 + 3 = 6 > 4: only the first two fit.
    assert_eq!(*order.lock(), vec![0, 1]);
    for f in &queued[..2] {
        pool.release(&f.result().unwrap()).unwrap();
    }
    assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    assert!(queued[2..4].iter().all(|f| f.is_success()));
    assert!(queued[4..].iter().all(|f| !f.is_completed()));
    pool.shutdown();
    assert!(queued[4..].iter().all(|f| f.is_failed()));
}

#[test]
fn permits_are_conserved_under_concurrency() {
    env_logger::try_init().ok();
    const BUDGET: usize = 8;
    const THREADS: usize = 12;
    const ROUNDS: usize = 50;
    let pool = ConnectionReservation::new(BUDGET, Arc::new(DummyTransport::default()));
    let granted = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles = (0..THREADS)
        .map(|_| {
            let pool = pool.clone();
            let granted = Arc::clone(&granted);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut rng = rand::rng();
                for _ in 0..ROUNDS {
                    let permits = rng.random_range(1..=BUDGET);
                    let future = pool.reserve(permits);
                    let outcome = future.await_uninterruptibly();
                    let creator = outcome.success().cloned().expect("granted");
                    let used = pool.used_permits();
                    assert!(used <= BUDGET, "{used} permits in use");
                    assert!(used >= permits);
                    granted.fetch_add(1, Ordering::SeqCst);
                    pool.release(&creator).unwrap();
                }
            })
        })
        .collect::<Vec<_>>();
    handles.into_iter().for_each(|h| h.join().unwrap());
    assert_eq!(granted.load(Ordering::SeqCst), THREADS * ROUNDS);
    assert_eq!(pool.used_permits(), 0);
    assert_eq!(pool.live_creators(), 0);
    assert_eq!(pool.pending_reservations(), 0);
}

#[test]
fn cancellation_racing_with_release_never_leaks_permits() {
    let pool = ConnectionReservation::new(3, Arc::new(DummyTransport::default()));
    for _ in 0..100 {
        let holder = pool.reserve(3).result().unwrap();
        let queued = pool.reserve(2);
        let canceller = {
            let queued = queued.clone();
            thread::spawn(move || queued.cancel())
        };
        pool.release(&holder).unwrap();
        let cancelled = canceller.join().unwrap();
        match queued.state() {
            FutureState::Cancelled => assert!(cancelled),
            FutureState::Success => pool.release(&queued.result().unwrap()).unwrap(),
            other => panic!("unexpected state {other}"),
        }
        assert_eq!(pool.used_permits(), 0, "permits leaked");
        assert_eq!(pool.pending_reservations(), 0);
    }
}

#[test]
fn creator_shutdown_leaves_nothing_pending() {
    let transport = Arc::new(DummyTransport::default());
    let pool = ConnectionReservation::new(4, transport.clone());
    let creator = pool.reserve(2).result().unwrap();
    let ping = Message::new(MessageKind::Ping, me());
    let a = creator.request(ChannelKind::Tcp, peer(10), ping.clone()).unwrap();
    let b = creator.request(ChannelKind::Udp, peer(11), ping).unwrap();
    assert!(!a.is_completed() && !b.is_completed());
    pool.release(&creator).unwrap();
    for f in [&a, &b] {
        let outcome = f.await_timeout(Duration::from_secs(1)).expect("future left pending");
        assert_eq!(outcome.failure(), Some(&FailureReason::ChannelClosed));
    }
    // The transport's late replies are dropped.
    assert_eq!(transport.answer_all(), 0);
}

#[test]
fn shutdown_composite_over_real_requests() {
    let transport = Arc::new(DummyTransport::default());
    let pool = ConnectionReservation::new(3, transport.clone());
    let creator = pool.reserve(3).result().unwrap();
    let shutdown = ShutdownFuture::new();
    let recipients = [peer(10), peer(11), peer(12)];
    let requests: Vec<ResponseFuture> = recipients
        .iter()
        .map(|p| creator.request(ChannelKind::Udp, *p, Message::new(MessageKind::Quit, me())).unwrap())
        .collect();
    for r in &requests {
        let s = shutdown.clone();
        r.add_listener({
            let recipient = *r.recipient();
            move |outcome| s.report(recipient, outcome.is_success())
        });
        shutdown.add_requests(r.clone());
    }
    let done = Arc::new(AtomicUsize::new(0));
    let d = Arc::clone(&done);
    shutdown.add_listener(move |_| {
        d.fetch_add(1, Ordering::SeqCst);
    });
    let sent = transport.sent();
    sent[0].response(Some(Message::new(MessageKind::Ack, peer(10))));
    sent[1].response(None);
    sent[2].failed(FailureReason::Timeout);
    assert!(requests.iter().all(|r| r.is_completed()));
    assert!(shutdown.set_done());
    pool.release(&creator).unwrap();
    assert!(shutdown.is_success());
    assert_eq!(done.load(Ordering::SeqCst), 1);
    let status = shutdown.status();
    assert_eq!(status.len(), 3);
    assert!(status[&peer(10)]);
    assert!(status[&peer(11)]);
    assert!(!status[&peer(12)]);
}
