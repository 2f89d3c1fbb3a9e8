//! Cancellation and completion-race tests

use std::thread;
use std::time::Duration;

use rand::Rng;

use nullmodem_core::port::{BufferClass, PortPair};
use nullmodem_core::{CompletionStatus, Error};

const LONG: Option<Duration> = Some(Duration::from_secs(5));

#[test]
fn test_cancel_parked_read() {
    let pair = PortPair::new(BufferClass::Large);
    let (a, b) = pair.ports();
    a.open().unwrap();
    b.open().unwrap();

    let op = b.start_read(10).unwrap();
    op.cancel();
    let outcome = op.wait();
    assert_eq!(outcome.status, CompletionStatus::Cancelled);
    assert_eq!(outcome.transferred, 0);
}

#[test]
fn test_cancel_is_idempotent() {
    let pair = PortPair::new(BufferClass::Large);
    let (a, b) = pair.ports();
    a.open().unwrap();
    b.open().unwrap();

    let op = b.start_read(10).unwrap();
    op.cancel();
    op.cancel();
    op.cancel();
    assert_eq!(op.wait().status, CompletionStatus::Cancelled);
}

#[test]
fn test_cancel_after_completion_is_noop() {
    let pair = PortPair::new(BufferClass::Large);
    let (a, b) = pair.ports();
    a.open().unwrap();
    b.open().unwrap();

    a.write(b"data", LONG).unwrap();
    let op = b.start_read(4).unwrap();
    let outcome = op.wait();
    assert_eq!(outcome.status, CompletionStatus::Complete);

    op.cancel();
    assert_eq!(op.wait().status, CompletionStatus::Complete);
    assert_eq!(op.take_read_data(), b"data");
}

#[test]
fn test_cancel_queued_request_leaves_others() {
    let pair = PortPair::new(BufferClass::Minimal);
    let (a, b) = pair.ports();
    a.open().unwrap();
    b.open().unwrap();

    let w1 = a.start_write(vec![1u8; 4]).unwrap();
    let w2 = a.start_write(vec![2u8; 4]).unwrap();
    let w3 = a.start_write(vec![3u8; 4]).unwrap();

    // w2 sits in the backlog; cancelling it must not disturb w1 or w3.
    w2.cancel();
    assert_eq!(w2.wait().status, CompletionStatus::Cancelled);

    let mut buf = [0u8; 4];
    b.read(&mut buf, LONG).unwrap();
    assert_eq!(buf, [1u8; 4]);
    b.read(&mut buf, LONG).unwrap();
    assert_eq!(buf, [3u8; 4]);
    assert_eq!(w1.wait().status, CompletionStatus::Complete);
    assert_eq!(w3.wait().status, CompletionStatus::Complete);
}

#[test]
fn test_cancel_current_promotes_next() {
    let pair = PortPair::new(BufferClass::Minimal);
    let (a, b) = pair.ports();
    a.open().unwrap();
    b.open().unwrap();

    let w1 = a.start_write(vec![1u8; 4]).unwrap();
    let w2 = a.start_write(vec![2u8; 4]).unwrap();

    w1.cancel();
    assert_eq!(w1.wait().status, CompletionStatus::Cancelled);

    let mut buf = [0u8; 4];
    b.read(&mut buf, LONG).unwrap();
    assert_eq!(buf, [2u8; 4]);
    assert_eq!(w2.wait().status, CompletionStatus::Complete);
}

#[test]
fn test_close_cancels_pending_requests() {
    let pair = PortPair::new(BufferClass::Large);
    let (a, b) = pair.ports();
    a.open().unwrap();
    b.open().unwrap();

    let read = b.start_read(8).unwrap();
    let wait = {
        b.set_wait_mask(nullmodem_core::port::event::RXCHAR);
        b.start_wait().unwrap()
    };
    let write = {
        a.xoff();
        a.start_write(b"held".to_vec()).unwrap()
    };

    b.close().unwrap();
    a.close().unwrap();

    assert_eq!(read.wait().status, CompletionStatus::Cancelled);
    assert_eq!(wait.wait().status, CompletionStatus::Cancelled);
    assert_eq!(write.wait().status, CompletionStatus::Cancelled);
}

#[test]
fn test_timeout_reports_partial_write() {
    let pair = PortPair::new(BufferClass::Small);
    let (a, b) = pair.ports();
    a.open().unwrap();
    b.open().unwrap();

    // 128 of 200 bytes fit; the deadline claims the rest.
    let n = a.write(&[9u8; 200], Some(Duration::from_millis(100))).unwrap();
    assert_eq!(n, 128);

    let mut buf = [0u8; 128];
    assert_eq!(b.read(&mut buf, LONG).unwrap(), 128);
}

#[test]
fn test_wait_timeout_without_events() {
    let pair = PortPair::new(BufferClass::Large);
    let (a, b) = pair.ports();
    a.open().unwrap();
    b.open().unwrap();
    b.set_wait_mask(nullmodem_core::port::event::RXCHAR);

    assert_eq!(
        b.wait_on_mask(Some(Duration::from_millis(50))),
        Err(Error::Timeout)
    );
}

#[test]
fn test_racing_cancel_and_completion_exactly_once() {
    // Repeated randomized races between natural completion and cancel.
    // The one-shot claim guarantees exactly one outcome per request; a
    // double completion would abort the process.
    let mut rng = rand::thread_rng();
    let mut completed = 0u32;
    let mut cancelled = 0u32;

    for _ in 0..200 {
        let pair = PortPair::new(BufferClass::Large);
        let (a, b) = pair.ports();
        a.open().unwrap();
        b.open().unwrap();

        let op = b.start_read(4).unwrap();
        let writer = thread::spawn(move || {
            a.write(b"race", LONG).ok();
        });

        if rng.gen_bool(0.7) {
            thread::sleep(Duration::from_micros(rng.gen_range(0..1000)));
        }
        op.cancel();

        let outcome = op.wait();
        match outcome.status {
            CompletionStatus::Complete => {
                completed += 1;
                assert_eq!(outcome.transferred, 4);
            }
            CompletionStatus::Cancelled => cancelled += 1,
            CompletionStatus::TimedOut => panic!("no timeout was requested"),
        }
        writer.join().unwrap();
    }

    // Both sides of the race must actually occur over 200 rounds.
    assert!(completed > 0, "cancel always won; race never exercised");
    assert!(cancelled > 0, "completion always won; race never exercised");
}

#[test]
fn test_concurrent_cancels_from_many_threads() {
    let pair = PortPair::new(BufferClass::Large);
    let (a, b) = pair.ports();
    a.open().unwrap();
    b.open().unwrap();

    for round in 0..50 {
        let op = std::sync::Arc::new(b.start_read(4).unwrap());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let op = op.clone();
            handles.push(thread::spawn(move || op.cancel()));
        }
        if round % 2 == 0 {
            a.write(b"data", LONG).ok();
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let outcome = op.wait();
        assert!(matches!(
            outcome.status,
            CompletionStatus::Complete | CompletionStatus::Cancelled
        ));
        // Drain whatever the round left behind so rounds stay independent.
        let mut buf = [0u8; 8];
        let _ = b.read(&mut buf, Some(Duration::from_millis(10)));
    }
}
