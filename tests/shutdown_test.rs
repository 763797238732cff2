//! Session shutdown: full drain, in-flight reads, timeouts, panicking
//! devices and reads racing close.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{analog_100, wait_until, GatedDevice, PanickingDevice, SequenceDevice};
use daq_loop::{ChannelId, ReadError, Session, SessionError, SessionOptions, POOL_SIZE};

#[test]
fn test_close_drains_every_buffer() {
    let session = Session::open(
        SequenceDevice::new(),
        vec![analog_100(1), analog_100(2)],
        SessionOptions::default(),
    )
    .unwrap();
    assert!(wait_until(|| session
        .channel_ids()
        .iter()
        .all(|&id| session.stats(id).unwrap().occupancy.filled == POOL_SIZE)));
    let ledgers = session.ledgers();
    assert_eq!(ledgers[0].live_bytes(), POOL_SIZE * 800);

    let report = session.close();

    assert!(report.poller_exited_cleanly());
    assert_eq!(report.filled_discarded(), 2 * POOL_SIZE);
    assert_eq!(report.buffers_released(), 2 * POOL_SIZE);
    assert_eq!(report.live_buffers(), 0);
    for ledger in &ledgers {
        assert_eq!(ledger.live_buffers(), 0);
        assert_eq!(ledger.live_bytes(), 0);
    }
}

#[test]
fn test_close_waits_for_in_flight_read() {
    let device = GatedDevice::default();
    let gate = Arc::clone(&device.gate);
    let session = Session::open(device, vec![analog_100(1)], SessionOptions::default()).unwrap();
    let ledgers = session.ledgers();

    // The poller is now blocked inside the device read.
    assert!(wait_until(|| gate.entered() == 1));

    let closer = thread::spawn(move || session.close());
    thread::sleep(Duration::from_millis(30));
    assert!(!closer.is_finished(), "close returned while a read was in flight");

    gate.open();
    let report = closer.join().unwrap();

    // The in-flight buffer was published before the drain discarded it.
    let summary = report.poller.unwrap();
    assert_eq!(summary.fills, 1);
    assert_eq!(report.channels[0].drain.filled_discarded, 1);
    assert_eq!(report.channels[0].drain.free_released, POOL_SIZE - 1);
    assert_eq!(ledgers[0].live_buffers(), 0);
}

#[test]
fn test_close_timeout_detaches_blocked_poller() {
    let device = GatedDevice::default();
    let gate = Arc::clone(&device.gate);
    let session = Session::open(device, vec![analog_100(1)], SessionOptions::default()).unwrap();
    let reader = session.reader();
    let ledgers = session.ledgers();
    assert!(wait_until(|| gate.entered() == 1));

    let started = Instant::now();
    let err = session.close_timeout(Duration::from_millis(20)).unwrap_err();
    assert!(matches!(err, SessionError::ShutdownTimeout(t) if t == Duration::from_millis(20)));
    assert!(started.elapsed() < Duration::from_secs(2));

    // Queues are already drained; only the in-flight buffer is alive.
    assert!(reader.is_closed());
    assert_eq!(ledgers[0].live_buffers(), 1);

    gate.open();
    assert!(wait_until(|| ledgers[0].live_buffers() == 0));
}

#[test]
fn test_close_timeout_succeeds_when_poller_is_idle() {
    let session = Session::open(
        SequenceDevice::new(),
        vec![analog_100(1)],
        SessionOptions::default(),
    )
    .unwrap();
    let report = session.close_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(report.live_buffers(), 0);
}

#[test]
fn test_completion_fires_when_device_panics() {
    let session = Session::open(PanickingDevice, vec![analog_100(1)], SessionOptions::default())
        .unwrap();
    let ledgers = session.ledgers();

    assert!(wait_until(|| !session.is_polling()));
    let occupancy = session.stats(ChannelId(1)).unwrap().occupancy;
    assert_eq!(occupancy.in_flight, 0);
    assert_eq!(occupancy.discarded, 1);
    assert_eq!(occupancy.free, POOL_SIZE - 1);
    assert_eq!(occupancy.total(), POOL_SIZE);
    assert_eq!(ledgers[0].live_buffers(), POOL_SIZE - 1);

    let report = session.close();

    assert!(!report.poller_exited_cleanly());
    assert_eq!(report.buffers_released(), POOL_SIZE - 1);
    assert_eq!(report.live_buffers(), 0);
    assert_eq!(ledgers[0].live_buffers(), 0);
}

#[test]
fn test_reads_after_close_report_unknown_channel() {
    let session = Session::open(
        SequenceDevice::new(),
        vec![analog_100(1)],
        SessionOptions::default(),
    )
    .unwrap();
    let reader = session.reader();
    assert!(wait_until(|| session.stats(ChannelId(1)).unwrap().fills > 0));

    session.close();

    let mut dest = vec![0u8; 800];
    assert!(reader.is_closed());
    assert_eq!(
        reader.read(ChannelId(1), &mut dest),
        Err(ReadError::UnknownChannel(ChannelId(1)))
    );
}

#[test]
fn test_reads_racing_close_stay_consistent() {
    let session = Session::open(
        SequenceDevice::new(),
        vec![analog_100(1)],
        SessionOptions::default(),
    )
    .unwrap();
    let ledgers = session.ledgers();

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let reader = session.reader();
            thread::spawn(move || {
                let mut dest = vec![0u8; 800];
                loop {
                    match reader.read(ChannelId(1), &mut dest) {
                        Ok(n) => assert_eq!(n, 800),
                        Err(ReadError::NoDataAvailable) => thread::yield_now(),
                        Err(ReadError::UnknownChannel(_)) => return,
                        Err(e) => panic!("unexpected read error: {e}"),
                    }
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    session.close();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(ledgers[0].live_buffers(), 0);
}

#[test]
fn test_drop_closes_session() {
    let session = Session::open(
        SequenceDevice::new(),
        vec![analog_100(1)],
        SessionOptions::default(),
    )
    .unwrap();
    let reader = session.reader();
    let ledgers = session.ledgers();

    drop(session);

    assert!(reader.is_closed());
    assert_eq!(ledgers[0].live_buffers(), 0);
}
