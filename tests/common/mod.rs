//! Shared test devices and helpers for the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use daq_loop::device::{decode_analog, encode_analog, encode_digital};
use daq_loop::{
    AcquisitionDevice, ChannelDescriptor, ChannelId, ChannelKind, ReadOutcome, ReadRequest,
};
use parking_lot::{Condvar, Mutex};

/// Generous upper bound for anything the tests wait on.
pub const WAIT: Duration = Duration::from_secs(5);

/// Poll `cond` every millisecond until it holds or `WAIT` elapses.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// One analog channel of 100 samples in a 100-sample (800 byte) buffer.
pub fn analog_100(id: u64) -> ChannelDescriptor {
    ChannelDescriptor::new(id, ChannelKind::Analog, 100, 100)
}

/// First sample of an analog block, as written by [`SequenceDevice`].
pub fn block_sequence(bytes: &[u8]) -> u64 {
    decode_analog(bytes).next().unwrap_or(f64::NAN) as u64
}

/// Device that stamps every sample of a block with the channel's read
/// sequence number (0, 1, 2, ...) and returns scripted statuses.
///
/// Statuses are consumed in order, one per read across all channels; once
/// the script runs out every read succeeds.
#[derive(Debug, Default)]
pub struct SequenceDevice {
    script: Mutex<VecDeque<i32>>,
    sequence: Mutex<HashMap<ChannelId, u64>>,
    reads: AtomicUsize,
}

impl SequenceDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_statuses(statuses: impl IntoIterator<Item = i32>) -> Self {
        Self {
            script: Mutex::new(statuses.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn next(&self, request: &mut ReadRequest<'_>) -> ReadOutcome {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let status = self.script.lock().pop_front().unwrap_or(0);
        if status < 0 {
            return ReadOutcome::failure(status);
        }

        let seq = {
            let mut sequence = self.sequence.lock();
            let next = sequence.entry(request.descriptor.id).or_insert(0);
            let seq = *next;
            *next += 1;
            seq
        };
        let samples = request.capacity();
        match request.descriptor.kind {
            ChannelKind::Analog => encode_analog(request.dest, (0..samples).map(|_| seq as f64)),
            ChannelKind::Digital => encode_digital(request.dest, (0..samples).map(|_| seq as u32)),
        };
        ReadOutcome {
            samples_read: request.descriptor.samples_per_chan,
            status,
        }
    }
}

impl AcquisitionDevice for SequenceDevice {
    fn read_analog(&self, mut request: ReadRequest<'_>) -> ReadOutcome {
        self.next(&mut request)
    }

    fn read_digital(&self, mut request: ReadRequest<'_>) -> ReadOutcome {
        self.next(&mut request)
    }
}

/// Gate that holds device reads until it is opened.
#[derive(Debug, Default)]
pub struct Gate {
    open: Mutex<bool>,
    cvar: Condvar,
    entered: AtomicUsize,
}

impl Gate {
    pub fn open(&self) {
        *self.open.lock() = true;
        self.cvar.notify_all();
    }

    /// Reads that have entered the gate so far.
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    fn pass(&self) {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.lock();
        while !*open {
            self.cvar.wait(&mut open);
        }
    }
}

/// Device whose reads block on a [`Gate`] before succeeding.
#[derive(Debug, Clone, Default)]
pub struct GatedDevice {
    pub gate: Arc<Gate>,
}

impl AcquisitionDevice for GatedDevice {
    fn read_analog(&self, request: ReadRequest<'_>) -> ReadOutcome {
        self.gate.pass();
        ReadOutcome::success(request.descriptor.samples_per_chan)
    }

    fn read_digital(&self, request: ReadRequest<'_>) -> ReadOutcome {
        self.gate.pass();
        ReadOutcome::success(request.descriptor.samples_per_chan)
    }
}

/// Device that panics on its first read.
#[derive(Debug, Default)]
pub struct PanickingDevice;

impl AcquisitionDevice for PanickingDevice {
    fn read_analog(&self, _request: ReadRequest<'_>) -> ReadOutcome {
        panic!("driver crashed");
    }

    fn read_digital(&self, _request: ReadRequest<'_>) -> ReadOutcome {
        panic!("driver crashed");
    }
}
