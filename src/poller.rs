//! Background poller thread.
//!
//! The poller is the single producer of a session. It sweeps every channel
//! in a fixed order and, for each one, moves at most one buffer through
//! free → in-flight → filled:
//!
//! ```text
//!   loop until stop requested:
//!     for channel in channels:
//!       lock; pop free buffer; unlock        (none → starved, next channel)
//!       capability.fill(device, buffer)      (no lock held)
//!       lock; push filled buffer; unlock
//!     if any channel starved: sleep idle_backoff
//!   signal completion
//! ```
//!
//! Cancellation is cooperative: the [`StopToken`] is checked only between
//! sweeps, so a read that has started always completes and its buffer is
//! always published. [`Completion`] is signaled exactly once when the thread
//! leaves its loop, including when a device read panics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use daq_pool::BufferPool;

use crate::channel::ChannelState;
use crate::device::{AcquisitionDevice, ReadRequest};
use crate::session::SessionOptions;

/// Name given to the poller thread.
pub const POLLER_THREAD_NAME: &str = "daq-poller";

/// Cooperative cancellation flag shared between a session and its poller.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    cancelled: Arc<AtomicBool>,
}

impl StopToken {
    /// New, not yet cancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether a stop has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// One-shot signal raised when the poller has left its loop.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Completion {
    /// New, unsignaled completion.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Returns `false` if it was already raised.
    pub fn signal(&self) -> bool {
        let (done, cvar) = &*self.inner;
        let mut done = done.lock();
        if *done {
            return false;
        }
        *done = true;
        cvar.notify_all();
        true
    }

    /// Whether the signal has been raised.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Block until the signal is raised.
    pub fn wait(&self) {
        let (done, cvar) = &*self.inner;
        let mut done = done.lock();
        while !*done {
            cvar.wait(&mut done);
        }
    }

    /// Block until the signal is raised or `timeout` elapses.
    ///
    /// Returns `true` if the signal was raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (done, cvar) = &*self.inner;
        let mut done = done.lock();
        while !*done {
            if cvar.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }
}

/// Raises the completion when dropped, so unwinding still signals it.
struct CompletionGuard(Completion);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("Poller thread panicked, signaling completion");
        }
        self.0.signal();
    }
}

/// Reconciles pool occupancy if a fill unwinds before its buffer is
/// published.
struct InFlightGuard<'a> {
    pool: &'a BufferPool,
    armed: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.abandon_in_flight();
        }
    }
}

/// Counters reported by the poller when it exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollerSummary {
    /// Full sweeps over all channels.
    pub passes: u64,
    /// Buffers filled and published.
    pub fills: u64,
    /// Fills whose status was negative.
    pub device_errors: u64,
    /// Channel visits that found no free buffer.
    pub starved_visits: u64,
}

/// Result of visiting one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    Filled { ok: bool },
    Starved,
}

/// State moved onto the poller thread.
pub(crate) struct Poller {
    channels: Arc<[ChannelState]>,
    device: Arc<dyn AcquisitionDevice>,
    idle_backoff: Duration,
    read_timeout: Duration,
    stop: StopToken,
    completion: Completion,
}

impl Poller {
    pub(crate) fn new(
        channels: Arc<[ChannelState]>,
        device: Arc<dyn AcquisitionDevice>,
        options: &SessionOptions,
        stop: StopToken,
        completion: Completion,
    ) -> Self {
        Self {
            channels,
            device,
            idle_backoff: options.idle_backoff,
            read_timeout: options.read_timeout,
            stop,
            completion,
        }
    }

    /// Start the poller on its own thread.
    pub(crate) fn spawn(self) -> std::io::Result<JoinHandle<PollerSummary>> {
        thread::Builder::new()
            .name(POLLER_THREAD_NAME.to_string())
            .spawn(move || self.run())
    }

    fn run(self) -> PollerSummary {
        let _completion = CompletionGuard(self.completion.clone());
        let mut summary = PollerSummary::default();

        debug!(channels = self.channels.len(), "Poller thread started");

        while !self.stop.is_cancelled() {
            let mut starved = false;

            for channel in self.channels.iter() {
                match self.service(channel) {
                    Visit::Filled { ok } => {
                        summary.fills += 1;
                        if !ok {
                            summary.device_errors += 1;
                        }
                    }
                    Visit::Starved => {
                        summary.starved_visits += 1;
                        starved = true;
                    }
                }
            }

            summary.passes += 1;
            if starved {
                thread::sleep(self.idle_backoff);
            }
        }

        debug!(
            passes = summary.passes,
            fills = summary.fills,
            device_errors = summary.device_errors,
            starved_visits = summary.starved_visits,
            "Poller thread exiting"
        );
        summary
    }

    /// Move at most one buffer of `channel` from free to filled.
    fn service(&self, channel: &ChannelState) -> Visit {
        let Some(mut buffer) = channel.pool().try_acquire_free() else {
            if channel.record_starved() {
                warn!(
                    channel = %channel.id(),
                    "No free buffers, pausing channel until one is returned"
                );
            }
            return Visit::Starved;
        };
        if channel.clear_starved() {
            debug!(channel = %channel.id(), "Channel resumed");
        }

        let mut guard = InFlightGuard {
            pool: channel.pool(),
            armed: true,
        };

        let descriptor = channel.descriptor();
        let outcome = channel.capability().fill(
            self.device.as_ref(),
            ReadRequest {
                descriptor,
                dest: buffer.as_mut_slice(),
                timeout: self.read_timeout,
            },
        );
        buffer.set_outcome(outcome.samples_read, outcome.status);

        if outcome.is_ok() {
            trace!(
                channel = %descriptor.id,
                slot = buffer.slot(),
                samples = outcome.samples_read,
                "Buffer filled"
            );
        } else {
            channel.record_device_error();
            warn!(
                channel = %descriptor.id,
                status = outcome.status,
                "Device read failed"
            );
        }

        guard.armed = false;
        channel.pool().publish_filled(buffer);
        Visit::Filled {
            ok: outcome.is_ok(),
        }
    }
}
