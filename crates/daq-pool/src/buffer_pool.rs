//! Per-channel buffer pool with free and filled queues.
//!
//! This module provides [`BufferPool`], the fixed set of buffers owned by one
//! acquisition channel, and [`Buffer`], the exclusively-owned byte block that
//! moves between the pool's queues.
//!
//! # Ownership Model
//!
//! A [`Buffer`] is a plain owned value. Whoever holds it (a queue, the
//! poller, or a reader) is its only owner, so a buffer can never be in two
//! places at once. The pool only counts the buffers it has handed out; it
//! does not keep references to them.
//!
//! Every buffer holds a clone of its pool's [`MemoryLedger`]. The ledger is
//! decremented when the buffer is dropped, which makes "all memory released"
//! directly observable after a pool is drained.
//!
//! # Closing
//!
//! [`BufferPool::drain`] frees everything sitting in either queue and marks
//! the pool closed. Buffers that are in-flight or checked out at that moment
//! are freed when they are handed back instead of being re-queued.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::POOL_SIZE;

/// Shared counters for memory attributed to a pool.
#[derive(Debug, Default)]
struct LedgerInner {
    live_buffers: AtomicUsize,
    live_bytes: AtomicUsize,
}

/// Tracks how many buffers (and bytes) of a pool are still alive.
///
/// Cloning the ledger is cheap; all clones observe the same counters.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    inner: Arc<LedgerInner>,
}

impl MemoryLedger {
    fn track(&self, len: usize) {
        self.inner.live_buffers.fetch_add(1, Ordering::AcqRel);
        self.inner.live_bytes.fetch_add(len, Ordering::AcqRel);
    }

    fn release(&self, len: usize) {
        self.inner.live_buffers.fetch_sub(1, Ordering::AcqRel);
        self.inner.live_bytes.fetch_sub(len, Ordering::AcqRel);
    }

    /// Number of buffers that have not been freed yet.
    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.inner.live_buffers.load(Ordering::Acquire)
    }

    /// Total bytes held by buffers that have not been freed yet.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.inner.live_bytes.load(Ordering::Acquire)
    }
}

/// An exclusively-owned block of acquisition bytes.
///
/// The block length is fixed at allocation. After a fill, the buffer also
/// records how many samples the device delivered and the status code it
/// returned (`>= 0` success, `< 0` device error).
pub struct Buffer {
    data: Vec<u8>,
    samples_read: usize,
    status: i32,
    slot: usize,
    ledger: MemoryLedger,
}

impl Buffer {
    fn allocate(slot: usize, len: usize, ledger: &MemoryLedger) -> Self {
        ledger.track(len);
        Self {
            data: vec![0u8; len],
            samples_read: 0,
            status: 0,
            slot,
            ledger: ledger.clone(),
        }
    }

    /// Payload bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable payload bytes, for the producer to fill.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Length of the block in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the block has zero length.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Status code recorded by the last fill.
    #[must_use]
    pub fn status(&self) -> i32 {
        self.status
    }

    /// Samples reported by the last fill.
    #[must_use]
    pub fn samples_read(&self) -> usize {
        self.samples_read
    }

    /// Whether the last fill succeeded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status >= 0
    }

    /// Record the outcome of a fill.
    pub fn set_outcome(&mut self, samples_read: usize, status: i32) {
        self.samples_read = samples_read;
        self.status = status;
    }

    /// Index of this buffer within its pool (for debugging/metrics).
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("slot", &self.slot)
            .field("len", &self.data.len())
            .field("samples_read", &self.samples_read)
            .field("status", &self.status)
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.ledger.release(self.data.len());
    }
}

/// Where the pool's buffers currently are.
///
/// A snapshot is taken under the pool mutex, so
/// [`Occupancy::total`] always equals [`POOL_SIZE`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Occupancy {
    /// Buffers waiting to be filled.
    pub free: usize,
    /// Buffers holding a completed acquisition.
    pub filled: usize,
    /// Buffers taken by the producer and not yet published.
    pub in_flight: usize,
    /// Buffers taken by a consumer and not yet returned.
    pub checked_out: usize,
    /// Buffers permanently removed from circulation.
    pub discarded: usize,
}

impl Occupancy {
    /// Sum of all states, including discarded buffers.
    #[must_use]
    pub fn total(&self) -> usize {
        self.free + self.filled + self.in_flight + self.checked_out + self.discarded
    }

    /// Buffers still circulating (everything except discarded ones).
    #[must_use]
    pub fn circulating(&self) -> usize {
        self.total() - self.discarded
    }
}

/// Result of [`BufferPool::drain`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Free buffers released.
    pub free_released: usize,
    /// Filled buffers released without being consumed.
    pub filled_discarded: usize,
}

impl DrainReport {
    /// Total buffers released by the drain.
    #[must_use]
    pub fn released(&self) -> usize {
        self.free_released + self.filled_discarded
    }
}

struct Queues {
    free: VecDeque<Buffer>,
    filled: VecDeque<Buffer>,
    in_flight: usize,
    checked_out: usize,
    discarded: usize,
    closed: bool,
}

impl Queues {
    fn occupancy(&self) -> Occupancy {
        Occupancy {
            free: self.free.len(),
            filled: self.filled.len(),
            in_flight: self.in_flight,
            checked_out: self.checked_out,
            discarded: self.discarded,
        }
    }
}

/// Fixed set of [`POOL_SIZE`] buffers for one channel.
///
/// The free and filled queues are guarded by one mutex. The mutex is only
/// held for the queue transition itself, never while a buffer is being
/// filled or copied.
pub struct BufferPool {
    queues: Mutex<Queues>,
    buffer_len: usize,
    ledger: MemoryLedger,
    total_fills: AtomicU64,
    total_recycled: AtomicU64,
}

impl BufferPool {
    /// Allocate [`POOL_SIZE`] buffers of `buffer_len` bytes, all free.
    ///
    /// # Panics
    ///
    /// Panics if `buffer_len` is 0.
    #[must_use]
    pub fn new(buffer_len: usize) -> Self {
        assert!(buffer_len > 0, "buffer_len must be > 0");

        let ledger = MemoryLedger::default();
        let free: VecDeque<Buffer> = (0..POOL_SIZE)
            .map(|slot| Buffer::allocate(slot, buffer_len, &ledger))
            .collect();

        info!(
            pool_size = POOL_SIZE,
            buffer_len,
            total_bytes = POOL_SIZE * buffer_len,
            "BufferPool created"
        );

        Self {
            queues: Mutex::new(Queues {
                free,
                filled: VecDeque::with_capacity(POOL_SIZE),
                in_flight: 0,
                checked_out: 0,
                discarded: 0,
                closed: false,
            }),
            buffer_len,
            ledger,
            total_fills: AtomicU64::new(0),
            total_recycled: AtomicU64::new(0),
        }
    }

    /// Take the oldest free buffer for filling, without blocking.
    ///
    /// Returns `None` if every buffer is filled, in use, or the pool has been
    /// drained (backpressure indicator).
    #[must_use]
    pub fn try_acquire_free(&self) -> Option<Buffer> {
        let mut queues = self.queues.lock();
        if queues.closed {
            return None;
        }
        let buffer = queues.free.pop_front()?;
        queues.in_flight += 1;
        Some(buffer)
    }

    /// Publish a filled buffer to the consumer side.
    ///
    /// Returns `false` if the pool was drained while the buffer was in flight;
    /// the buffer is freed in that case.
    pub fn publish_filled(&self, buffer: Buffer) -> bool {
        let mut queues = self.queues.lock();
        queues.in_flight = queues.in_flight.saturating_sub(1);
        if queues.closed {
            drop(queues);
            debug!(slot = buffer.slot(), "Pool closed, freeing in-flight buffer");
            return false;
        }
        queues.filled.push_back(buffer);
        drop(queues);

        self.total_fills.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Take the oldest filled buffer, without blocking.
    #[must_use]
    pub fn take_filled(&self) -> Option<Buffer> {
        let mut queues = self.queues.lock();
        if queues.closed {
            return None;
        }
        let buffer = queues.filled.pop_front()?;
        queues.checked_out += 1;
        Some(buffer)
    }

    /// Return a consumed buffer to the free queue.
    ///
    /// Returns `false` if the pool was drained while the buffer was checked
    /// out; the buffer is freed in that case.
    pub fn recycle(&self, buffer: Buffer) -> bool {
        let mut queues = self.queues.lock();
        queues.checked_out = queues.checked_out.saturating_sub(1);
        if queues.closed {
            drop(queues);
            debug!(slot = buffer.slot(), "Pool closed, freeing checked-out buffer");
            return false;
        }
        queues.free.push_back(buffer);
        drop(queues);

        self.total_recycled.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Remove a checked-out buffer from circulation permanently.
    ///
    /// The pool shrinks by one; this is never undone.
    pub fn discard(&self, buffer: Buffer) {
        let remaining = {
            let mut queues = self.queues.lock();
            queues.checked_out = queues.checked_out.saturating_sub(1);
            queues.discarded += 1;
            POOL_SIZE - queues.discarded
        };

        warn!(slot = buffer.slot(), remaining, "Buffer discarded from pool");
        drop(buffer);
    }

    /// Account for an in-flight buffer that will never be published.
    ///
    /// Called when the producer unwinds mid-fill and the buffer is dropped
    /// in place. The slot is counted as discarded, so occupancy still sums
    /// to [`POOL_SIZE`].
    pub fn abandon_in_flight(&self) {
        let mut queues = self.queues.lock();
        queues.in_flight = queues.in_flight.saturating_sub(1);
        queues.discarded += 1;
    }

    /// Snapshot of where the pool's buffers are.
    #[must_use]
    pub fn occupancy(&self) -> Occupancy {
        self.queues.lock().occupancy()
    }

    /// Free every queued buffer and close the pool.
    ///
    /// Unconsumed filled buffers are discarded. Calling `drain` again
    /// reports nothing released.
    pub fn drain(&self) -> DrainReport {
        let (free, filled) = {
            let mut queues = self.queues.lock();
            queues.closed = true;
            (
                std::mem::take(&mut queues.free),
                std::mem::take(&mut queues.filled),
            )
        };

        let report = DrainReport {
            free_released: free.len(),
            filled_discarded: filled.len(),
        };
        drop(free);
        drop(filled);

        debug!(
            free_released = report.free_released,
            filled_discarded = report.filled_discarded,
            live_buffers = self.ledger.live_buffers(),
            "BufferPool drained"
        );
        report
    }

    /// Whether [`drain`](Self::drain) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.queues.lock().closed
    }

    /// Length in bytes of every buffer in this pool.
    #[must_use]
    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    /// Ledger of memory still attributed to this pool.
    #[must_use]
    pub fn ledger(&self) -> &MemoryLedger {
        &self.ledger
    }

    /// Total buffers published to the filled queue.
    #[must_use]
    pub fn total_fills(&self) -> u64 {
        self.total_fills.load(Ordering::Relaxed)
    }

    /// Total buffers returned to the free queue by consumers.
    #[must_use]
    pub fn total_recycled(&self) -> u64 {
        self.total_recycled.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_len", &self.buffer_len)
            .field("occupancy", &self.occupancy())
            .finish()
    }
}
