//! Acquisition session: channels, poller thread and the consumer read path.
//!
//! A [`Session`] owns one [`ChannelState`] per channel and the background
//! poller that fills them. Consumers call [`Session::read`] (or
//! [`SessionReader::read`] from other threads) to take the oldest filled
//! block of a channel.
//!
//! # Shutdown
//!
//! [`Session::close`] requests a stop, waits for the poller's completion
//! signal, joins the thread and then drains every pool. Blocks that were
//! filled but never read are discarded. Once the session is marked closed,
//! every read returns [`ReadError::UnknownChannel`].
//!
//! ```no_run
//! use daq_loop::{ChannelDescriptor, ChannelKind, Session, SessionOptions, SimulatedDevice};
//!
//! let session = Session::open(
//!     SimulatedDevice::default(),
//!     vec![ChannelDescriptor::new(1, ChannelKind::Analog, 100, 100)],
//!     SessionOptions::default(),
//! )?;
//!
//! let mut block = vec![0u8; 800];
//! match session.read(1.into(), &mut block) {
//!     Ok(n) => println!("got {n} bytes"),
//!     Err(e) if e.is_transient() => {}
//!     Err(e) => eprintln!("read failed: {e}"),
//! }
//!
//! let report = session.close();
//! assert_eq!(report.live_buffers(), 0);
//! # Ok::<(), daq_loop::SessionError>(())
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use daq_pool::{DrainReport, MemoryLedger};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelDescriptor, ChannelId, ChannelState, ChannelStats};
use crate::device::{AcquisitionDevice, DEFAULT_READ_TIMEOUT};
use crate::error::{ReadError, SessionError};
use crate::poller::{Completion, Poller, PollerSummary, StopToken};

/// Default sleep after a sweep in which some channel had no free buffer.
pub const DEFAULT_IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// What a read does with a block that did not fit the destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizingErrorPolicy {
    /// Put the block back on the free queue. The data is lost, the buffer
    /// is not.
    #[default]
    Recycle,
    /// Remove the buffer from the pool for good. The channel keeps running
    /// with one buffer fewer.
    Discard,
}

fn default_idle_backoff() -> Duration {
    DEFAULT_IDLE_BACKOFF
}

fn default_read_timeout() -> Duration {
    DEFAULT_READ_TIMEOUT
}

/// Tunables for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Poller sleep after a sweep that found a starved channel.
    #[serde(default = "default_idle_backoff", with = "humantime_serde")]
    pub idle_backoff: Duration,
    /// Timeout passed to every device read.
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Handling of blocks that do not fit the read destination.
    #[serde(default)]
    pub sizing_error_policy: SizingErrorPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            idle_backoff: DEFAULT_IDLE_BACKOFF,
            read_timeout: DEFAULT_READ_TIMEOUT,
            sizing_error_policy: SizingErrorPolicy::default(),
        }
    }
}

/// Teardown result for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelCloseReport {
    /// Channel drained.
    pub id: ChannelId,
    /// What the drain released.
    pub drain: DrainReport,
    /// Buffers of this channel still alive right after the drain. Non-zero
    /// only while a concurrent reader still holds a block.
    pub live_buffers: usize,
    /// Final statistics.
    pub stats: ChannelStats,
}

/// Result of closing a session.
#[derive(Debug, Clone)]
pub struct CloseReport {
    /// Per-channel teardown, in session order.
    pub channels: Vec<ChannelCloseReport>,
    /// Poller counters, `None` if the poller panicked.
    pub poller: Option<PollerSummary>,
    /// Time the session was open.
    pub uptime: Duration,
}

impl CloseReport {
    /// Buffers released across all channels.
    #[must_use]
    pub fn buffers_released(&self) -> usize {
        self.channels.iter().map(|c| c.drain.released()).sum()
    }

    /// Filled blocks discarded without being read.
    #[must_use]
    pub fn filled_discarded(&self) -> usize {
        self.channels.iter().map(|c| c.drain.filled_discarded).sum()
    }

    /// Buffers still alive after teardown.
    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.channels.iter().map(|c| c.live_buffers).sum()
    }

    /// Whether the poller exited normally.
    #[must_use]
    pub fn poller_exited_cleanly(&self) -> bool {
        self.poller.is_some()
    }
}

/// State shared by the session, its readers and the poller.
struct Shared {
    channels: Arc<[ChannelState]>,
    index: HashMap<ChannelId, usize>,
    sizing_error_policy: SizingErrorPolicy,
    closed: AtomicBool,
}

impl Shared {
    fn channel(&self, id: ChannelId) -> Result<&ChannelState, ReadError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ReadError::UnknownChannel(id));
        }
        self.index
            .get(&id)
            .map(|&i| &self.channels[i])
            .ok_or(ReadError::UnknownChannel(id))
    }

    fn read(&self, id: ChannelId, dest: &mut [u8]) -> Result<usize, ReadError> {
        let channel = self.channel(id)?;
        let pool = channel.pool();

        let Some(buffer) = pool.take_filled() else {
            return if pool.is_closed() {
                Err(ReadError::UnknownChannel(id))
            } else {
                Err(ReadError::NoDataAvailable)
            };
        };

        if dest.len() < buffer.len() {
            let err = ReadError::InsufficientBuffer {
                required: buffer.len(),
                capacity: dest.len(),
            };
            match self.sizing_error_policy {
                SizingErrorPolicy::Recycle => {
                    debug!(
                        channel = %id,
                        slot = buffer.slot(),
                        "Block too large for destination, recycling"
                    );
                    pool.recycle(buffer);
                }
                SizingErrorPolicy::Discard => pool.discard(buffer),
            }
            return Err(err);
        }

        let result = if buffer.is_ok() {
            let len = buffer.len();
            dest[..len].copy_from_slice(buffer.as_slice());
            channel.record_read();
            Ok(len)
        } else {
            Err(ReadError::DeviceError(buffer.status()))
        };
        pool.recycle(buffer);
        result
    }
}

/// A running acquisition session.
///
/// Dropping a session that was not closed closes it.
pub struct Session {
    shared: Arc<Shared>,
    stop: StopToken,
    completion: Completion,
    poller: Option<JoinHandle<PollerSummary>>,
    opened_at: Instant,
}

impl Session {
    /// Validate the channels, allocate their pools and start the poller.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] for an empty channel list, an invalid or
    /// duplicate descriptor, or if the poller thread cannot be spawned.
    /// Nothing is left running on error.
    pub fn open<D>(
        device: D,
        channels: impl IntoIterator<Item = ChannelDescriptor>,
        options: SessionOptions,
    ) -> Result<Self, SessionError>
    where
        D: AcquisitionDevice + 'static,
    {
        let descriptors: Vec<ChannelDescriptor> = channels.into_iter().collect();
        if descriptors.is_empty() {
            return Err(SessionError::NoChannels);
        }

        let mut index = HashMap::with_capacity(descriptors.len());
        for (i, descriptor) in descriptors.iter().enumerate() {
            descriptor.validate()?;
            if index.insert(descriptor.id, i).is_some() {
                return Err(SessionError::DuplicateChannel(descriptor.id));
            }
        }

        let channels: Arc<[ChannelState]> =
            descriptors.into_iter().map(ChannelState::new).collect();
        let stop = StopToken::new();
        let completion = Completion::new();

        let handle = Poller::new(
            Arc::clone(&channels),
            Arc::new(device),
            &options,
            stop.clone(),
            completion.clone(),
        )
        .spawn()
        .map_err(SessionError::PollerSpawn)?;

        info!(
            channels = channels.len(),
            idle_backoff = ?options.idle_backoff,
            read_timeout = ?options.read_timeout,
            sizing_error_policy = ?options.sizing_error_policy,
            "Session opened"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                channels,
                index,
                sizing_error_policy: options.sizing_error_policy,
                closed: AtomicBool::new(false),
            }),
            stop,
            completion,
            poller: Some(handle),
            opened_at: Instant::now(),
        })
    }

    /// Take the oldest filled block of `id` into `dest`.
    ///
    /// Returns the number of bytes copied, always the channel's full buffer
    /// length.
    ///
    /// # Errors
    ///
    /// See [`ReadError`]. Only [`ReadError::NoDataAvailable`] is transient.
    pub fn read(&self, id: ChannelId, dest: &mut [u8]) -> Result<usize, ReadError> {
        self.shared.read(id, dest)
    }

    /// Handle for reading from other threads.
    #[must_use]
    pub fn reader(&self) -> SessionReader {
        SessionReader {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Channel ids in session order.
    #[must_use]
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.shared.channels.iter().map(ChannelState::id).collect()
    }

    /// Descriptor of `id`.
    #[must_use]
    pub fn descriptor(&self, id: ChannelId) -> Option<&ChannelDescriptor> {
        self.shared
            .index
            .get(&id)
            .map(|&i| self.shared.channels[i].descriptor())
    }

    /// Statistics snapshot of `id`.
    #[must_use]
    pub fn stats(&self, id: ChannelId) -> Option<ChannelStats> {
        self.shared
            .index
            .get(&id)
            .map(|&i| self.shared.channels[i].stats())
    }

    /// Memory ledgers of every channel, in session order.
    ///
    /// Ledgers outlive the session, so they can confirm that closing freed
    /// every buffer.
    #[must_use]
    pub fn ledgers(&self) -> Vec<MemoryLedger> {
        self.shared
            .channels
            .iter()
            .map(|c| c.pool().ledger().clone())
            .collect()
    }

    /// Whether the poller thread is still in its loop.
    #[must_use]
    pub fn is_polling(&self) -> bool {
        !self.completion.is_signaled()
    }

    /// Stop the poller, wait for it and free every buffer.
    pub fn close(mut self) -> CloseReport {
        self.stop.cancel();
        self.completion.wait();
        self.teardown()
    }

    /// Like [`close`](Self::close), but wait at most `timeout` for the
    /// poller.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ShutdownTimeout`] if the poller is still
    /// inside a device read when the timeout elapses. The session is marked
    /// closed and its queues are drained anyway; the poller thread is
    /// detached and frees its last buffer when it returns.
    pub fn close_timeout(mut self, timeout: Duration) -> Result<CloseReport, SessionError> {
        self.stop.cancel();
        if self.completion.wait_timeout(timeout) {
            return Ok(self.teardown());
        }

        warn!(?timeout, "Poller did not stop in time, detaching it");
        self.poller.take();
        self.shared.closed.store(true, Ordering::Release);
        for channel in self.shared.channels.iter() {
            channel.pool().drain();
        }
        Err(SessionError::ShutdownTimeout(timeout))
    }

    fn teardown(&mut self) -> CloseReport {
        let summary = match self.poller.take().map(JoinHandle::join) {
            Some(Ok(summary)) => Some(summary),
            Some(Err(_)) => {
                error!("Poller thread panicked");
                None
            }
            None => None,
        };

        self.shared.closed.store(true, Ordering::Release);

        let channels: Vec<ChannelCloseReport> = self
            .shared
            .channels
            .iter()
            .map(|channel| {
                let drain = channel.pool().drain();
                ChannelCloseReport {
                    id: channel.id(),
                    drain,
                    live_buffers: channel.pool().ledger().live_buffers(),
                    stats: channel.stats(),
                }
            })
            .collect();

        let report = CloseReport {
            channels,
            poller: summary,
            uptime: self.opened_at.elapsed(),
        };

        info!(
            channels = report.channels.len(),
            buffers_released = report.buffers_released(),
            filled_discarded = report.filled_discarded(),
            live_buffers = report.live_buffers(),
            uptime = ?report.uptime,
            "Session closed"
        );
        report
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.poller.is_some() {
            debug!("Session dropped without close, closing");
            self.stop.cancel();
            self.completion.wait();
            self.teardown();
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("channels", &self.channel_ids())
            .field("polling", &self.is_polling())
            .finish()
    }
}

/// Cloneable read handle to a session.
///
/// Reads through a handle behave exactly like [`Session::read`]. After the
/// session is closed they return [`ReadError::UnknownChannel`].
#[derive(Clone)]
pub struct SessionReader {
    shared: Arc<Shared>,
}

impl SessionReader {
    /// See [`Session::read`].
    ///
    /// # Errors
    ///
    /// See [`ReadError`].
    pub fn read(&self, id: ChannelId, dest: &mut [u8]) -> Result<usize, ReadError> {
        self.shared.read(id, dest)
    }

    /// Descriptors of every channel, in session order.
    #[must_use]
    pub fn descriptors(&self) -> Vec<ChannelDescriptor> {
        self.shared
            .channels
            .iter()
            .map(|c| c.descriptor().clone())
            .collect()
    }

    /// Whether the session has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for SessionReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionReader")
            .field("closed", &self.is_closed())
            .finish()
    }
}
