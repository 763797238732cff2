//! Channel descriptors, channel kinds and per-channel session state.
//!
//! A channel is one independent acquisition stream identified by a
//! caller-supplied [`ChannelId`]. Its [`ChannelKind`] selects an
//! [`AcquisitionChannel`] capability, which supplies the element size and the
//! device read entry point. The poller only ever talks to that trait, so a
//! new kind of input is added by implementing it, without touching the loop.
//!
//! # Buffer Layout
//!
//! A channel may multiplex several physical lines. Samples are grouped by
//! line: the block holds `samples_per_chan` samples of line 0, then
//! `samples_per_chan` samples of line 1, and so on. The nominal
//! `buffer_size` (in samples) must leave room for every line.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use daq_pool::{BufferPool, Occupancy};
use serde::{Deserialize, Serialize};

use crate::device::{AcquisitionDevice, ReadOutcome, ReadRequest};
use crate::error::SessionError;

/// Caller-supplied channel handle, unique within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ChannelId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Kind of input stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// 64-bit floating point samples.
    Analog,
    /// 32-bit digital port samples.
    Digital,
}

impl ChannelKind {
    /// The capability implementing this kind.
    #[must_use]
    pub fn capability(self) -> &'static dyn AcquisitionChannel {
        match self {
            Self::Analog => &AnalogChannel,
            Self::Digital => &DigitalChannel,
        }
    }

    /// Bytes per sample.
    #[must_use]
    pub fn element_size(self) -> usize {
        self.capability().element_size()
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Analog => write!(f, "analog"),
            Self::Digital => write!(f, "digital"),
        }
    }
}

/// Capability for one kind of acquisition channel.
///
/// Implementations pick the device entry point matching their sample type.
pub trait AcquisitionChannel: Send + Sync {
    /// Kind implemented by this capability.
    fn kind(&self) -> ChannelKind;

    /// Bytes per sample.
    fn element_size(&self) -> usize;

    /// Fill `request.dest` from the device.
    fn fill(&self, device: &dyn AcquisitionDevice, request: ReadRequest<'_>) -> ReadOutcome;
}

/// Analog input: `f64` samples read through [`AcquisitionDevice::read_analog`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalogChannel;

impl AcquisitionChannel for AnalogChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Analog
    }

    fn element_size(&self) -> usize {
        std::mem::size_of::<f64>()
    }

    fn fill(&self, device: &dyn AcquisitionDevice, request: ReadRequest<'_>) -> ReadOutcome {
        device.read_analog(request)
    }
}

/// Digital input: `u32` samples read through [`AcquisitionDevice::read_digital`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DigitalChannel;

impl AcquisitionChannel for DigitalChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Digital
    }

    fn element_size(&self) -> usize {
        std::mem::size_of::<u32>()
    }

    fn fill(&self, device: &dyn AcquisitionDevice, request: ReadRequest<'_>) -> ReadOutcome {
        device.read_digital(request)
    }
}

fn default_lines() -> usize {
    1
}

/// Configuration of one acquisition channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    /// Caller-supplied handle.
    pub id: ChannelId,
    /// Input kind.
    pub kind: ChannelKind,
    /// Samples requested per line on every read.
    pub samples_per_chan: usize,
    /// Nominal buffer size in samples.
    pub buffer_size: usize,
    /// Physical lines multiplexed in this channel.
    #[serde(default = "default_lines")]
    pub lines: usize,
    /// Optional label for logs.
    #[serde(default)]
    pub name: Option<String>,
}

impl ChannelDescriptor {
    /// Single-line channel descriptor.
    #[must_use]
    pub fn new(
        id: impl Into<ChannelId>,
        kind: ChannelKind,
        samples_per_chan: usize,
        buffer_size: usize,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            samples_per_chan,
            buffer_size,
            lines: 1,
            name: None,
        }
    }

    /// Descriptor for `lines` lines of `samples_per_chan` samples each, with
    /// a buffer sized exactly for one read of every line.
    #[must_use]
    pub fn multi_line(
        id: impl Into<ChannelId>,
        kind: ChannelKind,
        samples_per_chan: usize,
        lines: usize,
    ) -> Self {
        Self {
            lines,
            ..Self::new(id, kind, samples_per_chan, samples_per_chan * lines)
        }
    }

    /// Attach a label.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Bytes per sample.
    #[must_use]
    pub fn element_size(&self) -> usize {
        self.kind.element_size()
    }

    /// Length in bytes of every buffer of this channel.
    #[must_use]
    pub fn buffer_len(&self) -> usize {
        self.buffer_size * self.element_size()
    }

    /// Bytes occupied by one line inside a block.
    #[must_use]
    pub fn line_len(&self) -> usize {
        self.samples_per_chan * self.element_size()
    }

    /// Label used in logs.
    #[must_use]
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{}{}", self.kind, self.id),
        }
    }

    /// Check the descriptor is usable.
    pub fn validate(&self) -> Result<(), SessionError> {
        let invalid = |reason: String| SessionError::InvalidChannel {
            id: self.id,
            reason,
        };

        if self.samples_per_chan == 0 {
            return Err(invalid("samples_per_chan must be > 0".into()));
        }
        if self.buffer_size == 0 {
            return Err(invalid("buffer_size must be > 0".into()));
        }
        if self.lines == 0 {
            return Err(invalid("lines must be > 0".into()));
        }
        let needed = self.samples_per_chan.checked_mul(self.lines);
        match needed {
            Some(needed) if needed <= self.buffer_size => {}
            _ => {
                return Err(invalid(format!(
                    "buffer_size {} cannot hold {} samples x {} lines",
                    self.buffer_size, self.samples_per_chan, self.lines
                )))
            }
        }
        if self.buffer_size.checked_mul(self.element_size()).is_none() {
            return Err(invalid("buffer size in bytes overflows".into()));
        }
        Ok(())
    }
}

/// Per-channel statistics snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStats {
    /// Channel the snapshot belongs to.
    pub id: ChannelId,
    /// Where the channel's buffers are.
    pub occupancy: Occupancy,
    /// Buffers published by the poller.
    pub fills: u64,
    /// Successful consumer reads.
    pub reads: u64,
    /// Fills that recorded a negative status.
    pub device_errors: u64,
    /// Poller visits that found no free buffer.
    pub starved_visits: u64,
}

/// One channel of a running session.
pub struct ChannelState {
    descriptor: ChannelDescriptor,
    capability: &'static dyn AcquisitionChannel,
    pool: BufferPool,
    reads: AtomicU64,
    device_errors: AtomicU64,
    starved_visits: AtomicU64,
    starving: AtomicBool,
}

impl ChannelState {
    /// Build the channel and allocate its buffer pool.
    pub(crate) fn new(descriptor: ChannelDescriptor) -> Self {
        let capability = descriptor.kind.capability();
        let pool = BufferPool::new(descriptor.buffer_len());
        Self {
            descriptor,
            capability,
            pool,
            reads: AtomicU64::new(0),
            device_errors: AtomicU64::new(0),
            starved_visits: AtomicU64::new(0),
            starving: AtomicBool::new(false),
        }
    }

    /// Channel configuration.
    #[must_use]
    pub fn descriptor(&self) -> &ChannelDescriptor {
        &self.descriptor
    }

    /// Channel id.
    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.descriptor.id
    }

    /// Kind capability.
    #[must_use]
    pub fn capability(&self) -> &'static dyn AcquisitionChannel {
        self.capability
    }

    /// The channel's buffer pool.
    #[must_use]
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub(crate) fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_device_error(&self) {
        self.device_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a starved visit. Returns `true` on the first visit of a
    /// starvation episode.
    pub(crate) fn record_starved(&self) -> bool {
        self.starved_visits.fetch_add(1, Ordering::Relaxed);
        !self.starving.swap(true, Ordering::Relaxed)
    }

    /// End a starvation episode. Returns `true` if one was in progress.
    pub(crate) fn clear_starved(&self) -> bool {
        self.starving.swap(false, Ordering::Relaxed)
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            id: self.descriptor.id,
            occupancy: self.pool.occupancy(),
            fills: self.pool.total_fills(),
            reads: self.reads.load(Ordering::Relaxed),
            device_errors: self.device_errors.load(Ordering::Relaxed),
            starved_visits: self.starved_visits.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelState")
            .field("descriptor", &self.descriptor)
            .field("pool", &self.pool)
            .finish()
    }
}
