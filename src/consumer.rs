//! Consumer loop over a session.
//!
//! [`ReadLoop`] polls every channel of a session in turn and hands each block
//! it gets to a [`SampleSink`] as a [`BlockView`], which exposes the block one
//! acquisition line at a time. The loop sleeps briefly when a whole sweep
//! produced nothing and stops at the first non-transient read error.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::channel::{ChannelDescriptor, ChannelId, ChannelKind};
use crate::device::{decode_analog, decode_digital};
use crate::error::ReadError;
use crate::poller::StopToken;
use crate::session::{SessionReader, DEFAULT_IDLE_BACKOFF};

/// One block read from a channel.
#[derive(Debug, Clone, Copy)]
pub struct BlockView<'a> {
    descriptor: &'a ChannelDescriptor,
    bytes: &'a [u8],
}

impl<'a> BlockView<'a> {
    /// Wrap the bytes of one block.
    #[must_use]
    pub fn new(descriptor: &'a ChannelDescriptor, bytes: &'a [u8]) -> Self {
        Self { descriptor, bytes }
    }

    /// Channel the block came from.
    #[must_use]
    pub fn channel(&self) -> ChannelId {
        self.descriptor.id
    }

    /// Descriptor of that channel.
    #[must_use]
    pub fn descriptor(&self) -> &'a ChannelDescriptor {
        self.descriptor
    }

    /// Raw block bytes.
    #[must_use]
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Number of lines in the block.
    #[must_use]
    pub fn line_count(&self) -> usize {
        self.descriptor.lines
    }

    /// Raw bytes of line `line`, or `None` past the last line.
    #[must_use]
    pub fn line(&self, line: usize) -> Option<&'a [u8]> {
        if line >= self.descriptor.lines {
            return None;
        }
        let len = self.descriptor.line_len();
        self.bytes.get(line * len..(line + 1) * len)
    }

    /// Iterate the raw bytes of every line.
    pub fn lines(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        (0..self.line_count()).filter_map(|i| self.line(i))
    }

    /// Samples of analog line `line`. Empty for digital channels.
    #[must_use]
    pub fn analog_line(&self, line: usize) -> Vec<f64> {
        match (self.descriptor.kind, self.line(line)) {
            (ChannelKind::Analog, Some(bytes)) => decode_analog(bytes).collect(),
            _ => Vec::new(),
        }
    }

    /// Samples of digital line `line`. Empty for analog channels.
    #[must_use]
    pub fn digital_line(&self, line: usize) -> Vec<u32> {
        match (self.descriptor.kind, self.line(line)) {
            (ChannelKind::Digital, Some(bytes)) => decode_digital(bytes).collect(),
            _ => Vec::new(),
        }
    }
}

/// Receiver of blocks from a [`ReadLoop`].
pub trait SampleSink {
    /// Handle one block. The view is only valid during the call.
    fn on_block(&mut self, block: BlockView<'_>);
}

impl<F> SampleSink for F
where
    F: FnMut(BlockView<'_>),
{
    fn on_block(&mut self, block: BlockView<'_>) {
        self(block);
    }
}

/// Counters for one run of a [`ReadLoop`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopSummary {
    /// Blocks delivered to the sink.
    pub blocks: u64,
    /// Bytes delivered to the sink.
    pub bytes: u64,
    /// Sweeps that found no data on any channel.
    pub idle_sweeps: u64,
}

/// Why a [`ReadLoop`] run ended with an error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Read loop stopped on channel {channel}: {error}")]
pub struct LoopError {
    /// Channel whose read failed.
    pub channel: ChannelId,
    /// The read error.
    #[source]
    pub error: ReadError,
    /// Work done before the failure.
    pub summary: LoopSummary,
}

struct Slot {
    descriptor: ChannelDescriptor,
    scratch: Vec<u8>,
}

/// Round-robin consumer over every channel of a session.
pub struct ReadLoop {
    reader: SessionReader,
    slots: Vec<Slot>,
    idle_backoff: Duration,
}

impl ReadLoop {
    /// Loop over every channel of `reader`, with one block-sized scratch
    /// buffer per channel.
    #[must_use]
    pub fn new(reader: SessionReader) -> Self {
        let slots = reader
            .descriptors()
            .into_iter()
            .map(|descriptor| Slot {
                scratch: vec![0u8; descriptor.buffer_len()],
                descriptor,
            })
            .collect();
        Self {
            reader,
            slots,
            idle_backoff: DEFAULT_IDLE_BACKOFF,
        }
    }

    /// Sleep between sweeps that found no data.
    #[must_use]
    pub fn with_idle_backoff(mut self, idle_backoff: Duration) -> Self {
        self.idle_backoff = idle_backoff;
        self
    }

    /// Run until `stop` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError`] on the first read error other than
    /// [`ReadError::NoDataAvailable`].
    pub fn run<S: SampleSink>(
        &mut self,
        sink: &mut S,
        stop: &StopToken,
    ) -> Result<LoopSummary, LoopError> {
        self.run_while(sink, || !stop.is_cancelled())
    }

    /// Run for `duration`.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub fn run_for<S: SampleSink>(
        &mut self,
        sink: &mut S,
        duration: Duration,
    ) -> Result<LoopSummary, LoopError> {
        let deadline = Instant::now() + duration;
        self.run_while(sink, || Instant::now() < deadline)
    }

    /// Run until at least `blocks` blocks have been delivered. A sweep is
    /// never cut short, so a few more may arrive.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub fn run_blocks<S: SampleSink>(
        &mut self,
        sink: &mut S,
        blocks: u64,
    ) -> Result<LoopSummary, LoopError> {
        let mut summary = LoopSummary::default();
        while summary.blocks < blocks {
            summary = self.sweep(sink, summary)?;
        }
        debug!(blocks = summary.blocks, bytes = summary.bytes, "Read loop finished");
        Ok(summary)
    }

    fn run_while<S, F>(&mut self, sink: &mut S, mut keep_going: F) -> Result<LoopSummary, LoopError>
    where
        S: SampleSink,
        F: FnMut() -> bool,
    {
        let mut summary = LoopSummary::default();
        while keep_going() {
            summary = self.sweep(sink, summary)?;
        }
        debug!(blocks = summary.blocks, bytes = summary.bytes, "Read loop finished");
        Ok(summary)
    }

    /// Read at most one block from every channel.
    fn sweep<S: SampleSink>(
        &mut self,
        sink: &mut S,
        mut summary: LoopSummary,
    ) -> Result<LoopSummary, LoopError> {
        let mut delivered = false;

        for slot in &mut self.slots {
            let id = slot.descriptor.id;
            match self.reader.read(id, &mut slot.scratch) {
                Ok(len) => {
                    sink.on_block(BlockView::new(&slot.descriptor, &slot.scratch[..len]));
                    summary.blocks += 1;
                    summary.bytes += len as u64;
                    delivered = true;
                }
                Err(ReadError::NoDataAvailable) => {}
                Err(error) => {
                    warn!(channel = %id, %error, "Read loop stopping");
                    return Err(LoopError {
                        channel: id,
                        error,
                        summary,
                    });
                }
            }
        }

        if !delivered {
            summary.idle_sweeps += 1;
            thread::sleep(self.idle_backoff);
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{encode_analog, encode_digital};

    #[test]
    fn test_block_view_splits_lines() {
        let desc = ChannelDescriptor::multi_line(1, ChannelKind::Analog, 3, 2);
        let mut bytes = vec![0u8; desc.buffer_len()];
        encode_analog(&mut bytes, [1.0, 2.0, 3.0, 10.0, 20.0, 30.0]);

        let view = BlockView::new(&desc, &bytes);
        assert_eq!(view.channel(), ChannelId(1));
        assert_eq!(view.line_count(), 2);
        assert_eq!(view.lines().count(), 2);
        assert_eq!(view.analog_line(0), vec![1.0, 2.0, 3.0]);
        assert_eq!(view.analog_line(1), vec![10.0, 20.0, 30.0]);
        assert!(view.line(2).is_none());
        assert!(view.digital_line(0).is_empty());
    }

    #[test]
    fn test_block_view_ignores_slack_after_last_line() {
        // buffer_size larger than samples_per_chan * lines
        let desc = ChannelDescriptor::new(2, ChannelKind::Digital, 2, 5);
        let mut bytes = vec![0u8; desc.buffer_len()];
        encode_digital(&mut bytes, [7, 8, 9, 9, 9]);

        let view = BlockView::new(&desc, &bytes);
        assert_eq!(view.digital_line(0), vec![7, 8]);
        assert!(view.line(1).is_none());
    }

    #[test]
    fn test_closure_is_a_sink() {
        let desc = ChannelDescriptor::new(3, ChannelKind::Digital, 1, 1);
        let bytes = [0u8; 4];
        let mut seen = Vec::new();
        let mut sink = |block: BlockView<'_>| seen.push(block.channel());
        sink.on_block(BlockView::new(&desc, &bytes));
        assert_eq!(seen, vec![ChannelId(3)]);
    }
}
