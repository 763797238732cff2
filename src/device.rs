//! The hardware read capability consumed by the poller.
//!
//! [`AcquisitionDevice`] is the boundary to the actual driver. The poller
//! calls it once for every free buffer it manages to acquire, never while
//! holding a channel lock. The device writes samples into the buffer bytes
//! and returns a [`ReadOutcome`] whose status is passed through to the
//! consumer verbatim.

use std::sync::Arc;
use std::time::Duration;

use crate::channel::ChannelDescriptor;

/// Default per-read timeout handed to the device.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(3);

/// One request to fill a buffer.
#[derive(Debug)]
pub struct ReadRequest<'a> {
    /// Channel being read.
    pub descriptor: &'a ChannelDescriptor,
    /// Destination bytes, exactly one buffer long.
    pub dest: &'a mut [u8],
    /// How long the device may block waiting for samples.
    pub timeout: Duration,
}

impl ReadRequest<'_> {
    /// Destination capacity in samples.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.dest.len() / self.descriptor.element_size()
    }
}

/// Result of one device read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Samples per line delivered by the device.
    pub samples_read: usize,
    /// Driver status: `>= 0` success (positive values are warnings),
    /// `< 0` failure.
    pub status: i32,
}

impl ReadOutcome {
    /// Successful read.
    #[must_use]
    pub fn success(samples_read: usize) -> Self {
        Self {
            samples_read,
            status: 0,
        }
    }

    /// Failed read with a driver status code.
    #[must_use]
    pub fn failure(status: i32) -> Self {
        Self {
            samples_read: 0,
            status,
        }
    }

    /// Whether the status reports success.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status >= 0
    }
}

/// Hardware access used to fill buffers.
///
/// One entry point per sample type. Implementations must be safe to call
/// from the poller thread while other threads read from the session.
pub trait AcquisitionDevice: Send + Sync {
    /// Read `f64` samples, grouped by line, into `request.dest`.
    fn read_analog(&self, request: ReadRequest<'_>) -> ReadOutcome;

    /// Read `u32` samples, grouped by line, into `request.dest`.
    fn read_digital(&self, request: ReadRequest<'_>) -> ReadOutcome;
}

impl<T: AcquisitionDevice + ?Sized> AcquisitionDevice for Arc<T> {
    fn read_analog(&self, request: ReadRequest<'_>) -> ReadOutcome {
        (**self).read_analog(request)
    }

    fn read_digital(&self, request: ReadRequest<'_>) -> ReadOutcome {
        (**self).read_digital(request)
    }
}

/// Write `f64` samples into `dest` in native byte order.
///
/// Stops at whichever runs out first; returns the number of samples written.
pub fn encode_analog(dest: &mut [u8], samples: impl IntoIterator<Item = f64>) -> usize {
    let mut written = 0;
    for (chunk, value) in dest.chunks_exact_mut(std::mem::size_of::<f64>()).zip(samples) {
        chunk.copy_from_slice(&value.to_ne_bytes());
        written += 1;
    }
    written
}

/// Write `u32` samples into `dest` in native byte order.
///
/// Stops at whichever runs out first; returns the number of samples written.
pub fn encode_digital(dest: &mut [u8], samples: impl IntoIterator<Item = u32>) -> usize {
    let mut written = 0;
    for (chunk, value) in dest.chunks_exact_mut(std::mem::size_of::<u32>()).zip(samples) {
        chunk.copy_from_slice(&value.to_ne_bytes());
        written += 1;
    }
    written
}

/// Decode native-order `f64` samples.
pub fn decode_analog(bytes: &[u8]) -> impl Iterator<Item = f64> + '_ {
    bytes.chunks_exact(std::mem::size_of::<f64>()).map(|chunk| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        f64::from_ne_bytes(raw)
    })
}

/// Decode native-order `u32` samples.
pub fn decode_digital(bytes: &[u8]) -> impl Iterator<Item = u32> + '_ {
    bytes.chunks_exact(std::mem::size_of::<u32>()).map(|chunk| {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(chunk);
        u32::from_ne_bytes(raw)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKind;

    #[test]
    fn test_outcome_status() {
        assert!(ReadOutcome::success(10).is_ok());
        assert!(ReadOutcome { samples_read: 10, status: 200_010 }.is_ok());
        assert!(!ReadOutcome::failure(-200_279).is_ok());
    }

    #[test]
    fn test_request_capacity() {
        let desc = ChannelDescriptor::new(1, ChannelKind::Analog, 10, 10);
        let mut bytes = vec![0u8; desc.buffer_len()];
        let request = ReadRequest {
            descriptor: &desc,
            dest: &mut bytes,
            timeout: DEFAULT_READ_TIMEOUT,
        };
        assert_eq!(request.capacity(), 10);
    }

    #[test]
    fn test_sample_codec() {
        let mut bytes = [0u8; 24];
        assert_eq!(encode_analog(&mut bytes, [1.5, -2.0, 3.25, 9.0]), 3);
        let values: Vec<f64> = decode_analog(&bytes).collect();
        assert_eq!(values, vec![1.5, -2.0, 3.25]);

        let mut bytes = [0u8; 8];
        assert_eq!(encode_digital(&mut bytes, [0xdead_beef]), 1);
        let values: Vec<u32> = decode_digital(&bytes).collect();
        assert_eq!(values, vec![0xdead_beef, 0]);
    }
}
