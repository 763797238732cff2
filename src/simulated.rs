//! Simulated acquisition hardware.
//!
//! [`SimulatedDevice`] implements [`AcquisitionDevice`] without any hardware,
//! for tests and for the `daq-loop run` command.
//!
//! - Analog lines produce a sine wave (one cycle per `period_samples`) with
//!   a per-line phase offset and a small deterministic noise term.
//! - Digital lines produce a running sample counter with the line index in
//!   the upper 8 bits.
//! - Every `fail_every`-th read returns `error_code` instead of data.
//! - `read_latency` emulates a hardware-timed read blocking for its samples.

use std::collections::HashMap;
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::channel::{ChannelId, ChannelKind};
use crate::device::{encode_analog, encode_digital, AcquisitionDevice, ReadOutcome, ReadRequest};

/// Simple pseudo-random number generator (LCG) for reproducible noise.
#[inline]
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1103515245).wrapping_add(12345) & 0x7fffffff
}

fn default_period() -> usize {
    200
}

fn default_error_code() -> i32 {
    -200_279
}

/// Behaviour of a [`SimulatedDevice`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Samples per sine cycle on analog lines.
    #[serde(default = "default_period")]
    pub period_samples: usize,
    /// Peak noise added to analog samples.
    #[serde(default)]
    pub noise_amplitude: f64,
    /// Fail every N-th read (counted across all channels). `None` never fails.
    #[serde(default)]
    pub fail_every: Option<u64>,
    /// Status returned by injected failures.
    #[serde(default = "default_error_code")]
    pub error_code: i32,
    /// Time every read blocks before returning.
    #[serde(default, with = "humantime_serde")]
    pub read_latency: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            period_samples: default_period(),
            noise_amplitude: 0.0,
            fail_every: None,
            error_code: default_error_code(),
            read_latency: Duration::ZERO,
        }
    }
}

/// Hardware stand-in producing deterministic waveforms.
#[derive(Debug)]
pub struct SimulatedDevice {
    config: SimulationConfig,
    reads: AtomicU64,
    /// Next sample index per channel, so waveforms continue across reads.
    cursors: Mutex<HashMap<ChannelId, u64>>,
}

impl SimulatedDevice {
    /// Device with the given behaviour.
    #[must_use]
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            reads: AtomicU64::new(0),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Total reads served, including injected failures.
    #[must_use]
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Expected analog value for `line` at absolute sample `index`,
    /// excluding noise.
    #[must_use]
    pub fn analog_value(&self, line: usize, index: u64) -> f64 {
        let period = self.config.period_samples.max(1) as f64;
        let phase = line as f64 * TAU / 8.0;
        (TAU * index as f64 / period + phase).sin()
    }

    /// Expected digital value for `line` at absolute sample `index`.
    #[must_use]
    pub fn digital_value(line: usize, index: u64) -> u32 {
        ((line as u32 & 0xff) << 24) | (index as u32 & 0x00ff_ffff)
    }

    /// Count this read and decide whether it fails.
    fn begin_read(&self, request: &ReadRequest<'_>) -> Option<ReadOutcome> {
        if !self.config.read_latency.is_zero() {
            std::thread::sleep(self.config.read_latency.min(request.timeout));
        }
        let n = self.reads.fetch_add(1, Ordering::Relaxed) + 1;
        match self.config.fail_every {
            Some(every) if every > 0 && n % every == 0 => {
                trace!(
                    channel = %request.descriptor.id,
                    code = self.config.error_code,
                    "Injecting read failure"
                );
                Some(ReadOutcome::failure(self.config.error_code))
            }
            _ => None,
        }
    }

    /// Reserve `count` samples on a channel's timeline; returns the first index.
    fn advance(&self, id: ChannelId, count: usize) -> u64 {
        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(id).or_insert(0);
        let start = *cursor;
        *cursor += count as u64;
        start
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new(SimulationConfig::default())
    }
}

impl AcquisitionDevice for SimulatedDevice {
    fn read_analog(&self, request: ReadRequest<'_>) -> ReadOutcome {
        if let Some(failed) = self.begin_read(&request) {
            return failed;
        }
        let desc = request.descriptor;
        debug_assert_eq!(desc.kind, ChannelKind::Analog);

        let samples = desc.samples_per_chan;
        let start = self.advance(desc.id, samples);
        let line_len = desc.line_len();
        let noise = self.config.noise_amplitude;

        for (line, chunk) in request.dest.chunks_mut(line_len).take(desc.lines).enumerate() {
            let values = (0..samples as u64).map(|k| {
                let index = start + k;
                let jitter = if noise > 0.0 {
                    let r = prng(index ^ ((line as u64) << 32)) as f64 / 0x7fff_ffff as f64;
                    (r * 2.0 - 1.0) * noise
                } else {
                    0.0
                };
                self.analog_value(line, index) + jitter
            });
            encode_analog(chunk, values);
        }

        ReadOutcome::success(samples)
    }

    fn read_digital(&self, request: ReadRequest<'_>) -> ReadOutcome {
        if let Some(failed) = self.begin_read(&request) {
            return failed;
        }
        let desc = request.descriptor;
        debug_assert_eq!(desc.kind, ChannelKind::Digital);

        let samples = desc.samples_per_chan;
        let start = self.advance(desc.id, samples);
        let line_len = desc.line_len();

        for (line, chunk) in request.dest.chunks_mut(line_len).take(desc.lines).enumerate() {
            encode_digital(
                chunk,
                (0..samples as u64).map(|k| Self::digital_value(line, start + k)),
            );
        }

        ReadOutcome::success(samples)
    }
}
