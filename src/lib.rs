//! # daq-loop
//!
//! Continuous multi-channel acquisition buffering. A session owns a fixed
//! pool of five buffers per channel and one background poller thread that
//! keeps filling them from an [`AcquisitionDevice`]. Consumers take filled
//! blocks with [`Session::read`] and the buffers go straight back into the
//! pool.
//!
//! ## Crate Structure
//!
//! - **`channel`**: channel ids, kinds, descriptors and the
//!   [`AcquisitionChannel`] capability that picks the device entry point.
//! - **`device`**: the [`AcquisitionDevice`] boundary and sample codecs.
//! - **`poller`**: the background fill loop, [`StopToken`] and [`Completion`].
//! - **`session`**: open, read and close.
//! - **`consumer`**: [`ReadLoop`], a round-robin reader feeding a
//!   [`SampleSink`] line by line.
//! - **`simulated`**: [`SimulatedDevice`], a hardware stand-in.
//! - **`config`**: figment-based configuration.
//! - **`logging`**: tracing-subscriber setup.
//! - **`error`**: error types.
//!
//! Buffers and their queues live in the `daq-pool` crate.

pub mod channel;
pub mod config;
pub mod consumer;
pub mod device;
pub mod error;
pub mod logging;
pub mod poller;
pub mod session;
pub mod simulated;

pub use channel::{
    AcquisitionChannel, AnalogChannel, ChannelDescriptor, ChannelId, ChannelKind, ChannelStats,
    DigitalChannel,
};
pub use consumer::{BlockView, LoopError, LoopSummary, ReadLoop, SampleSink};
pub use daq_pool::{DrainReport, MemoryLedger, Occupancy, POOL_SIZE};
pub use device::{AcquisitionDevice, ReadOutcome, ReadRequest};
pub use error::{ConfigError, ReadError, SessionError};
pub use poller::{Completion, PollerSummary, StopToken};
pub use session::{
    ChannelCloseReport, CloseReport, Session, SessionOptions, SessionReader, SizingErrorPolicy,
};
pub use simulated::{SimulatedDevice, SimulationConfig};
