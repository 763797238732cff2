//! Error types for sessions, reads and configuration.
//!
//! Errors are split by where they surface:
//!
//! - **`ReadError`**: returned by every consumer `read`. Most variants are
//!   per-call outcomes rather than failures of the session: `NoDataAvailable`
//!   is transient, and `DeviceError` is scoped to the one buffer whose fill
//!   failed. The channel keeps acquiring after either.
//! - **`SessionError`**: returned by `Session::open` and
//!   `Session::close_timeout`. An `open` failure leaves nothing running.
//! - **`ConfigError`**: configuration loading and validation.

use std::time::Duration;

use thiserror::Error;

use crate::channel::ChannelId;

/// Outcome of a consumer read that did not produce data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// The id does not name a channel of this session, or the session has
    /// been closed.
    ///
    /// **Error Type**: Caller error, not retryable without fixing the id.
    #[error("Unknown channel {0}")]
    UnknownChannel(ChannelId),

    /// No filled buffer is waiting on this channel.
    ///
    /// **Error Type**: Transient. Poll again later.
    #[error("No data available")]
    NoDataAvailable,

    /// The destination is smaller than the channel's buffer.
    ///
    /// Whether the dequeued buffer is recycled or removed from the pool is
    /// decided by the session's `SizingErrorPolicy`.
    #[error("Destination too small: {capacity} bytes, need {required}")]
    InsufficientBuffer {
        /// Bytes needed to hold one block.
        required: usize,
        /// Bytes offered by the caller.
        capacity: usize,
    },

    /// The acquisition that filled this buffer failed with a driver status
    /// code. The destination was not modified.
    ///
    /// **Error Type**: Scoped to this buffer. The next acquisition proceeds
    /// normally.
    #[error("Device error (status {0})")]
    DeviceError(i32),
}

impl ReadError {
    /// Whether polling again may succeed without any caller change.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NoDataAvailable)
    }
}

/// Failures creating or shutting down a session.
#[derive(Error, Debug)]
pub enum SessionError {
    /// A channel descriptor failed validation.
    #[error("Invalid channel {id}: {reason}")]
    InvalidChannel {
        /// Offending channel.
        id: ChannelId,
        /// What was wrong with it.
        reason: String,
    },

    /// Two descriptors share the same id.
    #[error("Duplicate channel id {0}")]
    DuplicateChannel(ChannelId),

    /// `open` was called with an empty channel list.
    #[error("Session needs at least one channel")]
    NoChannels,

    /// The poller thread could not be started.
    #[error("Failed to start poller thread: {0}")]
    PollerSpawn(#[source] std::io::Error),

    /// The poller did not finish within the close timeout.
    #[error("Poller did not stop within {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Load(#[from] Box<figment::Error>),

    /// Values parsed but are semantically invalid.
    #[error("Configuration validation error: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load(Box::new(err))
    }
}

impl From<SessionError> for ConfigError {
    fn from(err: SessionError) -> Self {
        Self::Invalid(err.to_string())
    }
}
