//! Error taxonomy for the streaming pipeline.
//!
//! Each stage has its own error type; [`PlayerError`] is what crosses the public API and
//! the notification sink. Only [`ConversionError`] and [`QueueFull`] are recoverable.

use thiserror::Error;

use crate::buffer::PcmBuffer;
use crate::state::PlaybackState;

/// The parser could not be bound to the requested stream type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatOpenError {
    #[error("unsupported mime type: {0}")]
    UnsupportedMime(String),

    #[error("unrecognized stream header ({len} bytes)")]
    UnrecognizedHeader { len: usize },
}

/// Malformed container data. Fatal for the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("missing RIFF/WAVE magic")]
    BadMagic,

    #[error("malformed {chunk} chunk: {reason}")]
    MalformedChunk {
        chunk: &'static str,
        reason: &'static str,
    },

    #[error("data chunk found before fmt chunk")]
    DataBeforeFormat,

    #[error("invalid stream format: {0}")]
    InvalidFormat(&'static str),

    #[error("no frame sync within {scanned} bytes (offset {offset})")]
    LostSync { offset: u64, scanned: usize },

    #[error("stream ended before its format was known")]
    Truncated,
}

/// The decoder or resampler could not be built for the discovered format.
#[derive(Error, Debug)]
pub enum ConverterInitError {
    #[error("unsupported source format: {0}")]
    Unsupported(String),

    #[error("decoder init failed: {0}")]
    Decoder(#[from] symphonia::core::errors::Error),

    #[error("resampler init failed: {0}")]
    Resampler(String),
}

/// One packet failed to convert. The packet is dropped; the session continues.
#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("packet at offset {offset} failed to decode: {source}")]
    Decode {
        offset: u64,
        #[source]
        source: symphonia::core::errors::Error,
    },

    #[error("packet at offset {offset} decoded to {found} channels, expected {expected}")]
    ChannelMismatch {
        offset: u64,
        found: usize,
        expected: usize,
    },

    #[error("resampler error: {0}")]
    Resample(String),
}

/// Enqueue was refused because the playback buffer is at capacity.
///
/// The rejected buffer is handed back so decoded audio is never lost.
#[derive(Error, Debug)]
#[error("playback buffer full ({capacity} buffers queued)")]
pub struct QueueFull {
    pub buffer: PcmBuffer,
    pub capacity: usize,
}

/// Output device failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("failed to open output stream: {0}")]
    Open(String),

    #[error("failed to start output: {0}")]
    Start(String),

    #[error("failed to pause output: {0}")]
    Pause(String),

    #[error("unsupported device sample format: {0}")]
    UnsupportedFormat(String),

    #[error("output device stopped unexpectedly")]
    StoppedUnexpectedly,
}

/// Errors surfaced by [`crate::Player`] and reported through [`crate::PlayerEvent::Failed`].
#[derive(Error, Debug)]
pub enum PlayerError {
    #[error(transparent)]
    FormatOpen(#[from] FormatOpenError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    ConverterInit(#[from] ConverterInitError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error("{failures} consecutive conversion failures, last: {last}")]
    PersistentConversion {
        failures: u32,
        #[source]
        last: ConversionError,
    },

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("source transfer failed: {0}")]
    Source(String),

    #[error("input already finished for this session")]
    InputFinished,

    #[error("session not started")]
    SessionNotStarted,
}

impl PlayerError {
    /// Whether this error ends the session (state becomes [`PlaybackState::Failed`]).
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PlayerError::Conversion(_) | PlayerError::InputFinished | PlayerError::SessionNotStarted
        )
    }
}

/// Diagnostic context attached to a fatal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureContext {
    /// State the controller was in when the failure arrived.
    pub state: PlaybackState,
    /// Cumulative stream bytes parsed at the time of failure.
    pub byte_offset: u64,
}
