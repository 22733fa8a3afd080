//! Streaming audio playback core.
//!
//! Bytes arrive in arbitrary chunks through [`Player::feed`]. The [`StreamParser`] cuts them
//! into compressed packets, the [`FormatConverter`] decodes them on a worker thread into
//! pooled [`PcmBuffer`]s, and an [`AudioOutput`] pulls those from the [`PlaybackBuffer`] on
//! its own clock. [`Player`] sequences all of it through [`PlaybackState`].

pub mod buffer;
pub mod config;
pub mod controller;
pub mod convert;
pub mod cpal_output;
pub mod device;
pub mod error;
pub mod format;
pub mod output;
pub mod parser;
pub mod resample;
pub mod source;
pub mod state;
pub mod status;

pub use buffer::{BufferConsumer, PcmBuffer, PlaybackBuffer, Pull, PulledBuffer};
pub use config::PlayerConfig;
pub use controller::{FeedReport, Player, PlayerEvent};
pub use convert::{FormatConverter, PacketSource};
pub use cpal_output::{CpalOutput, OutputCounters};
pub use error::{
    ConversionError, ConverterInitError, DeviceError, FailureContext, FormatOpenError,
    ParseError, PlayerError, QueueFull,
};
pub use format::{Codec, ContainerKind, FormatHint, PcmFormat, StreamFormat};
pub use output::{AudioOutput, DeviceFeed, OutputStream};
pub use parser::{CompressedPacket, PacketDescription, ParserEvents, StreamParser};
pub use source::{ChunkSink, StreamInfo, deliver_from_reader};
pub use state::PlaybackState;
pub use status::PlayerStats;
