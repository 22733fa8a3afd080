use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::buffer::PlaybackBuffer;
use crate::controller::worker::BackpressureCounter;
use crate::format::{PcmFormat, StreamFormat};
use crate::state::PlaybackState;

/// Per-session counters shared by the delivery path, the decode worker and the control thread.
#[derive(Debug, Default)]
pub(crate) struct SessionCounters {
    pub(crate) bytes_parsed: AtomicU64,
    pub(crate) packets_parsed: AtomicU64,
    pub(crate) conversion_failures: AtomicU64,
    /// Packets handed to the worker but not yet pulled by the converter.
    pub(crate) pending: BackpressureCounter,
    pub(crate) source_format: OnceLock<StreamFormat>,
    pub(crate) buffer: OnceLock<PlaybackBuffer>,
}

impl SessionCounters {
    pub(crate) fn bytes_parsed(&self) -> u64 {
        self.bytes_parsed.load(Ordering::Relaxed)
    }

    pub(crate) fn snapshot(&self, state: PlaybackState) -> PlayerStats {
        let buffer = self.buffer.get();
        PlayerStats {
            state,
            bytes_parsed: self.bytes_parsed(),
            packets_parsed: self.packets_parsed.load(Ordering::Relaxed),
            pending_packets: self.pending.get(),
            buffers_enqueued: buffer.map(PlaybackBuffer::enqueued).unwrap_or(0),
            buffered: buffer.map(PlaybackBuffer::len).unwrap_or(0),
            queued_frames: buffer.map(PlaybackBuffer::queued_frames).unwrap_or(0),
            buffer_capacity: buffer.map(PlaybackBuffer::capacity).unwrap_or(0),
            buffer_frames: buffer.map(PlaybackBuffer::buffer_frames).unwrap_or(0),
            starved: buffer.map(PlaybackBuffer::starved).unwrap_or(0),
            conversion_failures: self.conversion_failures.load(Ordering::Relaxed),
            source_format: self.source_format.get().cloned(),
            output_format: buffer.map(PlaybackBuffer::format),
        }
    }
}

/// Point-in-time view of a player session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlayerStats {
    pub state: PlaybackState,
    /// Cumulative stream bytes consumed by the parser.
    pub bytes_parsed: u64,
    pub packets_parsed: u64,
    /// Packets waiting for conversion (backpressure).
    pub pending_packets: usize,
    pub buffers_enqueued: u64,
    /// Buffers queued for the device.
    pub buffered: usize,
    /// Valid frames across the queued buffers.
    pub queued_frames: usize,
    pub buffer_capacity: usize,
    pub buffer_frames: usize,
    /// Device pulls that found nothing queued while playing.
    pub starved: u64,
    pub conversion_failures: u64,
    pub source_format: Option<StreamFormat>,
    pub output_format: Option<PcmFormat>,
}

impl PlayerStats {
    /// Queued audio in milliseconds.
    pub fn buffered_ms(&self) -> u64 {
        self.output_format
            .map(|f| f.frames_to_ms(self.queued_frames as u64))
            .unwrap_or(0)
    }
}
