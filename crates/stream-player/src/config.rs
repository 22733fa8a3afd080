/// Pipeline tuning parameters shared by the parser, converter, buffer and controller.
#[derive(Clone, Debug)]
pub struct PlayerConfig {
    /// Number of pooled PCM buffers (also the playback queue capacity).
    pub buffer_count: usize,
    /// Capacity of each PCM buffer in frames.
    pub buffer_frames: usize,
    /// Buffers that must be queued before the stream counts as primed.
    ///
    /// The decode worker also flushes partially filled buffers while the queue holds
    /// fewer than this many, so a slow network does not starve the device.
    pub prime_buffers: usize,
    /// Frames per packet when packetizing WAVE PCM data.
    pub wave_packet_frames: u32,
    /// Output sample rate. `None` keeps the source rate (no resampling).
    pub output_sample_rate: Option<u32>,
    /// Resampler input chunk size in frames.
    pub resample_chunk_frames: usize,
    /// Consecutive packet conversion failures tolerated before the session fails.
    pub max_consecutive_failures: u32,
    /// Bytes the MPEG parser may scan for a frame sync before giving up.
    pub max_resync_bytes: usize,
    /// Parsed packets allowed to wait for the decoder before byte delivery holds off.
    /// See [`Player::is_backlogged`](crate::Player::is_backlogged).
    pub max_pending_packets: usize,
}

impl Default for PlayerConfig {
    /// Defaults sized for roughly 0.75 s of queued audio at 44.1 kHz.
    fn default() -> Self {
        Self {
            buffer_count: 8,
            buffer_frames: 4096,
            prime_buffers: 2,
            wave_packet_frames: 1024,
            output_sample_rate: None,
            resample_chunk_frames: 1024,
            max_consecutive_failures: 8,
            max_resync_bytes: 64 * 1024,
            max_pending_packets: 256,
        }
    }
}

impl PlayerConfig {
    pub(crate) fn parser(&self) -> ParserConfig {
        ParserConfig {
            wave_packet_frames: self.wave_packet_frames.max(1),
            max_resync_bytes: self.max_resync_bytes.max(1),
        }
    }

    pub(crate) fn converter(&self) -> ConverterConfig {
        ConverterConfig {
            output_sample_rate: self.output_sample_rate,
            resample_chunk_frames: self.resample_chunk_frames.max(1),
        }
    }
}

/// Parser knobs derived from [`PlayerConfig`].
#[derive(Clone, Copy, Debug)]
pub struct ParserConfig {
    pub wave_packet_frames: u32,
    pub max_resync_bytes: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        PlayerConfig::default().parser()
    }
}

/// Converter knobs derived from [`PlayerConfig`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ConverterConfig {
    pub output_sample_rate: Option<u32>,
    pub resample_chunk_frames: usize,
}
