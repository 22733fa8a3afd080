//! CPAL implementation of [`AudioOutput`].
//!
//! The data callback:
//! - pulls whole [`PcmBuffer`](crate::buffer::PcmBuffer)s from the device feed, never blocking
//! - applies basic channel mapping (mono↔stereo, best-effort otherwise)
//! - converts `f32` samples to the device sample format
//! - emits silence when paused or starved, counting underruns without logging

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use cpal::traits::{DeviceTrait, StreamTrait};

use crate::buffer::{Pull, PulledBuffer};
use crate::device;
use crate::error::DeviceError;
use crate::format::PcmFormat;
use crate::output::{AudioOutput, DeviceFeed, OutputStream};

/// Counters updated from the device callback.
#[derive(Clone, Debug, Default)]
pub struct OutputCounters {
    pub played_frames: Arc<AtomicU64>,
    /// Frames emitted as silence because nothing was queued.
    pub underrun_frames: Arc<AtomicU64>,
    pub underrun_events: Arc<AtomicU64>,
}

impl OutputCounters {
    pub fn played_frames(&self) -> u64 {
        self.played_frames.load(Ordering::Relaxed)
    }

    pub fn underrun_frames(&self) -> u64 {
        self.underrun_frames.load(Ordering::Relaxed)
    }

    pub fn underrun_events(&self) -> u64 {
        self.underrun_events.load(Ordering::Relaxed)
    }
}

pub struct CpalOutput {
    device: cpal::Device,
    config: cpal::SupportedStreamConfig,
    counters: OutputCounters,
}

impl CpalOutput {
    pub fn new(device: cpal::Device, config: cpal::SupportedStreamConfig) -> Self {
        Self {
            device,
            config,
            counters: OutputCounters::default(),
        }
    }

    /// Open the named (or default) device on the default host.
    pub fn select(needle: Option<&str>, target_rate: Option<u32>) -> Result<Self> {
        let host = cpal::default_host();
        let (device, config) = device::select_output(&host, needle, target_rate)?;
        Ok(Self::new(device, config))
    }

    /// Device sample rate; use it as the converter's output rate to avoid device-side resampling.
    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate()
    }

    pub fn counters(&self) -> OutputCounters {
        self.counters.clone()
    }
}

impl AudioOutput for CpalOutput {
    fn open(
        &mut self,
        format: &PcmFormat,
        feed: DeviceFeed,
    ) -> Result<Box<dyn OutputStream>, DeviceError> {
        let mut stream_config: cpal::StreamConfig = self.config.config();
        if stream_config.sample_rate != format.sample_rate {
            tracing::warn!(
                device_hz = stream_config.sample_rate,
                stream_hz = format.sample_rate,
                "requesting stream rate different from the device config"
            );
            stream_config.sample_rate = format.sample_rate;
        }
        if let Some(size) = device::pick_buffer_size(&self.config) {
            stream_config.buffer_size = size;
        }

        let stream = build_output_stream(
            &self.device,
            &stream_config,
            self.config.sample_format(),
            feed.clone(),
            self.counters.clone(),
        )?;
        tracing::info!(
            device = %self.name(),
            rate_hz = stream_config.sample_rate,
            device_channels = stream_config.channels,
            stream_channels = format.channels,
            sample_format = ?self.config.sample_format(),
            "output stream opened"
        );
        Ok(Box::new(CpalStream { stream, feed }))
    }

    fn name(&self) -> String {
        self.device
            .description()
            .map(|d| d.to_string())
            .unwrap_or_else(|_| "unknown device".to_string())
    }
}

struct CpalStream {
    stream: cpal::Stream,
    feed: DeviceFeed,
}

impl OutputStream for CpalStream {
    fn start(&mut self) -> Result<(), DeviceError> {
        self.stream
            .play()
            .map_err(|e| DeviceError::Start(e.to_string()))?;
        self.feed.notify_running(true);
        Ok(())
    }

    fn pause(&mut self) -> Result<(), DeviceError> {
        self.stream
            .pause()
            .map_err(|e| DeviceError::Pause(e.to_string()))?;
        self.feed.notify_running(false);
        Ok(())
    }
}

fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    feed: DeviceFeed,
    counters: OutputCounters,
) -> Result<cpal::Stream, DeviceError> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, feed, counters),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, feed, counters),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, feed, counters),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, feed, counters),
        other => Err(DeviceError::UnsupportedFormat(format!("{other:?}"))),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    feed: DeviceFeed,
    counters: OutputCounters,
) -> Result<cpal::Stream, DeviceError>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let channels_out = (config.channels as usize).max(1);
    let mut cursor = Cursor {
        current: None,
        pos: 0,
        src_channels: feed.channels(),
    };

    let feed_err = feed.clone();
    let err_fn = move |err: cpal::StreamError| {
        tracing::warn!("stream error: {err}");
        feed_err.notify_running(false);
    };

    let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                if feed.is_paused() {
                    data.fill(silence);
                    return;
                }

                let frames = data.len() / channels_out;
                let mut filled = 0usize;
                while filled < frames {
                    if cursor.exhausted() {
                        cursor.current = None;
                        cursor.pos = 0;
                        match feed.pull() {
                            Pull::Ready(buffer) => {
                                cursor.current = Some(buffer);
                                continue;
                            }
                            Pull::Starved => {
                                let missing = frames - filled;
                                counters.underrun_events.fetch_add(1, Ordering::Relaxed);
                                counters
                                    .underrun_frames
                                    .fetch_add(missing as u64, Ordering::Relaxed);
                                data[filled * channels_out..].fill(silence);
                                break;
                            }
                            Pull::Paused => {
                                data[filled * channels_out..].fill(silence);
                                break;
                            }
                        }
                    }
                    let frame = &mut data[filled * channels_out..(filled + 1) * channels_out];
                    for (ch, out) in frame.iter_mut().enumerate() {
                        *out = <T as cpal::Sample>::from_sample::<f32>(cursor.sample(
                            channels_out,
                            ch,
                        ));
                    }
                    cursor.pos += cursor.src_channels;
                    filled += 1;
                }

                if filled > 0 {
                    counters
                        .played_frames
                        .fetch_add(filled as u64, Ordering::Relaxed);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| DeviceError::Open(e.to_string()))
}

/// Read position inside the buffer currently on loan to the device.
struct Cursor {
    current: Option<PulledBuffer>,
    pos: usize,
    src_channels: usize,
}

impl Cursor {
    fn exhausted(&self) -> bool {
        self.current
            .as_ref()
            .is_none_or(|buffer| self.pos >= buffer.samples().len())
    }

    /// Sample for output channel `dst_ch` of the current frame.
    ///
    /// Mapping: mono → any duplicates channel 0, stereo → mono averages L/R, other layouts
    /// clamp to the available channels.
    fn sample(&self, dst_channels: usize, dst_ch: usize) -> f32 {
        let Some(buffer) = self.current.as_ref() else {
            return 0.0;
        };
        let samples = buffer.samples();
        let get = |ch: usize| samples.get(self.pos + ch).copied().unwrap_or(0.0);
        match (self.src_channels, dst_channels) {
            (2, 1) => 0.5 * (get(0) + get(1)),
            (1, _) => get(0),
            (src, _) => get(dst_ch.min(src.saturating_sub(1))),
        }
    }
}
