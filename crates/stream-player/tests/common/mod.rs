#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use stream_player::{
    AudioOutput, DeviceError, DeviceFeed, OutputStream, PcmFormat, PlaybackState, Player,
    PlayerConfig, PlayerEvent, Pull,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// RIFF/WAVE bytes with a 16-bit PCM (or arbitrary `format_tag`) fmt chunk.
pub fn wave(format_tag: u16, channels: u16, rate: u32, samples: &[i16]) -> Vec<u8> {
    let block_align = channels * 2;
    let data_len = (samples.len() * 2) as u32;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&format_tag.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&rate.to_le_bytes());
    out.extend_from_slice(&(rate * block_align as u32).to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Deterministic test tone as 16-bit samples.
pub fn ramp(len: usize) -> Vec<i16> {
    (0..len).map(|i| ((i % 200) as i16 - 100) * 100).collect()
}

/// `count` MPEG-1 Layer III frames (128 kbps, 44.1 kHz, stereo) whose bodies are all ones.
/// The headers parse; the side info does not decode.
pub fn mpeg_frames(count: usize) -> Vec<u8> {
    const FRAME_LEN: usize = 417;
    let mut out = Vec::with_capacity(count * FRAME_LEN);
    for _ in 0..count {
        out.extend_from_slice(&[0xFF, 0xFB, 0x90, 0x00]);
        out.extend_from_slice(&[0xFF; FRAME_LEN - 4]);
    }
    out
}

pub fn small_config() -> PlayerConfig {
    PlayerConfig {
        buffer_count: 16,
        buffer_frames: 512,
        prime_buffers: 2,
        wave_packet_frames: 1024,
        ..PlayerConfig::default()
    }
}

#[derive(Debug, Default)]
pub struct CaptureState {
    pub feed: Option<DeviceFeed>,
    pub format: Option<PcmFormat>,
    pub opened: usize,
    pub started: usize,
    pub paused: usize,
    pub fail_open: bool,
}

/// Output driver that lets the test play the device: it exposes the feed so the test can
/// pull buffers and report running state by hand.
#[derive(Clone, Default)]
pub struct CaptureOutput {
    pub state: Arc<Mutex<CaptureState>>,
}

impl CaptureOutput {
    pub fn feed(&self) -> Option<DeviceFeed> {
        self.state.lock().feed.clone()
    }

    /// Pull until the queue reports starved or paused, returning every sample played.
    pub fn drain(&self) -> Vec<f32> {
        let mut out = Vec::new();
        let Some(feed) = self.feed() else {
            return out;
        };
        while let Pull::Ready(buffer) = feed.pull() {
            out.extend_from_slice(buffer.samples());
        }
        out
    }
}

impl AudioOutput for CaptureOutput {
    fn open(
        &mut self,
        format: &PcmFormat,
        feed: DeviceFeed,
    ) -> Result<Box<dyn OutputStream>, DeviceError> {
        let mut state = self.state.lock();
        if state.fail_open {
            return Err(DeviceError::Open("capture device unavailable".to_string()));
        }
        state.feed = Some(feed.clone());
        state.format = Some(*format);
        state.opened += 1;
        Ok(Box::new(CaptureStream {
            state: self.state.clone(),
            feed,
        }))
    }

    fn name(&self) -> String {
        "capture".to_string()
    }
}

struct CaptureStream {
    state: Arc<Mutex<CaptureState>>,
    feed: DeviceFeed,
}

impl OutputStream for CaptureStream {
    fn start(&mut self) -> Result<(), DeviceError> {
        self.state.lock().started += 1;
        self.feed.notify_running(true);
        Ok(())
    }

    fn pause(&mut self) -> Result<(), DeviceError> {
        self.state.lock().paused += 1;
        self.feed.notify_running(false);
        Ok(())
    }
}

pub fn player(config: PlayerConfig) -> (Player, Receiver<PlayerEvent>, CaptureOutput) {
    let output = CaptureOutput::default();
    let (player, events) = Player::new(config, Box::new(output.clone()));
    (player, events, output)
}

/// Poll until the player reaches `state`.
pub fn wait_state(player: &Player, state: PlaybackState) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if player.state() == state {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

/// Receive events until one matches, returning it.
pub fn wait_event(
    events: &Receiver<PlayerEvent>,
    mut matches: impl FnMut(&PlayerEvent) -> bool,
) -> Option<PlayerEvent> {
    let deadline = Instant::now() + WAIT;
    loop {
        let left = deadline.checked_duration_since(Instant::now())?;
        let event = events.recv_timeout(left).ok()?;
        if matches(&event) {
            return Some(event);
        }
    }
}
