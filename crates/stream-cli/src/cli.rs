//! Command-line interface definitions.

use clap::{Parser, Subcommand};
use stream_player::PlayerConfig;

#[derive(Parser, Debug)]
#[command(name = "streamplay", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long, global = true)]
    pub device: Option<String>,

    /// Bytes handed to the player per delivery callback
    #[arg(long, global = true, default_value_t = 4096)]
    pub chunk_bytes: usize,

    /// Frames per playback buffer (higher => more latency, fewer device wakeups)
    #[arg(long, global = true, default_value_t = 4096)]
    pub buffer_frames: usize,

    /// Playback buffers in the pool
    #[arg(long, global = true, default_value_t = 8)]
    pub buffers: usize,

    /// Buffers queued before playback may start
    #[arg(long, global = true, default_value_t = 2)]
    pub prime_buffers: usize,

    /// Output sample rate; defaults to the device rate
    #[arg(long, global = true)]
    pub output_rate: Option<u32>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stream a local file or an http(s) URL into the player
    Play {
        /// Path or URL
        input: String,

        /// Override the MIME type reported by the source (e.g. audio/wav)
        #[arg(long)]
        mime: Option<String>,
    },
}

impl Args {
    /// Player tuning derived from the command line; `device_rate` is used when no output
    /// rate was requested.
    pub fn player_config(&self, device_rate: u32) -> PlayerConfig {
        PlayerConfig {
            buffer_count: self.buffers.max(1),
            buffer_frames: self.buffer_frames.max(1),
            prime_buffers: self.prime_buffers.max(1),
            output_sample_rate: Some(self.output_rate.unwrap_or(device_rate)),
            ..PlayerConfig::default()
        }
    }
}
