//! streamplay: feed a file or HTTP download into the streaming player chunk by chunk and
//! play it on a CPAL device.
//!
//! Delivery runs on its own thread and only ever calls `feed`; the main thread watches
//! player events and prints periodic buffer stats until the input has drained.

mod cli;
mod input;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use stream_player::{
    ChunkSink, CpalOutput, OutputCounters, PlaybackState, Player, PlayerError, PlayerEvent,
    StreamInfo, deliver_from_reader, device,
};
use tracing_subscriber::EnvFilter;

const STATS_INTERVAL: Duration = Duration::from_secs(2);
const EVENT_POLL: Duration = Duration::from_millis(100);

/// Player sink that requests playback as soon as the session is open. The request stays
/// pending until enough audio is queued.
struct PlayWhenReady {
    player: Player,
}

impl ChunkSink for PlayWhenReady {
    fn on_format_info(&mut self, info: &StreamInfo) -> Result<(), PlayerError> {
        self.player.on_format_info(info)?;
        self.player.play()
    }

    fn on_chunk(&mut self, chunk: &[u8]) -> Result<(), PlayerError> {
        self.player.on_chunk(chunk)
    }

    fn on_error(&mut self, cause: &str) {
        self.player.on_error(cause);
    }

    fn on_complete(&mut self) -> Result<(), PlayerError> {
        self.player.on_complete()
    }

    fn backlogged(&self) -> bool {
        self.player.is_backlogged()
    }
}

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,stream_player=info,streamplay=info")
        }))
        .init();

    if args.list_devices {
        device::list_devices(&cpal::default_host())?;
        return Ok(());
    }

    match &args.cmd {
        Some(cli::Command::Play { input, mime }) => play(&args, input, mime.clone()),
        None => Err(anyhow!("nothing to do; try `streamplay play <path|url>`")),
    }
}

fn play(args: &cli::Args, input: &str, mime: Option<String>) -> Result<()> {
    let output = CpalOutput::select(args.device.as_deref(), args.output_rate)?;
    let counters = output.counters();
    let config = args.player_config(output.sample_rate());
    tracing::info!(
        buffers = config.buffer_count,
        buffer_frames = config.buffer_frames,
        prime_buffers = config.prime_buffers,
        output_rate_hz = ?config.output_sample_rate,
        "player config"
    );
    let (player, events) = Player::new(config, Box::new(output));

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        let player = player.clone();
        let _ = ctrlc::set_handler(move || {
            cancel.store(true, Ordering::Relaxed);
            player.stop();
        });
    }

    let source = input::open(input, mime)?;
    let chunk_bytes = args.chunk_bytes;
    let delivery = {
        let cancel = cancel.clone();
        let mut sink = PlayWhenReady {
            player: player.clone(),
        };
        std::thread::Builder::new()
            .name("delivery".to_string())
            .spawn(move || {
                deliver_from_reader(source.reader, &source.info, chunk_bytes, &mut sink, &cancel)
            })?
    };

    let result = watch(&player, &events, &counters, &cancel);
    cancel.store(true, Ordering::Relaxed);
    player.stop();
    match delivery.join() {
        Ok(Ok(bytes)) => tracing::debug!(bytes, "delivery finished"),
        Ok(Err(e)) => tracing::debug!(error = %e, "delivery ended with error"),
        Err(_) => tracing::warn!("delivery thread panicked"),
    }
    result
}

/// Follow player events until playback drains, fails, or is interrupted.
fn watch(
    player: &Player,
    events: &crossbeam_channel::Receiver<PlayerEvent>,
    counters: &OutputCounters,
    cancel: &AtomicBool,
) -> Result<()> {
    let mut drained = false;
    let mut last_stats = Instant::now();
    loop {
        if cancel.load(Ordering::Relaxed) {
            tracing::info!("interrupted");
            return Ok(());
        }
        match events.recv_timeout(EVENT_POLL) {
            Ok(PlayerEvent::StateChanged { from, to }) => {
                tracing::debug!(%from, %to, "state");
            }
            Ok(PlayerEvent::FormatReady { source, output }) => {
                tracing::info!(
                    codec = source.codec_name(),
                    source_rate_hz = source.sample_rate,
                    source_channels = source.channels,
                    output_rate_hz = output.sample_rate,
                    output_channels = output.channels,
                    "playing"
                );
            }
            Ok(PlayerEvent::InputDrained) => drained = true,
            Ok(PlayerEvent::Failed { error, context }) => {
                return Err(anyhow!(
                    "playback failed in state {} at byte {}: {error}",
                    context.state,
                    context.byte_offset
                ));
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }

        let stats = player.stats();
        if last_stats.elapsed() >= STATS_INTERVAL {
            last_stats = Instant::now();
            tracing::info!(
                state = %stats.state,
                bytes = stats.bytes_parsed,
                pending_packets = stats.pending_packets,
                buffered_ms = stats.buffered_ms(),
                played_frames = counters.played_frames(),
                underrun_events = counters.underrun_events(),
                "stats"
            );
        }
        if drained && stats.buffered == 0 && stats.state == PlaybackState::Playing {
            // Let the device play out the buffer it is holding.
            std::thread::sleep(Duration::from_millis(200));
            tracing::info!(
                played_frames = counters.played_frames(),
                underrun_frames = counters.underrun_frames(),
                "playback complete"
            );
            return Ok(());
        }
    }
}
