//! Playback controller.
//!
//! [`Player`] is the caller surface. It owns three contexts:
//! - the delivery path (`feed`/`finish`, on the caller's thread) which runs the parser
//! - one decode worker per session which runs the converter and fills the playback buffer
//! - one control thread per player which owns the state machine and the output stream
//!
//! All state transitions happen on the control thread. Messages carry a session id so
//! anything still in flight from a torn-down session is ignored.

pub(crate) mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::buffer::PlaybackBuffer;
use crate::config::PlayerConfig;
use crate::error::{DeviceError, FailureContext, PlayerError};
use crate::format::{FormatHint, PcmFormat, StreamFormat};
use crate::output::{AudioOutput, DeviceFeed, OutputStream};
use crate::parser::{CompressedPacket, ParserEvents, StreamParser};
use crate::state::PlaybackState;
use crate::status::{PlayerStats, SessionCounters};
use worker::{DecodeJob, DecodeWorker};

/// Capacity of the control queue. Sending on a full bounded queue never allocates, so
/// `stop()` stays usable from a device callback.
const CONTROL_QUEUE: usize = 256;

/// Notifications published by the player.
#[derive(Debug)]
pub enum PlayerEvent {
    StateChanged {
        from: PlaybackState,
        to: PlaybackState,
    },
    /// The stream format is known and the converter and output are configured.
    FormatReady {
        source: StreamFormat,
        output: PcmFormat,
    },
    /// End of input was signalled and every decoded frame has been queued.
    InputDrained,
    /// A fatal error ended the session. Reported once per session.
    Failed {
        error: PlayerError,
        context: FailureContext,
    },
}

/// Outcome of one `feed` call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeedReport {
    /// Packets completed by this call.
    pub packets: usize,
    /// Cumulative stream bytes parsed.
    pub bytes_parsed: u64,
    /// Packets waiting for conversion after this call.
    pub pending_packets: usize,
}

/// Messages processed by the control thread.
pub(crate) enum ControlMsg {
    Opened {
        session: u64,
        cancel: Arc<AtomicBool>,
        counters: Arc<SessionCounters>,
    },
    FormatReady {
        session: u64,
        source: StreamFormat,
        buffer: PlaybackBuffer,
    },
    BufferQueued {
        session: u64,
    },
    Drained {
        session: u64,
    },
    DeviceRunning {
        session: u64,
        running: bool,
    },
    Fatal {
        session: u64,
        error: PlayerError,
    },
    Play {
        session: u64,
    },
    Stop,
    Shutdown,
}

/// State shared between the caller surface and the control thread.
struct Shared {
    state: Mutex<PlaybackState>,
    /// Id of the session the control thread considers alive; 0 once it has failed.
    live_session: AtomicU64,
    /// Output gate shared with every session's playback buffer.
    gate: Arc<AtomicBool>,
    /// Set by `stop()` when the control queue is full; handled after the next message.
    stop_requested: AtomicBool,
    counters: Mutex<Arc<SessionCounters>>,
}

/// Delivery-side half of a session.
struct Session {
    id: u64,
    parser: StreamParser,
    jobs: Sender<DecodeJob>,
    counters: Arc<SessionCounters>,
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    finished: bool,
}

impl Session {
    fn teardown(mut self) {
        self.cancel.store(true, Ordering::Release);
        let _ = self.jobs.send(DecodeJob::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        tracing::debug!(session = self.id, "session torn down");
    }
}

/// Parser notifications routed to the decode worker.
struct SessionEvents<'a> {
    jobs: &'a Sender<DecodeJob>,
    counters: &'a SessionCounters,
    packets: usize,
}

impl ParserEvents for SessionEvents<'_> {
    fn format_ready(&mut self, format: &StreamFormat) {
        tracing::info!(
            codec = format.codec_name(),
            rate_hz = format.sample_rate,
            channels = format.channels,
            data_offset = format.data_offset,
            "stream format discovered"
        );
        let _ = self.counters.source_format.set(format.clone());
        let _ = self.jobs.send(DecodeJob::Configure(format.clone()));
    }

    fn packets_ready(&mut self, packets: Vec<CompressedPacket>, bytes_parsed: u64) {
        self.packets += packets.len();
        self.counters.pending.add(packets.len());
        self.counters
            .packets_parsed
            .fetch_add(packets.len() as u64, Ordering::Relaxed);
        self.counters
            .bytes_parsed
            .store(bytes_parsed, Ordering::Relaxed);
        for packet in packets {
            let _ = self.jobs.send(DecodeJob::Packet(packet));
        }
    }
}

struct PlayerInner {
    config: PlayerConfig,
    shared: Arc<Shared>,
    control: Sender<ControlMsg>,
    session: Mutex<Option<Session>>,
    next_session: AtomicU64,
    control_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for PlayerInner {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.teardown();
        }
        let _ = self.control.send(ControlMsg::Shutdown);
        if let Some(handle) = self.control_thread.get_mut().take() {
            let _ = handle.join();
        }
    }
}

/// Streaming player: feed it bytes, it plays them.
///
/// Cheap to clone; every clone drives the same player. `stop()` may be called from any
/// context, including an output device callback.
#[derive(Clone)]
pub struct Player {
    inner: Arc<PlayerInner>,
}

impl Player {
    /// Create a player that plays through `output`, plus its notification sink.
    pub fn new(
        config: PlayerConfig,
        output: Box<dyn AudioOutput>,
    ) -> (Self, Receiver<PlayerEvent>) {
        let (control_tx, control_rx) = crossbeam_channel::bounded(CONTROL_QUEUE);
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            state: Mutex::new(PlaybackState::Initial),
            live_session: AtomicU64::new(0),
            gate: Arc::new(AtomicBool::new(false)),
            stop_requested: AtomicBool::new(false),
            counters: Mutex::new(Arc::new(SessionCounters::default())),
        });

        let control_shared = shared.clone();
        let notify_tx = control_tx.clone();
        // Output streams may be tied to their thread, so the control state is built there.
        let handle = std::thread::Builder::new()
            .name("player-control".to_string())
            .spawn(move || {
                let control = Control {
                    shared: control_shared,
                    events: events_tx,
                    output,
                    control_tx: notify_tx,
                    session: None,
                };
                control.run(control_rx)
            })
            .ok();
        if handle.is_none() {
            tracing::error!("failed to spawn player control thread");
        }

        let player = Self {
            inner: Arc::new(PlayerInner {
                config,
                shared,
                control: control_tx,
                session: Mutex::new(None),
                next_session: AtomicU64::new(0),
                control_thread: Mutex::new(handle),
            }),
        };
        (player, events_rx)
    }

    /// Start a new session, tearing down any current one.
    pub fn open(&self, hint: FormatHint) -> Result<(), PlayerError> {
        let inner = &self.inner;
        let id = inner.next_session.fetch_add(1, Ordering::AcqRel) + 1;
        let mut guard = inner.session.lock();
        if let Some(old) = guard.take() {
            old.teardown();
        }

        inner.shared.gate.store(false, Ordering::Release);
        inner.shared.live_session.store(id, Ordering::Release);
        let counters = Arc::new(SessionCounters::default());
        *inner.shared.counters.lock() = counters.clone();
        let cancel = Arc::new(AtomicBool::new(false));
        let _ = inner.control.send(ControlMsg::Opened {
            session: id,
            cancel: cancel.clone(),
            counters: counters.clone(),
        });

        let parser = match StreamParser::open(&hint, &inner.config.parser()) {
            Ok(parser) => parser,
            Err(e) => {
                tracing::warn!(session = id, error = %e, ?hint, "failed to open stream parser");
                let _ = inner.control.send(ControlMsg::Fatal {
                    session: id,
                    error: PlayerError::FormatOpen(e.clone()),
                });
                return Err(e.into());
            }
        };

        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded();
        let worker = {
            let config = inner.config.clone();
            let counters = counters.clone();
            let control = inner.control.clone();
            let cancel = cancel.clone();
            let gate = inner.shared.gate.clone();
            // The converter is built on the worker thread and never leaves it.
            std::thread::Builder::new()
                .name(format!("decode-{id}"))
                .spawn(move || {
                    DecodeWorker::new(id, config, jobs_rx, counters, control, cancel, gate).run()
                })
                .map_err(|e| PlayerError::Source(format!("failed to spawn decode worker: {e}")))?
        };

        tracing::info!(session = id, container = ?parser.container(), "session opened");
        *guard = Some(Session {
            id,
            parser,
            jobs: jobs_tx,
            counters,
            cancel,
            worker: Some(worker),
            finished: false,
        });
        Ok(())
    }

    /// Parse a chunk of stream bytes and hand complete packets to the decode worker.
    ///
    /// Never blocks on the output device.
    pub fn feed(&self, chunk: &[u8], discontinuity: bool) -> Result<FeedReport, PlayerError> {
        let mut guard = self.inner.session.lock();
        let session = self.live_session(&mut guard)?;
        if session.finished {
            return Err(PlayerError::InputFinished);
        }
        if discontinuity {
            let _ = session.jobs.send(DecodeJob::Discontinuity);
        }

        let mut events = SessionEvents {
            jobs: &session.jobs,
            counters: &session.counters,
            packets: 0,
        };
        if let Err(e) = session.parser.feed(chunk, discontinuity, &mut events) {
            let packets = events.packets;
            let bytes = session.parser.bytes_parsed();
            tracing::warn!(session = session.id, packets, bytes, error = %e, "stream parse failed");
            session.counters.bytes_parsed.store(bytes, Ordering::Relaxed);
            self.fail_session(&mut guard, PlayerError::Parse(e.clone()));
            return Err(e.into());
        }
        let packets = events.packets;
        Ok(FeedReport {
            packets,
            bytes_parsed: session.parser.bytes_parsed(),
            pending_packets: session.counters.pending.get(),
        })
    }

    /// Signal end of input. Remaining data is flushed and playback primes with whatever is
    /// queued, so short clips still start.
    pub fn finish(&self) -> Result<(), PlayerError> {
        let mut guard = self.inner.session.lock();
        let session = self.live_session(&mut guard)?;
        if session.finished {
            return Ok(());
        }
        session.finished = true;

        let mut events = SessionEvents {
            jobs: &session.jobs,
            counters: &session.counters,
            packets: 0,
        };
        if let Err(e) = session.parser.finish(&mut events) {
            tracing::warn!(session = session.id, error = %e, "stream ended badly");
            session
                .counters
                .bytes_parsed
                .store(session.parser.bytes_parsed(), Ordering::Relaxed);
            self.fail_session(&mut guard, PlayerError::Parse(e.clone()));
            return Err(e.into());
        }
        let _ = session.jobs.send(DecodeJob::Flush);
        tracing::debug!(
            session = session.id,
            bytes = session.parser.bytes_parsed(),
            packets = session.parser.packets_emitted(),
            "input finished"
        );
        Ok(())
    }

    /// Start playback, or remember the request until enough audio is queued.
    pub fn play(&self) -> Result<(), PlayerError> {
        let mut guard = self.inner.session.lock();
        let id = self.live_session(&mut guard)?.id;
        let _ = self.inner.control.send(ControlMsg::Play { session: id });
        Ok(())
    }

    /// Pause output, keeping decoded audio. Safe from any context, including inside a
    /// device pull: the output gate closes immediately and the state change follows on the
    /// control thread. Never blocks or allocates.
    pub fn stop(&self) {
        let shared = &self.inner.shared;
        shared.gate.store(false, Ordering::Release);
        if let Err(TrySendError::Full(_)) = self.inner.control.try_send(ControlMsg::Stop) {
            shared.stop_requested.store(true, Ordering::Release);
        }
    }

    /// Whether delivery should hold off: more packets are waiting for the decoder than
    /// `max_pending_packets`. `feed` itself never waits; byte sources poll this instead.
    pub fn is_backlogged(&self) -> bool {
        let pending = self.inner.shared.counters.lock().pending.get();
        pending >= self.inner.config.max_pending_packets.max(1)
    }

    /// Report a transfer failure from the byte source. Fatal for the session.
    pub fn fail_source(&self, cause: impl Into<String>) {
        let cause = cause.into();
        tracing::warn!(cause = %cause, "source transfer failed");
        let mut guard = self.inner.session.lock();
        if guard.is_some() {
            self.fail_session(&mut guard, PlayerError::Source(cause));
        }
    }

    pub fn state(&self) -> PlaybackState {
        *self.inner.shared.state.lock()
    }

    pub fn stats(&self) -> PlayerStats {
        let counters = self.inner.shared.counters.lock().clone();
        counters.snapshot(self.state())
    }

    /// The current session, or `SessionNotStarted` (tearing down one that has failed).
    fn live_session<'a>(
        &self,
        guard: &'a mut Option<Session>,
    ) -> Result<&'a mut Session, PlayerError> {
        let live = self.inner.shared.live_session.load(Ordering::Acquire);
        if guard.as_ref().is_some_and(|s| s.id != live) {
            if let Some(stale) = guard.take() {
                stale.teardown();
            }
        }
        guard.as_mut().ok_or(PlayerError::SessionNotStarted)
    }

    fn fail_session(&self, guard: &mut Option<Session>, error: PlayerError) {
        if let Some(session) = guard.take() {
            let _ = self.inner.control.send(ControlMsg::Fatal {
                session: session.id,
                error,
            });
            session.teardown();
        }
    }
}

/// Control-thread half of a session.
struct ControlSession {
    id: u64,
    cancel: Arc<AtomicBool>,
    counters: Arc<SessionCounters>,
    buffer: Option<PlaybackBuffer>,
    stream: Option<Box<dyn OutputStream>>,
    play_pending: bool,
    device_running: bool,
    /// Not-running reports still owed by pauses we requested.
    expected_stops: u32,
    failed: bool,
}

struct Control {
    shared: Arc<Shared>,
    events: Sender<PlayerEvent>,
    output: Box<dyn AudioOutput>,
    control_tx: Sender<ControlMsg>,
    session: Option<ControlSession>,
}

impl Control {
    fn run(mut self, rx: Receiver<ControlMsg>) {
        while let Ok(msg) = rx.recv() {
            match msg {
                ControlMsg::Opened {
                    session,
                    cancel,
                    counters,
                } => self.on_opened(session, cancel, counters),
                ControlMsg::FormatReady {
                    session,
                    source,
                    buffer,
                } => {
                    if self.is_current(session) {
                        self.on_format_ready(source, buffer);
                    }
                }
                ControlMsg::BufferQueued { session } => {
                    if self.is_current(session) {
                        self.try_prime(false);
                    }
                }
                ControlMsg::Drained { session } => {
                    if self.is_current(session) {
                        let _ = self.events.send(PlayerEvent::InputDrained);
                        self.try_prime(true);
                    }
                }
                ControlMsg::DeviceRunning { session, running } => {
                    if self.is_current(session) {
                        self.on_device_running(running);
                    }
                }
                ControlMsg::Fatal { session, error } => {
                    if self.is_current(session) {
                        self.fail(error);
                    }
                }
                ControlMsg::Play { session } => {
                    if self.is_current(session) {
                        self.on_play();
                    }
                }
                ControlMsg::Stop => self.on_stop(),
                ControlMsg::Shutdown => break,
            }
            if self.shared.stop_requested.swap(false, Ordering::AcqRel) {
                self.on_stop();
            }
        }
        if let Some(mut session) = self.session.take() {
            session.stream = None;
        }
        tracing::debug!("player control thread stopped");
    }

    fn is_current(&self, id: u64) -> bool {
        self.session.as_ref().is_some_and(|s| s.id == id && !s.failed)
    }

    fn state(&self) -> PlaybackState {
        *self.shared.state.lock()
    }

    fn set_state(&self, to: PlaybackState) {
        let from = std::mem::replace(&mut *self.shared.state.lock(), to);
        if from != to {
            tracing::info!(%from, %to, "playback state changed");
            let _ = self.events.send(PlayerEvent::StateChanged { from, to });
        }
    }

    fn on_opened(&mut self, id: u64, cancel: Arc<AtomicBool>, counters: Arc<SessionCounters>) {
        // Dropping the old stream closes the device.
        self.session = Some(ControlSession {
            id,
            cancel,
            counters,
            buffer: None,
            stream: None,
            play_pending: false,
            device_running: false,
            expected_stops: 0,
            failed: false,
        });
        self.set_state(PlaybackState::AwaitingFormat);
    }

    fn on_format_ready(&mut self, source: StreamFormat, buffer: PlaybackBuffer) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let output = buffer.format();
        let id = session.id;
        let notify = self.control_tx.clone();
        // Reports also come from the control thread itself (inside start and pause), so
        // they must not wait for room in the control queue.
        let feed = DeviceFeed::new(buffer.consumer(), move |running| {
            if let Err(TrySendError::Full(_)) = notify.try_send(ControlMsg::DeviceRunning {
                session: id,
                running,
            }) {
                tracing::warn!(session = id, running, "control queue full, device report dropped");
            }
        });
        session.buffer = Some(buffer);

        match self.output.open(&output, feed) {
            Ok(stream) => session.stream = Some(stream),
            Err(e) => {
                self.fail(e.into());
                return;
            }
        }
        tracing::info!(
            session = id,
            device = %self.output.name(),
            rate_hz = output.sample_rate,
            channels = output.channels,
            "output configured"
        );
        let _ = self.events.send(PlayerEvent::FormatReady { source, output });
        self.set_state(PlaybackState::AwaitingData);
    }

    fn try_prime(&mut self, force: bool) {
        if self.state() != PlaybackState::AwaitingData {
            return;
        }
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let Some(buffer) = session.buffer.as_ref() else {
            return;
        };
        let primed = if force {
            buffer.prime_now()
        } else {
            buffer.prime()
        };
        if !primed {
            return;
        }
        let play_pending = session.play_pending;
        self.set_state(PlaybackState::Primed);
        if play_pending {
            self.start();
        }
    }

    fn on_play(&mut self) {
        let state = self.state();
        if state.can_start() {
            self.start();
        } else if state.defers_play() {
            if let Some(session) = self.session.as_mut() {
                tracing::debug!(session = session.id, %state, "play deferred until primed");
                session.play_pending = true;
            }
        }
    }

    fn start(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.play_pending = false;
        let result = match session.stream.as_mut() {
            Some(stream) => {
                self.shared.gate.store(true, Ordering::Release);
                stream.start()
            }
            None => Err(DeviceError::Start("output not open".to_string())),
        };
        match result {
            Ok(()) => self.set_state(PlaybackState::Playing),
            Err(e) => self.fail(e.into()),
        }
    }

    fn on_stop(&mut self) {
        let state = self.state();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.play_pending = false;
        if !matches!(state, PlaybackState::Playing | PlaybackState::Primed) {
            return;
        }
        self.shared.gate.store(false, Ordering::Release);
        // Stopped before pausing: the device's not-running report is then advisory.
        self.set_state(PlaybackState::Stopped);
        if state != PlaybackState::Playing {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let result = match session.stream.as_mut() {
            Some(stream) => stream.pause(),
            None => Ok(()),
        };
        match result {
            Ok(()) if session.stream.is_some() => session.expected_stops += 1,
            Ok(()) => {}
            Err(e) => self.fail(e.into()),
        }
    }

    fn on_device_running(&mut self, running: bool) {
        let state = self.state();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let was_running = std::mem::replace(&mut session.device_running, running);
        tracing::debug!(session = session.id, running, %state, "device running state");
        if !running && session.expected_stops > 0 {
            // Our own pause, possibly reported after a later play() restarted the device.
            session.expected_stops -= 1;
            return;
        }
        if was_running && !running && state == PlaybackState::Playing {
            self.fail(DeviceError::StoppedUnexpectedly.into());
        }
    }

    fn fail(&mut self, error: PlayerError) {
        let state = self.state();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.failed {
            return;
        }
        session.failed = true;
        session.cancel.store(true, Ordering::Release);
        self.shared.gate.store(false, Ordering::Release);
        session.stream = None;
        let _ = self.shared.live_session.compare_exchange(
            session.id,
            0,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        let context = FailureContext {
            state,
            byte_offset: session.counters.bytes_parsed(),
        };
        tracing::error!(
            session = session.id,
            %state,
            byte_offset = context.byte_offset,
            error = %error,
            "playback failed"
        );
        self.set_state(PlaybackState::Failed);
        let _ = self.events.send(PlayerEvent::Failed { error, context });
    }
}
