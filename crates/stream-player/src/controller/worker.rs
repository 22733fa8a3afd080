//! Decode worker: one thread per session that owns the [`FormatConverter`].
//!
//! Jobs arrive in parser order. Packets are pulled through [`JobSource`], which reports "no
//! input right now" when the backpressure counter is zero or a control job is next in line,
//! so control jobs are always handled between packets and never reordered with them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::ControlMsg;
use crate::buffer::{PcmBuffer, PlaybackBuffer};
use crate::config::PlayerConfig;
use crate::convert::{FormatConverter, PacketSource};
use crate::error::{PlayerError, QueueFull};
use crate::format::StreamFormat;
use crate::parser::CompressedPacket;
use crate::status::SessionCounters;

const IDLE_WAIT: Duration = Duration::from_millis(50);
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(5);

/// Work posted to the decode worker by the delivery path.
#[derive(Debug)]
pub(crate) enum DecodeJob {
    Configure(StreamFormat),
    Packet(CompressedPacket),
    Discontinuity,
    /// End of input: drain the converter and queue whatever is left.
    Flush,
    Shutdown,
}

/// Packets submitted for conversion but not yet pulled by the converter.
#[derive(Debug, Default)]
pub(crate) struct BackpressureCounter(AtomicUsize);

impl BackpressureCounter {
    pub(crate) fn add(&self, n: usize) {
        self.0.fetch_add(n, Ordering::AcqRel);
    }

    fn take_one(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub(crate) fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

/// Pull adapter between the job channel and the converter.
struct JobSource {
    jobs: Receiver<DecodeJob>,
    counters: Arc<SessionCounters>,
    /// Packet received by the main loop, handed out first.
    lookahead: Option<CompressedPacket>,
    /// Non-packet job found while pulling; handled once the converter yields.
    deferred: Option<DecodeJob>,
}

impl PacketSource for JobSource {
    fn next_packet(&mut self) -> Option<CompressedPacket> {
        if let Some(packet) = self.lookahead.take() {
            self.counters.pending.take_one();
            return Some(packet);
        }
        if self.deferred.is_some() || self.counters.pending.get() == 0 {
            return None;
        }
        match self.jobs.try_recv() {
            Ok(DecodeJob::Packet(packet)) => {
                self.counters.pending.take_one();
                Some(packet)
            }
            Ok(other) => {
                self.deferred = Some(other);
                None
            }
            Err(_) => None,
        }
    }
}

pub(crate) struct DecodeWorker {
    session: u64,
    config: PlayerConfig,
    source: JobSource,
    control: Sender<ControlMsg>,
    cancel: Arc<AtomicBool>,
    gate: Arc<AtomicBool>,
    converter: Option<FormatConverter>,
    buffer: Option<PlaybackBuffer>,
    /// Buffer being filled; partially filled buffers wait here for more input.
    current: Option<PcmBuffer>,
    last_starved: u64,
}

impl DecodeWorker {
    pub(crate) fn new(
        session: u64,
        config: PlayerConfig,
        jobs: Receiver<DecodeJob>,
        counters: Arc<SessionCounters>,
        control: Sender<ControlMsg>,
        cancel: Arc<AtomicBool>,
        gate: Arc<AtomicBool>,
    ) -> Self {
        Self {
            session,
            config,
            source: JobSource {
                jobs,
                counters,
                lookahead: None,
                deferred: None,
            },
            control,
            cancel,
            gate,
            converter: None,
            buffer: None,
            current: None,
            last_starved: 0,
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub(crate) fn run(mut self) {
        tracing::debug!(session = self.session, "decode worker started");
        while !self.cancelled() {
            if self.converter.is_some() && self.source.lookahead.is_some() {
                if !self.pump() {
                    break;
                }
            }
            self.report_starvation();

            let job = match self.source.deferred.take() {
                Some(job) => job,
                None => match self.source.jobs.recv_timeout(IDLE_WAIT) {
                    Ok(job) => job,
                    Err(RecvTimeoutError::Timeout) => {
                        if !self.offer_partial() {
                            break;
                        }
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                },
            };

            match job {
                DecodeJob::Configure(format) => {
                    if self.converter.is_some() {
                        tracing::debug!(session = self.session, "format already configured");
                        continue;
                    }
                    if !self.configure(&format) {
                        break;
                    }
                }
                DecodeJob::Packet(packet) => {
                    if self.converter.is_some() {
                        self.source.lookahead = Some(packet);
                    } else {
                        self.source.counters.pending.take_one();
                    }
                }
                DecodeJob::Discontinuity => {
                    if let Some(converter) = self.converter.as_mut() {
                        if let Err(e) = converter.reset() {
                            tracing::warn!(session = self.session, error = %e, "resampler flush failed");
                        }
                    }
                    // Queue the audio decoded before the gap.
                    if !self.pump() {
                        break;
                    }
                }
                DecodeJob::Flush => {
                    if !self.flush() {
                        break;
                    }
                }
                DecodeJob::Shutdown => break,
            }
        }
        tracing::debug!(session = self.session, "decode worker stopped");
    }

    fn configure(&mut self, format: &StreamFormat) -> bool {
        let converter = match FormatConverter::configure(format, &self.config.converter()) {
            Ok(converter) => converter,
            Err(e) => {
                self.fatal(PlayerError::ConverterInit(e));
                return false;
            }
        };
        let buffer = PlaybackBuffer::new(
            converter.output_format(),
            self.config.buffer_count,
            self.config.buffer_frames,
        )
        .with_prime_threshold(self.config.prime_buffers)
        .with_output_gate(self.gate.clone());

        let _ = self.source.counters.buffer.set(buffer.clone());
        let _ = self.control.send(ControlMsg::FormatReady {
            session: self.session,
            source: format.clone(),
            buffer: buffer.clone(),
        });
        self.converter = Some(converter);
        self.buffer = Some(buffer);
        true
    }

    /// Convert everything available right now. Returns `false` when the session must end.
    fn pump(&mut self) -> bool {
        let (Some(converter), Some(buffer)) = (self.converter.as_mut(), self.buffer.clone()) else {
            return true;
        };
        loop {
            let Some(mut pcm) = self.current.take().or_else(|| acquire(&buffer, &self.cancel))
            else {
                return false;
            };

            if let Err(e) = converter.convert(&mut self.source, &mut pcm) {
                self.source
                    .counters
                    .conversion_failures
                    .fetch_add(1, Ordering::Relaxed);
                let failures = converter.consecutive_failures();
                tracing::warn!(
                    session = self.session,
                    failures,
                    error = %e,
                    "packet conversion failed"
                );
                self.current = Some(pcm);
                if failures > self.config.max_consecutive_failures {
                    self.fatal(PlayerError::PersistentConversion { failures, last: e });
                    return false;
                }
                continue;
            }

            if pcm.is_full() {
                if !enqueue(&buffer, pcm, &self.cancel, &self.control, self.session) {
                    return false;
                }
                continue;
            }

            // Input ran dry. Hand over a partial buffer only while the device is close to
            // starving; otherwise keep filling it.
            if !pcm.is_empty() && buffer.len() < self.config.prime_buffers.max(1) {
                return enqueue(&buffer, pcm, &self.cancel, &self.control, self.session);
            }
            self.current = Some(pcm);
            return true;
        }
    }

    /// While idle, hand over a partially filled buffer if the device is about to starve.
    fn offer_partial(&mut self) -> bool {
        let Some(buffer) = self.buffer.clone() else {
            return true;
        };
        if buffer.len() >= self.config.prime_buffers.max(1) {
            return true;
        }
        match self.current.take() {
            Some(pcm) if !pcm.is_empty() => {
                enqueue(&buffer, pcm, &self.cancel, &self.control, self.session)
            }
            other => {
                self.current = other;
                true
            }
        }
    }

    fn flush(&mut self) -> bool {
        if !self.pump() {
            return false;
        }
        let (Some(converter), Some(buffer)) = (self.converter.as_mut(), self.buffer.clone()) else {
            return true;
        };
        loop {
            let Some(mut pcm) = self.current.take().or_else(|| acquire(&buffer, &self.cancel))
            else {
                return false;
            };
            if let Err(e) = converter.flush(&mut pcm) {
                tracing::warn!(session = self.session, error = %e, "converter flush failed");
            }
            let more = converter.has_pending();
            if pcm.is_empty() {
                self.current = Some(pcm);
            } else if !enqueue(&buffer, pcm, &self.cancel, &self.control, self.session) {
                return false;
            }
            if !more {
                break;
            }
        }
        tracing::debug!(
            session = self.session,
            packets = converter.packets_converted(),
            "input drained"
        );
        let _ = self.control.send(ControlMsg::Drained {
            session: self.session,
        });
        true
    }

    fn report_starvation(&mut self) {
        let Some(buffer) = self.buffer.as_ref() else {
            return;
        };
        let starved = buffer.starved();
        if starved > self.last_starved {
            tracing::warn!(
                session = self.session,
                pulls = starved - self.last_starved,
                total = starved,
                "playback buffer starved"
            );
            self.last_starved = starved;
        }
    }

    fn fatal(&self, error: PlayerError) {
        let _ = self.control.send(ControlMsg::Fatal {
            session: self.session,
            error,
        });
    }
}

/// Wait for the device to return a buffer to the pool.
fn acquire(buffer: &PlaybackBuffer, cancel: &AtomicBool) -> Option<PcmBuffer> {
    loop {
        if cancel.load(Ordering::Acquire) {
            return None;
        }
        if let Some(pcm) = buffer.acquire_timeout(IDLE_WAIT) {
            return Some(pcm);
        }
    }
}

/// Queue a filled buffer, backing off while the queue is full. Never drops audio.
fn enqueue(
    buffer: &PlaybackBuffer,
    mut pcm: PcmBuffer,
    cancel: &AtomicBool,
    control: &Sender<ControlMsg>,
    session: u64,
) -> bool {
    loop {
        match buffer.enqueue(pcm) {
            Ok(seq) => {
                tracing::trace!(session, seq, "buffer queued");
                let _ = control.send(ControlMsg::BufferQueued { session });
                return true;
            }
            Err(QueueFull { buffer: rejected, .. }) => {
                if cancel.load(Ordering::Acquire) {
                    return false;
                }
                pcm = rejected;
                std::thread::sleep(QUEUE_FULL_BACKOFF);
            }
        }
    }
}
