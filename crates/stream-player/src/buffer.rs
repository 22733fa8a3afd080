//! Bounded hand-off of decoded PCM between the decode worker and the output device.
//!
//! Buffers move by ownership:
//! - the worker acquires a zeroed buffer from a preallocated free pool
//! - it fills the buffer and enqueues it on the ready queue
//! - the device callback pulls it, reads it, and drops it, which returns it to the pool
//!
//! Both queues are bounded crossbeam array channels, so the device side never allocates,
//! never locks, and never waits.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::error::QueueFull;
use crate::format::{BYTES_PER_SAMPLE, PcmFormat};

/// Fixed-capacity buffer of interleaved `f32` samples.
pub struct PcmBuffer {
    samples: Box<[f32]>,
    len: usize,
    channels: usize,
    seq: u64,
}

impl PcmBuffer {
    pub fn new(capacity_frames: usize, channels: usize) -> Self {
        let channels = channels.max(1);
        Self {
            samples: vec![0.0; capacity_frames * channels].into_boxed_slice(),
            len: 0,
            channels,
            seq: 0,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn capacity_frames(&self) -> usize {
        self.samples.len() / self.channels
    }

    pub fn capacity_bytes(&self) -> usize {
        self.samples.len() * BYTES_PER_SAMPLE
    }

    pub fn frames(&self) -> usize {
        self.len / self.channels
    }

    /// Bytes of valid audio; never exceeds [`Self::capacity_bytes`].
    pub fn valid_bytes(&self) -> usize {
        self.len * BYTES_PER_SAMPLE
    }

    /// Valid interleaved samples.
    pub fn samples(&self) -> &[f32] {
        &self.samples[..self.len]
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.samples.len()
    }

    pub fn remaining_frames(&self) -> usize {
        (self.samples.len() - self.len) / self.channels
    }

    /// Sequence number assigned at enqueue time.
    pub fn sequence(&self) -> u64 {
        self.seq
    }

    /// Zero the whole buffer and mark it empty.
    pub fn recycle(&mut self) {
        self.samples.fill(0.0);
        self.len = 0;
        self.seq = 0;
    }

    /// Append whole frames from `samples`; returns the number of samples copied.
    pub fn push_interleaved(&mut self, samples: &[f32]) -> usize {
        let frames = (samples.len() / self.channels).min(self.remaining_frames());
        let n = frames * self.channels;
        self.samples[self.len..self.len + n].copy_from_slice(&samples[..n]);
        self.len += n;
        n
    }

    /// Move whole frames from the front of `pending` into the buffer.
    pub fn fill_from(&mut self, pending: &mut VecDeque<f32>) -> usize {
        let frames = (pending.len() / self.channels).min(self.remaining_frames());
        let n = frames * self.channels;
        for (dst, src) in self.samples[self.len..self.len + n]
            .iter_mut()
            .zip(pending.drain(..n))
        {
            *dst = src;
        }
        self.len += n;
        n
    }
}

impl fmt::Debug for PcmBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcmBuffer")
            .field("seq", &self.seq)
            .field("frames", &self.frames())
            .field("capacity_frames", &self.capacity_frames())
            .field("channels", &self.channels)
            .finish()
    }
}

struct Inner {
    format: PcmFormat,
    capacity: usize,
    buffer_frames: usize,
    ready_tx: Sender<PcmBuffer>,
    ready_rx: Receiver<PcmBuffer>,
    free_tx: Sender<PcmBuffer>,
    free_rx: Receiver<PcmBuffer>,
    prime_threshold: AtomicUsize,
    primed: AtomicBool,
    /// Output gate: when false the device side emits silence and leaves the queue alone.
    gate: Arc<AtomicBool>,
    next_seq: AtomicU64,
    enqueued: AtomicU64,
    starved: AtomicU64,
    /// Valid frames across queued buffers.
    queued_frames: AtomicUsize,
}

/// Bounded FIFO of ready PCM buffers plus the pool that backs it.
#[derive(Clone)]
pub struct PlaybackBuffer {
    inner: Arc<Inner>,
}

impl fmt::Debug for PlaybackBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackBuffer")
            .field("format", &self.inner.format)
            .field("queued", &self.len())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

impl PlaybackBuffer {
    /// Allocate `capacity` buffers of `buffer_frames` frames each for `format`.
    pub fn new(format: PcmFormat, capacity: usize, buffer_frames: usize) -> Self {
        let capacity = capacity.max(1);
        let buffer_frames = buffer_frames.max(1);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(capacity);
        let (free_tx, free_rx) = crossbeam_channel::bounded(capacity);
        for _ in 0..capacity {
            let _ = free_tx.try_send(PcmBuffer::new(buffer_frames, format.channels));
        }
        tracing::debug!(
            capacity,
            buffer_frames,
            rate_hz = format.sample_rate,
            channels = format.channels,
            "playback buffer pool allocated"
        );
        Self {
            inner: Arc::new(Inner {
                format,
                capacity,
                buffer_frames,
                ready_tx,
                ready_rx,
                free_tx,
                free_rx,
                prime_threshold: AtomicUsize::new(1),
                primed: AtomicBool::new(false),
                gate: Arc::new(AtomicBool::new(false)),
                next_seq: AtomicU64::new(0),
                enqueued: AtomicU64::new(0),
                starved: AtomicU64::new(0),
                queued_frames: AtomicUsize::new(0),
            }),
        }
    }

    /// Queued buffers required before [`Self::prime`] succeeds (at least one).
    pub fn with_prime_threshold(self, buffers: usize) -> Self {
        let threshold = buffers.clamp(1, self.inner.capacity);
        self.inner.prime_threshold.store(threshold, Ordering::Relaxed);
        self
    }

    /// Share an externally owned output gate instead of the internal one.
    pub fn with_output_gate(self, gate: Arc<AtomicBool>) -> Self {
        let inner = match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.gate = gate;
                inner
            }
            // Already shared; the gate cannot be swapped safely.
            Err(inner) => return Self { inner },
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn format(&self) -> PcmFormat {
        self.inner.format
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn buffer_frames(&self) -> usize {
        self.inner.buffer_frames
    }

    /// Buffers currently queued for the device.
    pub fn len(&self) -> usize {
        self.inner.ready_rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.ready_rx.is_empty()
    }

    /// Valid frames currently queued for the device (partial buffers count what they hold).
    pub fn queued_frames(&self) -> usize {
        self.inner.queued_frames.load(Ordering::Acquire)
    }

    /// Take a zeroed buffer from the pool without waiting.
    pub fn acquire(&self) -> Option<PcmBuffer> {
        self.inner.free_rx.try_recv().ok().map(recycled)
    }

    /// Take a zeroed buffer from the pool, waiting up to `timeout` for the device to return one.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<PcmBuffer> {
        self.inner.free_rx.recv_timeout(timeout).ok().map(recycled)
    }

    /// Append a filled buffer to the ready queue and return its sequence number.
    ///
    /// Single producer: sequence numbers are strictly increasing in enqueue order.
    pub fn enqueue(&self, mut buffer: PcmBuffer) -> Result<u64, QueueFull> {
        let seq = self.inner.next_seq.load(Ordering::Relaxed);
        buffer.seq = seq;
        let frames = buffer.frames();
        // Counted before the send so a racing pull never takes more than was added.
        self.inner.queued_frames.fetch_add(frames, Ordering::AcqRel);
        match self.inner.ready_tx.try_send(buffer) {
            Ok(()) => {
                self.inner.next_seq.store(seq + 1, Ordering::Relaxed);
                self.inner.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(seq)
            }
            Err(TrySendError::Full(buffer)) | Err(TrySendError::Disconnected(buffer)) => {
                self.inner.queued_frames.fetch_sub(frames, Ordering::AcqRel);
                Err(QueueFull {
                    buffer,
                    capacity: self.inner.capacity,
                })
            }
        }
    }

    /// One-time warm-up; succeeds once the prime threshold is queued. Idempotent.
    pub fn prime(&self) -> bool {
        self.prime_with(self.inner.prime_threshold.load(Ordering::Relaxed))
    }

    /// Prime with any queued audio at all (end of input, short clips).
    pub fn prime_now(&self) -> bool {
        self.prime_with(1)
    }

    fn prime_with(&self, threshold: usize) -> bool {
        if self.inner.primed.load(Ordering::Acquire) {
            return true;
        }
        if self.len() >= threshold {
            self.inner.primed.store(true, Ordering::Release);
            tracing::debug!(queued = self.len(), threshold, "playback buffer primed");
            return true;
        }
        false
    }

    pub fn is_primed(&self) -> bool {
        self.inner.primed.load(Ordering::Acquire)
    }

    /// Open or close the output gate. Safe from any context.
    pub fn set_output_enabled(&self, enabled: bool) {
        self.inner.gate.store(enabled, Ordering::Release);
    }

    pub fn output_enabled(&self) -> bool {
        self.inner.gate.load(Ordering::Acquire)
    }

    /// Total buffers accepted by [`Self::enqueue`].
    pub fn enqueued(&self) -> u64 {
        self.inner.enqueued.load(Ordering::Relaxed)
    }

    /// Pulls that found the queue empty while output was enabled.
    pub fn starved(&self) -> u64 {
        self.inner.starved.load(Ordering::Relaxed)
    }

    /// Device-facing handle.
    pub fn consumer(&self) -> BufferConsumer {
        BufferConsumer {
            inner: self.inner.clone(),
        }
    }
}

fn recycled(mut buffer: PcmBuffer) -> PcmBuffer {
    buffer.recycle();
    buffer
}

/// Result of one device pull.
#[derive(Debug)]
pub enum Pull {
    Ready(PulledBuffer),
    /// Output is enabled but nothing is queued.
    Starved,
    /// Output gate is closed; emit silence and leave the queue untouched.
    Paused,
}

/// Pull side of a [`PlaybackBuffer`], owned by the output device callback.
#[derive(Clone)]
pub struct BufferConsumer {
    inner: Arc<Inner>,
}

impl BufferConsumer {
    /// Never blocks, never allocates.
    pub fn pull(&self) -> Pull {
        if !self.inner.gate.load(Ordering::Acquire) {
            return Pull::Paused;
        }
        match self.inner.ready_rx.try_recv() {
            Ok(buffer) => {
                self.inner
                    .queued_frames
                    .fetch_sub(buffer.frames(), Ordering::AcqRel);
                Pull::Ready(PulledBuffer {
                    buffer: Some(buffer),
                    pool: self.inner.free_tx.clone(),
                })
            }
            Err(_) => {
                self.inner.starved.fetch_add(1, Ordering::Relaxed);
                Pull::Starved
            }
        }
    }

    pub fn channels(&self) -> usize {
        self.inner.format.channels
    }

    pub fn is_paused(&self) -> bool {
        !self.inner.gate.load(Ordering::Acquire)
    }
}

/// A buffer on loan to the device. Read-only; returns to the pool on drop.
pub struct PulledBuffer {
    buffer: Option<PcmBuffer>,
    pool: Sender<PcmBuffer>,
}

impl Deref for PulledBuffer {
    type Target = PcmBuffer;

    fn deref(&self) -> &PcmBuffer {
        // Only `drop` takes the buffer out.
        self.buffer.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl fmt::Debug for PulledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PulledBuffer").field(&self.buffer).finish()
    }
}

impl Drop for PulledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            let _ = self.pool.try_send(buffer);
        }
    }
}
