//! Output device driver seam.
//!
//! The controller never talks to an audio API directly. It opens an [`OutputStream`] through
//! an [`AudioOutput`] once the output format is known and hands the driver a [`DeviceFeed`]:
//! the pull handle for decoded audio plus the callback used to report running state.

use std::fmt;
use std::sync::Arc;

use crate::buffer::{BufferConsumer, Pull};
use crate::error::DeviceError;
use crate::format::PcmFormat;

/// Opens output streams for a negotiated PCM format.
pub trait AudioOutput: Send {
    fn open(
        &mut self,
        format: &PcmFormat,
        feed: DeviceFeed,
    ) -> Result<Box<dyn OutputStream>, DeviceError>;

    /// Human-readable device name for logs.
    fn name(&self) -> String {
        "output".to_string()
    }
}

/// A running (or paused) device stream. Dropping it closes the stream.
///
/// Streams are created and dropped on the controller's control thread, so they need not be
/// `Send` (some audio backends tie streams to their creating thread).
pub trait OutputStream {
    fn start(&mut self) -> Result<(), DeviceError>;
    fn pause(&mut self) -> Result<(), DeviceError>;
}

type RunningNotifier = Arc<dyn Fn(bool) + Send + Sync>;

/// Everything a driver needs from the core: audio to play and a way to report its state.
#[derive(Clone)]
pub struct DeviceFeed {
    consumer: BufferConsumer,
    running: RunningNotifier,
}

impl DeviceFeed {
    pub fn new(consumer: BufferConsumer, running: impl Fn(bool) + Send + Sync + 'static) -> Self {
        Self {
            consumer,
            running: Arc::new(running),
        }
    }

    /// Next queued buffer; see [`BufferConsumer::pull`]. Real-time safe.
    pub fn pull(&self) -> Pull {
        self.consumer.pull()
    }

    pub fn channels(&self) -> usize {
        self.consumer.channels()
    }

    pub fn is_paused(&self) -> bool {
        self.consumer.is_paused()
    }

    /// Report that the device started (`true`) or stopped (`false`) running.
    pub fn notify_running(&self, running: bool) {
        (self.running)(running);
    }
}

impl fmt::Debug for DeviceFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceFeed")
            .field("channels", &self.channels())
            .field("paused", &self.is_paused())
            .finish()
    }
}
