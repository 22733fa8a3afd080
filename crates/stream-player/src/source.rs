//! Byte chunk delivery.
//!
//! A transfer reports what it is about to deliver, then hands over chunks in arrival order,
//! then either completes or fails. No chunk follows a failure.

use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::controller::Player;
use crate::error::PlayerError;
use crate::format::FormatHint;

const BACKLOG_WAIT: Duration = Duration::from_millis(10);

/// What the transfer knows before the first byte arrives.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamInfo {
    /// Total size, when the transfer announces one.
    pub expected_len: Option<u64>,
    /// `Content-Type` or equivalent.
    pub mime_type: Option<String>,
}

impl StreamInfo {
    /// Parser hint for this transfer. MPEG audio when nothing is announced.
    pub fn hint(&self) -> FormatHint {
        match self.mime_type.as_deref() {
            Some(mime) if !mime.trim().is_empty() => FormatHint::Mime(mime.to_string()),
            _ => FormatHint::Mpeg,
        }
    }
}

/// Receiver side of a byte transfer.
pub trait ChunkSink {
    fn on_format_info(&mut self, info: &StreamInfo) -> Result<(), PlayerError>;
    fn on_chunk(&mut self, chunk: &[u8]) -> Result<(), PlayerError>;
    fn on_error(&mut self, cause: &str);
    fn on_complete(&mut self) -> Result<(), PlayerError>;

    /// Whether the sink wants delivery to pause before the next chunk.
    fn backlogged(&self) -> bool {
        false
    }
}

impl ChunkSink for Player {
    fn on_format_info(&mut self, info: &StreamInfo) -> Result<(), PlayerError> {
        tracing::info!(
            expected_len = ?info.expected_len,
            mime = ?info.mime_type,
            "transfer starting"
        );
        self.open(info.hint())
    }

    fn on_chunk(&mut self, chunk: &[u8]) -> Result<(), PlayerError> {
        self.feed(chunk, false).map(|_| ())
    }

    fn on_error(&mut self, cause: &str) {
        self.fail_source(cause);
    }

    fn on_complete(&mut self) -> Result<(), PlayerError> {
        self.finish()
    }

    fn backlogged(&self) -> bool {
        self.is_backlogged()
    }
}

/// Pump `reader` into `sink` in chunks of at most `chunk_size` bytes.
///
/// Returns the number of bytes delivered. Reading pauses while the sink is backlogged, so a
/// fast source never runs far ahead of decoding. Stops early (without completing) when
/// `cancel` is set. Read failures are reported through `on_error`.
pub fn deliver_from_reader<R: Read>(
    mut reader: R,
    info: &StreamInfo,
    chunk_size: usize,
    sink: &mut dyn ChunkSink,
    cancel: &AtomicBool,
) -> Result<u64, PlayerError> {
    sink.on_format_info(info)?;
    let mut chunk = vec![0u8; chunk_size.max(1)];
    let mut delivered = 0u64;
    loop {
        while sink.backlogged() && !cancel.load(Ordering::Relaxed) {
            std::thread::sleep(BACKLOG_WAIT);
        }
        if cancel.load(Ordering::Relaxed) {
            tracing::debug!(delivered, "delivery cancelled");
            return Ok(delivered);
        }
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                let cause = format!("read failed after {delivered} bytes: {e}");
                sink.on_error(&cause);
                return Err(PlayerError::Source(cause));
            }
        };
        sink.on_chunk(&chunk[..n])?;
        delivered += n as u64;
    }
    if let Some(expected) = info.expected_len {
        if expected != delivered {
            tracing::warn!(expected, delivered, "transfer length differs from announced size");
        }
    }
    sink.on_complete()?;
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Log {
        info: Option<StreamInfo>,
        chunks: Vec<usize>,
        errors: Vec<String>,
        completed: bool,
    }

    impl ChunkSink for Log {
        fn on_format_info(&mut self, info: &StreamInfo) -> Result<(), PlayerError> {
            self.info = Some(info.clone());
            Ok(())
        }

        fn on_chunk(&mut self, chunk: &[u8]) -> Result<(), PlayerError> {
            self.chunks.push(chunk.len());
            Ok(())
        }

        fn on_error(&mut self, cause: &str) {
            self.errors.push(cause.to_string());
        }

        fn on_complete(&mut self) -> Result<(), PlayerError> {
            self.completed = true;
            Ok(())
        }
    }

    /// Reports a backlog for the first `busy` polls.
    struct Busy {
        log: Log,
        busy: std::cell::Cell<usize>,
        polls: std::cell::Cell<usize>,
    }

    impl ChunkSink for Busy {
        fn on_format_info(&mut self, info: &StreamInfo) -> Result<(), PlayerError> {
            self.log.on_format_info(info)
        }

        fn on_chunk(&mut self, chunk: &[u8]) -> Result<(), PlayerError> {
            // Every chunk arrives after the backlog cleared.
            assert_eq!(self.busy.get(), 0);
            self.log.on_chunk(chunk)
        }

        fn on_error(&mut self, cause: &str) {
            self.log.on_error(cause);
        }

        fn on_complete(&mut self) -> Result<(), PlayerError> {
            self.log.on_complete()
        }

        fn backlogged(&self) -> bool {
            self.polls.set(self.polls.get() + 1);
            let busy = self.busy.get();
            self.busy.set(busy.saturating_sub(1));
            busy > 0
        }
    }

    struct FailAfter {
        left: usize,
    }

    impl Read for FailAfter {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.left == 0 {
                return Err(std::io::Error::new(ErrorKind::ConnectionReset, "reset"));
            }
            let n = buf.len().min(self.left);
            self.left -= n;
            Ok(n)
        }
    }

    #[test]
    fn missing_mime_defaults_to_mpeg() {
        assert_eq!(StreamInfo::default().hint(), FormatHint::Mpeg);
        let info = StreamInfo {
            mime_type: Some("audio/wav".to_string()),
            ..Default::default()
        };
        assert_eq!(info.hint(), FormatHint::Mime("audio/wav".to_string()));
    }

    #[test]
    fn delivers_in_bounded_chunks_then_completes() {
        let data = vec![7u8; 10_000];
        let mut log = Log::default();
        let cancel = AtomicBool::new(false);
        let info = StreamInfo {
            expected_len: Some(10_000),
            mime_type: None,
        };

        let delivered = deliver_from_reader(&data[..], &info, 4096, &mut log, &cancel).unwrap();
        assert_eq!(delivered, 10_000);
        assert_eq!(log.chunks, vec![4096, 4096, 1808]);
        assert!(log.completed);
        assert_eq!(log.info, Some(info));
    }

    #[test]
    fn read_failure_is_reported_and_stops_delivery() {
        let mut log = Log::default();
        let cancel = AtomicBool::new(false);
        let err = deliver_from_reader(
            FailAfter { left: 100 },
            &StreamInfo::default(),
            64,
            &mut log,
            &cancel,
        )
        .unwrap_err();

        assert!(matches!(err, PlayerError::Source(_)));
        assert_eq!(log.chunks, vec![64, 36]);
        assert_eq!(log.errors.len(), 1);
        assert!(!log.completed);
    }

    #[test]
    fn delivery_waits_while_sink_is_backlogged() {
        let mut sink = Busy {
            log: Log::default(),
            busy: std::cell::Cell::new(3),
            polls: std::cell::Cell::new(0),
        };
        let cancel = AtomicBool::new(false);
        let delivered =
            deliver_from_reader(&[5u8; 20][..], &StreamInfo::default(), 8, &mut sink, &cancel)
                .unwrap();
        assert_eq!(delivered, 20);
        assert_eq!(sink.log.chunks, vec![8, 8, 4]);
        assert!(sink.log.completed);
        // Three busy polls, then one per chunk plus the final read.
        assert_eq!(sink.polls.get(), 3 + 4);
    }

    #[test]
    fn cancelled_delivery_does_not_complete() {
        let mut log = Log::default();
        let cancel = AtomicBool::new(true);
        let delivered =
            deliver_from_reader(&[1u8; 32][..], &StreamInfo::default(), 8, &mut log, &cancel)
                .unwrap();
        assert_eq!(delivered, 0);
        assert!(log.chunks.is_empty());
        assert!(!log.completed);
    }
}
