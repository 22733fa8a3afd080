//! Incremental stream parser.
//!
//! Turns an arbitrarily chunked byte stream into self-describing packets:
//! - bytes that do not yet form a complete structure are kept and prefixed to the next chunk
//! - the stream format is announced exactly once, before any packet
//! - a packet is only emitted once its full length has arrived
//!
//! Container specifics live in [`mpeg`] and [`wave`]; both expose a `step` function that
//! inspects the unconsumed bytes and reports one [`Step`]. The driver here owns the byte
//! bookkeeping so chunk boundaries never leak into container code.

pub mod mpeg;
pub mod wave;

use crate::config::ParserConfig;
use crate::error::{FormatOpenError, ParseError};
use crate::format::{ContainerKind, FormatHint, StreamFormat};

/// Size, position and duration of one compressed packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketDescription {
    /// Absolute stream offset of the packet's first byte.
    pub offset: u64,
    /// Packet length in bytes.
    pub len: usize,
    /// Frames the packet decodes to.
    pub frames: u32,
}

/// One decodable unit of compressed audio.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressedPacket {
    pub data: Vec<u8>,
    pub desc: PacketDescription,
    /// Presentation timestamp in source frames.
    pub ts: u64,
}

/// Notifications delivered synchronously from inside [`StreamParser::feed`].
pub trait ParserEvents {
    /// Called exactly once per session, before any packet.
    fn format_ready(&mut self, format: &StreamFormat);

    /// Called with every packet completed by the current call, in stream order.
    ///
    /// `bytes_parsed` is the cumulative number of stream bytes consumed so far.
    fn packets_ready(&mut self, packets: Vec<CompressedPacket>, bytes_parsed: u64);
}

/// Outcome of inspecting the unconsumed bytes.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Step {
    /// More bytes are required before anything can be decided.
    Need,
    /// Discard this many bytes (may exceed what is buffered).
    Skip(u64),
    /// The stream format is now known; consume `consume` header bytes.
    Format { format: StreamFormat, consume: usize },
    /// A complete packet of `len` bytes starts at the cursor.
    Packet { len: usize, frames: u32 },
}

enum Container {
    Mpeg(mpeg::MpegState),
    Wave(wave::WaveState),
}

impl Container {
    fn step(
        &mut self,
        buf: &[u8],
        offset: u64,
        format: Option<&StreamFormat>,
        eos: bool,
    ) -> Result<Step, ParseError> {
        match self {
            Container::Mpeg(s) => s.step(buf, offset, format, eos),
            Container::Wave(s) => s.step(buf, offset, format, eos),
        }
    }

    fn discontinuity(&mut self) {
        match self {
            Container::Mpeg(s) => s.discontinuity(),
            Container::Wave(s) => s.discontinuity(),
        }
    }
}

/// Incremental demuxer bound to one session.
pub struct StreamParser {
    kind: ContainerKind,
    container: Container,
    /// Unconsumed bytes; `pending[0]` sits at stream offset `base`.
    pending: Vec<u8>,
    base: u64,
    /// Bytes still to be skipped that have not arrived yet.
    skip: u64,
    format: Option<StreamFormat>,
    next_ts: u64,
    packets: u64,
    finished: bool,
}

impl StreamParser {
    /// Bind a parser to a new session.
    pub fn open(hint: &FormatHint, config: &ParserConfig) -> Result<Self, FormatOpenError> {
        let kind = hint.resolve()?;
        let container = match kind {
            ContainerKind::Mpeg => Container::Mpeg(mpeg::MpegState::new(config.max_resync_bytes)),
            ContainerKind::Wave => Container::Wave(wave::WaveState::new(config.wave_packet_frames)),
        };
        tracing::debug!(container = ?kind, "stream parser opened");
        Ok(Self {
            kind,
            container,
            pending: Vec::new(),
            base: 0,
            skip: 0,
            format: None,
            next_ts: 0,
            packets: 0,
            finished: false,
        })
    }

    pub fn container(&self) -> ContainerKind {
        self.kind
    }

    /// Format announced so far, if any.
    pub fn format(&self) -> Option<&StreamFormat> {
        self.format.as_ref()
    }

    /// Cumulative stream bytes consumed (parsed or skipped).
    pub fn bytes_parsed(&self) -> u64 {
        self.base
    }

    /// Bytes held back waiting for the rest of a structure.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Packets emitted so far.
    pub fn packets_emitted(&self) -> u64 {
        self.packets
    }

    /// Parse as much of `chunk` as is structurally complete.
    ///
    /// With `discontinuity` set, buffered partial data from earlier chunks is dropped first,
    /// so no packet can span the old and the new data.
    pub fn feed(
        &mut self,
        chunk: &[u8],
        discontinuity: bool,
        events: &mut dyn ParserEvents,
    ) -> Result<(), ParseError> {
        if discontinuity {
            self.discard_partial();
        }
        self.pending.extend_from_slice(chunk);
        self.parse(false, events)
    }

    /// Signal end of input: emit whatever complete data remains.
    pub fn finish(&mut self, events: &mut dyn ParserEvents) -> Result<(), ParseError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.parse(true, events)?;
        if self.format.is_none() {
            return Err(ParseError::Truncated);
        }
        if !self.pending.is_empty() {
            tracing::debug!(
                bytes = self.pending.len(),
                "dropping incomplete trailing data at end of stream"
            );
            self.base += self.pending.len() as u64;
            self.pending.clear();
        }
        Ok(())
    }

    fn discard_partial(&mut self) {
        if !self.pending.is_empty() || self.skip > 0 {
            tracing::debug!(
                dropped = self.pending.len(),
                skip = self.skip,
                "discontinuity: discarding partial data"
            );
        }
        self.base += self.pending.len() as u64;
        self.pending.clear();
        self.skip = 0;
        self.container.discontinuity();
    }

    fn parse(&mut self, eos: bool, events: &mut dyn ParserEvents) -> Result<(), ParseError> {
        let mut cursor = 0usize;
        let mut packets = Vec::new();

        let result = loop {
            if self.skip > 0 {
                let available = (self.pending.len() - cursor) as u64;
                let n = self.skip.min(available);
                cursor += n as usize;
                self.skip -= n;
                if self.skip > 0 {
                    break Ok(());
                }
            }
            if cursor >= self.pending.len() {
                break Ok(());
            }

            let offset = self.base + cursor as u64;
            let step = match self.container.step(
                &self.pending[cursor..],
                offset,
                self.format.as_ref(),
                eos,
            ) {
                Ok(step) => step,
                Err(e) => break Err(e),
            };

            match step {
                Step::Need => break Ok(()),
                Step::Skip(n) => self.skip = n,
                Step::Format { format, consume } => {
                    if let Err(e) = format.validate() {
                        break Err(e);
                    }
                    cursor += consume;
                    events.format_ready(&format);
                    self.format = Some(format);
                }
                Step::Packet { len, frames } => {
                    let data = self.pending[cursor..cursor + len].to_vec();
                    packets.push(CompressedPacket {
                        data,
                        desc: PacketDescription {
                            offset,
                            len,
                            frames,
                        },
                        ts: self.next_ts,
                    });
                    self.next_ts += frames as u64;
                    cursor += len;
                }
            }
        };

        self.pending.drain(..cursor);
        self.base += cursor as u64;

        if !packets.is_empty() {
            self.packets += packets.len() as u64;
            events.packets_ready(packets, self.base);
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Collects parser notifications for assertions.
    #[derive(Default)]
    pub(crate) struct Recorder {
        pub(crate) formats: Vec<StreamFormat>,
        pub(crate) packets: Vec<CompressedPacket>,
        pub(crate) batches: Vec<u64>,
    }

    impl ParserEvents for Recorder {
        fn format_ready(&mut self, format: &StreamFormat) {
            self.formats.push(format.clone());
        }

        fn packets_ready(&mut self, packets: Vec<CompressedPacket>, bytes_parsed: u64) {
            self.packets.extend(packets);
            self.batches.push(bytes_parsed);
        }
    }

    pub(crate) fn wave_bytes(channels: u16, rate: u32, frames: usize) -> Vec<u8> {
        let block_align = channels as usize * 2;
        let data_len = frames * block_align;
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&((36 + data_len) as u32).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&rate.to_le_bytes());
        out.extend_from_slice(&(rate * block_align as u32).to_le_bytes());
        out.extend_from_slice(&(block_align as u16).to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&(data_len as u32).to_le_bytes());
        for i in 0..data_len / 2 {
            out.extend_from_slice(&((i as i16).wrapping_mul(7)).to_le_bytes());
        }
        out
    }

    fn parse_in_chunks(bytes: &[u8], sizes: &[usize]) -> Recorder {
        let mut parser = StreamParser::open(&FormatHint::Wave, &ParserConfig {
            wave_packet_frames: 100,
            max_resync_bytes: 1024,
        })
        .unwrap();
        let mut rec = Recorder::default();
        let mut rest = bytes;
        let mut i = 0;
        while !rest.is_empty() {
            let n = sizes[i % sizes.len()].min(rest.len());
            parser.feed(&rest[..n], false, &mut rec).unwrap();
            rest = &rest[n..];
            i += 1;
        }
        parser.finish(&mut rec).unwrap();
        rec
    }

    #[test]
    fn packets_do_not_depend_on_chunking() {
        let bytes = wave_bytes(2, 8_000, 1_050);
        let whole = parse_in_chunks(&bytes, &[bytes.len()]);
        for sizes in [&[1usize][..], &[3, 7], &[10, 20, 5000], &[399, 401, 13]] {
            let split = parse_in_chunks(&bytes, sizes);
            assert_eq!(split.formats, whole.formats);
            assert_eq!(split.packets, whole.packets);
        }
        assert_eq!(whole.formats.len(), 1);
        assert_eq!(whole.packets.len(), 11);
    }

    #[test]
    fn format_is_announced_once_before_packets() {
        let bytes = wave_bytes(1, 22_050, 300);
        let mut parser = StreamParser::open(&FormatHint::Wave, &ParserConfig::default()).unwrap();
        let mut rec = Recorder::default();
        parser.feed(&bytes[..30], false, &mut rec).unwrap();
        assert!(rec.formats.is_empty());
        parser.feed(&bytes[30..50], false, &mut rec).unwrap();
        assert_eq!(rec.formats.len(), 1);
        assert_eq!(rec.formats[0].data_offset, 44);
        parser.feed(&bytes[50..], false, &mut rec).unwrap();
        assert_eq!(rec.formats.len(), 1);
    }

    #[test]
    fn cumulative_byte_count_is_reported() {
        let bytes = wave_bytes(1, 8_000, 2_048);
        let mut parser = StreamParser::open(&FormatHint::Wave, &ParserConfig::default()).unwrap();
        let mut rec = Recorder::default();
        parser.feed(&bytes, false, &mut rec).unwrap();
        assert_eq!(rec.batches, vec![bytes.len() as u64]);
        assert_eq!(parser.bytes_parsed(), bytes.len() as u64);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn finish_before_format_is_truncated() {
        let mut parser = StreamParser::open(&FormatHint::Wave, &ParserConfig::default()).unwrap();
        let mut rec = Recorder::default();
        parser.feed(b"RIFF", false, &mut rec).unwrap();
        assert_eq!(parser.finish(&mut rec), Err(ParseError::Truncated));
    }
}
