//! MPEG audio elementary streams (Layer I/II/III, MPEG-1/2/2.5).

use super::Step;
use crate::error::ParseError;
use crate::format::{Codec, MpegLayer, StreamFormat};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MpegVersion {
    V1,
    V2,
    V25,
}

const BITRATES_V1_L1: [u32; 14] = [
    32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448,
];
const BITRATES_V1_L2: [u32; 14] = [32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384];
const BITRATES_V1_L3: [u32; 14] = [32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
const BITRATES_V2_L1: [u32; 14] = [32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256];
const BITRATES_V2_L23: [u32; 14] = [8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

/// A decoded 4-byte MPEG audio frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: MpegVersion,
    pub layer: MpegLayer,
    pub bitrate_kbps: u32,
    pub sample_rate: u32,
    pub padding: bool,
    pub channels: u16,
}

impl FrameHeader {
    /// Parse a frame header, rejecting reserved and free-format values.
    pub fn parse(bytes: [u8; 4]) -> Option<Self> {
        if bytes[0] != 0xFF || bytes[1] & 0xE0 != 0xE0 {
            return None;
        }
        let version = match (bytes[1] >> 3) & 0x03 {
            0 => MpegVersion::V25,
            2 => MpegVersion::V2,
            3 => MpegVersion::V1,
            _ => return None,
        };
        let layer = match (bytes[1] >> 1) & 0x03 {
            1 => MpegLayer::III,
            2 => MpegLayer::II,
            3 => MpegLayer::I,
            _ => return None,
        };
        let bitrate_index = (bytes[2] >> 4) as usize;
        if bitrate_index == 0 || bitrate_index == 15 {
            return None;
        }
        let table = match (version, layer) {
            (MpegVersion::V1, MpegLayer::I) => &BITRATES_V1_L1,
            (MpegVersion::V1, MpegLayer::II) => &BITRATES_V1_L2,
            (MpegVersion::V1, MpegLayer::III) => &BITRATES_V1_L3,
            (_, MpegLayer::I) => &BITRATES_V2_L1,
            (_, _) => &BITRATES_V2_L23,
        };
        let base_rate = match (bytes[2] >> 2) & 0x03 {
            0 => 44_100,
            1 => 48_000,
            2 => 32_000,
            _ => return None,
        };
        let sample_rate = match version {
            MpegVersion::V1 => base_rate,
            MpegVersion::V2 => base_rate / 2,
            MpegVersion::V25 => base_rate / 4,
        };
        if bytes[3] & 0x03 == 2 {
            return None;
        }
        let channels = if bytes[3] >> 6 == 3 { 1 } else { 2 };
        Some(Self {
            version,
            layer,
            bitrate_kbps: table[bitrate_index - 1],
            sample_rate,
            padding: bytes[2] & 0x02 != 0,
            channels,
        })
    }

    /// Total frame length in bytes, header included.
    pub fn frame_len(&self) -> usize {
        let br = self.bitrate_kbps * 1000;
        let sr = self.sample_rate;
        let pad = self.padding as u32;
        let len = match (self.layer, self.version) {
            (MpegLayer::I, _) => (12 * br / sr + pad) * 4,
            (MpegLayer::II, _) | (MpegLayer::III, MpegVersion::V1) => 144 * br / sr + pad,
            (MpegLayer::III, _) => 72 * br / sr + pad,
        };
        len as usize
    }

    pub fn samples_per_frame(&self) -> u32 {
        match (self.layer, self.version) {
            (MpegLayer::I, _) => 384,
            (MpegLayer::II, _) | (MpegLayer::III, MpegVersion::V1) => 1152,
            (MpegLayer::III, _) => 576,
        }
    }

    /// Whether this frame continues the stream described by `format`.
    pub fn matches_format(&self, format: &StreamFormat) -> bool {
        format.codec == (Codec::Mpeg { layer: self.layer })
            && format.sample_rate == self.sample_rate
            && format.channels == self.channels
    }

    fn stream_format(&self, data_offset: u64) -> StreamFormat {
        StreamFormat {
            codec: Codec::Mpeg { layer: self.layer },
            sample_rate: self.sample_rate,
            channels: self.channels,
            bits_per_sample: 0,
            bytes_per_frame: 0,
            frames_per_packet: self.samples_per_frame(),
            bytes_per_packet: 0,
            data_offset,
            audio_bytes: None,
        }
    }
}

/// Size of a leading ID3v2 tag, if `buf` starts with a complete tag header.
fn id3v2_len(buf: &[u8]) -> Option<u64> {
    if buf.len() < 10 || &buf[..3] != b"ID3" {
        return None;
    }
    let size = buf[6..10]
        .iter()
        .fold(0u64, |acc, b| (acc << 7) | (*b as u64 & 0x7F));
    let footer = if buf[5] & 0x10 != 0 { 10 } else { 0 };
    Some(10 + size + footer)
}

pub(crate) struct MpegState {
    max_resync_bytes: usize,
    /// Bytes discarded since the last valid frame, with the offset where scanning began.
    scan: Option<(u64, usize)>,
}

impl MpegState {
    pub(crate) fn new(max_resync_bytes: usize) -> Self {
        Self {
            max_resync_bytes,
            scan: None,
        }
    }

    pub(crate) fn discontinuity(&mut self) {
        self.scan = None;
    }

    pub(crate) fn step(
        &mut self,
        buf: &[u8],
        offset: u64,
        format: Option<&StreamFormat>,
        _eos: bool,
    ) -> Result<Step, ParseError> {
        if format.is_none() && buf.starts_with(b"ID3") {
            return Ok(match id3v2_len(buf) {
                Some(len) => {
                    tracing::debug!(offset, len, "skipping ID3v2 tag");
                    Step::Skip(len)
                }
                None => Step::Need,
            });
        }
        if buf.len() < 4 {
            return Ok(Step::Need);
        }

        let header = FrameHeader::parse([buf[0], buf[1], buf[2], buf[3]])
            .filter(|h| format.is_none_or(|f| h.matches_format(f)));
        let Some(header) = header else {
            return self.resync(buf, offset);
        };

        if let Some((start, scanned)) = self.scan.take() {
            tracing::debug!(start, scanned, "regained frame sync");
        }
        if format.is_none() {
            return Ok(Step::Format {
                format: header.stream_format(offset),
                consume: 0,
            });
        }
        let len = header.frame_len();
        if buf.len() < len {
            return Ok(Step::Need);
        }
        Ok(Step::Packet {
            len,
            frames: header.samples_per_frame(),
        })
    }

    fn resync(&mut self, buf: &[u8], offset: u64) -> Result<Step, ParseError> {
        let skip = buf[1..]
            .iter()
            .position(|b| *b == 0xFF)
            .map(|p| p + 1)
            .unwrap_or(buf.len());
        let (start, scanned) = self.scan.get_or_insert((offset, 0));
        *scanned += skip;
        if *scanned > self.max_resync_bytes {
            return Err(ParseError::LostSync {
                offset: *start,
                scanned: *scanned,
            });
        }
        Ok(Step::Skip(skip as u64))
    }
}
