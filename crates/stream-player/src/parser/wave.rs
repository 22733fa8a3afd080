//! RIFF/WAVE containers carrying little-endian PCM.

use super::Step;
use crate::error::ParseError;
use crate::format::{Codec, PcmEncoding, StreamFormat};

const WAVE_FORMAT_PCM: u16 = 0x0001;
const WAVE_FORMAT_IEEE_FLOAT: u16 = 0x0003;
const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;
const MAX_FMT_LEN: u32 = 1024;
/// `data` sizes that mean "until the stream ends" (live or unfinalized captures).
const UNBOUNDED_SIZES: [u32; 2] = [0, u32::MAX];

#[derive(Clone, Copy, Debug)]
struct FmtChunk {
    codec: Codec,
    channels: u16,
    sample_rate: u32,
    block_align: u16,
    bits_per_sample: u16,
}

#[derive(Debug)]
enum Phase {
    Riff,
    Chunks,
    Data { remaining: Option<u64> },
    Done,
}

pub(crate) struct WaveState {
    packet_frames: u32,
    phase: Phase,
    fmt: Option<FmtChunk>,
}

impl WaveState {
    pub(crate) fn new(packet_frames: u32) -> Self {
        Self {
            packet_frames,
            phase: Phase::Riff,
            fmt: None,
        }
    }

    /// Data that follows a discontinuity is treated as raw sample data; the declared
    /// remaining length no longer applies.
    pub(crate) fn discontinuity(&mut self) {
        match &mut self.phase {
            Phase::Data { remaining } => *remaining = None,
            Phase::Done => {}
            phase => {
                *phase = Phase::Riff;
                self.fmt = None;
            }
        }
    }

    pub(crate) fn step(
        &mut self,
        buf: &[u8],
        offset: u64,
        _format: Option<&StreamFormat>,
        eos: bool,
    ) -> Result<Step, ParseError> {
        match self.phase {
            Phase::Riff => {
                if buf.len() < 12 {
                    return Ok(Step::Need);
                }
                if &buf[..4] != b"RIFF" || &buf[8..12] != b"WAVE" {
                    return Err(ParseError::BadMagic);
                }
                self.phase = Phase::Chunks;
                Ok(Step::Skip(12))
            }
            Phase::Chunks => self.chunk(buf, offset),
            Phase::Data { remaining } => Ok(self.data(buf, remaining, eos)),
            Phase::Done => Ok(Step::Skip(buf.len() as u64)),
        }
    }

    fn chunk(&mut self, buf: &[u8], offset: u64) -> Result<Step, ParseError> {
        if buf.len() < 8 {
            return Ok(Step::Need);
        }
        let id = [buf[0], buf[1], buf[2], buf[3]];
        let size = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        match &id {
            b"fmt " => {
                if size < 16 {
                    return Err(ParseError::MalformedChunk {
                        chunk: "fmt",
                        reason: "shorter than 16 bytes",
                    });
                }
                if size > MAX_FMT_LEN {
                    return Err(ParseError::MalformedChunk {
                        chunk: "fmt",
                        reason: "unreasonably large",
                    });
                }
                let body_len = size as usize;
                if buf.len() < 8 + body_len {
                    return Ok(Step::Need);
                }
                let fmt = parse_fmt(&buf[8..8 + body_len])?;
                tracing::debug!(?fmt, "wave fmt chunk");
                self.fmt = Some(fmt);
                Ok(Step::Skip(8 + padded(size)))
            }
            b"data" => {
                let fmt = self.fmt.ok_or(ParseError::DataBeforeFormat)?;
                let remaining = (!UNBOUNDED_SIZES.contains(&size)).then_some(size as u64);
                self.phase = Phase::Data { remaining };
                Ok(Step::Format {
                    format: StreamFormat {
                        codec: fmt.codec,
                        sample_rate: fmt.sample_rate,
                        channels: fmt.channels,
                        bits_per_sample: fmt.bits_per_sample,
                        bytes_per_frame: fmt.block_align as u32,
                        frames_per_packet: self.packet_frames,
                        bytes_per_packet: self.packet_frames * fmt.block_align as u32,
                        data_offset: offset + 8,
                        audio_bytes: remaining,
                    },
                    consume: 8,
                })
            }
            other => {
                tracing::trace!(
                    chunk = %String::from_utf8_lossy(other),
                    size,
                    "skipping wave chunk"
                );
                Ok(Step::Skip(8 + padded(size)))
            }
        }
    }

    fn data(&mut self, buf: &[u8], remaining: Option<u64>, eos: bool) -> Step {
        let Some(fmt) = self.fmt else {
            return Step::Need;
        };
        let block = fmt.block_align as usize;
        let packet_bytes = self.packet_frames as usize * block;
        let target = match remaining {
            Some(left) => (left.min(packet_bytes as u64) as usize) / block * block,
            None => packet_bytes,
        };
        if target == 0 {
            self.phase = Phase::Done;
            return Step::Skip(buf.len() as u64);
        }

        let len = if buf.len() >= target {
            target
        } else if eos {
            buf.len() / block * block
        } else {
            0
        };
        if len == 0 {
            return Step::Need;
        }
        if let Some(left) = remaining {
            self.phase = Phase::Data {
                remaining: Some(left - len as u64),
            };
        }
        Step::Packet {
            len,
            frames: (len / block) as u32,
        }
    }
}

fn padded(size: u32) -> u64 {
    size as u64 + (size as u64 & 1)
}

fn parse_fmt(body: &[u8]) -> Result<FmtChunk, ParseError> {
    let u16_at = |at: usize| u16::from_le_bytes([body[at], body[at + 1]]);
    let u32_at = |at: usize| u32::from_le_bytes([body[at], body[at + 1], body[at + 2], body[at + 3]]);

    let mut tag = u16_at(0);
    let channels = u16_at(2);
    let sample_rate = u32_at(4);
    let block_align = u16_at(12);
    let bits_per_sample = u16_at(14);

    if tag == WAVE_FORMAT_EXTENSIBLE {
        if body.len() < 26 {
            return Err(ParseError::MalformedChunk {
                chunk: "fmt",
                reason: "extensible format without sub-format",
            });
        }
        tag = u16_at(24);
    }
    if channels == 0 {
        return Err(ParseError::InvalidFormat("channel count is zero"));
    }
    if sample_rate == 0 {
        return Err(ParseError::InvalidFormat("sample rate is zero"));
    }
    if block_align == 0 {
        return Err(ParseError::InvalidFormat("block align is zero"));
    }

    let codec = match tag {
        WAVE_FORMAT_PCM if bits_per_sample == 8 => Codec::Pcm {
            encoding: PcmEncoding::Unsigned,
        },
        WAVE_FORMAT_PCM => Codec::Pcm {
            encoding: PcmEncoding::Signed,
        },
        WAVE_FORMAT_IEEE_FLOAT => Codec::Pcm {
            encoding: PcmEncoding::Float,
        },
        format_tag => Codec::Unsupported { format_tag },
    };
    Ok(FmtChunk {
        codec,
        channels,
        sample_rate,
        block_align,
        bits_per_sample,
    })
}
