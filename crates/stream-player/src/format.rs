//! Stream and output format descriptions, plus format hints used to bind a parser.

use crate::error::{FormatOpenError, ParseError};
use crate::parser::mpeg::FrameHeader;

/// Bytes per output sample (`f32`).
pub const BYTES_PER_SAMPLE: usize = std::mem::size_of::<f32>();

/// MPEG audio layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MpegLayer {
    I,
    II,
    III,
}

/// Sample encoding of little-endian WAVE PCM data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PcmEncoding {
    Unsigned,
    Signed,
    Float,
}

/// Compressed representation carried by the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    Mpeg { layer: MpegLayer },
    Pcm { encoding: PcmEncoding },
    /// A WAVE `fmt ` tag we can describe but not decode.
    Unsupported { format_tag: u16 },
}

/// Description of the source stream, discovered once per session by the parser.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamFormat {
    pub codec: Codec,
    pub sample_rate: u32,
    pub channels: u16,
    /// Bits per source sample; `0` for compressed codecs.
    pub bits_per_sample: u16,
    /// Bytes per source frame; `0` when frames are not byte-addressable.
    pub bytes_per_frame: u32,
    pub frames_per_packet: u32,
    /// Bytes per packet; `0` when packets are variable-sized.
    pub bytes_per_packet: u32,
    /// Stream offset where audio data begins.
    pub data_offset: u64,
    /// Audio payload length when the container declares it.
    pub audio_bytes: Option<u64>,
}

impl StreamFormat {
    /// Rejects descriptors that would size buffers or converters with zeroes.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.sample_rate == 0 {
            return Err(ParseError::InvalidFormat("sample rate is zero"));
        }
        if self.channels == 0 {
            return Err(ParseError::InvalidFormat("channel count is zero"));
        }
        if self.frames_per_packet == 0 {
            return Err(ParseError::InvalidFormat("frames per packet is zero"));
        }
        Ok(())
    }

    /// Short codec label for logs and stats.
    pub fn codec_name(&self) -> &'static str {
        match self.codec {
            Codec::Mpeg {
                layer: MpegLayer::I,
            } => "MP1",
            Codec::Mpeg {
                layer: MpegLayer::II,
            } => "MP2",
            Codec::Mpeg {
                layer: MpegLayer::III,
            } => "MP3",
            Codec::Pcm {
                encoding: PcmEncoding::Float,
            } => "PCM_F",
            Codec::Pcm {
                encoding: PcmEncoding::Unsigned,
            } => "PCM_U",
            Codec::Pcm {
                encoding: PcmEncoding::Signed,
            } => "PCM_S",
            Codec::Unsupported { .. } => "UNSUPPORTED",
        }
    }
}

/// Negotiated output format: interleaved `f32`.
///
/// Every size derived from it is computed once when the converter is configured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: usize,
    pub bytes_per_frame: usize,
}

impl PcmFormat {
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        Self {
            sample_rate,
            channels,
            bytes_per_frame: channels * BYTES_PER_SAMPLE,
        }
    }

    /// Duration of `frames` in milliseconds.
    pub fn frames_to_ms(&self, frames: u64) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        frames.saturating_mul(1000) / self.sample_rate as u64
    }
}

/// Container families the parser understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerKind {
    Mpeg,
    Wave,
}

/// Hint used by `open()` to choose a parser.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FormatHint {
    Mpeg,
    Wave,
    /// MIME type as reported by the transfer (`Content-Type`).
    Mime(String),
    /// Leading stream bytes to sniff. The bytes are not consumed; feed them as usual.
    Header(Vec<u8>),
}

impl FormatHint {
    /// Resolve the hint to a container, failing for anything we cannot packetize.
    pub fn resolve(&self) -> Result<ContainerKind, FormatOpenError> {
        match self {
            FormatHint::Mpeg => Ok(ContainerKind::Mpeg),
            FormatHint::Wave => Ok(ContainerKind::Wave),
            FormatHint::Mime(mime) => container_for_mime(mime)
                .ok_or_else(|| FormatOpenError::UnsupportedMime(mime.clone())),
            FormatHint::Header(bytes) => sniff_container(bytes)
                .ok_or(FormatOpenError::UnrecognizedHeader { len: bytes.len() }),
        }
    }
}

fn container_for_mime(mime: &str) -> Option<ContainerKind> {
    let essence = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    match essence.as_str() {
        "audio/mpeg" | "audio/mp3" | "audio/mpeg3" | "audio/x-mpeg" | "audio/mpa" => {
            Some(ContainerKind::Mpeg)
        }
        "audio/wav" | "audio/x-wav" | "audio/wave" | "audio/vnd.wave" => Some(ContainerKind::Wave),
        _ => None,
    }
}

fn sniff_container(bytes: &[u8]) -> Option<ContainerKind> {
    if bytes.len() < 4 {
        return None;
    }
    if &bytes[..4] == b"RIFF" && (bytes.len() < 12 || &bytes[8..12] == b"WAVE") {
        return Some(ContainerKind::Wave);
    }
    if &bytes[..3] == b"ID3" {
        return Some(ContainerKind::Mpeg);
    }
    FrameHeader::parse([bytes[0], bytes[1], bytes[2], bytes[3]]).map(|_| ContainerKind::Mpeg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_hint_ignores_parameters_and_case() {
        let hint = FormatHint::Mime("Audio/MPEG; charset=binary".to_string());
        assert_eq!(hint.resolve(), Ok(ContainerKind::Mpeg));
        let hint = FormatHint::Mime("audio/x-wav".to_string());
        assert_eq!(hint.resolve(), Ok(ContainerKind::Wave));
    }

    #[test]
    fn unknown_mime_fails_to_open() {
        let hint = FormatHint::Mime("video/mp4".to_string());
        assert_eq!(
            hint.resolve(),
            Err(FormatOpenError::UnsupportedMime("video/mp4".to_string()))
        );
    }

    #[test]
    fn header_sniffing_recognizes_containers() {
        assert_eq!(
            FormatHint::Header(b"RIFF\0\0\0\0WAVE".to_vec()).resolve(),
            Ok(ContainerKind::Wave)
        );
        assert_eq!(
            FormatHint::Header(b"ID3\x04\0\0".to_vec()).resolve(),
            Ok(ContainerKind::Mpeg)
        );
        assert_eq!(
            FormatHint::Header(vec![0xFF, 0xFB, 0x90, 0x00]).resolve(),
            Ok(ContainerKind::Mpeg)
        );
    }

    #[test]
    fn malformed_four_byte_header_fails_to_open() {
        let hint = FormatHint::Header(vec![0x00, 0x11, 0x22, 0x33]);
        assert_eq!(
            hint.resolve(),
            Err(FormatOpenError::UnrecognizedHeader { len: 4 })
        );
    }

    #[test]
    fn validate_rejects_zero_rate_and_channels() {
        let mut format = StreamFormat {
            codec: Codec::Pcm {
                encoding: PcmEncoding::Signed,
            },
            sample_rate: 44_100,
            channels: 2,
            bits_per_sample: 16,
            bytes_per_frame: 4,
            frames_per_packet: 1024,
            bytes_per_packet: 4096,
            data_offset: 44,
            audio_bytes: None,
        };
        assert!(format.validate().is_ok());
        format.channels = 0;
        assert!(format.validate().is_err());
        format.channels = 2;
        format.sample_rate = 0;
        assert!(format.validate().is_err());
    }

    #[test]
    fn pcm_format_sizes_follow_channels() {
        let format = PcmFormat::new(48_000, 2);
        assert_eq!(format.bytes_per_frame, 8);
        assert_eq!(format.frames_to_ms(96_000), 2000);
    }
}
