//! Packet-to-PCM conversion.
//!
//! A [`FormatConverter`] is configured once per session from the discovered
//! [`StreamFormat`]. It pulls compressed packets through [`PacketSource`], decodes them with
//! Symphonia, optionally resamples, and writes interleaved `f32` into [`PcmBuffer`]s.
//! Decoded samples that do not fit the current buffer are carried over to the next call.

use std::collections::VecDeque;

use symphonia::core::audio::{Channels, SampleBuffer};
use symphonia::core::codecs::{self, CodecParameters, CodecType, Decoder, DecoderOptions};
use symphonia::core::formats::Packet;

use crate::buffer::PcmBuffer;
use crate::config::ConverterConfig;
use crate::error::{ConversionError, ConverterInitError};
use crate::format::{Codec, MpegLayer, PcmEncoding, PcmFormat, StreamFormat};
use crate::parser::CompressedPacket;
use crate::resample::StreamResampler;

/// Supplies packets to the converter on demand.
pub trait PacketSource {
    /// The next packet in stream order, or `None` when no input is available right now.
    fn next_packet(&mut self) -> Option<CompressedPacket>;
}

impl PacketSource for VecDeque<CompressedPacket> {
    fn next_packet(&mut self) -> Option<CompressedPacket> {
        self.pop_front()
    }
}

pub struct FormatConverter {
    output: PcmFormat,
    decoder: Box<dyn Decoder>,
    sample_buf: Option<SampleBuffer<f32>>,
    sample_capacity: usize,
    resampler: Option<StreamResampler>,
    /// Decoded (and resampled) samples not yet written to a buffer.
    ready: VecDeque<f32>,
    failures: u32,
    packets: u64,
}

impl FormatConverter {
    pub fn configure(
        source: &StreamFormat,
        config: &ConverterConfig,
    ) -> Result<Self, ConverterInitError> {
        let params = codec_params(source)?;
        let decoder = symphonia::default::get_codecs().make(&params, &DecoderOptions::default())?;

        let channels = source.channels as usize;
        let output_rate = config
            .output_sample_rate
            .filter(|rate| *rate > 0)
            .unwrap_or(source.sample_rate);
        let resampler = if output_rate != source.sample_rate {
            Some(StreamResampler::new(
                source.sample_rate,
                output_rate,
                channels,
                config.resample_chunk_frames,
            )?)
        } else {
            None
        };

        let output = PcmFormat::new(output_rate, channels);
        tracing::info!(
            codec = source.codec_name(),
            source_hz = source.sample_rate,
            output_hz = output_rate,
            channels,
            resampling = resampler.is_some(),
            "converter configured"
        );
        Ok(Self {
            output,
            decoder,
            sample_buf: None,
            sample_capacity: 0,
            resampler,
            ready: VecDeque::new(),
            failures: 0,
            packets: 0,
        })
    }

    pub fn output_format(&self) -> PcmFormat {
        self.output
    }

    /// Fill `into` from carried-over samples and freshly pulled packets.
    ///
    /// Stops when `into` is full or `source` has nothing more right now. On a decode failure
    /// the failing packet is dropped and the error returned; frames already written stay in
    /// `into`.
    pub fn convert(
        &mut self,
        source: &mut dyn PacketSource,
        into: &mut PcmBuffer,
    ) -> Result<usize, ConversionError> {
        let start = into.frames();
        loop {
            into.fill_from(&mut self.ready);
            if into.is_full() {
                break;
            }
            let Some(packet) = source.next_packet() else {
                break;
            };
            match self.decode(&packet) {
                Ok(()) => {
                    self.failures = 0;
                    self.packets += 1;
                }
                Err(e) => {
                    self.failures = self.failures.saturating_add(1);
                    return Err(e);
                }
            }
        }
        Ok(into.frames() - start)
    }

    /// End of input: drain the resampler tail and write what fits into `into`.
    pub fn flush(&mut self, into: &mut PcmBuffer) -> Result<usize, ConversionError> {
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.flush(&mut self.ready)?;
        }
        let start = into.frames();
        into.fill_from(&mut self.ready);
        Ok(into.frames() - start)
    }

    /// Decoded samples still waiting for a buffer.
    pub fn has_pending(&self) -> bool {
        self.ready.len() >= self.output.channels
    }

    /// Start over after a discontinuity.
    ///
    /// Audio already decoded from complete packets is kept: the resampler's buffered input
    /// is flushed into the carry-over before its filter history is cleared. Only decoder
    /// state (such as the MP3 bit reservoir) is forgotten.
    pub fn reset(&mut self) -> Result<(), ConversionError> {
        self.decoder.reset();
        self.failures = 0;
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(());
        };
        let flushed = resampler.flush(&mut self.ready);
        resampler.reset();
        flushed
    }

    /// Packet failures since the last successful packet.
    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    pub fn packets_converted(&self) -> u64 {
        self.packets
    }

    fn decode(&mut self, packet: &CompressedPacket) -> Result<(), ConversionError> {
        let offset = packet.desc.offset;
        let pkt = Packet::new_from_slice(0, packet.ts, packet.desc.frames as u64, &packet.data);
        let decoded = self
            .decoder
            .decode(&pkt)
            .map_err(|source| ConversionError::Decode { offset, source })?;
        if decoded.frames() == 0 {
            return Ok(());
        }

        let spec = *decoded.spec();
        let found = spec.channels.count();
        if found != self.output.channels {
            return Err(ConversionError::ChannelMismatch {
                offset,
                found,
                expected: self.output.channels,
            });
        }

        let capacity = decoded.capacity();
        if self.sample_buf.is_none() || self.sample_capacity < capacity {
            self.sample_buf = Some(SampleBuffer::<f32>::new(capacity as u64, spec));
            self.sample_capacity = capacity;
        }
        let Some(sample_buf) = self.sample_buf.as_mut() else {
            return Ok(());
        };
        sample_buf.copy_interleaved_ref(decoded);

        match self.resampler.as_mut() {
            Some(resampler) => resampler.process(sample_buf.samples(), &mut self.ready)?,
            None => self.ready.extend(sample_buf.samples()),
        }
        Ok(())
    }
}

fn codec_params(format: &StreamFormat) -> Result<CodecParameters, ConverterInitError> {
    let mut params = CodecParameters::new();
    params
        .with_sample_rate(format.sample_rate)
        .with_channels(channel_mask(format.channels));

    match format.codec {
        Codec::Mpeg { layer } => {
            let codec = match layer {
                MpegLayer::I => codecs::CODEC_TYPE_MP1,
                MpegLayer::II => codecs::CODEC_TYPE_MP2,
                MpegLayer::III => codecs::CODEC_TYPE_MP3,
            };
            params.for_codec(codec);
        }
        Codec::Pcm { encoding } => {
            let channels = format.channels.max(1) as u32;
            let coded_bits = format.bytes_per_frame * 8 / channels;
            let codec = pcm_codec(encoding, coded_bits).ok_or_else(|| {
                ConverterInitError::Unsupported(format!(
                    "{coded_bits}-bit {encoding:?} PCM"
                ))
            })?;
            let valid_bits = match format.bits_per_sample as u32 {
                0 => coded_bits,
                bits => bits.min(coded_bits),
            };
            params
                .for_codec(codec)
                .with_bits_per_coded_sample(coded_bits)
                .with_bits_per_sample(valid_bits)
                .with_max_frames_per_packet(format.frames_per_packet as u64);
        }
        Codec::Unsupported { format_tag } => {
            return Err(ConverterInitError::Unsupported(format!(
                "wave format tag 0x{format_tag:04x}"
            )));
        }
    }
    Ok(params)
}

fn pcm_codec(encoding: PcmEncoding, bits: u32) -> Option<CodecType> {
    let codec = match (encoding, bits) {
        (PcmEncoding::Unsigned, 8) => codecs::CODEC_TYPE_PCM_U8,
        (PcmEncoding::Signed, 16) => codecs::CODEC_TYPE_PCM_S16LE,
        (PcmEncoding::Signed, 24) => codecs::CODEC_TYPE_PCM_S24LE,
        (PcmEncoding::Signed, 32) => codecs::CODEC_TYPE_PCM_S32LE,
        (PcmEncoding::Float, 32) => codecs::CODEC_TYPE_PCM_F32LE,
        (PcmEncoding::Float, 64) => codecs::CODEC_TYPE_PCM_F64LE,
        _ => return None,
    };
    Some(codec)
}

fn channel_mask(channels: u16) -> Channels {
    match channels {
        1 => Channels::FRONT_LEFT,
        2 => Channels::FRONT_LEFT | Channels::FRONT_RIGHT,
        n => Channels::from_bits_truncate((1u32 << n.min(26)) - 1),
    }
}
