//! Streaming sample-rate conversion.
//!
//! Wraps Rubato's sinc resampler so it can be fed decoded packets of any size: input is
//! accumulated until a full chunk is available, and `flush` pads the final partial chunk.

use std::collections::VecDeque;

use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::error::{ConversionError, ConverterInitError};

pub struct StreamResampler {
    resampler: Async<f32>,
    channels: usize,
    chunk_frames: usize,
    /// Interleaved input waiting for a full chunk.
    input: Vec<f32>,
    /// Scratch for one chunk, used to pad the tail.
    chunk: Vec<f32>,
    output: Vec<f32>,
    indexing: Indexing,
}

impl StreamResampler {
    pub fn new(
        from_hz: u32,
        to_hz: u32,
        channels: usize,
        chunk_frames: usize,
    ) -> Result<Self, ConverterInitError> {
        let ratio = to_hz as f64 / from_hz as f64;
        let chunk_frames = chunk_frames.max(1);

        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };

        let resampler = Async::<f32>::new_sinc(
            ratio,
            1.1,
            &params,
            chunk_frames,
            channels,
            FixedAsync::Input,
        )
        .map_err(|e| ConverterInitError::Resampler(e.to_string()))?;

        let out_frames = (chunk_frames as f64 * ratio * 1.1).ceil() as usize + 16;
        tracing::debug!(from_hz, to_hz, chunk_frames, "resampler configured");
        Ok(Self {
            resampler,
            channels,
            chunk_frames,
            input: Vec::with_capacity(chunk_frames * channels * 2),
            chunk: vec![0.0; chunk_frames * channels],
            output: vec![0.0; out_frames * channels],
            indexing: Indexing {
                input_offset: 0,
                output_offset: 0,
                active_channels_mask: None,
                partial_len: None,
            },
        })
    }

    /// Input frames waiting for a full chunk.
    pub fn pending_frames(&self) -> usize {
        self.input.len() / self.channels
    }

    /// Resample every complete chunk in `input` + `samples`, appending to `out`.
    pub fn process(
        &mut self,
        samples: &[f32],
        out: &mut VecDeque<f32>,
    ) -> Result<(), ConversionError> {
        self.input.extend_from_slice(samples);
        let chunk_samples = self.chunk_frames * self.channels;
        let mut consumed = 0;
        while self.input.len() - consumed >= chunk_samples {
            let result = Self::run(
                &mut self.resampler,
                &self.input[consumed..consumed + chunk_samples],
                &mut self.output,
                &mut self.indexing,
                self.channels,
                self.chunk_frames,
                None,
            );
            let produced = match result {
                Ok(n) => n,
                Err(e) => {
                    self.input.drain(..consumed + chunk_samples);
                    return Err(e);
                }
            };
            out.extend(&self.output[..produced * self.channels]);
            consumed += chunk_samples;
        }
        self.input.drain(..consumed);
        Ok(())
    }

    /// Resample the buffered partial chunk, zero-padded.
    pub fn flush(&mut self, out: &mut VecDeque<f32>) -> Result<(), ConversionError> {
        let frames = self.pending_frames();
        if frames == 0 {
            return Ok(());
        }
        self.chunk.fill(0.0);
        self.chunk[..self.input.len()].copy_from_slice(&self.input);
        self.input.clear();
        let produced = Self::run(
            &mut self.resampler,
            &self.chunk,
            &mut self.output,
            &mut self.indexing,
            self.channels,
            self.chunk_frames,
            Some(frames),
        )?;
        out.extend(&self.output[..produced * self.channels]);
        Ok(())
    }

    /// Drop buffered input and filter history.
    pub fn reset(&mut self) {
        self.input.clear();
        self.resampler.reset();
    }

    fn run(
        resampler: &mut Async<f32>,
        input: &[f32],
        output: &mut [f32],
        indexing: &mut Indexing,
        channels: usize,
        chunk_frames: usize,
        partial_len: Option<usize>,
    ) -> Result<usize, ConversionError> {
        let input_adapter = InterleavedSlice::new(input, channels, chunk_frames)
            .map_err(|e| ConversionError::Resample(e.to_string()))?;
        let out_frames = output.len() / channels;
        let mut output_adapter = InterleavedSlice::new_mut(output, channels, out_frames)
            .map_err(|e| ConversionError::Resample(e.to_string()))?;

        indexing.input_offset = 0;
        indexing.output_offset = 0;
        indexing.partial_len = partial_len;

        let (_nbr_in, nbr_out) = resampler
            .process_into_buffer(&input_adapter, &mut output_adapter, Some(&*indexing))
            .map_err(|e| ConversionError::Resample(e.to_string()))?;
        Ok(nbr_out)
    }
}
