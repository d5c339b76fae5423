//! Streaming mono resampler over rubato.
//!
//! Audio arrives in arbitrarily sized buffers; leftovers smaller than one
//! resampler chunk are carried over to the next call.

use anyhow::Result;
use rubato::{FftFixedIn, Resampler as RubatoResampler};

pub struct Resampler {
    input_rate: u32,
    output_rate: u32,
    inner: Option<Inner>,
}

struct Inner {
    resampler: FftFixedIn<f32>,
    pending: Vec<f32>,
}

impl Resampler {
    /// Equal rates give a pass-through resampler.
    pub fn new(input_rate: u32, output_rate: u32) -> Result<Self> {
        let inner = if input_rate == output_rate {
            None
        } else {
            // 10 ms chunks, 2 sub-chunks
            let chunk_size = (input_rate as usize / 100).max(1);
            let resampler =
                FftFixedIn::<f32>::new(input_rate as usize, output_rate as usize, chunk_size, 2, 1)?;
            log::debug!("Resampler {} -> {} Hz, chunk {}", input_rate, output_rate, chunk_size);
            Some(Inner {
                resampler,
                pending: Vec::with_capacity(chunk_size * 2),
            })
        };
        Ok(Self {
            input_rate,
            output_rate,
            inner,
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Rebuild only if the rate pair changed.
    pub fn configure(&mut self, input_rate: u32, output_rate: u32) -> Result<()> {
        if input_rate != self.input_rate || output_rate != self.output_rate {
            *self = Self::new(input_rate, output_rate)?;
        }
        Ok(())
    }

    pub fn process(&mut self, input: &[i16]) -> Result<Vec<i16>> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(input.to_vec());
        };

        inner
            .pending
            .extend(input.iter().map(|&s| f32::from(s) / 32768.0));

        let mut output = Vec::new();
        loop {
            let needed = inner.resampler.input_frames_next();
            if inner.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = inner.pending.drain(..needed).collect();
            let frames = inner.resampler.process(&[chunk], None)?;
            output.extend(
                frames[0]
                    .iter()
                    .map(|&s| (s * 32768.0).clamp(-32768.0, 32767.0) as i16),
            );
        }
        Ok(output)
    }

    pub fn reset(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            inner.resampler.reset();
            inner.pending.clear();
        }
    }
}
