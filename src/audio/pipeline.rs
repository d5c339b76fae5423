//! Adapts device-native PCM to the 16 kHz mono wire format and back.
//!
//! - Capture: deinterleave mic/reference → resample each → 16 kHz
//! - Render: Opus decode → resample to device rate → channel convert

use anyhow::Result;

use super::opus_codec::OpusDecoder;
use super::resampler::Resampler;
use crate::protocol::messages::WIRE_SAMPLE_RATE;

/// One captured buffer after rate adaptation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapturedAudio {
    pub mic: Vec<i16>,
    /// Echo reference, present for two-channel inputs.
    pub reference: Option<Vec<i16>>,
}

impl CapturedAudio {
    /// Mic and reference re-interleaved, or plain mic for mono input.
    pub fn interleaved(&self) -> Vec<i16> {
        match &self.reference {
            None => self.mic.clone(),
            Some(reference) => self
                .mic
                .iter()
                .zip(reference)
                .flat_map(|(&m, &r)| [m, r])
                .collect(),
        }
    }
}

pub struct InputPipeline {
    channels: u16,
    mic: Resampler,
    reference: Resampler,
}

impl InputPipeline {
    pub fn new(input_sample_rate: u32, channels: u16) -> Result<Self> {
        if !(1..=2).contains(&channels) {
            anyhow::bail!("Unsupported input channel count: {}", channels);
        }
        Ok(Self {
            channels,
            mic: Resampler::new(input_sample_rate, WIRE_SAMPLE_RATE)?,
            reference: Resampler::new(input_sample_rate, WIRE_SAMPLE_RATE)?,
        })
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Rebuild the resamplers only when the device rate changes.
    pub fn configure(&mut self, input_sample_rate: u32) -> Result<()> {
        self.mic.configure(input_sample_rate, WIRE_SAMPLE_RATE)?;
        self.reference.configure(input_sample_rate, WIRE_SAMPLE_RATE)?;
        Ok(())
    }

    pub fn process(&mut self, data: &[i16]) -> Result<CapturedAudio> {
        if self.channels == 1 {
            return Ok(CapturedAudio {
                mic: self.mic.process(data)?,
                reference: None,
            });
        }

        // Split interleaved → per-channel
        let frames = data.len() / 2;
        let mut mic = Vec::with_capacity(frames);
        let mut reference = Vec::with_capacity(frames);
        for pair in data.chunks_exact(2) {
            mic.push(pair[0]);
            reference.push(pair[1]);
        }

        let mut mic = self.mic.process(&mic)?;
        let mut reference = self.reference.process(&reference)?;
        // both resamplers see the same lengths, keep them paired regardless
        let len = mic.len().min(reference.len());
        mic.truncate(len);
        reference.truncate(len);

        Ok(CapturedAudio {
            mic,
            reference: Some(reference),
        })
    }
}

/// Decoder side of the pipeline, rebuilt when the negotiated rate changes.
pub struct OutputStage {
    decoder: OpusDecoder,
    resampler: Resampler,
    output_sample_rate: u32,
    output_channels: u16,
}

impl OutputStage {
    pub fn new(decode_sample_rate: u32, output_sample_rate: u32, output_channels: u16) -> Result<Self> {
        Ok(Self {
            decoder: OpusDecoder::new(decode_sample_rate)?,
            resampler: Resampler::new(decode_sample_rate, output_sample_rate)?,
            output_sample_rate,
            output_channels: output_channels.max(1),
        })
    }

    pub fn decode_sample_rate(&self) -> u32 {
        self.decoder.sample_rate()
    }

    /// Returns `true` if the decoder had to be rebuilt.
    pub fn set_decode_sample_rate(&mut self, sample_rate: u32) -> Result<bool> {
        if self.decoder.sample_rate() == sample_rate {
            return Ok(false);
        }
        self.decoder = OpusDecoder::new(sample_rate)?;
        self.resampler = Resampler::new(sample_rate, self.output_sample_rate)?;
        if sample_rate != self.output_sample_rate {
            log::info!(
                "Resampling audio from {} to {}",
                sample_rate,
                self.output_sample_rate
            );
        }
        Ok(true)
    }

    pub fn reset(&mut self) -> Result<()> {
        self.resampler.reset();
        self.decoder.reset_state()
    }

    /// Decode one frame into interleaved PCM ready for the device.
    pub fn decode(&mut self, opus_data: &[u8]) -> Result<Vec<i16>> {
        let pcm = self.decoder.decode(opus_data)?;
        let pcm = self.resampler.process(&pcm)?;
        Ok(convert_channels(&pcm, self.output_channels))
    }
}

/// Mono → `channels` by duplication.
pub fn convert_channels(mono: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return mono.to_vec();
    }
    let channels = channels as usize;
    let mut out = vec![0i16; mono.len() * channels];
    for (frame, &sample) in out.chunks_exact_mut(channels).zip(mono) {
        frame.fill(sample);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::opus_codec::OpusEncoder;

    #[test]
    fn test_mono_16k_passthrough() {
        let mut input = InputPipeline::new(16000, 1).unwrap();
        let data: Vec<i16> = (0..320).map(|i| i as i16).collect();
        let captured = input.process(&data).unwrap();
        assert_eq!(captured.mic, data);
        assert!(captured.reference.is_none());
        assert_eq!(captured.interleaved(), data);
    }

    #[test]
    fn test_stereo_deinterleaves_mic_and_reference() {
        let mut input = InputPipeline::new(16000, 2).unwrap();
        let data: Vec<i16> = (0..100).flat_map(|i| [i as i16, -(i as i16)]).collect();
        let captured = input.process(&data).unwrap();
        assert_eq!(captured.mic, (0..100).map(|i| i as i16).collect::<Vec<_>>());
        assert_eq!(
            captured.reference.as_deref(),
            Some(&(0..100).map(|i| -(i as i16)).collect::<Vec<_>>()[..])
        );
        assert_eq!(captured.interleaved(), data);
    }

    #[test]
    fn test_stereo_resampled_streams_stay_paired() {
        let mut input = InputPipeline::new(48000, 2).unwrap();
        let captured = input.process(&vec![100i16; 4800 * 2]).unwrap();
        let reference = captured.reference.unwrap();
        assert_eq!(captured.mic.len(), reference.len());
        assert!(!captured.mic.is_empty());
    }

    #[test]
    fn test_rejects_three_channels() {
        assert!(InputPipeline::new(16000, 3).is_err());
    }

    #[test]
    fn test_convert_channels_duplicates() {
        assert_eq!(convert_channels(&[1, 2, 3], 2), vec![1, 1, 2, 2, 3, 3]);
        assert_eq!(convert_channels(&[1, 2], 1), vec![1, 2]);
    }

    #[test]
    fn test_output_stage_decodes_to_device_format() {
        let mut encoder = OpusEncoder::new(16000, 60).unwrap();
        let packet = encoder.encode(&vec![0i16; 960]).unwrap().remove(0);

        let mut stage = OutputStage::new(16000, 16000, 2).unwrap();
        let pcm = stage.decode(&packet).unwrap();
        assert_eq!(pcm.len(), 960 * 2);
    }

    #[test]
    fn test_set_decode_sample_rate_rebuilds_once() {
        let mut stage = OutputStage::new(16000, 24000, 1).unwrap();
        assert!(!stage.set_decode_sample_rate(16000).unwrap());
        assert!(stage.set_decode_sample_rate(24000).unwrap());
        assert_eq!(stage.decode_sample_rate(), 24000);
        assert!(!stage.set_decode_sample_rate(24000).unwrap());
    }
}
