//! Opus encoder/decoder wrappers for the wire format.
//!
//! - Encoder: 16 kHz mono PCM → accumulate → one Opus packet per 60 ms frame
//! - Decoder: Opus packet → mono PCM at the negotiated sample rate

use anyhow::Result;

/// Largest packet libopus will produce for one frame.
const MAX_PACKET_SIZE: usize = 4000;
/// 120 ms at 48 kHz, the longest frame Opus can carry.
const MAX_FRAME_SAMPLES: usize = 5760;

// ======================== Opus Encoder ========================

pub struct OpusEncoder {
    encoder: opus::Encoder,
    sample_rate: u32,
    duration_ms: u32,
    pending: Vec<i16>,
}

impl OpusEncoder {
    /// * `sample_rate` - Opus codec sample rate (16000 on the wire)
    /// * `duration_ms` - Frame duration in ms (60 on the wire)
    pub fn new(sample_rate: u32, duration_ms: u32) -> Result<Self> {
        let encoder = opus::Encoder::new(sample_rate, opus::Channels::Mono, opus::Application::Voip)?;
        Ok(Self {
            encoder,
            sample_rate,
            duration_ms,
            pending: Vec::new(),
        })
    }

    /// Samples per encoded frame.
    pub fn frame_size(&self) -> usize {
        (self.sample_rate * self.duration_ms / 1000) as usize
    }

    /// Buffer `pcm` and encode every complete frame, in order.
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<Vec<u8>>> {
        self.pending.extend_from_slice(pcm);

        let frame_size = self.frame_size();
        let mut packets = Vec::new();
        while self.pending.len() >= frame_size {
            let mut opus_buf = vec![0u8; MAX_PACKET_SIZE];
            let encoded_len = self
                .encoder
                .encode(&self.pending[..frame_size], &mut opus_buf)?;
            self.pending.drain(..frame_size);
            opus_buf.truncate(encoded_len);
            packets.push(opus_buf);
        }
        Ok(packets)
    }

    pub fn reset_state(&mut self) -> Result<()> {
        self.pending.clear();
        self.encoder.reset_state()?;
        Ok(())
    }
}

// ======================== Opus Decoder ========================

pub struct OpusDecoder {
    decoder: opus::Decoder,
    sample_rate: u32,
}

impl OpusDecoder {
    pub fn new(sample_rate: u32) -> Result<Self> {
        let decoder = opus::Decoder::new(sample_rate, opus::Channels::Mono)?;
        Ok(Self {
            decoder,
            sample_rate,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Decode one packet to mono PCM at `sample_rate()`.
    pub fn decode(&mut self, opus_data: &[u8]) -> Result<Vec<i16>> {
        // libopus reads an empty packet as a loss and synthesizes audio
        anyhow::ensure!(!opus_data.is_empty(), "Empty opus packet");
        let mut pcm = vec![0i16; MAX_FRAME_SAMPLES];
        let decoded = self.decoder.decode(opus_data, &mut pcm, false)?;
        pcm.truncate(decoded);
        Ok(pcm)
    }

    pub fn reset_state(&mut self) -> Result<()> {
        self.decoder.reset_state()?;
        Ok(())
    }
}
