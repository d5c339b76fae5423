//! audio - Opus codec and format adaptation between device PCM and the wire
//!
//! The wire side is always 16 kHz mono in 60 ms Opus frames; devices may run
//! at any rate with one or two (mic + echo reference) input channels.

pub mod opus_codec;
pub mod p3;
pub mod pipeline;
pub mod resampler;

pub use opus_codec::{OpusDecoder, OpusEncoder};
pub use pipeline::{CapturedAudio, InputPipeline, OutputStage};
pub use resampler::Resampler;
