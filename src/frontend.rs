//! Acoustic front-end contracts: wake word, voice activity and the echo
//! cancelling processor. Implementations live outside this crate; the
//! controller only feeds them 16 kHz PCM and reacts to what they report.

/// Something the wake-word engine noticed while being fed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontEndEvent {
    VadStateChanged { speaking: bool },
    WakeWordDetected(String),
}

pub trait WakeWordDetector: Send {
    /// Feed 16 kHz PCM, interleaved with the reference channel when present.
    fn feed(&mut self, pcm: &[i16]) -> Vec<FrontEndEvent>;
    fn is_detection_running(&self) -> bool;
    fn start_detection(&mut self);
    fn stop_detection(&mut self);
    /// Encode the audio buffered before the wake word.
    fn encode_wake_word_data(&mut self);
    /// Next encoded pre-wake frame, in capture order.
    fn take_wake_word_opus(&mut self) -> Option<Vec<u8>>;
}

/// Echo cancellation / noise suppression ahead of the encoder.
pub trait AudioProcessor: Send {
    fn start(&mut self);
    fn stop(&mut self);
    fn is_running(&self) -> bool;
    /// Process captured PCM and return whatever mono output is ready.
    fn process(&mut self, pcm: &[i16]) -> Vec<i16>;
}
