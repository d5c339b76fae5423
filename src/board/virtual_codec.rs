//! Device-less audio codec. Capture is injected by the caller, rendered
//! buffers are kept for inspection, and an optional clock thread paces the
//! render path like a real output DMA would.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use super::{AudioCodec, AudioSignals};
use crate::config::AudioSettings;

/// Rendered buffers kept before the oldest are discarded.
const RENDER_HISTORY: usize = 256;

#[derive(Debug, Clone)]
pub struct VirtualCodecConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub input_channels: u16,
    pub output_channels: u16,
    pub input_reference: bool,
}

impl Default for VirtualCodecConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16000,
            output_sample_rate: 16000,
            input_channels: 1,
            output_channels: 1,
            input_reference: false,
        }
    }
}

impl From<&AudioSettings> for VirtualCodecConfig {
    fn from(settings: &AudioSettings) -> Self {
        Self {
            input_sample_rate: settings.input_sample_rate,
            output_sample_rate: settings.output_sample_rate,
            input_channels: settings.input_channels,
            output_channels: settings.output_channels,
            input_reference: settings.input_reference,
        }
    }
}

pub struct VirtualAudioCodec {
    config: VirtualCodecConfig,
    signals: Mutex<Option<AudioSignals>>,
    captured: Mutex<VecDeque<Vec<i16>>>,
    rendered: Mutex<VecDeque<Vec<i16>>>,
    input_enabled: AtomicBool,
    output_enabled: AtomicBool,
    volume: AtomicU8,
}

impl VirtualAudioCodec {
    pub fn new(config: VirtualCodecConfig) -> Self {
        Self {
            config,
            signals: Mutex::new(None),
            captured: Mutex::new(VecDeque::new()),
            rendered: Mutex::new(VecDeque::new()),
            input_enabled: AtomicBool::new(true),
            output_enabled: AtomicBool::new(true),
            volume: AtomicU8::new(70),
        }
    }

    /// Hand a captured buffer to the controller as if the mic produced it.
    pub fn push_input(&self, pcm: Vec<i16>) {
        if !self.input_enabled.load(Ordering::SeqCst) {
            return;
        }
        self.captured
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(pcm);
        if let Some(signals) = self.signals() {
            signals.input_ready();
        }
    }

    pub fn signal_output_ready(&self) {
        if let Some(signals) = self.signals() {
            signals.output_ready();
        }
    }

    /// Everything rendered since the last call.
    pub fn take_output(&self) -> Vec<Vec<i16>> {
        self.rendered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    pub fn volume(&self) -> u8 {
        self.volume.load(Ordering::SeqCst)
    }

    /// Raise output-ready every `period` until the codec is dropped.
    pub fn start_clock(self: &Arc<Self>, period: Duration) -> anyhow::Result<()> {
        let codec: Weak<Self> = Arc::downgrade(self);
        thread::Builder::new()
            .name("virtual-codec-clock".into())
            .spawn(move || {
                loop {
                    thread::sleep(period);
                    match codec.upgrade() {
                        Some(codec) => codec.signal_output_ready(),
                        None => break,
                    }
                }
            })?;
        Ok(())
    }

    fn signals(&self) -> Option<AudioSignals> {
        self.signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AudioCodec for VirtualAudioCodec {
    fn input_sample_rate(&self) -> u32 {
        self.config.input_sample_rate
    }

    fn output_sample_rate(&self) -> u32 {
        self.config.output_sample_rate
    }

    fn input_channels(&self) -> u16 {
        self.config.input_channels
    }

    fn output_channels(&self) -> u16 {
        self.config.output_channels
    }

    fn input_reference(&self) -> bool {
        self.config.input_reference
    }

    fn start(&self, signals: AudioSignals) -> anyhow::Result<()> {
        *self.signals.lock().unwrap_or_else(PoisonError::into_inner) = Some(signals);
        log::info!(
            "Virtual codec started: in {}Hz/{}ch, out {}Hz/{}ch",
            self.config.input_sample_rate,
            self.config.input_channels,
            self.config.output_sample_rate,
            self.config.output_channels
        );
        Ok(())
    }

    fn input_data(&self) -> Option<Vec<i16>> {
        self.captured
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn output_data(&self, pcm: Vec<i16>) {
        if !self.output_enabled.load(Ordering::SeqCst) {
            log::debug!("Output disabled, dropping {} samples", pcm.len());
            return;
        }
        let mut rendered = self.rendered.lock().unwrap_or_else(PoisonError::into_inner);
        if rendered.len() >= RENDER_HISTORY {
            rendered.pop_front();
        }
        rendered.push_back(pcm);
    }

    fn enable_input(&self, enable: bool) {
        self.input_enabled.store(enable, Ordering::SeqCst);
    }

    fn enable_output(&self, enable: bool) {
        if self.output_enabled.swap(enable, Ordering::SeqCst) != enable {
            log::debug!("Virtual codec output {}", if enable { "enabled" } else { "disabled" });
        }
    }

    fn output_enabled(&self) -> bool {
        self.output_enabled.load(Ordering::SeqCst)
    }

    fn set_output_volume(&self, volume: u8) {
        self.volume.store(volume.min(100), Ordering::SeqCst);
    }
}
