//! Hardware capabilities the session controller drives.
//!
//! One implementation per target; the controller only sees these traits.

pub mod gui_display;
pub mod linux;
pub mod virtual_codec;
#[cfg(feature = "alsa")]
pub mod alsa_codec;

use std::sync::Arc;

use serde_json::Value;

use crate::event_group::{AUDIO_INPUT_READY_EVENT, AUDIO_OUTPUT_READY_EVENT, EventGroup};

pub const DEFAULT_BRIGHTNESS: u8 = 16;
pub const HIGH_BRIGHTNESS: u8 = 255;
pub const LOW_BRIGHTNESS: u8 = 2;

/// Readiness signals the audio hardware raises. Each one sets a bit on the
/// event group, which takes a short mutex and wakes the controller; callers
/// on a realtime path should keep that in mind.
#[derive(Clone)]
pub struct AudioSignals {
    events: Arc<EventGroup>,
}

impl AudioSignals {
    pub fn new(events: Arc<EventGroup>) -> Self {
        Self { events }
    }

    /// Captured audio is waiting in [`AudioCodec::input_data`].
    pub fn input_ready(&self) {
        self.events.set(AUDIO_INPUT_READY_EVENT);
    }

    /// The render path can take another buffer.
    pub fn output_ready(&self) {
        self.events.set(AUDIO_OUTPUT_READY_EVENT);
    }
}

pub trait AudioCodec: Send + Sync {
    fn input_sample_rate(&self) -> u32;
    fn output_sample_rate(&self) -> u32;
    fn input_channels(&self) -> u16;
    fn output_channels(&self) -> u16;
    /// Second input channel carries the speaker reference.
    fn input_reference(&self) -> bool;

    /// Begin raising readiness signals.
    fn start(&self, signals: AudioSignals) -> anyhow::Result<()>;

    /// Next captured buffer, interleaved at the native format.
    fn input_data(&self) -> Option<Vec<i16>>;
    /// Queue interleaved PCM at the native output format.
    fn output_data(&self, pcm: Vec<i16>);

    fn enable_input(&self, enable: bool);
    fn enable_output(&self, enable: bool);
    fn output_enabled(&self) -> bool;
    fn set_output_volume(&self, volume: u8);
}

pub trait Led: Send + Sync {
    fn set_color(&self, r: u8, g: u8, b: u8);
    fn turn_on(&self);
    fn turn_off(&self);
    fn blink_once(&self);
    fn start_continuous_blink(&self, interval_ms: u32);

    fn set_red(&self, brightness: u8) {
        self.set_color(brightness, 0, 0);
    }

    fn set_green(&self, brightness: u8) {
        self.set_color(0, brightness, 0);
    }

    fn set_blue(&self, brightness: u8) {
        self.set_color(0, 0, brightness);
    }
}

pub trait Display: Send + Sync {
    fn set_status(&self, status: &str);
    fn set_emotion(&self, emotion: &str);
    fn set_chat_message(&self, role: &str, content: &str);
    fn show_notification(&self, notification: &str);
    fn set_icon(&self, _icon: &str) {}
}

pub trait Board: Send + Sync {
    fn audio_codec(&self) -> Arc<dyn AudioCodec>;
    fn led(&self) -> Arc<dyn Led>;
    fn display(&self) -> Arc<dyn Display>;
    fn set_power_save_mode(&self, enabled: bool);
    /// Board descriptor posted with the version check.
    fn board_json(&self) -> Value;
}
