//! Linux host board: audio from ALSA or the virtual codec, the LED as log
//! lines, the display forwarded to a GUI process.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Value, json};

use super::{AudioCodec, Board, Display, Led};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedState {
    pub color: (u8, u8, u8),
    pub on: bool,
    pub blink_interval_ms: Option<u32>,
}

/// LED without hardware: tracks its state and logs changes.
#[derive(Default)]
pub struct LogLed {
    state: Mutex<LedState>,
}

impl LogLed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LedState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut LedState)) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state);
        log::debug!("LED: {:?}", *state);
    }
}

impl Led for LogLed {
    fn set_color(&self, r: u8, g: u8, b: u8) {
        self.update(|s| s.color = (r, g, b));
    }

    fn turn_on(&self) {
        self.update(|s| {
            s.on = true;
            s.blink_interval_ms = None;
        });
    }

    fn turn_off(&self) {
        self.update(|s| {
            s.on = false;
            s.blink_interval_ms = None;
        });
    }

    fn blink_once(&self) {
        log::debug!("LED: blink");
    }

    fn start_continuous_blink(&self, interval_ms: u32) {
        self.update(|s| {
            s.on = true;
            s.blink_interval_ms = Some(interval_ms);
        });
    }
}

/// Display used when no GUI process is reachable.
pub struct LogDisplay;

impl Display for LogDisplay {
    fn set_status(&self, status: &str) {
        log::info!("[status] {}", status);
    }

    fn set_emotion(&self, emotion: &str) {
        log::info!("[emotion] {}", emotion);
    }

    fn set_chat_message(&self, role: &str, content: &str) {
        log::info!("[{}] {}", role, content);
    }

    fn show_notification(&self, notification: &str) {
        log::info!("[notification] {}", notification);
    }
}

pub struct LinuxBoard {
    codec: Arc<dyn AudioCodec>,
    led: Arc<dyn Led>,
    display: Arc<dyn Display>,
    client_id: String,
}

impl LinuxBoard {
    pub fn new(codec: Arc<dyn AudioCodec>, display: Arc<dyn Display>, client_id: String) -> Self {
        Self {
            codec,
            led: Arc::new(LogLed::new()),
            display,
            client_id,
        }
    }
}

impl Board for LinuxBoard {
    fn audio_codec(&self) -> Arc<dyn AudioCodec> {
        self.codec.clone()
    }

    fn led(&self) -> Arc<dyn Led> {
        self.led.clone()
    }

    fn display(&self) -> Arc<dyn Display> {
        self.display.clone()
    }

    fn set_power_save_mode(&self, enabled: bool) {
        log::debug!("Power save mode {}", if enabled { "on" } else { "off" });
    }

    fn board_json(&self) -> Value {
        json!({
            "uuid": self.client_id,
            "application": {
                "name": env!("APP_NAME"),
                "version": env!("APP_VERSION")
            },
            "ota": {},
            "board": {
                "type": env!("BOARD_TYPE"),
                "name": env!("BOARD_NAME")
            }
        })
    }
}
