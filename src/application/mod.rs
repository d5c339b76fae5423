//! Session controller.
//!
//! [`Application`] lives on one thread and owns the chat state, the protocol
//! session and the codec state. Other threads reach it only through an
//! [`AppHandle`]: they schedule closures, raise audio readiness bits, or push
//! server audio into the decode queue.

mod handlers;
mod handle;
mod state;


use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde_json::Value;

pub use handle::{AppHandle, Task};
pub use state::ChatState;

use crate::audio::{InputPipeline, OpusEncoder, OutputStage, p3};
use crate::background_task::BackgroundTask;
use crate::board::{
    AudioCodec, Board, DEFAULT_BRIGHTNESS, Display, HIGH_BRIGHTNESS, LOW_BRIGHTNESS, Led,
};
use crate::config::{AlertSettings, SessionSettings};
use crate::event_group::{
    AUDIO_INPUT_READY_EVENT, AUDIO_OUTPUT_READY_EVENT, SCHEDULE_EVENT, SHUTDOWN_EVENT,
};
use crate::frontend::{AudioProcessor, FrontEndEvent, WakeWordDetector};
use crate::iot::{NoThings, ThingRegistry, diff_states};
use crate::protocol::messages::{OPUS_FRAME_DURATION_MS, WIRE_SAMPLE_RATE};
use crate::protocol::{AbortReason, ListeningMode, Protocol};

const LOOP_EVENTS: u32 =
    SCHEDULE_EVENT | AUDIO_INPUT_READY_EVENT | AUDIO_OUTPUT_READY_EVENT | SHUTDOWN_EVENT;

pub struct Application {
    handle: AppHandle,
    board: Arc<dyn Board>,
    codec: Arc<dyn AudioCodec>,
    display: Arc<dyn Display>,
    led: Arc<dyn Led>,
    protocol: Option<Box<dyn Protocol>>,
    things: Arc<dyn ThingRegistry>,
    wake_word: Option<Box<dyn WakeWordDetector>>,
    processor: Option<Box<dyn AudioProcessor>>,
    background: BackgroundTask,

    chat_state: ChatState,
    keep_listening: bool,
    /// Checked by queued decode jobs; set on abort, cleared on tts start.
    aborted: Arc<AtomicBool>,

    input: InputPipeline,
    encoder: Arc<Mutex<OpusEncoder>>,
    output: Arc<Mutex<OutputStage>>,
    last_iot_states: Option<Value>,

    session: SessionSettings,
    alerts: AlertSettings,
}

impl Application {
    pub fn new(
        handle: AppHandle,
        board: Arc<dyn Board>,
        session: SessionSettings,
        alerts: AlertSettings,
    ) -> anyhow::Result<Self> {
        let codec = board.audio_codec();
        let input = InputPipeline::new(codec.input_sample_rate(), codec.input_channels())
            .context("Failed to set up capture pipeline")?;
        // Until a server negotiates a rate, decode at the device rate.
        let output = OutputStage::new(
            codec.output_sample_rate(),
            codec.output_sample_rate(),
            codec.output_channels(),
        )
        .context("Failed to set up render pipeline")?;
        let encoder = OpusEncoder::new(WIRE_SAMPLE_RATE, OPUS_FRAME_DURATION_MS)?;
        let background = BackgroundTask::new(session.background_warn_threshold)?;

        Ok(Self {
            display: board.display(),
            led: board.led(),
            codec,
            board,
            handle,
            protocol: None,
            things: Arc::new(NoThings),
            wake_word: None,
            processor: None,
            background,
            chat_state: ChatState::Unknown,
            keep_listening: false,
            aborted: Arc::new(AtomicBool::new(false)),
            input,
            encoder: Arc::new(Mutex::new(encoder)),
            output: Arc::new(Mutex::new(output)),
            last_iot_states: None,
            session,
            alerts,
        })
    }

    pub fn set_protocol(&mut self, protocol: Box<dyn Protocol>) {
        let handle = self.handle.clone();
        let board = self.board.clone();
        protocol.on_event(Arc::new(move |event| {
            handlers::on_protocol_event(&handle, board.as_ref(), event)
        }));
        self.protocol = Some(protocol);
    }

    pub fn set_things(&mut self, things: Arc<dyn ThingRegistry>) {
        self.things = things;
    }

    pub fn set_wake_word_detector(&mut self, detector: Box<dyn WakeWordDetector>) {
        self.wake_word = Some(detector);
    }

    pub fn set_audio_processor(&mut self, processor: Box<dyn AudioProcessor>) {
        self.processor = Some(processor);
    }

    pub fn handle(&self) -> &AppHandle {
        &self.handle
    }

    pub fn chat_state(&self) -> ChatState {
        self.chat_state
    }

    /// Start audio and settle into Idle. Call on the controller thread.
    pub fn start(&mut self) -> anyhow::Result<()> {
        self.led.set_blue(DEFAULT_BRIGHTNESS);
        self.led.start_continuous_blink(100);

        self.codec
            .start(self.handle.audio_signals())
            .context("Failed to start audio codec")?;

        if let Some(detector) = self.wake_word.as_mut() {
            detector.start_detection();
        }

        self.display.set_status("standby");
        self.led.set_green(DEFAULT_BRIGHTNESS);
        self.led.blink_once();

        self.set_chat_state(ChatState::Idle);
        Ok(())
    }

    /// Event loop. Returns once [`AppHandle::shutdown`] is called.
    pub fn run(&mut self) {
        while self.poll_once(None) {}

        if let Some(protocol) = self.protocol.as_mut() {
            protocol.close_audio_channel();
        }
        log::info!("Controller loop stopped");
    }

    /// One loop iteration. Returns `false` on shutdown.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> bool {
        let events = self.handle.events();
        let bits = match timeout {
            Some(timeout) => events.wait_timeout(LOOP_EVENTS, timeout),
            None => events.wait(LOOP_EVENTS),
        };

        if bits & SHUTDOWN_EVENT != 0 {
            return false;
        }
        if bits & AUDIO_INPUT_READY_EVENT != 0 {
            self.input_audio();
        }
        if bits & AUDIO_OUTPUT_READY_EVENT != 0 {
            self.output_audio();
        }
        if bits & SCHEDULE_EVENT != 0 {
            for task in self.handle.take_tasks() {
                task(self);
            }
        }
        true
    }

    pub fn toggle_chat_state(&mut self) {
        if self.protocol.is_none() {
            log::error!("Protocol not initialized");
            return;
        }

        match self.chat_state {
            ChatState::Idle => {
                self.set_chat_state(ChatState::Connecting);
                if !self.open_audio_channel() {
                    self.alert("Error", "Failed to open audio channel");
                    self.set_chat_state(ChatState::Idle);
                    return;
                }

                self.keep_listening = true;
                self.send(|p| p.send_start_listening(ListeningMode::AutoStop));
                self.set_chat_state(ChatState::Listening);
            }
            ChatState::Speaking => self.abort_speaking(AbortReason::None),
            ChatState::Listening => self.send(|p| p.close_audio_channel()),
            _ => {}
        }
    }

    pub fn start_listening(&mut self) {
        if self.protocol.is_none() {
            log::error!("Protocol not initialized");
            return;
        }

        self.keep_listening = false;
        match self.chat_state {
            ChatState::Idle => {
                let opened = self
                    .protocol
                    .as_ref()
                    .is_some_and(|p| p.is_audio_channel_opened());
                if !opened {
                    self.set_chat_state(ChatState::Connecting);
                    if !self.open_audio_channel() {
                        self.set_chat_state(ChatState::Idle);
                        self.alert("Error", "Failed to open audio channel");
                        return;
                    }
                }
                self.send(|p| p.send_start_listening(ListeningMode::ManualStop));
                self.set_chat_state(ChatState::Listening);
            }
            ChatState::Speaking => {
                self.abort_speaking(AbortReason::None);
                self.send(|p| p.send_start_listening(ListeningMode::ManualStop));
                // let the speaker drain what it already has
                thread::sleep(self.session.listen_settle());
                self.set_chat_state(ChatState::Listening);
            }
            _ => {}
        }
    }

    pub fn stop_listening(&mut self) {
        if self.chat_state == ChatState::Listening {
            self.send(|p| p.send_stop_listening());
            self.set_chat_state(ChatState::Idle);
        }
    }

    pub fn abort_speaking(&mut self, reason: AbortReason) {
        log::info!("Abort speaking");
        self.aborted.store(true, Ordering::SeqCst);
        self.send(|p| p.send_abort_speaking(reason));
    }

    /// Switch state, wait for background codec work to drain, then apply the
    /// new state's entry actions.
    pub fn set_chat_state(&mut self, state: ChatState) {
        if state == ChatState::Unknown {
            log::error!("Invalid chat state: {}", state);
            return;
        }
        if self.chat_state == state {
            return;
        }

        self.chat_state = state;
        self.handle.publish_state(state);
        log::info!("STATE: {}", state);
        self.background.wait_for_completion();

        match state {
            ChatState::Idle => {
                self.led.turn_off();
                self.display.set_status(state.as_str());
                self.display.set_emotion("neutral");
                if let Some(processor) = self.processor.as_mut() {
                    processor.stop();
                }
            }
            ChatState::Connecting => {
                self.led.set_blue(DEFAULT_BRIGHTNESS);
                self.led.turn_on();
                self.display.set_status(state.as_str());
            }
            ChatState::Listening => {
                self.led.set_red(DEFAULT_BRIGHTNESS);
                self.led.turn_on();
                self.display.set_status(state.as_str());
                self.display.set_emotion("neutral");
                self.reset_decoder();
                if let Err(e) = self
                    .encoder
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .reset_state()
                {
                    log::warn!("Failed to reset encoder: {:#}", e);
                }
                if let Some(processor) = self.processor.as_mut() {
                    processor.start();
                }
                self.update_iot_states();
            }
            ChatState::Speaking => {
                self.led.set_green(DEFAULT_BRIGHTNESS);
                self.led.turn_on();
                self.display.set_status(state.as_str());
                self.reset_decoder();
                if let Some(processor) = self.processor.as_mut() {
                    processor.stop();
                }
            }
            ChatState::Upgrading => {
                self.led.set_green(DEFAULT_BRIGHTNESS);
                self.led.start_continuous_blink(100);
            }
            ChatState::Unknown => {}
        }
    }

    /// Log, notify, and play the configured sound for `message` if any.
    pub fn alert(&mut self, title: &str, message: &str) {
        log::warn!("Alert: {}, {}", title, message);
        self.display.show_notification(message);

        if let Some(path) = self.alerts.sound_for(message).map(Path::to_path_buf) {
            if let Err(e) = self.play_local_file(&path) {
                log::warn!("Failed to play {}: {:#}", path.display(), e);
            }
        }
    }

    pub fn play_local_file(&mut self, path: &Path) -> anyhow::Result<()> {
        let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        self.play_p3(&data)
    }

    /// Queue a `.p3` stream for playback at 16 kHz.
    pub fn play_p3(&mut self, data: &[u8]) -> anyhow::Result<()> {
        let frames = p3::parse(data)?;
        log::info!("Playing {} local frames", frames.len());
        self.set_decode_sample_rate(WIRE_SAMPLE_RATE);
        self.codec.enable_output(true);

        let mut decode = self.handle.decode_queue();
        decode.frames.extend(frames);
        Ok(())
    }

    fn send<F>(&mut self, f: F)
    where
        F: FnOnce(&mut dyn Protocol),
    {
        match self.protocol.as_deref_mut() {
            Some(protocol) => f(protocol),
            None => log::error!("Protocol not initialized"),
        }
    }

    pub(crate) fn send_audio(&mut self, frame: &[u8]) {
        if let Some(protocol) = self.protocol.as_mut() {
            protocol.send_audio(frame);
        }
    }

    pub(crate) fn close_audio_channel(&mut self) {
        self.send(|p| p.close_audio_channel());
    }

    /// Open the session and apply what the server negotiated.
    fn open_audio_channel(&mut self) -> bool {
        let Some(protocol) = self.protocol.as_mut() else {
            return false;
        };
        if !protocol.open_audio_channel() {
            return false;
        }

        let server_rate = protocol.server_sample_rate();
        if server_rate != self.codec.output_sample_rate() {
            log::warn!(
                "Server sample rate {} differs from device output rate {}, resampling may distort",
                server_rate,
                self.codec.output_sample_rate()
            );
        }
        self.set_decode_sample_rate(server_rate);

        self.last_iot_states = None;
        let descriptors = self.things.descriptors_json();
        self.send(|p| p.send_iot_descriptors(&descriptors));
        true
    }

    fn set_decode_sample_rate(&mut self, sample_rate: u32) {
        let mut output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = output.set_decode_sample_rate(sample_rate) {
            log::error!("Failed to switch decoder to {}Hz: {:#}", sample_rate, e);
        }
    }

    fn reset_decoder(&mut self) {
        if let Err(e) = self
            .output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset()
        {
            log::warn!("Failed to reset decoder: {:#}", e);
        }
        {
            let mut decode = self.handle.decode_queue();
            decode.frames.clear();
            decode.last_output = Instant::now();
        }
        self.codec.enable_output(true);
    }

    fn update_iot_states(&mut self) {
        let states = self.things.states_json();
        if let Some(changed) = diff_states(self.last_iot_states.as_ref(), &states) {
            self.send(|p| p.send_iot_states(&changed));
            self.last_iot_states = Some(changed);
        }
    }

    fn output_audio(&mut self) {
        let frame = {
            let mut decode = self.handle.decode_queue();
            if decode.frames.is_empty() {
                if self.chat_state == ChatState::Idle
                    && decode.last_output.elapsed() > self.session.silence_timeout()
                    && self.codec.output_enabled()
                {
                    log::info!("No audio for a while, disabling output");
                    self.codec.enable_output(false);
                }
                return;
            }

            if self.chat_state == ChatState::Listening {
                decode.frames.clear();
                return;
            }

            decode.last_output = Instant::now();
            decode.frames.pop_front()
        };
        let Some(frame) = frame else {
            return;
        };

        let aborted = self.aborted.clone();
        let output = self.output.clone();
        let codec = self.codec.clone();
        self.background.schedule(move || {
            if aborted.load(Ordering::SeqCst) {
                return;
            }
            let pcm = output
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .decode(&frame);
            match pcm {
                Ok(pcm) => codec.output_data(pcm),
                Err(e) => log::warn!("Skipping undecodable frame: {:#}", e),
            }
        });
    }

    fn input_audio(&mut self) {
        while let Some(data) = self.codec.input_data() {
            self.process_input(&data);
        }
    }

    fn process_input(&mut self, data: &[i16]) {
        let captured = match self.input.process(data) {
            Ok(captured) => captured,
            Err(e) => {
                log::warn!("Dropping captured audio: {:#}", e);
                return;
            }
        };

        let front_end_needed = self.processor.is_some()
            || self
                .wake_word
                .as_ref()
                .is_some_and(|d| d.is_detection_running());
        let pcm = if front_end_needed {
            captured.interleaved()
        } else {
            Vec::new()
        };

        if let Some(detector) = self.wake_word.as_mut() {
            if detector.is_detection_running() {
                for event in detector.feed(&pcm) {
                    self.handle.schedule(move |app| app.on_front_end_event(event));
                }
            }
        }

        match self.processor.as_mut() {
            Some(processor) => {
                if processor.is_running() {
                    let processed = processor.process(&pcm);
                    if !processed.is_empty() {
                        self.encode_and_send(processed);
                    }
                }
            }
            None => {
                if self.chat_state == ChatState::Listening {
                    self.encode_and_send(captured.mic);
                }
            }
        }
    }

    /// Encode off-thread, then hop back here to send.
    fn encode_and_send(&self, pcm: Vec<i16>) {
        let encoder = self.encoder.clone();
        let handle = self.handle.clone();
        self.background.schedule(move || {
            let frames = encoder
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .encode(&pcm);
            match frames {
                Ok(frames) => {
                    for frame in frames {
                        handle.schedule(move |app| app.send_audio(&frame));
                    }
                }
                Err(e) => log::warn!("Failed to encode audio: {:#}", e),
            }
        });
    }

    pub(crate) fn on_front_end_event(&mut self, event: FrontEndEvent) {
        match event {
            FrontEndEvent::VadStateChanged { speaking } => {
                if self.chat_state == ChatState::Listening {
                    self.led
                        .set_red(if speaking { HIGH_BRIGHTNESS } else { LOW_BRIGHTNESS });
                    self.led.turn_on();
                }
            }
            FrontEndEvent::WakeWordDetected(wake_word) => self.on_wake_word_detected(&wake_word),
        }
    }

    fn on_wake_word_detected(&mut self, wake_word: &str) {
        match self.chat_state {
            ChatState::Idle => {
                self.set_chat_state(ChatState::Connecting);
                if let Some(detector) = self.wake_word.as_mut() {
                    detector.encode_wake_word_data();
                }

                if !self.open_audio_channel() {
                    log::error!("Failed to open audio channel");
                    self.set_chat_state(ChatState::Idle);
                    self.restart_detection();
                    return;
                }

                if let (Some(detector), Some(protocol)) =
                    (self.wake_word.as_mut(), self.protocol.as_mut())
                {
                    while let Some(opus) = detector.take_wake_word_opus() {
                        protocol.send_audio(&opus);
                    }
                }
                self.send(|p| p.send_wake_word_detected(wake_word));
                log::info!("Wake word detected: {}", wake_word);
                self.keep_listening = true;
                self.set_chat_state(ChatState::Listening);
            }
            ChatState::Speaking => self.abort_speaking(AbortReason::WakeWordDetected),
            _ => {}
        }

        self.restart_detection();
    }

    fn restart_detection(&mut self) {
        if let Some(detector) = self.wake_word.as_mut() {
            detector.start_detection();
        }
    }
}
