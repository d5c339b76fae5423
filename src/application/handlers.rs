use std::sync::atomic::Ordering;

use serde_json::Value;

use super::{AppHandle, Application, ChatState};
use crate::board::Board;
use crate::protocol::messages::{ServerMessage, TtsState};
use crate::protocol::{ListeningMode, ProtocolEvent};

/// Runs on whichever thread the transport emits from. Anything touching
/// session state is scheduled onto the controller.
pub(super) fn on_protocol_event(handle: &AppHandle, board: &dyn Board, event: ProtocolEvent) {
    match event {
        ProtocolEvent::NetworkError(message) => {
            handle.schedule(move |app| app.alert("Error", &message));
        }
        ProtocolEvent::IncomingAudio(frame) => handle.enqueue_incoming_audio(frame),
        ProtocolEvent::AudioChannelOpened { sample_rate } => {
            log::info!("Audio channel opened, server sample rate {}", sample_rate);
            board.set_power_save_mode(false);
        }
        ProtocolEvent::AudioChannelClosed => {
            board.set_power_save_mode(true);
            handle.schedule(|app| app.set_chat_state(ChatState::Idle));
        }
        ProtocolEvent::Goodbye => {
            handle.schedule(|app| app.close_audio_channel());
        }
        ProtocolEvent::IncomingJson(root) => {
            handle.schedule(move |app| app.on_incoming_json(root));
        }
    }
}

impl Application {
    pub(crate) fn on_incoming_json(&mut self, root: Value) {
        let message = match serde_json::from_value::<ServerMessage>(root) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("Ignoring server message: {}", e);
                return;
            }
        };

        match message {
            ServerMessage::Tts { state, text } => self.on_tts(state, text),
            ServerMessage::Stt { text } => {
                if let Some(text) = text {
                    log::info!(">> {}", text);
                    self.display.set_chat_message("user", &text);
                }
            }
            ServerMessage::Llm { emotion, .. } => {
                if let Some(emotion) = emotion {
                    self.display.set_emotion(&emotion);
                }
            }
            ServerMessage::Iot { commands } => {
                for command in &commands {
                    if let Err(e) = self.things.invoke(command) {
                        log::warn!("IoT command failed: {:#}", e);
                    }
                }
            }
        }
    }

    fn on_tts(&mut self, state: TtsState, text: Option<String>) {
        match state {
            TtsState::Start => {
                self.aborted.store(false, Ordering::SeqCst);
                if matches!(self.chat_state, ChatState::Idle | ChatState::Listening) {
                    self.set_chat_state(ChatState::Speaking);
                }
            }
            TtsState::Stop => {
                if self.chat_state == ChatState::Speaking {
                    self.background.wait_for_completion();
                    if self.keep_listening {
                        self.send(|p| p.send_start_listening(ListeningMode::AutoStop));
                        self.set_chat_state(ChatState::Listening);
                    } else {
                        self.set_chat_state(ChatState::Idle);
                    }
                }
            }
            TtsState::SentenceStart => {
                if let Some(text) = text {
                    log::info!("<< {}", text);
                    self.display.set_chat_message("assistant", &text);
                }
            }
            TtsState::SentenceEnd => {}
        }
    }
}
