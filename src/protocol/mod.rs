//! Session protocol: control messages plus a realtime audio transport.
//!
//! Two transports implement [`Protocol`]:
//! - [`udp::UdpProtocol`]: JSON control channel with an AES-CTR encrypted,
//!   sequenced datagram channel for audio.
//! - [`websocket::WebsocketProtocol`]: one websocket carrying control text
//!   and opus binary frames. The stream is reliable and ordered, so it skips
//!   the nonce/sequence framing entirely.

pub mod handshake;
pub mod messages;
pub mod packet;
pub mod udp;
pub mod websocket;
pub mod ws_link;

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

use handshake::Handshake;
pub use messages::{AbortReason, ListeningMode};
use messages::ServerHello;

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    NetworkError(String),
    IncomingAudio(Vec<u8>),
    /// Any control message other than hello/goodbye, forwarded untouched.
    IncomingJson(Value),
    AudioChannelOpened { sample_rate: u32 },
    AudioChannelClosed,
    /// Server said goodbye for the current session.
    Goodbye,
}

pub type EventHandler = Arc<dyn Fn(ProtocolEvent) + Send + Sync>;

/// Cloneable fan-in point for protocol events. The handler runs on whichever
/// thread emits, with no lock held.
#[derive(Clone, Default)]
pub struct EventSink {
    handler: Arc<Mutex<Option<EventHandler>>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_handler(&self, handler: EventHandler) {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn emit(&self, event: ProtocolEvent) {
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => handler(event),
            None => log::debug!("Protocol event without handler: {:?}", event),
        }
    }
}

pub trait Protocol: Send {
    fn events(&self) -> &EventSink;

    /// Handshake and ready the audio transport. Blocks up to the hello
    /// timeout. On failure a single `NetworkError` has been emitted.
    fn open_audio_channel(&mut self) -> bool;

    /// Tear down audio and say goodbye. Idempotent.
    fn close_audio_channel(&mut self);

    fn is_audio_channel_opened(&self) -> bool;

    /// Best effort.
    fn send_audio(&mut self, frame: &[u8]);

    fn send_text(&mut self, text: &str) -> bool;

    fn session_id(&self) -> String;

    fn server_sample_rate(&self) -> u32;

    fn on_event(&self, handler: EventHandler) {
        self.events().set_handler(handler);
    }

    fn send_start_listening(&mut self, mode: ListeningMode) {
        let text = messages::start_listening(&self.session_id(), mode);
        self.send_text(&text);
    }

    fn send_stop_listening(&mut self) {
        let text = messages::stop_listening(&self.session_id());
        self.send_text(&text);
    }

    fn send_wake_word_detected(&mut self, wake_word: &str) {
        let text = messages::wake_word_detected(&self.session_id(), wake_word);
        self.send_text(&text);
    }

    fn send_abort_speaking(&mut self, reason: AbortReason) {
        let text = messages::abort_speaking(&self.session_id(), reason);
        self.send_text(&text);
    }

    fn send_iot_descriptors(&mut self, descriptors: &Value) {
        let text = messages::iot_descriptors(&self.session_id(), descriptors);
        self.send_text(&text);
    }

    fn send_iot_states(&mut self, states: &Value) {
        let text = messages::iot_states(&self.session_id(), states);
        self.send_text(&text);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    Text(String),
    Disconnected,
}

pub type ControlHandler = Arc<dyn Fn(ControlEvent) + Send + Sync>;

/// Text-only signalling link used by the datagram transport.
pub trait ControlChannel: Send + Sync {
    fn connect(&self, handler: ControlHandler) -> anyhow::Result<()>;
    fn is_connected(&self) -> bool;
    fn send_text(&self, text: &str) -> anyhow::Result<()>;
}

/// Session state the control reader shares with the owning transport.
pub(crate) struct ControlState {
    pub events: EventSink,
    pub handshake: Handshake,
    pub session_id: Mutex<String>,
}

impl ControlState {
    pub fn new(events: EventSink) -> Self {
        Self {
            events,
            handshake: Handshake::new(),
            session_id: Mutex::new(String::new()),
        }
    }

    pub fn session_id(&self) -> String {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_session_id(&self, id: String) {
        *self.session_id.lock().unwrap_or_else(PoisonError::into_inner) = id;
    }

    /// Route one inbound control text: hello completes the handshake, a
    /// goodbye for this session becomes [`ProtocolEvent::Goodbye`], anything
    /// else is forwarded as JSON.
    pub fn dispatch(&self, text: &str) {
        let root: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("Dropping malformed control message: {}", e);
                return;
            }
        };
        let Some(msg_type) = root.get("type").and_then(Value::as_str) else {
            log::warn!("Control message has no type: {}", text);
            return;
        };

        match msg_type {
            "hello" => match serde_json::from_value::<ServerHello>(root) {
                Ok(hello) => self.handshake.complete(hello),
                Err(e) => log::warn!("Invalid server hello: {}", e),
            },
            "goodbye" => {
                let current = self.session_id();
                match root.get("session_id").and_then(Value::as_str) {
                    Some(id) if id != current => {
                        log::info!("Ignoring goodbye for session {}", id);
                    }
                    _ => self.events.emit(ProtocolEvent::Goodbye),
                }
            }
            _ => self.events.emit(ProtocolEvent::IncomingJson(root)),
        }
    }
}
