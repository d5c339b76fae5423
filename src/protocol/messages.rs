//! Control-channel JSON shapes. Field order is part of the wire contract.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const OPUS_FRAME_DURATION_MS: u32 = 60;
pub const WIRE_SAMPLE_RATE: u32 = 16000;

// 音频参数结构体
#[derive(Debug, Serialize)]
pub struct AudioParams {
    pub format: &'static str,
    pub sample_rate: u32,
    pub channels: u8,
    pub frame_duration: u32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            format: "opus",
            sample_rate: WIRE_SAMPLE_RATE,
            channels: 1,
            frame_duration: OPUS_FRAME_DURATION_MS,
        }
    }
}

// Hello Message，用于初始化连接
#[derive(Debug, Serialize)]
pub struct ClientHello<'a> {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub version: u32,
    pub transport: &'a str,
    pub audio_params: AudioParams,
}

impl<'a> ClientHello<'a> {
    pub fn new(version: u32, transport: &'a str) -> Self {
        Self {
            msg_type: "hello",
            version,
            transport,
            audio_params: AudioParams::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListeningMode {
    AutoStop,
    ManualStop,
    Realtime,
}

impl ListeningMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListeningMode::AutoStop => "auto",
            ListeningMode::ManualStop => "manual",
            ListeningMode::Realtime => "realtime",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    None,
    WakeWordDetected,
}

#[derive(Debug, Serialize)]
struct Listen<'a> {
    session_id: &'a str,
    #[serde(rename = "type")]
    msg_type: &'static str,
    state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct Abort<'a> {
    session_id: &'a str,
    #[serde(rename = "type")]
    msg_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct Goodbye<'a> {
    session_id: &'a str,
    #[serde(rename = "type")]
    msg_type: &'static str,
}

#[derive(Debug, Serialize)]
struct Iot<'a> {
    session_id: &'a str,
    #[serde(rename = "type")]
    msg_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    descriptors: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    states: Option<&'a Value>,
}

fn to_text<T: Serialize>(msg: &T) -> String {
    // These structs hold only strings and JSON values, serialization cannot fail.
    serde_json::to_string(msg).unwrap_or_default()
}

pub fn hello(version: u32, transport: &str) -> String {
    to_text(&ClientHello::new(version, transport))
}

pub fn start_listening(session_id: &str, mode: ListeningMode) -> String {
    to_text(&Listen {
        session_id,
        msg_type: "listen",
        state: "start",
        mode: Some(mode.as_str()),
        text: None,
    })
}

pub fn stop_listening(session_id: &str) -> String {
    to_text(&Listen {
        session_id,
        msg_type: "listen",
        state: "stop",
        mode: None,
        text: None,
    })
}

pub fn wake_word_detected(session_id: &str, wake_word: &str) -> String {
    to_text(&Listen {
        session_id,
        msg_type: "listen",
        state: "detect",
        mode: None,
        text: Some(wake_word),
    })
}

pub fn abort_speaking(session_id: &str, reason: AbortReason) -> String {
    to_text(&Abort {
        session_id,
        msg_type: "abort",
        reason: match reason {
            AbortReason::None => None,
            AbortReason::WakeWordDetected => Some("wake_word_detected"),
        },
    })
}

pub fn goodbye(session_id: &str) -> String {
    to_text(&Goodbye {
        session_id,
        msg_type: "goodbye",
    })
}

pub fn iot_descriptors(session_id: &str, descriptors: &Value) -> String {
    to_text(&Iot {
        session_id,
        msg_type: "iot",
        descriptors: Some(descriptors),
        states: None,
    })
}

pub fn iot_states(session_id: &str, states: &Value) -> String {
    to_text(&Iot {
        session_id,
        msg_type: "iot",
        descriptors: None,
        states: Some(states),
    })
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ServerAudioParams {
    pub sample_rate: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct UdpEndpoint {
    pub server: String,
    pub port: u16,
    pub key: String,
    pub nonce: String,
}

/// Server side of the handshake.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ServerHello {
    pub transport: Option<String>,
    pub session_id: Option<String>,
    pub audio_params: Option<ServerAudioParams>,
    pub udp: Option<UdpEndpoint>,
}

impl ServerHello {
    pub fn sample_rate(&self) -> Option<u32> {
        self.audio_params.as_ref().and_then(|p| p.sample_rate)
    }
}

/// Inbound messages the controller acts on.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Tts {
        state: TtsState,
        text: Option<String>,
    },
    Stt {
        text: Option<String>,
    },
    Llm {
        emotion: Option<String>,
        text: Option<String>,
    },
    Iot {
        #[serde(default)]
        commands: Vec<Value>,
    },
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    Stop,
    SentenceStart,
    SentenceEnd,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hello_is_bit_exact() {
        assert_eq!(
            hello(3, "udp"),
            r#"{"type":"hello","version":3,"transport":"udp","audio_params":{"format":"opus","sample_rate":16000,"channels":1,"frame_duration":60}}"#
        );
    }

    #[test]
    fn test_session_scoped_messages() {
        assert_eq!(
            start_listening("s1", ListeningMode::AutoStop),
            r#"{"session_id":"s1","type":"listen","state":"start","mode":"auto"}"#
        );
        assert_eq!(
            start_listening("s1", ListeningMode::ManualStop),
            r#"{"session_id":"s1","type":"listen","state":"start","mode":"manual"}"#
        );
        assert_eq!(
            stop_listening("s1"),
            r#"{"session_id":"s1","type":"listen","state":"stop"}"#
        );
        assert_eq!(
            wake_word_detected("s1", "hi there"),
            r#"{"session_id":"s1","type":"listen","state":"detect","text":"hi there"}"#
        );
        assert_eq!(
            abort_speaking("s1", AbortReason::None),
            r#"{"session_id":"s1","type":"abort"}"#
        );
        assert_eq!(
            abort_speaking("s1", AbortReason::WakeWordDetected),
            r#"{"session_id":"s1","type":"abort","reason":"wake_word_detected"}"#
        );
        assert_eq!(goodbye("s1"), r#"{"session_id":"s1","type":"goodbye"}"#);
        assert_eq!(
            iot_states("s1", &json!({"lamp": {"power": true}})),
            r#"{"session_id":"s1","type":"iot","states":{"lamp":{"power":true}}}"#
        );
    }

    #[test]
    fn test_parse_server_hello() {
        let hello: ServerHello = serde_json::from_value(json!({
            "type": "hello",
            "transport": "udp",
            "session_id": "abc",
            "audio_params": {"sample_rate": 24000},
            "udp": {"server": "1.2.3.4", "port": 8888, "key": "00", "nonce": "01"}
        }))
        .unwrap();
        assert_eq!(hello.session_id.as_deref(), Some("abc"));
        assert_eq!(hello.sample_rate(), Some(24000));
        assert_eq!(hello.udp.unwrap().port, 8888);
    }

    #[test]
    fn test_parse_server_messages() {
        let tts: ServerMessage =
            serde_json::from_str(r#"{"type":"tts","state":"sentence_start","text":"hi"}"#).unwrap();
        assert_eq!(
            tts,
            ServerMessage::Tts {
                state: TtsState::SentenceStart,
                text: Some("hi".into())
            }
        );
        let iot: ServerMessage = serde_json::from_str(r#"{"type":"iot","commands":[{"name":"lamp"}]}"#).unwrap();
        assert_eq!(
            iot,
            ServerMessage::Iot {
                commands: vec![json!({"name": "lamp"})]
            }
        );
        assert!(serde_json::from_str::<ServerMessage>(r#"{"type":"tts"}"#).is_err());
    }
}
