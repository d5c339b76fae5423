use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

/// Defaults compiled into the binary; the same file drives `build.rs`.
const DEFAULTS: &str = include_str!("../config.toml");

/// Env var naming an optional override file.
pub const CONFIG_PATH_ENV: &str = "VOICE_ENDPOINT_CONFIG";
const DEFAULT_OVERRIDE_FILE: &str = "voice_endpoint.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub device: DeviceSettings,
    pub protocol: ProtocolSettings,
    pub audio: AudioSettings,
    pub session: SessionSettings,
    pub gui: BridgeSettings,
    pub iot: BridgeSettings,
    pub ota: OtaSettings,
    pub alerts: AlertSettings,
}

// 设备标识
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSettings {
    pub device_id: String,
    pub client_id: String,
    pub uuid_file: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Websocket,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Websocket => "websocket",
        }
    }
}

// 网络协议配置
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolSettings {
    pub transport: Transport,
    pub ws_url: String,
    pub ws_token: String,
    pub version: u32,
    pub connect_timeout_ms: u64,
    pub hello_timeout_ms: u64,
    pub max_sequence_gap: u32,
}

impl ProtocolSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn hello_timeout(&self) -> Duration {
        Duration::from_millis(self.hello_timeout_ms)
    }

    /// `None` when forward gaps are unbounded.
    pub fn sequence_gap_limit(&self) -> Option<u32> {
        (self.max_sequence_gap > 0).then_some(self.max_sequence_gap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioBackend {
    Virtual,
    Alsa,
}

// 音频设备配置
#[derive(Debug, Clone, Deserialize)]
pub struct AudioSettings {
    pub backend: AudioBackend,
    pub capture_device: String,
    pub playback_device: String,
    pub input_sample_rate: u32,
    pub input_channels: u16,
    pub input_reference: bool,
    pub output_sample_rate: u32,
    pub output_channels: u16,
    pub output_volume: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    pub silence_timeout_secs: u64,
    pub listen_settle_ms: u64,
    pub background_warn_threshold: usize,
}

impl SessionSettings {
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_secs(self.silence_timeout_secs)
    }

    pub fn listen_settle(&self) -> Duration {
        Duration::from_millis(self.listen_settle_ms)
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            silence_timeout_secs: 10,
            listen_settle_ms: 120,
            background_warn_threshold: 30,
        }
    }
}

// GUI / IoT 进程通过本地UDP通信
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSettings {
    pub local_ip: String,
    pub local_port: u16,
    pub remote_ip: String,
    pub remote_port: u16,
    pub buffer_size: usize,
}

impl BridgeSettings {
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_ip, self.local_port)
    }

    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.remote_ip, self.remote_port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtaSettings {
    pub url: String,
    pub firmware_path: PathBuf,
    pub retry_interval_secs: u64,
    pub idle_poll_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertSettings {
    #[serde(default)]
    pub sounds: Vec<AlertSound>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertSound {
    pub message: String,
    pub file: PathBuf,
}

impl AlertSettings {
    pub fn sound_for(&self, message: &str) -> Option<&Path> {
        self.sounds
            .iter()
            .find(|s| s.message == message)
            .map(|s| s.file.as_path())
    }
}

impl Settings {
    /// Embedded defaults, then the override file, then `VOICE_ENDPOINT__*` env vars.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_OVERRIDE_FILE));
        Self::load_from(Some(&path))
    }

    pub fn load_from(override_file: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder =
            Config::builder().add_source(File::from_str(DEFAULTS, FileFormat::Toml));
        if let Some(path) = override_file {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("VOICE_ENDPOINT")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize::<Settings>()
            .context("Invalid configuration")?;
        Ok(settings)
    }

    /// Build-time application identity exported by `build.rs`.
    pub fn app_name() -> &'static str {
        env!("APP_NAME")
    }

    pub fn app_version() -> &'static str {
        env!("APP_VERSION")
    }
}
