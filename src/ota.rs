//! Firmware version check and download.
//!
//! The device posts its board descriptor to the OTA endpoint. The reply may
//! carry an activation code to show the user and a firmware entry to
//! compare against the running version.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

use crate::application::{AppHandle, ChatState};
use crate::board::{AudioCodec, Display};
use crate::config::OtaSettings;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionInfo {
    pub has_new_version: bool,
    pub firmware_version: Option<String>,
    pub firmware_url: Option<String>,
    pub activation_code: Option<String>,
}

/// Reported download progress: percent done and bytes per second.
pub type ProgressFn = dyn Fn(u32, u64) + Send + Sync;

#[async_trait]
pub trait Ota: Send + Sync {
    async fn check_version(&self) -> anyhow::Result<VersionInfo>;
    async fn start_upgrade(&self, info: &VersionInfo, progress: &ProgressFn) -> anyhow::Result<()>;
    fn mark_current_version_valid(&self);
    fn current_version(&self) -> &str;
}

#[derive(Debug, Deserialize)]
struct OtaResponse {
    firmware: Option<FirmwareInfo>,
    activation: Option<ActivationInfo>,
}

#[derive(Debug, Deserialize)]
struct FirmwareInfo {
    version: String,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ActivationInfo {
    code: Option<String>,
}

pub struct HttpOta {
    client: Client,
    url: String,
    device_id: String,
    client_id: String,
    board_json: Value,
    firmware_path: PathBuf,
    current_version: String,
}

impl HttpOta {
    pub fn new(
        settings: &OtaSettings,
        device_id: String,
        client_id: String,
        board_json: Value,
        current_version: String,
    ) -> Self {
        Self {
            client: Client::new(),
            url: settings.url.clone(),
            device_id,
            client_id,
            board_json,
            firmware_path: settings.firmware_path.clone(),
            current_version,
        }
    }
}

#[async_trait]
impl Ota for HttpOta {
    async fn check_version(&self) -> anyhow::Result<VersionInfo> {
        log::info!("Checking version via HTTP: {}", self.url);

        // 参考 C++ 中的 headers，不包含 Authorization 和 Protocol-Version
        let resp = self
            .client
            .post(&self.url)
            .header("Device-Id", &self.device_id)
            .header("Client-Id", &self.client_id)
            .header("Content-Type", "application/json")
            .json(&self.board_json)
            .send()
            .await
            .context("Version check request failed")?;

        if !resp.status().is_success() {
            anyhow::bail!("HTTP Error: {}", resp.status());
        }
        let body: OtaResponse = resp.json().await.context("Invalid version check reply")?;
        Ok(version_info(&self.current_version, body))
    }

    async fn start_upgrade(&self, info: &VersionInfo, progress: &ProgressFn) -> anyhow::Result<()> {
        let url = info
            .firmware_url
            .as_deref()
            .context("Server did not provide a firmware url")?;
        log::info!("Downloading firmware from {}", url);

        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .context("Firmware download failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("HTTP Error: {}", resp.status());
        }

        let total = resp.content_length().unwrap_or(0);
        let mut file = tokio::fs::File::create(&self.firmware_path)
            .await
            .with_context(|| format!("Failed to create {}", self.firmware_path.display()))?;

        let started = Instant::now();
        let mut last_report = Instant::now();
        let mut received: u64 = 0;
        while let Some(chunk) = resp.chunk().await? {
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;

            if last_report.elapsed() >= Duration::from_secs(1) {
                last_report = Instant::now();
                let percent = if total > 0 { (received * 100 / total) as u32 } else { 0 };
                let speed = received / started.elapsed().as_secs().max(1);
                progress(percent, speed);
            }
        }
        file.flush().await?;

        if total > 0 && received != total {
            anyhow::bail!("Firmware truncated: {} of {} bytes", received, total);
        }
        progress(100, received / started.elapsed().as_secs().max(1));
        log::info!(
            "Firmware {} saved to {}",
            info.firmware_version.as_deref().unwrap_or("?"),
            self.firmware_path.display()
        );
        Ok(())
    }

    fn mark_current_version_valid(&self) {
        log::info!("Running firmware {} marked valid", self.current_version);
    }

    fn current_version(&self) -> &str {
        &self.current_version
    }
}

fn version_info(current: &str, body: OtaResponse) -> VersionInfo {
    let activation_code = body.activation.and_then(|a| a.code);
    match body.firmware {
        Some(firmware) => VersionInfo {
            has_new_version: is_newer(current, &firmware.version),
            firmware_version: Some(firmware.version),
            firmware_url: firmware.url,
            activation_code,
        },
        None => VersionInfo {
            activation_code,
            ..VersionInfo::default()
        },
    }
}

/// Compare dotted numeric versions; anything unparsable counts as 0.
pub fn is_newer(current: &str, candidate: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.trim_start_matches('v')
            .split('.')
            .map(|part| part.trim().parse().unwrap_or(0))
            .collect()
    };
    let (current, candidate) = (parse(current), parse(candidate));
    let len = current.len().max(candidate.len());
    for i in 0..len {
        let a = current.get(i).copied().unwrap_or(0);
        let b = candidate.get(i).copied().unwrap_or(0);
        if a != b {
            return b > a;
        }
    }
    false
}

/// Check for new firmware in the background and upgrade once the device is
/// idle.
pub fn spawn_version_check(
    ota: Arc<dyn Ota>,
    handle: AppHandle,
    display: Arc<dyn Display>,
    codec: Arc<dyn AudioCodec>,
    settings: &OtaSettings,
) -> JoinHandle<()> {
    let retry_interval = Duration::from_secs(settings.retry_interval_secs);
    let idle_poll = Duration::from_secs(settings.idle_poll_secs);

    tokio::spawn(async move {
        let info = loop {
            match ota.check_version().await {
                Ok(info) => break info,
                Err(e) => {
                    log::warn!("Version check failed: {:#}, retrying in {:?}", e, retry_interval);
                    tokio::time::sleep(retry_interval).await;
                }
            }
        };

        if let Some(code) = info.activation_code.as_deref() {
            log::info!("Activation code: {}", code);
            display.show_notification(&format!("Activation code {}", code));
        }

        if !info.has_new_version {
            ota.mark_current_version_valid();
            display.show_notification(&format!("version {}", ota.current_version()));
            return;
        }

        loop {
            tokio::time::sleep(idle_poll).await;
            if handle.chat_state() == ChatState::Idle {
                break;
            }
        }

        handle.schedule(|app| app.set_chat_state(ChatState::Upgrading));
        display.set_icon("download");
        display.set_status(&format!(
            "new version {}",
            info.firmware_version.as_deref().unwrap_or("")
        ));
        // no audio while flashing
        codec.enable_output(false);

        let progress_display = display.clone();
        let progress = move |percent: u32, speed: u64| {
            progress_display.set_status(&format!("{}% {}KB/s", percent, speed / 1024));
        };
        match ota.start_upgrade(&info, &progress).await {
            Ok(()) => {
                log::info!("Firmware downloaded, restarting to apply");
                handle.shutdown();
            }
            Err(e) => {
                log::error!("Firmware upgrade failed: {:#}", e);
                handle.schedule(|app| app.set_chat_state(ChatState::Idle));
            }
        }
    })
}
