use std::fs;
use std::path::Path;

use mac_address::get_mac_address;
use uuid::Uuid;

use crate::config::DeviceSettings;

const UNKNOWN_DEVICE: &str = "unknown-device";
const UNKNOWN_CLIENT: &str = "unknown-client";

/// Who this endpoint is to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub device_id: String,
    pub client_id: String,
}

impl Identity {
    pub fn resolve(settings: &DeviceSettings) -> Self {
        Self {
            device_id: resolve_device_id(&settings.device_id),
            client_id: resolve_client_id(&settings.client_id, &settings.uuid_file),
        }
    }
}

/// Configured id, else the MAC address, else a fresh UUID.
pub fn resolve_device_id(configured: &str) -> String {
    if configured != UNKNOWN_DEVICE && !configured.is_empty() {
        return configured.to_string();
    }
    match get_mac_address() {
        // lowercase to match typical Linux formatting
        Ok(Some(mac)) => mac.to_string().to_lowercase(),
        _ => Uuid::new_v4().to_string(),
    }
}

// 设备端UUID，先从本地文件读取以保持重启间身份一致，如果不存在则生成新的并保存
pub fn resolve_client_id(configured: &str, uuid_file: &Path) -> String {
    if configured != UNKNOWN_CLIENT && !configured.is_empty() {
        return configured.to_string();
    }

    if let Ok(content) = fs::read_to_string(uuid_file) {
        let trimmed = content.trim();
        if !trimmed.is_empty() {
            log::info!("Loaded Client ID from {}", uuid_file.display());
            return trimmed.to_string();
        }
    }

    let client_id = Uuid::new_v4().to_string();
    log::info!("Generated new Client ID: {}", client_id);
    if let Err(e) = fs::write(uuid_file, &client_id) {
        log::warn!("Failed to save Client ID to {}: {}", uuid_file.display(), e);
    }
    client_id
}
