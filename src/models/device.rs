use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current registry document version.
pub const REGISTRY_VERSION: u32 = 1;

/// Where a device's live stream can be reached.
///
/// Each write replaces the whole entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEntry {
    #[serde(default)]
    pub url: String,

    #[serde(with = "chrono::serde::ts_milliseconds", default = "Utc::now")]
    pub last_seen: DateTime<Utc>,

    /// Connection quality reading reported by the device (RSSI, dBm).
    #[serde(default, alias = "rssi", skip_serializing_if = "Option::is_none")]
    pub signal: Option<f64>,
}

impl DeviceEntry {
    pub fn new(url: String) -> Self {
        Self {
            url,
            last_seen: Utc::now(),
            signal: None,
        }
    }
}

/// On-disk form of the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryDocument {
    pub version: u32,
    #[serde(default)]
    pub data: BTreeMap<String, DeviceEntry>,
    #[serde(with = "chrono::serde::ts_milliseconds_option", default)]
    pub saved: Option<DateTime<Utc>>,
}

/// Persistence status reported by `GET /devices/status`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatus {
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub last_saved: Option<DateTime<Utc>>,
    pub size: u64,
    pub entries: usize,
}

/// What an uploading device told us about itself.
#[derive(Debug, Clone, Default)]
pub struct UploadOrigin {
    pub source_ip: Option<String>,
    pub device_id: Option<String>,
    pub stream_url: Option<String>,
    pub signal: Option<f64>,
}
