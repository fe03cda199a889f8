use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::services::address::is_http_url;

/// Target selectors accepted by the stream, probe and HLS routes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetQuery {
    pub url: Option<String>,
    pub device_id: Option<String>,
    pub target_ip: Option<String>,
}

impl TargetQuery {
    pub fn url(&self) -> Option<&str> {
        non_empty(&self.url)
    }

    pub fn device_id(&self) -> Option<&str> {
        non_empty(&self.device_id)
    }

    pub fn target_ip(&self) -> Option<&str> {
        non_empty(&self.target_ip)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Body of `POST /devices/{id}/register_stream`.
#[derive(Debug, Deserialize, Validate)]
pub struct RegisterStreamRequest {
    #[garde(length(min = 8, max = 2048), custom(http_url))]
    pub url: String,
}

fn http_url(value: &str, _ctx: &()) -> garde::Result {
    if is_http_url(value) {
        Ok(())
    } else {
        Err(garde::Error::new("must be an http:// or https:// URL"))
    }
}

#[derive(Debug, Serialize)]
pub struct RegisterStreamResponse {
    pub ok: bool,
    pub id: String,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct DeviceStreamResponse {
    pub id: String,
    pub url: String,
}

/// Result of a reachability probe against a stream target.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResponse {
    pub ok: bool,
    pub target: String,
    pub status: u16,
    pub content_type: String,
}

#[derive(Debug, Serialize)]
pub struct NormalizeStreamResponse {
    pub ok: bool,
    pub target: String,
}

/// Acknowledgement returned by `POST /upload`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub ok: bool,
    pub queued: bool,
    pub job_id: uuid::Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_stream_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HlsStartResponse {
    pub ok: bool,
    pub id: String,
    pub playlist: String,
}
