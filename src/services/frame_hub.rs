use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;

/// Longest edge of the published snapshot.
pub const SNAPSHOT_MAX_EDGE: u32 = 320;
const SNAPSHOT_JPEG_QUALITY: u8 = 70;
const CHANNEL_CAPACITY: usize = 64;

/// Announcement of a new snapshot.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FrameInfo {
    pub frame_id: String,
    pub device_id: Option<String>,
    pub size: usize,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub ts: DateTime<Utc>,
}

/// Messages delivered to live viewers.
#[derive(Debug, Clone, Serialize, strum::IntoStaticStr)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HubMessage {
    Frame(FrameInfo),
    Detections(serde_json::Value),
}

impl HubMessage {
    /// Event name used on the SSE transport.
    pub fn event_name(&self) -> &'static str {
        self.into()
    }
}

/// Latest downscaled frame.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub bytes: Bytes,
    pub content_type: &'static str,
    pub info: FrameInfo,
}

/// Fan-out of frames and detection results to viewers.
pub struct FrameHub {
    tx: broadcast::Sender<HubMessage>,
    latest: Mutex<Option<Snapshot>>,
}

impl Default for FrameHub {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            latest: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubMessage> {
        self.tx.subscribe()
    }

    /// Store a downscaled copy of `frame` as the latest snapshot and announce it.
    pub async fn publish_frame(&self, frame: Bytes, device_id: Option<&str>) -> FrameInfo {
        let original = frame.clone();
        let (bytes, content_type) = match tokio::task::spawn_blocking(move || downscale(&frame)).await {
            Ok(Some(jpeg)) => (Bytes::from(jpeg), "image/jpeg"),
            _ => {
                let content_type = sniff_content_type(&original);
                (original, content_type)
            }
        };

        let ts = Utc::now();
        let info = FrameInfo {
            frame_id: format!("{}-{}", device_id.unwrap_or("unknown"), ts.timestamp_millis()),
            device_id: device_id.map(str::to_string),
            size: bytes.len(),
            ts,
        };

        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(Snapshot {
            bytes,
            content_type,
            info: info.clone(),
        });
        // No viewers connected is not an error.
        let _ = self.tx.send(HubMessage::Frame(info.clone()));
        info
    }

    pub fn publish_detections(&self, result: serde_json::Value) {
        let _ = self.tx.send(HubMessage::Detections(result));
    }

    pub fn latest(&self) -> Option<Snapshot> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Re-encode as a JPEG no larger than the snapshot box, keeping aspect ratio.
/// `None` when the bytes are not a decodable image.
fn downscale(frame: &[u8]) -> Option<Vec<u8>> {
    let decoded = image::load_from_memory(frame).ok()?;
    let fitted = if decoded.width() > SNAPSHOT_MAX_EDGE || decoded.height() > SNAPSHOT_MAX_EDGE {
        decoded.resize(SNAPSHOT_MAX_EDGE, SNAPSHOT_MAX_EDGE, FilterType::Triangle)
    } else {
        decoded
    };

    let rgb = DynamicImage::ImageRgb8(fitted.to_rgb8());
    let mut out = Vec::new();
    match rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, SNAPSHOT_JPEG_QUALITY)) {
        Ok(()) => Some(out),
        Err(e) => {
            tracing::warn!(error = %e, "Snapshot encoding failed");
            None
        }
    }
}

fn sniff_content_type(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(format) => format.to_mime_type(),
        Err(_) => "application/octet-stream",
    }
}
