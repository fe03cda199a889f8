use serde::Serialize;
use std::path::PathBuf;

/// Encoding parameters for an HLS transcode session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeOptions {
    pub width: u32,
    pub height: u32,
    /// ffmpeg bitrate notation, e.g. `400k`.
    pub bitrate: String,
    /// Target segment duration in seconds.
    pub segment_time: u32,
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            bitrate: "400k".to_string(),
            segment_time: 1,
        }
    }
}

/// Public view of a transcode session.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub id: String,
    pub source_url: String,
    pub dir: PathBuf,
    pub playlist: PathBuf,
    /// False once the transcoder process has exited.
    pub running: bool,
}
