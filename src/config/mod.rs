use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000")
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Classifier detect endpoint; its base also serves `/video_feed`
    #[serde(default = "default_classifier_url")]
    pub classifier_url: String,

    /// Concurrent classifier calls
    #[serde(default = "default_detect_workers")]
    pub detect_workers: usize,

    /// Jobs allowed to wait for a worker before uploads are shed
    #[serde(default = "default_detect_queue_size")]
    pub detect_queue_size: usize,

    #[serde(default = "default_classifier_timeout_ms")]
    pub classifier_timeout_ms: u64,

    /// Stream proxied when a request names no camera
    #[serde(default)]
    pub default_stream_url: Option<String>,

    /// Camera soft-AP address used for direct point-to-point testing
    #[serde(default = "default_fallback_stream_url")]
    pub fallback_stream_url: String,

    /// Device stream registry document
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,

    /// Working root for HLS sessions
    #[serde(default = "default_hls_dir")]
    pub hls_dir: PathBuf,

    #[serde(default = "default_hls_idle_ttl_ms")]
    pub hls_idle_ttl_ms: u64,

    #[serde(default = "default_hls_reap_interval_ms")]
    pub hls_reap_interval_ms: u64,

    #[serde(default = "default_ffmpeg_bin")]
    pub ffmpeg_bin: String,

    /// Externally reachable base URL, used to build viewer links
    #[serde(default)]
    pub public_base_url: Option<String>,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_classifier_url() -> String {
    "http://localhost:5000/detect".to_string()
}

fn default_detect_workers() -> usize {
    2
}

fn default_detect_queue_size() -> usize {
    50
}

fn default_classifier_timeout_ms() -> u64 {
    20_000
}

fn default_fallback_stream_url() -> String {
    "http://192.168.4.1:81/stream".to_string()
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("data/device_streams.json")
}

fn default_hls_dir() -> PathBuf {
    std::env::temp_dir().join("nutricycle_hls")
}

fn default_hls_idle_ttl_ms() -> u64 {
    30_000
}

fn default_hls_reap_interval_ms() -> u64 {
    5_000
}

fn default_ffmpeg_bin() -> String {
    "ffmpeg".to_string()
}

fn default_max_body_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            classifier_url: default_classifier_url(),
            detect_workers: default_detect_workers(),
            detect_queue_size: default_detect_queue_size(),
            classifier_timeout_ms: default_classifier_timeout_ms(),
            default_stream_url: None,
            fallback_stream_url: default_fallback_stream_url(),
            registry_path: default_registry_path(),
            hls_dir: default_hls_dir(),
            hls_idle_ttl_ms: default_hls_idle_ttl_ms(),
            hls_reap_interval_ms: default_hls_reap_interval_ms(),
            ffmpeg_bin: default_ffmpeg_bin(),
            public_base_url: None,
            max_body_bytes: default_max_body_bytes(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn classifier_timeout(&self) -> Duration {
        Duration::from_millis(self.classifier_timeout_ms)
    }

    pub fn hls_idle_ttl(&self) -> Duration {
        Duration::from_millis(self.hls_idle_ttl_ms)
    }

    pub fn hls_reap_interval(&self) -> Duration {
        Duration::from_millis(self.hls_reap_interval_ms.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Env default stream target; blank values count as unset.
    pub fn default_stream_url(&self) -> Option<String> {
        non_blank(&self.default_stream_url)
    }

    pub fn public_base_url(&self) -> Option<String> {
        non_blank(&self.public_base_url).map(|u| u.trim_end_matches('/').to_string())
    }

    /// Primary live feed served by the classifier host.
    pub fn video_feed_url(&self) -> String {
        let base = self.classifier_url.trim_end_matches('/');
        let base = base.strip_suffix("/detect").unwrap_or(base);
        format!("{}/video_feed", base)
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
