use std::sync::Arc;

use crate::config::AppConfig;
use crate::services::{
    classifier::Classifier,
    detect_queue::DetectQueue,
    frame_hub::FrameHub,
    registry::DeviceRegistry,
    stream_proxy::{ProxyError, StreamProxy},
    transcode::{ProcessLauncher, TranscodeManager},
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub classifier: Arc<dyn Classifier>,
    pub queue: Arc<DetectQueue>,
    pub registry: Arc<DeviceRegistry>,
    pub transcoder: Arc<TranscodeManager>,
    pub proxy: Arc<StreamProxy>,
    pub hub: Arc<FrameHub>,
}

impl AppState {
    /// Wire up every component from `config`, loading the registry document.
    pub async fn new(
        config: AppConfig,
        classifier: Arc<dyn Classifier>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Result<Self, ProxyError> {
        let registry = Arc::new(DeviceRegistry::load(&config.registry_path).await);

        let queue = Arc::new(DetectQueue::new(
            classifier.clone(),
            config.detect_workers,
            config.detect_queue_size,
            config.classifier_timeout(),
        ));

        let transcoder = Arc::new(TranscodeManager::new(
            launcher,
            &config.hls_dir,
            config.hls_idle_ttl(),
        ));

        let proxy = Arc::new(StreamProxy::new(
            registry.clone(),
            config.probe_timeout(),
            config.default_stream_url(),
            &config.fallback_stream_url,
        )?);

        Ok(Self {
            config: Arc::new(config),
            classifier,
            queue,
            registry,
            transcoder,
            proxy,
            hub: Arc::new(FrameHub::new()),
        })
    }
}
