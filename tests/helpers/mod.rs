//! Test harness: the real router on an ephemeral port, with in-process fakes
//! for the classifier, the transcoder and a camera.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{OriginalUri, State};
use axum::http::header;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use metrics_exporter_prometheus::PrometheusBuilder;
use nutricycle_gateway::app_state::AppState;
use nutricycle_gateway::config::AppConfig;
use nutricycle_gateway::routes;
use nutricycle_gateway::services::classifier::{Classifier, ClassifierError};
use nutricycle_gateway::services::transcode::{LaunchedProcess, ProcessHandle, ProcessLauncher};
use serde_json::json;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;

use crate::fixtures::{MJPEG_BOUNDARY, MJPEG_CHUNKS};

/// Classifier that answers with a fixed document once its gate lets it through.
pub struct FakeClassifier {
    gate: Semaphore,
    calls: AtomicUsize,
}

impl FakeClassifier {
    pub fn open() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(Semaphore::MAX_PERMITS),
            calls: AtomicUsize::new(0),
        })
    }

    /// Calls block until [`FakeClassifier::release`].
    pub fn closed() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn release(&self) {
        self.gate.add_permits(1024);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for FakeClassifier {
    async fn classify(
        &self,
        image: Bytes,
        _timeout: Duration,
    ) -> Result<serde_json::Value, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| ClassifierError::Unavailable(e.to_string()))?;
        permit.forget();
        Ok(json!({ "objects": [{ "label": "bottle", "score": 0.91 }], "bytes": image.len() }))
    }
}

struct FakeProcess {
    killed: Arc<AtomicBool>,
}

impl ProcessHandle for FakeProcess {
    fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Launcher that writes a playlist and one segment instead of running ffmpeg.
pub struct FakeLauncher {
    available: AtomicBool,
    launches: AtomicUsize,
    exits: Mutex<Vec<oneshot::Sender<Option<i32>>>>,
}

impl FakeLauncher {
    pub fn new(available: bool) -> Arc<Self> {
        Arc::new(Self {
            available: AtomicBool::new(available),
            launches: AtomicUsize::new(0),
            exits: Mutex::new(Vec::new()),
        })
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    fn launch(&self, _session_id: &str, args: Vec<String>) -> io::Result<LaunchedProcess> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let playlist = PathBuf::from(args.last().cloned().unwrap_or_default());
        let dir = playlist.parent().unwrap_or(Path::new(".")).to_path_buf();
        std::fs::write(&playlist, "#EXTM3U\n#EXT-X-TARGETDURATION:1\n#EXTINF:1.0,\nindex0.ts\n")?;
        std::fs::write(dir.join("index0.ts"), [0x47u8; 188])?;

        let (tx, exited) = oneshot::channel();
        self.exits.lock().unwrap().push(tx);
        Ok(LaunchedProcess {
            handle: Box::new(FakeProcess {
                killed: Arc::new(AtomicBool::new(false)),
            }),
            exited,
        })
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

pub struct TestApp {
    pub base_url: String,
    pub client: reqwest::Client,
    pub state: AppState,
    pub classifier: Arc<FakeClassifier>,
    pub launcher: Arc<FakeLauncher>,
    pub dir: PathBuf,
    server: JoinHandle<()>,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn upload_raw(&self, frame: Vec<u8>, headers: &[(&str, &str)]) -> reqwest::Response {
        let mut request = self
            .client
            .post(self.url("/upload"))
            .header(header::CONTENT_TYPE, "image/png")
            .body(frame);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        request.send().await.expect("upload request failed")
    }

    /// Wait until the detect queue is idle.
    pub async fn drain_queue(&self) {
        for _ in 0..200 {
            let stats = self.state.queue.stats();
            if stats.active == 0 && stats.queued == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("detect queue did not drain: {:?}", self.state.queue.stats());
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.server.abort();
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

pub fn temp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Start the gateway with the given fakes. `configure` adjusts the config
/// after test paths have been filled in.
pub async fn spawn_app_with(
    classifier: Arc<FakeClassifier>,
    launcher: Arc<FakeLauncher>,
    configure: impl FnOnce(&mut AppConfig),
) -> TestApp {
    let dir = temp_dir("gateway-test");
    let mut config = AppConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        registry_path: dir.join("device_streams.json"),
        hls_dir: dir.join("hls"),
        ..AppConfig::default()
    };
    configure(&mut config);

    let state = AppState::new(config, classifier.clone(), launcher.clone())
        .await
        .expect("app state");
    let prometheus = PrometheusBuilder::new().build_recorder().handle();
    let app = routes::router(state.clone(), prometheus);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });

    TestApp {
        base_url: format!("http://{}", addr),
        client: reqwest::Client::new(),
        state,
        classifier,
        launcher,
        dir,
        server,
    }
}

pub async fn spawn_app() -> TestApp {
    spawn_app_with(FakeClassifier::open(), FakeLauncher::new(true), |_| {}).await
}

/// A camera serving a short MJPEG stream on `/stream` and `/video_feed`, an
/// unending one on `/endless`, one that breaks after a frame on `/broken`,
/// and a 500 on `/busy`.
pub struct FakeCamera {
    pub base_url: String,
    state: CameraState,
    server: JoinHandle<()>,
}

#[derive(Clone, Default)]
struct CameraState {
    /// Path and query of every request received.
    requests: Arc<Mutex<Vec<String>>>,
    /// Set once the body of an `/endless` response has been dropped.
    endless_dropped: Arc<AtomicBool>,
}

impl FakeCamera {
    pub fn stream_url(&self) -> String {
        format!("{}/stream", self.base_url)
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn endless_dropped(&self) -> bool {
        self.state.endless_dropped.load(Ordering::SeqCst)
    }
}

impl Drop for FakeCamera {
    fn drop(&mut self) {
        self.server.abort();
    }
}

fn mjpeg_response(body: Body) -> Response {
    Response::builder()
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={}", MJPEG_BOUNDARY),
        )
        .body(body)
        .unwrap()
}

async fn mjpeg(State(camera): State<CameraState>, OriginalUri(uri): OriginalUri) -> Response {
    camera.requests.lock().unwrap().push(uri.to_string());
    let chunks = stream::iter(MJPEG_CHUNKS.iter().copied()).then(|chunk| async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok::<_, io::Error>(Bytes::from_static(chunk))
    });
    mjpeg_response(Body::from_stream(chunks))
}

/// Flags its camera when the response body holding it is dropped.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Frames forever, until the reader goes away.
async fn endless(State(camera): State<CameraState>) -> Response {
    let flag = DropFlag(camera.endless_dropped.clone());
    let chunks = stream::unfold(flag, |flag| async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Some((Ok::<_, io::Error>(Bytes::from_static(MJPEG_CHUNKS[0])), flag))
    });
    mjpeg_response(Body::from_stream(chunks))
}

/// One frame, then the connection breaks.
async fn broken() -> Response {
    let chunks = stream::iter([
        Ok(Bytes::from_static(MJPEG_CHUNKS[0])),
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "sensor fault")),
    ])
    .then(|chunk| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        chunk
    });
    mjpeg_response(Body::from_stream(chunks))
}

async fn busy() -> (axum::http::StatusCode, &'static str) {
    (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "camera busy")
}

pub async fn spawn_camera() -> FakeCamera {
    let state = CameraState::default();
    let app = Router::new()
        .route("/stream", get(mjpeg))
        .route("/video_feed", get(mjpeg))
        .route("/endless", get(endless))
        .route("/broken", get(broken))
        .route("/busy", get(busy))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    FakeCamera {
        base_url: format!("http://{}", addr),
        state,
        server,
    }
}
