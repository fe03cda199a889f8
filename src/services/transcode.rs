//! On-demand HLS transcoding sessions.
//!
//! Browsers that cannot play the cameras' MJPEG stream get an HLS rendition
//! produced by an external ffmpeg process. Sessions are keyed by a hash of the
//! source URL so concurrent viewers of one camera share one process, and an
//! idle reaper stops sessions nobody has touched for `idle_ttl`.

use async_trait::async_trait;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::models::session::{SessionDescriptor, TranscodeOptions};

/// File name of the generated playlist inside a session directory.
pub const PLAYLIST_NAME: &str = "index.m3u8";

/// Control side of a running transcoder process.
pub trait ProcessHandle: Send + Sync {
    /// Ask the process to terminate. Safe to call more than once.
    fn kill(&self);

    fn pid(&self) -> Option<u32>;
}

/// A freshly launched process and the notification of its exit.
pub struct LaunchedProcess {
    pub handle: Box<dyn ProcessHandle>,
    /// Resolves with the exit code once the process is gone.
    pub exited: oneshot::Receiver<Option<i32>>,
}

/// Starts transcoder processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, session_id: &str, args: Vec<String>) -> io::Result<LaunchedProcess>;

    /// Cheap probe for whether the transcoder binary can run at all.
    async fn is_available(&self) -> bool;
}

/// Launches the `ffmpeg` binary.
pub struct FfmpegLauncher {
    program: String,
    available: OnceCell<bool>,
}

impl FfmpegLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            available: OnceCell::new(),
        }
    }
}

struct FfmpegProcess {
    pid: Option<u32>,
    cancel: CancellationToken,
}

impl ProcessHandle for FfmpegProcess {
    fn kill(&self) {
        self.cancel.cancel();
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[async_trait]
impl ProcessLauncher for FfmpegLauncher {
    fn launch(&self, session_id: &str, args: Vec<String>) -> io::Result<LaunchedProcess> {
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(log_lines(session_id.to_string(), stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_lines(session_id.to_string(), stderr));
        }

        let cancel = CancellationToken::new();
        let (tx, exited) = oneshot::channel();
        let token = cancel.clone();
        tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => status.ok().and_then(|s| s.code()),
                _ = token.cancelled() => {
                    let _ = child.kill().await;
                    None
                }
            };
            let _ = tx.send(code);
        });

        Ok(LaunchedProcess {
            handle: Box::new(FfmpegProcess { pid, cancel }),
            exited,
        })
    }

    async fn is_available(&self) -> bool {
        *self
            .available
            .get_or_init(|| async {
                Command::new(&self.program)
                    .arg("-version")
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await
                    .map(|s| s.success())
                    .unwrap_or(false)
            })
            .await
    }
}

async fn log_lines<R: AsyncRead + Unpin>(session_id: String, reader: R) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(session_id = %session_id, "{}", line.trim());
    }
}

/// Deterministic session id for a source URL.
pub fn session_id(source_url: &str) -> String {
    let digest = Sha1::digest(source_url.as_bytes());
    let mut hex = format!("{:x}", digest);
    hex.truncate(12);
    hex
}

/// ffmpeg arguments for a low-latency HLS rendition of `source_url`.
pub fn ffmpeg_args(source_url: &str, opts: &TranscodeOptions, playlist: &Path) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner", "-y", "-fflags", "nobuffer", "-i", source_url,
        "-c:v", "libx264", "-preset", "veryfast", "-tune", "zerolatency",
        "-b:v", &opts.bitrate, "-maxrate", "500k", "-bufsize", "1000k",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    args.extend([
        "-vf".to_string(),
        format!("scale={}:{}", opts.width, opts.height),
        "-g".to_string(),
        "30".to_string(),
        "-keyint_min".to_string(),
        "30".to_string(),
        "-f".to_string(),
        "hls".to_string(),
        "-hls_time".to_string(),
        opts.segment_time.to_string(),
        "-hls_list_size".to_string(),
        "5".to_string(),
        "-hls_flags".to_string(),
        "delete_segments+append_list".to_string(),
        playlist.to_string_lossy().into_owned(),
    ]);
    args
}

struct Session {
    id: String,
    source_url: String,
    dir: PathBuf,
    playlist: PathBuf,
    process: Option<Box<dyn ProcessHandle>>,
    last_active: Instant,
    generation: u64,
}

impl Session {
    fn descriptor(&self) -> SessionDescriptor {
        SessionDescriptor {
            id: self.id.clone(),
            source_url: self.source_url.clone(),
            dir: self.dir.clone(),
            playlist: self.playlist.clone(),
            running: self.process.is_some(),
        }
    }
}

pub struct TranscodeManager {
    launcher: Arc<dyn ProcessLauncher>,
    base_dir: PathBuf,
    idle_ttl: Duration,
    sessions: Mutex<HashMap<String, Session>>,
    generation: AtomicU64,
}

impl TranscodeManager {
    pub fn new(launcher: Arc<dyn ProcessLauncher>, base_dir: impl Into<PathBuf>, idle_ttl: Duration) -> Self {
        Self {
            launcher,
            base_dir: base_dir.into(),
            idle_ttl,
            sessions: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Start transcoding `source_url`, or reuse the session already running
    /// for it.
    ///
    /// Reuse refreshes the session's activity time. A session whose process
    /// has exited is relaunched in place.
    pub async fn start(
        self: &Arc<Self>,
        source_url: &str,
        opts: &TranscodeOptions,
    ) -> Result<SessionDescriptor, TranscodeError> {
        let id = session_id(source_url);
        let mut sessions = self.sessions.lock().await;

        if let Some(session) = sessions.get_mut(&id) {
            if session.process.is_some() {
                session.last_active = Instant::now();
                return Ok(session.descriptor());
            }
        }

        let dir = self.base_dir.join(&id);
        tokio::fs::create_dir_all(&dir).await?;
        let playlist = dir.join(PLAYLIST_NAME);

        let launched = self
            .launcher
            .launch(&id, ffmpeg_args(source_url, opts, &playlist))?;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            session_id = %id,
            source_url = %source_url,
            pid = ?launched.handle.pid(),
            "Started transcode session"
        );

        let session = Session {
            id: id.clone(),
            source_url: source_url.to_string(),
            dir,
            playlist,
            process: Some(launched.handle),
            last_active: Instant::now(),
            generation,
        };
        let descriptor = session.descriptor();
        sessions.insert(id.clone(), session);
        metrics::gauge!("transcode_sessions_active").set(sessions.len() as f64);
        drop(sessions);

        let manager = Arc::downgrade(self);
        let exited = launched.exited;
        tokio::spawn(async move {
            let code = exited.await.ok().flatten();
            tracing::info!(session_id = %id, exit_code = ?code, "Transcoder exited");
            mark_exited(manager, &id, generation).await;
        });

        Ok(descriptor)
    }

    pub async fn get_entry(&self, id: &str) -> Option<SessionDescriptor> {
        self.sessions.lock().await.get(id).map(Session::descriptor)
    }

    /// Refresh a session's activity time. Returns false for unknown ids.
    pub async fn touch(&self, id: &str) -> bool {
        match self.sessions.lock().await.get_mut(id) {
            Some(session) => {
                session.last_active = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Terminate the session's process and forget the session. Generated
    /// segments stay on disk for readers still fetching them.
    pub async fn stop(&self, id: &str) -> bool {
        let removed = {
            let mut sessions = self.sessions.lock().await;
            let removed = sessions.remove(id);
            metrics::gauge!("transcode_sessions_active").set(sessions.len() as f64);
            removed
        };
        match removed {
            Some(session) => {
                shutdown(&session);
                true
            }
            None => false,
        }
    }

    /// Stop every session idle for longer than the TTL. Returns the stopped ids.
    ///
    /// Expiry is decided and the sessions removed under one lock, so a
    /// session touched concurrently is either kept or already gone.
    pub async fn reap_idle(&self) -> Vec<String> {
        let expired: Vec<Session> = {
            let mut sessions = self.sessions.lock().await;
            let ids: Vec<String> = sessions
                .values()
                .filter(|s| s.last_active.elapsed() > self.idle_ttl)
                .map(|s| s.id.clone())
                .collect();
            let expired: Vec<Session> = ids.iter().filter_map(|id| sessions.remove(id)).collect();
            metrics::gauge!("transcode_sessions_active").set(sessions.len() as f64);
            expired
        };
        expired
            .into_iter()
            .map(|session| {
                tracing::info!(session_id = %session.id, "Idle transcode session");
                shutdown(&session);
                session.id
            })
            .collect()
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        for id in ids {
            self.stop(&id).await;
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_backend_available(&self) -> bool {
        self.launcher.is_available().await
    }

    /// Run the idle reaper every `interval` until `cancel` fires.
    pub fn spawn_reaper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.reap_idle().await;
                    }
                }
            }
            tracing::debug!("Transcode reaper stopped");
        })
    }
}

async fn mark_exited(manager: Weak<TranscodeManager>, id: &str, generation: u64) {
    let Some(manager) = manager.upgrade() else {
        return;
    };
    let mut sessions = manager.sessions.lock().await;
    if let Some(session) = sessions.get_mut(id) {
        if session.generation == generation {
            session.process = None;
        }
    }
}

fn shutdown(session: &Session) {
    if let Some(process) = &session.process {
        process.kill();
    }
    tracing::info!(session_id = %session.id, "Stopped transcode session");
}

#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("failed to launch transcoder: {0}")]
    Launch(#[from] io::Error),
}
