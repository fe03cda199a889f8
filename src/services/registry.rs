//! Persistent device stream registry.
//!
//! Maps a device id, or a source address key (`ip:<addr>`), to the URL its
//! live stream is served on. The whole map is rewritten to a single JSON
//! document after every mutation using write-to-temp, rotate-to-backup,
//! rename-into-place, so the live file is never seen half-written. Disk
//! failures are logged and the registry keeps serving from memory.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::models::device::{
    DeviceEntry, RegistryDocument, RegistryStatus, UploadOrigin, REGISTRY_VERSION,
};
use crate::services::address::{
    canonical_key, guess_stream_url, ip_key, is_http_url, normalize_url,
};

#[derive(Default)]
struct RegistryState {
    entries: BTreeMap<String, DeviceEntry>,
    last_saved: Option<DateTime<Utc>>,
}

pub struct DeviceRegistry {
    path: PathBuf,
    state: RwLock<RegistryState>,
}

impl DeviceRegistry {
    /// Load the registry document at `path`, normalizing every entry.
    ///
    /// A missing or unreadable document yields an empty registry. If
    /// normalization changed anything the corrected map is written back
    /// immediately.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        Self::load_with_report(path).await.0
    }

    /// Like [`DeviceRegistry::load`], also returning how many stored entries
    /// were rewritten into canonical form.
    pub async fn load_with_report(path: impl Into<PathBuf>) -> (Self, usize) {
        let path = path.into();
        let mut state = RegistryState::default();

        let document = match read_document(&path).await {
            Ok(document) => Some(document),
            Err(RegistryError::Io(e)) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to load device registry");
                None
            }
        };

        let mut migrated = 0;
        if let Some(document) = document {
            state.last_saved = document.saved;
            let (entries, changed) = normalize_entries(document.data);
            state.entries = entries;
            migrated = changed;
        }

        tracing::info!(
            path = %path.display(),
            entries = state.entries.len(),
            migrated,
            "Device registry loaded"
        );

        let registry = Self {
            path,
            state: RwLock::new(state),
        };
        if migrated > 0 {
            tracing::info!(migrated, "Migrating stored registry entries to normalized form");
            let mut state = registry.state.write().await;
            registry.persist(&mut state).await;
        }
        (registry, migrated)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register `url` under `key`, replacing any existing entry.
    pub async fn set(&self, key: &str, url: &str) -> bool {
        self.insert(key, url, true).await
    }

    /// Register `url` under `key` only when the key has no entry. The check
    /// and the insert happen under one write guard.
    async fn set_if_absent(&self, key: &str, url: &str) -> bool {
        self.insert(key, url, false).await
    }

    async fn insert(&self, key: &str, url: &str, replace: bool) -> bool {
        let key = canonical_key(key);
        let url = normalize_url(url);
        if key.is_empty() || url.is_empty() {
            return false;
        }

        let mut state = self.state.write().await;
        if !replace && state.entries.contains_key(&key) {
            return false;
        }
        tracing::debug!(device_key = %key, url = %url, "Registering device stream");
        state.entries.insert(key, DeviceEntry::new(url));
        self.persist(&mut state).await;
        true
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.entry(key).await.map(|e| e.url)
    }

    pub async fn entry(&self, key: &str) -> Option<DeviceEntry> {
        let key = canonical_key(key);
        self.state.read().await.entries.get(&key).cloned()
    }

    pub async fn set_by_ip(&self, ip: &str, url: &str) -> bool {
        self.set(&ip_key(ip), url).await
    }

    pub async fn get_by_ip(&self, ip: &str) -> Option<String> {
        self.get(&ip_key(ip)).await
    }

    /// Record a signal reading for an existing entry. Returns false when the
    /// key has no entry yet.
    pub async fn set_signal(&self, key: &str, signal: f64) -> bool {
        let key = canonical_key(key);
        if key.is_empty() || !signal.is_finite() {
            return false;
        }

        let mut state = self.state.write().await;
        let Some(entry) = state.entries.get_mut(&key) else {
            return false;
        };
        entry.signal = Some(signal);
        entry.last_seen = Utc::now();
        self.persist(&mut state).await;
        true
    }

    pub async fn set_signal_by_ip(&self, ip: &str, signal: f64) -> bool {
        self.set_signal(&ip_key(ip), signal).await
    }

    /// Speculatively register the conventional stream URL for an address that
    /// has no entry. Returns the guess when one was registered.
    pub async fn guess_for_ip(&self, ip: &str) -> Option<String> {
        let guessed = guess_stream_url(ip);
        self.set_if_absent(&ip_key(ip), &guessed)
            .await
            .then_some(guessed)
    }

    pub async fn list(&self) -> BTreeMap<String, DeviceEntry> {
        self.state.read().await.entries.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn status(&self) -> RegistryStatus {
        let (last_saved, entries) = {
            let state = self.state.read().await;
            (state.last_saved, state.entries.len())
        };
        let size = tokio::fs::metadata(&self.path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        RegistryStatus {
            last_saved,
            size,
            entries,
        }
    }

    /// Re-normalize every in-memory entry and persist when anything changed.
    /// Returns the number of entries rewritten.
    pub async fn normalize_all(&self) -> usize {
        let mut state = self.state.write().await;
        let (entries, changed) = normalize_entries(std::mem::take(&mut state.entries));
        state.entries = entries;
        if changed > 0 {
            self.persist(&mut state).await;
        }
        changed
    }

    /// Registry bookkeeping for an uploaded frame.
    ///
    /// Records the signal reading, registers an advertised stream URL, or
    /// guesses one for a source address that has no entry yet. Never fails
    /// the upload.
    pub async fn record_upload(&self, origin: &UploadOrigin) {
        let device_id = origin.device_id.as_deref().filter(|id| !id.is_empty());
        let source_ip = origin.source_ip.as_deref().filter(|ip| !ip.is_empty());

        if let Some(signal) = origin.signal {
            let recorded = match (device_id, source_ip) {
                (Some(id), _) => self.set_signal(id, signal).await,
                (None, Some(ip)) => self.set_signal_by_ip(ip, signal).await,
                (None, None) => false,
            };
            if !recorded {
                tracing::debug!(?device_id, ?source_ip, signal, "Signal for unregistered device ignored");
            }
        }

        match origin.stream_url.as_deref().filter(|u| is_http_url(u)) {
            Some(stream_url) => match (device_id, source_ip) {
                (Some(id), _) => {
                    if self.set(id, stream_url).await {
                        tracing::info!(device_id = %id, url = %stream_url, "Registered advertised stream URL");
                    }
                }
                (None, Some(ip)) => {
                    if self.set_by_ip(ip, stream_url).await {
                        tracing::info!(source_ip = %ip, url = %stream_url, "Registered advertised stream URL");
                    }
                }
                (None, None) => {}
            },
            None => {
                let Some(ip) = source_ip else {
                    return;
                };
                let Some(guessed) = self.guess_for_ip(ip).await else {
                    return;
                };
                tracing::info!(source_ip = %ip, url = %guessed, "Guessed and registered stream URL");

                if let Some(id) = device_id {
                    if self.set_if_absent(id, &guessed).await {
                        tracing::info!(device_id = %id, url = %guessed, "Guessed and registered stream URL");
                    }
                }
            }
        }
    }

    async fn persist(&self, state: &mut RegistryState) {
        let now = Utc::now();
        let document = RegistryDocument {
            version: REGISTRY_VERSION,
            data: state.entries.clone(),
            saved: Some(now),
        };
        match write_document(&self.path, &document).await {
            Ok(()) => state.last_saved = Some(now),
            Err(e) => {
                metrics::counter!("registry_persist_failures").increment(1);
                tracing::error!(path = %self.path.display(), error = %e, "Failed to persist device registry");
            }
        }
    }
}

/// Canonicalize keys and URLs. When two stored keys collapse into one, the
/// most recently seen entry wins.
fn normalize_entries(
    entries: BTreeMap<String, DeviceEntry>,
) -> (BTreeMap<String, DeviceEntry>, usize) {
    let mut out: BTreeMap<String, DeviceEntry> = BTreeMap::new();
    let mut changed = 0;

    for (key, mut entry) in entries {
        let new_key = canonical_key(&key);
        let new_url = normalize_url(&entry.url);
        if new_key.is_empty() || new_url.is_empty() {
            tracing::warn!(device_key = %key, "Dropping registry entry without key or url");
            changed += 1;
            continue;
        }
        if new_key != key || new_url != entry.url {
            changed += 1;
        }
        entry.url = new_url;

        match out.get(&new_key) {
            Some(existing) if existing.last_seen >= entry.last_seen => {}
            _ => {
                out.insert(new_key, entry);
            }
        }
    }
    (out, changed)
}

async fn read_document(path: &Path) -> Result<RegistryDocument, RegistryError> {
    let raw = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&raw)?)
}

async fn write_document(path: &Path, document: &RegistryDocument) -> Result<(), RegistryError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await?;
    }
    let payload = serde_json::to_vec_pretty(document)?;

    let tmp = with_suffix(path, ".tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&payload).await?;
    file.sync_all().await?;
    drop(file);

    match tokio::fs::rename(path, with_suffix(path, ".bak")).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry document is malformed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TempDir(PathBuf);

    impl TempDir {
        fn new() -> Self {
            let dir = std::env::temp_dir().join(format!("registry-test-{}", uuid::Uuid::new_v4()));
            std::fs::create_dir_all(&dir).unwrap();
            Self(dir)
        }

        fn file(&self, name: &str) -> PathBuf {
            self.0.join(name)
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    #[tokio::test]
    async fn test_set_survives_reload() {
        let tmp = TempDir::new();
        let path = tmp.file("device_streams.json");

        let registry = DeviceRegistry::load(&path).await;
        assert!(registry.set("cam-01", "http://::ffff:10.0.0.9:81/stream").await);
        drop(registry);

        let reloaded = DeviceRegistry::load(&path).await;
        assert_eq!(
            reloaded.get("cam-01").await.as_deref(),
            Some("http://10.0.0.9:81/stream")
        );
    }

    #[tokio::test]
    async fn test_mapped_and_plain_addresses_share_one_entry() {
        let tmp = TempDir::new();
        let registry = DeviceRegistry::load(tmp.file("r.json")).await;

        registry
            .set_by_ip("::ffff:192.168.1.15", "http://[::ffff:192.168.1.15]:81/stream")
            .await;
        assert_eq!(
            registry.get_by_ip("192.168.1.15").await.as_deref(),
            Some("http://192.168.1.15:81/stream")
        );

        registry
            .set_by_ip("192.168.1.15", "http://192.168.1.15:81/stream")
            .await;
        let all = registry.list().await;
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("ip:192.168.1.15"));
        assert_eq!(
            registry.get("ip:::ffff:192.168.1.15").await.as_deref(),
            Some("http://192.168.1.15:81/stream")
        );
    }

    #[tokio::test]
    async fn test_set_rejects_empty_values() {
        let tmp = TempDir::new();
        let registry = DeviceRegistry::load(tmp.file("r.json")).await;
        assert!(!registry.set("", "http://10.0.0.1/stream").await);
        assert!(!registry.set("cam", "  ").await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_signal_requires_existing_entry() {
        let tmp = TempDir::new();
        let registry = DeviceRegistry::load(tmp.file("r.json")).await;

        assert!(!registry.set_signal("cam-01", -61.0).await);
        assert!(registry.is_empty().await);

        registry.set("cam-01", "http://10.0.0.9:81/stream").await;
        assert!(registry.set_signal("cam-01", -61.0).await);
        let entry = registry.entry("cam-01").await.unwrap();
        assert_eq!(entry.signal, Some(-61.0));
        assert_eq!(entry.url, "http://10.0.0.9:81/stream");

        // A new registration replaces the whole entry.
        registry.set("cam-01", "http://10.0.0.10:81/stream").await;
        assert_eq!(registry.entry("cam-01").await.unwrap().signal, None);
    }

    #[tokio::test]
    async fn test_load_migrates_legacy_document() {
        let tmp = TempDir::new();
        let path = tmp.file("device_streams.json");
        let legacy = serde_json::json!({
            "version": 1,
            "saved": 1_700_000_000_000i64,
            "data": {
                "ip:::ffff:10.0.0.2": {
                    "url": "http://::ffff:10.0.0.2:81/stream",
                    "lastSeen": 1_700_000_000_000i64,
                    "rssi": -70
                },
                "cam-02": { "url": "http://10.0.0.3:81/stream", "lastSeen": 1_700_000_000_000i64 }
            }
        });
        std::fs::write(&path, serde_json::to_vec(&legacy).unwrap()).unwrap();

        let (registry, migrated) = DeviceRegistry::load_with_report(&path).await;
        assert_eq!(migrated, 1);
        let entry = registry.entry("ip:10.0.0.2").await.unwrap();
        assert_eq!(entry.url, "http://10.0.0.2:81/stream");
        assert_eq!(entry.signal, Some(-70.0));
        assert_eq!(registry.normalize_all().await, 0);

        let on_disk: RegistryDocument =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(on_disk.data.contains_key("ip:10.0.0.2"));
        assert!(!on_disk.data.contains_key("ip:::ffff:10.0.0.2"));
        assert!(tmp.file("device_streams.json.bak").exists());
        assert!(!tmp.file("device_streams.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_colliding_legacy_keys_keep_most_recent() {
        let tmp = TempDir::new();
        let path = tmp.file("r.json");
        let legacy = serde_json::json!({
            "version": 1,
            "data": {
                "ip:::ffff:10.0.0.2": { "url": "http://10.0.0.2:81/old", "lastSeen": 1000 },
                "ip:10.0.0.2": { "url": "http://10.0.0.2:81/new", "lastSeen": 2000 }
            }
        });
        std::fs::write(&path, serde_json::to_vec(&legacy).unwrap()).unwrap();

        let registry = DeviceRegistry::load(&path).await;
        assert_eq!(registry.len().await, 1);
        assert_eq!(
            registry.get_by_ip("10.0.0.2").await.as_deref(),
            Some("http://10.0.0.2:81/new")
        );
    }

    #[tokio::test]
    async fn test_corrupt_document_starts_empty() {
        let tmp = TempDir::new();
        let path = tmp.file("r.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let registry = DeviceRegistry::load(&path).await;
        assert!(registry.is_empty().await);
        assert!(registry.set("cam", "http://10.0.0.1/stream").await);
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_serving_from_memory() {
        let tmp = TempDir::new();
        let blocker = tmp.file("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let registry = DeviceRegistry::load(blocker.join("r.json")).await;
        assert!(registry.set("cam-01", "http://10.0.0.9:81/stream").await);
        assert_eq!(
            registry.get("cam-01").await.as_deref(),
            Some("http://10.0.0.9:81/stream")
        );
        assert_eq!(registry.status().await.last_saved, None);
    }

    #[tokio::test]
    async fn test_status_reports_file_size() {
        let tmp = TempDir::new();
        let registry = DeviceRegistry::load(tmp.file("r.json")).await;
        registry.set("cam-01", "http://10.0.0.9:81/stream").await;

        let status = registry.status().await;
        assert_eq!(status.entries, 1);
        assert!(status.size > 0);
        assert!(status.last_saved.is_some());
    }

    #[tokio::test]
    async fn test_upload_from_unknown_address_guesses_stream() {
        let tmp = TempDir::new();
        let registry = DeviceRegistry::load(tmp.file("r.json")).await;

        registry
            .record_upload(&UploadOrigin {
                source_ip: Some("203.0.113.5".to_string()),
                ..Default::default()
            })
            .await;

        assert_eq!(
            registry.get("ip:203.0.113.5").await.as_deref(),
            Some("http://203.0.113.5:81/stream")
        );
    }

    #[tokio::test]
    async fn test_upload_guess_also_registers_device_id() {
        let tmp = TempDir::new();
        let registry = DeviceRegistry::load(tmp.file("r.json")).await;

        registry
            .record_upload(&UploadOrigin {
                source_ip: Some("::ffff:192.168.4.20".to_string()),
                device_id: Some("esp32-cam".to_string()),
                ..Default::default()
            })
            .await;

        assert_eq!(
            registry.get("esp32-cam").await.as_deref(),
            Some("http://192.168.4.20:81/stream")
        );
        assert!(registry.get_by_ip("192.168.4.20").await.is_some());
    }

    #[tokio::test]
    async fn test_upload_advertised_url_overrides_guess() {
        let tmp = TempDir::new();
        let registry = DeviceRegistry::load(tmp.file("r.json")).await;
        registry.set_by_ip("10.0.0.4", "http://10.0.0.4:81/stream").await;

        registry
            .record_upload(&UploadOrigin {
                source_ip: Some("10.0.0.4".to_string()),
                stream_url: Some("https://cam.example.net/stream".to_string()),
                signal: Some(-55.0),
                ..Default::default()
            })
            .await;

        let entry = registry.entry("ip:10.0.0.4").await.unwrap();
        assert_eq!(entry.url, "https://cam.example.net/stream");
        // The signal reading landed on the previous entry before it was replaced.
        assert_eq!(entry.signal, None);
    }

    #[tokio::test]
    async fn test_upload_keeps_existing_registration() {
        let tmp = TempDir::new();
        let registry = DeviceRegistry::load(tmp.file("r.json")).await;
        registry.set_by_ip("10.0.0.4", "http://10.0.0.4:8080/mjpeg").await;

        registry
            .record_upload(&UploadOrigin {
                source_ip: Some("10.0.0.4".to_string()),
                signal: Some(-48.0),
                ..Default::default()
            })
            .await;

        let entry = registry.entry("ip:10.0.0.4").await.unwrap();
        assert_eq!(entry.url, "http://10.0.0.4:8080/mjpeg");
        assert_eq!(entry.signal, Some(-48.0));
    }

    #[tokio::test]
    async fn test_guess_never_replaces_an_existing_entry() {
        let tmp = TempDir::new();
        let registry = DeviceRegistry::load(tmp.file("r.json")).await;
        registry.set("cam-9", "http://10.0.0.9:8080/mjpeg").await;
        registry.set_by_ip("10.0.0.9", "http://10.0.0.9:8080/mjpeg").await;

        assert_eq!(registry.guess_for_ip("10.0.0.9").await, None);
        assert!(!registry.set_if_absent("cam-9", "http://10.0.0.9:81/stream").await);
        assert_eq!(
            registry.get("cam-9").await.as_deref(),
            Some("http://10.0.0.9:8080/mjpeg")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_guesses_do_not_clobber_advertised_url() {
        let tmp = TempDir::new();
        let registry = std::sync::Arc::new(DeviceRegistry::load(tmp.file("r.json")).await);

        let mut tasks = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let stream_url = (i == 16).then(|| "http://10.0.0.5:8080/mjpeg".to_string());
                registry
                    .record_upload(&UploadOrigin {
                        source_ip: Some("10.0.0.5".to_string()),
                        device_id: Some("cam-5".to_string()),
                        stream_url,
                        ..Default::default()
                    })
                    .await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(
            registry.get("cam-5").await.as_deref(),
            Some("http://10.0.0.5:8080/mjpeg")
        );
    }
}
