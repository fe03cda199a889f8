//! Low-latency pass-through of camera MJPEG streams.

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use futures::StreamExt;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use crate::models::stream::{ProbeResponse, TargetQuery};
use crate::services::address::{
    append_query, guess_stream_url, is_http_url, normalize_url, strip_query_params,
};
use crate::services::classifier::truncate;
use crate::services::registry::DeviceRegistry;

/// Query parameters consumed by the proxy itself; everything else is passed
/// through to the camera.
pub const CONTROL_PARAMS: &[&str] = &["url", "device_id", "target_ip"];

/// Content type used when the camera does not send one.
pub const DEFAULT_STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Characters of an upstream error body kept in the error message.
const ERROR_BODY_LIMIT: usize = 200;

/// Which rule produced a proxy target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum TargetSource {
    Override,
    Device,
    AddressRegistered,
    AddressGuessed,
    EnvDefault,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub url: String,
    pub source: TargetSource,
}

impl ResolvedTarget {
    fn new(url: impl AsRef<str>, source: TargetSource) -> Self {
        Self {
            url: normalize_url(url.as_ref()),
            source,
        }
    }

    /// Reject anything that is not a well-formed http(s) URL before a
    /// connection is attempted.
    fn checked(self) -> Result<Self, ProxyError> {
        if is_http_url(&self.url) {
            Ok(self)
        } else {
            Err(ProxyError::InvalidUrl(self.url))
        }
    }
}

pub struct StreamProxy {
    registry: Arc<DeviceRegistry>,
    http: Client,
    probe_timeout: Duration,
    default_url: Option<String>,
    fallback_url: String,
}

impl StreamProxy {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        probe_timeout: Duration,
        default_url: Option<String>,
        fallback_url: impl Into<String>,
    ) -> Result<Self, ProxyError> {
        // No overall timeout: stream connections stay open as long as the viewer does.
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(ProxyError::Client)?;
        Ok(Self {
            registry,
            http,
            probe_timeout,
            default_url: default_url.filter(|u| !u.trim().is_empty()),
            fallback_url: fallback_url.into(),
        })
    }

    /// Resolve the camera to proxy for a `/device_stream` request.
    ///
    /// First match wins: explicit `url`, registered `device_id`, registered
    /// or guessed `target_ip`, configured default, hardcoded fallback.
    pub async fn resolve(&self, query: &TargetQuery) -> Result<ResolvedTarget, ProxyError> {
        if let Some(url) = query.url() {
            return ResolvedTarget::new(url, TargetSource::Override).checked();
        }

        if let Some(device_id) = query.device_id() {
            if let Some(url) = self.registry.get(device_id).await {
                return ResolvedTarget::new(url, TargetSource::Device).checked();
            }
            tracing::debug!(device_id = %device_id, "No stream registered for device");
        }

        if let Some(ip) = query.target_ip() {
            return self.resolve_address(ip).await.checked();
        }

        if let Some(url) = &self.default_url {
            return ResolvedTarget::new(url, TargetSource::EnvDefault).checked();
        }

        ResolvedTarget::new(&self.fallback_url, TargetSource::Fallback).checked()
    }

    /// Resolve the target of a probe or normalize request, which never
    /// consult the registry or the hardcoded fallback.
    pub fn resolve_direct(&self, query: &TargetQuery) -> Result<ResolvedTarget, ProxyError> {
        let target = if let Some(url) = query.url() {
            ResolvedTarget::new(url, TargetSource::Override)
        } else if let Some(ip) = query.target_ip() {
            ResolvedTarget::new(guess_stream_url(ip), TargetSource::AddressGuessed)
        } else {
            match &self.default_url {
                Some(url) => ResolvedTarget::new(url, TargetSource::EnvDefault),
                None => return Err(ProxyError::MissingTarget),
            }
        };
        target.checked()
    }

    /// Resolve the source of a transcode session. Only explicit selectors are
    /// honoured and a `device_id` with no registered stream is an error.
    pub async fn resolve_for_transcode(&self, query: &TargetQuery) -> Result<ResolvedTarget, ProxyError> {
        let target = if let Some(url) = query.url() {
            ResolvedTarget::new(url, TargetSource::Override)
        } else if let Some(device_id) = query.device_id() {
            match self.registry.get(device_id).await {
                Some(url) => ResolvedTarget::new(url, TargetSource::Device),
                None => return Err(ProxyError::UnknownDevice(device_id.to_string())),
            }
        } else if let Some(ip) = query.target_ip() {
            self.resolve_address(ip).await
        } else {
            return Err(ProxyError::MissingTarget);
        };
        target.checked()
    }

    async fn resolve_address(&self, ip: &str) -> ResolvedTarget {
        match self.registry.get_by_ip(ip).await {
            Some(url) => ResolvedTarget::new(url, TargetSource::AddressRegistered),
            None => ResolvedTarget::new(guess_stream_url(ip), TargetSource::AddressGuessed),
        }
    }

    /// Open `target` and stream its body back unchanged.
    ///
    /// `query` is the caller's raw query string; control parameters are
    /// removed before it is appended to the outbound URL. A non-2xx answer is
    /// an error; once a 2xx response has been relayed, an upstream failure
    /// ends the response body instead of surfacing as an error.
    pub async fn forward(&self, target: &ResolvedTarget, query: Option<&str>) -> Result<Response, ProxyError> {
        let outbound = append_query(&target.url, &strip_query_params(query, CONTROL_PARAMS));
        self.forward_url(&outbound, target.source.into()).await
    }

    /// Stream `url` with the caller's query appended untouched.
    pub async fn forward_raw(&self, url: &str, query: Option<&str>) -> Result<Response, ProxyError> {
        let outbound = match query.filter(|q| !q.is_empty()) {
            Some(q) => append_query(url, &format!("?{}", q)),
            None => url.to_string(),
        };
        self.forward_url(&outbound, "video_feed").await
    }

    async fn forward_url(&self, outbound: &str, source: &'static str) -> Result<Response, ProxyError> {
        tracing::info!(target_url = %outbound, source, "Proxying stream");
        metrics::counter!("proxy_connections_total", "source" => source).increment(1);

        let upstream = self
            .http
            .get(outbound)
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;

        if !upstream.status().is_success() {
            let status = upstream.status();
            let body = tokio::time::timeout(self.probe_timeout, upstream.text())
                .await
                .ok()
                .and_then(|text| text.ok())
                .unwrap_or_default();
            tracing::warn!(target_url = %outbound, status = status.as_u16(), "Upstream refused stream");
            return Err(ProxyError::Upstream(format!(
                "{} answered {}: {}",
                outbound,
                status.as_u16(),
                truncate(body.trim(), ERROR_BODY_LIMIT)
            )));
        }

        let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::OK);
        let content_type = upstream
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| HeaderValue::from_bytes(v.as_bytes()).ok())
            .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_STREAM_CONTENT_TYPE));

        let target = outbound.to_string();
        let bytes = upstream
            .bytes_stream()
            .scan(target, |target, chunk| {
                let next = match chunk {
                    Ok(bytes) => Some(Ok::<_, std::io::Error>(bytes)),
                    Err(e) => {
                        tracing::warn!(target_url = %target, error = %e, "Upstream stream ended with error");
                        None
                    }
                };
                futures::future::ready(next)
            });

        let mut response = Response::new(Body::from_stream(bytes));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, content_type);
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        Ok(response)
    }

    /// Check that a target answers and report its content type.
    pub async fn probe(&self, target: &ResolvedTarget) -> Result<ProbeResponse, ProxyError> {
        let response = self
            .http
            .get(&target.url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| ProxyError::Probe {
                target: target.url.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if !status.is_success() {
            return Err(ProxyError::ProbeStatus {
                target: target.url.clone(),
                status: status.as_u16(),
                content_type,
            });
        }

        Ok(ProbeResponse {
            ok: true,
            target: target.url.clone(),
            status: status.as_u16(),
            content_type,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("not a valid http(s) URL: {0}")]
    InvalidUrl(String),

    #[error("no stream target: pass url or target_ip, or set DEFAULT_STREAM_URL")]
    MissingTarget,

    #[error("no stream registered for device {0}")]
    UnknownDevice(String),

    #[error("upstream stream unavailable: {0}")]
    Upstream(String),

    #[error("probe of {target} failed: {reason}")]
    Probe { target: String, reason: String },

    #[error("probe of {target} answered {status}")]
    ProbeStatus {
        target: String,
        status: u16,
        content_type: String,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),
}
