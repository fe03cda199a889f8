//! HTTP-facing error type for the gateway's routes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::services::classifier::ClassifierError;
use crate::services::detect_queue::QueueError;
use crate::services::stream_proxy::ProxyError;
use crate::services::transcode::TranscodeError;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Stable machine-readable error codes sent in the `error` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCode {
    InvalidUrl,
    MissingTarget,
    NoImageProvided,
    InvalidRequest,
    NotFound,
    NotReady,
    DetectQueueFull,
    TranscodeUnavailable,
    ClassifierTimeout,
    ClassifierUnavailable,
    BadGateway,
    UpstreamResponse,
    RequestError,
    InternalError,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("{0}")]
    MissingTarget(String),

    #[error("no image provided")]
    NoImageProvided,

    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    NotReady(String),

    #[error("detect queue is full")]
    QueueFull { max_queue: usize },

    #[error("transcoding backend is not available")]
    TranscodeUnavailable,

    #[error("classifier timed out")]
    ClassifierTimeout,

    #[error("{0}")]
    ClassifierUnavailable(String),

    #[error("{0}")]
    BadGateway(String),

    /// Probe reached the target but it answered with a failure status.
    #[error("target answered {status}")]
    ProbeStatus {
        target: String,
        status: u16,
        content_type: String,
    },

    /// Probe could not complete the request.
    #[error("{reason}")]
    ProbeRequest { target: String, reason: String },

    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::InvalidUrl(_) => ErrorCode::InvalidUrl,
            GatewayError::MissingTarget(_) => ErrorCode::MissingTarget,
            GatewayError::NoImageProvided => ErrorCode::NoImageProvided,
            GatewayError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            GatewayError::NotFound(_) => ErrorCode::NotFound,
            GatewayError::NotReady(_) => ErrorCode::NotReady,
            GatewayError::QueueFull { .. } => ErrorCode::DetectQueueFull,
            GatewayError::TranscodeUnavailable => ErrorCode::TranscodeUnavailable,
            GatewayError::ClassifierTimeout => ErrorCode::ClassifierTimeout,
            GatewayError::ClassifierUnavailable(_) => ErrorCode::ClassifierUnavailable,
            GatewayError::BadGateway(_) => ErrorCode::BadGateway,
            GatewayError::ProbeStatus { .. } => ErrorCode::UpstreamResponse,
            GatewayError::ProbeRequest { .. } => ErrorCode::RequestError,
            GatewayError::Internal(_) => ErrorCode::InternalError,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.code() {
            ErrorCode::InvalidUrl
            | ErrorCode::MissingTarget
            | ErrorCode::NoImageProvided
            | ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound | ErrorCode::NotReady => StatusCode::NOT_FOUND,
            ErrorCode::DetectQueueFull | ErrorCode::TranscodeUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorCode::ClassifierTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::ClassifierUnavailable
            | ErrorCode::BadGateway
            | ErrorCode::UpstreamResponse
            | ErrorCode::RequestError => StatusCode::BAD_GATEWAY,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code: &'static str = self.code().into();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::warn!(status = %status, error_code = code, message = %message, "Request error");
        } else {
            tracing::debug!(status = %status, error_code = code, message = %message, "Request rejected");
        }

        let mut body = json!({
            "ok": false,
            "error": code,
            "message": message,
        });
        match &self {
            GatewayError::QueueFull { max_queue } => {
                body["maxQueue"] = json!(max_queue);
            }
            GatewayError::ProbeStatus { target, status, content_type } => {
                body["target"] = json!(target);
                body["status"] = json!(status);
                body["contentType"] = json!(content_type);
            }
            GatewayError::ProbeRequest { target, .. } => {
                body["target"] = json!(target);
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}

impl From<QueueError> for GatewayError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::QueueFull { max_queue } => GatewayError::QueueFull { max_queue },
            QueueError::ClassifierTimeout(_) => GatewayError::ClassifierTimeout,
            QueueError::ClassifierUnavailable(msg) => GatewayError::ClassifierUnavailable(msg),
            QueueError::Abandoned => GatewayError::Internal(QueueError::Abandoned.to_string()),
        }
    }
}

impl From<ClassifierError> for GatewayError {
    fn from(err: ClassifierError) -> Self {
        match err {
            ClassifierError::Timeout(_) => GatewayError::ClassifierTimeout,
            other => GatewayError::ClassifierUnavailable(other.to_string()),
        }
    }
}

impl From<ProxyError> for GatewayError {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::InvalidUrl(url) => GatewayError::InvalidUrl(url),
            ProxyError::MissingTarget => GatewayError::MissingTarget(ProxyError::MissingTarget.to_string()),
            err @ ProxyError::UnknownDevice(_) => GatewayError::NotFound(err.to_string()),
            ProxyError::Upstream(msg) => GatewayError::BadGateway(msg),
            ProxyError::Probe { target, reason } => GatewayError::ProbeRequest { target, reason },
            ProxyError::ProbeStatus { target, status, content_type } => GatewayError::ProbeStatus {
                target,
                status,
                content_type,
            },
            ProxyError::Client(e) => GatewayError::Internal(e.to_string()),
        }
    }
}

impl From<TranscodeError> for GatewayError {
    fn from(err: TranscodeError) -> Self {
        GatewayError::Internal(err.to_string())
    }
}
