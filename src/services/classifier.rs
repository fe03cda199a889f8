use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::time::Duration;

/// Longest upstream error body kept in an error message.
const MAX_ERROR_BODY: usize = 500;

/// Remote image classifier. Accepts an image and returns its classification
/// document, which the gateway forwards without interpreting.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        image: Bytes,
        timeout: Duration,
    ) -> Result<serde_json::Value, ClassifierError>;
}

/// Classifier reached over HTTP: raw image bytes in, JSON document out.
pub struct HttpClassifier {
    http: Client,
    detect_url: String,
}

impl HttpClassifier {
    pub fn new(detect_url: impl Into<String>) -> Result<Self, ClassifierError> {
        let http = Client::builder()
            .build()
            .map_err(|e| ClassifierError::Unavailable(e.to_string()))?;
        Ok(Self {
            http,
            detect_url: detect_url.into(),
        })
    }

    pub fn detect_url(&self) -> &str {
        &self.detect_url
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(
        &self,
        image: Bytes,
        timeout: Duration,
    ) -> Result<serde_json::Value, ClassifierError> {
        tracing::debug!(
            url = %self.detect_url,
            bytes = image.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Calling classifier"
        );

        let response = self
            .http
            .post(&self.detect_url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .timeout(timeout)
            .body(image)
            .send()
            .await
            .map_err(|e| ClassifierError::from_request(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Rejected {
                status: status.as_u16(),
                body: truncate(&body, MAX_ERROR_BODY),
            });
        }

        response
            .json()
            .await
            .map_err(|e| ClassifierError::from_request(e, timeout))
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("classifier did not answer within {0:?}")]
    Timeout(Duration),

    #[error("classifier unreachable: {0}")]
    Unavailable(String),

    #[error("classifier rejected the image: status={status}, body={body}")]
    Rejected { status: u16, body: String },

    #[error("classifier returned an unreadable document: {0}")]
    InvalidResponse(String),
}

impl ClassifierError {
    fn from_request(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            ClassifierError::Timeout(timeout)
        } else if err.is_decode() {
            ClassifierError::InvalidResponse(err.to_string())
        } else {
            ClassifierError::Unavailable(err.to_string())
        }
    }
}
