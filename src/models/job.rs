use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

/// Per-job overrides for a detection job.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Classifier call timeout; the queue default applies when unset.
    pub timeout: Option<Duration>,
}

/// Snapshot of the detection queue's load.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub active: usize,
    pub queued: usize,
    pub workers: usize,
    pub max_queue: usize,
}

impl QueueStats {
    /// True when a new job would be rejected.
    pub fn is_saturated(&self) -> bool {
        self.queued >= self.max_queue
    }
}

/// Progress events emitted by the detection queue.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    Started {
        job_id: Uuid,
        active: usize,
        queued: usize,
    },
    Done {
        job_id: Uuid,
        active: usize,
        queued: usize,
        result: serde_json::Value,
    },
    JobError {
        job_id: Uuid,
        active: usize,
        queued: usize,
        error: String,
    },
}
