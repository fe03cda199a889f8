//! Bounded detection job queue.
//!
//! Frames are classified by a remote service that can only sustain a few
//! concurrent calls. The queue keeps at most `workers` classifier calls in
//! flight, holds at most `max_queue` waiting jobs, and sheds load beyond that
//! with [`QueueError::QueueFull`]. Waiting jobs start in FIFO order.

use bytes::Bytes;
use futures::FutureExt;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

use crate::models::job::{JobOptions, QueueEvent, QueueStats};
use crate::services::classifier::{Classifier, ClassifierError};

const EVENT_CAPACITY: usize = 64;

type JobResult = Result<serde_json::Value, QueueError>;

struct Job {
    id: Uuid,
    image: Bytes,
    timeout: Duration,
    enqueued_at: Instant,
    reply: oneshot::Sender<JobResult>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Job>,
    active: usize,
}

pub struct DetectQueue {
    classifier: Arc<dyn Classifier>,
    workers: usize,
    max_queue: usize,
    default_timeout: Duration,
    state: Mutex<QueueState>,
    events: broadcast::Sender<QueueEvent>,
}

impl DetectQueue {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        workers: usize,
        max_queue: usize,
        default_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            classifier,
            workers: workers.max(1),
            max_queue,
            default_timeout,
            state: Mutex::new(QueueState::default()),
            events,
        }
    }

    /// Queue a frame for classification.
    ///
    /// Fails immediately with `QueueFull` when `max_queue` jobs are already
    /// waiting. The returned handle settles exactly once with the
    /// classification document or the job's error.
    pub fn enqueue(self: &Arc<Self>, image: Bytes, opts: JobOptions) -> Result<JobHandle, QueueError> {
        let (reply, rx) = oneshot::channel();
        let id = Uuid::new_v4();

        {
            let mut state = self.lock();
            if state.pending.len() >= self.max_queue {
                metrics::counter!("detect_jobs_rejected").increment(1);
                tracing::warn!(
                    job_active = state.active,
                    job_queued = state.pending.len(),
                    max_queue = self.max_queue,
                    "Detect queue full, rejecting job"
                );
                return Err(QueueError::QueueFull {
                    max_queue: self.max_queue,
                });
            }
            state.pending.push_back(Job {
                id,
                image,
                timeout: opts.timeout.unwrap_or(self.default_timeout),
                enqueued_at: Instant::now(),
                reply,
            });
            metrics::gauge!("detect_queue_depth").set(state.pending.len() as f64);
        }
        metrics::counter!("detect_jobs_total").increment(1);

        self.dispatch();
        Ok(JobHandle { id, rx })
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            active: state.active,
            queued: state.pending.len(),
            workers: self.workers,
            max_queue: self.max_queue,
        }
    }

    /// Subscribe to job lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Start waiting jobs while worker slots are free.
    fn dispatch(self: &Arc<Self>) {
        loop {
            let (job, active, queued) = {
                let mut state = self.lock();
                if state.active >= self.workers {
                    return;
                }
                let Some(job) = state.pending.pop_front() else {
                    return;
                };
                state.active += 1;
                metrics::gauge!("detect_queue_depth").set(state.pending.len() as f64);
                metrics::gauge!("detect_jobs_active").set(state.active as f64);
                (job, state.active, state.pending.len())
            };

            tracing::debug!(
                job_id = %job.id,
                job_active = active,
                job_queued = queued,
                waited_ms = job.enqueued_at.elapsed().as_millis() as u64,
                "Starting detect job"
            );
            let _ = self.events.send(QueueEvent::Started {
                job_id: job.id,
                active,
                queued,
            });

            let queue = Arc::clone(self);
            tokio::spawn(async move { queue.run(job).await });
        }
    }

    async fn run(self: Arc<Self>, job: Job) {
        let started = Instant::now();
        let call = tokio::time::timeout(
            job.timeout,
            self.classifier.classify(job.image, job.timeout),
        );
        let outcome = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(e))) => Err(QueueError::from(e)),
            Ok(Err(_elapsed)) => Err(QueueError::ClassifierTimeout(job.timeout)),
            Err(_panic) => Err(QueueError::ClassifierUnavailable(
                "classifier call panicked".to_string(),
            )),
        };
        metrics::histogram!("detect_job_seconds").record(started.elapsed().as_secs_f64());

        let (active, queued) = {
            let state = self.lock();
            (state.active.saturating_sub(1), state.pending.len())
        };

        match outcome {
            Ok(result) => {
                metrics::counter!("detect_jobs_completed").increment(1);
                tracing::info!(
                    job_id = %job.id,
                    job_active = active,
                    job_queued = queued,
                    "Detect job done"
                );
                let _ = self.events.send(QueueEvent::Done {
                    job_id: job.id,
                    active,
                    queued,
                    result: result.clone(),
                });
                let _ = job.reply.send(Ok(result));
            }
            Err(e) => {
                metrics::counter!("detect_jobs_failed").increment(1);
                tracing::warn!(
                    job_id = %job.id,
                    job_active = active,
                    job_queued = queued,
                    error = %e,
                    "Detect job failed"
                );
                let _ = self.events.send(QueueEvent::JobError {
                    job_id: job.id,
                    active,
                    queued,
                    error: e.to_string(),
                });
                let _ = job.reply.send(Err(e));
            }
        }

        {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);
            metrics::gauge!("detect_jobs_active").set(state.active as f64);
        }
        self.dispatch();
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Completion handle of a queued job. Resolves once the job settles.
pub struct JobHandle {
    id: Uuid,
    rx: oneshot::Receiver<JobResult>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Future for JobHandle {
    type Output = JobResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|settled| settled.unwrap_or(Err(QueueError::Abandoned)))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("detect queue is full ({max_queue} jobs waiting)")]
    QueueFull { max_queue: usize },

    #[error("classifier timed out after {0:?}")]
    ClassifierTimeout(Duration),

    #[error("classifier unavailable: {0}")]
    ClassifierUnavailable(String),

    #[error("detect job was dropped before it settled")]
    Abandoned,
}

impl From<ClassifierError> for QueueError {
    fn from(err: ClassifierError) -> Self {
        match err {
            ClassifierError::Timeout(d) => QueueError::ClassifierTimeout(d),
            other => QueueError::ClassifierUnavailable(other.to_string()),
        }
    }
}
