//! Bounded worker pool for music-recognition jobs.
//!
//! Recognition runs behind the [`Recognizer`] trait; workers are opaque
//! executors that process one job at a time and own temp-file cleanup. The
//! pool keeps a queue-depth counter and refuses new work once it reaches the
//! cap, which the HTTP layer surfaces as a 503.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::{LuminaError, LuminaResult};
use crate::protocol_constants::IDENTIFY_QUEUE_MAX;

/// Outcome of one recognition run. `Ok(None)` means the sample matched
/// nothing, which is a normal result, not an error.
pub type RecognizeOutcome = Result<Option<serde_json::Value>, String>;

/// Music-recognition backend. The real library lives outside this crate;
/// the relay only depends on this contract.
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn recognize(&self, audio_path: &Path) -> RecognizeOutcome;
}

/// Shells out to a configured command with the audio path as its single
/// argument and parses stdout as JSON. Empty output or `null` is a no-match.
pub struct CommandRecognizer {
    program: String,
}

impl CommandRecognizer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl Recognizer for CommandRecognizer {
    async fn recognize(&self, audio_path: &Path) -> RecognizeOutcome {
        let output = tokio::process::Command::new(&self.program)
            .arg(audio_path)
            .output()
            .await
            .map_err(|e| format!("failed to spawn {}: {}", self.program, e))?;
        if !output.status.success() {
            return Err(format!("{} exited with {}", self.program, output.status));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Ok(None);
        }
        serde_json::from_str(trimmed)
            .map(Some)
            .map_err(|e| format!("unparseable recognizer output: {e}"))
    }
}

/// Recognizer used when no command is configured: everything is a no-match.
pub struct NullRecognizer;

#[async_trait]
impl Recognizer for NullRecognizer {
    async fn recognize(&self, _audio_path: &Path) -> RecognizeOutcome {
        Ok(None)
    }
}

struct IdentifyJob {
    request_id: Uuid,
    audio_path: PathBuf,
}

struct Completion {
    request_id: Uuid,
    outcome: RecognizeOutcome,
}

/// Fixed-size worker pool with queue-depth back-pressure.
pub struct IdentifyPool {
    workers: Vec<mpsc::UnboundedSender<IdentifyJob>>,
    next_worker: AtomicUsize,
    queue_depth: Arc<AtomicUsize>,
    pending: Arc<DashMap<Uuid, oneshot::Sender<RecognizeOutcome>>>,
}

impl IdentifyPool {
    /// Spawns `worker_count` workers plus the completion dispatcher.
    pub fn new(worker_count: usize, recognizer: Arc<dyn Recognizer>) -> Self {
        let worker_count = worker_count.max(1);
        let queue_depth = Arc::new(AtomicUsize::new(0));
        let pending: Arc<DashMap<Uuid, oneshot::Sender<RecognizeOutcome>>> =
            Arc::new(DashMap::new());
        let (completion_tx, mut completion_rx) = mpsc::unbounded_channel::<Completion>();

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let (tx, mut rx) = mpsc::unbounded_channel::<IdentifyJob>();
            let recognizer = Arc::clone(&recognizer);
            let completion_tx = completion_tx.clone();
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    let outcome = recognizer.recognize(&job.audio_path).await;
                    // Workers own temp-file cleanup, success or failure.
                    if let Err(e) = tokio::fs::remove_file(&job.audio_path).await {
                        log::debug!(
                            "[Identify] Worker {} could not remove {}: {}",
                            worker_id,
                            job.audio_path.display(),
                            e
                        );
                    }
                    let _ = completion_tx.send(Completion {
                        request_id: job.request_id,
                        outcome,
                    });
                }
            });
            workers.push(tx);
        }

        let depth = Arc::clone(&queue_depth);
        let waiters = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Some(done) = completion_rx.recv().await {
                depth.fetch_sub(1, Ordering::SeqCst);
                if let Some((_, waiter)) = waiters.remove(&done.request_id) {
                    let _ = waiter.send(done.outcome);
                }
            }
        });

        log::info!("[Identify] Pool started with {} workers", worker_count);
        Self {
            workers,
            next_worker: AtomicUsize::new(0),
            queue_depth,
            pending,
        }
    }

    /// Submits a job and waits for its result.
    ///
    /// Refuses synchronously with [`LuminaError::Overloaded`] once the queue
    /// depth hits the cap; the refused call leaves the depth untouched.
    pub async fn submit(&self, audio_path: PathBuf) -> LuminaResult<Option<serde_json::Value>> {
        if self.queue_depth.load(Ordering::SeqCst) >= IDENTIFY_QUEUE_MAX {
            log::warn!("[Identify] Queue full, refusing job");
            return Err(LuminaError::Overloaded);
        }
        self.queue_depth.fetch_add(1, Ordering::SeqCst);

        let request_id = Uuid::new_v4();
        let (done_tx, done_rx) = oneshot::channel();
        self.pending.insert(request_id, done_tx);

        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        if self.workers[index]
            .send(IdentifyJob {
                request_id,
                audio_path,
            })
            .is_err()
        {
            self.pending.remove(&request_id);
            self.queue_depth.fetch_sub(1, Ordering::SeqCst);
            return Err(LuminaError::Internal("identify worker gone".to_string()));
        }

        match done_rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(LuminaError::Internal(e)),
            Err(_) => Err(LuminaError::Internal(
                "identify worker dropped the job".to_string(),
            )),
        }
    }

    /// Jobs submitted but not yet completed.
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::SeqCst)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    #[cfg(test)]
    fn preload_depth(&self, depth: usize) {
        self.queue_depth.store(depth, Ordering::SeqCst);
    }
}
