//! Single-worker capture queue.
//!
//! The camera cannot service overlapping commands, so capture jobs flow
//! through exactly one worker task: jobs are accepted in arrival order on an
//! unbounded channel, executed strictly one at a time, and their outcomes
//! reported back on a second channel that the orchestrator drains without
//! blocking. A slow capture therefore never stalls edge sampling; later
//! trigger events simply accumulate and are served FIFO.
//!
//! The seam between the queue and the outside world is [`CaptureExecutor`]:
//! production uses [`GphotoExecutor`], tests substitute an in-process fake.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::capture::runner::{run_with_retry, RetryPolicy};
use crate::config::CaptureSettings;
use crate::error::{AppResult, CaptureError};

/// One capture to perform: the resolved target path plus the sequence
/// indices it was issued under.
#[derive(Clone, Debug)]
pub struct CaptureJob {
    /// Trigger index of the event that requested this capture.
    pub trigger_index: u64,
    /// Image index the capture will consume if it succeeds.
    pub image_index: u64,
    /// Exact path the tool is asked to save to.
    pub target_path: PathBuf,
    /// Filename stem, for fallback discovery when the tool picks its own
    /// extension or numbering suffix.
    pub stem: String,
}

/// Completion report for one job.
#[derive(Debug)]
pub struct CaptureOutcome {
    /// The job this outcome belongs to.
    pub job: CaptureJob,
    /// Saved file on success, the failure otherwise.
    pub result: AppResult<PathBuf>,
}

/// Executes one capture invocation.
#[async_trait]
pub trait CaptureExecutor: Send + Sync {
    /// Perform the capture and return the path of the saved file.
    ///
    /// Implementations must verify the file actually exists; the tool's exit
    /// code alone is not a success signal.
    async fn capture(&self, job: &CaptureJob) -> AppResult<PathBuf>;
}

/// Production executor invoking the gphoto2-style capture tool.
#[derive(Clone, Debug)]
pub struct GphotoExecutor {
    tool: String,
    policy: RetryPolicy,
}

impl GphotoExecutor {
    /// Build an executor from the capture settings.
    pub fn new(settings: &CaptureSettings) -> Self {
        Self {
            tool: settings.tool.clone(),
            policy: RetryPolicy {
                max_attempts: settings.retries,
                base_delay: settings.base_delay,
                timeout: settings.timeout,
            },
        }
    }
}

/// Argument contract of the capture tool: capture one frame, download it to
/// the requested filename, overwriting a stale file of the same name.
fn capture_args(target: &Path) -> Vec<String> {
    vec![
        "--capture-image-and-download".to_string(),
        "--force-overwrite".to_string(),
        "--filename".to_string(),
        target.display().to_string(),
    ]
}

/// Most-recently-modified file in `dir` whose name starts with `stem`.
///
/// Fallback for tools that choose their own extension or de-duplicating
/// numeric suffix; the deterministic requested path is always checked first.
fn newest_with_stem(dir: &Path, stem: &str) -> AppResult<Option<PathBuf>> {
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().starts_with(stem) {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        if newest.as_ref().is_none_or(|(t, _)| modified > *t) {
            newest = Some((modified, entry.path()));
        }
    }
    Ok(newest.map(|(_, p)| p))
}

#[async_trait]
impl CaptureExecutor for GphotoExecutor {
    async fn capture(&self, job: &CaptureJob) -> AppResult<PathBuf> {
        let args = capture_args(&job.target_path);
        run_with_retry(&self.tool, &args, &self.policy).await?;

        // Exit 0 is necessary but not sufficient: the file on disk decides.
        if job.target_path.exists() {
            return Ok(job.target_path.clone());
        }
        let dir = job
            .target_path
            .parent()
            .ok_or_else(|| CaptureError::FileMissingAfterSuccess(job.target_path.clone()))?;
        if let Some(found) = newest_with_stem(dir, &job.stem)? {
            warn!(
                requested = %job.target_path.display(),
                saved = %found.display(),
                "capture tool renamed its output"
            );
            return Ok(found);
        }
        Err(CaptureError::FileMissingAfterSuccess(
            job.target_path.clone(),
        ))
    }
}

/// Handle to the single-worker capture pipeline.
pub struct CaptureQueue {
    jobs_tx: Option<mpsc::UnboundedSender<CaptureJob>>,
    results_rx: mpsc::UnboundedReceiver<CaptureOutcome>,
    worker: JoinHandle<()>,
}

impl CaptureQueue {
    /// Spawn the worker task around `executor`.
    pub fn spawn(executor: Arc<dyn CaptureExecutor>) -> Self {
        let (jobs_tx, mut jobs_rx) = mpsc::unbounded_channel::<CaptureJob>();
        let (results_tx, results_rx) = mpsc::unbounded_channel();

        let worker = tokio::spawn(async move {
            while let Some(job) = jobs_rx.recv().await {
                debug!(trigger_index = job.trigger_index, "capture job started");
                let result = executor.capture(&job).await;
                if results_tx.send(CaptureOutcome { job, result }).is_err() {
                    // Receiver gone: the orchestrator has shut down.
                    break;
                }
            }
        });

        Self {
            jobs_tx: Some(jobs_tx),
            results_rx,
            worker,
        }
    }

    /// Enqueue a job. Non-blocking; jobs run strictly FIFO.
    pub fn submit(&self, job: CaptureJob) -> AppResult<()> {
        self.jobs_tx
            .as_ref()
            .ok_or(CaptureError::QueueClosed)?
            .send(job)
            .map_err(|_| CaptureError::QueueClosed)
    }

    /// Fetch one completed outcome, if any, without blocking.
    pub fn try_recv(&mut self) -> Option<CaptureOutcome> {
        self.results_rx.try_recv().ok()
    }

    /// Close the queue and wait up to `grace` for the in-flight capture.
    ///
    /// Outcomes that complete within the grace period are returned so the
    /// caller can still commit and log them; past the deadline the worker is
    /// aborted and the in-flight capture is abandoned (it was never
    /// committed, so persisted state stays consistent).
    pub async fn shutdown(mut self, grace: Duration) -> Vec<CaptureOutcome> {
        self.jobs_tx.take();

        if timeout(grace, &mut self.worker).await.is_err() {
            warn!("capture worker did not finish in time, abandoning in-flight capture");
            self.worker.abort();
        }

        let mut outcomes = Vec::new();
        while let Ok(outcome) = self.results_rx.try_recv() {
            outcomes.push(outcome);
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::sleep;

    /// Executor that records ordering and overlap instead of running a tool.
    struct ProbeExecutor {
        current: AtomicUsize,
        max_seen: AtomicUsize,
        order: Mutex<Vec<u64>>,
        delay: Duration,
    }

    impl ProbeExecutor {
        fn new(delay: Duration) -> Self {
            Self {
                current: AtomicUsize::new(0),
                max_seen: AtomicUsize::new(0),
                order: Mutex::new(Vec::new()),
                delay,
            }
        }
    }

    #[async_trait]
    impl CaptureExecutor for ProbeExecutor {
        async fn capture(&self, job: &CaptureJob) -> AppResult<PathBuf> {
            let active = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(active, Ordering::SeqCst);
            sleep(self.delay).await;
            self.order.lock().unwrap().push(job.trigger_index);
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(job.target_path.clone())
        }
    }

    fn job(trigger_index: u64) -> CaptureJob {
        CaptureJob {
            trigger_index,
            image_index: trigger_index,
            target_path: PathBuf::from(format!("/tmp/{trigger_index:05}.jpg")),
            stem: format!("{trigger_index:05}"),
        }
    }

    async fn drain(queue: &mut CaptureQueue, expected: usize) -> Vec<CaptureOutcome> {
        let mut outcomes = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while outcomes.len() < expected {
            assert!(tokio::time::Instant::now() < deadline, "drain timed out");
            match queue.try_recv() {
                Some(o) => outcomes.push(o),
                None => sleep(Duration::from_millis(5)).await,
            }
        }
        outcomes
    }

    #[tokio::test]
    async fn test_jobs_never_overlap_and_stay_fifo() {
        let executor = Arc::new(ProbeExecutor::new(Duration::from_millis(20)));
        let mut queue = CaptureQueue::spawn(executor.clone());

        for i in 1..=3 {
            queue.submit(job(i)).expect("submit");
        }
        let outcomes = drain(&mut queue, 3).await;

        assert_eq!(executor.max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(*executor.order.lock().unwrap(), vec![1, 2, 3]);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        queue.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_shutdown_returns_completed_outcomes() {
        let executor = Arc::new(ProbeExecutor::new(Duration::from_millis(1)));
        let queue = CaptureQueue::spawn(executor);
        queue.submit(job(1)).expect("submit while open");
        let outcomes = queue.shutdown(Duration::from_secs(1)).await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].result.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_abandons_stuck_capture() {
        let executor = Arc::new(ProbeExecutor::new(Duration::from_secs(30)));
        let queue = CaptureQueue::spawn(executor);
        queue.submit(job(1)).expect("submit");
        // Let the worker pick the job up before closing the channel.
        sleep(Duration::from_millis(20)).await;
        let outcomes = queue.shutdown(Duration::from_millis(50)).await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_newest_with_stem_prefers_latest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let older = dir.path().join("shot_00001.jpg");
        let newer = dir.path().join("shot_00001.cr2");
        std::fs::write(&older, b"a").unwrap();
        sleep(Duration::from_millis(20)).await;
        std::fs::write(&newer, b"b").unwrap();
        std::fs::write(dir.path().join("unrelated.jpg"), b"c").unwrap();

        let found = newest_with_stem(dir.path(), "shot_00001")
            .expect("scan")
            .expect("match");
        assert_eq!(found, newer);

        assert!(newest_with_stem(dir.path(), "missing")
            .expect("scan")
            .is_none());
    }
}
