use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::warn;

use crate::tasker::error::MResult;

/// minimum time between two non forced flushes
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub task_id: String,
    pub log: Vec<String>,
    // negative means not reported yet
    pub progress: f64,
    pub reset_seconds: u64,
    pub worker: String,
}

/// Where a callback flushes to: the queue itself, or a response channel for remote workers.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, update: ProgressUpdate) -> MResult<()>;
}

/// Handed to a running task body; buffers log lines and flushes them at most
/// about once a second, or immediately when forced.
pub struct ProgressCallback {
    reporter: Arc<dyn ProgressReporter>,
    task_id: String,
    worker: String,
    reset_seconds: u64,
    progress: f64,
    logs: Vec<String>,
    last_flush: Option<Instant>,
}

impl ProgressCallback {
    pub fn new(reporter: Arc<dyn ProgressReporter>, task_id: impl Into<String>, worker: impl Into<String>, reset_seconds: u64) -> ProgressCallback {
        ProgressCallback {
            reporter,
            task_id: task_id.into(),
            worker: worker.into(),
            reset_seconds,
            progress: -1.0,
            logs: vec![],
            last_flush: None,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn current_progress(&self) -> f64 {
        self.progress
    }

    pub async fn log(&mut self, message: impl Into<String>) {
        self.logs.push(message.into());
        self.flush(false).await;
    }

    pub async fn progress(&mut self, progress: f64) {
        self.progress = progress;
        self.flush(progress >= 1.0).await;
    }

    pub async fn progress_with(&mut self, message: impl Into<String>, progress: f64) {
        self.logs.push(message.into());
        self.progress = progress;
        self.flush(progress >= 1.0).await;
    }

    /// Flush when forced or when the debounce interval passed.
    ///
    /// Failures are logged and swallowed, ack is the authoritative terminator.
    pub async fn flush(&mut self, force: bool) {
        let due = match self.last_flush {
            None => true,
            Some(last) => last.elapsed() > FLUSH_INTERVAL,
        };
        if !force && !due {
            return;
        }
        let update = ProgressUpdate {
            task_id: self.task_id.clone(),
            log: std::mem::take(&mut self.logs),
            progress: self.progress,
            reset_seconds: self.reset_seconds,
            worker: self.worker.clone(),
        };
        if let Err(e) = self.reporter.report(update).await {
            warn!("failed to report progress of task {} {:?}", &self.task_id, &e);
        }
        self.last_flush = Some(Instant::now());
    }
}
