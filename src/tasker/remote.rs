//! Wire format and loops for deployments that run task bodies on a remote
//! executor: a scheduler claims tasks without owning the lease and publishes
//! them, the executor streams back progress and a final response.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::Document;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::tasker::consumer::{execute, TaskCompleter};
use crate::tasker::distributor::TaskSource;
use crate::tasker::error::{MQueueError, MResult};
use crate::tasker::progress::{ProgressCallback, ProgressReporter, ProgressUpdate};
use crate::tasker::queue_core::GetTaskOption;
use crate::tasker::registry::TaskRegistry;
use crate::tasker::task::TaskStatus;
use crate::tasker::task_common::{payload_id, type_query};

/// heart-beats relayed from a remote executor extend the lease by this much
pub const REMOTE_RESET_SECONDS: u64 = 1000;
const SCHEDULER_WORKER: &str = "scheduler";

/// A claimed task on its way to the executor, payload includes `id` and `type`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RemoteTaskMessage {
    pub payload: Document,
}

/// Sent back by the executor. Without `task` it is a heart-beat, with it the final ack.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteResponse {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Document>,
    pub progress: f64,
    #[serde(default)]
    pub log: Vec<String>,
    pub success: bool,
    pub worker: String,
}

impl RemoteTaskMessage {
    pub fn to_json(&self) -> MResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> MResult<RemoteTaskMessage> {
        Ok(serde_json::from_str(json)?)
    }
}

impl RemoteResponse {
    pub fn to_json(&self) -> MResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> MResult<RemoteResponse> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Record a response received from an executor.
pub async fn apply_response<H>(hub: &H, response: RemoteResponse) -> MResult<()>
where
    H: TaskCompleter + ProgressReporter + ?Sized,
{
    match response.task {
        Some(mut task) => {
            task.insert("id", response.task_id.as_str());
            let status = if response.success { TaskStatus::Completed } else { TaskStatus::Failed };
            debug!("remote {} finished task {} as {}", &response.worker, &response.task_id, status);
            if !response.log.is_empty() {
                hub.report(ProgressUpdate {
                    task_id: response.task_id.clone(),
                    log: response.log,
                    progress: response.progress,
                    reset_seconds: REMOTE_RESET_SECONDS,
                    worker: response.worker,
                }).await?;
            }
            hub.completed(&task, status).await
        }
        None => {
            hub.report(ProgressUpdate {
                task_id: response.task_id,
                log: response.log,
                progress: response.progress,
                reset_seconds: REMOTE_RESET_SECONDS,
                worker: response.worker,
            }).await
        }
    }
}

/// Claims tasks for remote executors and pushes them into `outbound`.
pub struct RemoteScheduler {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RemoteScheduler {
    /// `idle` is the pause after a poll found nothing
    pub fn start(source: Arc<dyn TaskSource>, types: Vec<String>, outbound: mpsc::Sender<RemoteTaskMessage>, lease_seconds: u64, idle: Duration) -> MResult<RemoteScheduler> {
        if types.is_empty() {
            return Err(MQueueError::NoTaskTypes);
        }
        let option = GetTaskOption::builder().lease_seconds(lease_seconds).is_scheduler(true).build();
        let query = type_query(&types);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                info!("remote scheduler started for {:?}", &types);
                loop {
                    let claimed = tokio::select! {
                        _ = cancel.cancelled() => break,
                        claimed = source.get(&query, &option, SCHEDULER_WORKER) => claimed,
                    };
                    match claimed {
                        Ok(Some(payload)) => {
                            let id = payload_id(&payload).unwrap_or_default();
                            if outbound.send(RemoteTaskMessage { payload }).await.is_err() {
                                // the lease expires and the task is handed out again
                                warn!("outbound channel closed, dropping task {}", id);
                                break;
                            }
                            debug!("scheduled task {}", id);
                            continue;
                        }
                        Ok(None) => {}
                        Err(e) => warn!("scheduler failed to claim a task {:?}", &e),
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(idle) => {}
                    }
                }
                debug!("remote scheduler stopped");
            }
        });
        Ok(RemoteScheduler { cancel, handle })
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("remote scheduler ended abnormally {:?}", &e);
        }
    }
}

/// Streams heart-beats of a remotely running task as progress only responses.
pub struct ResponseReporter {
    responses: mpsc::Sender<RemoteResponse>,
}

impl ResponseReporter {
    pub fn new(responses: mpsc::Sender<RemoteResponse>) -> ResponseReporter {
        ResponseReporter { responses }
    }
}

#[async_trait]
impl ProgressReporter for ResponseReporter {
    async fn report(&self, update: ProgressUpdate) -> MResult<()> {
        let response = RemoteResponse {
            task_id: update.task_id,
            task: None,
            progress: update.progress,
            log: update.log,
            success: true,
            worker: update.worker,
        };
        self.responses.send(response).await.map_err(|_| MQueueError::ResponseChannelClosed)
    }
}

/// The executor side: run one received task and send its final response.
pub async fn run_remote_task(registry: &TaskRegistry, message: RemoteTaskMessage, responses: mpsc::Sender<RemoteResponse>, worker: &str) -> MResult<()> {
    let task_id = payload_id(&message.payload)?;
    let mut task = registry.decode(&message.payload)?;
    let reporter = Arc::new(ResponseReporter::new(responses.clone()));
    let mut callback = ProgressCallback::new(reporter, task_id.as_str(), worker, REMOTE_RESET_SECONDS);
    let outcome = execute(task.as_mut(), &mut callback).await;
    let mut output = task.to_payload()?;
    output.remove("id");
    let response = RemoteResponse {
        task_id,
        task: Some(output),
        progress: 1.0,
        log: vec![],
        success: outcome.is_ok(),
        worker: worker.to_string(),
    };
    responses.send(response).await.map_err(|_| MQueueError::ResponseChannelClosed)
}
