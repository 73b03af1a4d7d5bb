use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::{doc, DateTime, Document};
use mongodb::Collection;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::tasker::completion::{Completion, CompletionRegistry, TaskCompletion};
use crate::tasker::config::MQueueConfig;
use crate::tasker::consumer::TaskCompleter;
use crate::tasker::dag::DagSubmitter;
use crate::tasker::distributor::{Distributor, DistributorOption};
use crate::tasker::error::{MQueueError, MResult};
use crate::tasker::monitor::{StatusChangeListener, StatusChangeMonitor};
use crate::tasker::progress::{ProgressReporter, ProgressUpdate};
use crate::tasker::queue_core::MongoQueueCore;
use crate::tasker::registry::{decode, encode, Task, TaskRegistry, TypedTask};
use crate::tasker::remote::{RemoteScheduler, RemoteTaskMessage};
use crate::tasker::task::{SubmitResponse, TaskMeta, TaskRecord, TaskStatus};
use crate::tasker::task_common::{after, parse_id, payload_query, status_in};
use crate::util::connect;

const REMOTE_IDLE: Duration = Duration::from_secs(1);

/// Entry point for producers and workers of one queue collection.
///
/// Construct once at startup and clone it where needed, clones share the
/// status monitor.
#[derive(Clone)]
pub struct TaskHub {
    core: MongoQueueCore,
    monitor: Arc<StatusChangeMonitor>,
}

impl TaskHub {
    pub async fn connect(config: &MQueueConfig) -> MResult<TaskHub> {
        let collection = connect(config).await?;
        TaskHub::create(collection).await
    }

    /// ensure the indexes and start watching `collection`
    pub async fn create(collection: Collection<Document>) -> MResult<TaskHub> {
        let core = MongoQueueCore::create(collection.clone());
        core.ensure_get_index().await;
        let monitor = StatusChangeMonitor::new(Arc::new(CompletionRegistry::new()));
        // runs until shutdown()
        let _ = monitor.start(collection).await?;
        Ok(TaskHub { core, monitor })
    }

    pub fn core(&self) -> &MongoQueueCore {
        &self.core
    }

    pub async fn submit<T: Task>(&self, task: &T) -> MResult<SubmitResponse> {
        self.submit_with(task, Duration::ZERO, &[]).await
    }

    /// submit `task`, claimable after `delay` and only once every parent completed
    pub async fn submit_with<T: Task>(&self, task: &T, delay: Duration, parents: &[String]) -> MResult<SubmitResponse> {
        self.submit_payload(encode(task)?, delay, parents).await
    }

    pub async fn submit_payload(&self, payload: Document, delay: Duration, parents: &[String]) -> MResult<SubmitResponse> {
        let (id, status) = self.core.send(payload, after(delay), 0.0, parents).await?;
        Ok(SubmitResponse { id, status })
    }

    pub async fn submit_many<T: Task>(&self, tasks: &[T]) -> MResult<Vec<String>> {
        let payloads = tasks.iter().map(encode).collect::<MResult<Vec<Document>>>()?;
        self.core.send_many(payloads, DateTime::now(), 0.0).await
    }

    /// Queue an existing task again at priority 0, claimable now. Its attempt count starts over.
    pub async fn resubmit(&self, id: &str) -> MResult<String> {
        let record = self.find_record(id).await?;
        info!("resubmitting task {} from {}", id, record.status);
        self.core.requeue(&record.payload_with_id(), DateTime::now(), 0.0).await
    }

    /// false when the task had already finished
    pub async fn cancel(&self, id: &str) -> MResult<bool> {
        self.core.cancel(id).await
    }

    pub async fn completed(&self, payload: &Document, status: TaskStatus) -> MResult<()> {
        self.core.ack(payload, status).await
    }

    pub async fn progress(&self, id: &str, log: &[String], progress: f64, reset_seconds: u64, worker: &str) -> MResult<()> {
        self.core.progress(id, log, progress, reset_seconds, worker).await
    }

    pub async fn get_task<T: Task>(&self, id: &str) -> MResult<Option<T>> {
        match self.core.find_record(id).await? {
            Some(record) => Ok(Some(decode::<T>(&record.payload_with_id())?)),
            None => Ok(None),
        }
    }

    /// every stored task of kind `T`, oldest first
    pub async fn get_tasks<T: Task>(&self) -> MResult<Vec<TypedTask<T>>> {
        let records = self.core.find_records(doc! {"payload.type": T::TYPE}).await?;
        records.iter()
            .map(|record| Ok(TypedTask { id: record.id.to_hex(), task: decode::<T>(&record.payload)? }))
            .collect()
    }

    pub async fn get_task_meta(&self, id: &str) -> MResult<Option<TaskMeta>> {
        Ok(self.core.find_record(id).await?.as_ref().map(TaskMeta::from))
    }

    /// An empty `statuses` matches any status. `payload_filter` keys are payload fields.
    pub async fn get_tasks_meta_data(&self, statuses: &[TaskStatus], payload_filter: &Document) -> MResult<Vec<TaskMeta>> {
        let mut filter = payload_query(payload_filter);
        if !statuses.is_empty() {
            filter.insert("status", status_in(statuses));
        }
        Ok(self.core.find_records(filter).await?.iter().map(TaskMeta::from).collect())
    }

    pub async fn get_tasks_meta_data_by_ids(&self, ids: &[String]) -> MResult<Vec<TaskMeta>> {
        let object_ids = ids.iter().map(|id| parse_id(id)).collect::<MResult<Vec<_>>>()?;
        let records = self.core.find_records(doc! {"_id": {"$in": object_ids}}).await?;
        Ok(records.iter().map(TaskMeta::from).collect())
    }

    pub async fn get_task_logs(&self, id: &str) -> MResult<Vec<String>> {
        Ok(self.find_record(id).await?.log)
    }

    /// number of tasks, optionally only those in `status`
    pub async fn count(&self, status: Option<TaskStatus>) -> MResult<u64> {
        match status {
            Some(status) => self.core.count_status(&doc! {}, status).await,
            None => self.core.count(&doc! {}).await,
        }
    }

    /// Resolves when the task reaches a terminal status, right away if it already has.
    pub async fn get_completion(&self, id: &str) -> MResult<Completion> {
        parse_id(id)?;
        if self.monitor.is_stopped() {
            return Err(MQueueError::MonitorStopped);
        }
        let completions = self.monitor.completions();
        let (completion, created) = completions.register(id);
        // the task may have finished before we registered, or while the change stream was down
        match self.core.find_record(id).await {
            Ok(Some(record)) => {
                if record.status.is_terminal() {
                    debug!("task {} already {}", id, record.status);
                    completions.resolve(TaskCompletion {
                        id: id.to_string(),
                        status: record.status,
                        payload: Some(record.payload_with_id()),
                    });
                }
                Ok(completion)
            }
            Ok(None) => {
                if created {
                    completions.abandon(id);
                }
                Err(MQueueError::TaskNotFound(id.to_string()))
            }
            Err(e) => {
                if created {
                    completions.abandon(id);
                }
                Err(e)
            }
        }
    }

    pub fn get_distributor(&self, registry: &TaskRegistry) -> MResult<Distributor> {
        self.get_distributor_with(registry, DistributorOption::default())
    }

    /// a distributor over the task kinds of `registry`, woken by this hub's monitor
    pub fn get_distributor_with(&self, registry: &TaskRegistry, option: DistributorOption) -> MResult<Distributor> {
        registry.ensure_not_empty()?;
        let distributor = Distributor::start(Arc::new(self.core.clone()), registry.types(), option)?;
        self.monitor.add_listener(distributor.waker());
        Ok(distributor)
    }

    /// claim tasks of `registry` for remote executors, see [RemoteScheduler]
    pub fn get_remote_scheduler(&self, registry: &TaskRegistry, outbound: mpsc::Sender<RemoteTaskMessage>, lease_seconds: u64) -> MResult<RemoteScheduler> {
        registry.ensure_not_empty()?;
        RemoteScheduler::start(Arc::new(self.core.clone()), registry.types(), outbound, lease_seconds, REMOTE_IDLE)
    }

    pub fn add_status_listener(&self, listener: Arc<dyn StatusChangeListener>) {
        self.monitor.add_listener(listener);
    }

    /// stop the monitor, pending completions fail with MonitorStopped
    pub fn shutdown(&self) {
        info!("shutting down task hub on {}", self.core.collection().name());
        self.monitor.stop();
    }

    async fn find_record(&self, id: &str) -> MResult<TaskRecord> {
        self.core.find_record(id).await?.ok_or_else(|| MQueueError::TaskNotFound(id.to_string()))
    }
}

#[async_trait]
impl ProgressReporter for TaskHub {
    async fn report(&self, update: ProgressUpdate) -> MResult<()> {
        self.progress(&update.task_id, &update.log, update.progress, update.reset_seconds, &update.worker).await
    }
}

#[async_trait]
impl TaskCompleter for TaskHub {
    async fn completed(&self, payload: &Document, status: TaskStatus) -> MResult<()> {
        TaskHub::completed(self, payload, status).await
    }
}

#[async_trait]
impl DagSubmitter for TaskHub {
    async fn submit_payload(&self, payload: Document, delay: Duration, parents: &[String]) -> MResult<SubmitResponse> {
        TaskHub::submit_payload(self, payload, delay, parents).await
    }

    async fn task_status(&self, id: &str) -> MResult<Option<TaskStatus>> {
        self.core.status_of(id).await
    }
}
