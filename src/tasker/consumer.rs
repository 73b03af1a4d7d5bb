use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::Document;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

use crate::tasker::distributor::{default_capacity, ClaimedTask, Distributor, DistributorOption};
use crate::tasker::error::{MQueueError, MResult};
use crate::tasker::hub::TaskHub;
use crate::tasker::progress::{ProgressCallback, ProgressReporter};
use crate::tasker::registry::{DynTask, TaskRegistry};
use crate::tasker::task::TaskStatus;

const EVENT_CAPACITY: usize = 1024;
const FAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Worker side ack of a claimed task.
#[async_trait]
pub trait TaskCompleter: Send + Sync {
    /// `payload` is the final task state including `id`
    async fn completed(&self, payload: &Document, status: TaskStatus) -> MResult<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerEvent {
    TaskOccupied { id: String, worker: String },
    MarkSuccess { id: String },
    MarkFail { id: String, reason: String },
}

#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
pub struct TaskConsumerConfig {
    // runner names are "<name>:<index>"
    #[builder(default = default_pool_name())]
    pub name: String,
    #[builder(default = default_capacity())]
    pub parallelism: usize,
    // lease extension written by every heart-beat
    #[builder(default = 1000)]
    pub reset_seconds: u64,
    pub distributor: DistributorOption,
}

impl Default for TaskConsumerConfig {
    fn default() -> Self {
        TaskConsumerConfig::builder().build()
    }
}

fn default_pool_name() -> String {
    let host = hostname::get()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|_| "worker".to_string());
    format!("{}-{}", host, ObjectId::new().to_hex())
}

struct ConsumerInner {
    config: TaskConsumerConfig,
    registry: Arc<TaskRegistry>,
    distributor: Distributor,
    completer: Arc<dyn TaskCompleter>,
    reporter: Arc<dyn ProgressReporter>,
    event_sender: broadcast::Sender<ConsumerEvent>,
    cancel: CancellationToken,
    runners: Mutex<Vec<JoinHandle<()>>>,
}

/// A pool of runners executing the task kinds of one registry.
#[derive(Clone)]
pub struct TaskConsumer {
    inner: Arc<ConsumerInner>,
}

impl TaskConsumer {
    /// Fails fast when the registry is empty.
    pub fn create(hub: &TaskHub, registry: Arc<TaskRegistry>, config: TaskConsumerConfig) -> MResult<TaskConsumer> {
        let distributor = hub.get_distributor_with(&registry, config.distributor.clone())?;
        let hub = Arc::new(hub.clone());
        Ok(TaskConsumer::with_parts(distributor, hub.clone(), hub, registry, config))
    }

    pub(crate) fn with_parts(distributor: Distributor, completer: Arc<dyn TaskCompleter>, reporter: Arc<dyn ProgressReporter>, registry: Arc<TaskRegistry>, config: TaskConsumerConfig) -> TaskConsumer {
        let (event_sender, _) = broadcast::channel(EVENT_CAPACITY);
        TaskConsumer {
            inner: Arc::new(ConsumerInner {
                config,
                registry,
                distributor,
                completer,
                reporter,
                event_sender,
                cancel: CancellationToken::new(),
                runners: Mutex::new(vec![]),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn get_event_receiver(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.inner.event_sender.subscribe()
    }

    /// spawn the runners, a second call does nothing
    pub fn start(&self) {
        let mut runners = self.inner.runners.lock().unwrap_or_else(|e| e.into_inner());
        if !runners.is_empty() || self.inner.cancel.is_cancelled() {
            warn!("consumer {} already started", self.name());
            return;
        }
        let parallelism = self.inner.config.parallelism.max(1);
        info!("starting consumer {} with {} runners for {:?}", self.name(), parallelism, self.inner.registry.types());
        for index in 0..parallelism {
            let worker = format!("{}:{}", self.name(), index);
            runners.push(tokio::spawn(self.inner.clone().run(worker)));
        }
    }

    /// Stop taking tasks. `force` aborts running task bodies, their leases
    /// expire and the tasks are handed out again; otherwise wait for them.
    pub async fn shutdown(&self, force: bool) {
        self.inner.cancel.cancel();
        let runners: Vec<JoinHandle<()>> = {
            let mut runners = self.inner.runners.lock().unwrap_or_else(|e| e.into_inner());
            runners.drain(..).collect()
        };
        for runner in runners {
            if force {
                runner.abort();
            }
            if let Err(e) = runner.await {
                if !e.is_cancelled() {
                    warn!("runner of {} ended abnormally {:?}", self.name(), &e);
                }
            }
        }
        self.inner.distributor.shutdown();
        info!("consumer {} stopped", self.name());
    }
}

impl ConsumerInner {
    async fn run(self: Arc<Self>, worker: String) {
        loop {
            let claimed = tokio::select! {
                _ = self.cancel.cancelled() => break,
                claimed = self.distributor.get(&worker) => claimed,
            };
            match claimed {
                Ok(claimed) => {
                    if let Err(e) = self.handle(&worker, claimed).await {
                        warn!("{} failed to process a task {:?}", &worker, &e);
                    }
                }
                Err(MQueueError::DistributorStopped) => break,
                Err(e) => {
                    warn!("{} failed to get a task {:?}", &worker, &e);
                    tokio::time::sleep(FAULT_BACKOFF).await;
                }
            }
        }
        debug!("runner {} stopped", &worker);
    }

    async fn handle(&self, worker: &str, claimed: ClaimedTask) -> MResult<()> {
        let mut task = match self.registry.decode(&claimed.payload) {
            Ok(task) => task,
            Err(e) => {
                // a payload that can't be decoded would be handed out forever
                warn!("failed to decode task {} {:?}", &claimed.id, &e);
                self.completer.completed(&claimed.payload, TaskStatus::Failed).await?;
                self.emit(ConsumerEvent::MarkFail { id: claimed.id, reason: e.to_string() });
                return Ok(());
            }
        };
        self.emit(ConsumerEvent::TaskOccupied { id: claimed.id.clone(), worker: worker.to_string() });
        let mut callback = ProgressCallback::new(self.reporter.clone(), claimed.id.as_str(), worker, self.config.reset_seconds);
        let outcome = execute(task.as_mut(), &mut callback).await;
        let payload = task.to_payload()?;
        match outcome {
            Ok(()) => {
                self.completer.completed(&payload, TaskStatus::Completed).await?;
                self.emit(ConsumerEvent::MarkSuccess { id: claimed.id });
            }
            Err(reason) => {
                self.completer.completed(&payload, TaskStatus::Failed).await?;
                self.emit(ConsumerEvent::MarkFail { id: claimed.id, reason });
            }
        }
        Ok(())
    }

    fn emit(&self, event: ConsumerEvent) {
        // nobody listening is fine
        let _ = self.event_sender.send(event);
    }
}

/// Run a task body to its end and write the final heart-beat.
///
/// Errors and panics of the body become the failure reason, which is also
/// appended to the task log.
pub(crate) async fn execute(task: &mut dyn DynTask, callback: &mut ProgressCallback) -> Result<(), String> {
    let result = AssertUnwindSafe(task.run(callback)).catch_unwind().await;
    let failure = match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(panic) => Some(panic_message(panic.as_ref())),
    };
    match failure {
        None => {
            callback.progress(1.0).await;
            Ok(())
        }
        Some(reason) => {
            debug!("task {} failed: {}", callback.task_id(), &reason);
            callback.progress_with(reason.clone(), 1.0).await;
            Err(reason)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}
