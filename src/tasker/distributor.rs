use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::Document;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

use crate::tasker::error::{MQueueError, MResult};
use crate::tasker::monitor::{StatusChange, StatusChangeListener};
use crate::tasker::queue_core::{GetTaskOption, MongoQueueCore};
use crate::tasker::task::TaskStatus;
use crate::tasker::task_common::{payload_id, type_query};

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// The claim operation the distributor multiplexes onto.
#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn get(&self, query: &Document, option: &GetTaskOption, worker: &str) -> MResult<Option<Document>>;
}

#[async_trait]
impl TaskSource for MongoQueueCore {
    async fn get(&self, query: &Document, option: &GetTaskOption, worker: &str) -> MResult<Option<Document>> {
        MongoQueueCore::get(self, query, option, worker).await
    }
}

#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct DistributorOption {
    #[builder(default = 60)]
    pub lease_seconds: u64,
    #[builder(default = 200)]
    pub poll_millis: u64,
    // small on purpose, an empty queue pauses the runner instead of polling on
    #[builder(default = 5)]
    pub max_attempts: u32,
    // waiting workers that can queue up before get() blocks
    #[builder(default = default_capacity())]
    pub capacity: usize,
    // a paused runner still looks again after this long, for delayed tasks and expired leases
    #[builder(default = Duration::from_secs(10))]
    pub idle_recheck: Duration,
}

impl Default for DistributorOption {
    fn default() -> Self {
        DistributorOption::builder().build()
    }
}

pub fn default_capacity() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// A task leased to one worker, payload includes `id` and `type`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedTask {
    pub id: String,
    pub payload: Document,
}

struct WorkerRequest {
    worker: String,
    reply: oneshot::Sender<ClaimedTask>,
}

struct DistributorState {
    wake: Notify,
    paused: AtomicBool,
    claims: AtomicU64,
}

/// wakes a paused distributor whenever a task becomes queued
struct QueuedWaker {
    state: Arc<DistributorState>,
}

impl StatusChangeListener for QueuedWaker {
    fn task_status_changed(&self, change: &StatusChange) {
        if change.status == TaskStatus::Queued {
            if self.state.paused.swap(false, Ordering::AcqRel) {
                debug!("distributor woken by {}", &change.id);
            }
            // keeps a permit when the runner is busy, so a later pause rechecks once
            self.state.wake.notify_one();
        }
    }
}

/// Multiplexes in-process workers onto one claiming runner.
#[derive(Clone)]
pub struct Distributor {
    requests: mpsc::Sender<WorkerRequest>,
    state: Arc<DistributorState>,
    cancel: CancellationToken,
}

impl Distributor {
    /// start the runner; `types` is the union of task kinds this process can run
    pub fn start(source: Arc<dyn TaskSource>, types: Vec<String>, option: DistributorOption) -> MResult<Distributor> {
        if types.is_empty() {
            return Err(MQueueError::NoTaskTypes);
        }
        let (requests, receiver) = mpsc::channel(option.capacity.max(1));
        let state = Arc::new(DistributorState {
            wake: Notify::new(),
            paused: AtomicBool::new(false),
            claims: AtomicU64::new(0),
        });
        let cancel = CancellationToken::new();
        let runner = Runner {
            source,
            query: type_query(&types),
            get_option: GetTaskOption::builder()
                .lease_seconds(option.lease_seconds)
                .poll_millis(option.poll_millis)
                .max_attempts(option.max_attempts)
                .is_scheduler(false)
                .build(),
            idle_recheck: option.idle_recheck,
            receiver,
            state: state.clone(),
            cancel: cancel.clone(),
        };
        info!("distributor started for {:?}", &types);
        tokio::spawn(runner.run());
        Ok(Distributor { requests, state, cancel })
    }

    /// listener to register with the status monitor
    pub fn waker(&self) -> Arc<dyn StatusChangeListener> {
        Arc::new(QueuedWaker { state: self.state.clone() })
    }

    /// Wait for a task leased to `worker`. Waiting workers are served in arrival order.
    pub async fn get(&self, worker: &str) -> MResult<ClaimedTask> {
        let (reply, receiver) = oneshot::channel();
        self.requests.send(WorkerRequest { worker: worker.to_string(), reply }).await
            .map_err(|_| MQueueError::DistributorStopped)?;
        self.state.wake.notify_one();
        receiver.await.map_err(|_| MQueueError::DistributorStopped)
    }

    pub fn is_paused(&self) -> bool {
        self.state.paused.load(Ordering::Acquire)
    }

    /// number of get() calls issued against the source so far
    pub fn claim_attempts(&self) -> u64 {
        self.state.claims.load(Ordering::Acquire)
    }

    /// stop the runner; tasks already claimed stay running until their lease expires
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

struct Runner {
    source: Arc<dyn TaskSource>,
    query: Document,
    get_option: GetTaskOption,
    idle_recheck: Duration,
    receiver: mpsc::Receiver<WorkerRequest>,
    state: Arc<DistributorState>,
    cancel: CancellationToken,
}

impl Runner {
    async fn run(mut self) {
        let mut pending: Option<WorkerRequest> = None;
        loop {
            let request = match pending.take() {
                Some(request) => request,
                None => {
                    let received = tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        received = self.receiver.recv() => received,
                    };
                    match received {
                        Some(request) => request,
                        None => break,
                    }
                }
            };
            // the worker gave up waiting
            if request.reply.is_closed() {
                continue;
            }
            self.state.claims.fetch_add(1, Ordering::AcqRel);
            let claimed = tokio::select! {
                _ = self.cancel.cancelled() => break,
                claimed = self.source.get(&self.query, &self.get_option, &request.worker) => claimed,
            };
            match claimed {
                Ok(Some(payload)) => self.deliver(request, payload),
                Ok(None) => {
                    pending = Some(request);
                    if !self.pause().await {
                        break;
                    }
                }
                Err(e) => {
                    warn!("distributor failed to claim a task {:?}", &e);
                    pending = Some(request);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        debug!("distributor stopped");
    }

    fn deliver(&self, request: WorkerRequest, payload: Document) {
        let id = match payload_id(&payload) {
            Ok(id) => id,
            Err(e) => {
                warn!("claimed a task without id {:?}", &e);
                return;
            }
        };
        debug!("task {} leased to {}", &id, &request.worker);
        if request.reply.send(ClaimedTask { id: id.clone(), payload }).is_err() {
            // recovered by the sweep once the lease expires
            warn!("worker {} left before receiving task {}", &request.worker, &id);
        }
    }

    /// false when cancelled while paused
    async fn pause(&self) -> bool {
        self.state.paused.store(true, Ordering::Release);
        debug!("queue empty, distributor paused");
        tokio::select! {
            _ = self.cancel.cancelled() => return false,
            _ = self.state.wake.notified() => {}
            _ = tokio::time::sleep(self.idle_recheck) => {}
        }
        self.state.paused.store(false, Ordering::Release);
        true
    }
}
