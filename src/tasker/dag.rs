use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use mongodb::bson::Document;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::tasker::error::{MQueueError, MResult};
use crate::tasker::registry::{encode, Task};
use crate::tasker::task::{SubmitResponse, TaskStatus};

/// delay of tasks submitted through a dag, so a whole chain is in place before the head runs
pub const DAG_SUBMIT_DELAY: Duration = Duration::from_millis(100);

#[async_trait]
pub trait DagSubmitter: Send + Sync {
    async fn submit_payload(&self, payload: Document, delay: Duration, parents: &[String]) -> MResult<SubmitResponse>;
    async fn task_status(&self, id: &str) -> MResult<Option<TaskStatus>>;
}

enum Supplier {
    OnSubmission(Document),
    Existing(String),
}

/// A task plus the tasks it waits for.
///
/// Clones share their submission, so a node used as parent of several
/// children is submitted once.
#[derive(Clone)]
pub struct TaskDag {
    supplier: Arc<Supplier>,
    parents: Vec<TaskDag>,
    submitted: Arc<OnceCell<SubmitResponse>>,
}

impl TaskDag {
    fn new(supplier: Supplier) -> TaskDag {
        TaskDag { supplier: Arc::new(supplier), parents: vec![], submitted: Arc::new(OnceCell::new()) }
    }

    pub fn create<T: Task>(task: &T) -> MResult<TaskDag> {
        Ok(TaskDag::new(Supplier::OnSubmission(encode(task)?)))
    }

    /// a task that was submitted before, its current status decides whether it blocks
    pub fn existing(id: impl Into<String>) -> TaskDag {
        TaskDag::new(Supplier::Existing(id.into()))
    }

    pub fn after(mut self, parent: TaskDag) -> TaskDag {
        self.parents.push(parent);
        self
    }

    pub fn after_task<T: Task>(self, parent: &T) -> MResult<TaskDag> {
        Ok(self.after(TaskDag::create(parent)?))
    }

    pub fn after_existing(self, id: impl Into<String>) -> TaskDag {
        self.after(TaskDag::existing(id))
    }

    /// id once submitted
    pub fn id(&self) -> Option<&str> {
        self.submitted.get().map(|response| response.id.as_str())
    }

    /// Submit the parents depth first, then this task blocked on those not completed yet.
    pub fn submit<'a>(&'a self, submitter: &'a dyn DagSubmitter) -> BoxFuture<'a, MResult<SubmitResponse>> {
        async move {
            let response = self.submitted.get_or_try_init(|| self.submit_once(submitter)).await?;
            Ok(response.clone())
        }.boxed()
    }

    async fn submit_once(&self, submitter: &dyn DagSubmitter) -> MResult<SubmitResponse> {
        let mut blocking: Vec<String> = vec![];
        for parent in &self.parents {
            let response = parent.submit(submitter).await?;
            // failed parents still block, the child then fails without running
            if !response.status.is_success() && !blocking.contains(&response.id) {
                blocking.push(response.id);
            }
        }
        match self.supplier.as_ref() {
            Supplier::OnSubmission(payload) => {
                let response = submitter.submit_payload(payload.clone(), DAG_SUBMIT_DELAY, &blocking).await?;
                debug!("dag submitted {} as {} after {:?}", &response.id, response.status, &blocking);
                Ok(response)
            }
            Supplier::Existing(id) => {
                let status = submitter.task_status(id).await?.ok_or_else(|| MQueueError::TaskNotFound(id.clone()))?;
                Ok(SubmitResponse { id: id.clone(), status })
            }
        }
    }
}
