use std::collections::HashMap;
use std::sync::Mutex;

use mongodb::bson::Document;
use tokio::sync::watch;
use tracing::debug;

use crate::tasker::error::{MQueueError, MResult};
use crate::tasker::monitor::StatusChange;
use crate::tasker::registry::{decode, Task};
use crate::tasker::task::TaskStatus;

/// The terminal state of a task as delivered to a completion waiter.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCompletion {
    pub id: String,
    pub status: TaskStatus,
    // final payload with `id` copied in
    pub payload: Option<Document>,
}

impl TaskCompletion {
    /// decode the final payload, including any output fields the task body set
    pub fn task<T: Task>(&self) -> MResult<T> {
        match &self.payload {
            Some(payload) => decode::<T>(payload),
            None => Err(MQueueError::MissingField("payload")),
        }
    }
}

/// Resolves once the task reaches a terminal status. Clones share the same result.
#[derive(Clone)]
pub struct Completion {
    receiver: watch::Receiver<Option<TaskCompletion>>,
}

impl Completion {
    pub async fn wait(mut self) -> MResult<TaskCompletion> {
        let value = self.receiver.wait_for(Option::is_some).await.map_err(|_| MQueueError::MonitorStopped)?;
        value.clone().ok_or(MQueueError::MonitorStopped)
    }

    pub fn try_get(&self) -> Option<TaskCompletion> {
        self.receiver.borrow().clone()
    }
}

/// Pending completion promises keyed by task id.
#[derive(Default)]
pub struct CompletionRegistry {
    pending: Mutex<HashMap<String, watch::Sender<Option<TaskCompletion>>>>,
}

impl CompletionRegistry {
    pub fn new() -> CompletionRegistry {
        CompletionRegistry::default()
    }

    /// Get or create the promise for `id`. The flag is true when it was created
    /// by this call, the caller then does the one-shot lookup for tasks that
    /// finished before registration.
    pub fn register(&self, id: &str) -> (Completion, bool) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = pending.get(id) {
            return (Completion { receiver: sender.subscribe() }, false);
        }
        let (sender, receiver) = watch::channel(None);
        pending.insert(id.to_string(), sender);
        (Completion { receiver }, true)
    }

    /// resolve and forget the promise for `completion.id`; false when nothing was pending
    pub fn resolve(&self, completion: TaskCompletion) -> bool {
        let sender = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(&completion.id)
        };
        match sender {
            Some(sender) => {
                debug!("resolving completion of {} as {}", &completion.id, completion.status);
                sender.send_replace(Some(completion));
                true
            }
            None => false,
        }
    }

    /// drop the promise without resolving it, waiters observe MonitorStopped
    pub fn abandon(&self, id: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(id);
    }

    pub fn on_status_change(&self, change: &StatusChange) {
        if !change.status.is_terminal() {
            return;
        }
        self.resolve(TaskCompletion {
            id: change.id.clone(),
            status: change.status,
            payload: change.payload.clone(),
        });
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// drop every pending promise, used on shutdown
    pub fn clear(&self) {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod test {
    use mongodb::bson::doc;

    use crate::tasker::error::MQueueError;
    use crate::tasker::monitor::StatusChange;
    use crate::tasker::registry::test::AddingTask;
    use crate::tasker::task::TaskStatus;

    use super::{CompletionRegistry, TaskCompletion};

    fn change(id: &str, status: TaskStatus) -> StatusChange {
        StatusChange { id: id.to_string(), status, payload: Some(doc! {"type": "adding", "id": id, "a": 2.0, "b": 3.0, "c": 5.0}) }
    }

    #[tokio::test]
    async fn test_get_or_create() {
        let registry = CompletionRegistry::new();
        let (first, created) = registry.register("t1");
        assert!(created);
        let (second, created) = registry.register("t1");
        assert!(!created);
        assert_eq!(registry.pending_count(), 1);

        registry.on_status_change(&change("t1", TaskStatus::Completed));
        let first = first.wait().await.unwrap();
        let second = second.wait().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.task::<AddingTask>().unwrap().c, 5.0);
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_non_terminal_ignored() {
        let registry = CompletionRegistry::new();
        let (completion, _) = registry.register("t1");
        registry.on_status_change(&change("t1", TaskStatus::Queued));
        registry.on_status_change(&change("t1", TaskStatus::Running));
        registry.on_status_change(&change("t1", TaskStatus::Blocked));
        assert!(completion.try_get().is_none());
        registry.on_status_change(&change("t1", TaskStatus::Failed));
        assert_eq!(completion.wait().await.unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_resolved_at_most_once() {
        let registry = CompletionRegistry::new();
        let (completion, _) = registry.register("t1");
        assert!(registry.resolve(TaskCompletion { id: "t1".to_string(), status: TaskStatus::Cancelled, payload: None }));
        assert!(!registry.resolve(TaskCompletion { id: "t1".to_string(), status: TaskStatus::Completed, payload: None }));
        let completion = completion.wait().await.unwrap();
        assert_eq!(completion.status, TaskStatus::Cancelled);
        assert!(matches!(completion.task::<AddingTask>(), Err(MQueueError::MissingField("payload"))));
    }

    #[tokio::test]
    async fn test_abandon() {
        let registry = CompletionRegistry::new();
        let (completion, _) = registry.register("t1");
        registry.abandon("t1");
        assert!(matches!(completion.wait().await, Err(MQueueError::MonitorStopped)));
    }
}
