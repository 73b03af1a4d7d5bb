#![allow(dead_code)]

pub mod test {
    use std::env;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use mongodb::bson::{doc, Document};
    use mongodb::Collection;
    use serde::{Deserialize, Serialize};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    use mtaskq::tasker::consumer::{ConsumerEvent, TaskConsumer};
    use mtaskq::tasker::error::{MQueueError, MResult};
    use mtaskq::tasker::hub::TaskHub;
    use mtaskq::tasker::monitor::{StatusChange, StatusChangeListener};
    use mtaskq::tasker::progress::ProgressCallback;
    use mtaskq::tasker::registry::{Task, TaskRegistry};
    use mtaskq::util::get_collection;

    /// a fresh collection named after the test, on the deployment named by `MongoStr`
    pub async fn init_collection_for_test(collection_name: &str) -> Collection<Document> {
        let connection_str = env::var("MongoStr").expect("need mongodb connection str");
        let collection = get_collection::<Document>(connection_str, "mtaskq_test", collection_name).await.expect("failed to connect");
        collection.delete_many(doc! {}).await.expect("failed to clean up collection");
        collection
    }

    pub async fn init_hub_for_test(collection_name: &str) -> TaskHub {
        let collection = init_collection_for_test(collection_name).await;
        TaskHub::create(collection).await.expect("failed to create hub")
    }

    pub fn test_registry() -> Arc<TaskRegistry> {
        let registry = TaskRegistry::new()
            .with::<AddingTask>().expect("register adding")
            .with::<FailingTask>().expect("register failing");
        Arc::new(registry)
    }

    #[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
    pub struct AddingTask {
        pub a: f64,
        pub b: f64,
        #[serde(default)]
        pub c: f64,
    }

    impl AddingTask {
        pub fn new(a: f64, b: f64) -> AddingTask {
            AddingTask { a, b, c: 0.0 }
        }
    }

    #[async_trait]
    impl Task for AddingTask {
        const TYPE: &'static str = "adding";

        async fn run(&mut self, callback: &mut ProgressCallback) -> MResult<()> {
            callback.log(format!("adding {} and {}", self.a, self.b)).await;
            self.c = self.a + self.b;
            Ok(())
        }
    }

    #[derive(Debug, Default, Clone, Deserialize, Serialize)]
    pub struct FailingTask {
        pub reason: String,
    }

    #[async_trait]
    impl Task for FailingTask {
        const TYPE: &'static str = "failing";

        async fn run(&mut self, _callback: &mut ProgressCallback) -> MResult<()> {
            Err(MQueueError::ExecutionError(self.reason.clone().into()))
        }
    }

    /// remembers every status change in arrival order
    #[derive(Default)]
    pub struct StatusRecorder {
        pub changes: Mutex<Vec<StatusChange>>,
    }

    impl StatusChangeListener for StatusRecorder {
        fn task_status_changed(&self, change: &StatusChange) {
            self.changes.lock().unwrap().push(change.clone());
        }
    }

    /// resolves with the first event matching `check`, None after `wait`
    pub fn spawn_check_handler(consumer: TaskConsumer, check: impl Fn(&ConsumerEvent) -> bool + Send + 'static, wait: Duration) -> JoinHandle<Option<ConsumerEvent>> {
        let mut receiver = consumer.get_event_receiver();
        tokio::spawn(async move {
            timeout(wait, async move {
                while let Ok(event) = receiver.recv().await {
                    if check(&event) {
                        return Some(event);
                    }
                }
                None
            }).await.ok().flatten()
        })
    }
}
