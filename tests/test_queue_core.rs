/// queue core against a live deployment
mod common;

#[cfg(test)]
mod test {
    use std::time::Duration;

    use futures::TryStreamExt;
    use mongodb::bson::{doc, DateTime, Document};

    use mtaskq::tasker::error::MQueueError;
    use mtaskq::tasker::queue_core::{GetTaskOption, MongoQueueCore};
    use mtaskq::tasker::task::TaskStatus;
    use mtaskq::tasker::task_common::{after, ensure_one_index, parse_id, type_query};

    use crate::common::test::init_collection_for_test;

    async fn init_core(collection_name: &str) -> MongoQueueCore {
        let core = MongoQueueCore::create(init_collection_for_test(collection_name).await);
        core.ensure_get_index().await;
        core
    }

    fn named(name: &str) -> Document {
        doc! {"type": "adding", "name": name}
    }

    fn once() -> GetTaskOption {
        GetTaskOption::builder().max_attempts(1_u32).build()
    }

    async fn claim(core: &MongoQueueCore, name: &str) -> Document {
        core.get(&doc! {"name": name}, &once(), "worker").await
            .expect("failed to get")
            .unwrap_or_else(|| panic!("{} should be claimable", name))
    }

    async fn status(core: &MongoQueueCore, id: &str) -> TaskStatus {
        core.status_of(id).await.expect("failed to find").expect("task should exist")
    }

    #[test_log::test(tokio::test)]
    pub async fn test_priority_then_fifo() {
        let core = init_core("test_priority_then_fifo").await;
        let now = DateTime::now();
        core.send(named("late"), now, 1.0, &[]).await.expect("failed to send");
        core.send(named("first"), now, 0.0, &[]).await.expect("failed to send");
        core.send(named("second"), now, 0.0, &[]).await.expect("failed to send");
        // one batch shares a single created timestamp
        let batch: Vec<Document> = (0..5).map(|i| named(&format!("batch {}", i))).collect();
        core.send_many(batch, now, 0.0).await.expect("failed to send");

        let mut names = vec![];
        while let Some(payload) = core.get(&doc! {}, &once(), "worker").await.expect("failed to get") {
            names.push(payload.get_str("name").unwrap().to_string());
        }
        assert_eq!(names, vec!["first", "second", "batch 0", "batch 1", "batch 2", "batch 3", "batch 4", "late"]);
    }

    #[test_log::test(tokio::test)]
    pub async fn test_earliest_get() {
        let core = init_core("test_earliest_get").await;
        core.send(named("delayed"), after(Duration::from_secs(1)), 0.0, &[]).await.expect("failed to send");
        assert!(core.get(&doc! {}, &once(), "worker").await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(core.get(&doc! {}, &once(), "worker").await.unwrap().is_some());
    }

    #[test_log::test(tokio::test)]
    pub async fn test_type_query() {
        let core = init_core("test_type_query").await;
        core.send(doc! {"type": "adding"}, DateTime::now(), 0.0, &[]).await.unwrap();
        core.send(doc! {"type": "upper", "input": "x"}, DateTime::now(), 0.0, &[]).await.unwrap();
        let payload = core.get(&type_query(&["upper".to_string()]), &once(), "worker").await.unwrap().expect("upper task");
        assert_eq!(payload.get_str("type").unwrap(), "upper");
        assert_eq!(payload.get_str("id").unwrap().len(), 24);
        assert!(core.get(&type_query(&["upper".to_string()]), &once(), "worker").await.unwrap().is_none());
    }

    #[test_log::test(tokio::test)]
    pub async fn test_lease_recovery() {
        let core = init_core("test_lease_recovery").await;
        let (id, _) = core.send(named("lost"), DateTime::now(), 0.0, &[]).await.unwrap();
        let short_lease = GetTaskOption::builder().lease_seconds(1_u64).max_attempts(1_u32).build();
        let first = core.get(&doc! {}, &short_lease, "w1").await.unwrap().expect("claimable");
        assert_eq!(first.get_str("id").unwrap(), id);
        // leased, nobody else gets it
        assert!(core.get(&doc! {}, &once(), "w2").await.unwrap().is_none());

        // w1 dies silently
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let second = core.get(&doc! {}, &once(), "w2").await.unwrap().expect("recovered");
        assert_eq!(second.get_str("id").unwrap(), id);
        let record = core.find_record(&id).await.unwrap().unwrap();
        assert_eq!(record.attempt, 1);
        assert_eq!(record.worker.as_deref(), Some("w2"));
        assert_eq!(record.status, TaskStatus::Running);

        core.ack(&second, TaskStatus::Completed).await.unwrap();
        assert_eq!(status(&core, &id).await, TaskStatus::Completed);
    }

    #[test_log::test(tokio::test)]
    pub async fn test_progress_appends_logs() {
        let core = init_core("test_progress_appends_logs").await;
        let (id, _) = core.send(named("chatty"), DateTime::now(), 0.0, &[]).await.unwrap();
        let payload = claim(&core, "chatty").await;
        core.progress(&id, &["a".to_string(), "b".to_string()], 0.3, 60, "worker").await.unwrap();
        core.progress(&id, &["c".to_string()], -1.0, 60, "worker").await.unwrap();
        let record = core.find_record(&id).await.unwrap().unwrap();
        assert_eq!(record.log, vec!["a", "b", "c"]);
        assert_eq!(record.progress, 0.3);
        assert!(record.reset_timestamp > DateTime::now());

        core.ack(&payload, TaskStatus::Completed).await.unwrap();
        // late heart-beats don't revive a finished task
        core.progress(&id, &["d".to_string()], 0.9, 60, "worker").await.unwrap();
        let record = core.find_record(&id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.log.len(), 3);
        assert!(matches!(core.progress("nope", &[], 0.1, 60, "worker").await, Err(MQueueError::InvalidTaskId(_))));
    }

    #[test_log::test(tokio::test)]
    pub async fn test_ack_releases_children() {
        let core = init_core("test_ack_releases_children").await;
        let (a, a_status) = core.send(named("a"), DateTime::now(), 0.0, &[]).await.unwrap();
        let (b, b_status) = core.send(named("b"), DateTime::now(), 0.0, &[a.clone()]).await.unwrap();
        let (c, c_status) = core.send(named("c"), DateTime::now(), 0.0, &[b.clone()]).await.unwrap();
        assert_eq!((a_status, b_status, c_status), (TaskStatus::Queued, TaskStatus::Blocked, TaskStatus::Blocked));
        // blocked tasks are never handed out
        assert!(core.get(&doc! {"name": "b"}, &once(), "worker").await.unwrap().is_none());

        let mut payload = claim(&core, "a").await;
        payload.insert("result", 1);
        core.ack(&payload, TaskStatus::Completed).await.unwrap();
        assert_eq!(status(&core, &b).await, TaskStatus::Queued);
        assert_eq!(status(&core, &c).await, TaskStatus::Blocked);
        let stored = core.find_record(&a).await.unwrap().unwrap();
        assert_eq!(stored.payload.get_i32("result").unwrap(), 1);
        assert!(!stored.payload.contains_key("id"));

        let payload = claim(&core, "b").await;
        core.ack(&payload, TaskStatus::Completed).await.unwrap();
        assert_eq!(status(&core, &c).await, TaskStatus::Queued);

        // a repeated ack keeps the first outcome
        core.ack(&payload, TaskStatus::Failed).await.unwrap();
        assert_eq!(status(&core, &b).await, TaskStatus::Completed);
        assert!(matches!(core.ack(&payload, TaskStatus::Running).await, Err(MQueueError::InvalidStatus(_))));
    }

    #[test_log::test(tokio::test)]
    pub async fn test_failure_cascade() {
        let core = init_core("test_failure_cascade").await;
        let (a, _) = core.send(named("a"), DateTime::now(), 0.0, &[]).await.unwrap();
        let (other, _) = core.send(named("other"), DateTime::now(), 0.0, &[]).await.unwrap();
        let (b, _) = core.send(named("b"), DateTime::now(), 0.0, &[a.clone()]).await.unwrap();
        let (c, _) = core.send(named("c"), DateTime::now(), 0.0, &[b.clone()]).await.unwrap();
        // blocked on `other` first, `a` only through waitingOn
        let (d, _) = core.send(named("d"), DateTime::now(), 0.0, &[other.clone(), a.clone()]).await.unwrap();

        let payload = claim(&core, "a").await;
        core.ack(&payload, TaskStatus::Failed).await.unwrap();
        for id in [&b, &c, &d] {
            assert_eq!(status(&core, id).await, TaskStatus::Failed);
        }
        assert_eq!(status(&core, &other).await, TaskStatus::Queued);

        // children of an already failed parent fail on insert
        let (e, e_status) = core.send(named("e"), DateTime::now(), 0.0, &[a.clone()]).await.unwrap();
        assert_eq!(e_status, TaskStatus::Failed);
        assert_eq!(status(&core, &e).await, TaskStatus::Failed);
    }

    #[test_log::test(tokio::test)]
    pub async fn test_all_parents_must_complete() {
        let core = init_core("test_all_parents_must_complete").await;
        let (p1, _) = core.send(named("p1"), DateTime::now(), 0.0, &[]).await.unwrap();
        let (p2, _) = core.send(named("p2"), DateTime::now(), 0.0, &[]).await.unwrap();
        let (child, child_status) = core.send(named("child"), DateTime::now(), 0.0, &[p1.clone(), p2.clone()]).await.unwrap();
        assert_eq!(child_status, TaskStatus::Blocked);
        let record = core.find_record(&child).await.unwrap().unwrap();
        assert_eq!(record.parent.as_deref(), Some(p1.as_str()));
        assert_eq!(record.waiting_on, vec![p2.clone()]);

        let payload = claim(&core, "p1").await;
        core.ack(&payload, TaskStatus::Completed).await.unwrap();
        let record = core.find_record(&child).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Blocked);
        assert_eq!(record.parent.as_deref(), Some(p2.as_str()));
        assert!(record.waiting_on.is_empty());

        // completed parents no longer block new tasks
        let (late, late_status) = core.send(named("late"), DateTime::now(), 0.0, &[p1.clone()]).await.unwrap();
        assert_eq!(late_status, TaskStatus::Queued);
        assert_eq!(status(&core, &late).await, TaskStatus::Queued);

        let payload = claim(&core, "p2").await;
        core.ack(&payload, TaskStatus::Completed).await.unwrap();
        assert_eq!(status(&core, &child).await, TaskStatus::Queued);

        let missing = "5f1b2c3d4e5f6a7b8c9d0e1f".to_string();
        assert!(matches!(core.send(named("orphan"), DateTime::now(), 0.0, &[missing]).await, Err(MQueueError::TaskNotFound(_))));
    }

    #[test_log::test(tokio::test)]
    pub async fn test_cancel() {
        let core = init_core("test_cancel").await;
        let (a, _) = core.send(named("a"), DateTime::now(), 0.0, &[]).await.unwrap();
        let (b, _) = core.send(named("b"), DateTime::now(), 0.0, &[a.clone()]).await.unwrap();
        assert!(core.cancel(&a).await.unwrap());
        assert_eq!(status(&core, &a).await, TaskStatus::Cancelled);
        assert_eq!(status(&core, &b).await, TaskStatus::Failed);
        assert!(!core.cancel(&a).await.unwrap());
        assert!(core.get(&doc! {}, &once(), "worker").await.unwrap().is_none());
    }

    #[test_log::test(tokio::test)]
    pub async fn test_requeue() {
        let core = init_core("test_requeue").await;
        let (id, _) = core.send(named("again"), DateTime::now(), 3.0, &[]).await.unwrap();
        let payload = claim(&core, "again").await;
        core.progress(&id, &["first run".to_string()], 0.5, 60, "worker").await.unwrap();
        core.ack(&payload, TaskStatus::Failed).await.unwrap();

        assert_eq!(core.requeue(&payload, DateTime::now(), 0.0).await.unwrap(), id);
        let record = core.find_record(&id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Queued);
        assert_eq!(record.attempt, 0);
        assert_eq!(record.priority, 0.0);
        assert!(record.log.is_empty());
        assert!(record.worker.is_none());
        assert_eq!(claim(&core, "again").await.get_str("id").unwrap(), id);
    }

    #[test_log::test(tokio::test)]
    pub async fn test_requeue_deleted_record() {
        let core = init_core("test_requeue_deleted_record").await;
        let (id, _) = core.send(named("gone"), DateTime::now(), 2.0, &[]).await.unwrap();
        let payload = claim(&core, "gone").await;
        let deleted = core.collection().delete_one(doc! {"_id": parse_id(&id).unwrap()}).await.unwrap();
        assert_eq!(deleted.deleted_count, 1);
        assert!(core.find_record(&id).await.unwrap().is_none());

        assert_eq!(core.requeue(&payload, DateTime::now(), 0.0).await.unwrap(), id);
        let record = core.find_record(&id).await.unwrap().expect("recreated by requeue");
        assert_eq!(record.status, TaskStatus::Queued);
        assert_eq!(record.attempt, 0);
        assert_eq!(record.payload.get_str("name").unwrap(), "gone");
        assert_eq!(claim(&core, "gone").await.get_str("id").unwrap(), id);
    }

    #[test_log::test(tokio::test)]
    pub async fn test_send_many_and_count() {
        let core = init_core("test_send_many_and_count").await;
        let payloads: Vec<Document> = (0..10).map(|i| doc! {"type": "adding", "index": i}).collect();
        let ids = core.send_many(payloads, DateTime::now(), 0.0).await.unwrap();
        assert_eq!(ids.len(), 10);
        for (i, id) in ids.iter().enumerate() {
            let record = core.find_record(id).await.unwrap().unwrap();
            assert_eq!(record.payload.get_i32("index").unwrap(), i as i32);
        }
        assert_eq!(core.count(&doc! {}).await.unwrap(), 10);
        assert_eq!(core.count(&doc! {"index": {"$lt": 3}}).await.unwrap(), 3);
        assert_eq!(core.count_status(&doc! {}, TaskStatus::Queued).await.unwrap(), 10);
        assert_eq!(core.count_status(&doc! {}, TaskStatus::Running).await.unwrap(), 0);
        assert!(core.send_many(vec![], DateTime::now(), 0.0).await.unwrap().is_empty());
    }

    #[test_log::test(tokio::test)]
    pub async fn test_validation() {
        let core = init_core("test_validation").await;
        assert!(matches!(core.send(named("x"), DateTime::now(), f64::NAN, &[]).await, Err(MQueueError::InvalidPriority(_))));
        assert!(matches!(core.send(doc! {"a": 1}, DateTime::now(), 0.0, &[]).await, Err(MQueueError::MissingField("type"))));
        assert!(matches!(core.send_many(vec![doc! {"a": 1}], DateTime::now(), 0.0).await, Err(MQueueError::MissingField("type"))));
        assert_eq!(core.count(&doc! {}).await.unwrap(), 0);
    }

    #[test_log::test(tokio::test)]
    pub async fn test_ensure_index() {
        let core = init_core("test_ensure_index").await;
        // already there from init_core
        core.ensure_get_index().await;
        assert!(ensure_one_index(core.collection(), "another_name", doc! {"status":1,"resetTimestamp":1}).await);
        let names: Vec<String> = core.collection().list_index_names().await.unwrap();
        for name in ["status_priority_created_earliestGet", "status_resetTimestamp", "status_parent"] {
            assert!(names.contains(&name.to_string()), "missing index {}", name);
        }
        assert!(!names.contains(&"another_name".to_string()));
        let indexes: Vec<_> = core.collection().list_indexes().await.unwrap().try_collect().await.unwrap();
        assert_eq!(indexes.len(), 4);
    }
}
