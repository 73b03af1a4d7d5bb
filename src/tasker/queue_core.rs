use std::collections::VecDeque;
use std::time::Duration;

use futures::TryStreamExt;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, Bson, DateTime, Document};
use mongodb::options::ReturnDocument;
use mongodb::Collection;
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

use crate::tasker::error::{MQueueError, MResult};
use crate::tasker::task::{TaskRecord, TaskStatus};
use crate::tasker::task_common::{after, ensure_index, parse_id, payload_id, payload_query, validate_priority};

/// options of a single get() call
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct GetTaskOption {
    // lease length, the task is handed out again after this without a heart-beat
    #[builder(default = 60)]
    pub lease_seconds: u64,
    // sleep between find-and-modify attempts
    #[builder(default = 200)]
    pub poll_millis: u64,
    #[builder(default = 5)]
    pub max_attempts: u32,
    // schedulers forward tasks elsewhere and do not own the lease themselves
    #[builder(default = false)]
    pub is_scheduler: bool,
}

impl Default for GetTaskOption {
    fn default() -> Self {
        GetTaskOption::builder().build()
    }
}

/// Durable lease based priority queue over one collection.
///
/// This is the only writer of the task state machine.
#[derive(Clone)]
pub struct MongoQueueCore {
    collection: Collection<Document>,
}

impl MongoQueueCore {
    pub fn create(collection: Collection<Document>) -> MongoQueueCore {
        MongoQueueCore { collection }
    }

    pub fn collection(&self) -> &Collection<Document> {
        &self.collection
    }

    pub fn record_collection(&self) -> Collection<TaskRecord> {
        self.collection.clone_with_type::<TaskRecord>()
    }

    pub async fn ensure_get_index(&self) {
        ensure_index(&self.collection).await;
    }

    /// send a single task, blocked on `parents` that have not completed yet
    pub async fn send(&self, payload: Document, earliest_get: DateTime, priority: f64, parents: &[String]) -> MResult<(String, TaskStatus)> {
        validate_priority(priority)?;
        if payload.get_str("type").is_err() {
            return Err(MQueueError::MissingField("type"));
        }
        let blocking = self.resolve_parents(parents).await?;
        let mut message = new_message(payload, earliest_get, priority);
        let status = match &blocking {
            ParentState::Ready => TaskStatus::Queued,
            ParentState::Failed(parent) => {
                message.insert("parent", parent.clone());
                TaskStatus::Failed
            }
            ParentState::Waiting(outstanding) => {
                message.insert("parent", outstanding[0].clone());
                message.insert("waitingOn", outstanding[1..].to_vec());
                TaskStatus::Blocked
            }
        };
        message.insert("status", status.to_string());
        let id = message.get_object_id("_id").map_err(|_| MQueueError::MissingField("_id"))?;
        debug!("inserting task {} as {}", id, status);
        self.collection.insert_one(&message).await?;

        if let ParentState::Waiting(outstanding) = blocking {
            // the parent may have been acked between the lookup and the insert
            let parent = &outstanding[0];
            if let Some(parent_status) = self.status_of(parent).await? {
                if parent_status.is_terminal() {
                    debug!("parent {} finished during insert of {}", parent, id);
                    self.release_children(parent, parent_status).await?;
                }
            }
        }
        Ok((id.to_hex(), status))
    }

    /// send a batch of tasks sharing the same timing fields, ids are returned in input order
    pub async fn send_many(&self, payloads: Vec<Document>, earliest_get: DateTime, priority: f64) -> MResult<Vec<String>> {
        validate_priority(priority)?;
        if payloads.iter().any(|payload| payload.get_str("type").is_err()) {
            return Err(MQueueError::MissingField("type"));
        }
        if payloads.is_empty() {
            return Ok(vec![]);
        }
        let mut ids = Vec::with_capacity(payloads.len());
        let messages: Vec<Document> = payloads.into_iter()
            .map(|payload| {
                let mut message = new_message(payload, earliest_get, priority);
                message.insert("status", TaskStatus::Queued.to_string());
                if let Ok(id) = message.get_object_id("_id") {
                    ids.push(id.to_hex());
                }
                message
            })
            .collect();
        info!("inserting {} tasks", messages.len());
        self.collection.insert_many(messages).await?;
        Ok(ids)
    }

    /// Claim the next eligible task matching `query` (`payload.<k>` filters).
    ///
    /// Returns the payload with `id` appended, or None when nothing was
    /// eligible after `max_attempts` polls.
    pub async fn get(&self, query: &Document, option: &GetTaskOption, worker: &str) -> MResult<Option<Document>> {
        self.reset_stuck().await?;

        let update = claim_update(option, worker);
        for attempt in 0..option.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(option.poll_millis)).await;
            }
            let built_query = claim_query(query);
            debug!("querying {}", &built_query);
            let message = self.collection.find_one_and_update(built_query, update.clone())
                .sort(doc! {"priority":1,"created":1,"_id":1})
                .projection(doc! {"payload":1})
                .return_document(ReturnDocument::After)
                .upsert(false)
                .await?;
            if let Some(message) = message {
                return Ok(Some(claimed_payload(message)?));
            }
        }
        Ok(None)
    }

    /// return every running task whose lease passed to the queue, bumping its attempt
    pub async fn reset_stuck(&self) -> MResult<u64> {
        let result = self.collection.update_many(
            doc! {"status": TaskStatus::Running.as_str(), "resetTimestamp": {"$lte": DateTime::now()}},
            doc! {
                "$set": {"status": TaskStatus::Queued.as_str(), "resetTimestamp": DateTime::MAX},
                "$inc": {"attempt": 1},
            },
        ).await?;
        if result.modified_count > 0 {
            info!("reset {} stuck tasks", result.modified_count);
        }
        Ok(result.modified_count)
    }

    /// Heart-beat: extend the lease and append log lines.
    ///
    /// Best effort, a record that is already terminal is left untouched.
    pub async fn progress(&self, id: &str, log: &[String], progress: f64, reset_seconds: u64, worker: &str) -> MResult<()> {
        let object_id = parse_id(id)?;
        let update = progress_update(log, progress, after(Duration::from_secs(reset_seconds)), worker);
        self.collection.update_one(
            doc! {"_id": object_id, "status": {"$nin": terminal_strings()}},
            update,
        ).await?;
        Ok(())
    }

    /// Acknowledge a task received from get() with a terminal status, then
    /// queue or fail the tasks blocked on it.
    pub async fn ack(&self, message: &Document, status: TaskStatus) -> MResult<()> {
        if !status.is_terminal() {
            return Err(MQueueError::InvalidStatus(status.to_string()));
        }
        let id = payload_id(message)?;
        let object_id = parse_id(&id)?;
        let mut payload = message.clone();
        payload.remove("id");

        let previous = self.collection.find_one_and_update(
            doc! {"_id": object_id, "status": {"$nin": terminal_strings()}},
            doc! {"$set": {"status": status.as_str(), "payload": payload}},
        ).await?;
        if previous.is_some() {
            return self.release_children(&id, status).await;
        }
        // already terminal or gone, replay the cascade with what is stored
        match self.status_of(&id).await? {
            Some(stored) if stored.is_terminal() => {
                debug!("task {} already {}, ignoring ack {}", id, stored, status);
                self.release_children(&id, stored).await
            }
            Some(stored) => {
                warn!("task {} is {} and could not be acked", id, stored);
                Ok(())
            }
            None => {
                warn!("acked task {} does not exist", id);
                Ok(())
            }
        }
    }

    /// cancel a task that has not finished yet, returns false when it already had
    pub async fn cancel(&self, id: &str) -> MResult<bool> {
        let object_id = parse_id(id)?;
        let result = self.collection.update_one(
            doc! {"_id": object_id, "status": {"$nin": terminal_strings()}},
            doc! {"$set": {"status": TaskStatus::Cancelled.as_str(), "resetTimestamp": DateTime::MAX}},
        ).await?;
        if result.matched_count == 0 {
            return Ok(false);
        }
        self.release_children(id, TaskStatus::Cancelled).await?;
        Ok(true)
    }

    /// Put a task back in the queue with fresh timestamps.
    ///
    /// Upserts, so a manually deleted record is simply sent again.
    pub async fn requeue(&self, message: &Document, earliest_get: DateTime, priority: f64) -> MResult<String> {
        validate_priority(priority)?;
        let id = payload_id(message)?;
        let object_id = parse_id(&id)?;
        let mut payload = message.clone();
        payload.remove("id");
        self.collection.update_one(
            doc! {"_id": object_id},
            doc! {
                "$set": {
                    "payload": payload,
                    "status": TaskStatus::Queued.as_str(),
                    "resetTimestamp": DateTime::MAX,
                    "earliestGet": earliest_get,
                    "priority": priority,
                    "created": DateTime::now(),
                    "log": [],
                    "progress": 0.0,
                    "attempt": 0,
                    "waitingOn": [],
                },
                "$unset": {"parent": "", "worker": ""},
            },
        ).upsert(true).await?;
        Ok(id)
    }

    pub async fn count(&self, query: &Document) -> MResult<u64> {
        Ok(self.collection.count_documents(payload_query(query)).await?)
    }

    pub async fn count_status(&self, query: &Document, status: TaskStatus) -> MResult<u64> {
        let mut complete_query = doc! {"status": status.as_str()};
        complete_query.extend(payload_query(query));
        Ok(self.collection.count_documents(complete_query).await?)
    }

    pub async fn find_record(&self, id: &str) -> MResult<Option<TaskRecord>> {
        let object_id = parse_id(id)?;
        Ok(self.record_collection().find_one(doc! {"_id": object_id}).await?)
    }

    pub async fn find_records(&self, filter: Document) -> MResult<Vec<TaskRecord>> {
        Ok(self.record_collection().find(filter).sort(doc! {"created":1,"_id":1}).await?.try_collect().await?)
    }

    pub async fn status_of(&self, id: &str) -> MResult<Option<TaskStatus>> {
        Ok(self.find_record(id).await?.map(|record| record.status))
    }

    async fn resolve_parents(&self, parents: &[String]) -> MResult<ParentState> {
        let mut outstanding = vec![];
        for parent in parents {
            match self.status_of(parent).await? {
                None => return Err(MQueueError::TaskNotFound(parent.clone())),
                Some(TaskStatus::Completed) => {}
                Some(TaskStatus::Failed) | Some(TaskStatus::Cancelled) => return Ok(ParentState::Failed(parent.clone())),
                Some(_) => {
                    if !outstanding.contains(parent) {
                        outstanding.push(parent.clone());
                    }
                }
            }
        }
        if outstanding.is_empty() {
            Ok(ParentState::Ready)
        } else {
            Ok(ParentState::Waiting(outstanding))
        }
    }

    /// bump blocked children of a finished parent onto the queue, or fail them
    async fn release_children(&self, parent: &str, parent_status: TaskStatus) -> MResult<()> {
        if !parent_status.is_success() {
            return self.fail_descendants(parent).await;
        }
        let mut finished: VecDeque<String> = VecDeque::from([parent.to_string()]);
        while let Some(parent) = finished.pop_front() {
            let queued = self.collection.update_many(
                doc! {
                    "status": TaskStatus::Blocked.as_str(),
                    "parent": parent.as_str(),
                    "$or": [{"waitingOn": {"$exists": false}}, {"waitingOn": {"$size": 0}}],
                },
                doc! {"$set": {"status": TaskStatus::Queued.as_str()}},
            ).await?;
            if queued.modified_count > 0 {
                debug!("queued {} tasks blocked on {}", queued.modified_count, &parent);
            }
            // children still waiting on other parents move on to the next one
            let waiting = self.find_records(doc! {
                "status": TaskStatus::Blocked.as_str(),
                "parent": parent.as_str(),
                "waitingOn.0": {"$exists": true},
            }).await?;
            for child in waiting {
                if let Some(next) = self.advance_child(&child, &parent).await? {
                    finished.push_back(next);
                }
            }
        }
        Ok(())
    }

    /// move `child` from `parent` to its next outstanding parent; returns that parent if it already completed
    async fn advance_child(&self, child: &TaskRecord, parent: &str) -> MResult<Option<String>> {
        let mut remaining: VecDeque<String> = child.waiting_on.iter().cloned().collect();
        while let Some(next) = remaining.pop_front() {
            match self.status_of(&next).await? {
                Some(TaskStatus::Completed) => continue,
                Some(TaskStatus::Failed) | Some(TaskStatus::Cancelled) | None => {
                    self.collection.update_one(
                        doc! {"_id": child.id, "status": TaskStatus::Blocked.as_str()},
                        doc! {"$set": {"status": TaskStatus::Failed.as_str()}},
                    ).await?;
                    return self.fail_descendants(&child.id.to_hex()).await.map(|_| None);
                }
                Some(_) => {
                    let rest: Vec<String> = remaining.into_iter().collect();
                    self.collection.update_one(
                        doc! {"_id": child.id, "status": TaskStatus::Blocked.as_str(), "parent": parent},
                        doc! {"$set": {"parent": next.as_str(), "waitingOn": rest}},
                    ).await?;
                    // same race as in send()
                    return match self.status_of(&next).await? {
                        Some(status) if status.is_success() => Ok(Some(next)),
                        Some(status) if status.is_terminal() => self.fail_descendants(&next).await.map(|_| None),
                        _ => Ok(None),
                    };
                }
            }
        }
        // every other parent completed meanwhile
        self.collection.update_one(
            doc! {"_id": child.id, "status": TaskStatus::Blocked.as_str(), "parent": parent},
            doc! {"$set": {"status": TaskStatus::Queued.as_str(), "waitingOn": []}},
        ).await?;
        Ok(None)
    }

    /// fail every blocked task that depends on `failed`, transitively
    async fn fail_descendants(&self, failed: &str) -> MResult<()> {
        let mut frontier = vec![failed.to_string()];
        while !frontier.is_empty() {
            let filter = doc! {
                "status": TaskStatus::Blocked.as_str(),
                "$or": [{"parent": {"$in": frontier.clone()}}, {"waitingOn": {"$in": frontier.clone()}}],
            };
            let children: Vec<ObjectId> = self.collection.find(filter).projection(doc! {"_id":1}).await?
                .try_collect::<Vec<Document>>().await?
                .iter()
                .filter_map(|child| child.get_object_id("_id").ok())
                .collect();
            if children.is_empty() {
                break;
            }
            self.collection.update_many(
                doc! {"_id": {"$in": children.clone()}, "status": TaskStatus::Blocked.as_str()},
                doc! {"$set": {"status": TaskStatus::Failed.as_str()}},
            ).await?;
            debug!("failed {} tasks depending on {:?}", children.len(), &frontier);
            frontier = children.iter().map(|id| id.to_hex()).collect();
        }
        Ok(())
    }
}

enum ParentState {
    Ready,
    Failed(String),
    Waiting(Vec<String>),
}

fn terminal_strings() -> Vec<String> {
    TaskStatus::TERMINAL.iter().map(|status| status.as_str().to_string()).collect()
}

fn new_message(payload: Document, earliest_get: DateTime, priority: f64) -> Document {
    doc! {
        "_id": ObjectId::new(),
        "payload": payload,
        "resetTimestamp": DateTime::MAX,
        "earliestGet": earliest_get,
        "priority": priority,
        "created": DateTime::now(),
        "log": [],
        "progress": 0.0,
        "attempt": 0,
        "waitingOn": [],
    }
}

pub(crate) fn claim_query(query: &Document) -> Document {
    let mut built_query = doc! {"status": TaskStatus::Queued.as_str()};
    built_query.extend(payload_query(query));
    built_query.insert("earliestGet", doc! {"$lte": DateTime::now()});
    built_query
}

pub(crate) fn claim_update(option: &GetTaskOption, worker: &str) -> Document {
    let mut set = doc! {
        "status": TaskStatus::Running.as_str(),
        "resetTimestamp": after(Duration::from_secs(option.lease_seconds)),
        "progress": 0.0,
    };
    if !option.is_scheduler {
        set.insert("worker", worker);
    }
    doc! {"$set": set}
}

pub(crate) fn progress_update(log: &[String], progress: f64, reset_timestamp: DateTime, worker: &str) -> Document {
    let mut set = doc! {
        "status": TaskStatus::Running.as_str(),
        "resetTimestamp": reset_timestamp,
        "worker": worker,
    };
    if progress >= 0.0 {
        set.insert("progress", progress.min(1.0));
    }
    let mut update = doc! {"$set": set};
    if !log.is_empty() {
        update.insert("$push", doc! {"log": {"$each": log.to_vec()}});
    }
    update
}

fn claimed_payload(message: Document) -> MResult<Document> {
    let id = message.get_object_id("_id").map_err(|_| MQueueError::MissingField("_id"))?;
    let mut payload = match message.get("payload") {
        Some(Bson::Document(payload)) => payload.clone(),
        _ => return Err(MQueueError::MissingField("payload")),
    };
    payload.insert("id", id.to_hex());
    Ok(payload)
}
