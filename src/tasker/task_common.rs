use std::time::Duration;

use futures::TryStreamExt;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, Bson, DateTime, Document};
use mongodb::options::IndexOptions;
use mongodb::{Collection, IndexModel};
use tracing::{debug, warn};

use crate::tasker::error::{MQueueError, MResult};
use crate::tasker::task::TaskStatus;

const ENSURE_INDEX_ATTEMPTS: usize = 5;

/// create the indexes used by get(), the stuck lease sweep and the unblock cascade
pub async fn ensure_index<T: Send + Sync>(collection: &Collection<T>) {
    // equality, sort, range in that order
    ensure_one_index(collection, "status_priority_created_earliestGet", doc! {"status":1,"priority":1,"created":1,"earliestGet":1}).await;
    ensure_one_index(collection, "status_resetTimestamp", doc! {"status":1,"resetTimestamp":1}).await;
    ensure_one_index(collection, "status_parent", doc! {"status":1,"parent":1}).await;
}

/// returns false when the index could not be created, queue still works without it
pub async fn ensure_one_index<T: Send + Sync>(collection: &Collection<T>, name: &str, keys: Document) -> bool {
    for attempt in 0..ENSURE_INDEX_ATTEMPTS {
        // an index with the same keys under another name is just as good
        match index_exists(collection, &keys).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => debug!("failed to list indexes, attempt={} {:?}", attempt, &e),
        }
        let index = IndexModel::builder()
            .keys(keys.clone())
            .options({
                let mut options = IndexOptions::default();
                options.name = Some(name.to_string());
                options.background = Some(true);
                options
            })
            .build();
        match collection.create_index(index).await {
            Ok(_) => return true,
            Err(e) => debug!("failed to create index {}, attempt={} {:?}", name, attempt, &e),
        }
    }
    warn!("couldn't create index {} after {} attempts", name, ENSURE_INDEX_ATTEMPTS);
    false
}

async fn index_exists<T: Send + Sync>(collection: &Collection<T>, keys: &Document) -> MResult<bool> {
    let indexes: Vec<IndexModel> = collection.list_indexes().await?.try_collect().await?;
    Ok(indexes.iter().any(|index| &index.keys == keys))
}

pub fn parse_id(id: &str) -> MResult<ObjectId> {
    ObjectId::parse_str(id).map_err(|_| MQueueError::InvalidTaskId(id.to_string()))
}

/// `now + duration`, saturating at the far future sentinel
pub fn after(duration: Duration) -> DateTime {
    let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
    DateTime::from_millis(DateTime::now().timestamp_millis().saturating_add(millis))
}

pub fn validate_priority(priority: f64) -> MResult<()> {
    if priority.is_finite() {
        Ok(())
    } else {
        Err(MQueueError::InvalidPriority(priority))
    }
}

/// prefix each top level key with `payload.`, values are copied as is so `$in` etc. work one level down
pub fn payload_query(query: &Document) -> Document {
    let mut result = Document::new();
    for (key, value) in query {
        result.insert(format!("payload.{}", key), value.clone());
    }
    result
}

/// the union filter for a set of task types
pub fn type_query(types: &[String]) -> Document {
    doc! {"type": {"$in": types.to_vec()}}
}

pub fn status_in(statuses: &[TaskStatus]) -> Bson {
    let values: Vec<Bson> = statuses.iter().map(|status| Bson::String(status.as_str().to_string())).collect();
    Bson::Document(doc! {"$in": values})
}

/// id of a payload returned by get(), the hex string written under `id`
pub fn payload_id(payload: &Document) -> MResult<String> {
    payload.get_str("id").map(str::to_string).map_err(|_| MQueueError::MissingField("id"))
}
