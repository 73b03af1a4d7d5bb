use mongodb::bson::oid::ObjectId;
use mongodb::bson::{DateTime, Document};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Stored as the exact lowercase strings so existing deployments keep working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Blocked,
}

impl TaskStatus {
    pub const TERMINAL: [TaskStatus; 3] = [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Cancelled];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Blocked => "blocked",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    pub fn is_success(&self) -> bool {
        *self == TaskStatus::Completed
    }
}

fn no_progress() -> f64 {
    -1.0
}

/// One document of the queue collection.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    // task body, contains at least the `type` discriminant
    pub payload: Document,
    pub status: TaskStatus,
    // lower value is claimed first
    pub priority: f64,
    pub created: DateTime,
    // get() must not return this record before this time
    pub earliest_get: DateTime,
    // lease expiry while running, far future otherwise
    pub reset_timestamp: DateTime,
    #[serde(default)]
    pub attempt: i32,
    #[serde(default = "no_progress")]
    pub progress: f64,
    #[serde(default)]
    pub log: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    // further outstanding parents after `parent`
    #[serde(default)]
    pub waiting_on: Vec<String>,
}

impl TaskRecord {
    pub fn task_type(&self) -> Option<&str> {
        self.payload.get_str("type").ok()
    }

    /// payload with the record id copied in, the shape task bodies are decoded from
    pub fn payload_with_id(&self) -> Document {
        let mut payload = self.payload.clone();
        payload.insert("id", self.id.to_hex());
        payload
    }
}

/// Metadata view of a task, without the payload body.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMeta {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: Option<String>,
    pub status: TaskStatus,
    pub created: DateTime,
    pub earliest_get: DateTime,
    pub reset_timestamp: DateTime,
    pub priority: f64,
    pub progress: f64,
    pub attempt: i32,
    pub worker: Option<String>,
    pub parent: Option<String>,
}

impl From<&TaskRecord> for TaskMeta {
    fn from(record: &TaskRecord) -> Self {
        TaskMeta {
            id: record.id.to_hex(),
            task_type: record.task_type().map(str::to_string),
            status: record.status,
            created: record.created,
            earliest_get: record.earliest_get,
            reset_timestamp: record.reset_timestamp,
            priority: record.priority,
            progress: record.progress,
            attempt: record.attempt,
            worker: record.worker.clone(),
            parent: record.parent.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitResponse {
    pub id: String,
    // status the record was inserted with
    pub status: TaskStatus,
}
