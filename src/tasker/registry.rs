use std::collections::HashMap;

use async_trait::async_trait;
use mongodb::bson::{from_document, to_document, Document};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::tasker::error::{MQueueError, MResult};
use crate::tasker::progress::ProgressCallback;
use crate::tasker::task_common::payload_id;

/// A kind of task. The serialized fields are the payload, `TYPE` is stored
/// under `payload.type` and picks the decoder when the task is claimed.
///
/// Output fields set by `run` are persisted on ack.
#[async_trait]
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;

    async fn run(&mut self, callback: &mut ProgressCallback) -> MResult<()>;
}

/// encode a task into its stored payload
pub fn encode<T: Task>(task: &T) -> MResult<Document> {
    let mut payload = to_document(task)?;
    payload.insert("type", T::TYPE);
    Ok(payload)
}

/// decode a stored payload, extra fields such as `id` and `type` are ignored
pub fn decode<T: Task>(payload: &Document) -> MResult<T> {
    match payload.get_str("type") {
        Ok(task_type) if task_type == T::TYPE => Ok(from_document(payload.clone())?),
        Ok(task_type) => Err(MQueueError::UnknownTaskType(task_type.to_string())),
        Err(_) => Err(MQueueError::MissingField("type")),
    }
}

/// A claimed task with its kind erased.
#[async_trait]
pub trait DynTask: Send {
    fn id(&self) -> &str;
    fn task_type(&self) -> &'static str;
    async fn run(&mut self, callback: &mut ProgressCallback) -> MResult<()>;
    /// current state as a payload including `id`, what ack stores
    fn to_payload(&self) -> MResult<Document>;
}

pub struct TypedTask<T: Task> {
    pub id: String,
    pub task: T,
}

#[async_trait]
impl<T: Task> DynTask for TypedTask<T> {
    fn id(&self) -> &str {
        &self.id
    }

    fn task_type(&self) -> &'static str {
        T::TYPE
    }

    async fn run(&mut self, callback: &mut ProgressCallback) -> MResult<()> {
        self.task.run(callback).await
    }

    fn to_payload(&self) -> MResult<Document> {
        let mut payload = encode(&self.task)?;
        payload.insert("id", self.id.clone());
        Ok(payload)
    }
}

type DecodeFn = fn(&Document) -> MResult<Box<dyn DynTask>>;

fn decode_dyn<T: Task>(payload: &Document) -> MResult<Box<dyn DynTask>> {
    let id = payload_id(payload)?;
    let task = decode::<T>(payload)?;
    Ok(Box::new(TypedTask { id, task }))
}

/// Task kinds this process can run, keyed by their `type` tag.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    decoders: HashMap<String, DecodeFn>,
}

impl TaskRegistry {
    pub fn new() -> TaskRegistry {
        TaskRegistry::default()
    }

    pub fn register<T: Task>(&mut self) -> MResult<()> {
        if self.decoders.contains_key(T::TYPE) {
            return Err(MQueueError::DuplicateTaskType(T::TYPE.to_string()));
        }
        self.decoders.insert(T::TYPE.to_string(), decode_dyn::<T>);
        Ok(())
    }

    /// builder style register, for setups that know their types statically
    pub fn with<T: Task>(mut self) -> MResult<TaskRegistry> {
        self.register::<T>()?;
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// fail fast when nothing is registered, a worker without types would never claim anything
    pub fn ensure_not_empty(&self) -> MResult<()> {
        if self.is_empty() {
            Err(MQueueError::NoTaskTypes)
        } else {
            Ok(())
        }
    }

    /// registered tags, sorted so the claim query is stable
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.decoders.keys().cloned().collect();
        types.sort();
        types
    }

    /// decode a payload returned by get(), it must carry `id` and `type`
    pub fn decode(&self, payload: &Document) -> MResult<Box<dyn DynTask>> {
        let task_type = payload.get_str("type").map_err(|_| MQueueError::MissingField("type"))?;
        let decoder = self.decoders.get(task_type).ok_or_else(|| MQueueError::UnknownTaskType(task_type.to_string()))?;
        decoder(payload)
    }
}
