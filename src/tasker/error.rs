use std::error::Error;
use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MQueueError {
    // priority must be a finite number
    #[error("priority was {0}")]
    InvalidPriority(f64),
    #[error("invalid task id {0}")]
    InvalidTaskId(String),
    #[error("invalid task status {0}")]
    InvalidStatus(String),
    #[error("task payload is missing field {0}")]
    MissingField(&'static str),
    #[error("no task type registered for {0}")]
    UnknownTaskType(String),
    #[error("duplicate task type {0}")]
    DuplicateTaskType(String),
    #[error("no task types registered")]
    NoTaskTypes,
    #[error("no such task {0}")]
    TaskNotFound(String),
    #[error("serialization failed: {0}")]
    SerializationError(String),
    // the task body returned an error
    #[error("{0}")]
    ExecutionError(Box<dyn Error + Send + Sync>),
    #[error("distributor stopped")]
    DistributorStopped,
    #[error("status monitor stopped")]
    MonitorStopped,
    #[error("response channel closed")]
    ResponseChannelClosed,
    // mongo db returns an error that cannot get handled
    #[error("mongodb error: {0}")]
    MongoDbError(Arc<mongodb::error::Error>),
}

pub type MResult<T> = Result<T, MQueueError>;

impl From<mongodb::error::Error> for MQueueError {
    fn from(value: mongodb::error::Error) -> Self {
        MQueueError::MongoDbError(Arc::new(value))
    }
}

impl From<mongodb::bson::ser::Error> for MQueueError {
    fn from(value: mongodb::bson::ser::Error) -> Self {
        MQueueError::SerializationError(value.to_string())
    }
}

impl From<mongodb::bson::de::Error> for MQueueError {
    fn from(value: mongodb::bson::de::Error) -> Self {
        MQueueError::SerializationError(value.to_string())
    }
}

impl From<serde_json::Error> for MQueueError {
    fn from(value: serde_json::Error) -> Self {
        MQueueError::SerializationError(value.to_string())
    }
}

impl MQueueError {
    /// validation errors are caller mistakes and are never recorded against a task
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            MQueueError::InvalidPriority(_)
                | MQueueError::InvalidTaskId(_)
                | MQueueError::InvalidStatus(_)
                | MQueueError::MissingField(_)
                | MQueueError::UnknownTaskType(_)
                | MQueueError::SerializationError(_)
        )
    }
}

#[cfg(test)]
mod test {
    use super::MQueueError;

    #[test]
    fn test_execution_error_message() {
        let error = MQueueError::ExecutionError("emit error now".into());
        assert_eq!(error.to_string(), "emit error now");
        assert!(!error.is_validation());
        assert!(MQueueError::InvalidPriority(f64::NAN).is_validation());
    }
}
