use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::StreamExt;
use mongodb::bson::{Bson, Document};
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::change_stream::ChangeStream;
use mongodb::options::FullDocumentType;
use mongodb::Collection;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::tasker::completion::CompletionRegistry;
use crate::tasker::error::MResult;
use crate::tasker::task::TaskStatus;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A durable status transition seen on the change stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub id: String,
    pub status: TaskStatus,
    // payload with `id` copied in, when the event carried one
    pub payload: Option<Document>,
}

/// Invoked on the monitor task for every status change, must not block.
pub trait StatusChangeListener: Send + Sync {
    fn task_status_changed(&self, change: &StatusChange);
}

/// Turns change stream events of the queue collection into status changes
/// and fans them out to listeners and the completion registry.
pub struct StatusChangeMonitor {
    // append only while running
    listeners: RwLock<Vec<Arc<dyn StatusChangeListener>>>,
    completions: Arc<CompletionRegistry>,
    cancel: CancellationToken,
}

impl StatusChangeMonitor {
    pub fn new(completions: Arc<CompletionRegistry>) -> Arc<StatusChangeMonitor> {
        Arc::new(StatusChangeMonitor {
            listeners: RwLock::new(vec![]),
            completions,
            cancel: CancellationToken::new(),
        })
    }

    /// Subscribe before returning, so nothing written after start() is missed.
    pub async fn start(self: &Arc<Self>, collection: Collection<Document>) -> MResult<JoinHandle<()>> {
        let stream = open_stream(&collection, None).await?;
        info!("status monitor watching {}", collection.name());
        let monitor = self.clone();
        Ok(tokio::spawn(async move { monitor.run(collection, stream).await }))
    }

    pub fn add_listener(&self, listener: Arc<dyn StatusChangeListener>) {
        self.listeners.write().unwrap_or_else(|e| e.into_inner()).push(listener);
    }

    pub fn completions(&self) -> &Arc<CompletionRegistry> {
        &self.completions
    }

    pub fn dispatch(&self, change: &StatusChange) {
        {
            let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            for listener in listeners.iter() {
                listener.task_status_changed(change);
            }
        }
        self.completions.on_status_change(change);
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        self.completions.clear();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn run(self: Arc<Self>, collection: Collection<Document>, mut stream: ChangeStream<ChangeStreamEvent<Document>>) {
        let mut resume_token = stream.resume_token();
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    if let Some(change) = translate_event(&event) {
                        self.dispatch(&change);
                    }
                    resume_token = stream.resume_token();
                    continue;
                }
                Some(Err(e)) => warn!("change stream failed {:?}", &e),
                None => warn!("change stream closed"),
            }
            match self.reconnect(&collection, &mut resume_token).await {
                Some(reopened) => stream = reopened,
                None => break,
            }
        }
        debug!("status monitor stopped");
    }

    /// None when cancelled while reconnecting
    async fn reconnect(&self, collection: &Collection<Document>, resume_token: &mut Option<ResumeToken>) -> Option<ChangeStream<ChangeStreamEvent<Document>>> {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(backoff) => {}
            }
            match open_stream(collection, resume_token.clone()).await {
                Ok(stream) => {
                    info!("change stream resubscribed");
                    return Some(stream);
                }
                Err(e) => {
                    warn!("failed to resubscribe change stream {:?}", &e);
                    // a stale token fails forever, start from now instead
                    *resume_token = None;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}

async fn open_stream(collection: &Collection<Document>, resume_token: Option<ResumeToken>) -> MResult<ChangeStream<ChangeStreamEvent<Document>>> {
    let watch = collection.watch().full_document(FullDocumentType::UpdateLookup);
    let stream = match resume_token {
        Some(token) => watch.resume_after(token).await?,
        None => watch.await?,
    };
    Ok(stream)
}

fn translate_event(event: &ChangeStreamEvent<Document>) -> Option<StatusChange> {
    translate(
        &event.operation_type,
        event.document_key.as_ref(),
        event.update_description.as_ref().map(|description| &description.updated_fields),
        event.full_document.as_ref(),
    )
}

/// Inserts always carry a status, updates only when the status changed.
pub(crate) fn translate(operation: &OperationType, document_key: Option<&Document>, updated_fields: Option<&Document>, full_document: Option<&Document>) -> Option<StatusChange> {
    let id = document_key?.get_object_id("_id").ok()?.to_hex();
    let (status, payload) = match operation {
        OperationType::Insert | OperationType::Replace => {
            let document = full_document?;
            (document.get_str("status").ok()?, document.get_document("payload").ok())
        }
        OperationType::Update => {
            let fields = updated_fields?;
            let payload = fields.get_document("payload").ok()
                .or_else(|| full_document.and_then(|document| document.get_document("payload").ok()));
            (fields.get_str("status").ok()?, payload)
        }
        _ => return None,
    };
    let status = match TaskStatus::from_str(status) {
        Ok(status) => status,
        Err(_) => {
            debug!("ignoring unknown status {} of {}", status, &id);
            return None;
        }
    };
    let payload = payload.map(|payload| {
        let mut payload = payload.clone();
        payload.insert("id", Bson::String(id.clone()));
        payload
    });
    Some(StatusChange { id, status, payload })
}
