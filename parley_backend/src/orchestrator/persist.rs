//! Background writes for one message.
//!
//! Patches go to a single writer task in the order they were queued. Each
//! patch is a full snapshot, so the writer only stores the newest of a burst.
//! SQLite calls run on the blocking pool.

use std::sync::Arc;

use flume::Sender;
use tokio::sync::{mpsc, oneshot};

use crate::collaborators::ConversationStore;
use crate::conversation::MessagePatch;
use crate::events::ChatEvent;

enum PersistJob {
    Write(MessagePatch),
    Barrier(oneshot::Sender<()>),
}

pub struct PersistQueue {
    message_id: String,
    store: Arc<dyn ConversationStore>,
    events: Sender<ChatEvent>,
    tx: Option<mpsc::UnboundedSender<PersistJob>>,
}

impl PersistQueue {
    pub fn new(
        message_id: impl Into<String>,
        store: Arc<dyn ConversationStore>,
        events: Sender<ChatEvent>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            store,
            events,
            tx: None,
        }
    }

    pub fn write(&mut self, patch: MessagePatch) {
        self.send(PersistJob::Write(patch));
    }

    /// Resolves once every write queued before this call has reached the store.
    pub fn settled(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.send(PersistJob::Barrier(tx));
        rx
    }

    fn send(&mut self, job: PersistJob) {
        let tx = self.tx.get_or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_writer(
                self.message_id.clone(),
                self.store.clone(),
                self.events.clone(),
                rx,
            ));
            tx
        });
        if tx.send(job).is_err() {
            tracing::error!("Persistence worker for message {} is gone", self.message_id);
        }
    }
}

async fn run_writer(
    message_id: String,
    store: Arc<dyn ConversationStore>,
    events: Sender<ChatEvent>,
    mut rx: mpsc::UnboundedReceiver<PersistJob>,
) {
    while let Some(job) = rx.recv().await {
        let mut latest = None;
        let mut barriers = Vec::new();
        let mut next = Some(job);
        while let Some(job) = next {
            match job {
                PersistJob::Write(patch) => latest = Some(patch),
                PersistJob::Barrier(done) => barriers.push(done),
            }
            next = rx.try_recv().ok();
        }

        if let Some(patch) = latest {
            write_patch(&message_id, &store, &events, patch).await;
        }
        for done in barriers {
            let _ = done.send(());
        }
    }
}

async fn write_patch(
    message_id: &str,
    store: &Arc<dyn ConversationStore>,
    events: &Sender<ChatEvent>,
    patch: MessagePatch,
) {
    let store = store.clone();
    let id = message_id.to_string();
    let result = tokio::task::spawn_blocking(move || store.update_message_in_conversation(&id, &patch))
        .await;

    let error = match result {
        Ok(Ok(())) => return,
        Ok(Err(e)) => format!("{:#}", e),
        Err(e) => format!("write task failed: {}", e),
    };
    tracing::warn!("Failed to persist message {}: {}", message_id, error);
    let _ = events.send(ChatEvent::Error(format!(
        "Could not save message {}: {}",
        message_id, error
    )));
}
