use std::time::Duration;

use flume::Sender;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::events::ChatEvent;

/// Rate limiter for UI snapshots: at most one event per `interval`.
///
/// An event submitted after the window has elapsed goes out immediately.
/// Otherwise it is scheduled for the end of the window, replacing whatever
/// was scheduled before it.
pub struct UpdateThrottle {
    interval: Duration,
    tx: Sender<ChatEvent>,
    last_emit: Option<Instant>,
    pending: Option<JoinHandle<()>>,
}

impl UpdateThrottle {
    pub fn new(interval: Duration, tx: Sender<ChatEvent>) -> Self {
        Self {
            interval,
            tx,
            last_emit: None,
            pending: None,
        }
    }

    pub fn submit(&mut self, event: ChatEvent) {
        let now = Instant::now();

        if let Some(pending) = self.pending.take() {
            if !pending.is_finished() {
                // `last_emit` already holds the deadline of the pending send.
                pending.abort();
                let deadline = self.last_emit.unwrap_or(now);
                self.schedule(deadline, event);
                return;
            }
        }

        match self.last_emit {
            Some(last) if now < last + self.interval => {
                let deadline = last + self.interval;
                self.schedule(deadline, event);
                self.last_emit = Some(deadline);
            }
            _ => {
                self.last_emit = Some(now);
                let _ = self.tx.send(event);
            }
        }
    }

    /// Send `event` now, dropping anything still pending.
    pub fn flush(&mut self, event: ChatEvent) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
        self.last_emit = Some(Instant::now());
        let _ = self.tx.send(event);
    }

    fn schedule(&mut self, deadline: Instant, event: ChatEvent) {
        let tx = self.tx.clone();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx.send(event);
        }));
    }
}

impl Drop for UpdateThrottle {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }
}
