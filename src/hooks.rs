//! Downstream notification for new and changed canonical records.
//!
//! The upsert engine publishes a [`RecordEvent`] through a [`RecordHook`]
//! after a batch commits. [`ChannelHook`] is the default: a bounded queue
//! drained by a background task that hands events to a [`HookSink`]. The
//! ingestion path never waits on the sink; when the queue is full the event
//! is dropped and logged.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::models::{RecordVariant, SourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    New,
    Changed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordEvent {
    pub org_id: String,
    pub variant: RecordVariant,
    pub natural_key: String,
    pub source_kind: SourceKind,
    pub change: ChangeKind,
}

/// Receives one call per new or changed record. Must not block.
pub trait RecordHook: Send + Sync {
    fn publish(&self, event: RecordEvent);
}

/// Hook that discards every event.
pub struct NoopHook;

impl RecordHook for NoopHook {
    fn publish(&self, _event: RecordEvent) {}
}

/// Final consumer of hook events.
#[async_trait]
pub trait HookSink: Send + Sync {
    async fn deliver(&self, event: &RecordEvent) -> Result<(), FetchError>;
}

/// Logs each event at `info`.
pub struct LogSink;

#[async_trait]
impl HookSink for LogSink {
    async fn deliver(&self, event: &RecordEvent) -> Result<(), FetchError> {
        info!(
            org_id = %event.org_id,
            variant = %event.variant,
            natural_key = %event.natural_key,
            source_kind = %event.source_kind,
            change = ?event.change,
            "record event"
        );
        Ok(())
    }
}

/// POSTs each event as JSON to a fixed URL.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl HookSink for WebhookSink {
    async fn deliver(&self, event: &RecordEvent) -> Result<(), FetchError> {
        let response = self.client.post(&self.url).json(event).send().await?;
        crate::fetch::classify_status(response.status(), response.headers())
    }
}

/// Bounded, non-blocking hook backed by a background delivery task.
pub struct ChannelHook {
    tx: mpsc::Sender<RecordEvent>,
}

impl ChannelHook {
    /// Start the delivery task. It exits once every `ChannelHook` clone is
    /// dropped and the queue has drained.
    pub fn spawn(sink: Arc<dyn HookSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<RecordEvent>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = sink.deliver(&event).await {
                    warn!(natural_key = %event.natural_key, error = %e, "hook delivery failed");
                }
            }
            debug!("hook channel closed");
        });
        (Self { tx }, handle)
    }
}

impl RecordHook for ChannelHook {
    fn publish(&self, event: RecordEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let event = match e {
                mpsc::error::TrySendError::Full(ev) | mpsc::error::TrySendError::Closed(ev) => ev,
            };
            warn!(
                natural_key = %event.natural_key,
                variant = %event.variant,
                "hook queue unavailable; event dropped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<RecordEvent>>);

    #[async_trait]
    impl HookSink for Collect {
        async fn deliver(&self, event: &RecordEvent) -> Result<(), FetchError> {
            self.0.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn event(key: &str) -> RecordEvent {
        RecordEvent {
            org_id: "org".into(),
            variant: RecordVariant::Advisory,
            natural_key: key.into(),
            source_kind: SourceKind::Rss,
            change: ChangeKind::New,
        }
    }

    #[tokio::test]
    async fn test_channel_hook_delivers_in_order() {
        let sink = Arc::new(Collect::default());
        let (hook, handle) = ChannelHook::spawn(sink.clone(), 8);
        hook.publish(event("a"));
        hook.publish(event("b"));
        drop(hook);
        handle.await.unwrap();
        let keys: Vec<String> = sink.0.lock().unwrap().iter().map(|e| e.natural_key.clone()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let hook = ChannelHook { tx };
        hook.publish(event("a"));
        // Queue is full and nobody drains it; this must return immediately.
        hook.publish(event("b"));
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(event("x")).unwrap();
        assert_eq!(json["variant"], "advisory");
        assert_eq!(json["source_kind"], "RSS");
        assert_eq!(json["change"], "new");
    }
}
