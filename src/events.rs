//! Completion notifications.
//!
//! Subscribers register with `CompletionEvents`; `publish` calls each of them
//! in registration order. A subscriber that returns an error or panics is
//! logged and skipped, so the upload that triggered the event still succeeds.

use crate::models::chunked_upload::ChunkedUpload;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{Arc, RwLock},
};
use tracing::{info, warn};
use uuid::Uuid;

/// Published once an upload reaches its declared total size.
#[derive(Debug, Clone, Serialize)]
pub struct UploadCompleted {
    pub upload_id: Uuid,
    pub filename: String,
    /// Content file path relative to the storage directory.
    pub file_path: String,
    pub size_bytes: i64,
    pub completed_on: DateTime<Utc>,
}

impl From<&ChunkedUpload> for UploadCompleted {
    fn from(upload: &ChunkedUpload) -> Self {
        Self {
            upload_id: upload.upload_id,
            filename: upload.filename.clone(),
            file_path: upload.file_path.clone(),
            size_bytes: upload.offset,
            completed_on: upload.completed_on.unwrap_or_else(Utc::now),
        }
    }
}

/// Receives completion events, e.g. to move the finished file elsewhere.
pub trait CompletionSubscriber: Send + Sync {
    fn on_complete(&self, event: &UploadCompleted) -> anyhow::Result<()>;
}

impl<F> CompletionSubscriber for F
where
    F: Fn(&UploadCompleted) -> anyhow::Result<()> + Send + Sync,
{
    fn on_complete(&self, event: &UploadCompleted) -> anyhow::Result<()> {
        self(event)
    }
}

/// Outcome of one `publish` call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Registry of completion subscribers, cheap to clone and share.
#[derive(Clone, Default)]
pub struct CompletionEvents {
    subscribers: Arc<RwLock<Vec<Arc<dyn CompletionSubscriber>>>>,
}

impl CompletionEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn CompletionSubscriber>) {
        match self.subscribers.write() {
            Ok(mut subs) => subs.push(subscriber),
            Err(poisoned) => poisoned.into_inner().push(subscriber),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        match self.subscribers.read() {
            Ok(subs) => subs.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Deliver `event` to every subscriber. Never fails.
    pub fn publish(&self, event: &UploadCompleted) -> DeliveryReport {
        // Snapshot so subscribers may register others without deadlocking.
        let subscribers: Vec<_> = match self.subscribers.read() {
            Ok(subs) => subs.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        let mut report = DeliveryReport::default();
        for subscriber in subscribers {
            match panic::catch_unwind(AssertUnwindSafe(|| subscriber.on_complete(event))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(err)) => {
                    report.failed += 1;
                    warn!(
                        "completion subscriber failed for upload {}: {:#}",
                        event.upload_id, err
                    );
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(
                        "completion subscriber panicked for upload {}",
                        event.upload_id
                    );
                }
            }
        }
        report
    }
}

/// Subscriber that records completions in the service log.
pub struct LogCompletions;

impl CompletionSubscriber for LogCompletions {
    fn on_complete(&self, event: &UploadCompleted) -> anyhow::Result<()> {
        info!(
            "upload {} complete: {} ({} bytes) at {}",
            event.upload_id, event.filename, event.size_bytes, event.file_path
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_event() -> UploadCompleted {
        UploadCompleted {
            upload_id: Uuid::new_v4(),
            filename: "simplefile.txt".into(),
            file_path: "00/11/file.part".into(),
            size_bytes: 9,
            completed_on: Utc::now(),
        }
    }

    #[test]
    fn publish_reaches_every_subscriber() {
        let events = CompletionEvents::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = calls.clone();
            events.subscribe(Arc::new(move |_: &UploadCompleted| -> anyhow::Result<()> {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }

        let report = events.publish(&sample_event());

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            report,
            DeliveryReport {
                delivered: 3,
                failed: 0
            }
        );
    }

    #[test]
    fn failing_subscriber_does_not_stop_delivery() {
        let events = CompletionEvents::new();
        let calls = Arc::new(AtomicUsize::new(0));

        events.subscribe(Arc::new(|_: &UploadCompleted| -> anyhow::Result<()> {
            Err(anyhow::anyhow!("downstream unavailable"))
        }));
        events.subscribe(Arc::new(|_: &UploadCompleted| -> anyhow::Result<()> {
            panic!("subscriber bug")
        }));
        let counter = calls.clone();
        events.subscribe(Arc::new(move |_: &UploadCompleted| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let report = events.publish(&sample_event());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.failed, 2);
        assert_eq!(report.delivered, 1);
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let events = CompletionEvents::new();
        assert_eq!(events.publish(&sample_event()), DeliveryReport::default());
        assert_eq!(events.subscriber_count(), 0);
    }
}
