//! Upload progress fan-out.
//!
//! Ingestion publishes one [`ProgressEvent`] per finished item. Events go to
//! every subscriber (the progress WebSocket in practice); each carries its
//! batch id so a listener interested in a single upload can filter. The hub
//! also keeps a snapshot of each batch still in flight.

use dashmap::DashMap;
use protocol::{ActiveUpload, ProgressEvent};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::files::epoch_millis;

/// Default capacity of the broadcast channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Publish/subscribe hub for upload progress.
#[derive(Debug)]
pub struct ProgressHub {
    tx: broadcast::Sender<ProgressEvent>,
    active: DashMap<Uuid, ActiveUpload>,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl ProgressHub {
    /// Create a hub whose subscribers may lag by up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            active: DashMap::new(),
        }
    }

    /// Receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Register a new batch.
    pub fn begin(&self, batch_id: Uuid, user: &str, destination: &str, total: usize) {
        self.active.insert(
            batch_id,
            ActiveUpload {
                batch_id,
                user: user.to_string(),
                destination: destination.to_string(),
                processed: 0,
                total,
                started_at: epoch_millis(std::time::SystemTime::now()),
            },
        );
    }

    /// Publish an event and update the batch snapshot.
    ///
    /// A finished event drops the snapshot. Having no subscribers is normal.
    pub fn publish(&self, event: ProgressEvent) {
        if event.finished {
            self.active.remove(&event.batch_id);
        } else if let Some(mut snapshot) = self.active.get_mut(&event.batch_id) {
            snapshot.processed = event.processed;
        }

        trace!(
            batch_id = %event.batch_id,
            processed = event.processed,
            total = event.total,
            "Upload progress"
        );
        let _ = self.tx.send(event);
    }

    /// Forget a batch without publishing, e.g. when its task died.
    pub fn abandon(&self, batch_id: &Uuid) {
        self.active.remove(batch_id);
    }

    /// Batches still in flight, oldest first.
    pub fn active(&self) -> Vec<ActiveUpload> {
        let mut uploads: Vec<ActiveUpload> =
            self.active.iter().map(|entry| entry.value().clone()).collect();
        uploads.sort_by_key(|u| u.started_at);
        uploads
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
