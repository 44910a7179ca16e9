//! Blocking snapshot streams over a registry entry.
//!
//! A stream is a subscription whose listener forwards each new snapshot into
//! a bounded crossbeam channel, so a consumer thread can follow one entity
//! without registering a callback of its own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TryRecvError, TrySendError};
use tracing::warn;

use crate::error::{StoreError, StoreResult};
use crate::registry::{Registry, SubscriberId, Subscription};
use crate::snapshot::Snapshot;

/// A stream of snapshots for one identifier.
///
/// The current snapshot is delivered first, then one snapshot per change.
/// Snapshots that do not fit in the buffer are dropped and counted.
/// Dropping the stream unsubscribes it.
#[derive(Debug)]
pub struct SnapshotStream {
    rx: Receiver<Arc<Snapshot>>,
    dropped: Arc<AtomicU64>,
    subscription: Subscription,
}

impl SnapshotStream {
    pub(crate) fn open(registry: &Arc<Registry>, id: &str, capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        let seed = tx.clone();
        let dropped = Arc::new(AtomicU64::new(0));

        let weak = Arc::downgrade(registry);
        let owned_id = id.to_string();
        let counter = Arc::clone(&dropped);
        let subscription = registry.subscribe(
            id,
            Arc::new(move || {
                let snapshot = weak
                    .upgrade()
                    .map_or_else(Snapshot::default_shared, |r| r.snapshot(&owned_id));
                match tx.try_send(snapshot) {
                    Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                    Err(TrySendError::Full(_)) => {
                        let total = counter.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(id = %owned_id, dropped = total, "snapshot stream full, dropping snapshot");
                    }
                }
            }),
        );

        // Read after subscribing so a racing change is never missed.
        let _ = seed.try_send(registry.snapshot(id));

        Self {
            rx,
            dropped,
            subscription,
        }
    }

    /// The subscriber id backing this stream.
    #[must_use]
    pub const fn subscriber_id(&self) -> SubscriberId {
        self.subscription.subscriber_id()
    }

    /// Snapshots dropped because the buffer was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stops delivery. Buffered snapshots can still be received. Idempotent.
    pub fn unsubscribe(&self) {
        self.subscription.unsubscribe();
    }

    /// Receive the next snapshot (blocking).
    pub fn recv(&self) -> StoreResult<Arc<Snapshot>> {
        self.rx.recv().map_err(|_| disconnected())
    }

    /// Receive the next snapshot with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> StoreResult<Arc<Snapshot>> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => StoreError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
            RecvTimeoutError::Disconnected => disconnected(),
        })
    }

    /// Receive a buffered snapshot without blocking.
    pub fn try_recv(&self) -> StoreResult<Option<Arc<Snapshot>>> {
        match self.rx.try_recv() {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(disconnected()),
        }
    }
}

fn disconnected() -> StoreError {
    StoreError::Disconnected {
        path: "snapshot_stream".to_string(),
    }
}
