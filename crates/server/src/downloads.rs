//! Coalesced download accounting.
//!
//! Archive hits are counted in memory and flushed to the metadata store in
//! batches, keeping the write amplification of hot packages bounded. Counts
//! are at-least-once and eventually consistent within the flush interval.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::datastore::DataStore;

/// How often pending counts are written out. Stays under the 60 s coalescing
/// ceiling the accounting contract allows.
const FLUSH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Default)]
pub struct DownloadCounter {
    pending: Mutex<HashMap<(String, String), u64>>,
}

impl DownloadCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records one download of `name@version`.
    pub fn record(&self, name: &str, version: &str) {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *pending
            .entry((name.to_string(), version.to_string()))
            .or_insert(0) += 1;
    }

    /// Writes all pending counts to the store.
    pub async fn flush(&self, store: &dyn DataStore) {
        let drained: Vec<(String, String, u64)> = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            pending
                .drain()
                .map(|((name, version), count)| (name, version, count))
                .collect()
        };
        if drained.is_empty() {
            return;
        }
        if let Err(e) = store.increment_download_counts(&drained).await {
            tracing::error!("failed to flush download counts: {e}");
            // Re-queue so the counts survive a transient store error.
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for (name, version, count) in drained {
                *pending.entry((name, version)).or_insert(0) += count;
            }
        }
    }

    /// Spawns the periodic flusher; a final flush runs on cancellation.
    pub fn start_flusher(
        self: &Arc<Self>,
        store: Arc<dyn DataStore>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let counter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => counter.flush(store.as_ref()).await,
                    _ = cancel.cancelled() => {
                        counter.flush(store.as_ref()).await;
                        break;
                    }
                }
            }
        })
    }
}
