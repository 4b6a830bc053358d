//! Keyed deduplication of concurrent work.
//!
//! For any key, at most one execution is in flight; callers that arrive while
//! it runs attach to the same result. The work runs on a detached task, so a
//! caller dropping its request future never cancels work other waiters are
//! attached to.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

pub struct SingleFlight<V> {
    inflight: Arc<Mutex<HashMap<String, watch::Receiver<Option<V>>>>>,
}

impl<V> Default for SingleFlight<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> SingleFlight<V> {
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<V> SingleFlight<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Runs `work` for `key`, or waits for the execution already in flight.
    ///
    /// Returns `None` only if the in-flight task died without producing a
    /// value (it panicked); the key is cleared so a later call starts fresh.
    pub async fn run<F>(&self, key: &str, work: F) -> Option<V>
    where
        F: Future<Output = V> + Send + 'static,
    {
        let mut rx = {
            let mut inflight = self
                .inflight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match inflight.get(key) {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(key.to_string(), rx.clone());

                    let map = Arc::clone(&self.inflight);
                    let key = key.to_string();
                    tokio::spawn(async move {
                        let value = work.await;
                        let _ = tx.send(Some(value));
                        map.lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .remove(&key);
                    });
                    rx
                }
            }
        };

        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return Some(value);
            }
            if rx.changed().await.is_err() {
                // The leader vanished without sending; clear the stale entry.
                let mut inflight = self
                    .inflight
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if let Some(entry) = inflight.get(key) {
                    if entry.borrow().is_none() {
                        inflight.remove(key);
                    }
                }
                return rx.borrow().clone();
            }
        }
    }
}
