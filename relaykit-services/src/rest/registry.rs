use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use rand::Rng;
use relaykit_core::CancelableFuture;
use tracing::debug;

type Entries<T> = Mutex<HashMap<u64, CancelableFuture<T>>>;

/// Outstanding calls, so they can be cancelled together on logout or shutdown.
///
/// Entries remove themselves when their future completes either way.
pub struct ReplyRegistry<T> {
    entries: Arc<Entries<T>>,
}

impl<T> Default for ReplyRegistry<T> {
    fn default() -> Self {
        ReplyRegistry {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T: Send + Sync + 'static> ReplyRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks `future` until it completes. Returns the id it is tracked under.
    pub fn remember(&self, future: &CancelableFuture<T>) -> u64 {
        let id = {
            let mut entries = self.entries.lock();
            let mut rng = rand::thread_rng();
            let mut id: u64 = rng.gen();
            while entries.contains_key(&id) {
                id = rng.gen();
            }
            entries.insert(id, future.clone());
            id
        };

        let entries: Weak<Entries<T>> = Arc::downgrade(&self.entries);
        future.on_result(move |_| {
            if let Some(entries) = entries.upgrade() {
                entries.lock().remove(&id);
            }
        });
        id
    }

    /// Cancels every outstanding call. Returns how many were asked to cancel.
    ///
    /// Cancellation runs outside the registry lock: cancelling completes the future, which
    /// removes it from the registry on the same thread.
    pub fn abort_all(&self) -> usize {
        let snapshot: Vec<CancelableFuture<T>> = self.entries.lock().values().cloned().collect();
        debug!("aborting {} outstanding replies", snapshot.len());
        for future in &snapshot {
            future.cancel();
        }
        snapshot.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
