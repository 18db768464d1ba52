use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// SHA-256 hex digest of raw document bytes.
pub fn content_digest(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Serializes ingestion of identical content.
///
/// The lookup against the metadata store and the subsequent write happen while the digest lock
/// is held, so two racing ingests of the same bytes produce one document and one duplicate.
#[derive(Default)]
pub struct Deduplicator {
    in_flight: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held while a digest is being checked and recorded. Releases the lock on drop.
pub struct DigestGuard<'a> {
    owner: &'a Deduplicator,
    digest: String,
    _guard: OwnedMutexGuard<()>,
}

impl Deduplicator {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `digest`.
    pub async fn lock(&self, digest: &str) -> DigestGuard<'_> {
        let slot = {
            let mut table = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(table.entry(digest.to_string()).or_default())
        };
        let guard = slot.lock_owned().await;
        DigestGuard {
            owner: self,
            digest: digest.to_string(),
            _guard: guard,
        }
    }

    #[cfg(test)]
    fn in_flight_len(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for DigestGuard<'_> {
    fn drop(&mut self) {
        let mut table = self
            .owner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // One reference is the table's, the other is held by this guard.
        let idle = table
            .get(&self.digest)
            .is_some_and(|slot| Arc::strong_count(slot) <= 2);
        if idle {
            table.remove(&self.digest);
        }
    }
}
