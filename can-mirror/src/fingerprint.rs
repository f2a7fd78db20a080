//! Echo suppression
//!
//! Every file write made by the receive path leaves a fingerprint (path and
//! content signature) with a short expiry. The watch path consumes one
//! fingerprint per notification on that path and drops the notification
//! instead of sending it back onto the bus.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// SHA-256 digest of a file's content
pub type ContentSignature = [u8; 32];

/// Compute the signature of file content
pub fn signature(content: &[u8]) -> ContentSignature {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(content));
    out
}

#[derive(Debug, Clone)]
struct Fingerprint {
    signature: ContentSignature,
    expires_at: Instant,
}

/// Pending fingerprints, keyed by file path
#[derive(Debug)]
pub struct FingerprintTable {
    grace: Duration,
    entries: Mutex<HashMap<PathBuf, VecDeque<Fingerprint>>>,
}

impl FingerprintTable {
    /// Create a table whose entries expire after `grace`
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a write about to land on `path`
    pub fn register(&self, path: &Path, signature: ContentSignature) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Self::purge_locked(&mut entries, now);
        entries
            .entry(path.to_path_buf())
            .or_default()
            .push_back(Fingerprint {
                signature,
                expires_at: now + self.grace,
            });
    }

    /// Take back a fingerprint whose write never happened
    pub fn withdraw(&self, path: &Path, signature: &ContentSignature) {
        let mut entries = self.entries.lock();
        if let Some(queue) = entries.get_mut(path) {
            if let Some(index) = queue.iter().rposition(|f| &f.signature == signature) {
                queue.remove(index);
            }
            if queue.is_empty() {
                entries.remove(path);
            }
        }
    }

    /// Decide whether a notification on `path` is an echo of our own write
    ///
    /// Each receive-path write produces exactly one notification on its path,
    /// so any unexpired fingerprint of the path marks the notification as an
    /// echo, and the oldest fingerprint is consumed. The content may already
    /// differ when a user saved over the write before its notification was
    /// drained; that save has a notification of its own.
    pub fn consume_echo(&self, path: &Path, current: &ContentSignature) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let Some(queue) = entries.get_mut(path) else {
            return false;
        };

        queue.retain(|f| f.expires_at > now);
        let matched = queue.iter().any(|f| &f.signature == current);
        let is_echo = queue.pop_front().is_some();
        if is_echo && !matched {
            log::debug!("{:?} was edited before its last write was reported", path);
        }
        if queue.is_empty() {
            entries.remove(path);
        }
        is_echo
    }

    /// Drop every expired fingerprint
    pub fn purge_expired(&self) {
        Self::purge_locked(&mut self.entries.lock(), Instant::now());
    }

    /// Number of unexpired fingerprints
    pub fn pending(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .flat_map(|queue| queue.iter())
            .filter(|f| f.expires_at > now)
            .count()
    }

    fn purge_locked(entries: &mut HashMap<PathBuf, VecDeque<Fingerprint>>, now: Instant) {
        entries.retain(|_, queue| {
            queue.retain(|f| f.expires_at > now);
            !queue.is_empty()
        });
    }
}
