use std::sync::OnceLock;

use crate::fingerprint::Fingerprint;
use crate::ocr::NameReading;

/// Fingerprints of one file: one entry for a photo, one per sampled frame
/// for a video. Failures are kept so a file is never retried in a batch.
pub type FingerprintEntry = Result<Vec<Fingerprint>, String>;
pub type ReadingEntry = Result<NameReading, String>;

/// Per-batch memo of expensive external-tool results, indexed by
/// `filename_order`.
///
/// Every slot is computed at most once, even when strategies and the
/// naming step ask for it from several workers. Dropped with the batch.
pub struct BatchCache {
    fingerprints: Vec<OnceLock<FingerprintEntry>>,
    readings: Vec<OnceLock<ReadingEntry>>,
}

impl BatchCache {
    pub fn new(len: usize) -> Self {
        Self {
            fingerprints: (0..len).map(|_| OnceLock::new()).collect(),
            readings: (0..len).map(|_| OnceLock::new()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }

    /// Cached fingerprints of file `index`, computing them on first use.
    /// `None` for an index outside the batch.
    pub fn fingerprints<F>(&self, index: usize, compute: F) -> Option<&FingerprintEntry>
    where
        F: FnOnce() -> FingerprintEntry,
    {
        self.fingerprints.get(index).map(|slot| slot.get_or_init(compute))
    }

    pub fn cached_fingerprints(&self, index: usize) -> Option<&FingerprintEntry> {
        self.fingerprints.get(index)?.get()
    }

    pub fn reading<F>(&self, index: usize, compute: F) -> Option<&ReadingEntry>
    where
        F: FnOnce() -> ReadingEntry,
    {
        self.readings.get(index).map(|slot| slot.get_or_init(compute))
    }

    pub fn cached_reading(&self, index: usize) -> Option<&ReadingEntry> {
        self.readings.get(index)?.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_computes_each_slot_once() {
        let cache = BatchCache::new(2);
        let calls = AtomicUsize::new(0);
        let compute = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("unreadable".to_string())
        };

        assert!(cache.cached_fingerprints(0).is_none());
        cache.fingerprints(0, compute);
        cache.fingerprints(0, compute);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(cache.cached_fingerprints(0), Some(Err(_))));
        assert!(cache.cached_fingerprints(1).is_none());
    }

    #[test]
    fn test_out_of_range_index() {
        let cache = BatchCache::new(1);
        assert!(cache.fingerprints(3, || Ok(vec![])).is_none());
        assert!(cache.reading(3, || Err(String::new())).is_none());
        assert_eq!(cache.len(), 1);
    }
}
