//! Approximate access frequency tracking
//!
//! A table of 16-bit saturating counters indexed by the low bits of an
//! access bucket. Collisions make unrelated keys share a counter; the counts
//! only bias eviction order, so that is acceptable.
//!
//! The table starts out sparse and is swapped for a dense array the first time
//! the number of tracked buckets crosses a threshold. Counts are identical in
//! both representations.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use tracing::debug;

enum CounterTable {
    Sparse(Mutex<HashMap<u32, u16>>),
    Dense(Box<[AtomicU16]>),
}

pub struct FrequencyCounter {
    table: RwLock<CounterTable>,
    mask: u64,
    sparse_threshold: usize,
}

impl FrequencyCounter {
    /// `bits` is the table width; `sparse_threshold` the number of tracked
    /// buckets the sparse map may hold before upgrading
    pub fn new(bits: u32, sparse_threshold: usize) -> Self {
        let bits = bits.clamp(1, 30);
        Self {
            table: RwLock::new(CounterTable::Sparse(Mutex::new(HashMap::new()))),
            mask: (1u64 << bits) - 1,
            sparse_threshold,
        }
    }

    fn slot(&self, bucket: u64) -> u32 {
        (bucket & self.mask) as u32
    }

    pub fn increment(&self, bucket: u64) {
        let slot = self.slot(bucket);
        let needs_upgrade = {
            let table = self.table.read();
            match &*table {
                CounterTable::Dense(counters) => {
                    // Racing increments may be lost; never wraps
                    let _ = counters[slot as usize].fetch_update(
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                        |v| v.checked_add(1),
                    );
                    false
                }
                CounterTable::Sparse(map) => {
                    let mut map = map.lock();
                    let count = map.entry(slot).or_insert(0);
                    *count = count.saturating_add(1);
                    map.len() > self.sparse_threshold
                }
            }
        };

        if needs_upgrade {
            self.upgrade_to_dense();
        }
    }

    pub fn get(&self, bucket: u64) -> u16 {
        let slot = self.slot(bucket);
        let table = self.table.read();
        match &*table {
            CounterTable::Dense(counters) => counters[slot as usize].load(Ordering::Relaxed),
            CounterTable::Sparse(map) => map.lock().get(&slot).copied().unwrap_or(0),
        }
    }

    pub fn is_dense(&self) -> bool {
        matches!(&*self.table.read(), CounterTable::Dense(_))
    }

    fn upgrade_to_dense(&self) {
        let mut table = self.table.write();
        // Another caller may have won the race to upgrade
        let dense = match &*table {
            CounterTable::Dense(_) => return,
            CounterTable::Sparse(map) => {
                let map = map.lock();
                let counters: Box<[AtomicU16]> =
                    (0..=self.mask).map(|_| AtomicU16::new(0)).collect();
                for (&slot, &count) in map.iter() {
                    counters[slot as usize].store(count, Ordering::Relaxed);
                }
                debug!(
                    tracked = map.len(),
                    slots = counters.len(),
                    "Switched access counter to dense table"
                );
                counters
            }
        };
        *table = CounterTable::Dense(dense);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_unknown_bucket_is_zero() {
        let counter = FrequencyCounter::new(8, 16);
        assert_eq!(counter.get(42), 0);
    }

    #[test]
    fn test_increment_and_get() {
        let counter = FrequencyCounter::new(8, 16);
        counter.increment(7);
        counter.increment(7);
        counter.increment(9);
        assert_eq!(counter.get(7), 2);
        assert_eq!(counter.get(9), 1);
    }

    #[test]
    fn test_buckets_are_masked() {
        let counter = FrequencyCounter::new(4, 100);
        counter.increment(3);
        counter.increment(3 + 16);
        // Same low four bits share a counter
        assert_eq!(counter.get(3), 2);
        assert_eq!(counter.get(3 + 32), 2);
    }

    #[test]
    fn test_saturates_at_u16_max() {
        let counter = FrequencyCounter::new(4, 100);
        for _ in 0..(u16::MAX as u32 + 10) {
            counter.increment(1);
        }
        assert_eq!(counter.get(1), u16::MAX);
    }

    #[test]
    fn test_dense_saturates_at_u16_max() {
        let counter = FrequencyCounter::new(4, 0);
        counter.increment(2);
        assert!(counter.is_dense());
        for _ in 0..(u16::MAX as u32 + 10) {
            counter.increment(1);
        }
        assert_eq!(counter.get(1), u16::MAX);
    }

    #[test]
    fn test_upgrade_preserves_counts() {
        let counter = FrequencyCounter::new(10, 3);
        for bucket in 0..3u64 {
            for _ in 0..=bucket {
                counter.increment(bucket);
            }
        }
        assert!(!counter.is_dense());

        // A fourth distinct bucket crosses the threshold
        counter.increment(500);
        assert!(counter.is_dense());

        assert_eq!(counter.get(0), 1);
        assert_eq!(counter.get(1), 2);
        assert_eq!(counter.get(2), 3);
        assert_eq!(counter.get(500), 1);
        assert_eq!(counter.get(501), 0);
    }

    #[test]
    fn test_concurrent_increments_across_upgrade() {
        let counter = Arc::new(FrequencyCounter::new(12, 64));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for i in 0..500u64 {
                        counter.increment(t * 1000 + i % 100);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(counter.is_dense());
        // Lost updates are tolerated, but every touched bucket was counted
        for t in 0..8u64 {
            assert!(counter.get(t * 1000) >= 1);
        }
    }
}
