use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use crossbeam_skiplist::SkipMap;

use crate::hasher::shard_of;
use crate::N_SHARDS;

/// In-memory buffer of entries that have been accepted but not yet drained
/// to the index and data files.
///
/// Keys are `cache_id ^ seq`; values are the serialized entry header
/// followed by the raw message bytes. Shards are picked by contract, the
/// same way readers address their lookups. Lock-free maps keep concurrent
/// writers and readers off each other; only the size backoff takes a lock.
pub struct Memtable {
    shards: Vec<SkipMap<u64, Vec<u8>>>,
    size: AtomicU64,
    cap: u64,
    gate: Mutex<()>,
    drained: Condvar,
}

impl Memtable {
    pub fn new(cap: u64) -> Self {
        Self {
            shards: (0..N_SHARDS).map(|_| SkipMap::new()).collect(),
            size: AtomicU64::new(0),
            cap,
            gate: Mutex::new(()),
            drained: Condvar::new(),
        }
    }

    fn shard(&self, contract: u32) -> &SkipMap<u64, Vec<u8>> {
        &self.shards[shard_of(u64::from(contract), N_SHARDS)]
    }

    pub fn put(&self, contract: u32, key: u64, data: Vec<u8>) {
        let len = data.len() as u64;
        let prev = self.shard(contract).get(&key).map(|e| e.value().len() as u64);
        self.shard(contract).insert(key, data);
        if let Some(prev) = prev {
            self.size.fetch_sub(prev, Ordering::AcqRel);
        }
        self.size.fetch_add(len, Ordering::AcqRel);
    }

    pub fn get(&self, contract: u32, key: u64) -> Option<Vec<u8>> {
        self.shard(contract).get(&key).map(|e| e.value().clone())
    }

    /// Releases an entry once it has been made durable (or rolled back).
    pub fn free(&self, contract: u32, key: u64) -> bool {
        let Some(entry) = self.shard(contract).remove(&key) else {
            return false;
        };
        self.size
            .fetch_sub(entry.value().len() as u64, Ordering::AcqRel);
        self.drained.notify_all();
        true
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.is_empty())
    }

    /// Blocks the caller while the memtable sits above its cap. Invoked
    /// before every new tiny batch so writers cannot outrun the sync loop.
    /// The bounded wait re-checks the size even if a notification raced
    /// between the check and the wait.
    pub fn backoff(&self) {
        let mut guard = self.gate.lock().unwrap();
        while self.size() > self.cap {
            let (g, _) = self
                .drained
                .wait_timeout(guard, std::time::Duration::from_millis(10))
                .unwrap();
            guard = g;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_put_get_free() {
        let mem = Memtable::new(1 << 20);
        mem.put(0, 11, vec![1, 2, 3]);
        assert_eq!(mem.get(0, 11), Some(vec![1, 2, 3]));
        assert_eq!(mem.size(), 3);

        assert!(mem.free(0, 11));
        assert!(!mem.free(0, 11));
        assert_eq!(mem.get(0, 11), None);
        assert_eq!(mem.size(), 0);
    }

    #[test]
    fn test_put_replaces_size() {
        let mem = Memtable::new(1 << 20);
        mem.put(0, 5, vec![0u8; 100]);
        mem.put(0, 5, vec![0u8; 40]);
        assert_eq!(mem.size(), 40);
        assert_eq!(mem.len(), 1);
    }

    #[test]
    fn test_contract_shards_are_distinct() {
        let mem = Memtable::new(1 << 20);
        mem.put(1, 7, vec![1]);
        mem.put(2, 7, vec![2]);
        assert_eq!(mem.get(1, 7), Some(vec![1]));
        assert_eq!(mem.get(2, 7), Some(vec![2]));
    }

    #[test]
    fn test_backoff_released_by_free() {
        let mem = Arc::new(Memtable::new(8));
        mem.put(0, 1, vec![0u8; 32]);

        let waiter = {
            let mem = Arc::clone(&mem);
            std::thread::spawn(move || {
                mem.backoff();
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!waiter.is_finished(), "backoff should block above cap");

        mem.free(0, 1);
        waiter.join().expect("backoff thread panicked");
    }
}
