use std::time::Duration;

/// Configuration for an EmberDB instance.
///
/// Options are applied with chained setters over `Options::default()`:
///
/// ```ignore
/// let opts = Options::default()
///     .mutable()
///     .tiny_batch_write_interval(Duration::from_millis(5))
///     .background_key_expiry(true);
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    /// Reject updates through caller-supplied message ids (default: true).
    pub immutable: bool,

    /// Apply the payload transform pair to values (default: false).
    pub encryption: bool,

    /// Run the background expirer for TTL'd entries (default: false).
    pub background_key_expiry: bool,

    /// Interval between background sync passes (default: 1s).
    pub max_sync_duration: Duration,

    /// Interval between tiny batch flushes to the commit pool (default: 15ms).
    pub tiny_batch_write_interval: Duration,

    /// Query limit applied when the caller does not set one (default: 1000).
    pub default_query_limit: usize,

    /// Hard cap on any query limit (default: 100_000).
    pub max_query_limit: usize,

    /// Size threshold of buffered sync data before a partial flush (default: 1GiB).
    pub buffer_size: u64,

    /// Memtable size cap; writers back off above it (default: 2GiB).
    pub memdb_size: u64,

    /// WAL size to reach before its space is reclaimed (default: 2GiB).
    pub log_size: u64,

    /// Total free-region bytes required before holes are reused (default: 128MiB).
    pub minimum_free_blocks_size: u64,

    /// 32-byte key handed to the payload transform when encryption is on.
    pub encryption_key: [u8; 32],
}

impl Default for Options {
    fn default() -> Self {
        Self {
            immutable: true,
            encryption: false,
            background_key_expiry: false,
            max_sync_duration: Duration::from_secs(1),
            tiny_batch_write_interval: Duration::from_millis(15),
            default_query_limit: 1000,
            max_query_limit: 100_000,
            buffer_size: 1 << 30,
            memdb_size: 1 << 31,
            log_size: 1 << 31,
            minimum_free_blocks_size: 1 << 27,
            encryption_key: *b"4BWm1vZletvrCDGWsF6mex8oBSd59m6I",
        }
    }
}

impl Options {
    /// Allow updates through caller-supplied message ids.
    pub fn mutable(mut self) -> Self {
        self.immutable = false;
        self
    }

    /// Enable the payload transform pair.
    pub fn encryption(mut self, enabled: bool) -> Self {
        self.encryption = enabled;
        self
    }

    /// Enable the background expirer.
    pub fn background_key_expiry(mut self, enabled: bool) -> Self {
        self.background_key_expiry = enabled;
        self
    }

    /// Set the background sync interval.
    pub fn max_sync_duration(mut self, interval: Duration) -> Self {
        self.max_sync_duration = interval;
        self
    }

    /// Set the tiny batch flush interval.
    pub fn tiny_batch_write_interval(mut self, interval: Duration) -> Self {
        self.tiny_batch_write_interval = interval;
        self
    }

    /// Set the default query limit.
    pub fn default_query_limit(mut self, limit: usize) -> Self {
        self.default_query_limit = limit;
        self
    }

    /// Set the maximum query limit.
    pub fn max_query_limit(mut self, limit: usize) -> Self {
        self.max_query_limit = limit;
        self
    }

    /// Set the sync buffer flush threshold.
    pub fn buffer_size(mut self, size: u64) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the memtable size cap.
    pub fn memdb_size(mut self, size: u64) -> Self {
        self.memdb_size = size;
        self
    }

    /// Set the WAL reuse threshold.
    pub fn log_size(mut self, size: u64) -> Self {
        self.log_size = size;
        self
    }

    /// Set the minimum pooled free-region size before reuse.
    pub fn minimum_free_blocks_size(mut self, size: u64) -> Self {
        self.minimum_free_blocks_size = size;
        self
    }

    /// Set the payload transform key.
    pub fn encryption_key(mut self, key: [u8; 32]) -> Self {
        self.encryption_key = key;
        self
    }
}

/// Options for a managed batch.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Contract stamped on every entry in the batch (default: master).
    pub contract: u32,

    /// Flush partially filled batches on this cadence while the batch
    /// function runs. Zero disables partial flushes (default: 0).
    pub write_interval: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            contract: crate::entry::MASTER_CONTRACT,
            write_interval: Duration::ZERO,
        }
    }
}

impl BatchOptions {
    /// Set the contract for all entries in the batch.
    pub fn contract(mut self, contract: u32) -> Self {
        self.contract = contract;
        self
    }

    /// Set the partial flush cadence.
    pub fn write_interval(mut self, interval: Duration) -> Self {
        self.write_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = Options::default();
        assert!(opts.immutable);
        assert!(!opts.encryption);
        assert_eq!(opts.max_sync_duration, Duration::from_secs(1));
        assert_eq!(opts.tiny_batch_write_interval, Duration::from_millis(15));
        assert_eq!(opts.default_query_limit, 1000);
        assert_eq!(opts.max_query_limit, 100_000);
        assert_eq!(opts.minimum_free_blocks_size, 1 << 27);
    }

    #[test]
    fn test_options_builder() {
        let opts = Options::default()
            .mutable()
            .memdb_size(1 << 20)
            .max_sync_duration(Duration::from_millis(250))
            .background_key_expiry(true);

        assert!(!opts.immutable);
        assert!(opts.background_key_expiry);
        assert_eq!(opts.memdb_size, 1 << 20);
        assert_eq!(opts.max_sync_duration, Duration::from_millis(250));
    }
}
