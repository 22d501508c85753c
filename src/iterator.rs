use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::db::{Core, Query};
use crate::entry::{Id, MASTER_CONTRACT};
use crate::error::{Error, Result};
use crate::timewindow::WinEntry;
use crate::topic::Topic;
use crate::varz::unix_now;

/// One query result.
#[derive(Debug, Clone)]
pub struct Item {
    pub topic: Vec<u8>,
    pub value: Vec<u8>,
}

impl Item {
    pub fn topic(&self) -> &[u8] {
        &self.topic
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

/// Iterator over the entries matching a query, newest window entries
/// first. Entries that turn out to be deleted, expired or foreign to the
/// query's contract are skipped, not errors.
pub struct ItemIterator {
    core: Arc<Core>,
    topic: Vec<u8>,
    contract: u32,
    cutoff: i64,
    limit: usize,
    entries: Vec<WinEntry>,
    next: usize,
    yielded: usize,
    invalid: usize,
}

impl ItemIterator {
    pub(crate) fn new(core: Arc<Core>, query: &Query) -> Result<Self> {
        core.ok()?;
        let topic = Topic::parse(&query.topic)?;
        let contract = if query.contract == 0 {
            MASTER_CONTRACT
        } else {
            query.contract
        };

        let mut limit = if query.limit == 0 {
            topic.limit.unwrap_or(core.opts.default_query_limit)
        } else {
            query.limit
        };
        limit = limit.min(core.opts.max_query_limit);
        let cutoff = topic
            .last
            .map(|last| unix_now() as i64 - last.as_secs() as i64)
            .unwrap_or(0);

        let query_parts = core.query_parts(contract, &topic.parts);
        let entries = {
            let _q = core.query_locks[core.lock_shard(contract)].read()?;
            let pairs = core.trie.lookup(&query_parts);
            let mut entries: Vec<WinEntry> = Vec::new();
            for (topic_hash, off) in pairs {
                if entries.len() >= limit {
                    break;
                }
                entries.extend(
                    core.timewindow
                        .lookup(topic_hash, off, cutoff, limit - entries.len()),
                );
            }
            entries
        };

        Ok(Self {
            core,
            topic: topic.topic,
            contract,
            cutoff,
            limit,
            entries,
            next: 0,
            yielded: 0,
            invalid: 0,
        })
    }

    /// Number of window entries skipped as deleted, expired or foreign.
    pub fn invalid_keys(&self) -> usize {
        self.invalid
    }

    /// Advances to the next readable item; `IterationDone` when the query
    /// is exhausted.
    pub fn next_item(&mut self) -> Result<Item> {
        while self.next < self.entries.len() && self.yielded < self.limit {
            let we = self.entries[self.next];
            self.next += 1;
            match self.read_one(we) {
                Ok(Some(item)) => {
                    self.yielded += 1;
                    return Ok(item);
                }
                Ok(None) => self.invalid += 1,
                Err(e) => return Err(e),
            }
        }
        Err(Error::IterationDone)
    }

    fn read_one(&self, we: WinEntry) -> Result<Option<Item>> {
        if we.seq == 0 {
            return Ok(None);
        }
        if we.is_expired() {
            self.core.timewindow.add_expiry(we);
            return Ok(None);
        }
        // Disk-read window entries carry no contract; the memtable lookup
        // then falls through to the index, which is where they live.
        let contract = if we.contract != 0 { we.contract } else { self.contract };
        let read_slot = match self.core.read_entry(contract, we.seq) {
            Ok(rs) => rs,
            Err(Error::IdDoesNotExist) => return Ok(None),
            Err(e) => return Err(e),
        };

        let (raw_id, mut value) = self.core.read_message(&read_slot)?;
        let id = Id::from_slice(&raw_id)?;
        if !id.eval_prefix(self.contract, self.cutoff) {
            return Ok(None);
        }
        if id.is_encrypted() {
            value = self.core.codec.decode(&value)?;
        }

        self.core.meter.gets.fetch_add(1, Ordering::Relaxed);
        self.core.meter.out_msgs.fetch_add(1, Ordering::Relaxed);
        self.core
            .meter
            .out_bytes
            .fetch_add(value.len() as u64, Ordering::Relaxed);
        Ok(Some(Item {
            topic: self.topic.clone(),
            value,
        }))
    }
}

impl Iterator for ItemIterator {
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_item() {
            Ok(item) => Some(Ok(item)),
            Err(Error::IterationDone) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
