use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::block::{BlockWriter, Slot, Staged};
use crate::data::DataWriter;
use crate::db::Core;
use crate::entry::{EntryHeader, Id, ENTRY_HEADER_SIZE, ID_SIZE};
use crate::errcorrupt;
use crate::error::{Error, Result};
use crate::scheduler::{BackgroundTask, Scheduler};
use crate::timewindow::WinEntry;
use crate::topic::Topic;
use crate::winwriter::WindowWriter;

/// Cadence of the background expirer.
const EXPIRY_INTERVAL: Duration = Duration::from_secs(3600);

impl Core {
    /// One sync pass: drains the time-window bucket into the window, index
    /// and data files. A failing pass runs recovery; a failing recovery is
    /// the one fatal path in the engine.
    pub(crate) fn sync_pass(&self) -> Result<()> {
        let _guard = self.sync_lock.lock()?;
        match self.sync_inner() {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(error = %e, "sync failed, running recovery");
                match self.recover_locked() {
                    Ok(()) => Ok(()),
                    Err(re) => {
                        panic!("emberdb: recovery after sync failure failed: {re}");
                    }
                }
            }
        }
    }

    fn sync_inner(&self) -> Result<()> {
        let marker = self.writes.load(Ordering::Acquire);
        if self.last_sync_mark.load(Ordering::Acquire) == marker {
            return Ok(());
        }

        let mut winw = WindowWriter::new(&self.timewindow);
        let mut blocw = BlockWriter::new(&self.index, self.n_blocks.load(Ordering::Acquire));
        let mut dataw = DataWriter::new(&self.data);
        // (contract, seq) pairs staged since the last flush; freed from the
        // memtable once their blocks are durable.
        let mut pending: Vec<(u32, u64)> = Vec::new();
        let mut applied: HashSet<u64> = HashSet::new();
        let mut added: u64 = 0;
        let mut in_bytes: u64 = 0;

        self.timewindow.foreach_time_window(true, |last, _time_id, batch| {
            for (&topic_hash, entries) in batch {
                let topic_off = self.trie.get_offset(topic_hash).unwrap_or(0);
                let new_off = winw.append(topic_hash, topic_off, entries)?;
                self.trie.set_offset(topic_hash, new_off);

                for we in entries {
                    if we.seq == 0 {
                        continue;
                    }
                    let Some(memdata) = self.mem.get(we.contract, self.cache_id ^ we.seq) else {
                        return Err(errcorrupt!("memtable missing seq {}", we.seq));
                    };
                    let header = EntryHeader::unmarshal(&memdata)?;
                    let msg_offset = dataw.append(&memdata[ENTRY_HEADER_SIZE..])?;
                    let staged = blocw.append(Slot {
                        seq: we.seq,
                        topic_size: header.topic_size,
                        value_size: header.value_size,
                        msg_offset,
                    })?;
                    match staged {
                        Staged::Fresh => {
                            self.filter.append(we.seq);
                            added += 1;
                            in_bytes += u64::from(header.value_size);
                            if we.expires_at > 0 {
                                self.timewindow.add_expiry(*we);
                            }
                        }
                        Staged::Updated { old_offset, old_size } => {
                            // An overwrite through an explicit id: the slot
                            // now points at the new bytes; the superseded
                            // region is reclaimed once it is on disk.
                            dataw.free_settled(old_offset, old_size);
                            in_bytes += u64::from(header.value_size);
                            if we.expires_at > 0 {
                                self.timewindow.add_expiry(*we);
                            }
                        }
                        Staged::Replayed => {}
                    }
                    pending.push((we.contract, we.seq));
                    applied.insert(we.seq);
                }
            }

            if last || dataw.buffered() > self.opts.buffer_size {
                self.flush_sync(
                    &mut winw,
                    &mut blocw,
                    &mut dataw,
                    &mut pending,
                    &applied,
                    &mut added,
                    &mut in_bytes,
                )?;
            }
            Ok(())
        })?;

        // Groups emptied by pre-sync deletes retire even when nothing was
        // flushed this pass.
        self.signal_applied(&applied)?;
        self.last_sync_mark.store(marker, Ordering::Release);
        Ok(())
    }

    /// Makes one batch of staged writes durable: window, index, data, then
    /// the header, in that order, before the WAL watermark moves and the
    /// memtable lets go of the entries.
    #[allow(clippy::too_many_arguments)]
    fn flush_sync(
        &self,
        winw: &mut WindowWriter,
        blocw: &mut BlockWriter,
        dataw: &mut DataWriter,
        pending: &mut Vec<(u32, u64)>,
        applied: &HashSet<u64>,
        added: &mut u64,
        in_bytes: &mut u64,
    ) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        winw.write()?;
        let n_blocks = blocw.write()?;
        self.n_blocks.fetch_max(n_blocks, Ordering::AcqRel);
        dataw.write()?;
        self.filter.write()?;
        self.timewindow.file().sync()?;
        self.data.sync()?;

        self.count.fetch_add(*added, Ordering::AcqRel);
        self.write_header(false)?;
        self.index.sync()?;

        self.meter.syncs.fetch_add(*added, Ordering::Relaxed);
        self.meter.in_bytes.fetch_add(*in_bytes, Ordering::Relaxed);

        self.signal_applied(applied)?;
        for (contract, seq) in pending.drain(..) {
            self.mem.free(contract, self.cache_id ^ seq);
        }
        *added = 0;
        *in_bytes = 0;
        Ok(())
    }

    /// Retires commit groups whose seqs are all durable (or deleted before
    /// sync) and advances the WAL watermark to the longest applied prefix.
    fn signal_applied(&self, applied: &HashSet<u64>) -> Result<()> {
        let mut log = self.commit_log.lock()?;
        let mut deleted = self.deleted_unsynced.lock()?;
        let mut retired_max = 0u64;
        let mut retired_seqs: Vec<u64> = Vec::new();
        log.retain(|&log_seq, seqs| {
            let done = seqs
                .iter()
                .all(|s| applied.contains(s) || deleted.contains(s));
            if done {
                retired_max = retired_max.max(log_seq);
                retired_seqs.extend(seqs.iter().copied());
            }
            !done
        });
        for seq in retired_seqs {
            deleted.remove(&seq);
        }

        let watermark = match log.keys().next() {
            Some(&min_remaining) => min_remaining.saturating_sub(1),
            None => retired_max,
        };
        if watermark > 0 {
            self.wal.signal_log_applied(watermark)?;
        }
        Ok(())
    }

    pub(crate) fn recover_on_open(&self) -> Result<()> {
        let _guard = self.sync_lock.lock()?;
        self.recover_locked()
    }

    /// Replays un-applied WAL groups into the memtable and window bucket as
    /// if freshly written, then runs a normal sync pass. Idempotent: a seq
    /// already indexed keeps its single slot — the block writer re-points
    /// it at the replayed bytes and the superseded region is reclaimed.
    fn recover_locked(&self) -> Result<()> {
        self.meter.recovers.fetch_add(1, Ordering::Relaxed);
        tracing::info!("replaying write-ahead log");

        // Replayed entries park in a past, unreferenced slot so the next
        // drain takes them immediately.
        let time_id = self.timewindow.recovery_time_id();
        let mut max_seq = 0u64;
        let mut groups: BTreeMap<u64, Vec<u64>> = BTreeMap::new();

        self.wal.replay(|log_seq, record| {
            let header = EntryHeader::unmarshal(record)?;
            // Replayed records are staged writes; the next drain must see
            // the marker move.
            self.writes.fetch_add(1, Ordering::AcqRel);
            self.mem
                .put(header.contract, self.cache_id ^ header.seq, record.to_vec());
            self.timewindow.add(
                time_id,
                header.topic_hash,
                WinEntry::new(header.seq, header.expires_at, header.contract),
            );

            // The trie may have never seen this topic; the record carries
            // the topic bytes.
            let topic_start = ENTRY_HEADER_SIZE + ID_SIZE;
            let topic_end = topic_start + header.topic_size as usize;
            if topic_end > record.len() {
                return Err(errcorrupt!("log record shorter than its topic"));
            }
            let topic = Topic::parse(&record[topic_start..topic_end])?;
            let (parts, _) = self.topic_hashes(header.contract, &topic.parts);
            self.trie.add(&parts, header.topic_hash);

            groups.entry(log_seq).or_default().push(header.seq);
            max_seq = max_seq.max(header.seq);
            Ok(())
        })?;

        self.seq.fetch_max(max_seq, Ordering::AcqRel);
        {
            let mut log = self.commit_log.lock()?;
            for (log_seq, seqs) in groups {
                log.entry(log_seq).or_insert(seqs);
            }
        }
        self.last_sync_mark.store(0, Ordering::Release);
        self.sync_inner()?;
        tracing::info!("recovery complete");
        Ok(())
    }

    /// Rebuilds the trie from the window file: every chain's terminal block
    /// names a topic hash whose topic bytes are read back through the index
    /// and data files.
    pub(crate) fn load_trie(&self) -> Result<()> {
        self.timewindow
            .foreach_window_block(|first_seq, topic_hash, off| {
                match self.read_index_slot(first_seq) {
                    Ok(slot) => {
                        let topic_bytes = self.data.read_topic(&slot)?;
                        let raw_id = self.data.read_id(&slot)?;
                        let contract = Id::from_slice(&raw_id)?.contract();
                        let topic = Topic::parse(&topic_bytes)?;
                        let (parts, _) = self.topic_hashes(contract, &topic.parts);
                        self.trie.add(&parts, topic_hash);
                        self.trie.set_offset(topic_hash, off);
                        Ok(())
                    }
                    // The chain's first entry was deleted; leave the chain
                    // unreachable.
                    Err(Error::IdDoesNotExist) => Ok(()),
                    Err(e) => Err(e),
                }
            })
    }

    /// Reclaims ripe TTL'd entries: their index slot is dropped and their
    /// data region joins the lease pool. The filter gates the index read: a
    /// miss proves the seq was never indexed. Removing the slot makes a
    /// second sighting of the same seq a no-op.
    pub(crate) fn expire_entries(&self) -> Result<()> {
        let _guard = self.sync_lock.lock()?;
        let expired = self.timewindow.expired_entries(self.opts.max_query_limit);
        for we in expired {
            if !self.filter.test(we.seq) {
                continue;
            }
            let idx = crate::block::start_block_index(we.seq);
            if idx >= self.n_blocks.load(Ordering::Acquire) {
                continue;
            }
            let offset = crate::block::block_offset(idx);
            let mut block = crate::block::BlockHandle {
                file: &self.index,
                offset,
            }
            .read()?;
            let Some(i) = block.find(we.seq) else {
                continue;
            };
            let slot = block.entries[i];
            block.remove_slot(i);
            self.index.write_at(&block.marshal(), offset)?;
            self.data.free(slot.m_size(), slot.msg_offset);
            self.count.fetch_sub(1, Ordering::AcqRel);
            self.meter.dels.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

struct SyncTask(Arc<Core>);

#[async_trait::async_trait]
impl BackgroundTask for SyncTask {
    fn name(&self) -> &'static str {
        "sync"
    }

    fn interval(&self) -> Duration {
        self.0.opts.max_sync_duration
    }

    async fn execute(&self) -> Result<()> {
        if self.0.ok().is_err() {
            return Ok(());
        }
        self.0.sync_pass()
    }
}

struct TinyBatchTask(Arc<Core>);

#[async_trait::async_trait]
impl BackgroundTask for TinyBatchTask {
    fn name(&self) -> &'static str {
        "tiny-batch"
    }

    fn interval(&self) -> Duration {
        self.0.opts.tiny_batch_write_interval
    }

    async fn execute(&self) -> Result<()> {
        let core = &self.0;
        if core.ok().is_err() {
            return Ok(());
        }
        let batch = {
            let mut tiny = core.tiny.lock()?;
            if tiny.is_empty() {
                return Ok(());
            }
            std::mem::replace(&mut *tiny, core.new_tiny_batch())
        };
        let tx = core.pool_tx.lock()?.clone();
        match tx {
            Some(tx) => tx.send(batch).await.map_err(|_| Error::Closed),
            None => Ok(()),
        }
    }
}

struct ExpiryTask(Arc<Core>);

#[async_trait::async_trait]
impl BackgroundTask for ExpiryTask {
    fn name(&self) -> &'static str {
        "expirer"
    }

    fn interval(&self) -> Duration {
        EXPIRY_INTERVAL
    }

    async fn execute(&self) -> Result<()> {
        if self.0.ok().is_err() {
            return Ok(());
        }
        self.0.expire_entries()
    }
}

pub(crate) fn register_tasks(core: &Arc<Core>, scheduler: &Scheduler) {
    scheduler.register(Arc::new(TinyBatchTask(Arc::clone(core))));
    scheduler.register(Arc::new(SyncTask(Arc::clone(core))));
    if core.opts.background_key_expiry {
        scheduler.register(Arc::new(ExpiryTask(Arc::clone(core))));
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Options;
    use crate::db::{Db, Query};
    use crate::varz::unix_now;
    use std::time::Duration;

    fn test_options() -> Options {
        Options::default()
            .tiny_batch_write_interval(Duration::from_millis(5))
            .max_sync_duration(Duration::from_secs(30))
    }

    #[test]
    fn test_durability_after_sync_and_reopen() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");

        {
            let db = Db::open(dir.path(), test_options()).expect("Failed to open db");
            db.batch(|b| {
                for i in 0..20 {
                    b.put("dev18.durable", format!("d{i}"))?;
                }
                Ok(())
            })
            .expect("batch");
            db.sync().expect("sync");
            db.close().expect("close");
        }

        let db = Db::open(dir.path(), test_options()).expect("Failed to reopen db");
        assert_eq!(db.count(), 20);
        let items = db.get(&Query::new("dev18.durable")).expect("get");
        assert_eq!(items.len(), 20);
        db.close().expect("close");
    }

    #[test]
    fn test_crash_recovery_replays_wal() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");

        {
            let db = Db::open(dir.path(), test_options()).expect("Failed to open db");
            // Committed to the WAL, never synced to the index.
            db.batch(|b| {
                for i in 0..100 {
                    b.put("dev18.crashy", format!("c{i}"))?;
                }
                Ok(())
            })
            .expect("batch");
            db.crash();
        }

        let db = Db::open(dir.path(), test_options()).expect("Failed to reopen db");
        let items = db
            .get(&Query::new("dev18.crashy").with_limit(1000))
            .expect("get");
        assert_eq!(items.len(), 100, "all WAL entries must be recovered");
        assert_eq!(db.count(), 100);
        db.close().expect("close");
    }

    #[test]
    fn test_recovery_is_idempotent() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");

        {
            let db = Db::open(dir.path(), test_options()).expect("Failed to open db");
            db.batch(|b| b.put("dev18.twice", "only-once")).expect("batch");
            // Synced AND still in the WAL (watermark not yet advanced at
            // crash time in the worst case); replay must not double-index.
            db.sync().expect("sync");
            db.crash();
        }

        let db = Db::open(dir.path(), test_options()).expect("Failed to reopen db");
        let items = db.get(&Query::new("dev18.twice")).expect("get");
        assert_eq!(items, vec![b"only-once".to_vec()]);
        assert_eq!(db.count(), 1);
        db.close().expect("close");
    }

    #[test]
    fn test_expiry_frees_entry() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let db = Db::open(dir.path(), test_options()).expect("Failed to open db");

        let expires_at = unix_now() as u32 + 1;
        db.batch(|b| {
            b.put_entry(crate::entry::Entry::new("dev18.x", "hello").with_expiry(expires_at))
        })
        .expect("batch");
        db.sync().expect("sync");
        assert_eq!(db.count(), 1);

        std::thread::sleep(Duration::from_secs(3));

        // The entry is gone from queries once expired.
        let items = db.get(&Query::new("dev18.x")).expect("get");
        assert!(items.is_empty(), "expired entry must not be returned");

        // The expirer reclaims it and drops the count.
        db.core.expire_entries().expect("expire");
        assert_eq!(db.count(), 0);

        db.close().expect("close");
    }

    #[test]
    fn test_sync_skips_when_idle() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let db = Db::open(dir.path(), test_options()).expect("Failed to open db");

        db.batch(|b| b.put("dev18.idle", "x")).expect("batch");
        db.sync().expect("sync");
        let size_after_first = db.file_size();

        // Nothing new: a second pass must not touch the files.
        db.sync().expect("sync");
        assert_eq!(db.file_size(), size_after_first);

        db.close().expect("close");
    }
}
