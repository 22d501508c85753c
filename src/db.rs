use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use byteorder::{ByteOrder, LittleEndian};
use tokio::sync::mpsc;

use crate::batch::{Batch, BatchPool, TinyBatch};
use crate::block::{block_offset, start_block_index, BlockHandle, Slot};
use crate::config::{BatchOptions, Options};
use crate::data::DataTable;
use crate::entry::{Entry, EntryHeader, Id, PayloadCodec, ENTRY_HEADER_SIZE, MASTER_CONTRACT};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::flock::FileLock;
use crate::freelist::FreeSeqs;
use crate::fsys::Fsys;
use crate::hasher::{shard_of, Hasher};
use crate::memtable::Memtable;
use crate::scheduler::Scheduler;
use crate::timewindow::{TimeWindowBucket, WinEntry};
use crate::topic::{Part, Topic};
use crate::trie::{QueryPart, Trie};
use crate::varz::{unix_now, Meter, Varz};
use crate::wal::Wal;
use crate::{
    errbadreq, errcorrupt, BLOCK_SIZE, INDEX_HEADER_SIZE, MAX_KEYS, MAX_TOPIC_LENGTH,
    MAX_VALUE_LENGTH, N_SHARDS,
};

const INDEX_POSTFIX: &str = "ember.index";
const DATA_POSTFIX: &str = "ember.data";
const WINDOW_POSTFIX: &str = "ember.win";
const FILTER_POSTFIX: &str = "ember.filter";
const LOG_POSTFIX: &str = "ember.log";
const LOCK_POSTFIX: &str = "ember.lock";

const SIGNATURE: [u8; 8] = *b"emberdb1";
const VERSION: u32 = 1;
// Expiry slots round up to the next second, so short TTLs sweep promptly.
const EXPIRY_GRANULARITY: std::time::Duration = std::time::Duration::from_secs(1);

/// Index file header, rewritten on every sync.
#[derive(Debug, Clone, Copy, Default)]
struct Header {
    seq: u64,
    count: u64,
    n_blocks: u32,
    freeblock_off: i64,
    cache_id: u64,
    hash_seed: u64,
}

impl Header {
    fn marshal(&self) -> [u8; 64] {
        let mut buf = [0u8; 64];
        buf[..8].copy_from_slice(&SIGNATURE);
        LittleEndian::write_u32(&mut buf[8..12], VERSION);
        LittleEndian::write_u64(&mut buf[12..20], self.seq);
        LittleEndian::write_u64(&mut buf[20..28], self.count);
        LittleEndian::write_u32(&mut buf[28..32], self.n_blocks);
        LittleEndian::write_u64(&mut buf[32..40], self.freeblock_off as u64);
        LittleEndian::write_u64(&mut buf[40..48], self.cache_id);
        LittleEndian::write_u64(&mut buf[48..56], self.hash_seed);
        buf
    }

    fn unmarshal(buf: &[u8]) -> Result<Self> {
        if buf.len() < 64 || buf[..8] != SIGNATURE {
            return Err(errcorrupt!("bad index signature"));
        }
        let version = LittleEndian::read_u32(&buf[8..12]);
        if version != VERSION {
            return Err(errcorrupt!("unsupported index version {version}"));
        }
        Ok(Self {
            seq: LittleEndian::read_u64(&buf[12..20]),
            count: LittleEndian::read_u64(&buf[20..28]),
            n_blocks: LittleEndian::read_u32(&buf[28..32]),
            freeblock_off: LittleEndian::read_u64(&buf[32..40]) as i64,
            cache_id: LittleEndian::read_u64(&buf[40..48]),
            hash_seed: LittleEndian::read_u64(&buf[48..56]),
        })
    }
}

/// Shared engine state behind the `Db` facade. Background tasks and the
/// batch pool hold their own `Arc` to it.
pub(crate) struct Core {
    pub(crate) opts: Options,
    pub(crate) codec: PayloadCodec,
    pub(crate) hasher: Hasher,
    pub(crate) cache_id: u64,
    pub(crate) seq: AtomicU64,
    pub(crate) count: AtomicU64,
    pub(crate) n_blocks: AtomicU32,
    pub(crate) index: Fsys,
    pub(crate) data: DataTable,
    pub(crate) timewindow: TimeWindowBucket,
    pub(crate) trie: Trie,
    pub(crate) filter: Filter,
    pub(crate) wal: Wal,
    pub(crate) mem: Memtable,
    pub(crate) freeseq: FreeSeqs,
    pub(crate) meter: Meter,
    // Serializes entry ingress.
    pub(crate) write_lock: Mutex<()>,
    // Serializes WAL commit groups; taken after write_lock is released.
    pub(crate) commit_lock: Mutex<()>,
    // Serializes sync, expiry and delete block rewrites.
    pub(crate) sync_lock: Mutex<()>,
    // Striped reader locks, one per contract shard.
    pub(crate) query_locks: Vec<RwLock<()>>,
    // log_seq -> entry seqs committed under it, awaiting sync.
    pub(crate) commit_log: Mutex<BTreeMap<u64, Vec<u64>>>,
    // Seqs deleted before they reached the index; lets their commit group
    // retire without them.
    pub(crate) deleted_unsynced: Mutex<HashSet<u64>>,
    pub(crate) tiny: Mutex<TinyBatch>,
    pub(crate) pool_tx: Mutex<Option<mpsc::Sender<TinyBatch>>>,
    // Staged-write counter; the seq alone cannot tell an idle store from
    // one with overwrites or recycled seqs pending.
    pub(crate) writes: AtomicU64,
    pub(crate) last_sync_mark: AtomicU64,
    pub(crate) closed: AtomicBool,
}

/// Entry bytes resolved for a reader: the index slot plus, for unsynced
/// entries, the raw message still in the memtable.
pub(crate) struct ReadSlot {
    pub slot: Slot,
    pub cached: Option<Vec<u8>>,
}

impl Core {
    pub(crate) fn ok(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    pub(crate) fn get_seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn lock_shard(&self, contract: u32) -> usize {
        shard_of(u64::from(contract), N_SHARDS)
    }

    /// Hashes concrete topic parts under a contract. The contract itself is
    /// the first trie level.
    pub(crate) fn topic_hashes(&self, contract: u32, parts: &[Part]) -> (Vec<u64>, u64) {
        let mut hashes = Vec::with_capacity(parts.len() + 1);
        hashes.push(u64::from(contract));
        for part in parts {
            match part {
                Part::Exact(s) => hashes.push(self.hasher.hash(s.as_bytes())),
                _ => unreachable!("wildcards are rejected before hashing"),
            }
        }
        let topic_hash = self.hasher.hash_parts(&hashes);
        (hashes, topic_hash)
    }

    pub(crate) fn query_parts(&self, contract: u32, parts: &[Part]) -> Vec<QueryPart> {
        let mut out = Vec::with_capacity(parts.len() + 1);
        out.push(QueryPart::Hash(u64::from(contract)));
        for part in parts {
            out.push(match part {
                Part::Exact(s) => QueryPart::Hash(self.hasher.hash(s.as_bytes())),
                Part::Single => QueryPart::Single,
                Part::Multi => QueryPart::Multi,
            });
        }
        out
    }

    pub(crate) fn new_tiny_batch(&self) -> TinyBatch {
        // Backoff ahead of every new batch keeps writers from outrunning
        // the sync loop.
        self.mem.backoff();
        TinyBatch::new(self.timewindow.new_time_id())
    }

    /// Releases an unused (empty) tiny batch.
    pub(crate) fn release_tiny(&self, tiny: TinyBatch) {
        self.timewindow.release_time_id(tiny.time_id);
    }

    /// Stages one entry: memtable, window bucket, trie, then the tiny batch
    /// buffer. The WAL sees it when the batch commits.
    pub(crate) fn put_entry_to(&self, e: &mut Entry, tiny: &mut TinyBatch) -> Result<()> {
        self.ok()?;
        let _w = self.write_lock.lock()?;

        if e.contract == 0 {
            e.contract = MASTER_CONTRACT;
        }
        let topic = Topic::parse(&e.topic)?;
        if topic.has_wildcards() {
            return Err(errbadreq!("wildcard in publish topic"));
        }
        let mut expires_at = e.expires_at;
        if let Some(ttl) = topic.ttl {
            expires_at = (unix_now() + ttl.as_secs()) as u32;
        }

        let (id, seq) = match e.id {
            Some(id) => {
                if self.opts.immutable {
                    return Err(errbadreq!("explicit ids require a mutable database"));
                }
                (id, id.seq())
            }
            None => {
                let seq = self
                    .freeseq
                    .get(e.contract)
                    .unwrap_or_else(|| self.next_seq());
                (Id::new(seq, e.contract, self.opts.encryption), seq)
            }
        };

        let value = if self.opts.encryption {
            self.codec.encode(&e.payload)
        } else {
            e.payload.clone()
        };
        // Strictly below the cap: the slot's topic size is a u16.
        if topic.topic.len() >= MAX_TOPIC_LENGTH {
            return Err(Error::IdTooLarge);
        }
        if value.len() > MAX_VALUE_LENGTH {
            return Err(Error::ValueTooLarge);
        }
        if self.count.load(Ordering::Acquire) >= MAX_KEYS {
            return Err(Error::Full);
        }

        let (part_hashes, topic_hash) = self.topic_hashes(e.contract, &topic.parts);
        let header = EntryHeader {
            seq,
            contract: e.contract,
            topic_hash,
            topic_size: topic.topic.len() as u16,
            value_size: value.len() as u32,
            expires_at,
            msg_offset: 0,
        };
        let mut data =
            Vec::with_capacity(ENTRY_HEADER_SIZE + id.as_bytes().len() + topic.topic.len() + value.len());
        data.extend_from_slice(&header.marshal());
        data.extend_from_slice(id.as_bytes());
        data.extend_from_slice(&topic.topic);
        data.extend_from_slice(&value);

        self.mem.put(e.contract, self.cache_id ^ seq, data.clone());
        self.timewindow
            .add(tiny.time_id, topic_hash, WinEntry::new(seq, expires_at, e.contract));
        if self.trie.add(&part_hashes, topic_hash) {
            tiny.trie_adds.push((part_hashes, topic_hash));
        }
        tiny.add_record(&data, seq, e.contract);

        e.id = Some(id);
        e.expires_at = expires_at;
        self.writes.fetch_add(1, Ordering::AcqRel);
        self.meter.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Enqueues a tiny batch onto the commit pool from synchronous code.
    pub(crate) fn pool_write(&self, batch: TinyBatch) -> Result<()> {
        let tx = self
            .pool_tx
            .lock()?
            .clone()
            .ok_or(Error::Closed)?;
        tx.blocking_send(batch).map_err(|_| Error::Closed)
    }

    /// Appends the batch to the WAL as one group and records it for sync.
    pub(crate) fn tiny_commit(&self, tiny: &mut TinyBatch) -> Result<()> {
        let _c = self.commit_lock.lock()?;
        if tiny.is_empty() {
            self.timewindow.release_time_id(tiny.time_id);
            return Ok(());
        }

        let mut writer = self.wal.new_writer();
        for record in tiny.records() {
            writer.append(record)?;
        }
        let log_seq = self.wal.next_seq();
        writer.signal_init_write(log_seq)?;
        self.write_header(false)?;

        self.commit_log
            .lock()?
            .insert(log_seq, tiny.entries.iter().map(|(seq, _)| *seq).collect());
        self.meter
            .in_msgs
            .fetch_add(tiny.len() as u64, Ordering::Relaxed);
        self.timewindow.release_time_id(tiny.time_id);
        tiny.buffer.clear();
        Ok(())
    }

    /// Undoes a failed or abandoned batch: memtable entries, window bucket
    /// entries and trie insertions are all reversed.
    pub(crate) fn rollback(&self, tiny: &mut TinyBatch) {
        let seqs: HashSet<u64> = tiny.entries.iter().map(|(seq, _)| *seq).collect();
        self.timewindow.abort(tiny.time_id, &seqs);
        for (seq, contract) in &tiny.entries {
            self.mem.free(*contract, self.cache_id ^ seq);
            self.freeseq.free(*seq);
        }
        for (parts, topic_hash) in &tiny.trie_adds {
            self.trie.remove(parts, *topic_hash);
        }
        self.timewindow.release_time_id(tiny.time_id);
        tiny.buffer.clear();
        tiny.entries.clear();
        tiny.trie_adds.clear();
    }

    /// Reads the index slot for a seq, or `IdDoesNotExist`.
    pub(crate) fn read_index_slot(&self, seq: u64) -> Result<Slot> {
        let idx = start_block_index(seq);
        if idx >= self.n_blocks.load(Ordering::Acquire) {
            return Err(Error::IdDoesNotExist);
        }
        let block = BlockHandle {
            file: &self.index,
            offset: block_offset(idx),
        }
        .read()?;
        match block.find(seq) {
            Some(i) => Ok(block.entries[i]),
            None => Err(Error::IdDoesNotExist),
        }
    }

    /// Resolves a seq for a reader: memtable first, then the index.
    pub(crate) fn read_entry(&self, contract: u32, seq: u64) -> Result<ReadSlot> {
        if let Some(data) = self.mem.get(contract, self.cache_id ^ seq) {
            let header = EntryHeader::unmarshal(&data)?;
            return Ok(ReadSlot {
                slot: Slot {
                    seq,
                    topic_size: header.topic_size,
                    value_size: header.value_size,
                    msg_offset: header.msg_offset,
                },
                cached: Some(data[ENTRY_HEADER_SIZE..].to_vec()),
            });
        }
        Ok(ReadSlot {
            slot: self.read_index_slot(seq)?,
            cached: None,
        })
    }

    /// Reads (id, value) through a resolved slot.
    pub(crate) fn read_message(&self, rs: &ReadSlot) -> Result<(Vec<u8>, Vec<u8>)> {
        match &rs.cached {
            Some(raw) => {
                let id = raw[..crate::entry::ID_SIZE].to_vec();
                let value = raw[crate::entry::ID_SIZE + rs.slot.topic_size as usize..].to_vec();
                Ok((id, value))
            }
            None => self.data.read_message(&rs.slot),
        }
    }

    /// Deletes one entry by id. Unsynced entries leave through the memtable
    /// and window bucket; indexed entries lose their slot and their data
    /// region joins the lease pool.
    pub(crate) fn delete_entry(&self, e: &Entry) -> Result<()> {
        self.ok()?;
        let id = e.id.ok_or(Error::IdEmpty)?;
        let contract = if e.contract == 0 { MASTER_CONTRACT } else { e.contract };
        let topic = Topic::parse(&e.topic)?;
        if topic.has_wildcards() {
            return Err(errbadreq!("wildcard in delete topic"));
        }
        let (_, topic_hash) = self.topic_hashes(contract, &topic.parts);
        let seq = id.seq();

        let _s = self.sync_lock.lock()?;
        let _q = self.query_locks[self.lock_shard(contract)].write()?;

        if self.mem.free(contract, self.cache_id ^ seq) {
            self.timewindow.remove_seq(topic_hash, seq);
            self.deleted_unsynced.lock()?.insert(seq);
            self.freeseq.free(seq);
            self.meter.dels.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        // A miss proves the seq never reached the index.
        if !self.filter.test(seq) {
            return Ok(());
        }
        let idx = start_block_index(seq);
        if idx >= self.n_blocks.load(Ordering::Acquire) {
            return Ok(());
        }
        let offset = block_offset(idx);
        let mut block = BlockHandle {
            file: &self.index,
            offset,
        }
        .read()?;
        let Some(i) = block.find(seq) else {
            return Ok(());
        };
        let slot = block.entries[i];
        if self.data.read_id(&slot)? != id.as_bytes() {
            return Ok(());
        }

        block.remove_slot(i);
        self.index.write_at(&block.marshal(), offset)?;
        self.data.free(slot.m_size(), slot.msg_offset);
        self.count.fetch_sub(1, Ordering::AcqRel);
        self.freeseq.free(seq);
        self.meter.dels.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes the index header; with `write_freelist` the lease pool is
    /// defragged and snapshotted first (clean close only).
    pub(crate) fn write_header(&self, write_freelist: bool) -> Result<()> {
        let freeblock_off = if write_freelist {
            self.data.lease.defrag();
            self.data.lease.write(&self.data.file)?
        } else {
            -1
        };
        let header = Header {
            seq: self.get_seq(),
            count: self.count.load(Ordering::Acquire),
            n_blocks: self.n_blocks.load(Ordering::Acquire),
            freeblock_off,
            cache_id: self.cache_id,
            hash_seed: self.hasher.seed(),
        };
        self.index.write_at(&header.marshal(), 0)
    }
}

/// An embedded message store for time-ordered, topic-addressed payloads.
///
/// All methods are safe for concurrent use. Background tasks flush tiny
/// batches to the write-ahead log, drain the memtable to the on-disk index
/// on the sync interval, and (optionally) expire TTL'd entries.
pub struct Db {
    pub(crate) core: Arc<Core>,
    scheduler: Option<Scheduler>,
    pool: Option<BatchPool>,
    lock: Option<FileLock>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

impl Db {
    /// Opens or creates a database under `path` with an identity payload
    /// transform.
    pub fn open<P: AsRef<Path>>(path: P, opts: Options) -> Result<Db> {
        Self::open_with_codec(path, opts, PayloadCodec::identity())
    }

    /// Opens or creates a database under `path`, injecting the payload
    /// transform pair applied when `encryption` is enabled.
    pub fn open_with_codec<P: AsRef<Path>>(
        path: P,
        opts: Options,
        codec: PayloadCodec,
    ) -> Result<Db> {
        let dir = path.as_ref();
        std::fs::create_dir_all(dir)?;

        let (lock, needs_recovery) = FileLock::lock(dir.join(LOCK_POSTFIX)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                Error::Locked
            } else {
                Error::Io(e.to_string())
            }
        })?;

        let index = Fsys::open(dir.join(INDEX_POSTFIX))?;
        let data_file = Fsys::open(dir.join(DATA_POSTFIX))?;
        if index.size() == 0 && data_file.size() != 0 {
            // Data file exists, but the index is missing.
            return Err(errcorrupt!("index file is missing"));
        }
        let fresh = index.size() == 0;

        let header = if fresh {
            let header = Header {
                seq: 0,
                count: 0,
                n_blocks: 1,
                freeblock_off: -1,
                cache_id: rand::random(),
                hash_seed: rand::random(),
            };
            index.extend(INDEX_HEADER_SIZE + BLOCK_SIZE)?;
            index.write_at(&header.marshal(), 0)?;
            index.sync()?;
            header
        } else {
            let buf = index.slice(0, 64)?;
            Header::unmarshal(&buf)?
        };

        let data = DataTable::open(data_file, opts.minimum_free_blocks_size)?;
        if !fresh && !needs_recovery {
            data.lease.read(&data.file, header.freeblock_off)?;
        }

        let win_file = Fsys::open(dir.join(WINDOW_POSTFIX))?;
        let timewindow = TimeWindowBucket::new(
            win_file,
            std::time::Duration::from_millis(100),
            EXPIRY_GRANULARITY,
        )?;
        let filter = Filter::open(Fsys::open(dir.join(FILTER_POSTFIX))?)?;
        let wal = Wal::open(dir.join(LOG_POSTFIX), opts.log_size)?;

        let timewindow_first_id = timewindow.new_time_id();
        let core = Arc::new(Core {
            codec,
            hasher: Hasher::new(header.hash_seed),
            cache_id: header.cache_id,
            seq: AtomicU64::new(header.seq),
            count: AtomicU64::new(header.count),
            n_blocks: AtomicU32::new(header.n_blocks),
            index,
            data,
            timewindow,
            trie: Trie::new(),
            filter,
            wal,
            mem: Memtable::new(opts.memdb_size),
            freeseq: FreeSeqs::new(),
            meter: Meter::new(),
            write_lock: Mutex::new(()),
            commit_lock: Mutex::new(()),
            sync_lock: Mutex::new(()),
            query_locks: (0..N_SHARDS).map(|_| RwLock::new(())).collect(),
            commit_log: Mutex::new(BTreeMap::new()),
            deleted_unsynced: Mutex::new(HashSet::new()),
            tiny: Mutex::new(TinyBatch::new(timewindow_first_id)),
            pool_tx: Mutex::new(None),
            writes: AtomicU64::new(0),
            last_sync_mark: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            opts,
        });

        core.load_trie()?;

        let unapplied = core.wal.scan()?;
        if needs_recovery || !unapplied.is_empty() {
            core.recover_on_open()?;
        }

        let scheduler = Scheduler::new()?;
        let pool = BatchPool::start(&core, &scheduler);
        crate::dbsync::register_tasks(&core, &scheduler);

        Ok(Db {
            core,
            scheduler: Some(scheduler),
            pool: Some(pool),
            lock: Some(lock),
        })
    }

    /// Publishes a message on `topic`. The topic may carry a `?ttl=`
    /// option.
    pub fn put(&self, topic: impl Into<Vec<u8>>, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.put_entry(Entry::new(topic.into(), payload.into()))
            .map(|_| ())
    }

    /// Publishes a full entry; its generated id is written back into
    /// `entry.id` semantics via the returned value.
    pub fn put_entry(&self, mut entry: Entry) -> Result<Entry> {
        let mut tiny = self.core.tiny.lock()?;
        self.core.put_entry_to(&mut entry, &mut tiny)?;
        Ok(entry)
    }

    /// Deletes the entry with `entry.id` on `entry.topic`.
    pub fn delete_entry(&self, entry: &Entry) -> Result<()> {
        self.core.delete_entry(entry)
    }

    /// Returns payloads matching the query, newest window entries first.
    pub fn get(&self, query: &Query) -> Result<Vec<Vec<u8>>> {
        let mut items = Vec::new();
        for item in self.items(query)? {
            items.push(item?.value);
        }
        Ok(items)
    }

    /// Returns an iterator over items matching the query.
    pub fn items(&self, query: &Query) -> Result<crate::iterator::ItemIterator> {
        crate::iterator::ItemIterator::new(Arc::clone(&self.core), query)
    }

    /// Executes `f` as a managed batch: committed when it returns `Ok`,
    /// rolled back when it returns an error.
    pub fn batch<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Batch) -> Result<()>,
    {
        self.batch_with_options(BatchOptions::default(), f)
    }

    pub fn batch_with_options<F>(&self, opts: BatchOptions, f: F) -> Result<()>
    where
        F: FnOnce(&mut Batch) -> Result<()>,
    {
        self.core.ok()?;
        let mut batch = Batch::new(Arc::clone(&self.core), opts)?;
        match f(&mut batch) {
            Ok(()) => batch.commit(),
            Err(e) => {
                batch.abort();
                Err(e)
            }
        }
    }

    /// Generates a fresh contract.
    pub fn new_contract(&self) -> u32 {
        loop {
            let contract: u32 = rand::random();
            if contract != 0 && contract != MASTER_CONTRACT {
                return contract;
            }
        }
    }

    /// Generates an id bound to the next sequence number. Only useful on a
    /// mutable database, where ids may be supplied to `put_entry`.
    pub fn new_id(&self) -> Id {
        Id::new(self.core.next_seq(), MASTER_CONTRACT, false)
    }

    /// Number of live indexed entries.
    pub fn count(&self) -> u64 {
        self.core.count.load(Ordering::Acquire)
    }

    /// Total size of the index, data and window files.
    pub fn file_size(&self) -> u64 {
        self.core.index.size() + self.core.data.size() + self.core.timewindow.file().size()
    }

    /// Point-in-time operational counters.
    pub fn varz(&self) -> Varz {
        let mut varz = self.core.meter.snapshot();
        varz.mem_size = self.core.mem.size();
        varz.count = self.count();
        varz
    }

    /// Runs a sync pass immediately.
    pub fn sync(&self) -> Result<()> {
        self.core.ok()?;
        self.core.sync_pass()
    }

    /// Closes the database: drains pending batches, runs a final sync, and
    /// releases the lock file.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }

        // Commit whatever the tiny batch loop had not flushed yet.
        {
            let mut tiny = self.core.tiny.lock()?;
            let mut last = std::mem::replace(&mut *tiny, TinyBatch::new(0));
            if let Err(e) = self.core.tiny_commit(&mut last) {
                tracing::error!(error = %e, "final tiny batch commit failed");
                self.core.rollback(&mut last);
            }
        }

        if let Some(pool) = self.pool.take() {
            pool.stop(&self.core, true);
        }
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown();
        }

        self.core.sync_pass()?;
        self.core.write_header(true)?;
        self.core.index.sync()?;
        self.core.data.sync()?;

        if let Some(lock) = self.lock.take() {
            lock.unlock()?;
        }
        Ok(())
    }
}

impl Db {
    /// Test-only crash: tears the process-side state down without the
    /// final sync and leaves the lock marker in place, so the next open
    /// runs recovery.
    #[cfg(test)]
    pub(crate) fn crash(mut self) {
        self.core.closed.store(true, Ordering::Release);
        if let Some(pool) = self.pool.take() {
            pool.stop(&self.core, false);
        }
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown();
        }
        // Dropping the lock releases the flock but keeps the marker file.
        self.lock.take();
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if !self.core.closed.load(Ordering::Acquire) {
            if let Err(e) = self.shutdown() {
                tracing::error!(error = %e, "close on drop failed");
            }
        }
    }
}

/// A topic query with optional contract scope and result cap.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub topic: Vec<u8>,
    pub contract: u32,
    pub limit: usize,
}

impl Query {
    pub fn new(topic: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }

    pub fn with_contract(mut self, contract: u32) -> Self {
        self.contract = contract;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}
