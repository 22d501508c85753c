use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

use crate::config::BatchOptions;
use crate::db::Core;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::scheduler::Scheduler;

/// Workers a pool may run concurrently.
pub(crate) const POOL_SIZE: usize = 27;
/// Idle workers exit after this long without work.
const IDLE_TIMEOUT: Duration = Duration::from_secs(2);

/// The unit of commit: entries buffered since the last flush tick, bound to
/// one time slot.
///
/// The buffer holds length-prefixed records (entry header || id || topic ||
/// value), ready to stream into a WAL group. Everything else exists so a
/// failed commit can be undone: the seqs and contracts address the memtable,
/// the trie additions are reversed verbatim.
pub(crate) struct TinyBatch {
    pub time_id: i64,
    pub buffer: Vec<u8>,
    pub entries: Vec<(u64, u32)>,
    pub trie_adds: Vec<(Vec<u64>, u64)>,
    pub done_tx: Option<oneshot::Sender<Result<()>>>,
}

impl TinyBatch {
    pub fn new(time_id: i64) -> Self {
        Self {
            time_id,
            buffer: Vec::new(),
            entries: Vec::new(),
            trie_adds: Vec::new(),
            done_tx: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add_record(&mut self, data: &[u8], seq: u64, contract: u32) {
        let mut len = [0u8; 4];
        LittleEndian::write_u32(&mut len, data.len() as u32);
        self.buffer.extend_from_slice(&len);
        self.buffer.extend_from_slice(data);
        self.entries.push((seq, contract));
    }

    /// Iterates the buffered records.
    pub fn records(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let mut off = 0;
        std::iter::from_fn(move || {
            if off + 4 > self.buffer.len() {
                return None;
            }
            let len = LittleEndian::read_u32(&self.buffer[off..off + 4]) as usize;
            let start = off + 4;
            off = start + len;
            Some(&self.buffer[start..off])
        })
    }
}

/// Bounded worker pool committing tiny batches to the WAL.
///
/// A dispatcher routes incoming batches to an idle worker, spawning up to
/// `POOL_SIZE` of them; beyond that batches queue FIFO. Idle workers retire
/// after two seconds. `stop(wait)` closes the intake and either drains or
/// rolls back whatever is still queued.
pub(crate) struct BatchPool {
    wait: Arc<AtomicBool>,
    stopped_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl BatchPool {
    /// Starts the dispatcher on the scheduler runtime and wires the write
    /// queue sender into the core.
    pub fn start(core: &Arc<Core>, scheduler: &Scheduler) -> Self {
        let (write_tx, write_rx) = mpsc::channel::<TinyBatch>(1);
        let (stopped_tx, stopped_rx) = oneshot::channel();
        let wait = Arc::new(AtomicBool::new(true));

        *core.pool_tx.lock().unwrap() = Some(write_tx);
        scheduler.spawn(dispatch(
            Arc::clone(core),
            write_rx,
            Arc::clone(&wait),
            stopped_tx,
        ));

        Self {
            wait,
            stopped_rx: Mutex::new(Some(stopped_rx)),
        }
    }

    /// Stops accepting batches; drains the queue when `wait` is set, rolls
    /// it back otherwise. Blocks until the dispatcher and workers exit.
    pub fn stop(&self, core: &Core, wait: bool) {
        self.wait.store(wait, Ordering::Release);
        // Dropping the sender closes the write queue.
        core.pool_tx.lock().unwrap().take();
        if let Some(rx) = self.stopped_rx.lock().unwrap().take() {
            let _ = rx.blocking_recv();
        }
    }
}

async fn dispatch(
    core: Arc<Core>,
    mut write_rx: mpsc::Receiver<TinyBatch>,
    wait: Arc<AtomicBool>,
    stopped_tx: oneshot::Sender<()>,
) -> Result<()> {
    let (batch_tx, batch_rx) = mpsc::channel::<TinyBatch>(1);
    let batch_rx = Arc::new(AsyncMutex::new(batch_rx));
    let active = Arc::new(AtomicUsize::new(0));
    let mut workers = tokio::task::JoinSet::new();
    let mut waiting: VecDeque<TinyBatch> = VecDeque::new();

    'main: loop {
        // While batches wait, feed them to workers before taking new ones.
        while let Some(batch) = waiting.pop_front() {
            tokio::select! {
                perm = batch_tx.reserve() => match perm {
                    Ok(perm) => perm.send(batch),
                    Err(_) => break 'main,
                },
                incoming = write_rx.recv() => match incoming {
                    Some(nb) => {
                        waiting.push_front(batch);
                        waiting.push_back(nb);
                    }
                    None => {
                        waiting.push_front(batch);
                        break 'main;
                    }
                },
            }
        }

        match write_rx.recv().await {
            None => break,
            Some(batch) => {
                if active.load(Ordering::Acquire) == 0 {
                    spawn_worker(&mut workers, &core, &batch_rx, &active);
                }
                match batch_tx.try_reserve() {
                    Ok(perm) => perm.send(batch),
                    Err(_) => {
                        if active.load(Ordering::Acquire) < POOL_SIZE {
                            spawn_worker(&mut workers, &core, &batch_rx, &active);
                            if batch_tx.send(batch).await.is_err() {
                                break;
                            }
                        } else {
                            waiting.push_back(batch);
                        }
                    }
                }
            }
        }
    }

    if wait.load(Ordering::Acquire) {
        if !waiting.is_empty() && active.load(Ordering::Acquire) == 0 {
            spawn_worker(&mut workers, &core, &batch_rx, &active);
        }
        for batch in waiting.drain(..) {
            if batch_tx.send(batch).await.is_err() {
                break;
            }
        }
    } else {
        for mut batch in waiting.drain(..) {
            core.rollback(&mut batch);
        }
    }

    // Closing the batch queue retires the workers once it drains.
    drop(batch_tx);
    while workers.join_next().await.is_some() {}
    let _ = stopped_tx.send(());
    Ok(())
}

fn spawn_worker(
    workers: &mut tokio::task::JoinSet<()>,
    core: &Arc<Core>,
    batch_rx: &Arc<AsyncMutex<mpsc::Receiver<TinyBatch>>>,
    active: &Arc<AtomicUsize>,
) {
    active.fetch_add(1, Ordering::AcqRel);
    let core = Arc::clone(core);
    let batch_rx = Arc::clone(batch_rx);
    let active = Arc::clone(active);
    workers.spawn(async move {
        loop {
            let received = tokio::time::timeout(IDLE_TIMEOUT, async {
                batch_rx.lock().await.recv().await
            })
            .await;
            match received {
                // Idle too long, or the pool is stopping.
                Err(_) | Ok(None) => break,
                Ok(Some(mut batch)) => {
                    let done = batch.done_tx.take();
                    let result = core.tiny_commit(&mut batch);
                    if result.is_err() {
                        core.rollback(&mut batch);
                    }
                    match (done, result) {
                        (Some(tx), result) => {
                            let _ = tx.send(result);
                        }
                        (None, Err(e)) => {
                            tracing::error!(error = %e, "tiny batch commit failed");
                        }
                        (None, Ok(())) => {}
                    }
                }
            }
        }
        active.fetch_sub(1, Ordering::AcqRel);
    });
}

/// A user-controlled group of writes committed together.
///
/// Obtained through `Db::batch`; entries stage into the batch's own tiny
/// batches and reach the WAL only on commit. An error from the batch
/// function rolls everything back.
pub struct Batch {
    core: Arc<Core>,
    opts: BatchOptions,
    tiny: Option<TinyBatch>,
    pending: Vec<oneshot::Receiver<Result<()>>>,
    // Undo records (topic, contract, id) for entries in the current tiny
    // batch and for those already handed to the pool; an abort must take
    // back partial flushes too.
    staged: Vec<Entry>,
    flushed: Vec<Entry>,
    last_flush: Instant,
}

impl Batch {
    pub(crate) fn new(core: Arc<Core>, opts: BatchOptions) -> Result<Self> {
        let tiny = core.new_tiny_batch();
        Ok(Self {
            core,
            opts,
            tiny: Some(tiny),
            pending: Vec::new(),
            staged: Vec::new(),
            flushed: Vec::new(),
            last_flush: Instant::now(),
        })
    }

    /// Stages a message on `topic`.
    pub fn put(&mut self, topic: impl Into<Vec<u8>>, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.put_entry(Entry::new(topic.into(), payload.into()))
    }

    /// Stages a full entry.
    pub fn put_entry(&mut self, mut entry: Entry) -> Result<()> {
        if entry.contract == 0 {
            entry.contract = self.opts.contract;
        }
        let tiny = self.tiny.as_mut().expect("batch already finished");
        self.core.put_entry_to(&mut entry, tiny)?;
        self.staged.push(Entry {
            topic: entry.topic.clone(),
            payload: Vec::new(),
            contract: entry.contract,
            expires_at: 0,
            id: entry.id,
        });

        if !self.opts.write_interval.is_zero() && self.last_flush.elapsed() >= self.opts.write_interval
        {
            self.write()?;
        }
        Ok(())
    }

    /// Deletes an entry by id. Deletes apply immediately; they are not part
    /// of the rollback scope.
    pub fn delete(&mut self, entry: &Entry) -> Result<()> {
        self.core.delete_entry(entry)
    }

    /// Partial flush: hands the staged entries to the commit pool and
    /// starts a new tiny batch.
    pub fn write(&mut self) -> Result<()> {
        let tiny = self.tiny.as_mut().expect("batch already finished");
        if tiny.is_empty() {
            return Ok(());
        }
        let mut full = std::mem::replace(tiny, self.core.new_tiny_batch());
        let (done_tx, done_rx) = oneshot::channel();
        full.done_tx = Some(done_tx);
        self.core.pool_write(full)?;
        self.pending.push(done_rx);
        self.flushed.append(&mut self.staged);
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Commits the batch and blocks until every flushed group is durable.
    pub(crate) fn commit(mut self) -> Result<()> {
        self.write()?;
        if let Some(tiny) = self.tiny.take() {
            self.core.release_tiny(tiny);
        }
        let mut first_err = None;
        for rx in self.pending.drain(..) {
            match rx.blocking_recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => first_err = first_err.or(Some(e)),
                Err(_) => first_err = first_err.or(Some(Error::Closed)),
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Rolls back the whole batch: the staged tiny batch is reversed, and
    /// groups already flushed through `write_interval` are taken back entry
    /// by entry once their commits settle.
    pub(crate) fn abort(mut self) {
        if let Some(mut tiny) = self.tiny.take() {
            self.core.rollback(&mut tiny);
        }
        self.staged.clear();

        // Wait for in-flight groups so no worker races the undo below.
        for rx in self.pending.drain(..) {
            let _ = rx.blocking_recv();
        }
        for entry in self.flushed.drain(..) {
            if let Err(e) = self.core.delete_entry(&entry) {
                tracing::error!(error = %e, "failed to undo flushed batch entry");
            }
        }
    }
}
