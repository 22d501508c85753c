use std::collections::HashMap;

use itertools::Itertools;

use crate::error::Result;
use crate::timewindow::{TimeWindowBucket, WinBlock, WinEntry, WindowHandle};
use crate::varz::unix_now;
use crate::{BLOCK_SIZE, SEQS_PER_WINDOW_BLOCK};

struct WinBlockState {
    block: WinBlock,
    dirty: bool,
    leased: bool,
    // entry_idx at lease time, so a rollback can drop tentative appends.
    restore_idx: u16,
}

/// Buffers window chain growth for one sync pass.
///
/// Appending to a topic either extends its newest block (leased from disk)
/// or, once that block fills, allocates a fresh block whose `next` points at
/// the one just filled. Leased blocks are rewritten in place on flush; fresh
/// blocks are sorted and emitted as coalesced contiguous ranges.
pub struct WindowWriter<'a> {
    tw: &'a TimeWindowBucket,
    blocks: HashMap<i64, WinBlockState>,
}

impl<'a> WindowWriter<'a> {
    pub fn new(tw: &'a TimeWindowBucket) -> Self {
        Self {
            tw,
            blocks: HashMap::new(),
        }
    }

    fn fresh_block(&mut self, topic_hash: u64, next: i64) -> i64 {
        let off = self.tw.next_block_offset();
        self.blocks.insert(
            off,
            WinBlockState {
                block: WinBlock {
                    topic_hash,
                    next,
                    ..Default::default()
                },
                dirty: true,
                leased: false,
                restore_idx: 0,
            },
        );
        off
    }

    /// Leases the block at `off` for in-place growth. Returns false when
    /// the block does not belong to `topic_hash` (an interrupted pass left
    /// a stale chain head behind); the caller then starts a fresh chain.
    fn lease_block(&mut self, topic_hash: u64, off: i64) -> bool {
        if self.blocks.contains_key(&off) {
            return true;
        }
        let block = match (WindowHandle {
            file: self.tw.file(),
            offset: off,
        })
        .read()
        {
            Ok(block) => block,
            Err(_) => return false,
        };
        if block.topic_hash != topic_hash {
            tracing::warn!(off, topic_hash, "stale window chain head, starting fresh");
            return false;
        }
        let restore_idx = block.entry_idx;
        self.blocks.insert(
            off,
            WinBlockState {
                block,
                dirty: false,
                leased: true,
                restore_idx,
            },
        );
        true
    }

    /// Appends `entries` to the chain whose newest block sits at `off`
    /// (0 starts a new chain). Returns the offset of the chain's newest
    /// block afterwards, which the caller stores back into the trie.
    pub fn append(&mut self, topic_hash: u64, off: i64, entries: &[WinEntry]) -> Result<i64> {
        let mut cur = if off != 0 && self.lease_block(topic_hash, off) {
            off
        } else {
            self.fresh_block(topic_hash, 0)
        };

        for entry in entries {
            let state = self.blocks.get_mut(&cur).expect("current block is staged");
            if state.block.entry_idx as usize == SEQS_PER_WINDOW_BLOCK {
                cur = self.fresh_block(topic_hash, cur);
            }
            let state = self.blocks.get_mut(&cur).expect("current block is staged");
            let live = state.block.entry_idx as usize;
            if state.block.entries[..live].iter().any(|e| e.seq == entry.seq) {
                continue;
            }
            state.block.entries[live] = *entry;
            state.block.entry_idx += 1;
            state.block.cutoff_time = unix_now() as i64;
            state.dirty = true;
        }
        Ok(cur)
    }

    /// Flushes staged blocks to the window file.
    pub fn write(&mut self) -> Result<()> {
        let file = self.tw.file();
        if let Some(max_off) = self.blocks.keys().max() {
            let needed = *max_off as u64 + BLOCK_SIZE;
            if file.size() < needed {
                file.extend(needed - file.size())?;
            }
        }

        for (off, state) in self.blocks.iter().filter(|(_, s)| s.leased && s.dirty) {
            file.write_at(&state.block.marshal(), *off as u64)?;
        }

        let fresh: Vec<i64> = self
            .blocks
            .iter()
            .filter(|(_, s)| !s.leased && s.dirty)
            .map(|(off, _)| *off)
            .sorted_unstable()
            .collect();
        for run in fresh.chunk_by(|a, b| b - a == BLOCK_SIZE as i64) {
            let mut buf = Vec::with_capacity(run.len() * BLOCK_SIZE as usize);
            for off in run {
                buf.extend_from_slice(&self.blocks[off].block.marshal());
            }
            file.write_at(&buf, run[0] as u64)?;
        }

        for state in self.blocks.values_mut() {
            state.dirty = false;
            state.leased = true;
            state.restore_idx = state.block.entry_idx;
        }
        Ok(())
    }

    /// Drops tentative appends: leased blocks fall back to their on-disk
    /// entry count, fresh blocks are discarded.
    pub fn rollback(&mut self) {
        self.blocks.retain(|_, s| s.leased);
        for state in self.blocks.values_mut() {
            let live = state.block.entry_idx as usize;
            for i in state.restore_idx as usize..live {
                state.block.entries[i] = WinEntry::default();
            }
            state.block.entry_idx = state.restore_idx;
            state.dirty = false;
        }
    }
}
