use std::collections::HashMap;

use byteorder::{ByteOrder, LittleEndian};
use itertools::Itertools;

use crate::error::Result;
use crate::fsys::Fsys;
use crate::{BLOCK_SIZE, ENTRIES_PER_INDEX_BLOCK, INDEX_HEADER_SIZE};

/// One index slot: 16 bytes on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Slot {
    pub seq: u64,
    pub topic_size: u16,
    pub value_size: u32,
    pub msg_offset: i64,
}

impl Slot {
    /// Size of the message region this slot points at.
    pub fn m_size(&self) -> u32 {
        crate::entry::ID_SIZE as u32 + u32::from(self.topic_size) + self.value_size
    }
}

/// A 4 KiB index block holding up to `ENTRIES_PER_INDEX_BLOCK` slots.
///
/// On disk every slot stores its seq relative to the block's `base_seq`
/// (`0` marks an empty slot, live slots are biased by the slot count), so
/// the base is the only absolute sequence in the block.
#[derive(Debug, Clone)]
pub struct Block {
    pub base_seq: u64,
    pub entries: [Slot; ENTRIES_PER_INDEX_BLOCK],
    pub next: u32,
    pub entry_idx: u16,
}

impl Default for Block {
    fn default() -> Self {
        Self {
            base_seq: 0,
            entries: [Slot::default(); ENTRIES_PER_INDEX_BLOCK],
            next: 0,
            entry_idx: 0,
        }
    }
}

/// Index of the block that owns `seq`.
pub fn start_block_index(seq: u64) -> u32 {
    ((seq - 1) / ENTRIES_PER_INDEX_BLOCK as u64) as u32
}

/// File offset of an index block.
pub fn block_offset(idx: u32) -> u64 {
    INDEX_HEADER_SIZE + BLOCK_SIZE * u64::from(idx)
}

impl Block {
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        let base_seq = self.entries[0].seq;
        LittleEndian::write_u64(&mut buf[0..8], base_seq);
        let mut off = 8;
        for slot in &self.entries {
            let rel = if slot.seq == 0 {
                0u16
            } else {
                (slot.seq as i64 - base_seq as i64 + ENTRIES_PER_INDEX_BLOCK as i64) as u16
            };
            LittleEndian::write_u16(&mut buf[off..off + 2], rel);
            LittleEndian::write_u16(&mut buf[off + 2..off + 4], slot.topic_size);
            LittleEndian::write_u32(&mut buf[off + 4..off + 8], slot.value_size);
            LittleEndian::write_u64(&mut buf[off + 8..off + 16], slot.msg_offset as u64);
            off += 16;
        }
        LittleEndian::write_u32(&mut buf[off..off + 4], self.next);
        LittleEndian::write_u16(&mut buf[off + 4..off + 6], self.entry_idx);
        buf
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        if data.len() < BLOCK_SIZE as usize {
            return Err(crate::errcorrupt!("short index block: {}", data.len()));
        }
        let mut block = Block {
            base_seq: LittleEndian::read_u64(&data[0..8]),
            ..Default::default()
        };
        let mut off = 8;
        for slot in block.entries.iter_mut() {
            let rel = LittleEndian::read_u16(&data[off..off + 2]) as i16;
            slot.seq = if rel == 0 {
                0
            } else {
                (block.base_seq as i64 + i64::from(rel) - ENTRIES_PER_INDEX_BLOCK as i64) as u64
            };
            slot.topic_size = LittleEndian::read_u16(&data[off + 2..off + 4]);
            slot.value_size = LittleEndian::read_u32(&data[off + 4..off + 8]);
            slot.msg_offset = LittleEndian::read_u64(&data[off + 8..off + 16]) as i64;
            off += 16;
        }
        block.next = LittleEndian::read_u32(&data[off..off + 4]);
        block.entry_idx = LittleEndian::read_u16(&data[off + 4..off + 6]);
        Ok(block)
    }

    /// Finds the live slot holding `seq`.
    pub fn find(&self, seq: u64) -> Option<usize> {
        self.entries[..self.entry_idx as usize]
            .iter()
            .position(|s| s.seq == seq)
    }

    /// Removes the slot at `i`, shifting later slots down.
    pub fn remove_slot(&mut self, i: usize) {
        let live = self.entry_idx as usize;
        self.entries.copy_within(i + 1..live, i);
        self.entries[live - 1] = Slot::default();
        self.entry_idx -= 1;
    }
}

/// Reads one index block at a fixed offset.
pub struct BlockHandle<'a> {
    pub file: &'a Fsys,
    pub offset: u64,
}

impl BlockHandle<'_> {
    pub fn read(&self) -> Result<Block> {
        let buf = self.file.slice(self.offset, self.offset + BLOCK_SIZE)?;
        Block::unmarshal(&buf)
    }
}

/// Outcome of staging a slot whose seq may already be present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staged {
    /// The seq was new to its block.
    Fresh,
    /// The seq was present with identical fields; nothing changed.
    Replayed,
    /// The seq was present and its slot now points at the new fields. The
    /// superseded message region is handed back for reclamation.
    Updated { old_offset: i64, old_size: u32 },
}

struct BlockState {
    block: Block,
    dirty: bool,
    leased: bool,
}

/// Buffers index block mutations for one sync pass.
///
/// Blocks already on disk are leased (read in, modified, rewritten in
/// place); blocks past the current end are fresh and flushed as coalesced
/// contiguous ranges, one write per run.
pub struct BlockWriter<'a> {
    table: &'a Fsys,
    // Blocks at an index below this existed before the pass started.
    start_idx: u32,
    blocks: HashMap<u32, BlockState>,
    upper_seq: u64,
}

impl<'a> BlockWriter<'a> {
    pub fn new(table: &'a Fsys, start_idx: u32) -> Self {
        Self {
            table,
            start_idx,
            blocks: HashMap::new(),
            upper_seq: 0,
        }
    }

    pub fn upper_seq(&self) -> u64 {
        self.upper_seq
    }

    /// Stages a slot. A seq already occupying a slot in its block is either
    /// a replay (identical fields, left alone) or an overwrite through an
    /// explicit id, which updates the slot in place.
    pub fn append(&mut self, slot: Slot) -> Result<Staged> {
        let idx = start_block_index(slot.seq);
        if !self.blocks.contains_key(&idx) {
            let state = if idx < self.start_idx {
                let handle = BlockHandle {
                    file: self.table,
                    offset: block_offset(idx),
                };
                BlockState {
                    block: handle.read()?,
                    dirty: false,
                    leased: true,
                }
            } else {
                BlockState {
                    block: Block::default(),
                    dirty: false,
                    leased: false,
                }
            };
            self.blocks.insert(idx, state);
        }

        let state = self.blocks.get_mut(&idx).expect("block state just inserted");
        if let Some(i) = state.block.find(slot.seq) {
            let old = state.block.entries[i];
            if old == slot {
                return Ok(Staged::Replayed);
            }
            state.block.entries[i] = slot;
            state.dirty = true;
            if slot.seq > self.upper_seq {
                self.upper_seq = slot.seq;
            }
            return Ok(Staged::Updated {
                old_offset: old.msg_offset,
                old_size: old.m_size(),
            });
        }
        let i = state.block.entry_idx as usize;
        if i >= ENTRIES_PER_INDEX_BLOCK {
            return Err(crate::errcorrupt!(
                "index block {idx} overflow appending seq {}",
                slot.seq
            ));
        }
        state.block.entries[i] = slot;
        state.block.entry_idx += 1;
        state.dirty = true;
        if slot.seq > self.upper_seq {
            self.upper_seq = slot.seq;
        }

        // A block filling up allocates its successor eagerly, so the file
        // always covers the next write.
        if state.block.entry_idx as usize == ENTRIES_PER_INDEX_BLOCK {
            self.blocks.entry(idx + 1).or_insert_with(|| BlockState {
                block: Block::default(),
                dirty: true,
                leased: false,
            });
        }
        Ok(Staged::Fresh)
    }

    /// Flushes staged blocks. Returns the number of index blocks the file
    /// now covers.
    pub fn write(&mut self) -> Result<u32> {
        let max_idx = match self.blocks.keys().max() {
            Some(max) => *max,
            None => return Ok(self.start_idx),
        };
        let needed = block_offset(max_idx) + BLOCK_SIZE;
        if self.table.size() < needed {
            self.table.extend(needed - self.table.size())?;
        }

        for (idx, state) in self.blocks.iter().filter(|(_, s)| s.leased && s.dirty) {
            self.table.write_at(&state.block.marshal(), block_offset(*idx))?;
        }

        let fresh: Vec<u32> = self
            .blocks
            .iter()
            .filter(|(_, s)| !s.leased && s.dirty)
            .map(|(idx, _)| *idx)
            .sorted_unstable()
            .collect();
        for run in fresh.chunk_by(|a, b| b - a == 1) {
            let mut buf = Vec::with_capacity(run.len() * BLOCK_SIZE as usize);
            for idx in run {
                buf.extend_from_slice(&self.blocks[idx].block.marshal());
            }
            self.table.write_at(&buf, block_offset(run[0]))?;
        }

        for state in self.blocks.values_mut() {
            state.dirty = false;
            state.leased = true;
        }
        self.start_idx = self.start_idx.max(max_idx + 1);
        Ok(self.start_idx)
    }

    /// Drops staged mutations that have not reached the file.
    pub fn rollback(&mut self) {
        self.blocks.clear();
        self.upper_seq = 0;
    }
}
