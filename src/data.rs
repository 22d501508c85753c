use std::collections::HashMap;

use crate::block::Slot;
use crate::entry::ID_SIZE;
use crate::error::Result;
use crate::freelist::FreeBlocks;
use crate::fsys::Fsys;
use crate::DATA_HEADER_SIZE;

/// The untyped message file: id || topic || value runs addressed by the
/// index slots, with a lease allocator recycling holes left by deletions
/// and expiries.
pub struct DataTable {
    pub(crate) file: Fsys,
    pub(crate) lease: FreeBlocks,
}

impl DataTable {
    pub fn open(file: Fsys, min_free_size: u64) -> Result<Self> {
        if file.size() == 0 {
            // Reserve the head of the file so a zero offset never addresses
            // a live message.
            file.extend(DATA_HEADER_SIZE)?;
        }
        Ok(Self {
            file,
            lease: FreeBlocks::new(min_free_size),
        })
    }

    pub fn size(&self) -> u64 {
        self.file.size()
    }

    /// Reads the id and value for a slot; the topic bytes between them are
    /// skipped.
    pub fn read_message(&self, slot: &Slot) -> Result<(Vec<u8>, Vec<u8>)> {
        let off = slot.msg_offset as u64;
        let buf = self.file.slice(off, off + u64::from(slot.m_size()))?;
        let id = buf[..ID_SIZE].to_vec();
        let value = buf[ID_SIZE + slot.topic_size as usize..].to_vec();
        Ok((id, value))
    }

    /// Reads only the topic bytes for a slot.
    pub fn read_topic(&self, slot: &Slot) -> Result<Vec<u8>> {
        let start = slot.msg_offset as u64 + ID_SIZE as u64;
        self.file.slice(start, start + u64::from(slot.topic_size))
    }

    /// Reads only the id bytes for a slot.
    pub fn read_id(&self, slot: &Slot) -> Result<Vec<u8>> {
        let off = slot.msg_offset as u64;
        self.file.slice(off, off + ID_SIZE as u64)
    }

    /// Returns a message region to the lease pool.
    pub fn free(&self, size: u32, off: i64) {
        if off > 0 {
            self.lease.free(off as u64, size);
        }
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }
}

/// Buffers message writes for one sync pass.
///
/// Regions recycled from the lease pool are written through immediately and
/// remembered so a rollback can return them; everything else lands in one
/// append buffer flushed with a single write.
pub struct DataWriter<'a> {
    dt: &'a DataTable,
    buffer: Vec<u8>,
    base: u64,
    leasing: HashMap<u64, u32>,
}

impl<'a> DataWriter<'a> {
    pub fn new(dt: &'a DataTable) -> Self {
        Self {
            base: dt.file.size(),
            dt,
            buffer: Vec::new(),
            leasing: HashMap::new(),
        }
    }

    /// Stages message bytes and returns the offset they will occupy.
    pub fn append(&mut self, data: &[u8]) -> Result<i64> {
        if data.is_empty() {
            return Ok(0);
        }
        if let Some(off) = self.dt.lease.allocate(data.len() as u32) {
            self.dt.file.write_at(data, off)?;
            self.leasing.insert(off, data.len() as u32);
            return Ok(off as i64);
        }
        let off = self.base + self.buffer.len() as u64;
        self.buffer.extend_from_slice(data);
        Ok(off as i64)
    }

    /// Bytes currently buffered for the next flush.
    pub fn buffered(&self) -> u64 {
        self.buffer.len() as u64
    }

    /// Returns a superseded region to the lease pool, but only when it
    /// already sits on disk below the append base. An offset staged by this
    /// pass still belongs to the buffer and must not be handed out.
    pub fn free_settled(&self, off: i64, size: u32) {
        if off > 0 && (off as u64) < self.base {
            self.dt.free(size, off);
        }
    }

    /// Flushes the append buffer. Returns the number of bytes written.
    pub fn write(&mut self) -> Result<usize> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        self.dt.file.write_at(&self.buffer, self.base)?;
        let written = self.buffer.len();
        self.base += written as u64;
        self.buffer.clear();
        self.leasing.clear();
        Ok(written)
    }

    /// Returns leased regions and drops buffered bytes.
    pub fn rollback(&mut self) {
        for (off, size) in self.leasing.drain() {
            self.dt.lease.free(off, size);
        }
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_table() -> (tempfile::TempDir, DataTable) {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let file = Fsys::open(dir.path().join("t.data")).expect("Failed to open file");
        let dt = DataTable::open(file, 0).expect("Failed to open data table");
        (dir, dt)
    }

    fn message(id: u8, topic: &[u8], value: &[u8]) -> Vec<u8> {
        let mut m = vec![id; ID_SIZE];
        m.extend_from_slice(topic);
        m.extend_from_slice(value);
        m
    }

    #[test]
    fn test_write_and_read_message() {
        let (_dir, dt) = temp_table();
        let mut writer = DataWriter::new(&dt);

        let off = writer
            .append(&message(7, b"dev18.t1", b"hello"))
            .expect("Failed to append");
        assert_eq!(off as u64, DATA_HEADER_SIZE);
        writer.write().expect("Failed to write");

        let slot = Slot {
            seq: 1,
            topic_size: 8,
            value_size: 5,
            msg_offset: off,
        };
        let (id, value) = dt.read_message(&slot).expect("Failed to read message");
        assert_eq!(id, vec![7u8; ID_SIZE]);
        assert_eq!(value, b"hello");
        assert_eq!(dt.read_topic(&slot).expect("Failed to read topic"), b"dev18.t1");
        assert_eq!(dt.read_id(&slot).expect("Failed to read id"), vec![7u8; ID_SIZE]);
    }

    #[test]
    fn test_append_reuses_freed_region() {
        let (_dir, dt) = temp_table();

        // 48-byte message: lands in the same lease shard as its offset, so
        // the recycled region is found deterministically.
        let msg = message(1, b"topic123", b"payload-bytes-x-0001");
        let off = {
            let mut writer = DataWriter::new(&dt);
            let off = writer.append(&msg).expect("append");
            writer.write().expect("write");
            off
        };

        dt.free(msg.len() as u32, off);

        let mut writer = DataWriter::new(&dt);
        let off2 = writer.append(&msg).expect("append");
        assert_eq!(off2, off, "freed region is recycled");
        assert_eq!(writer.buffered(), 0, "leased write bypasses the buffer");
    }

    #[test]
    fn test_rollback_returns_leases() {
        let (_dir, dt) = temp_table();

        let msg = message(1, b"topic123", b"payload-bytes-x-0001");
        let off = {
            let mut writer = DataWriter::new(&dt);
            let off = writer.append(&msg).expect("append");
            writer.write().expect("write");
            off
        };
        dt.free(msg.len() as u32, off);

        let mut writer = DataWriter::new(&dt);
        writer.append(&msg).expect("append");
        writer.rollback();

        // The region is free again after rollback.
        let mut writer = DataWriter::new(&dt);
        assert_eq!(writer.append(&msg).expect("append"), off);
    }

    #[test]
    fn test_free_settled_skips_pending_offsets() {
        let (_dir, dt) = temp_table();

        let settled_off = {
            let mut writer = DataWriter::new(&dt);
            let off = writer.append(&[7u8; 48]).expect("append");
            writer.write().expect("write");
            off
        };

        let mut writer = DataWriter::new(&dt);
        let pending_off = writer.append(&[8u8; 48]).expect("append");

        // The pending offset is still buffer-owned and is not pooled.
        writer.free_settled(pending_off, 48);
        assert_eq!(dt.lease.total(), 0);

        // The settled offset from the earlier flush is reclaimed.
        writer.free_settled(settled_off, 48);
        assert_eq!(dt.lease.total(), 48);
    }

    #[test]
    fn test_multiple_appends_single_flush() {
        let (_dir, dt) = temp_table();
        let mut writer = DataWriter::new(&dt);

        let off1 = writer.append(b"aaaa").expect("append");
        let off2 = writer.append(b"bbbb").expect("append");
        assert_eq!(off2, off1 + 4);
        assert_eq!(writer.buffered(), 8);

        writer.write().expect("write");
        assert_eq!(writer.buffered(), 0);
        assert_eq!(
            dt.file.slice(off1 as u64, off1 as u64 + 8).expect("slice"),
            b"aaaabbbb"
        );
    }
}
