//! Write-ahead log of committed batches.
//!
//! Every tiny batch becomes one log group, fsynced before the commit is
//! acknowledged. The memtable is the read path for logged entries; the log
//! is only replayed after an unclean shutdown.
//!
//! # File Format
//!
//! ```text
//! +-------------------+
//! | Header (64 bytes) |
//! +-------------------+
//! | Group 1           |
//! +-------------------+
//! | Group 2           |
//! +-------------------+
//! | ...               |
//! +-------------------+
//! ```
//!
//! ## Group Format
//!
//! ```text
//! +-----------+-----------+---------+---------------------+-----------+
//! |len:u32    |log_seq:u64|count:u32| entries             |crc32:u32  |
//! +-----------+-----------+---------+---------------------+-----------+
//! ```
//!
//! Each entry inside a group is itself length-prefixed (`u32 len || bytes`).
//! Multi-byte integers are big-endian; the CRC32 covers everything between
//! the length prefix and the checksum. A short or corrupt tail is treated
//! as the end of the log and trimmed at open.
//!
//! Groups at or below the applied watermark in the header are dead weight;
//! once every group is applied and the file has outgrown its target size,
//! the log is reset to its header and the space is reused.

pub mod header;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use header::{Header, HEADER_SIZE};

use crate::error::{Error, Result};

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub struct Wal {
    file: File,
    writer: Mutex<BufWriter<File>>,
    header: RwLock<Header>,
    next_log_seq: AtomicU64,
    target_size: u64,
    path: PathBuf,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal").field("path", &self.path).finish()
    }
}

impl Wal {
    pub fn open<P: AsRef<Path>>(path: P, target_size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let header = if file.metadata()?.len() == 0 {
            let h = Header::new();
            let mut f = file.try_clone()?;
            f.write_all(&h.encode())?;
            f.sync_all()?;
            h
        } else {
            let mut buf = [0u8; HEADER_SIZE];
            let mut reader = file.try_clone()?;
            reader.read_exact(&mut buf)?;
            Header::decode(&buf)?
        };

        // Find the valid end of the log and the highest group seq; a torn
        // tail from a crash is trimmed here.
        let (valid_end, max_seq) = scan_extent(&file)?;
        if valid_end < file.metadata()?.len() {
            file.set_len(valid_end)?;
        }

        let mut writer = BufWriter::new(file.try_clone()?);
        writer.seek(SeekFrom::Start(valid_end))?;

        Ok(Self {
            file,
            writer: Mutex::new(writer),
            header: RwLock::new(header),
            next_log_seq: AtomicU64::new(max_seq),
            target_size,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.file.metadata().map_or(0, |meta| meta.len())
    }

    /// Allocates the next group seq.
    pub fn next_seq(&self) -> u64 {
        self.next_log_seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn applied_upto(&self) -> u64 {
        self.header.read().unwrap().applied_upto
    }

    /// Starts buffering a commit group.
    pub fn new_writer(&self) -> LogWriter<'_> {
        LogWriter {
            wal: self,
            entries: Vec::new(),
        }
    }

    /// Lists the group seqs recorded but not yet marked applied.
    pub fn scan(&self) -> Result<Vec<u64>> {
        let applied = self.applied_upto();
        let mut seqs = Vec::new();
        self.replay(|log_seq, _| {
            if log_seq > applied && !seqs.contains(&log_seq) {
                seqs.push(log_seq);
            }
            Ok(())
        })?;
        Ok(seqs)
    }

    /// Calls `f` for every entry of every un-applied group, in log order.
    pub fn replay<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(u64, &[u8]) -> Result<()>,
    {
        let applied = self.applied_upto();
        let mut reader = BufReader::new(self.file.try_clone()?);
        reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        while let Some((log_seq, entries)) = read_group(&mut reader)? {
            if log_seq <= applied {
                continue;
            }
            for entry in &entries {
                f(log_seq, entry)?;
            }
        }
        Ok(())
    }

    /// Advances the applied watermark. When every recorded group is applied
    /// and the file has outgrown its target size, the log space is reused.
    pub fn signal_log_applied(&self, log_seq: u64) -> Result<()> {
        let mut writer = self.writer.lock()?;
        let mut header = self.header.write().unwrap();
        if log_seq <= header.applied_upto {
            return Ok(());
        }
        header.applied_upto = log_seq;

        let all_applied = header.applied_upto >= self.next_log_seq.load(Ordering::Acquire);
        if all_applied && self.size() > self.target_size {
            writer.flush()?;
            self.file.set_len(HEADER_SIZE as u64)?;
            writer.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        }

        let mut f = self.file.try_clone()?;
        f.seek(SeekFrom::Start(0))?;
        f.write_all(&header.encode())?;
        f.sync_data()?;
        Ok(())
    }
}

/// Buffers one commit group until `signal_init_write` flushes and fsyncs it.
pub struct LogWriter<'a> {
    wal: &'a Wal,
    entries: Vec<Vec<u8>>,
}

impl LogWriter<'_> {
    pub fn append(&mut self, entry: &[u8]) -> Result<()> {
        self.entries.push(entry.to_vec());
        Ok(())
    }

    /// Writes the group under `log_seq` and makes it durable. The commit is
    /// not acknowledged to callers until this returns.
    pub fn signal_init_write(self, log_seq: u64) -> Result<()> {
        let mut payload = Vec::new();
        payload.write_u64::<BigEndian>(log_seq)?;
        payload.write_u32::<BigEndian>(self.entries.len() as u32)?;
        for entry in &self.entries {
            payload.write_u32::<BigEndian>(entry.len() as u32)?;
            payload.extend_from_slice(entry);
        }
        let checksum = CRC32.checksum(&payload);

        let mut writer = self.wal.writer.lock()?;
        writer.write_u32::<BigEndian>(payload.len() as u32)?;
        writer.write_all(&payload)?;
        writer.write_u32::<BigEndian>(checksum)?;
        writer.flush()?;
        self.wal.file.sync_data()?;
        Ok(())
    }
}

/// Reads one group; `Ok(None)` is a clean end of log.
fn read_group<R: Read>(reader: &mut R) -> Result<Option<(u64, Vec<Vec<u8>>)>> {
    let payload_len = match reader.read_u32::<BigEndian>() {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if payload_len < 12 {
        return Err(crate::errcorrupt!("log group too short: {payload_len}"));
    }

    let mut payload = vec![0u8; payload_len];
    if reader.read_exact(&mut payload).is_err() {
        return Err(Error::Corrupted("torn log group".to_string()));
    }
    let stored_crc = match reader.read_u32::<BigEndian>() {
        Ok(crc) => crc,
        Err(_) => return Err(Error::Corrupted("torn log checksum".to_string())),
    };
    if CRC32.checksum(&payload) != stored_crc {
        return Err(Error::Corrupted("log checksum mismatch".to_string()));
    }

    let log_seq = BigEndian::read_u64(&payload[..8]);
    let count = BigEndian::read_u32(&payload[8..12]) as usize;
    let mut entries = Vec::with_capacity(count);
    let mut off = 12;
    for _ in 0..count {
        if off + 4 > payload.len() {
            return Err(crate::errcorrupt!("log group truncated at entry"));
        }
        let len = BigEndian::read_u32(&payload[off..off + 4]) as usize;
        off += 4;
        if off + len > payload.len() {
            return Err(crate::errcorrupt!("log entry overruns group"));
        }
        entries.push(payload[off..off + len].to_vec());
        off += len;
    }
    Ok(Some((log_seq, entries)))
}

/// Walks the log from the header, returning the offset after the last whole
/// group and the highest group seq seen.
fn scan_extent(file: &File) -> Result<(u64, u64)> {
    let mut reader = BufReader::new(file.try_clone()?);
    let len = file.metadata()?.len();
    if len < HEADER_SIZE as u64 {
        return Ok((HEADER_SIZE as u64, 0));
    }
    reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;

    let mut valid_end = HEADER_SIZE as u64;
    let mut max_seq = 0u64;
    loop {
        match read_group(&mut reader) {
            Ok(Some((log_seq, entries))) => {
                max_seq = max_seq.max(log_seq);
                let group_len: usize =
                    4 + 12 + entries.iter().map(|e| 4 + e.len()).sum::<usize>() + 4;
                valid_end += group_len as u64;
            }
            // A torn or corrupt tail ends the log.
            Ok(None) | Err(_) => break,
        }
    }
    Ok((valid_end, max_seq))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_wal(target: u64) -> (tempfile::TempDir, Wal) {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let wal = Wal::open(dir.path().join("t.log"), target).expect("Failed to open WAL");
        (dir, wal)
    }

    fn commit_group(wal: &Wal, entries: &[&[u8]]) -> u64 {
        let mut writer = wal.new_writer();
        for e in entries {
            writer.append(e).expect("Failed to append");
        }
        let seq = wal.next_seq();
        writer.signal_init_write(seq).expect("Failed to commit group");
        seq
    }

    #[test]
    fn test_commit_and_scan() {
        let (_dir, wal) = temp_wal(1 << 20);
        let s1 = commit_group(&wal, &[b"one", b"two"]);
        let s2 = commit_group(&wal, &[b"three"]);

        assert_eq!(wal.scan().expect("Failed to scan"), vec![s1, s2]);

        wal.signal_log_applied(s1).expect("Failed to signal");
        assert_eq!(wal.scan().expect("Failed to scan"), vec![s2]);
    }

    #[test]
    fn test_replay_yields_entries_in_order() {
        let (_dir, wal) = temp_wal(1 << 20);
        commit_group(&wal, &[b"a", b"b"]);
        commit_group(&wal, &[b"c"]);

        let mut seen = Vec::new();
        wal.replay(|_, entry| {
            seen.push(entry.to_vec());
            Ok(())
        })
        .expect("Failed to replay");
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_reopen_preserves_unapplied() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("t.log");

        let (s1, s2) = {
            let wal = Wal::open(&path, 1 << 20).expect("Failed to open WAL");
            let s1 = commit_group(&wal, &[b"alpha"]);
            let s2 = commit_group(&wal, &[b"beta"]);
            wal.signal_log_applied(s1).expect("Failed to signal");
            (s1, s2)
        };
        let _ = s1;

        let wal = Wal::open(&path, 1 << 20).expect("Failed to reopen WAL");
        assert_eq!(wal.scan().expect("Failed to scan"), vec![s2]);
        // Seqs continue past the recorded maximum.
        assert_eq!(wal.next_seq(), s2 + 1);
    }

    #[test]
    fn test_torn_tail_trimmed_on_open() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("t.log");

        {
            let wal = Wal::open(&path, 1 << 20).expect("Failed to open WAL");
            commit_group(&wal, &[b"whole"]);
            // Simulate a torn write: a length prefix with no body.
            let mut writer = wal.writer.lock().unwrap();
            writer.write_u32::<BigEndian>(1000).expect("write");
            writer.flush().expect("flush");
        }

        let wal = Wal::open(&path, 1 << 20).expect("Failed to reopen WAL");
        assert_eq!(wal.scan().expect("Failed to scan").len(), 1);

        // The log accepts new groups after the trim.
        let s = commit_group(&wal, &[b"after"]);
        assert!(wal.scan().expect("Failed to scan").contains(&s));
    }

    #[test]
    fn test_space_reused_past_target_size() {
        let (_dir, wal) = temp_wal(256);
        let mut last = 0;
        for _ in 0..10 {
            last = commit_group(&wal, &[&[0u8; 64]]);
        }
        assert!(wal.size() > 256);

        wal.signal_log_applied(last).expect("Failed to signal");
        assert_eq!(wal.size(), HEADER_SIZE as u64, "fully applied log resets");
        assert!(wal.scan().expect("Failed to scan").is_empty());

        // New groups land after the reset and scan correctly.
        let s = commit_group(&wal, &[b"fresh"]);
        assert_eq!(wal.scan().expect("Failed to scan"), vec![s]);
    }
}
