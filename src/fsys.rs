use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(unix)]
use std::os::unix::fs::FileExt;

use crate::error::{Error, Result};

/// Positioned file wrapper shared by the index, data, window and log files.
///
/// All reads and writes are offset-addressed (`pread`/`pwrite`), so a single
/// handle serves concurrent readers and the single writer without seeking.
/// The apparent size is tracked locally; `extend` reserves a region at the
/// current end and returns its offset.
pub struct Fsys {
    file: File,
    path: PathBuf,
    size: AtomicU64,
}

impl Fsys {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file,
            path,
            size: AtomicU64::new(size),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Reserves `len` bytes at the end of the file and returns the offset of
    /// the reserved region.
    pub fn extend(&self, len: u64) -> Result<u64> {
        let off = self.size.fetch_add(len, Ordering::AcqRel);
        self.file.set_len(off + len)?;
        Ok(off)
    }

    pub fn truncate(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.size.store(len, Ordering::Release);
        Ok(())
    }

    pub fn read_at(&self, buf: &mut [u8], off: u64) -> Result<()> {
        self.file
            .read_exact_at(buf, off)
            .map_err(|e| Error::Io(format!("read at {off}: {e}")))
    }

    /// Reads `[off, end)` into a fresh buffer. The caller is expected to
    /// bound `end` by `size()`; reading past the end is an error here.
    pub fn slice(&self, off: u64, end: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; (end - off) as usize];
        self.read_at(&mut buf, off)?;
        Ok(buf)
    }

    pub fn write_at(&self, data: &[u8], off: u64) -> Result<()> {
        self.file.write_all_at(data, off)?;
        self.size.fetch_max(off + data.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    /// Appends at the current end and returns the offset written to.
    pub fn append(&self, data: &[u8]) -> Result<u64> {
        let off = self.size.fetch_add(data.len() as u64, Ordering::AcqRel);
        self.file.write_all_at(data, off)?;
        Ok(off)
    }

    pub fn sync(&self) -> Result<()> {
        Ok(self.file.sync_data()?)
    }

    pub fn sync_all(&self) -> Result<()> {
        Ok(self.file.sync_all()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_fsys(name: &str) -> (tempfile::TempDir, Fsys) {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let f = Fsys::open(dir.path().join(name)).expect("Failed to open file");
        (dir, f)
    }

    #[test]
    fn test_extend_and_write() {
        let (_dir, f) = temp_fsys("t.data");
        assert_eq!(f.size(), 0);

        let off = f.extend(64).expect("Failed to extend");
        assert_eq!(off, 0);
        assert_eq!(f.size(), 64);

        f.write_at(b"hello", off).expect("Failed to write");
        let buf = f.slice(0, 5).expect("Failed to slice");
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_append_tracks_size() {
        let (_dir, f) = temp_fsys("t.data");
        let a = f.append(b"aaaa").expect("append");
        let b = f.append(b"bb").expect("append");
        assert_eq!(a, 0);
        assert_eq!(b, 4);
        assert_eq!(f.size(), 6);
    }

    #[test]
    fn test_slice_past_end_errors() {
        let (_dir, f) = temp_fsys("t.data");
        f.append(b"abc").expect("append");
        assert!(f.slice(0, 16).is_err());
    }

    #[test]
    fn test_truncate() {
        let (_dir, f) = temp_fsys("t.data");
        f.append(b"abcdef").expect("append");
        f.truncate(2).expect("truncate");
        assert_eq!(f.size(), 2);
        assert_eq!(f.slice(0, 2).expect("slice"), b"ab");
    }
}
