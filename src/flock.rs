use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Exclusive lock file guarding a database directory.
///
/// The lock file doubles as the unclean-shutdown marker: a clean close
/// removes it, so finding one at open time means the previous process died
/// with the lock held and the log must be replayed.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquires the lock, creating the file if needed. Returns the lock and
    /// whether the file already existed (i.e. the previous shutdown was not
    /// clean).
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<(Self, bool)> {
        let path = path.as_ref().to_path_buf();
        let existed = path.exists();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Self::try_lock(&file)?;

        // Record the owning process for debugging.
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok((Self { _file: file, path }, existed))
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        Ok(())
    }

    /// Releases the lock and removes the marker file. Called on clean close;
    /// dropping without unlocking leaves the marker in place so the next
    /// open runs recovery.
    pub fn unlock(self) -> io::Result<()> {
        fs::remove_file(&self.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_and_unlock() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let lock_path = dir.path().join("ember.lock");

        let (lock, existed) = FileLock::lock(&lock_path).expect("Failed to acquire lock");
        assert!(!existed);
        assert!(lock_path.exists());

        let content = fs::read_to_string(&lock_path).expect("Failed to read lock file");
        assert!(content.contains(&std::process::id().to_string()));

        lock.unlock().expect("Failed to release lock");
        assert!(!lock_path.exists());
    }

    #[test]
    fn test_double_lock() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let lock_path = dir.path().join("ember.lock");

        let (_lock1, _) = FileLock::lock(&lock_path).expect("Failed to acquire first lock");
        assert!(FileLock::lock(&lock_path).is_err());
    }

    #[test]
    fn test_unclean_shutdown_detected() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let lock_path = dir.path().join("ember.lock");

        {
            // Simulate a crash: the lock goes out of scope without unlock(),
            // leaving the marker file behind.
            let (_lock, existed) = FileLock::lock(&lock_path).expect("Failed to acquire lock");
            assert!(!existed);
        }

        let (lock, existed) = FileLock::lock(&lock_path).expect("Failed to reacquire lock");
        assert!(existed, "stale lock file should flag recovery");
        lock.unlock().expect("Failed to release lock");
    }
}
