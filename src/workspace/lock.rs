//! Filesystem advisory locks
//!
//! One lockfile per serialized resource (registry spec, worktree slot). Locks
//! are OS advisory locks via `fs2`, so they are released by the kernel even if
//! the process dies. The lockfile body records the current holder for
//! diagnostics; it is informational only, the flock is the source of truth.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::{NecroError, Result};

/// An acquired advisory lock. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Try to acquire the lock once, without waiting.
    pub fn try_acquire(path: &Path, holder: &str) -> Result<Option<Self>> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                // Record the holder for get_slot_status diagnostics.
                file.set_len(0)?;
                file.seek(SeekFrom::Start(0))?;
                file.write_all(holder.as_bytes())?;
                file.flush()?;
                Ok(Some(Self {
                    file,
                    path: path.to_path_buf(),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Acquire the lock, retrying until `timeout` elapses.
    pub fn acquire(
        path: &Path,
        holder: &str,
        timeout: Duration,
        retry_interval: Duration,
    ) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(lock) = Self::try_acquire(path, holder)? {
                return Ok(lock);
            }
            if Instant::now() >= deadline {
                return Err(NecroError::SlotLockTimeout {
                    slot_id: path.display().to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            std::thread::sleep(retry_interval.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Read the holder recorded in a lockfile, if any. Best effort: an empty or
/// missing file means nobody holds the lock (or the holder crashed before
/// writing).
pub fn read_holder(path: &Path) -> Option<String> {
    let mut file = File::open(path).ok()?;
    let mut holder = String::new();
    file.read_to_string(&mut holder).ok()?;
    let holder = holder.trim();
    if holder.is_empty() {
        None
    } else {
        Some(holder.to_string())
    }
}
