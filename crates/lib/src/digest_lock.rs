//! File-based per-digest locking for builds of the same payload.
//!
//! Two invocations packaging the same payload target the same workspace and
//! the same promoted artifact path. The lock file `<work_root>/<digest>.lock`
//! sits beside the workspace (which is deleted after promotion) and is held
//! from workspace creation until the artifact is in place.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::util::hash::ContentHash;

/// What to do when another process already holds the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockWait {
  /// Block until the holder releases it.
  #[default]
  Block,
  /// Return [`DigestLockError::Contention`] immediately.
  FailFast,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockMetadata {
  pub version: u32,
  pub pid: u32,
  pub started_at_unix: u64,
  pub command: String,
  pub digest: String,
}

#[derive(Debug, Error)]
pub enum DigestLockError {
  #[error(
    "A build of this payload is already running: {command} (PID {pid}, started {started_at})\n\
             If you're sure no lockwrap process is running, remove the lock file:\n  {lock_path}"
  )]
  Contention {
    command: String,
    pid: u32,
    started_at: String,
    lock_path: PathBuf,
  },

  #[error(
    "A build of this payload is already running (could not read lock metadata)\n\
             If you're sure no lockwrap process is running, remove the lock file:\n  {lock_path}"
  )]
  ContentionUnknown { lock_path: PathBuf },

  #[error("Failed to create lock directory: {0}")]
  CreateDir(#[source] io::Error),

  #[error("Failed to open lock file: {0}")]
  OpenFile(#[source] io::Error),

  #[error("Failed to write lock metadata: {0}")]
  WriteMetadata(#[source] io::Error),

  #[error("Failed to acquire lock: {0}")]
  LockFailed(#[source] io::Error),
}

/// An exclusive lock on one digest, released when dropped.
#[derive(Debug)]
pub struct DigestLock {
  _file: File,
  lock_path: PathBuf,
}

impl DigestLock {
  pub fn lock_path_for(root: &Path, digest: &ContentHash) -> PathBuf {
    root.join(format!("{}.lock", digest.as_str()))
  }

  /// Acquire the lock for `digest`, waiting or failing according to `wait`.
  ///
  /// With [`LockWait::Block`] this blocks the calling thread; async callers
  /// run it on a blocking task.
  pub fn acquire(root: &Path, digest: &ContentHash, command: &str, wait: LockWait) -> Result<Self, DigestLockError> {
    let lock_path = Self::lock_path_for(root, digest);

    if !root.exists() {
      std::fs::create_dir_all(root).map_err(DigestLockError::CreateDir)?;
    }

    // A finished build unlinks the lock file while still holding it, so a
    // lock taken on a file that is no longer at `lock_path` is stale.
    let file = loop {
      let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(DigestLockError::OpenFile)?;

      if let Err(err) = try_lock(&file) {
        if err.kind() != io::ErrorKind::WouldBlock {
          return Err(DigestLockError::LockFailed(err));
        }
        let contention = Self::read_contention_error(&lock_path);
        if wait == LockWait::FailFast {
          return Err(contention);
        }
        info!(digest = %digest, holder = %contention, "waiting for concurrent build");
        lock_blocking(&file).map_err(DigestLockError::LockFailed)?;
      }

      if is_current(&file, &lock_path).map_err(DigestLockError::LockFailed)? {
        break file;
      }
      debug!(path = ?lock_path, "lock file was removed while waiting, retrying");
    };

    Self::write_metadata(&file, command, digest)?;

    Ok(DigestLock { _file: file, lock_path })
  }

  /// Delete the lock file, then release the lock.
  ///
  /// Waiters holding the old file notice it is gone and reopen the path. On
  /// Windows the file stays in place.
  pub fn remove(self) {
    #[cfg(unix)]
    if let Err(e) = std::fs::remove_file(&self.lock_path) {
      debug!(path = ?self.lock_path, error = %e, "failed to remove lock file");
    }
  }

  /// Reads the lock metadata from the held file handle.
  ///
  /// Opening a second handle would fail on Windows while the lock is held.
  pub fn read_metadata(&self) -> io::Result<LockMetadata> {
    use std::io::{Seek, SeekFrom};

    let mut file = &self._file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  fn write_metadata(file: &File, command: &str, digest: &ContentHash) -> Result<(), DigestLockError> {
    let metadata = LockMetadata {
      version: 1,
      pid: std::process::id(),
      started_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
      command: command.to_string(),
      digest: digest.to_string(),
    };

    file.set_len(0).map_err(DigestLockError::WriteMetadata)?;
    let mut writer = io::BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &metadata)
      .map_err(|e| DigestLockError::WriteMetadata(io::Error::other(e)))?;
    writer.flush().map_err(DigestLockError::WriteMetadata)?;

    Ok(())
  }

  fn read_contention_error(lock_path: &Path) -> DigestLockError {
    if let Ok(mut file) = File::open(lock_path) {
      let mut contents = String::new();
      if file.read_to_string(&mut contents).is_ok()
        && let Ok(metadata) = serde_json::from_str::<LockMetadata>(&contents)
      {
        let started_at = format!("Unix timestamp {}", metadata.started_at_unix);

        return DigestLockError::Contention {
          command: metadata.command,
          pid: metadata.pid,
          started_at,
          lock_path: lock_path.to_path_buf(),
        };
      }
    }

    DigestLockError::ContentionUnknown {
      lock_path: lock_path.to_path_buf(),
    }
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }
}

/// Whether `path` still names the file behind `file`.
#[cfg(unix)]
fn is_current(file: &File, path: &Path) -> io::Result<bool> {
  use std::os::unix::fs::MetadataExt;

  let held = file.metadata()?;
  match std::fs::metadata(path) {
    Ok(on_disk) => Ok(held.dev() == on_disk.dev() && held.ino() == on_disk.ino()),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
    Err(e) => Err(e),
  }
}

#[cfg(windows)]
fn is_current(_file: &File, _path: &Path) -> io::Result<bool> {
  Ok(true)
}

#[cfg(unix)]
fn try_lock(file: &File) -> io::Result<()> {
  flock(file, rustix::fs::FlockOperation::NonBlockingLockExclusive)
}

#[cfg(unix)]
fn lock_blocking(file: &File) -> io::Result<()> {
  flock(file, rustix::fs::FlockOperation::LockExclusive)
}

#[cfg(unix)]
fn flock(file: &File, operation: rustix::fs::FlockOperation) -> io::Result<()> {
  use std::os::unix::io::AsFd;

  rustix::fs::flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn try_lock(file: &File) -> io::Result<()> {
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

  lock_file_ex(file, LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK).map_err(|e| {
    // ERROR_LOCK_VIOLATION
    if e.raw_os_error() == Some(33) {
      io::Error::from(io::ErrorKind::WouldBlock)
    } else {
      e
    }
  })
}

#[cfg(windows)]
fn lock_blocking(file: &File) -> io::Result<()> {
  use windows_sys::Win32::Storage::FileSystem::LOCKFILE_EXCLUSIVE_LOCK;

  lock_file_ex(file, LOCKFILE_EXCLUSIVE_LOCK)
}

#[cfg(windows)]
fn lock_file_ex(file: &File, flags: u32) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::LockFileEx;

  let handle = file.as_raw_handle() as HANDLE;

  // SAFETY: OVERLAPPED is a plain data struct that is valid when zero-initialized.
  // LockFileEx is safe to call with a valid file handle and zeroed OVERLAPPED.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(handle, flags, 0, 1, 0, &mut overlapped)
  };

  if result == 0 {
    Err(io::Error::last_os_error())
  } else {
    Ok(())
  }
}
