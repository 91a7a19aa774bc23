//! Single-instance exclusion: an advisory `flock` on `supervisor.lock` plus
//! a liveness record (`supervisor.pid`) naming the holder.
//!
//! The record is only a cache. Whether its pid is alive is always probed
//! before it is trusted, so a record left behind by a hard crash never
//! blocks a later start.

use crate::error::{SupervisorError, SupervisorResult};
use crate::fsutil::{atomic_write_bytes, ensure_dir};
use anyhow::Context;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const LOCK_FILE_NAME: &str = "supervisor.lock";
pub const LIVENESS_FILE_NAME: &str = "supervisor.pid";

pub fn lock_path(out_dir: &Path) -> PathBuf {
    out_dir.join(LOCK_FILE_NAME)
}

pub fn liveness_path(out_dir: &Path) -> PathBuf {
    out_dir.join(LIVENESS_FILE_NAME)
}

/// What the liveness record currently says.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Holder {
    Absent,
    Live(u32),
    /// Record exists but its pid is gone (or the file is unreadable).
    Stale(Option<u32>),
}

pub fn read_liveness(out_dir: &Path) -> Holder {
    let path = liveness_path(out_dir);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Holder::Absent,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable liveness record");
            return Holder::Stale(None);
        }
    };
    match raw.trim().parse::<u32>() {
        Ok(pid) if is_pid_alive(pid) => Holder::Live(pid),
        Ok(pid) => Holder::Stale(Some(pid)),
        Err(_) => Holder::Stale(None),
    }
}

pub fn remove_liveness(out_dir: &Path) {
    let path = liveness_path(out_dir);
    match fs::remove_file(&path) {
        Ok(()) => debug!(path = %path.display(), "removed liveness record"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove liveness record"),
    }
}

/// Held for the whole running lifetime. Dropping it removes the liveness
/// record and releases the lock, on every exit path that unwinds.
///
/// `supervisor.lock` itself stays on disk. Unlinking it would let a contender
/// that already opened the old inode and a later starter that creates a new
/// one both hold an exclusive lock.
#[derive(Debug)]
pub struct InstanceLock {
    out_dir: PathBuf,
    file: Option<File>,
}

impl InstanceLock {
    /// Claim the identity rooted at `out_dir` for the current process.
    ///
    /// Refuses when a live holder is recorded or the lock is held. Nothing is
    /// written unless the lock was obtained.
    pub fn acquire(out_dir: &Path) -> SupervisorResult<Self> {
        let me = std::process::id();
        match read_liveness(out_dir) {
            Holder::Live(pid) if pid != me => {
                return Err(SupervisorError::not_allowed(format!(
                    "supervisor already running as pid {}",
                    pid
                )));
            }
            Holder::Stale(pid) => {
                info!(stale_pid = ?pid, "discarding stale liveness record");
                remove_liveness(out_dir);
            }
            Holder::Live(_) | Holder::Absent => {}
        }

        ensure_dir(out_dir)?;
        let path = lock_path(out_dir);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(e) if is_contended(&e) => {
                return Err(SupervisorError::not_allowed(format!(
                    "lock {} is held by another instance",
                    path.display()
                )));
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("failed to lock {}", path.display()))
                    .into())
            }
        }

        let lock = Self {
            out_dir: out_dir.to_path_buf(),
            file: Some(file),
        };
        atomic_write_bytes(&liveness_path(out_dir), format!("{}\n", me).as_bytes())
            .context("failed to write liveness record")?;
        info!(pid = me, out_dir = %out_dir.display(), "instance lock acquired");
        Ok(lock)
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        remove_liveness(&self.out_dir);
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
        }
        debug!(out_dir = %self.out_dir.display(), "instance lock released");
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Probe with `kill(pid, 0)`. EPERM means the process exists but belongs to
/// someone else, which still counts as alive.
pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let Ok(pid_i32) = i32::try_from(pid) else {
        return false;
    };
    #[cfg(unix)]
    {
        // SAFETY: signal 0 performs the permission and existence checks only.
        let result = unsafe { libc::kill(pid_i32, 0) };
        if result == 0 {
            return true;
        }
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid_i32;
        true
    }
}
