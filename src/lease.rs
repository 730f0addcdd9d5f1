//! Cross-process leases
//!
//! Every CLI invocation is its own process sharing one database and one
//! engine. Operations that must not interleave across processes hold an
//! exclusive advisory lock on a file in the lease directory, on top of the
//! in-process per-instance mutex.
//!
//! Lock order: an instance lease before the ports lease. The proxy lease is
//! only taken by the proxy coordinator and never while waiting on another.

use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Guards host and listen port assignments
pub const PORTS_LEASE: &str = "ports";
/// Guards proxy regeneration
pub const PROXY_LEASE: &str = "proxy";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub fn instance_lease(id: &str) -> String {
    format!("instance-{}", id)
}

/// An acquired lease, released when dropped
#[derive(Debug)]
pub struct Lease {
    _file: File,
}

/// Directory holding one lock file per lease name
#[derive(Debug, Clone)]
pub struct LeaseDir {
    dir: PathBuf,
}

impl LeaseDir {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Take the lease if nobody holds it
    pub fn try_acquire(&self, name: &str) -> Result<Option<Lease>> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.dir.join(format!("{}.lock", name)))?;

        if lock_exclusive(&file)? {
            Ok(Some(Lease { _file: file }))
        } else {
            Ok(None)
        }
    }

    /// Wait until the lease is free and take it
    pub async fn acquire(&self, name: &str) -> Result<Lease> {
        let mut waiting = false;
        loop {
            if let Some(lease) = self.try_acquire(name)? {
                return Ok(lease);
            }
            if !waiting {
                debug!(lease = name, "Lease held elsewhere, waiting");
                waiting = true;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Non-blocking exclusive `flock`; `false` when another holder has it
#[cfg(unix)]
fn lock_exclusive(file: &File) -> Result<bool> {
    use std::os::unix::io::AsRawFd;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err.into())
    }
}

// No advisory locking; only the in-process mutexes apply
#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> Result<bool> {
    Ok(true)
}
