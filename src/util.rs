//! Suite coordination helpers
//!
//! Random-port reservation for tests that need host ports, and a
//! directory-based lock for serializing sections across concurrently
//! running suites.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::{Error, Result};

// Port reservation is racy between processes, but within one suite process
// a lock keeps two callers from being handed the same port.
static PORT_LOCK: Mutex<()> = Mutex::new(());

/// Reserve a port that is not currently in use and hand it to `f`
pub fn with_random_port<T>(f: impl FnOnce(u16) -> T) -> Result<T> {
    with_random_ports(1, |ports| f(ports[0]))
}

/// Reserve a set of distinct ports that are not currently in use and hand
/// them to `f`. The listeners are held until all ports are collected so the
/// same port is never produced twice.
pub fn with_random_ports<T>(count: usize, f: impl FnOnce(&[u16]) -> T) -> Result<T> {
    let _guard = PORT_LOCK.lock().expect("port lock poisoned");

    let mut listeners = Vec::with_capacity(count);
    let mut ports = Vec::with_capacity(count);
    for _ in 0..count {
        let listener =
            TcpListener::bind("127.0.0.1:0").map_err(|e| Error::io("127.0.0.1:0", e))?;
        let port = listener
            .local_addr()
            .map_err(|e| Error::io("127.0.0.1:0", e))?
            .port();
        listeners.push(listener);
        ports.push(port);
    }
    drop(listeners);

    Ok(f(&ports))
}

/// A lock shared by multiple concurrently running suites.
///
/// The lock is a directory whose atomic creation marks ownership. It must
/// not exist before any suite executes, its parent must exist, and paths are
/// given relative to a common root all suites agree on.
#[derive(Clone, Debug)]
pub struct MultiSuiteLock {
    /// Lock directory, relative to the common root
    pub lock_dir: PathBuf,
}

fn try_lock(dir: &Path) -> Result<bool> {
    match std::fs::create_dir(dir) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(Error::io(dir.display().to_string(), e)),
    }
}

fn unlock(dir: &Path) -> Result<()> {
    std::fs::remove_dir(dir).map_err(|e| Error::io(dir.display().to_string(), e))
}

/// Walk back up from `offset` (the suite's path below the common root) and
/// then down into `then`
fn reverse_path(offset: &Path, then: &Path) -> PathBuf {
    let mut path = PathBuf::new();
    for _ in offset.components() {
        path.push("..");
    }
    path.join(then)
}

impl MultiSuiteLock {
    /// A lock rooted at `lock_dir` relative to the common root
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
        }
    }

    fn full_lock_path(&self, offset: &Path) -> PathBuf {
        reverse_path(offset, &self.lock_dir)
    }

    /// Run `f` while holding the lock, polling until it can be taken.
    ///
    /// `offset` is the relative path from the common root to the calling
    /// suite's directory.
    pub async fn with_lock<T, F, Fut>(&self, offset: &Path, poll: Duration, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let lock_path = self.full_lock_path(offset);
        loop {
            if try_lock(&lock_path)? {
                break;
            }
            tokio::time::sleep(poll).await;
        }
        let result = f().await;
        let unlock_result = unlock(&lock_path);
        match result {
            Ok(value) => unlock_result.map(|_| value),
            Err(e) => Err(e),
        }
    }

    /// Attempt to take the lock without waiting; only the suite that wins
    /// runs `f`, which receives an unlock callable to release the lock when
    /// the protected work is truly finished.
    ///
    /// Returns whether this suite was the one that ran.
    pub async fn once<F, Fut>(&self, offset: &Path, f: F) -> Result<bool>
    where
        F: FnOnce(Box<dyn FnOnce() -> Result<()> + Send>) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let lock_path = self.full_lock_path(offset);
        if !try_lock(&lock_path)? {
            return Ok(false);
        }
        let release = Box::new(move || unlock(&lock_path));
        f(release).await?;
        Ok(true)
    }
}
