use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use fs4::fs_std::FileExt;
use tracing::{debug, warn};

const LOCK_FILE: &str = "daemon.lock";

/// Exclusive claim on an application directory. Only one daemon may own the checkpoints and the
/// socket of a directory; the claim is released when the lock is dropped or the process dies.
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Couldn't open lock file {path:?}"))?;
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if is_contended(&e) => bail!("Another daemon is already running for {dir:?}"),
            Err(e) => return Err(e).with_context(|| format!("Couldn't lock {path:?}")),
        }

        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;
        debug!("Acquired instance lock {path:?}");
        Ok(Self { file, path })
    }
}

/// Whether a failed lock attempt means another process holds the lock.
fn is_contended(e: &io::Error) -> bool {
    // ERROR_LOCK_VIOLATION
    #[cfg(windows)]
    if e.raw_os_error() == Some(33) {
        return true;
    }
    e.kind() == ErrorKind::WouldBlock
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Couldn't release instance lock {:?} {e:?}", self.path);
        }
    }
}
