//! File-based mutual exclusion for the encryption and volume-setup workflows.
//!
//! The lock file records `<pid>;<hostname>` of its owner and is held through an
//! exclusive advisory `flock`. Acquisition never blocks: a contended lock fails
//! immediately with [`LuksError::LockHeld`]. The guard deletes the file when it
//! is released or dropped, including during unwinding.

use crate::error::{LuksError, LuksResult};
use fs2::FileExt;
use log::{debug, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

const MAX_ATTEMPTS: u32 = 8;

/// Owned lock on a workflow domain.
#[derive(Debug)]
pub struct ProcessLock {
    file: Option<File>,
    path: PathBuf,
}

impl ProcessLock {
    /// Take the lock at `path` or report who holds it.
    pub fn acquire<P: AsRef<Path>>(path: P) -> LuksResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut attempts = 0;
        let mut file = loop {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;

            if let Err(err) = file.try_lock_exclusive() {
                if err.kind() != fs2::lock_contended_error().kind() {
                    return Err(err.into());
                }
                let mut contents = String::new();
                file.read_to_string(&mut contents).ok();
                return Err(held_by(path, &contents));
            }

            // A releasing owner unlinks the file before unlocking it, so the
            // inode we locked may no longer be the one at `path`.
            if is_linked_at(&file, &path)? {
                break file;
            }
            attempts += 1;
            debug!("lock {} was replaced while acquiring", path.display());
            if attempts >= MAX_ATTEMPTS {
                let contents = fs::read_to_string(&path).unwrap_or_default();
                return Err(held_by(path, &contents));
            }
        };

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{};{}", std::process::id(), hostname())?;
        file.flush()?;
        debug!("acquired lock {}", path.display());

        Ok(Self {
            file: Some(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the lock file and drop the advisory lock.
    pub fn release(mut self) -> LuksResult<()> {
        self.release_inner().map_err(LuksError::from)
    }

    fn release_inner(&mut self) -> io::Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        let removed = match fs::remove_file(&self.path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        };
        let unlocked = file.unlock();
        debug!("released lock {}", self.path.display());
        removed.and(unlocked)
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!("failed to release lock {}: {err}", self.path.display());
        }
    }
}

/// Release `lock` and abort with `message` when `ok` is false; otherwise hand
/// the lock back to the caller.
pub fn release_and_abort_if_false(
    ok: bool,
    lock: ProcessLock,
    message: impl Into<String>,
) -> LuksResult<ProcessLock> {
    if ok {
        return Ok(lock);
    }
    let message = message.into();
    if let Err(err) = lock.release() {
        warn!("{message}; additionally failed to release lock: {err}");
    }
    Err(LuksError::Aborted(message))
}

fn held_by(path: PathBuf, contents: &str) -> LuksError {
    let (pid, hostname) = parse_owner(contents).unwrap_or_else(|| (0, "unknown".to_string()));
    LuksError::LockHeld {
        path,
        pid,
        hostname,
    }
}

/// True when `path` still names the inode behind `file`.
fn is_linked_at(file: &File, path: &Path) -> io::Result<bool> {
    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Parse `<pid>;<hostname>` lock contents, tolerating surrounding whitespace.
pub(crate) fn parse_owner(contents: &str) -> Option<(u32, String)> {
    let (pid, host) = contents.trim().split_once(';')?;
    let pid = pid.trim().parse().ok()?;
    Some((pid, host.trim().to_string()))
}

pub(crate) fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for `buf.len()` bytes and gethostname
    // writes at most that many.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}
