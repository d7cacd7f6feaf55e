use crate::CoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Exclusive lock on one project, held for the duration of any operation
/// that creates, replaces or deletes the project's containers or volumes.
///
/// The holder writes its pid into the lock file so waiters can name it.
pub struct ProjectLock {
    lock_file: File,
}

fn open_lock_file(lock_path: &Path) -> Result<File, CoreError> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?)
}

impl ProjectLock {
    /// Block until the lock is free.
    pub fn acquire(lock_path: &Path) -> Result<Self, CoreError> {
        let file = open_lock_file(lock_path)?;
        file.lock_exclusive()
            .map_err(|e| CoreError::Io(std::io::Error::new(std::io::ErrorKind::WouldBlock, e)))?;
        debug!("acquired project lock {}", lock_path.display());
        Self::claim(file)
    }

    /// `None` when another process holds the lock.
    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>, CoreError> {
        let file = open_lock_file(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Self::claim(file).map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Pid recorded by the process currently holding the lock.
    pub fn holder(lock_path: &Path) -> Option<u32> {
        std::fs::read_to_string(lock_path).ok()?.trim().parse().ok()
    }

    fn claim(file: File) -> Result<Self, CoreError> {
        file.set_len(0)?;
        (&file).write_all(std::process::id().to_string().as_bytes())?;
        Ok(Self { lock_file: file })
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        let _ = self.lock_file.set_len(0);
        let _ = self.lock_file.unlock();
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// First Ctrl-C asks the orchestrator to stop before the next definition;
/// a second one exits immediately.
pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(130);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\nshutdown requested, finishing current container...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
