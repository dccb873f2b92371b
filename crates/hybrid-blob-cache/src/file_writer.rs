//! Exactly-once blob writes under a per-key lock

use crate::entry::CacheEntry;
use crate::error::{CacheError, Result};
use crate::locks::KeyedLocks;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Moves a finished temp file to its final path
pub type MoveIntoPlaceFn = Arc<dyn Fn(&Path, &Path) -> io::Result<()> + Send + Sync>;

pub fn default_move_into_place() -> MoveIntoPlaceFn {
    Arc::new(|from: &Path, to: &Path| std::fs::rename(from, to))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    Created,
    /// Someone else already wrote this key
    AlreadyExists,
    /// The write lock could not be acquired in time
    LockTimeout,
}

pub struct FileWriter {
    locks: KeyedLocks,
    move_into_place: bool,
    move_fn: MoveIntoPlaceFn,
}

impl FileWriter {
    pub fn new(move_into_place: bool, move_fn: MoveIntoPlaceFn) -> Self {
        Self {
            locks: KeyedLocks::new(),
            move_into_place,
            move_fn,
        }
    }

    /// Open the finished file for `entry`.
    ///
    /// Direct writes make the final path visible before the data is complete,
    /// so in that mode the file is opened under the write lock. `None` when
    /// there is no file or a write held the lock past `timeout`.
    pub async fn open_finished(
        &self,
        entry: &CacheEntry,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<File>> {
        if self.move_into_place {
            return open_existing(&entry.physical_path).await;
        }

        let Some(_guard) = self
            .locks
            .try_lock(&entry.string_key, timeout, cancel)
            .await?
        else {
            debug!(key = %entry.string_key, "Write still in progress, treating as a miss");
            return Ok(None);
        };
        open_existing(&entry.physical_path).await
    }

    /// Write `entry` to disk once.
    ///
    /// `write` receives the open file and hands it back when done. On any
    /// failure, or if this future is dropped before finishing, the partial
    /// file is removed.
    pub async fn try_write<F, Fut>(
        &self,
        entry: &CacheEntry,
        write: F,
        recheck_filesystem_first: bool,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WriteResult>
    where
        F: FnOnce(File) -> Fut,
        Fut: Future<Output = io::Result<File>>,
    {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        let final_path = &entry.physical_path;
        if recheck_filesystem_first && file_exists(final_path).await {
            return Ok(WriteResult::AlreadyExists);
        }

        let Some(_guard) = self
            .locks
            .try_lock(&entry.string_key, timeout, cancel)
            .await?
        else {
            debug!(key = %entry.string_key, "Timed out waiting for write lock");
            return Ok(WriteResult::LockTimeout);
        };

        if file_exists(final_path).await {
            return Ok(WriteResult::AlreadyExists);
        }

        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let write_path = if self.move_into_place {
            temp_path_for(final_path)
        } else {
            final_path.clone()
        };

        let file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&write_path)
            .await
        {
            Ok(file) => file,
            // Another process created the final file between our check and open
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && !self.move_into_place => {
                return Ok(WriteResult::AlreadyExists);
            }
            Err(e) => return Err(e.into()),
        };
        // Dropped before `_guard`, so a direct partial file goes while we still hold the lock
        let partial = PartialFile::new(write_path.clone());

        let written = async {
            let mut file = write(file).await?;
            file.flush().await?;
            Ok::<_, io::Error>(())
        }
        .await;

        if let Err(e) = written {
            warn!(path = ?write_path, error = %e, "Blob write failed, removing partial file");
            return Err(e.into());
        }

        if self.move_into_place {
            let move_fn = self.move_fn.clone();
            let from = write_path.clone();
            let to = final_path.clone();
            let moved = tokio::task::spawn_blocking(move || move_fn(&from, &to))
                .await
                .map_err(io::Error::other)?;

            match moved {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    return Ok(WriteResult::AlreadyExists);
                }
                Err(e) => return Err(e.into()),
            }
        }

        partial.disarm();
        debug!(path = ?final_path, "Wrote blob to disk");
        Ok(WriteResult::Created)
    }
}

async fn file_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

async fn open_existing(path: &Path) -> Result<Option<File>> {
    match File::open(path).await {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Removes an unfinished blob file when dropped, unless disarmed
struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Runs from Drop, so this cannot await
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = ?self.path, error = %e, "Failed to remove partial blob file");
            }
        }
    }
}

/// `<path>.tmp_<random>`
fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".tmp_{}", uuid::Uuid::new_v4().simple()));
    PathBuf::from(name)
}
