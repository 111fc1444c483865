//! # Temp File Registry
//!
//! Tracks every transcoded file handed to a session. Files are reference
//! counted (a loop replay shares its predecessor's file) and pinned while a
//! stream is reading them.
//!
//! A file is deleted when:
//! - its last reference is released,
//! - its session is destroyed, or
//! - it is older than the cleanup age and not pinned (periodic sweep).
//!
//! A pinned file is never removed by the sweep.
//!
//! Downloads still in progress hold a [`Reservation`] on their output stem;
//! [`TempFiles::clear_unreferenced`] leaves any file under a reserved stem
//! alone, partial downloads included.

use bridge_traits::{ChatId, Clock};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct TempEntry {
    chat_id: ChatId,
    refs: usize,
    pins: usize,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TempFileStats {
    pub files: usize,
    pub pinned: usize,
    pub sessions: usize,
}

pub struct TempFiles {
    dir: PathBuf,
    max_age: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<PathBuf, TempEntry>>,
    in_flight: Mutex<HashSet<OsString>>,
}

/// Keeps files named after a download stem safe from
/// [`TempFiles::clear_unreferenced`] until dropped.
#[must_use = "the stem is unprotected once the reservation is dropped"]
pub struct Reservation<'a> {
    files: &'a TempFiles,
    stem: OsString,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.files.in_flight.lock().remove(&self.stem);
    }
}

impl TempFiles {
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.into(),
            max_age,
            clock,
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the temp directory if needed.
    pub async fn ensure_dir(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    /// Protect every file in the temp directory whose name starts with the
    /// file name of `destination` while a download writes it.
    pub fn reserve(&self, destination: &Path) -> Reservation<'_> {
        let stem = destination
            .file_name()
            .map(|name| name.to_owned())
            .unwrap_or_default();
        self.in_flight.lock().insert(stem.clone());
        Reservation { files: self, stem }
    }

    fn is_in_flight(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            return false;
        };
        self.in_flight
            .lock()
            .iter()
            .filter_map(|stem| stem.to_str())
            .any(|stem| !stem.is_empty() && name.starts_with(stem))
    }

    /// Start tracking a freshly written file with one reference.
    pub fn register(&self, path: impl Into<PathBuf>, chat_id: ChatId) {
        let path = path.into();
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let entry = entries.entry(path.clone()).or_insert(TempEntry {
            chat_id,
            refs: 0,
            pins: 0,
            created_at: now,
        });
        entry.refs += 1;
        debug!(
            chat_id = %chat_id,
            file = %path.display(),
            refs = entry.refs,
            "Temp file registered"
        );
    }

    /// Add a reference to a tracked file. Returns `false` if it is unknown,
    /// for instance because the sweep already removed it.
    pub fn retain(&self, path: &Path) -> bool {
        match self.entries.lock().get_mut(path) {
            Some(entry) => {
                entry.refs += 1;
                true
            }
            None => false,
        }
    }

    /// Drop one reference; the file is deleted when none remain.
    pub fn release(&self, path: &Path) {
        let remove = {
            let mut entries = self.entries.lock();
            match entries.get_mut(path) {
                Some(entry) => {
                    entry.refs = entry.refs.saturating_sub(1);
                    if entry.refs == 0 && entry.pins == 0 {
                        entries.remove(path);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if remove {
            delete_file(path);
        }
    }

    /// Mark the file as being streamed.
    pub fn pin(&self, path: &Path) -> bool {
        match self.entries.lock().get_mut(path) {
            Some(entry) => {
                entry.pins += 1;
                true
            }
            None => false,
        }
    }

    pub fn unpin(&self, path: &Path) {
        let remove = {
            let mut entries = self.entries.lock();
            match entries.get_mut(path) {
                Some(entry) => {
                    entry.pins = entry.pins.saturating_sub(1);
                    if entry.refs == 0 && entry.pins == 0 {
                        entries.remove(path);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if remove {
            delete_file(path);
        }
    }

    /// Delete every file of a session, pinned or not. Returns how many.
    pub fn release_session(&self, chat_id: ChatId) -> usize {
        let paths: Vec<PathBuf> = {
            let mut entries = self.entries.lock();
            let paths: Vec<PathBuf> = entries
                .iter()
                .filter(|(_, entry)| entry.chat_id == chat_id)
                .map(|(path, _)| path.clone())
                .collect();
            for path in &paths {
                entries.remove(path);
            }
            paths
        };

        for path in &paths {
            delete_file(path);
        }
        if !paths.is_empty() {
            info!(chat_id = %chat_id, files = paths.len(), "Released session temp files");
        }
        paths.len()
    }

    /// Delete unpinned files older than the cleanup age. Returns how many.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let max_age =
            ChronoDuration::from_std(self.max_age).unwrap_or_else(|_| ChronoDuration::days(365));

        let expired: Vec<PathBuf> = {
            let mut entries = self.entries.lock();
            let expired: Vec<PathBuf> = entries
                .iter()
                .filter(|(_, entry)| entry.pins == 0 && now - entry.created_at >= max_age)
                .map(|(path, _)| path.clone())
                .collect();
            for path in &expired {
                entries.remove(path);
            }
            expired
        };

        for path in &expired {
            delete_file(path);
        }
        if !expired.is_empty() {
            info!(files = expired.len(), "Swept expired temp files");
        }
        expired.len()
    }

    /// Sweep every `interval` until cancelled.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                }
            }
            debug!("Temp file sweeper stopped");
        })
    }

    /// Remove files in the temp directory that no session references and no
    /// download is writing, including leftovers from earlier runs. Returns
    /// how many were deleted.
    pub async fn clear_unreferenced(&self) -> io::Result<usize> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file()
                || self.is_tracked(&path)
                || self.is_in_flight(&path)
            {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(file = %path.display(), error = %e, "Failed to remove temp file"),
            }
        }

        info!(removed, "Cleared unreferenced temp files");
        Ok(removed)
    }

    pub fn is_tracked(&self, path: &Path) -> bool {
        self.entries.lock().contains_key(path)
    }

    pub fn ref_count(&self, path: &Path) -> usize {
        self.entries.lock().get(path).map_or(0, |entry| entry.refs)
    }

    pub fn stats(&self) -> TempFileStats {
        let entries = self.entries.lock();
        let mut sessions: Vec<ChatId> = entries.values().map(|entry| entry.chat_id).collect();
        sessions.sort();
        sessions.dedup();
        TempFileStats {
            files: entries.len(),
            pinned: entries.values().filter(|entry| entry.pins > 0).count(),
            sessions: sessions.len(),
        }
    }
}

fn delete_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(file = %path.display(), "Temp file deleted"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(file = %path.display(), error = %e, "Failed to delete temp file"),
    }
}
