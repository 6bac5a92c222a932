//! Durable sync progress for crash recovery.
//!
//! A [`SyncCheckpoint`] records, per entity kind, which record ids have
//! already been emitted in the current run and whether the kind finished.
//! The orchestrator saves it after every batch, so a crashed or cancelled
//! sync resumes by skipping completed kinds and already-emitted ids.
//!
//! # Durability
//!
//! [`CheckpointStore::save`] writes the whole checkpoint to `<path>.tmp`,
//! fsyncs it and renames it over the canonical file. A reader sees either
//! the old checkpoint or the new one, never a partial write.
//! [`CheckpointStore::load`] never fails: a missing or unreadable file
//! yields a fresh checkpoint so a corrupt state file cannot block syncing.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::models::EntityKind;

/// Most recent errors kept in a checkpoint.
pub const MAX_ERRORS: usize = 100;

/// Which kind of run a checkpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    Full,
    Poll,
}

impl std::fmt::Display for SyncType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SyncType::Full => "full",
            SyncType::Poll => "poll",
        })
    }
}

/// Progress of one entity kind within the current run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KindProgress {
    /// Ids already emitted in this run.
    pub seen_ids: BTreeSet<i64>,
    /// Every page of this kind was traversed without error.
    pub complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncCheckpoint {
    pub last_full_sync: Option<DateTime<Utc>>,
    pub last_poll: Option<DateTime<Utc>>,
    pub tickets: KindProgress,
    pub customers: KindProgress,
    pub assets: KindProgress,
    pub invoices: KindProgress,
    pub sync_started_at: Option<DateTime<Utc>>,
    pub sync_type: Option<SyncType>,
    /// Kinds the current run must traverse. `None` means all of them.
    pub enabled_kinds: Option<BTreeSet<EntityKind>>,
    pub documents_processed: u64,
    pub errors: Vec<String>,
}

impl SyncCheckpoint {
    pub fn progress(&self, kind: EntityKind) -> &KindProgress {
        match kind {
            EntityKind::Ticket => &self.tickets,
            EntityKind::Customer => &self.customers,
            EntityKind::Asset => &self.assets,
            EntityKind::Invoice => &self.invoices,
        }
    }

    pub fn progress_mut(&mut self, kind: EntityKind) -> &mut KindProgress {
        match kind {
            EntityKind::Ticket => &mut self.tickets,
            EntityKind::Customer => &mut self.customers,
            EntityKind::Asset => &mut self.assets,
            EntityKind::Invoice => &mut self.invoices,
        }
    }

    /// Start a new run. Per-kind progress, counters and errors are cleared;
    /// `last_full_sync` and `last_poll` are kept.
    pub fn reset_for_new_sync(&mut self, sync_type: SyncType, now: DateTime<Utc>) {
        for kind in EntityKind::SYNC_ORDER {
            *self.progress_mut(kind) = KindProgress::default();
        }
        self.sync_started_at = Some(now);
        self.sync_type = Some(sync_type);
        self.documents_processed = 0;
        self.errors.clear();
    }

    /// Stamp the finished run's start time as the last successful
    /// full or poll sync. Poll runs then fetch records updated after it.
    pub fn mark_complete(&mut self, now: DateTime<Utc>) {
        let stamp = self.sync_started_at.unwrap_or(now);
        match self.sync_type {
            Some(SyncType::Full) => self.last_full_sync = Some(stamp),
            Some(SyncType::Poll) | None => self.last_poll = Some(stamp),
        }
    }

    /// Append an error, keeping only the most recent [`MAX_ERRORS`].
    pub fn record_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
        if self.errors.len() > MAX_ERRORS {
            let excess = self.errors.len() - MAX_ERRORS;
            self.errors.drain(..excess);
        }
    }

    /// Record which kinds the current run traverses. Kinds outside the
    /// set keep their progress but no longer hold back completion.
    pub fn set_enabled_kinds(&mut self, kinds: impl IntoIterator<Item = EntityKind>) {
        self.enabled_kinds = Some(kinds.into_iter().collect());
    }

    pub fn is_enabled(&self, kind: EntityKind) -> bool {
        self.enabled_kinds
            .as_ref()
            .map_or(true, |kinds| kinds.contains(&kind))
    }

    /// Every enabled kind was traversed.
    pub fn all_complete(&self) -> bool {
        EntityKind::SYNC_ORDER
            .iter()
            .filter(|k| self.is_enabled(**k))
            .all(|k| self.progress(*k).complete)
    }

    /// A run was started and never reached completion of every kind.
    pub fn is_interrupted(&self) -> bool {
        self.sync_started_at.is_some() && !self.all_complete()
    }

    /// Most recent successful sync start, used as the poll watermark.
    pub fn poll_watermark(&self) -> Option<DateTime<Utc>> {
        self.last_poll.max(self.last_full_sync)
    }
}

/// File-backed checkpoint persistence.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Read the checkpoint, falling back to a fresh one when the file is
    /// missing or does not parse.
    pub fn load(&self) -> SyncCheckpoint {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "no checkpoint, starting fresh");
                return SyncCheckpoint::default();
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "unreadable checkpoint, starting fresh");
                return SyncCheckpoint::default();
            }
        };

        match serde_json::from_str::<SyncCheckpoint>(&raw) {
            Ok(mut cp) => {
                if cp.errors.len() > MAX_ERRORS {
                    let excess = cp.errors.len() - MAX_ERRORS;
                    cp.errors.drain(..excess);
                }
                tracing::info!(
                    path = %self.path.display(),
                    last_full_sync = ?cp.last_full_sync,
                    last_poll = ?cp.last_poll,
                    in_progress = ?cp.sync_started_at.and(cp.sync_type),
                    "loaded checkpoint"
                );
                cp
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "corrupt checkpoint, starting fresh");
                SyncCheckpoint::default()
            }
        }
    }

    /// Persist atomically: write `<path>.tmp`, fsync, rename over `path`.
    pub fn save(&self, checkpoint: &SyncCheckpoint) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let body = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let tmp = self.tmp_path();
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp, &self.path) {
            tracing::error!(path = %self.path.display(), error = %e, "checkpoint rename failed");
            return Err(e.into());
        }
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        sync_dir(dir)?;

        tracing::debug!(
            documents_processed = checkpoint.documents_processed,
            "saved checkpoint"
        );
        Ok(())
    }

    /// Delete the checkpoint. Missing files are fine.
    pub fn clear(&self) -> Result<()> {
        for path in [self.path.clone(), self.tmp_path()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Flush the directory entry written by a rename.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Whether the next run must be a full sync.
///
/// True when no full sync has completed, the last one is older than
/// `max_age_hours`, or the last run was interrupted.
pub fn needs_full_sync(checkpoint: &SyncCheckpoint, max_age_hours: u64) -> bool {
    needs_full_sync_at(checkpoint, max_age_hours, Utc::now())
}

pub fn needs_full_sync_at(
    checkpoint: &SyncCheckpoint,
    max_age_hours: u64,
    now: DateTime<Utc>,
) -> bool {
    let Some(last_full) = checkpoint.last_full_sync else {
        return true;
    };
    if checkpoint.is_interrupted() {
        return true;
    }
    let max_age = Duration::hours(max_age_hours.min(i64::MAX as u64 / 3600) as i64);
    now - last_full > max_age
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn completed(last_full: DateTime<Utc>) -> SyncCheckpoint {
        let mut cp = SyncCheckpoint::default();
        cp.reset_for_new_sync(SyncType::Full, last_full);
        for kind in EntityKind::SYNC_ORDER {
            cp.progress_mut(kind).complete = true;
        }
        cp.mark_complete(last_full);
        cp
    }

    #[test]
    fn round_trip_with_seen_ids_and_errors() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::new(tmp.path().join("state.json"));

        let mut cp = SyncCheckpoint::default();
        cp.reset_for_new_sync(SyncType::Full, Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap());
        cp.tickets.seen_ids.extend([3, 1, 2]);
        cp.customers.seen_ids.insert(42);
        cp.customers.complete = true;
        cp.documents_processed = 4;
        cp.record_error("ticket 9: bad record");

        store.save(&cp).unwrap();
        assert_eq!(store.load(), cp);
        assert!(!tmp.path().join("state.json.tmp").exists());
    }

    #[test]
    fn missing_file_loads_fresh() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::new(tmp.path().join("nope/state.json"));
        assert_eq!(store.load(), SyncCheckpoint::default());
    }

    #[test]
    fn corrupt_file_loads_fresh() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        fs::write(&path, "{\"tickets\": {\"seen_ids\": [1, 2").unwrap();
        assert_eq!(CheckpointStore::new(&path).load(), SyncCheckpoint::default());
    }

    #[test]
    fn interrupted_write_leaves_previous_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        let store = CheckpointStore::new(&path);

        let mut cp = SyncCheckpoint::default();
        cp.documents_processed = 7;
        store.save(&cp).unwrap();

        // A crash after the temp write but before the rename.
        fs::write(tmp.path().join("state.json.tmp"), "{\"documents_proc").unwrap();
        assert_eq!(store.load().documents_processed, 7);

        // The next save replaces the stale temp file.
        cp.documents_processed = 8;
        store.save(&cp).unwrap();
        assert_eq!(store.load().documents_processed, 8);
    }

    #[test]
    fn save_creates_parent_dirs_and_clear_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::new(tmp.path().join("a/b/state.json"));
        store.save(&SyncCheckpoint::default()).unwrap();
        assert!(store.path().exists());
        store.clear().unwrap();
        store.clear().unwrap();
        assert!(!store.path().exists());
    }

    #[test]
    fn save_into_unwritable_location_errors() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("file");
        fs::write(&blocker, "x").unwrap();
        let store = CheckpointStore::new(blocker.join("state.json"));
        let err = store.save(&SyncCheckpoint::default()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn errors_are_capped() {
        let mut cp = SyncCheckpoint::default();
        for i in 0..150 {
            cp.record_error(format!("e{}", i));
        }
        assert_eq!(cp.errors.len(), MAX_ERRORS);
        assert_eq!(cp.errors[0], "e50");
        assert_eq!(cp.errors[99], "e149");
    }

    #[test]
    fn reset_keeps_last_sync_times() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut cp = completed(t0);
        cp.tickets.seen_ids.insert(5);
        cp.record_error("x");

        let t1 = t0 + Duration::hours(1);
        cp.reset_for_new_sync(SyncType::Poll, t1);
        assert_eq!(cp.last_full_sync, Some(t0));
        assert!(cp.tickets.seen_ids.is_empty());
        assert!(!cp.tickets.complete);
        assert!(cp.errors.is_empty());
        assert_eq!(cp.sync_type, Some(SyncType::Poll));

        for kind in EntityKind::SYNC_ORDER {
            cp.progress_mut(kind).complete = true;
        }
        cp.mark_complete(t1 + Duration::minutes(5));
        assert_eq!(cp.last_poll, Some(t1));
        assert_eq!(cp.poll_watermark(), Some(t1));
    }

    #[test]
    fn full_sync_age_threshold() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        assert!(needs_full_sync_at(&completed(now - Duration::hours(25)), 24, now));
        assert!(!needs_full_sync_at(&completed(now - Duration::hours(23)), 24, now));
    }

    #[test]
    fn never_synced_or_interrupted_needs_full() {
        let now = Utc::now();
        assert!(needs_full_sync_at(&SyncCheckpoint::default(), 24, now));

        let mut cp = completed(now - Duration::hours(1));
        cp.reset_for_new_sync(SyncType::Poll, now);
        cp.customers.complete = true;
        assert!(cp.is_interrupted());
        assert!(needs_full_sync_at(&cp, 24, now));
    }

    #[test]
    fn completion_only_counts_enabled_kinds() {
        let mut cp = SyncCheckpoint::default();
        cp.reset_for_new_sync(SyncType::Full, Utc::now());
        cp.set_enabled_kinds([EntityKind::Customer, EntityKind::Ticket]);
        cp.customers.complete = true;
        assert!(cp.is_interrupted());

        cp.tickets.complete = true;
        assert!(cp.all_complete());
        assert!(!cp.assets.complete);

        // Enabling a kind that was never walked reopens the run.
        cp.set_enabled_kinds(EntityKind::SYNC_ORDER);
        assert!(!cp.all_complete());
        assert!(cp.is_interrupted());
    }

    #[test]
    fn enabled_kinds_survive_a_save() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::new(tmp.path().join("state.json"));
        let mut cp = SyncCheckpoint::default();
        cp.set_enabled_kinds([EntityKind::Asset]);
        store.save(&cp).unwrap();

        let loaded = store.load();
        assert!(loaded.is_enabled(EntityKind::Asset));
        assert!(!loaded.is_enabled(EntityKind::Invoice));
        // Checkpoints written without the field track every kind.
        assert!(SyncCheckpoint::default().is_enabled(EntityKind::Invoice));
    }

    #[cfg(unix)]
    #[test]
    fn directory_sync_after_rename() {
        let tmp = TempDir::new().unwrap();
        assert!(sync_dir(tmp.path()).is_ok());
        assert!(sync_dir(&tmp.path().join("missing")).is_err());

        let store = CheckpointStore::new(tmp.path().join("deep/er/state.json"));
        store.save(&SyncCheckpoint::default()).unwrap();
        assert!(tmp.path().join("deep/er/state.json").exists());
    }
}
