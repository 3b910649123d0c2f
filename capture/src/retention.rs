//! Retention engine – keeps the capture directory within its time and
//! byte budgets and in agreement with the segment index.
//!
//! The engine itself is synchronous: every pass is a handful of index
//! queries and file deletes. [`run_worker`] drives it from the async side
//! on the blocking pool, registering completed segments as they arrive and
//! running a cleanup pass on a fixed interval.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use rewind_common::config::Settings;
use rewind_common::error::CaptureError;
use rewind_common::files::FileStore;
use rewind_common::index::SegmentStore;
use rewind_common::segment::{format_bytes, CompletedSegment, NewSegment, Segment, StorageStats};

use crate::controller::SessionSnapshot;

/// Oldest segments fetched per eviction round.
pub const EVICTION_BATCH: usize = 10;
/// Files modified more recently than this are never treated as orphans.
pub const ORPHAN_SETTLE_MS: i64 = 10_000;
/// Headroom added to the expected storage estimate.
pub const STORAGE_MARGIN_PERCENT: f64 = 20.0;

/// What one cleanup pass achieved.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired: usize,
    pub evicted_bytes: u64,
    pub orphans: usize,
}

pub struct RetentionEngine {
    store: Arc<dyn SegmentStore>,
    files: Arc<dyn FileStore>,
    settings: watch::Receiver<Settings>,
    min_free_bytes: u64,
    /// Serialises the file-then-row delete so two passes never race on
    /// the same segment.
    delete_lock: Mutex<()>,
    low_storage_reported: AtomicBool,
}

impl RetentionEngine {
    pub fn new(
        store: Arc<dyn SegmentStore>,
        files: Arc<dyn FileStore>,
        settings: watch::Receiver<Settings>,
        min_free_bytes: u64,
    ) -> Self {
        Self {
            store,
            files,
            settings,
            min_free_bytes,
            delete_lock: Mutex::new(()),
            low_storage_reported: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<dyn SegmentStore> {
        &self.store
    }

    // ── registration ─────────────────────────────────────────────────

    /// Index a completed segment. Returns the new row id, or `None` if the
    /// segment was rejected or the index is unavailable.
    pub fn register(&self, done: &CompletedSegment) -> Option<i64> {
        let size = match self.files.size(&done.path) {
            Ok(size) => size,
            Err(e) => {
                warn!("Completed segment {} is unreadable: {e}", done.path.display());
                return None;
            }
        };
        let segment = NewSegment::from_completed(done, size, Utc::now().timestamp_millis());
        if let Err(errors) = segment.validate() {
            warn!(
                "Rejecting segment {}: {}",
                done.path.display(),
                errors.join("; ")
            );
            return None;
        }
        match self.store.insert(&segment) {
            Ok(id) => {
                info!(
                    "Registered segment #{id}: {} ({}, {})",
                    done.path.display(),
                    format_bytes(size),
                    if done.is_call() { "call" } else { "ambient" }
                );
                Some(id)
            }
            Err(e) => {
                error!("Cannot index {}: {e}", done.path.display());
                None
            }
        }
    }

    // ── deletion ─────────────────────────────────────────────────────

    /// Delete a segment's file, then its row. The row survives when the
    /// file could not be removed. `Ok(true)` only if this call removed the
    /// row, so a segment deleted concurrently is never counted twice.
    fn remove_segment(&self, segment: &Segment) -> Result<bool, CaptureError> {
        let _guard = self.delete_lock.lock().unwrap_or_else(|p| p.into_inner());
        if !self.files.delete(&segment.file_path) {
            warn!(
                "Cannot delete {}, keeping its index row",
                segment.file_path.display()
            );
            return Ok(false);
        }
        let removed = self.store.delete_by_id(segment.id)?;
        if !removed {
            debug!("Segment #{} was already removed", segment.id);
        }
        Ok(removed)
    }

    /// Remove segments that ended before `now_ms - retention_period`.
    pub fn purge_expired(&self, now_ms: i64) -> Result<usize, CaptureError> {
        let retention = self.settings.borrow().retention_period_ms;
        let cutoff = now_ms - retention;
        let expired = self.store.get_older_than(cutoff)?;
        let mut removed = 0;
        for segment in &expired {
            if self.remove_segment(segment)? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Purged {removed} expired segment(s)");
        }
        Ok(removed)
    }

    /// Evict oldest-first until indexed bytes fit `max_storage_bytes`.
    /// Returns bytes freed.
    pub fn enforce_storage_limit(&self) -> Result<u64, CaptureError> {
        let max = self.settings.borrow().max_storage_bytes;
        let used = self.store.total_size()?;
        if used <= max {
            return Ok(0);
        }
        warn!(
            "Storage limit exceeded: {} used of {}",
            format_bytes(used),
            format_bytes(max)
        );
        let freed = self.evict_oldest(used - max)?;
        info!("Evicted {} to stay within limit", format_bytes(freed));
        Ok(freed)
    }

    /// Delete oldest segments until at least `target` bytes are freed or
    /// nothing more can be removed.
    fn evict_oldest(&self, target: u64) -> Result<u64, CaptureError> {
        let mut freed = 0u64;
        while freed < target {
            let batch = self.store.get_oldest(EVICTION_BATCH)?;
            if batch.is_empty() {
                break;
            }
            let mut progressed = false;
            for segment in &batch {
                if freed >= target {
                    break;
                }
                if self.remove_segment(segment)? {
                    freed += segment.file_size;
                    progressed = true;
                }
            }
            if !progressed {
                warn!("No segment in the oldest batch could be deleted, retrying next pass");
                break;
            }
        }
        Ok(freed)
    }

    /// Delete files in the capture directory with no index row, and rows
    /// whose file has vanished. The active session's file and anything
    /// written within [`ORPHAN_SETTLE_MS`] are left alone.
    pub fn reconcile_orphans(&self, active: Option<&Path>, now_ms: i64) -> Result<usize, CaptureError> {
        let indexed: HashSet<PathBuf> = self.store.get_all_paths()?.into_iter().collect();
        let on_disk = self.files.list_files()?;

        let mut orphans = 0;
        for path in &on_disk {
            if indexed.contains(path) || active == Some(path.as_path()) {
                continue;
            }
            match self.files.modified_ms(path) {
                Ok(modified) if now_ms - modified < ORPHAN_SETTLE_MS => continue,
                Ok(_) => {}
                Err(e) => {
                    debug!("Skipping {}: {e}", path.display());
                    continue;
                }
            }
            let _guard = self.delete_lock.lock().unwrap_or_else(|p| p.into_inner());
            if self.files.delete(path) {
                info!("Deleted orphaned file {}", path.display());
                orphans += 1;
            }
        }

        let present: HashSet<&PathBuf> = on_disk.iter().collect();
        let dangling: Vec<i64> = self
            .store
            .get_all()?
            .into_iter()
            .filter(|s| !present.contains(&s.file_path) && !self.files.exists(&s.file_path))
            .map(|s| s.id)
            .collect();
        if !dangling.is_empty() {
            let removed = self.store.delete_by_ids(&dangling)?;
            info!("Dropped {removed} index row(s) with no file on disk");
            orphans += removed;
        }
        Ok(orphans)
    }

    /// Free at least `required` bytes straight from the capture directory,
    /// oldest modification time first. The index is not consulted; the
    /// next reconciliation drops rows left without a file.
    pub fn emergency_cleanup(&self, required: u64, active: Option<&Path>) -> Result<u64, CaptureError> {
        warn!("Emergency cleanup: need {} more free", format_bytes(required));
        let mut candidates: Vec<(i64, PathBuf)> = self
            .files
            .list_files()?
            .into_iter()
            .filter(|path| active != Some(path.as_path()))
            .filter_map(|path| match self.files.modified_ms(&path) {
                Ok(modified) => Some((modified, path)),
                Err(e) => {
                    debug!("Skipping {}: {e}", path.display());
                    None
                }
            })
            .collect();
        candidates.sort();

        let mut freed = 0u64;
        for (_, path) in &candidates {
            if freed >= required {
                break;
            }
            let size = self.files.size(path).unwrap_or(0);
            let _guard = self.delete_lock.lock().unwrap_or_else(|p| p.into_inner());
            if self.files.delete(path) {
                freed += size;
            }
        }
        if freed < required {
            error!(
                "Emergency cleanup freed only {} of {}",
                format_bytes(freed),
                format_bytes(required)
            );
        } else {
            info!("Emergency cleanup freed {}", format_bytes(freed));
        }
        Ok(freed)
    }

    /// Bytes that must be freed to get back above the free-space floor,
    /// with room for one more segment. `None` when storage is healthy.
    pub fn storage_shortfall(&self) -> Option<u64> {
        let free = match self.files.free_space() {
            Ok(free) => free,
            Err(e) => {
                warn!("Cannot read free space: {e}");
                return None;
            }
        };
        if free >= self.min_free_bytes {
            if self.low_storage_reported.swap(false, Ordering::Relaxed) {
                info!("Free space back to {}", format_bytes(free));
            }
            return None;
        }
        if !self.low_storage_reported.swap(true, Ordering::Relaxed) {
            warn!(
                "Low storage: {} free, floor is {}",
                format_bytes(free),
                format_bytes(self.min_free_bytes)
            );
        }
        let settings = self.settings.borrow();
        let one_segment = settings.bitrate_bps as u64 / 8 * settings.segment_duration_seconds;
        Some(self.min_free_bytes - free + one_segment)
    }

    /// Run emergency cleanup if free space is below the floor, then
    /// reconcile. Returns whether storage was short.
    pub fn relieve_storage_pressure(&self, active: Option<&Path>) -> bool {
        let Some(required) = self.storage_shortfall() else {
            return false;
        };
        let err = CaptureError::StorageExhausted {
            available: self.files.free_space().unwrap_or(0),
            required,
        };
        debug!("{err}");
        if let Err(e) = self.emergency_cleanup(required, active) {
            error!("Emergency cleanup aborted: {e}");
        }
        if let Err(e) = self.reconcile_orphans(active, Utc::now().timestamp_millis()) {
            warn!("Orphan reconciliation skipped: {e}");
        }
        true
    }

    /// Expiry, size limit, then orphan reconciliation. Index errors abort
    /// the step they hit; the next pass retries.
    pub fn run_cleanup(&self, active: Option<&Path>, now_ms: i64) -> CleanupReport {
        let mut report = CleanupReport::default();
        match self.purge_expired(now_ms) {
            Ok(n) => report.expired = n,
            Err(e) => warn!("Expiry pass skipped: {e}"),
        }
        match self.enforce_storage_limit() {
            Ok(n) => report.evicted_bytes = n,
            Err(e) => warn!("Size-limit pass skipped: {e}"),
        }
        match self.reconcile_orphans(active, now_ms) {
            Ok(n) => report.orphans = n,
            Err(e) => warn!("Orphan reconciliation skipped: {e}"),
        }
        report
    }

    // ── user operations ──────────────────────────────────────────────

    pub fn storage_stats(&self) -> Result<StorageStats, CaptureError> {
        Ok(StorageStats {
            total_bytes: self.store.total_size()?,
            segment_count: self.store.count()?,
            available_bytes: self.files.free_space().unwrap_or(0),
            expected_bytes: self
                .settings
                .borrow()
                .expected_storage_usage_with_margin(STORAGE_MARGIN_PERCENT),
        })
    }

    /// Delete one segment by id. `Ok(false)` if unknown or undeletable.
    pub fn delete_segment(&self, id: i64) -> Result<bool, CaptureError> {
        match self.store.get_by_id(id)? {
            Some(segment) => self.remove_segment(&segment),
            None => Ok(false),
        }
    }

    /// Delete every indexed segment whose file can be removed.
    pub fn delete_all(&self) -> Result<usize, CaptureError> {
        let segments = self.store.get_all()?;
        let mut removed = 0;
        for segment in &segments {
            if self.remove_segment(segment)? {
                removed += 1;
            }
        }
        info!("Deleted {removed} of {} segment(s)", segments.len());
        Ok(removed)
    }

    /// Copy a segment out of the rotating window into `saved_dir` and flag
    /// it saved. The copy is never touched by retention.
    pub fn save_segment(&self, id: i64, saved_dir: &Path) -> Result<Option<PathBuf>, CaptureError> {
        let Some(segment) = self.store.get_by_id(id)? else {
            return Ok(None);
        };
        let Some(name) = segment.file_path.file_name() else {
            return Ok(None);
        };
        std::fs::create_dir_all(saved_dir)?;
        let dest = saved_dir.join(name);
        std::fs::copy(&segment.file_path, &dest)?;
        self.store.set_saved(id, true)?;
        info!("Saved segment #{id} → {}", dest.display());
        Ok(Some(dest))
    }
}

// ── async driver ─────────────────────────────────────────────────────────

async fn blocking<T, F>(engine: &Arc<RetentionEngine>, f: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce(&RetentionEngine) -> T + Send + 'static,
{
    let engine = engine.clone();
    match tokio::task::spawn_blocking(move || f(&engine)).await {
        Ok(v) => Some(v),
        Err(e) => {
            error!("Retention task failed: {e}");
            None
        }
    }
}

fn active_path(session: &watch::Receiver<SessionSnapshot>) -> Option<PathBuf> {
    session.borrow().current_path.clone()
}

/// Register completed segments and run periodic cleanup. Exits once the
/// controller drops its side of `completed`, after draining it.
pub async fn run_worker(
    engine: Arc<RetentionEngine>,
    mut completed: mpsc::UnboundedReceiver<CompletedSegment>,
    session: watch::Receiver<SessionSnapshot>,
    interval: Duration,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Retention worker started (cleanup every {}s)", interval.as_secs());

    loop {
        let mut batch = Vec::new();
        let periodic = tokio::select! {
            done = completed.recv() => match done {
                Some(done) => {
                    batch.push(done);
                    false
                }
                None => break,
            },
            _ = tick.tick() => true,
        };
        // Register everything already queued before any cleanup looks at
        // the directory, so fresh segments are never mistaken for orphans.
        while let Ok(done) = completed.try_recv() {
            batch.push(done);
        }

        let active = active_path(&session);
        blocking(&engine, move |engine| {
            for done in &batch {
                engine.register(done);
            }
            let report = engine.run_cleanup(active.as_deref(), Utc::now().timestamp_millis());
            if report != CleanupReport::default() {
                debug!("Cleanup ({}): {report:?}", if periodic { "periodic" } else { "after registration" });
            }
            engine.relieve_storage_pressure(active.as_deref());
        })
        .await;
    }

    info!("Retention worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_common::files::LocalFileStore;
    use rewind_common::index::SqliteSegmentStore;
    use std::io;

    struct Env {
        engine: RetentionEngine,
        store: Arc<dyn SegmentStore>,
        dir: PathBuf,
        settings: watch::Sender<Settings>,
        _tmp: tempfile::TempDir,
    }

    fn env_with(files: impl FnOnce(PathBuf) -> Arc<dyn FileStore>, settings: Settings) -> Env {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("segments");
        std::fs::create_dir_all(&dir).unwrap();
        let store: Arc<dyn SegmentStore> = Arc::new(SqliteSegmentStore::open_in_memory().unwrap());
        let (settings_tx, settings_rx) = watch::channel(settings);
        let engine = RetentionEngine::new(store.clone(), files(dir.clone()), settings_rx, 0);
        Env {
            engine,
            store,
            dir,
            settings: settings_tx,
            _tmp: tmp,
        }
    }

    fn env(settings: Settings) -> Env {
        env_with(|dir| Arc::new(LocalFileStore::new(dir).unwrap()), settings)
    }

    fn write_segment(env: &Env, name: &str, start: i64, bytes: usize) -> CompletedSegment {
        let path = env.dir.join(name);
        std::fs::write(&path, vec![0u8; bytes]).unwrap();
        CompletedSegment {
            path,
            start_time: start,
            duration: 60_000,
            call: None,
        }
    }

    #[test]
    fn test_size_limit_evicts_oldest_first() {
        let env = env(Settings {
            max_storage_bytes: 1_000_000,
            ..Settings::default()
        });
        for (i, name) in ["a.wav", "b.wav", "c.wav"].iter().enumerate() {
            let done = write_segment(&env, name, 1_000 + i as i64 * 60_000, 400_000);
            env.engine.register(&done).unwrap();
        }
        assert_eq!(env.store.total_size().unwrap(), 1_200_000);

        let freed = env.engine.enforce_storage_limit().unwrap();
        assert_eq!(freed, 400_000);

        let left: Vec<_> = env
            .store
            .get_all()
            .unwrap()
            .into_iter()
            .map(|s| s.file_path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(left, ["c.wav", "b.wav"]);
        assert!(!env.dir.join("a.wav").exists());
        assert!(env.store.total_size().unwrap() <= 1_000_000);
    }

    #[test]
    fn test_purge_expired_respects_retention() {
        let env = env(Settings {
            retention_period_ms: 600_000,
            ..Settings::default()
        });
        let now = 10_000_000;
        let old = write_segment(&env, "old.wav", now - 900_000, 10);
        let fresh = write_segment(&env, "fresh.wav", now - 180_000, 10);
        env.engine.register(&old).unwrap();
        env.engine.register(&fresh).unwrap();

        assert_eq!(env.engine.purge_expired(now).unwrap(), 1);
        assert!(!old.path.exists());
        assert!(fresh.path.exists());
        assert_eq!(env.store.count().unwrap(), 1);

        // Shrinking retention applies on the next pass.
        env.settings.send_modify(|s| s.retention_period_ms = 60_000);
        assert_eq!(env.engine.purge_expired(now).unwrap(), 1);
        assert_eq!(env.store.count().unwrap(), 0);
    }

    #[test]
    fn test_register_rejects_invalid_segment() {
        let env = env(Settings::default());
        let mut done = write_segment(&env, "bad.wav", 1_000, 10);
        done.duration = -5;
        assert!(env.engine.register(&done).is_none());
        assert_eq!(env.store.count().unwrap(), 0);
    }

    #[test]
    fn test_register_missing_file_is_skipped() {
        let env = env(Settings::default());
        let done = CompletedSegment {
            path: env.dir.join("ghost.wav"),
            start_time: 1_000,
            duration: 60_000,
            call: None,
        };
        assert!(env.engine.register(&done).is_none());
    }

    #[test]
    fn test_reconcile_orphans_is_idempotent() {
        let env = env(Settings::default());
        let kept = write_segment(&env, "kept.wav", 1_000, 10);
        env.engine.register(&kept).unwrap();
        let orphan = env.dir.join("orphan.wav");
        std::fs::write(&orphan, b"x").unwrap();
        let active = env.dir.join("active.wav");
        std::fs::write(&active, b"x").unwrap();

        let later = Utc::now().timestamp_millis() + 60_000;
        assert_eq!(env.engine.reconcile_orphans(Some(&active), later).unwrap(), 1);
        assert!(!orphan.exists());
        assert!(active.exists());
        assert!(kept.path.exists());

        assert_eq!(env.engine.reconcile_orphans(Some(&active), later).unwrap(), 0);
    }

    #[test]
    fn test_reconcile_skips_recent_files() {
        let env = env(Settings::default());
        let fresh = env.dir.join("fresh.wav");
        std::fs::write(&fresh, b"x").unwrap();
        let now = Utc::now().timestamp_millis();
        assert_eq!(env.engine.reconcile_orphans(None, now).unwrap(), 0);
        assert!(fresh.exists());
    }

    #[test]
    fn test_reconcile_drops_rows_without_files() {
        let env = env(Settings::default());
        let done = write_segment(&env, "gone.wav", 1_000, 10);
        env.engine.register(&done).unwrap();
        std::fs::remove_file(&done.path).unwrap();
        assert_eq!(env.engine.reconcile_orphans(None, 0).unwrap(), 1);
        assert_eq!(env.store.count().unwrap(), 0);
    }

    /// Local store that refuses to delete one named file.
    struct StubbornFiles {
        inner: LocalFileStore,
        stuck: &'static str,
    }

    impl FileStore for StubbornFiles {
        fn dir(&self) -> &Path {
            self.inner.dir()
        }
        fn create_path(&self, ts: i64) -> PathBuf {
            self.inner.create_path(ts)
        }
        fn delete(&self, path: &Path) -> bool {
            if path.ends_with(self.stuck) {
                return false;
            }
            self.inner.delete(path)
        }
        fn exists(&self, path: &Path) -> bool {
            self.inner.exists(path)
        }
        fn size(&self, path: &Path) -> io::Result<u64> {
            self.inner.size(path)
        }
        fn modified_ms(&self, path: &Path) -> io::Result<i64> {
            self.inner.modified_ms(path)
        }
        fn list_files(&self) -> io::Result<Vec<PathBuf>> {
            self.inner.list_files()
        }
        fn free_space(&self) -> io::Result<u64> {
            self.inner.free_space()
        }
    }

    #[test]
    fn test_undeletable_file_keeps_row_and_eviction_moves_on() {
        let env = env_with(
            |dir| {
                Arc::new(StubbornFiles {
                    inner: LocalFileStore::new(dir).unwrap(),
                    stuck: "a.wav",
                })
            },
            Settings {
                max_storage_bytes: 500,
                ..Settings::default()
            },
        );
        for (i, name) in ["a.wav", "b.wav", "c.wav"].iter().enumerate() {
            let done = write_segment(&env, name, 1_000 + i as i64, 300);
            env.engine.register(&done).unwrap();
        }

        let freed = env.engine.enforce_storage_limit().unwrap();
        assert_eq!(freed, 600);
        let left = env.store.get_all().unwrap();
        assert_eq!(left.len(), 1);
        assert!(left[0].file_path.ends_with("a.wav"));
        assert!(env.dir.join("a.wav").exists());
    }

    #[test]
    fn test_eviction_stops_without_progress() {
        let env = env_with(
            |dir| {
                Arc::new(StubbornFiles {
                    inner: LocalFileStore::new(dir).unwrap(),
                    stuck: "only.wav",
                })
            },
            Settings {
                max_storage_bytes: 10,
                ..Settings::default()
            },
        );
        let done = write_segment(&env, "only.wav", 1_000, 300);
        env.engine.register(&done).unwrap();
        assert_eq!(env.engine.enforce_storage_limit().unwrap(), 0);
        assert_eq!(env.store.count().unwrap(), 1);
    }

    #[test]
    fn test_emergency_cleanup_ignores_configured_limit() {
        let env = env(Settings::default());
        for (i, name) in ["a.wav", "b.wav", "c.wav"].iter().enumerate() {
            let done = write_segment(&env, name, 1_000 + i as i64, 100);
            env.engine.register(&done).unwrap();
        }
        assert_eq!(env.engine.emergency_cleanup(150, None).unwrap(), 200);
        assert!(env.dir.join("c.wav").exists());

        // The rows of the deleted files go on the next reconciliation.
        assert_eq!(env.store.count().unwrap(), 3);
        env.engine.reconcile_orphans(None, 0).unwrap();
        assert_eq!(env.store.count().unwrap(), 1);
    }

    #[test]
    fn test_emergency_cleanup_frees_unindexed_files() {
        let env = env(Settings::default());
        for name in ["a.wav", "b.wav", "c.wav"] {
            std::fs::write(env.dir.join(name), vec![0u8; 100]).unwrap();
        }
        let active = env.dir.join("a.wav");

        let freed = env.engine.emergency_cleanup(150, Some(&active)).unwrap();
        assert_eq!(freed, 200);
        assert!(active.exists());
        assert!(!env.dir.join("b.wav").exists());
        assert!(!env.dir.join("c.wav").exists());
    }

    /// Index whose oldest-first query races a concurrent delete of the
    /// first row it returns.
    struct RacingStore {
        inner: SqliteSegmentStore,
        files: LocalFileStore,
    }

    impl SegmentStore for RacingStore {
        fn insert(&self, segment: &NewSegment) -> Result<i64, CaptureError> {
            self.inner.insert(segment)
        }
        fn get_by_id(&self, id: i64) -> Result<Option<Segment>, CaptureError> {
            self.inner.get_by_id(id)
        }
        fn get_all(&self) -> Result<Vec<Segment>, CaptureError> {
            self.inner.get_all()
        }
        fn get_in_range(&self, from: i64, to: i64) -> Result<Vec<Segment>, CaptureError> {
            self.inner.get_in_range(from, to)
        }
        fn get_older_than(&self, timestamp: i64) -> Result<Vec<Segment>, CaptureError> {
            self.inner.get_older_than(timestamp)
        }
        fn get_oldest(&self, limit: usize) -> Result<Vec<Segment>, CaptureError> {
            let batch = self.inner.get_oldest(limit)?;
            if let Some(first) = batch.first() {
                self.files.delete(&first.file_path);
                self.inner.delete_by_id(first.id)?;
            }
            Ok(batch)
        }
        fn get_all_paths(&self) -> Result<Vec<PathBuf>, CaptureError> {
            self.inner.get_all_paths()
        }
        fn total_size(&self) -> Result<u64, CaptureError> {
            self.inner.total_size()
        }
        fn count(&self) -> Result<u64, CaptureError> {
            self.inner.count()
        }
        fn set_saved(&self, id: i64, saved: bool) -> Result<bool, CaptureError> {
            self.inner.set_saved(id, saved)
        }
        fn delete_by_id(&self, id: i64) -> Result<bool, CaptureError> {
            self.inner.delete_by_id(id)
        }
        fn delete_by_ids(&self, ids: &[i64]) -> Result<usize, CaptureError> {
            self.inner.delete_by_ids(ids)
        }
        fn delete_all(&self) -> Result<usize, CaptureError> {
            self.inner.delete_all()
        }
    }

    #[test]
    fn test_concurrently_deleted_segment_is_not_counted_as_freed() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("segments");
        let files = Arc::new(LocalFileStore::new(&dir).unwrap());
        let store: Arc<dyn SegmentStore> = Arc::new(RacingStore {
            inner: SqliteSegmentStore::open_in_memory().unwrap(),
            files: LocalFileStore::new(&dir).unwrap(),
        });
        let (_settings, settings_rx) = watch::channel(Settings {
            max_storage_bytes: 1_000_000,
            ..Settings::default()
        });
        let engine = RetentionEngine::new(store.clone(), files, settings_rx, 0);
        for (i, name) in ["a.wav", "b.wav", "c.wav"].iter().enumerate() {
            let path = dir.join(name);
            std::fs::write(&path, vec![0u8; 400_000]).unwrap();
            let done = CompletedSegment {
                path,
                start_time: 1_000 + i as i64 * 60_000,
                duration: 60_000,
                call: None,
            };
            engine.register(&done).unwrap();
        }

        // "a" vanishes under the pass; only "b" counts toward the excess.
        assert_eq!(engine.enforce_storage_limit().unwrap(), 400_000);
        let left = store.get_all().unwrap();
        assert_eq!(left.len(), 1);
        assert!(left[0].file_path.ends_with("c.wav"));
    }

    #[test]
    fn test_storage_stats_include_expected_usage() {
        let env = env(Settings::default());
        let done = write_segment(&env, "a.wav", 1_000, 300);
        env.engine.register(&done).unwrap();
        let stats = env.engine.storage_stats().unwrap();
        assert_eq!(stats.total_bytes, 300);
        assert_eq!(stats.segment_count, 1);
        // 4000 B/s over ten 60s segments, plus 20%.
        assert_eq!(stats.expected_bytes, 4000 * 60 * 12);
    }

    #[test]
    fn test_delete_and_save() {
        let env = env(Settings::default());
        let a = write_segment(&env, "a.wav", 1_000, 10);
        let b = write_segment(&env, "b.wav", 2_000, 10);
        let id_a = env.engine.register(&a).unwrap();
        let id_b = env.engine.register(&b).unwrap();

        let saved_dir = env.dir.parent().unwrap().join("saved");
        let dest = env.engine.save_segment(id_b, &saved_dir).unwrap().unwrap();
        assert!(dest.exists());
        assert!(env.store.get_by_id(id_b).unwrap().unwrap().is_saved);

        assert!(env.engine.delete_segment(id_a).unwrap());
        assert!(!env.engine.delete_segment(id_a).unwrap());
        assert_eq!(env.engine.delete_all().unwrap(), 1);
        assert_eq!(env.store.count().unwrap(), 0);
        // The exported copy outlives the rotating original.
        assert!(dest.exists());
    }

    #[test]
    fn test_storage_stats() {
        let env = env(Settings::default());
        let a = write_segment(&env, "a.wav", 1_000, 1_024);
        env.engine.register(&a).unwrap();
        let stats = env.engine.storage_stats().unwrap();
        assert_eq!(stats.total_bytes, 1_024);
        assert_eq!(stats.segment_count, 1);
    }

    #[tokio::test]
    async fn test_worker_registers_and_drains_on_close() {
        let env = env(Settings::default());
        let engine = Arc::new(env.engine);
        let (tx, rx) = mpsc::unbounded_channel();
        let (_session_tx, session_rx) = watch::channel(SessionSnapshot::idle());
        let a = {
            let path = env.dir.join("a.wav");
            std::fs::write(&path, vec![0u8; 64]).unwrap();
            CompletedSegment {
                path,
                start_time: Utc::now().timestamp_millis() - 60_000,
                duration: 60_000,
                call: None,
            }
        };
        tx.send(a).unwrap();
        drop(tx);
        run_worker(engine.clone(), rx, session_rx, Duration::from_secs(3600)).await;
        assert_eq!(env.store.count().unwrap(), 1);
    }
}
