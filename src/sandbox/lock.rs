//! Advisory per-sandbox lock persisted as a file.
//!
//! The lock record lives at `<sandbox>/.lock` and is the only shared state
//! between independent invocations:
//! ```json
//! { "timestamp": 1718000000000, "token": "owner-token" }
//! ```
//! Records older than the TTL count as released and are removed on sight.
//!
//! Every change to the record (publish, release, expiry, self-healing
//! removal) happens while holding an OS file lock on `<sandbox>/.lock.guard`,
//! so a check and the change that follows it cannot interleave with another
//! process. Records are written to a temporary file and renamed into place,
//! so readers never observe a partial record.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use fs4::FileExt;
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::Result;

/// File name of the lock record inside a sandbox root.
pub const LOCK_FILE_NAME: &str = ".lock";

/// File name of the guard serializing changes to the lock record.
pub const GUARD_FILE_NAME: &str = ".lock.guard";

/// Default lock time-to-live (30 minutes).
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30 * 60);

/// Persisted lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Acquisition time in epoch milliseconds.
    pub timestamp: i64,
    /// Owner token.
    pub token: String,
}

impl LockRecord {
    fn new(owner: &str) -> Self {
        Self {
            timestamp: Utc::now().timestamp_millis(),
            token: owner.to_string(),
        }
    }

    /// Whether the record is older than `ttl` at epoch-ms `now`.
    pub fn is_expired_at(&self, now: i64, ttl: Duration) -> bool {
        now.saturating_sub(self.timestamp) > ttl.as_millis() as i64
    }
}

/// Path of the lock record for a sandbox root.
pub fn lock_path(root: &Path) -> PathBuf {
    root.join(LOCK_FILE_NAME)
}

fn guard_path(lock: &Path) -> PathBuf {
    lock.with_file_name(GUARD_FILE_NAME)
}

/// Run `f` while holding the exclusive guard lock.
///
/// The OS lock is released when the guard file is closed, including when the
/// process dies.
fn with_guard<T>(lock: &Path, f: impl FnOnce() -> io::Result<T>) -> io::Result<T> {
    let guard = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(guard_path(lock))?;
    guard.lock_exclusive()?;
    let result = f();
    drop(guard);
    result
}

async fn blocking<T, F>(f: F) -> io::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(io::Error::other)?
}

/// Read and parse a lock record. `Ok(None)` when absent, `InvalidData` when corrupt.
pub(crate) fn read_record(path: &Path) -> io::Result<Option<LockRecord>> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| io::Error::new(ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn remove_record(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Current unexpired record. Expired and corrupt records are removed.
///
/// Caller holds the guard.
fn live_record(path: &Path, ttl: Duration) -> io::Result<Option<LockRecord>> {
    match read_record(path) {
        Ok(Some(record)) if !record.is_expired_at(Utc::now().timestamp_millis(), ttl) => {
            Ok(Some(record))
        }
        Ok(Some(_)) => {
            debug!(lock = %path.display(), "Removing expired lock record");
            remove_record(path)?;
            Ok(None)
        }
        Ok(None) => Ok(None),
        Err(e) if e.kind() == ErrorKind::InvalidData => {
            warn!(lock = %path.display(), error = %e, "Removing unreadable lock record");
            remove_record(path)?;
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Write `record` next to the lock path and rename it into place.
///
/// Caller holds the guard and has checked that no live record exists.
fn publish(path: &Path, record: &LockRecord) -> io::Result<()> {
    let tmp = path.with_file_name(format!("{LOCK_FILE_NAME}.{}.tmp", Uuid::new_v4()));

    let written = (|| -> io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(&serde_json::to_vec(record)?)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if written.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    written
}

/// Remove a lock record if it is older than `ttl`.
///
/// Unreadable records are judged by file modification time. Returns whether
/// the record was removed.
pub(crate) async fn remove_if_stale(lock: &Path, ttl: Duration) -> io::Result<bool> {
    if !tokio::fs::try_exists(lock).await? {
        return Ok(false);
    }

    let lock = lock.to_path_buf();
    blocking(move || {
        with_guard(&lock, || {
            let stale = match read_record(&lock) {
                Ok(Some(record)) => record.is_expired_at(Utc::now().timestamp_millis(), ttl),
                Ok(None) => return Ok(false),
                Err(e) if e.kind() == ErrorKind::InvalidData => {
                    let modified = fs::metadata(&lock)?.modified()?;
                    SystemTime::now()
                        .duration_since(modified)
                        .unwrap_or(Duration::ZERO)
                        > ttl
                }
                Err(e) => return Err(e),
            };

            if stale {
                remove_record(&lock)?;
            }
            Ok(stale)
        })
    })
    .await
}

/// Advisory lock for one sandbox.
///
/// Acquisition never blocks on a holder; contention is reported as `false`
/// and the caller decides whether to retry.
#[derive(Debug, Clone)]
pub struct LockManager {
    /// `None` when isolation is disabled; every operation is then a no-op.
    path: Option<PathBuf>,
    ttl: Duration,
    /// Pending expiry tasks by owner token.
    expiries: Arc<Mutex<HashMap<String, AbortHandle>>>,
}

impl LockManager {
    /// Create a lock manager for a sandbox root.
    pub fn new(root: &Path, ttl: Duration) -> Self {
        Self {
            path: Some(lock_path(root)),
            ttl,
            expiries: Arc::default(),
        }
    }

    /// Create a lock manager that never locks.
    pub fn disabled() -> Self {
        Self {
            path: None,
            ttl: DEFAULT_LOCK_TTL,
            expiries: Arc::default(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Try to take the lock for `owner`.
    ///
    /// At most one caller wins while a live record exists, across tasks and
    /// processes. On success an expiry task is scheduled that removes the
    /// record after the TTL, but only if the record still belongs to this
    /// acquisition.
    pub async fn acquire(&self, owner: &str) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(true);
        };

        let record = LockRecord::new(owner);
        let acquired = {
            let path = path.clone();
            let record = record.clone();
            let ttl = self.ttl;
            blocking(move || {
                with_guard(&path, || {
                    if live_record(&path, ttl)?.is_some() {
                        return Ok(false);
                    }
                    publish(&path, &record)?;
                    Ok(true)
                })
            })
            .await?
        };

        if !acquired {
            info!(lock = %path.display(), "Sandbox lock is held by another owner");
            return Ok(false);
        }

        debug!(lock = %path.display(), "Sandbox lock acquired");
        self.schedule_expiry(path.clone(), record);
        Ok(true)
    }

    /// Whether an unexpired lock record exists.
    ///
    /// Corrupt and expired records are deleted.
    pub async fn is_locked(&self) -> Result<bool> {
        Ok(self.holder().await?.is_some())
    }

    /// Get the current unexpired lock record, if any.
    pub async fn holder(&self) -> Result<Option<LockRecord>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        if !tokio::fs::try_exists(path).await? {
            return Ok(None);
        }

        let path = path.clone();
        let ttl = self.ttl;
        match blocking(move || with_guard(&path, || live_record(&path, ttl))).await {
            Ok(record) => Ok(record),
            // The sandbox went away underneath us.
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Release the lock held by `owner`.
    ///
    /// A missing record counts as released. A record held by someone else is
    /// left untouched and `false` is returned.
    pub async fn release(&self, owner: &str) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(true);
        };
        self.cancel_expiry(owner);

        if !tokio::fs::try_exists(path).await? {
            return Ok(true);
        }

        let released = {
            let path = path.clone();
            let owner = owner.to_string();
            let ttl = self.ttl;
            blocking(move || {
                with_guard(&path, || match live_record(&path, ttl)? {
                    None => Ok(true),
                    Some(record) if record.token == owner => {
                        remove_record(&path)?;
                        Ok(true)
                    }
                    Some(_) => Ok(false),
                })
            })
            .await?
        };

        if released {
            debug!(lock = %path.display(), "Sandbox lock released");
        } else {
            warn!(lock = %path.display(), "Refusing to release a lock held by another owner");
        }
        Ok(released)
    }

    fn expiries(&self) -> MutexGuard<'_, HashMap<String, AbortHandle>> {
        self.expiries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_expiry(&self, owner: &str) {
        if let Some(task) = self.expiries().remove(owner) {
            task.abort();
        }
    }

    /// Number of expiry tasks still pending.
    pub fn pending_expiries(&self) -> usize {
        self.expiries().values().filter(|t| !t.is_finished()).count()
    }

    fn schedule_expiry(&self, path: PathBuf, record: LockRecord) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // Without a runtime the TTL check in `holder` still expires the record.
            return;
        };
        let ttl = self.ttl;
        let owner = record.token.clone();

        let task = handle.spawn(async move {
            tokio::time::sleep(ttl).await;

            let shown = path.display().to_string();
            let removed = blocking(move || {
                with_guard(&path, || match read_record(&path) {
                    Ok(Some(current)) if current == record => {
                        remove_record(&path)?;
                        Ok(true)
                    }
                    _ => Ok(false),
                })
            })
            .await;

            match removed {
                Ok(true) => debug!(lock = %shown, "Lock record expired"),
                Ok(false) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(lock = %shown, error = %e, "Failed to expire lock record"),
            }
        });

        if let Some(previous) = self.expiries().insert(owner, task.abort_handle()) {
            previous.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_lock(ttl: Duration) -> (TempDir, LockManager) {
        let temp_dir = TempDir::new().unwrap();
        let lock = LockManager::new(temp_dir.path(), ttl);
        (temp_dir, lock)
    }

    async fn write_record(root: &Path, record: &LockRecord) {
        tokio::fs::write(lock_path(root), serde_json::to_vec(record).unwrap())
            .await
            .unwrap();
    }

    fn stale_record(token: &str) -> LockRecord {
        LockRecord {
            timestamp: Utc::now().timestamp_millis() - 31 * 60 * 1000,
            token: token.to_string(),
        }
    }

    /// Race `contenders` acquirers on one sandbox and count the winners.
    async fn race(root: &Path, contenders: usize) -> usize {
        let mut tasks = Vec::with_capacity(contenders);
        for i in 0..contenders {
            let lock = LockManager::new(root, DEFAULT_LOCK_TTL);
            tasks.push(tokio::spawn(async move {
                lock.acquire(&format!("owner-{i}")).await.unwrap()
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        winners
    }

    #[tokio::test]
    async fn test_acquire_and_reacquire() {
        let (_temp_dir, lock) = setup_lock(DEFAULT_LOCK_TTL);

        assert!(lock.acquire("owner-a").await.unwrap());
        assert!(lock.is_locked().await.unwrap());
        assert!(!lock.acquire("owner-a").await.unwrap());
        assert!(!lock.acquire("owner-b").await.unwrap());

        assert!(lock.release("owner-a").await.unwrap());
        assert!(lock.acquire("owner-b").await.unwrap());
    }

    #[tokio::test]
    async fn test_record_format() {
        let (temp_dir, lock) = setup_lock(DEFAULT_LOCK_TTL);

        lock.acquire("owner-a").await.unwrap();

        let body = std::fs::read_to_string(lock_path(temp_dir.path())).unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["token"], "owner-a");
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_has_one_winner() {
        for _ in 0..100 {
            let temp_dir = TempDir::new().unwrap();
            assert_eq!(race(temp_dir.path(), 8).await, 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_takeover_of_stale_record_has_one_winner() {
        for _ in 0..100 {
            let temp_dir = TempDir::new().unwrap();
            write_record(temp_dir.path(), &stale_record("crashed")).await;

            assert_eq!(race(temp_dir.path(), 8).await, 1);

            let holder = read_record(&lock_path(temp_dir.path())).unwrap().unwrap();
            assert!(holder.token.starts_with("owner-"));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_takeover_of_corrupt_record_has_one_winner() {
        for _ in 0..50 {
            let temp_dir = TempDir::new().unwrap();
            std::fs::write(lock_path(temp_dir.path()), b"").unwrap();

            assert_eq!(race(temp_dir.path(), 8).await, 1);
        }
    }

    #[tokio::test]
    async fn test_release_by_non_owner_keeps_lock() {
        let (_temp_dir, lock) = setup_lock(DEFAULT_LOCK_TTL);

        lock.acquire("owner-a").await.unwrap();

        assert!(!lock.release("intruder").await.unwrap());
        assert!(lock.is_locked().await.unwrap());
        assert_eq!(lock.holder().await.unwrap().unwrap().token, "owner-a");
    }

    #[tokio::test]
    async fn test_release_without_record_is_ok() {
        let (_temp_dir, lock) = setup_lock(DEFAULT_LOCK_TTL);
        assert!(lock.release("owner-a").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_cancels_expiry_task() {
        let (_temp_dir, lock) = setup_lock(DEFAULT_LOCK_TTL);

        for round in 0..5 {
            let owner = format!("owner-{round}");
            assert!(lock.acquire(&owner).await.unwrap());
            assert_eq!(lock.pending_expiries(), 1);
            assert!(lock.release(&owner).await.unwrap());
            assert_eq!(lock.pending_expiries(), 0);
        }
    }

    #[tokio::test]
    async fn test_expired_record_is_unlocked_and_removed() {
        let (temp_dir, lock) = setup_lock(DEFAULT_LOCK_TTL);
        write_record(temp_dir.path(), &stale_record("old-owner")).await;

        assert!(!lock.is_locked().await.unwrap());
        assert!(!lock_path(temp_dir.path()).exists());
        assert!(lock.acquire("new-owner").await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_unlocked_and_removed() {
        let (temp_dir, lock) = setup_lock(DEFAULT_LOCK_TTL);
        std::fs::write(lock_path(temp_dir.path()), b"{not json").unwrap();

        assert!(!lock.is_locked().await.unwrap());
        assert!(!lock_path(temp_dir.path()).exists());
    }

    #[tokio::test]
    async fn test_auto_expiry_removes_own_record() {
        let (temp_dir, lock) = setup_lock(Duration::from_millis(50));

        assert!(lock.acquire("owner-a").await.unwrap());
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!lock_path(temp_dir.path()).exists());
    }

    #[tokio::test]
    async fn test_auto_expiry_spares_newer_owner() {
        let (temp_dir, lock) = setup_lock(Duration::from_millis(100));

        assert!(lock.acquire("owner-a").await.unwrap());

        // Someone else takes over after the first record went away.
        let newer = LockRecord {
            timestamp: Utc::now().timestamp_millis() + 60_000,
            token: "owner-b".to_string(),
        };
        write_record(temp_dir.path(), &newer).await;

        tokio::time::sleep(Duration::from_millis(300)).await;

        let current = read_record(&lock_path(temp_dir.path())).unwrap().unwrap();
        assert_eq!(current, newer);
    }

    #[tokio::test]
    async fn test_remove_if_stale() {
        let temp_dir = TempDir::new().unwrap();
        let lock = lock_path(temp_dir.path());

        assert!(!remove_if_stale(&lock, DEFAULT_LOCK_TTL).await.unwrap());

        write_record(temp_dir.path(), &LockRecord::new("live")).await;
        assert!(!remove_if_stale(&lock, DEFAULT_LOCK_TTL).await.unwrap());
        assert!(lock.exists());

        write_record(temp_dir.path(), &stale_record("gone")).await;
        assert!(remove_if_stale(&lock, DEFAULT_LOCK_TTL).await.unwrap());
        assert!(!lock.exists());
    }

    #[tokio::test]
    async fn test_disabled_lock_is_noop() {
        let lock = LockManager::disabled();

        assert!(lock.acquire("owner-a").await.unwrap());
        assert!(lock.acquire("owner-b").await.unwrap());
        assert!(!lock.is_locked().await.unwrap());
        assert!(lock.release("anyone").await.unwrap());
    }

    #[test]
    fn test_is_expired_at() {
        let record = LockRecord {
            timestamp: 1_000,
            token: "t".to_string(),
        };
        let ttl = Duration::from_millis(500);
        assert!(!record.is_expired_at(1_500, ttl));
        assert!(record.is_expired_at(1_501, ttl));
    }
}
