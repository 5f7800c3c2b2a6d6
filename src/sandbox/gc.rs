//! Garbage collection of old sandboxes and stale lock records.
//!
//! Eligibility is by age alone. A sandbox whose directory has not been
//! modified for the retention window is removed even if it still contains a
//! lock record; keeping the retention window far above the lock TTL is what
//! makes that case unreachable in practice. It is not a hard guarantee.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use crate::sandbox::lock::{lock_path, remove_if_stale};
use crate::sandbox::SandboxResolver;
use crate::Result;

/// Counters from a combined sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub sandboxes_removed: usize,
    pub locks_removed: usize,
}

/// Sweeps `<base>/users` for expired sandboxes and lock records.
#[derive(Debug, Clone)]
pub struct GarbageCollector {
    users_dir: PathBuf,
    retention: Duration,
    lock_ttl: Duration,
    enabled: bool,
}

impl GarbageCollector {
    pub fn new(resolver: &SandboxResolver, retention: Duration, lock_ttl: Duration) -> Self {
        Self {
            users_dir: resolver.users_dir(),
            retention,
            lock_ttl,
            enabled: resolver.is_isolated(),
        }
    }

    pub fn from_config(resolver: &SandboxResolver, config: &SandboxConfig) -> Self {
        Self::new(resolver, config.retention(), config.lock_ttl())
    }

    /// Remove sandboxes whose modification time is older than the retention window.
    ///
    /// Returns the number of sandboxes removed. Failures on single entries
    /// are logged and skipped.
    pub async fn cleanup_old_sandboxes(&self) -> Result<usize> {
        if !self.enabled {
            return Ok(0);
        }

        let mut entries = match tokio::fs::read_dir(&self.users_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            match self.sweep_sandbox(&path).await {
                Ok(true) => {
                    info!(sandbox = %path.display(), "Removed expired sandbox");
                    removed += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(sandbox = %path.display(), error = %e, "Failed to clean up sandbox");
                }
            }
        }

        Ok(removed)
    }

    async fn sweep_sandbox(&self, path: &Path) -> std::io::Result<bool> {
        // symlink_metadata so that a planted symlink is never followed.
        let metadata = tokio::fs::symlink_metadata(path).await?;
        if !metadata.is_dir() {
            return Ok(false);
        }

        if age_of(metadata.modified()?) <= self.retention {
            return Ok(false);
        }

        tokio::fs::remove_dir_all(path).await?;
        Ok(true)
    }

    /// Remove lock records older than the lock TTL in every sandbox.
    ///
    /// Unreadable records are judged by file modification time.
    pub async fn cleanup_stale_locks(&self) -> Result<usize> {
        if !self.enabled {
            return Ok(0);
        }

        let mut entries = match tokio::fs::read_dir(&self.users_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let lock = lock_path(&entry.path());
            match remove_if_stale(&lock, self.lock_ttl).await {
                Ok(true) => {
                    info!(lock = %lock.display(), "Removed stale lock record");
                    removed += 1;
                }
                Ok(false) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(lock = %lock.display(), error = %e, "Failed to clean up lock record");
                }
            }
        }

        Ok(removed)
    }

    /// Run both sweeps once.
    ///
    /// Intended for startup hygiene; errors are logged and reported as zero.
    pub async fn initialize_cleanup(&self) -> CleanupReport {
        let sandboxes_removed = self.cleanup_old_sandboxes().await.unwrap_or_else(|e| {
            warn!(error = %e, "Sandbox sweep failed");
            0
        });
        let locks_removed = self.cleanup_stale_locks().await.unwrap_or_else(|e| {
            warn!(error = %e, "Lock sweep failed");
            0
        });

        let report = CleanupReport {
            sandboxes_removed,
            locks_removed,
        };
        if report == CleanupReport::default() {
            debug!("Nothing to clean up");
        } else {
            info!(
                sandboxes_removed = report.sandboxes_removed,
                locks_removed = report.locks_removed,
                "Cleanup finished"
            );
        }
        report
    }

    /// Run the combined sweep every `interval` until `shutdown` turns true.
    pub fn spawn_periodic(
        self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);

            // Skip the first immediate tick; startup runs its own sweep.
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        self.initialize_cleanup().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Periodic cleanup stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}

fn age_of(modified: SystemTime) -> Duration {
    SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO)
}
