//! Ingestion pipeline boundary.
//!
//! [`Ingestor`] wires the sandbox, staging and download components together
//! and is the surface the presentation layer calls. Results can be turned
//! into an [`Outcome`] so that no failure escapes as a panic.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::download::{ContentVerifier, Downloader, FetchOptions};
use crate::error::ErrorKind;
use crate::sandbox::{CleanupReport, GarbageCollector, LockManager, SandboxFiles, SandboxResolver};
use crate::scan::{PatternScanner, SecretScanner};
use crate::staging::{self, StagedContent, Stager};
use crate::{Result, ZipstageError};

/// Entry point for staging and downloading untrusted content.
#[derive(Clone)]
pub struct Ingestor {
    resolver: SandboxResolver,
    stager: Stager,
    downloader: Downloader,
    verifier: ContentVerifier,
    gc: GarbageCollector,
    fetch_options: FetchOptions,
    lock_ttl: Duration,
    max_read_bytes: u64,
}

impl Ingestor {
    /// Build an ingestor with a custom secret scanner.
    pub fn new(config: &Config, scanner: Arc<dyn SecretScanner>) -> Result<Self> {
        let resolver = SandboxResolver::from_config(&config.sandbox)?;

        Ok(Self {
            stager: Stager::from_config(&config.staging, Arc::clone(&scanner)),
            downloader: Downloader::new(&config.download)?,
            verifier: ContentVerifier::from_config(&config.verify, scanner),
            gc: GarbageCollector::from_config(&resolver, &config.sandbox),
            fetch_options: FetchOptions::from_config(&config.download),
            lock_ttl: config.sandbox.lock_ttl(),
            max_read_bytes: config.staging.max_read_bytes,
            resolver,
        })
    }

    /// Build an ingestor with the built-in pattern scanner.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config, Arc::new(PatternScanner::new()?))
    }

    pub fn resolver(&self) -> &SandboxResolver {
        &self.resolver
    }

    pub fn garbage_collector(&self) -> &GarbageCollector {
        &self.gc
    }

    /// Sandbox root for an identity, without creating it.
    pub fn sandbox_root(&self, secret: Option<&str>) -> Result<PathBuf> {
        self.resolver.sandbox_root(secret)
    }

    /// File operations in the identity's sandbox, creating it if needed.
    pub async fn files(&self, secret: Option<&str>) -> Result<SandboxFiles> {
        let root = self.resolver.ensure_sandbox(secret).await?;
        Ok(SandboxFiles::new(root, self.max_read_bytes))
    }

    /// Lock manager for the identity's sandbox.
    pub fn lock(&self, secret: Option<&str>) -> Result<LockManager> {
        let root = self.resolver.sandbox_root(secret)?;
        Ok(self.lock_for(&root))
    }

    fn lock_for(&self, root: &Path) -> LockManager {
        if self.resolver.is_isolated() {
            LockManager::new(root, self.lock_ttl)
        } else {
            LockManager::disabled()
        }
    }

    /// Stage a local file for transmission.
    pub async fn stage_file(&self, path: &Path) -> Result<StagedContent> {
        self.stager.stage(path).await
    }

    /// Zero and drop staged in-memory content.
    pub fn clear_staged_content(&self, staged: &mut StagedContent) {
        staging::clear_staged_content(staged);
    }

    /// Download `url` into the identity's sandbox and verify it.
    ///
    /// The sandbox lock is held for the duration and released on every path.
    /// Returns the path of the verified file.
    pub async fn download(
        &self,
        secret: Option<&str>,
        url: &str,
        filename: Option<&str>,
    ) -> Result<PathBuf> {
        let root = self.resolver.ensure_sandbox(secret).await?;
        let lock = self.lock_for(&root);
        let owner = Uuid::new_v4().to_string();

        if !lock.acquire(&owner).await? {
            return Err(ZipstageError::LockConflict(
                "another operation is using this sandbox".to_string(),
            ));
        }

        let result = self.fetch_and_verify(url, &root, filename).await;

        match lock.release(&owner).await {
            Ok(true) => {}
            Ok(false) => warn!(owner = %owner, "Sandbox lock changed hands during download"),
            Err(e) => warn!(owner = %owner, error = %e, "Failed to release sandbox lock"),
        }

        result
    }

    async fn fetch_and_verify(
        &self,
        url: &str,
        root: &Path,
        filename: Option<&str>,
    ) -> Result<PathBuf> {
        let mut options = self.fetch_options.clone();
        options.filename = filename.map(str::to_string);

        let path = self.downloader.fetch(url, root, &options).await?;
        let verified = self.verifier.verify(&path).await?;

        info!(
            path = %verified.path.display(),
            mime = %verified.expected_mime,
            "Download accepted"
        );
        Ok(verified.path)
    }

    /// Run both garbage-collection sweeps once.
    pub async fn cleanup(&self) -> CleanupReport {
        self.gc.initialize_cleanup().await
    }
}

/// Serializable result handed to the presentation layer.
///
/// Serializes as `{"ok": true, "value": ...}` or
/// `{"ok": false, "kind": ..., "message": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> Outcome<T> {
    pub fn success(value: T) -> Self {
        Self {
            ok: true,
            value: Some(value),
            kind: None,
            message: None,
        }
    }

    pub fn failure(error: &ZipstageError) -> Self {
        Self {
            ok: false,
            value: None,
            kind: Some(error.kind()),
            message: Some(error.to_string()),
        }
    }
}

impl<T> From<Result<T>> for Outcome<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => Outcome::success(value),
            Err(e) => Outcome::failure(&e),
        }
    }
}
