//! Staging of local files for transmission.
//!
//! Small files are read into memory, large files are handed over by path so
//! that memory use stays bounded regardless of file size. Either way the
//! content has passed the secret-scanning gate before the caller sees it.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::config::StagingConfig;
use crate::scan::SecretScanner;
use crate::{Result, ZipstageError};

/// Default memory-staging threshold (5MB).
pub const DEFAULT_MEMORY_THRESHOLD: u64 = 5 * 1024 * 1024;

/// A file prepared for transmission.
#[derive(Debug)]
pub enum StagedContent {
    /// Content buffered in memory; clear with [`clear_staged_content`] after use.
    Memory { content: Vec<u8>, path: PathBuf },
    /// Content left on disk; never deleted by staging.
    Disk { path: PathBuf },
}

impl StagedContent {
    /// Path of the source file.
    pub fn path(&self) -> &Path {
        match self {
            StagedContent::Memory { path, .. } | StagedContent::Disk { path } => path,
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, StagedContent::Memory { .. })
    }
}

/// Zero and release in-memory content.
///
/// `Disk` content is left alone; the source file belongs to the caller.
pub fn clear_staged_content(staged: &mut StagedContent) {
    if let StagedContent::Memory { content, .. } = staged {
        content.fill(0);
        content.clear();
        content.shrink_to_fit();
    }
}

/// Stages local files behind the secret-scanning gate.
#[derive(Clone)]
pub struct Stager {
    memory_threshold: u64,
    scanner: Arc<dyn SecretScanner>,
}

impl Stager {
    pub fn new(memory_threshold: u64, scanner: Arc<dyn SecretScanner>) -> Self {
        Self {
            memory_threshold,
            scanner,
        }
    }

    pub fn from_config(config: &StagingConfig, scanner: Arc<dyn SecretScanner>) -> Self {
        Self::new(config.memory_threshold_bytes, scanner)
    }

    /// Stage a file.
    ///
    /// Files strictly smaller than the threshold come back as `Memory`,
    /// everything else as `Disk`. Content with a detected secret is never
    /// returned.
    pub async fn stage(&self, path: &Path) -> Result<StagedContent> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Err(ZipstageError::NotFound(format!("File: {}", path.display()))),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ZipstageError::NotFound(format!("File: {}", path.display())))
            }
            Err(e) => return Err(e.into()),
        };

        if metadata.len() >= self.memory_threshold {
            return self.stage_on_disk(path).await;
        }

        // The file may grow between the stat and the read.
        let Some(mut content) = read_bounded(path, self.memory_threshold).await? else {
            return self.stage_on_disk(path).await;
        };

        if let Err(detection) = self.scanner.scan_bytes(&content) {
            content.fill(0);
            warn!(
                path = %path.display(),
                secret_type = %detection.secret_type,
                "Refusing to stage file containing a secret"
            );
            return Err(detection.into());
        }

        debug!(path = %path.display(), size = content.len(), "Staged in memory");
        Ok(StagedContent::Memory {
            content,
            path: path.to_path_buf(),
        })
    }

    async fn stage_on_disk(&self, path: &Path) -> Result<StagedContent> {
        self.scan_on_disk(path).await?;
        debug!(path = %path.display(), "Staged on disk");
        Ok(StagedContent::Disk {
            path: path.to_path_buf(),
        })
    }

    /// Run the gate over a large file without buffering it.
    async fn scan_on_disk(&self, path: &Path) -> Result<()> {
        let scanner = Arc::clone(&self.scanner);
        let owned = path.to_path_buf();

        let result = tokio::task::spawn_blocking(move || scanner.scan_file(&owned))
            .await
            .map_err(|e| ZipstageError::Io(std::io::Error::other(e)))?;

        if let Err(ZipstageError::SecretDetected { secret_type, .. }) = &result {
            warn!(
                path = %path.display(),
                secret_type = %secret_type,
                "Refusing to stage file containing a secret"
            );
        }
        result
    }
}

/// Read a file only if it is shorter than `limit` bytes.
///
/// Never buffers more than `limit` bytes. `None` means the file reached the
/// limit; the partial buffer is zeroed before it is dropped.
async fn read_bounded(path: &Path, limit: u64) -> Result<Option<Vec<u8>>> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(ZipstageError::NotFound(format!("File: {}", path.display())))
        }
        Err(e) => return Err(e.into()),
    };

    let mut content = Vec::new();
    file.take(limit).read_to_end(&mut content).await?;

    if content.len() as u64 >= limit {
        content.fill(0);
        return Ok(None);
    }
    Ok(Some(content))
}
