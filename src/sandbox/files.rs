//! File operations inside one sandbox.
//!
//! Every name goes through [`resolve`](crate::sandbox::resolve), so callers
//! can pass untrusted relative paths directly.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::sandbox::lock::LOCK_FILE_NAME;
use crate::sandbox::resolve;
use crate::{Result, ZipstageError};

/// A file listed from a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxEntry {
    /// Path relative to the sandbox root, `/`-separated.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
}

/// File access scoped to a sandbox root.
#[derive(Debug, Clone)]
pub struct SandboxFiles {
    root: PathBuf,
    max_read_bytes: u64,
}

impl SandboxFiles {
    /// Create a file accessor for `root`.
    ///
    /// `max_read_bytes` caps [`read`](Self::read); larger files must be staged.
    pub fn new(root: impl Into<PathBuf>, max_read_bytes: u64) -> Self {
        Self {
            root: root.into(),
            max_read_bytes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a name to its absolute path in the sandbox.
    pub fn path(&self, name: &str) -> Result<PathBuf> {
        resolve(&self.root, name)
    }

    /// Write content, creating intermediate directories.
    pub async fn write(&self, name: &str, content: &[u8]) -> Result<PathBuf> {
        let path = self.path(name)?;
        if is_lock_record(&self.root, &path) {
            return Err(ZipstageError::Validation(
                "the lock record cannot be written directly".to_string(),
            ));
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;

        Ok(path)
    }

    /// Read a file no larger than the direct-read cap.
    pub async fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path(name)?;
        let size = self.size_of(name, &path).await?;
        if size > self.max_read_bytes {
            return Err(ZipstageError::TooLarge {
                size,
                limit: self.max_read_bytes,
            });
        }

        match tokio::fs::read(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ZipstageError::NotFound(format!("File: {name}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a file. The lock record is off limits.
    ///
    /// Returns `true` if the file was deleted, `false` if it didn't exist.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let path = self.path(name)?;
        if is_lock_record(&self.root, &path) {
            return Err(ZipstageError::Validation(
                "the lock record cannot be deleted directly".to_string(),
            ));
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Check if a file exists.
    pub async fn exists(&self, name: &str) -> bool {
        match self.path(name) {
            Ok(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Get the size of a file.
    pub async fn file_size(&self, name: &str) -> Result<u64> {
        let path = self.path(name)?;
        self.size_of(name, &path).await
    }

    async fn size_of(&self, name: &str, path: &Path) -> Result<u64> {
        match tokio::fs::metadata(path).await {
            Ok(m) if m.is_file() => Ok(m.len()),
            Ok(_) => Err(ZipstageError::NotFound(format!("File: {name}"))),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ZipstageError::NotFound(format!("File: {name}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// List all files in the sandbox, sorted by name.
    ///
    /// The lock record is not listed. A missing root lists as empty.
    pub async fn list(&self) -> Result<Vec<SandboxEntry>> {
        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() && !is_lock_record(&self.root, &path) {
                    let size = entry.metadata().await?.len();
                    files.push(SandboxEntry {
                        name: relative_name(&self.root, &path),
                        size,
                    });
                }
            }
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }
}

/// The lock record, its guard and in-flight temporaries at the sandbox root.
fn is_lock_record(root: &Path, path: &Path) -> bool {
    if path.parent() != Some(root) {
        return false;
    }
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n == LOCK_FILE_NAME || n.starts_with(&format!("{LOCK_FILE_NAME}.")))
}

fn relative_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{LockManager, DEFAULT_LOCK_TTL};
    use tempfile::TempDir;

    fn setup_files() -> (TempDir, SandboxFiles) {
        let temp_dir = TempDir::new().unwrap();
        let files = SandboxFiles::new(temp_dir.path(), 1024);
        (temp_dir, files)
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (_temp_dir, files) = setup_files();
        let content = b"Hello, World!";

        let path = files.write("test.txt", content).await.unwrap();

        assert!(path.starts_with(files.root()));
        assert_eq!(files.read("test.txt").await.unwrap(), content);
    }

    #[tokio::test]
    async fn test_write_nested_creates_directories() {
        let (_temp_dir, files) = setup_files();

        files.write("a/b/c.txt", b"nested").await.unwrap();

        assert!(files.root().join("a").join("b").is_dir());
        assert_eq!(files.read("a/b/c.txt").await.unwrap(), b"nested");
    }

    #[tokio::test]
    async fn test_write_rejects_traversal() {
        let (_temp_dir, files) = setup_files();

        let result = files.write("../outside.txt", b"nope").await;
        assert!(matches!(result, Err(ZipstageError::InvalidPath { .. })));
    }

    #[tokio::test]
    async fn test_write_rejects_lock_record() {
        let (_temp_dir, files) = setup_files();

        let result = files.write(".lock", b"{}").await;
        assert!(matches!(result, Err(ZipstageError::Validation(_))));
        let result = files.write(".lock.guard", b"").await;
        assert!(matches!(result, Err(ZipstageError::Validation(_))));
    }

    #[tokio::test]
    async fn test_delete_rejects_held_lock_record() {
        let (temp_dir, files) = setup_files();
        let lock = LockManager::new(temp_dir.path(), DEFAULT_LOCK_TTL);
        assert!(lock.acquire("owner-a").await.unwrap());

        let result = files.delete(".lock").await;
        assert!(matches!(result, Err(ZipstageError::Validation(_))));
        let result = files.delete("./.lock").await;
        assert!(matches!(result, Err(ZipstageError::Validation(_))));

        assert_eq!(lock.holder().await.unwrap().unwrap().token, "owner-a");
        assert!(!lock.acquire("owner-b").await.unwrap());
    }

    #[tokio::test]
    async fn test_read_over_cap() {
        let (_temp_dir, files) = setup_files();
        files.write("big.bin", &vec![0u8; 2048]).await.unwrap();

        let result = files.read("big.bin").await;
        assert!(matches!(
            result,
            Err(ZipstageError::TooLarge {
                size: 2048,
                limit: 1024
            })
        ));
    }

    #[tokio::test]
    async fn test_read_not_found() {
        let (_temp_dir, files) = setup_files();

        let result = files.read("nonexistent.txt").await;
        assert!(matches!(result, Err(ZipstageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete() {
        let (_temp_dir, files) = setup_files();
        files.write("delete.txt", b"to delete").await.unwrap();
        assert!(files.exists("delete.txt").await);

        assert!(files.delete("delete.txt").await.unwrap());
        assert!(!files.exists("delete.txt").await);
        assert!(!files.delete("delete.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_size() {
        let (_temp_dir, files) = setup_files();
        files.write("test.txt", b"Hello, World!").await.unwrap();

        assert_eq!(files.file_size("test.txt").await.unwrap(), 13);
        assert!(matches!(
            files.file_size("missing.txt").await,
            Err(ZipstageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_sorted_without_lock() {
        let (temp_dir, files) = setup_files();
        files.write("b.txt", b"bb").await.unwrap();
        files.write("a.txt", b"a").await.unwrap();
        files.write("dir/c.txt", b"ccc").await.unwrap();
        std::fs::write(temp_dir.path().join(".lock"), b"{}").unwrap();
        std::fs::write(temp_dir.path().join(".lock.guard"), b"").unwrap();

        let listed = files.list().await.unwrap();

        assert_eq!(
            listed,
            vec![
                SandboxEntry {
                    name: "a.txt".to_string(),
                    size: 1
                },
                SandboxEntry {
                    name: "b.txt".to_string(),
                    size: 2
                },
                SandboxEntry {
                    name: "dir/c.txt".to_string(),
                    size: 3
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_list_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        let files = SandboxFiles::new(temp_dir.path().join("absent"), 1024);

        assert!(files.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_binary_content() {
        let (_temp_dir, files) = setup_files();
        let content: Vec<u8> = (0..=255).collect();

        files.write("binary.bin", &content).await.unwrap();
        assert_eq!(files.read("binary.bin").await.unwrap(), content);
    }
}
