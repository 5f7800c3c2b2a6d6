//! Per-tenant sandbox directories.
//!
//! Every tenant gets a directory named after the SHA-256 of its identity
//! secret:
//! ```text
//! {base_dir}/
//! └── users/
//!     ├── 9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08/
//!     │   ├── .lock
//!     │   └── report.pdf
//!     └── ...
//! ```

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::SandboxConfig;
use crate::{Result, ZipstageError};

/// Directory under the base that holds per-tenant sandboxes.
pub const USERS_DIR: &str = "users";

/// Compute the directory name for an identity secret.
///
/// Returns 64 lowercase hex characters.
pub fn sandbox_id(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Maps tenant identities to sandbox directories.
#[derive(Debug, Clone)]
pub struct SandboxResolver {
    base_dir: PathBuf,
    isolation: bool,
}

impl SandboxResolver {
    /// Create a resolver rooted at `base_dir`.
    ///
    /// With `isolation` off every tenant shares `base_dir`, and locking and
    /// garbage collection become no-ops.
    pub fn new(base_dir: impl Into<PathBuf>, isolation: bool) -> Self {
        Self {
            base_dir: base_dir.into(),
            isolation,
        }
    }

    /// Build a resolver from configuration.
    pub fn from_config(config: &SandboxConfig) -> Result<Self> {
        let resolver = Self::new(config.base_path()?, !config.disable_isolation);
        if !resolver.isolation {
            warn!(
                base_dir = %resolver.base_dir.display(),
                "Per-tenant isolation is disabled; all tenants share one directory"
            );
        }
        Ok(resolver)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory containing all tenant sandboxes.
    pub fn users_dir(&self) -> PathBuf {
        self.base_dir.join(USERS_DIR)
    }

    pub fn is_isolated(&self) -> bool {
        self.isolation
    }

    /// Get the sandbox root for an identity secret without touching the disk.
    pub fn sandbox_root(&self, secret: Option<&str>) -> Result<PathBuf> {
        if !self.isolation {
            return Ok(self.base_dir.clone());
        }

        match secret {
            Some(secret) if !secret.is_empty() => Ok(self.users_dir().join(sandbox_id(secret))),
            _ => Err(ZipstageError::Config(
                "identity secret is required to resolve a sandbox".to_string(),
            )),
        }
    }

    /// Get the sandbox root, creating it with owner-only permissions.
    pub async fn ensure_sandbox(&self, secret: Option<&str>) -> Result<PathBuf> {
        let root = self.sandbox_root(secret)?;
        tokio::fs::create_dir_all(&root).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o700)).await?;
        }

        debug!(root = %root.display(), "Sandbox ready");
        Ok(root)
    }
}
