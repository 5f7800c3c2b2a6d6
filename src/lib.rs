//! zipstage - sandboxed staging of untrusted files
//!
//! Stages local files and downloads remote ones into per-tenant sandboxes
//! before they are forwarded to a Zipline file host.

pub mod config;
pub mod download;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod sandbox;
pub mod scan;
pub mod staging;

pub use config::Config;
pub use download::{ContentVerifier, Downloader, FetchOptions, VerifiedFile};
pub use error::{ErrorKind, Result, ZipstageError};
pub use pipeline::{Ingestor, Outcome};
pub use sandbox::{
    resolve, sandbox_id, validate_name, CleanupReport, GarbageCollector, LockManager, LockRecord,
    PathRejection, SandboxFiles, SandboxResolver,
};
pub use scan::{PatternScanner, SecretDetection, SecretScanner};
pub use staging::{clear_staged_content, StagedContent, Stager};
