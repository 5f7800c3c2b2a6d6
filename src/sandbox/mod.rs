//! Per-tenant sandboxes for zipstage.
//!
//! This module provides the isolated working area for untrusted content:
//! - Hashed per-tenant directories
//! - Path validation against traversal and absolute names
//! - File-based advisory locking with TTL expiry
//! - Age-based garbage collection
//! - File operations scoped to one sandbox

pub mod files;
pub mod gc;
pub mod lock;
pub mod path;
pub mod resolver;

pub use files::{SandboxEntry, SandboxFiles};
pub use gc::{CleanupReport, GarbageCollector};
pub use lock::{LockManager, LockRecord, DEFAULT_LOCK_TTL, GUARD_FILE_NAME, LOCK_FILE_NAME};
pub use path::{resolve, validate_name, PathRejection};
pub use resolver::{sandbox_id, SandboxResolver, USERS_DIR};
