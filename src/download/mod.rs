//! Remote downloads for zipstage.
//!
//! - Bounded HTTP transfer into a sandbox
//! - Content verification against the file extension

pub mod fetcher;
pub mod verify;

pub use fetcher::{
    filename_from_url, validate_url, Downloader, FetchOptions, DEFAULT_MAX_BYTES, DEFAULT_TIMEOUT,
};
pub use verify::{check_consistency, sniff, ContentVerifier, Sniffed, VerifiedFile};
