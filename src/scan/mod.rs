//! Secret-scanning gate.
//!
//! Content is checked before it leaves the sandbox. The gate is fail-closed:
//! a match or a read failure rejects the content. Rejections carry the secret
//! classification and a masked sample, never the matched text itself.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use regex::bytes::Regex;
use thiserror::Error;

use crate::{Result, ZipstageError};

/// Bytes read per step when scanning a file.
const SCAN_CHUNK_SIZE: usize = 64 * 1024;

/// Bytes carried over between steps so that matches spanning a chunk
/// boundary are still found.
const SCAN_OVERLAP: usize = 1024;

/// Visible prefix length of a masked sample.
const SAMPLE_PREFIX_CHARS: usize = 4;

/// A rejected piece of content.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("secret detected ({secret_type}): {pattern_sample}")]
pub struct SecretDetection {
    /// Classification of the secret, e.g. `aws_access_key`.
    pub secret_type: String,
    /// Masked excerpt of the match.
    pub pattern_sample: String,
}

/// The scanning gate consulted before content is accepted.
pub trait SecretScanner: Send + Sync {
    /// Scan an in-memory buffer.
    fn scan_bytes(&self, content: &[u8]) -> std::result::Result<(), SecretDetection>;

    /// Scan a file in bounded chunks.
    fn scan_file(&self, path: &Path) -> Result<()> {
        let mut file = File::open(path)?;
        let mut window: Vec<u8> = Vec::with_capacity(SCAN_OVERLAP + SCAN_CHUNK_SIZE);
        let mut chunk = vec![0u8; SCAN_CHUNK_SIZE];

        loop {
            let read = file.read(&mut chunk)?;
            if read == 0 {
                return Ok(());
            }
            window.extend_from_slice(&chunk[..read]);
            self.scan_bytes(&window)?;

            let keep = window.len().min(SCAN_OVERLAP);
            window.drain(..window.len() - keep);
        }
    }
}

/// Regex-based scanner for well-known credential formats.
#[derive(Debug, Clone)]
pub struct PatternScanner {
    patterns: Vec<(String, Regex)>,
}

const DEFAULT_PATTERNS: &[(&str, &str)] = &[
    (
        "private_key",
        r"-----BEGIN (?:[A-Z0-9]+ )*PRIVATE KEY(?: BLOCK)?-----",
    ),
    ("aws_access_key", r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b"),
    ("github_token", r"\bgh[pousr]_[A-Za-z0-9]{36,}\b"),
    ("slack_token", r"\bxox[abprs]-[A-Za-z0-9-]{10,}"),
    ("openai_api_key", r"\bsk-(?:proj-)?[A-Za-z0-9_-]{20,}"),
    (
        "generic_secret",
        r#"(?i)\b(?:api[_-]?key|apikey|secret(?:[_-]?key)?|access[_-]?token|auth[_-]?token|client[_-]?secret|password|passwd)\b["']?\s*[:=]\s*["']?[^\s"'`]{8,}"#,
    ),
];

impl PatternScanner {
    /// Create a scanner with the built-in patterns.
    pub fn new() -> Result<Self> {
        Self::with_patterns(DEFAULT_PATTERNS.iter().copied())
    }

    /// Create a scanner from `(secret_type, regex)` pairs.
    pub fn with_patterns<'a>(patterns: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self> {
        let patterns = patterns
            .into_iter()
            .map(|(name, pattern)| {
                Regex::new(pattern)
                    .map(|regex| (name.to_string(), regex))
                    .map_err(|e| ZipstageError::Config(format!("invalid secret pattern {name}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { patterns })
    }
}

impl SecretScanner for PatternScanner {
    fn scan_bytes(&self, content: &[u8]) -> std::result::Result<(), SecretDetection> {
        for (secret_type, regex) in &self.patterns {
            if let Some(m) = regex.find(content) {
                return Err(SecretDetection {
                    secret_type: secret_type.clone(),
                    pattern_sample: mask_sample(m.as_bytes()),
                });
            }
        }
        Ok(())
    }
}

/// Keep a short prefix of a match and mask the rest.
pub fn mask_sample(matched: &[u8]) -> String {
    let text = String::from_utf8_lossy(matched);
    let visible = if text.chars().count() > 2 * SAMPLE_PREFIX_CHARS {
        SAMPLE_PREFIX_CHARS
    } else {
        SAMPLE_PREFIX_CHARS / 2
    };
    let prefix: String = text.chars().take(visible).collect();
    format!("{prefix}********")
}
