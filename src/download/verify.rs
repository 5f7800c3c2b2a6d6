//! Verification of downloaded files.
//!
//! A download is accepted only if its extension is allowed, its content
//! agrees with the extension, and it passes the secret-scanning gate. A
//! rejected file is deleted before the error is returned.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::config::VerifyConfig;
use crate::scan::SecretScanner;
use crate::{Result, ZipstageError};

/// MIME type assumed for extensions without a mapping.
const OCTET_STREAM: &str = "application/octet-stream";

/// Format recognised from leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sniffed {
    pub mime: &'static str,
    /// Native binaries, bytecode and scripts.
    pub executable: bool,
}

impl Sniffed {
    const fn data(mime: &'static str) -> Option<Self> {
        Some(Self {
            mime,
            executable: false,
        })
    }

    const fn exec(mime: &'static str) -> Option<Self> {
        Some(Self {
            mime,
            executable: true,
        })
    }
}

/// Classify content by its magic bytes.
///
/// Returns `None` for formats without a signature, such as plain text.
pub fn sniff(prefix: &[u8]) -> Option<Sniffed> {
    let starts = |magic: &[u8]| prefix.starts_with(magic);
    let at = |offset: usize, magic: &[u8]| {
        prefix
            .get(offset..offset + magic.len())
            .is_some_and(|bytes| bytes == magic)
    };

    // Executables
    if starts(b"\x7fELF") {
        return Sniffed::exec("application/x-elf");
    }
    if starts(b"MZ") {
        return Sniffed::exec("application/x-msdownload");
    }
    if starts(b"\xfe\xed\xfa\xce")
        || starts(b"\xfe\xed\xfa\xcf")
        || starts(b"\xce\xfa\xed\xfe")
        || starts(b"\xcf\xfa\xed\xfe")
        || starts(b"\xca\xfe\xba\xbe")
    {
        return Sniffed::exec("application/x-mach-binary");
    }
    if starts(b"\0asm") {
        return Sniffed::exec("application/wasm");
    }
    if starts(b"#!") {
        return Sniffed::exec("text/x-shellscript");
    }

    // Images
    if starts(b"\x89PNG\r\n\x1a\n") {
        return Sniffed::data("image/png");
    }
    if starts(b"\xff\xd8\xff") {
        return Sniffed::data("image/jpeg");
    }
    if starts(b"GIF87a") || starts(b"GIF89a") {
        return Sniffed::data("image/gif");
    }
    if starts(b"RIFF") && at(8, b"WEBP") {
        return Sniffed::data("image/webp");
    }
    if starts(b"BM") && at(6, b"\0\0\0\0") {
        return Sniffed::data("image/bmp");
    }
    if starts(b"\0\0\x01\0") {
        return Sniffed::data("image/x-icon");
    }
    if starts(b"II*\0") || starts(b"MM\0*") {
        return Sniffed::data("image/tiff");
    }

    // Documents and archives
    if starts(b"%PDF-") {
        return Sniffed::data("application/pdf");
    }
    if starts(b"PK\x03\x04") || starts(b"PK\x05\x06") {
        return Sniffed::data("application/zip");
    }
    if starts(b"\x1f\x8b") {
        return Sniffed::data("application/gzip");
    }
    if starts(b"7z\xbc\xaf\x27\x1c") {
        return Sniffed::data("application/x-7z-compressed");
    }
    if starts(b"Rar!\x1a\x07") {
        return Sniffed::data("application/vnd.rar");
    }
    if starts(b"BZh") {
        return Sniffed::data("application/x-bzip2");
    }
    if starts(b"\xfd7zXZ\0") {
        return Sniffed::data("application/x-xz");
    }

    // Audio and video
    if starts(b"RIFF") && at(8, b"WAVE") {
        return Sniffed::data("audio/wav");
    }
    if starts(b"RIFF") && at(8, b"AVI ") {
        return Sniffed::data("video/x-msvideo");
    }
    if starts(b"ID3") || starts(b"\xff\xfb") || starts(b"\xff\xf3") || starts(b"\xff\xf2") {
        return Sniffed::data("audio/mpeg");
    }
    if starts(b"OggS") {
        return Sniffed::data("audio/ogg");
    }
    if starts(b"fLaC") {
        return Sniffed::data("audio/flac");
    }
    if starts(b"\x1a\x45\xdf\xa3") {
        return Sniffed::data("video/webm");
    }
    if at(4, b"ftyp") {
        return if at(8, b"qt  ") {
            Sniffed::data("video/quicktime")
        } else {
            Sniffed::data("video/mp4")
        };
    }
    if at(4, b"moov") || at(4, b"mdat") || at(4, b"wide") || at(4, b"free") {
        return Sniffed::data("video/quicktime");
    }

    None
}

/// Collapse MIME aliases onto one name.
fn canonical(mime: &str) -> &str {
    match mime {
        "image/jpg" | "image/pjpeg" => "image/jpeg",
        "image/vnd.microsoft.icon" => "image/x-icon",
        "image/x-ms-bmp" | "image/x-bmp" => "image/bmp",
        "audio/x-wav" | "audio/wave" | "audio/vnd.wave" => "audio/wav",
        "audio/mp3" | "audio/x-mp3" | "audio/mpeg3" => "audio/mpeg",
        "audio/x-flac" => "audio/flac",
        "application/ogg" | "video/ogg" | "audio/vorbis" => "audio/ogg",
        "audio/webm" | "video/x-matroska" => "video/webm",
        // ISO base media files share one container format.
        "video/quicktime" | "audio/mp4" | "audio/m4a" | "audio/x-m4a" | "video/x-m4v" => {
            "video/mp4"
        }
        "application/x-gzip" => "application/gzip",
        "application/x-zip-compressed" => "application/zip",
        "application/x-rar-compressed" | "application/x-rar" => "application/vnd.rar",
        other => other,
    }
}

/// Formats stored inside a ZIP container.
fn is_zip_container(mime: &str) -> bool {
    mime.starts_with("application/vnd.openxmlformats-officedocument.")
        || mime.starts_with("application/vnd.oasis.opendocument.")
        || matches!(
            mime,
            "application/epub+zip"
                | "application/java-archive"
                | "application/vnd.android.package-archive"
        )
}

/// Formats that always begin with a signature [`sniff`] knows.
fn requires_signature(mime: &str) -> bool {
    is_zip_container(mime)
        || matches!(
            mime,
            "image/png"
                | "image/jpeg"
                | "image/gif"
                | "image/webp"
                | "image/bmp"
                | "image/x-icon"
                | "image/tiff"
                | "application/pdf"
                | "application/zip"
                | "application/gzip"
                | "application/x-7z-compressed"
                | "application/vnd.rar"
                | "audio/flac"
                | "audio/wav"
                | "video/mp4"
                | "video/webm"
        )
}

/// Check that sniffed content agrees with the extension's MIME type.
///
/// Returns the detected type on disagreement.
pub fn check_consistency(expected: &str, sniffed: Option<Sniffed>) -> std::result::Result<(), String> {
    let expected = canonical(expected);

    match sniffed {
        Some(sniffed) => {
            let detected = canonical(sniffed.mime);
            let agrees = detected == expected
                || (!sniffed.executable && detected == "application/zip" && is_zip_container(expected));
            if agrees {
                Ok(())
            } else {
                Err(sniffed.mime.to_string())
            }
        }
        None if requires_signature(expected) => Err("unknown".to_string()),
        None => Ok(()),
    }
}

/// A download that passed verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifiedFile {
    pub path: PathBuf,
    pub extension: String,
    pub expected_mime: String,
    pub detected_mime: Option<String>,
}

/// Verifies downloaded files against their extension and the secret gate.
#[derive(Clone)]
pub struct ContentVerifier {
    allowed_extensions: Vec<String>,
    sniff_bytes: usize,
    scanner: Arc<dyn SecretScanner>,
}

impl ContentVerifier {
    pub fn new(
        allowed_extensions: impl IntoIterator<Item = impl AsRef<str>>,
        sniff_bytes: usize,
        scanner: Arc<dyn SecretScanner>,
    ) -> Self {
        Self {
            allowed_extensions: allowed_extensions
                .into_iter()
                .map(|ext| ext.as_ref().trim_start_matches('.').to_lowercase())
                .collect(),
            sniff_bytes,
            scanner,
        }
    }

    pub fn from_config(config: &VerifyConfig, scanner: Arc<dyn SecretScanner>) -> Self {
        Self::new(&config.allowed_extensions, config.sniff_bytes, scanner)
    }

    /// Check whether an extension is on the allow-list.
    pub fn is_allowed(&self, extension: &str) -> bool {
        let extension = extension.to_lowercase();
        self.allowed_extensions.iter().any(|ext| *ext == extension)
    }

    /// Verify a downloaded file, deleting it on rejection.
    pub async fn verify(&self, path: &Path) -> Result<VerifiedFile> {
        match self.inspect(path).await {
            Ok(verified) => {
                debug!(
                    path = %path.display(),
                    mime = %verified.expected_mime,
                    "Download verified"
                );
                Ok(verified)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Rejecting download");
                discard(path).await;
                Err(e)
            }
        }
    }

    async fn inspect(&self, path: &Path) -> Result<VerifiedFile> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase)
            .ok_or_else(|| ZipstageError::UnsupportedFileType("file has no extension".to_string()))?;

        if !self.is_allowed(&extension) {
            return Err(ZipstageError::UnsupportedFileType(format!(".{extension}")));
        }

        let expected = mime_guess::from_ext(&extension)
            .first_raw()
            .unwrap_or(OCTET_STREAM);

        let prefix = self.read_prefix(path).await?;
        let sniffed = sniff(&prefix);

        if let Err(detected) = check_consistency(expected, sniffed) {
            return Err(ZipstageError::MimeMismatch {
                expected: expected.to_string(),
                detected,
            });
        }

        let scanner = Arc::clone(&self.scanner);
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || scanner.scan_file(&owned))
            .await
            .map_err(|e| ZipstageError::Io(std::io::Error::other(e)))??;

        Ok(VerifiedFile {
            path: path.to_path_buf(),
            extension,
            expected_mime: expected.to_string(),
            detected_mime: sniffed.map(|s| s.mime.to_string()),
        })
    }

    async fn read_prefix(&self, path: &Path) -> Result<Vec<u8>> {
        let file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ZipstageError::NotFound(format!("File: {}", path.display())))
            }
            Err(e) => return Err(e.into()),
        };

        let mut prefix = Vec::with_capacity(self.sniff_bytes);
        file.take(self.sniff_bytes as u64)
            .read_to_end(&mut prefix)
            .await?;
        Ok(prefix)
    }
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove rejected file"),
    }
}
