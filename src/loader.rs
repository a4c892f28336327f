//! Local document loading and text extraction.
//!
//! [`FileLoader`] is the trait seam; [`FsLoader`] reads from disk and
//! normalizes text-like files, HTML, JSON, CSV, PDF, and EPUB into plain
//! UTF-8 text. Every path is checked against the configured
//! `research.local_document_roots` allowlist before any read happens.
//!
//! EPUB handling reads bounded ZIP entries to avoid decompression bombs.

use async_trait::async_trait;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::fetch::extract_page;

/// Maximum decompressed bytes read from a single EPUB entry.
const MAX_EPUB_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Extensions the ingestion pipeline accepts.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "txt", "md", "rst", "log", "html", "htm", "json", "csv", "pdf", "epub",
];

/// A normalized local document.
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub path: PathBuf,
    pub title: String,
    pub text: String,
}

#[async_trait]
pub trait FileLoader: Send + Sync {
    async fn load(&self, path: &Path) -> Result<LoadedDocument>;
}

/// Disk-backed loader honoring the document-root allowlist.
pub struct FsLoader {
    roots: Vec<PathBuf>,
}

impl FsLoader {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    /// Reject paths outside the allowlist. An empty allowlist disables
    /// local ingestion entirely.
    pub fn ensure_allowed(&self, path: &Path) -> Result<PathBuf> {
        if self.roots.is_empty() {
            return Err(Error::guardrail(
                path.display().to_string(),
                "local ingestion requires research.local_document_roots",
            ));
        }
        let resolved = path
            .canonicalize()
            .map_err(|e| Error::not_found("file", format!("{}: {}", path.display(), e)))?;
        let allowed = self.roots.iter().any(|root| {
            root.canonicalize()
                .map(|r| resolved.starts_with(r))
                .unwrap_or(false)
        });
        if !allowed {
            return Err(Error::guardrail(
                path.display().to_string(),
                "path outside research.local_document_roots",
            ));
        }
        Ok(resolved)
    }

    /// Expand explicit files and directories (recursively) into the list
    /// of supported files, allowlist-checked, in deterministic order.
    pub fn expand_paths(&self, paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for path in paths {
            let resolved = self.ensure_allowed(path)?;
            if resolved.is_dir() {
                for entry in walkdir::WalkDir::new(&resolved)
                    .sort_by_file_name()
                    .into_iter()
                    .filter_map(|e| e.ok())
                {
                    if entry.file_type().is_file() && is_supported(entry.path()) {
                        files.push(entry.path().to_path_buf());
                    }
                }
            } else if is_supported(&resolved) {
                files.push(resolved);
            } else {
                return Err(Error::InvalidArgument(format!(
                    "unsupported file type: {}",
                    path.display()
                )));
            }
        }
        files.dedup();
        Ok(files)
    }
}

pub fn is_supported(path: &Path) -> bool {
    extension_of(path)
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

#[async_trait]
impl FileLoader for FsLoader {
    async fn load(&self, path: &Path) -> Result<LoadedDocument> {
        let resolved = self.ensure_allowed(path)?;
        let ext = extension_of(&resolved).unwrap_or_default();
        let title = resolved
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("document")
            .to_string();

        let text = match ext.as_str() {
            "txt" | "md" | "rst" | "log" | "csv" => read_text(&resolved)?,
            "json" => {
                let raw = read_text(&resolved)?;
                // Validate but keep the author's formatting.
                serde_json::from_str::<serde_json::Value>(&raw)
                    .map_err(|e| Error::Integrity(format!("invalid JSON: {}", e)))?;
                raw
            }
            "html" | "htm" => {
                let raw = read_text(&resolved)?;
                extract_page(&raw, "").text
            }
            "pdf" => {
                let bytes = std::fs::read(&resolved)
                    .map_err(|e| Error::transport(e.to_string(), false))?;
                tokio::task::spawn_blocking(move || {
                    pdf_extract::extract_text_from_mem(&bytes)
                        .map_err(|e| Error::Integrity(format!("PDF extraction failed: {}", e)))
                })
                .await
                .map_err(|e| Error::transport(e.to_string(), false))??
            }
            "epub" => {
                let bytes = std::fs::read(&resolved)
                    .map_err(|e| Error::transport(e.to_string(), false))?;
                extract_epub(&bytes)?
            }
            other => {
                return Err(Error::InvalidArgument(format!(
                    "unsupported file type: .{}",
                    other
                )))
            }
        };

        Ok(LoadedDocument {
            path: resolved,
            title,
            text,
        })
    }
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| Error::transport(e.to_string(), false))
}

/// Concatenate the XHTML spine entries of an EPUB in archive order.
fn extract_epub(bytes: &[u8]) -> Result<String> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| Error::Integrity(format!("EPUB open failed: {}", e)))?;

    let mut chapter_names: Vec<String> = archive
        .file_names()
        .filter(|n| {
            let lower = n.to_ascii_lowercase();
            lower.ends_with(".xhtml") || lower.ends_with(".html") || lower.ends_with(".htm")
        })
        .map(|s| s.to_string())
        .collect();
    chapter_names.sort();

    if chapter_names.is_empty() {
        return Err(Error::Integrity("EPUB has no XHTML chapters".to_string()));
    }

    let mut out = String::new();
    for name in chapter_names {
        let entry = archive
            .by_name(&name)
            .map_err(|e| Error::Integrity(e.to_string()))?;
        let mut xml = Vec::new();
        entry
            .take(MAX_EPUB_ENTRY_BYTES)
            .read_to_end(&mut xml)
            .map_err(|e| Error::Integrity(e.to_string()))?;
        if xml.len() as u64 >= MAX_EPUB_ENTRY_BYTES {
            return Err(Error::Integrity(format!(
                "EPUB entry {} exceeds size limit",
                name
            )));
        }
        let html = String::from_utf8_lossy(&xml);
        let text = extract_page(&html, "").text;
        if !out.is_empty() && !text.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&text);
    }
    Ok(out)
}
