//! External collaborator interfaces.
//!
//! The corpus lives in an object store and arrives as PDF bytes; text
//! extraction (including OCR) happens elsewhere. The pipeline only sees
//! these two seams. The local implementations below back tests and the CLI.

use std::path::PathBuf;

use async_trait::async_trait;

use rcpdb_core::error::{Error, Result};

/// Where source documents come from. `source_id` is an opaque key unique
/// within the corpus.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn list(&self) -> Result<Vec<String>>;
    async fn fetch(&self, source_id: &str) -> Result<Vec<u8>>;
}

/// Byte-to-text extraction. May block for a long time (OCR); errors surface
/// as a single failure kind.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, bytes: &[u8]) -> Result<String>;
}

/// Directory-backed document store: every .pdf/.txt file under the root,
/// keyed by its relative path, listed in sorted order.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl DocumentStore for DirStore {
    async fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            let ext = path.extension().and_then(|s| s.to_str());
            if !matches!(ext, Some("pdf") | Some("txt")) {
                continue;
            }
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            ids.push(relative.to_string_lossy().to_string());
        }
        ids.sort();
        Ok(ids)
    }

    async fn fetch(&self, source_id: &str) -> Result<Vec<u8>> {
        let path = self.root.join(source_id);
        tokio::fs::read(&path)
            .await
            .map_err(|e| Error::External(format!("read {}: {}", path.display(), e)))
    }
}

/// Trivial extractor for corpora that are already text.
pub struct PlainTextExtractor;

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract(&self, bytes: &[u8]) -> Result<String> {
        match std::str::from_utf8(bytes) {
            Ok(text) => Ok(text.to_string()),
            Err(_) => Ok(String::from_utf8_lossy(bytes).to_string()),
        }
    }
}
