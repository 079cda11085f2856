//! Pluggable object store for durable JSON documents.
//!
//! The registry and ideas stores write whole documents at a time, so the
//! interface is deliberately small: read a document, replace a document.
//! Replacement must be atomic with respect to concurrent readers.

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

/// Storage abstraction for whole-document reads and writes.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Read the full contents of a document. Returns `NotFound` when absent.
    async fn read(&self, path: &str) -> io::Result<String>;

    /// Replace a document's contents. The new contents must become visible
    /// all-at-once; a concurrent `read` sees either the old or the new
    /// document, never a partial write.
    async fn write(&self, path: &str, contents: &str) -> io::Result<()>;
}

/// Local-disk store rooted at a directory.
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn read(&self, path: &str) -> io::Result<String> {
        tokio::fs::read_to_string(self.resolve(path)).await
    }

    async fn write(&self, path: &str, contents: &str) -> io::Result<()> {
        let target = self.resolve(path);
        let parent = target.parent().unwrap_or(Path::new(".")).to_path_buf();
        std::fs::create_dir_all(&parent)?;

        // Write-then-rename so readers never observe a torn document.
        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        tmp.write_all(contents.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(())
    }
}

/// In-memory store for tests and embedding without a filesystem.
#[derive(Default)]
pub struct MemoryFileStore {
    files: Mutex<HashMap<String, String>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn read(&self, path: &str) -> io::Result<String> {
        let files = self.files.lock().await;
        files
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no such document: {}", path)))
    }

    async fn write(&self, path: &str, contents: &str) -> io::Result<()> {
        let mut files = self.files.lock().await;
        files.insert(path.to_string(), contents.to_string());
        Ok(())
    }
}
