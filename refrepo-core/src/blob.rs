//! Blob storage capability.
//!
//! The core consumes content-addressed JSONL files through the [`BlobStore`]
//! trait: pull-based line readers, push-based line writers, and signed URLs
//! handed to robots. Readers and writers release their underlying handles on
//! drop; an unfinished writer leaves a partial file behind, which is fine
//! because files are only referenced once `finish` has returned.

use std::num::NonZeroUsize;
use std::path::PathBuf;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::debug;

use crate::error::{Error, Result};

/// Maximum number of cached per-container clients.
const CLIENT_CACHE_SIZE: usize = 1000;

/// A file in blob storage, addressed by location, container, path and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobFile {
    pub location: String,
    pub container: String,
    pub path: String,
    pub filename: String,
}

impl BlobFile {
    pub fn new(
        location: impl Into<String>,
        container: impl Into<String>,
        path: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            location: location.into(),
            container: container.into(),
            path: path.into(),
            filename: filename.into(),
        }
    }

    /// Key within the container.
    pub fn key(&self) -> String {
        format!("{}/{}", self.path, self.filename)
    }
}

impl std::fmt::Display for BlobFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}://{}/{}/{}",
            self.location, self.container, self.path, self.filename
        )
    }
}

/// Whether a signed URL permits reading or uploading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignedUrlKind {
    Download,
    Upload,
}

/// Pull-based line reader over a blob stream.
#[async_trait]
pub trait BlobLineReader: Send {
    /// Next line of the file, without the trailing newline. `None` at EOF.
    async fn next_line(&mut self) -> Result<Option<String>>;
}

/// Push-based line writer into a blob.
#[async_trait]
pub trait BlobLineWriter: Send {
    async fn write_line(&mut self, line: &str) -> Result<()>;
    /// Flush and persist; returns the finished file handle.
    async fn finish(&mut self) -> Result<BlobFile>;
}

/// Content-addressed object storage with streamed read/write and signed
/// URLs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Open a streaming writer at `path/filename` in the default container.
    async fn create(&self, path: &str, filename: &str) -> Result<Box<dyn BlobLineWriter>>;

    /// Open a streaming line reader over an existing blob.
    async fn stream_lines(&self, file: &BlobFile) -> Result<Box<dyn BlobLineReader>>;

    /// Signed URL for out-of-band access by robots and importers.
    async fn signed_url(&self, file: &BlobFile, kind: SignedUrlKind) -> Result<String>;

    /// Upload a full set of lines. Convenience over [`BlobStore::create`].
    async fn upload_lines(
        &self,
        path: &str,
        filename: &str,
        lines: Vec<String>,
    ) -> Result<BlobFile> {
        let mut writer = self.create(path, filename).await?;
        for line in &lines {
            writer.write_line(line).await?;
        }
        writer.finish().await
    }
}

// ============================================================================
// Filesystem implementation
// ============================================================================

/// Blob store backed by the local filesystem.
///
/// Containers map to directories under the root. Signed URLs are `file://`
/// URLs carrying an expiry timestamp; there is no enforcement beyond the
/// path being reachable, which is all local robots need.
pub struct FsBlobStore {
    root: PathBuf,
    location: String,
    container: String,
    url_expiry_seconds: u64,
    /// Cache of resolved container directories, keyed like remote client
    /// configs would be.
    container_cache: Mutex<LruCache<(String, String), PathBuf>>,
}

impl FsBlobStore {
    pub fn new(
        root: impl Into<PathBuf>,
        location: impl Into<String>,
        container: impl Into<String>,
        url_expiry_seconds: u64,
    ) -> Self {
        Self {
            root: root.into(),
            location: location.into(),
            container: container.into(),
            url_expiry_seconds,
            container_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CLIENT_CACHE_SIZE).expect("non-zero cache size"),
            )),
        }
    }

    async fn container_dir(&self, location: &str, container: &str) -> Result<PathBuf> {
        let cache_key = (location.to_string(), container.to_string());
        if let Some(dir) = self.container_cache.lock().get(&cache_key) {
            return Ok(dir.clone());
        }
        if location != self.location {
            return Err(Error::BlobStorage(format!(
                "unsupported blob storage location: {location}"
            )));
        }
        let dir = self.root.join(container);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::BlobStorage(format!("failed to create container dir: {e}")))?;
        self.container_cache.lock().put(cache_key, dir.clone());
        Ok(dir)
    }

    async fn resolve(&self, file: &BlobFile) -> Result<PathBuf> {
        let dir = self.container_dir(&file.location, &file.container).await?;
        Ok(dir.join(&file.path).join(&file.filename))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn create(&self, path: &str, filename: &str) -> Result<Box<dyn BlobLineWriter>> {
        let file = BlobFile::new(&self.location, &self.container, path, filename);
        let full_path = self.resolve(&file).await?;
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::BlobStorage(format!("failed to create blob path: {e}")))?;
        }
        let handle = fs::File::create(&full_path)
            .await
            .map_err(|e| Error::BlobStorage(format!("failed to create blob {file}: {e}")))?;
        debug!(blob = %file, "opened blob writer");
        Ok(Box::new(FsLineWriter {
            file,
            writer: Some(BufWriter::new(handle)),
        }))
    }

    async fn stream_lines(&self, file: &BlobFile) -> Result<Box<dyn BlobLineReader>> {
        let full_path = self.resolve(file).await?;
        let handle = fs::File::open(&full_path)
            .await
            .map_err(|e| Error::BlobStorage(format!("failed to open blob {file}: {e}")))?;
        Ok(Box::new(FsLineReader {
            lines: BufReader::new(handle).lines(),
        }))
    }

    async fn signed_url(&self, file: &BlobFile, kind: SignedUrlKind) -> Result<String> {
        let full_path = self.resolve(file).await?;
        let verb = match kind {
            SignedUrlKind::Download => "download",
            SignedUrlKind::Upload => "upload",
        };
        let expires =
            chrono::Utc::now() + chrono::Duration::seconds(self.url_expiry_seconds as i64);
        Ok(format!(
            "file://{}?verb={verb}&expires={}",
            full_path.display(),
            expires.timestamp()
        ))
    }
}

struct FsLineReader {
    lines: tokio::io::Lines<BufReader<fs::File>>,
}

#[async_trait]
impl BlobLineReader for FsLineReader {
    async fn next_line(&mut self) -> Result<Option<String>> {
        self.lines
            .next_line()
            .await
            .map_err(|e| Error::BlobStorage(format!("failed to read blob line: {e}")))
    }
}

struct FsLineWriter {
    file: BlobFile,
    writer: Option<BufWriter<fs::File>>,
}

#[async_trait]
impl BlobLineWriter for FsLineWriter {
    async fn write_line(&mut self, line: &str) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::BlobStorage("write after finish".to_string()))?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::BlobStorage(format!("failed to write blob line: {e}")))?;
        writer
            .write_all(b"\n")
            .await
            .map_err(|e| Error::BlobStorage(format!("failed to write blob line: {e}")))?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<BlobFile> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| Error::BlobStorage("finish called twice".to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::BlobStorage(format!("failed to flush blob: {e}")))?;
        Ok(self.file.clone())
    }
}
