//! Artifact sinks: where captured body bytes land on disk.
//!
//! A sink opens its file lazily on the first non-empty write, so a body
//! that never yields data leaves no file behind. The transaction directory
//! is shared by the request and response sinks through [`ArtifactDir`],
//! which creates it at most once.

use async_compression::tokio::write::GzipEncoder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::OnceCell;

use crate::error::CaptureError;

/// Storage encoding of a body artifact, fixed when the sink is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkFlavor {
    /// Bytes are stored as received.
    #[default]
    Plain,
    /// Bytes are stored as a gzip stream.
    Gzip,
}

/// Directory holding the artifacts of one transaction.
#[derive(Debug)]
pub struct ArtifactDir {
    path: PathBuf,
    created: OnceCell<()>,
}

impl ArtifactDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            created: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the directory has been created by this handle.
    pub fn is_created(&self) -> bool {
        self.created.initialized()
    }

    /// Create the directory if this is the first artifact to need it.
    ///
    /// Concurrent callers wait on the same creation. A failed attempt is
    /// not cached, so a later artifact retries.
    pub async fn ensure(&self) -> Result<(), CaptureError> {
        self.created
            .get_or_try_init(|| async {
                tokio::fs::create_dir_all(&self.path)
                    .await
                    .map_err(|source| CaptureError::Directory {
                        path: self.path.clone(),
                        source,
                    })
            })
            .await
            .map(|_| ())
    }
}

enum ArtifactWriter {
    Plain(BufWriter<File>),
    Gzip(GzipEncoder<BufWriter<File>>),
}

impl ArtifactWriter {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            ArtifactWriter::Plain(w) => w.write_all(buf).await,
            ArtifactWriter::Gzip(w) => w.write_all(buf).await,
        }
    }

    /// Flush buffered bytes, finish the gzip trailer, and close the file.
    async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            ArtifactWriter::Plain(w) => w.shutdown().await,
            ArtifactWriter::Gzip(w) => w.shutdown().await,
        }
    }
}

/// Write side of one body artifact.
pub struct ArtifactSink {
    dir: std::sync::Arc<ArtifactDir>,
    path: PathBuf,
    leaf: &'static str,
    flavor: SinkFlavor,
    writer: Option<ArtifactWriter>,
    written: u64,
}

impl ArtifactSink {
    /// Create a sink for `dir/leaf`. Nothing touches the disk yet.
    pub fn new(dir: std::sync::Arc<ArtifactDir>, leaf: &'static str, flavor: SinkFlavor) -> Self {
        let path = dir.path().join(leaf);
        Self {
            dir,
            path,
            leaf,
            flavor,
            writer: None,
            written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Leaf name inside the transaction directory (`req` or `res`).
    pub fn leaf(&self) -> &'static str {
        self.leaf
    }

    pub fn flavor(&self) -> SinkFlavor {
        self.flavor
    }

    /// Uncompressed bytes accepted so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Append a chunk, opening the artifact on first use.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), CaptureError> {
        if chunk.is_empty() {
            return Ok(());
        }

        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => self.open().await?,
        };
        let writer = self.writer.insert(writer);

        writer
            .write_all(chunk)
            .await
            .map_err(|source| CaptureError::Write {
                path: self.path.clone(),
                source,
            })?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn open(&self) -> Result<ArtifactWriter, CaptureError> {
        self.dir.ensure().await?;
        let file = File::create(&self.path)
            .await
            .map_err(|source| CaptureError::Write {
                path: self.path.clone(),
                source,
            })?;
        let file = BufWriter::new(file);
        Ok(match self.flavor {
            SinkFlavor::Plain => ArtifactWriter::Plain(file),
            SinkFlavor::Gzip => ArtifactWriter::Gzip(GzipEncoder::new(file)),
        })
    }

    /// Flush and close the artifact. Returns the number of bytes captured.
    ///
    /// A sink that never received data closes cleanly without creating a file.
    pub async fn close(mut self) -> Result<u64, CaptureError> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .shutdown()
                .await
                .map_err(|source| CaptureError::Close {
                    path: self.path.clone(),
                    source,
                })?;
        }
        Ok(self.written)
    }
}

impl std::fmt::Debug for ArtifactSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactSink")
            .field("path", &self.path)
            .field("flavor", &self.flavor)
            .field("open", &self.writer.is_some())
            .field("written", &self.written)
            .finish()
    }
}
