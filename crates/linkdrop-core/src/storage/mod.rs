//! Where transfer bytes come from and where they go.
//!
//! ## Sources
//!
//! A [`TransferSource`] hands the send pipeline a forward-only stream for
//! the main loop, plus independent range readers for retransmission.
//!
//! ## Sinks
//!
//! A [`SinkProvider`] decides whether a resumable on-disk destination is
//! available for an offer. When it declines, the receive pipeline falls
//! back to a [`MemorySink`] and materializes the bytes on completion.

use std::fmt;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::checksum::RunningCrc32;
use crate::error::{Error, Result};

/// Boxed reader returned by sources.
pub type SourceReader = Box<dyn AsyncRead + Send + Unpin>;

/// Something a peer can send.
pub trait TransferSource: Send + Sync + fmt::Debug {
    /// Name announced in the offer.
    fn name(&self) -> &str;

    /// Total size announced in the offer.
    fn size(&self) -> u64;

    /// Open a forward-only stream from the first byte.
    ///
    /// # Errors
    ///
    /// Returns an error if the source can no longer be read.
    fn open_stream(&self) -> Result<SourceReader>;

    /// Open an independent reader over `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the source can no longer be read.
    fn open_range(&self, offset: u64, len: u64) -> Result<SourceReader>;
}

/// A file on disk.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    name: String,
    size: u64,
}

impl FileSource {
    /// Describe the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] if nothing exists at `path`, or
    /// [`Error::InvalidPath`] if it is not a regular file.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let metadata = std::fs::metadata(&path)
            .map_err(|_| Error::FileNotFound(path.display().to_string()))?;

        if !metadata.is_file() {
            return Err(Error::InvalidPath(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::InvalidPath(path.display().to_string()))?;

        Ok(Self {
            path,
            name,
            size: metadata.len(),
        })
    }

    /// Path of the file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TransferSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn open_stream(&self) -> Result<SourceReader> {
        let file = std::fs::File::open(&self.path)?;
        Ok(Box::new(tokio::fs::File::from_std(file)))
    }

    fn open_range(&self, offset: u64, len: u64) -> Result<SourceReader> {
        let mut file = std::fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Box::new(tokio::fs::File::from_std(file).take(len)))
    }
}

/// Bytes held in memory.
#[derive(Clone)]
pub struct MemorySource {
    name: String,
    data: Arc<[u8]>,
}

impl MemorySource {
    /// Wrap `data` under the given name.
    #[must_use]
    pub fn new(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

impl fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySource")
            .field("name", &self.name)
            .field("size", &self.data.len())
            .finish()
    }
}

impl TransferSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn open_stream(&self) -> Result<SourceReader> {
        Ok(Box::new(std::io::Cursor::new(Arc::clone(&self.data))))
    }

    fn open_range(&self, offset: u64, len: u64) -> Result<SourceReader> {
        let mut cursor = std::io::Cursor::new(Arc::clone(&self.data));
        cursor.set_position(offset);
        Ok(Box::new(cursor.take(len)))
    }
}

/// Decides whether an offer gets a resumable on-disk destination.
pub trait SinkProvider: Send + Sync + fmt::Debug {
    /// Acquire a destination for `name`, or `Ok(None)` to decline.
    ///
    /// # Errors
    ///
    /// Returns an error if acquisition was attempted and failed. Callers
    /// treat this like a decline.
    fn acquire(&self, name: &str, size: u64) -> Result<Option<FileSink>>;
}

/// Writes received files into one directory.
#[derive(Debug, Clone)]
pub struct DirectorySinkProvider {
    dir: PathBuf,
}

impl DirectorySinkProvider {
    /// Save received files under `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The destination directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl SinkProvider for DirectorySinkProvider {
    fn acquire(&self, name: &str, _size: u64) -> Result<Option<FileSink>> {
        let Some(file_name) = Path::new(name).file_name() else {
            return Err(Error::InvalidPath(format!("offered name '{name}' has no file name")));
        };
        let path = sanitize_path(&self.dir, Path::new(file_name))
            .ok_or_else(|| Error::InvalidPath(format!("offered name '{name}' escapes the output directory")))?;

        std::fs::create_dir_all(&self.dir)?;
        FileSink::open(path).map(Some)
    }
}

/// Always declines, forcing the in-memory fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryOnlyProvider;

impl SinkProvider for MemoryOnlyProvider {
    fn acquire(&self, _name: &str, _size: u64) -> Result<Option<FileSink>> {
        Ok(None)
    }
}

/// Sanitize a path to prevent directory traversal attacks.
///
/// Returns the joined path, or `None` if `relative` climbs out of `base`.
#[must_use]
pub fn sanitize_path(base: &Path, relative: &Path) -> Option<PathBuf> {
    for component in relative.components() {
        if component == std::path::Component::ParentDir {
            return None;
        }
    }

    let full_path = base.join(relative);

    if full_path.starts_with(base) {
        Some(full_path)
    } else {
        None
    }
}

/// Format a file size for display.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Resumable on-disk destination.
///
/// Opening never truncates, so a partial file from an earlier attempt is
/// still there to resume from.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: tokio::fs::File,
    existing_size: u64,
}

impl FileSink {
    /// Open (or create) the file at `path` without truncating it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: PathBuf) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let existing_size = file.metadata()?.len();

        Ok(Self {
            path,
            file: tokio::fs::File::from_std(file),
            existing_size,
        })
    }

    /// Size of the file when it was opened.
    #[must_use]
    pub const fn existing_size(&self) -> u64 {
        self.existing_size
    }

    /// Destination path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the first `offset` bytes, drop the rest, and position the
    /// writer at `offset`.
    ///
    /// Returns a running CRC32 primed with the kept bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the kept prefix cannot be read or the file
    /// cannot be truncated.
    pub async fn resume_at(&mut self, offset: u64) -> Result<RunningCrc32> {
        let mut crc = RunningCrc32::new();

        if offset > 0 {
            self.file.seek(SeekFrom::Start(0)).await?;
            let mut prefix = (&mut self.file).take(offset);
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = prefix.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                crc.update(&buf[..n]);
            }
            if crc.bytes() != offset {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("partial file shorter than resume offset {offset}"),
                )));
            }
        }

        if self.existing_size > offset {
            self.file.set_len(offset).await?;
        }
        self.file.seek(SeekFrom::Start(offset)).await?;
        Ok(crc)
    }
}

/// In-memory accumulation for when no resumable destination is available.
#[derive(Debug, Default)]
pub struct MemorySink {
    buffer: Vec<u8>,
}

impl MemorySink {
    /// An empty sink with room for `size` bytes.
    #[must_use]
    pub fn with_capacity(size: u64) -> Self {
        Self {
            buffer: Vec::with_capacity(usize::try_from(size).unwrap_or(0).min(64 * 1024 * 1024)),
        }
    }
}

/// Where a receive pipeline writes.
#[derive(Debug)]
pub enum Sink {
    /// Resumable on-disk destination
    File(FileSink),
    /// In-memory fallback
    Memory(MemorySink),
}

/// What a sink produced once closed.
#[derive(Debug)]
pub enum SinkOutcome {
    /// The file is complete at this path
    Saved(PathBuf),
    /// The bytes, to be materialized by the caller
    Artifact(Vec<u8>),
}

impl Sink {
    /// Append bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to disk fails.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            Self::File(sink) => sink.file.write_all(bytes).await?,
            Self::Memory(sink) => sink.buffer.extend_from_slice(bytes),
        }
        Ok(())
    }

    /// Whether bytes go to memory rather than disk.
    #[must_use]
    pub const fn is_memory(&self) -> bool {
        matches!(self, Self::Memory(_))
    }

    /// Flush and close, yielding the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be flushed.
    pub async fn close(self) -> Result<SinkOutcome> {
        match self {
            Self::File(mut sink) => {
                sink.file.flush().await?;
                sink.file.sync_all().await?;
                Ok(SinkOutcome::Saved(sink.path))
            }
            Self::Memory(sink) => Ok(SinkOutcome::Artifact(sink.buffer)),
        }
    }

    /// Release without materializing.
    ///
    /// A partial file stays on disk so a later offer can resume it.
    pub async fn discard(self) {
        match self {
            Self::File(mut sink) => {
                if let Err(e) = sink.file.flush().await {
                    tracing::warn!(path = %sink.path.display(), "Failed to flush partial file: {e}");
                }
            }
            Self::Memory(_) => {}
        }
    }
}
