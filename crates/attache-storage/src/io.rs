//! Upload IO capability
//!
//! Anything that can be uploaded implements [`UploadIo`]: it can be read in
//! chunks, rewound to the start, report end-of-stream and be closed.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use attache_core::Metadata;
use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Default chunk size used when draining a stream
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Readable, rewindable, closable upload source
#[async_trait]
pub trait UploadIo: Send + Sync {
    /// Read up to `max` bytes; `None` once the stream is exhausted
    async fn read_chunk(&mut self, max: usize) -> io::Result<Option<Bytes>>;

    /// Seek back to the first byte
    async fn rewind(&mut self) -> io::Result<()>;

    /// Whether the next read would return `None`
    fn is_eof(&self) -> bool;

    /// Release the underlying resource. Closing twice is a no-op.
    async fn close(&mut self) -> io::Result<()>;

    fn is_closed(&self) -> bool;

    /// Filename as provided by the client
    fn original_filename(&self) -> Option<&str> {
        None
    }

    /// Content type as provided by the client
    fn content_type(&self) -> Option<&str> {
        None
    }

    /// Total size in bytes, when known without reading
    fn size(&self) -> Option<u64> {
        None
    }

    /// Metadata of a previously uploaded file this stream was opened from
    fn stored_metadata(&self) -> Option<&Metadata> {
        None
    }
}

/// Boxed upload source
pub type BoxIo = Box<dyn UploadIo>;

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "stream is closed")
}

/// Read the remaining content of a stream into memory
pub async fn read_to_end(io: &mut dyn UploadIo) -> io::Result<Bytes> {
    let mut buffer = Vec::with_capacity(io.size().unwrap_or(0) as usize);
    while let Some(chunk) = io.read_chunk(CHUNK_SIZE).await? {
        buffer.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buffer))
}

/// In-memory upload source
#[derive(Debug, Clone)]
pub struct BytesIo {
    data: Bytes,
    position: usize,
    filename: Option<String>,
    content_type: Option<String>,
    closed: bool,
}

impl BytesIo {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            position: 0,
            filename: None,
            content_type: None,
            closed: false,
        }
    }

    /// Set the client-provided filename
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Set the client-provided content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn boxed(self) -> BoxIo {
        Box::new(self)
    }
}

#[async_trait]
impl UploadIo for BytesIo {
    async fn read_chunk(&mut self, max: usize) -> io::Result<Option<Bytes>> {
        if self.closed {
            return Err(closed_error());
        }
        if self.position >= self.data.len() {
            return Ok(None);
        }
        let end = (self.position + max.max(1)).min(self.data.len());
        let chunk = self.data.slice(self.position..end);
        self.position = end;
        Ok(Some(chunk))
    }

    async fn rewind(&mut self) -> io::Result<()> {
        if self.closed {
            return Err(closed_error());
        }
        self.position = 0;
        Ok(())
    }

    fn is_eof(&self) -> bool {
        self.position >= self.data.len()
    }

    async fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn original_filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

/// Filesystem-backed upload source
#[derive(Debug)]
pub struct FileIo {
    path: PathBuf,
    file: Option<fs::File>,
    size: u64,
    position: u64,
    filename: Option<String>,
    content_type: Option<String>,
}

impl FileIo {
    /// Open a file for uploading; the filename defaults to the path's file name
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = fs::File::open(&path).await?;
        let size = file.metadata().await?.len();
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string);

        Ok(Self {
            path,
            file: Some(file),
            size,
            position: 0,
            filename,
            content_type: None,
        })
    }

    /// Open a file without exposing its name, e.g. a storage's internal blob
    pub async fn open_anonymous(path: impl AsRef<Path>) -> io::Result<Self> {
        let mut io = Self::open(path).await?;
        io.filename = None;
        Ok(io)
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn boxed(self) -> BoxIo {
        Box::new(self)
    }
}

#[async_trait]
impl UploadIo for FileIo {
    async fn read_chunk(&mut self, max: usize) -> io::Result<Option<Bytes>> {
        let file = self.file.as_mut().ok_or_else(closed_error)?;
        let mut buffer = vec![0u8; max.max(1)];
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            return Ok(None);
        }
        buffer.truncate(read);
        self.position += read as u64;
        Ok(Some(Bytes::from(buffer)))
    }

    async fn rewind(&mut self) -> io::Result<()> {
        let file = self.file.as_mut().ok_or_else(closed_error)?;
        file.rewind().await?;
        self.position = 0;
        Ok(())
    }

    fn is_eof(&self) -> bool {
        self.position >= self.size
    }

    async fn close(&mut self) -> io::Result<()> {
        // Dropping the handle closes the descriptor
        self.file = None;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    fn original_filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_bytes_io_chunks_and_rewind() {
        let mut io = BytesIo::new("hello world").with_filename("hello.txt");

        let first = io.read_chunk(5).await.unwrap().unwrap();
        assert_eq!(&first[..], b"hello");
        assert!(!io.is_eof());

        let rest = read_to_end(&mut io).await.unwrap();
        assert_eq!(&rest[..], b" world");
        assert!(io.is_eof());
        assert!(io.read_chunk(5).await.unwrap().is_none());

        io.rewind().await.unwrap();
        assert_eq!(&read_to_end(&mut io).await.unwrap()[..], b"hello world");
        assert_eq!(io.original_filename(), Some("hello.txt"));
        assert_eq!(UploadIo::size(&io), Some(11));
    }

    #[tokio::test]
    async fn test_bytes_io_closed() {
        let mut io = BytesIo::new("data");
        io.close().await.unwrap();

        assert!(io.is_closed());
        assert!(io.read_chunk(4).await.is_err());
        assert!(io.rewind().await.is_err());
    }

    #[tokio::test]
    async fn test_file_io() {
        let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        file.write_all(b"file contents").unwrap();

        let mut io = FileIo::open(file.path()).await.unwrap();
        assert_eq!(UploadIo::size(&io), Some(13));
        assert!(io.original_filename().unwrap().ends_with(".txt"));

        assert_eq!(&read_to_end(&mut io).await.unwrap()[..], b"file contents");
        assert!(io.is_eof());

        io.rewind().await.unwrap();
        assert!(!io.is_eof());

        io.close().await.unwrap();
        assert!(io.is_closed());
        assert!(io.read_chunk(1).await.is_err());
    }
}
