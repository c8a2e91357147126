mod http;
mod local;
mod memory;

pub use http::HttpRangeReader;
pub use local::LocalFileReader;
pub use memory::MemoryReader;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Chunk size used when pumping streams to disk.
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// A readable byte stream covering one requested range of the source.
pub type RangeStream = Box<dyn AsyncRead + Send + Unpin>;

/// Trait for random access reading from a data source
#[async_trait]
pub trait ReadAt: Send + Sync {
    /// Read data at the specified offset into the buffer
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Open a sequential stream over `[start, end)`.
    async fn open_range(&self, start: u64, end: u64) -> Result<RangeStream>;

    /// Get the total size of the data source
    fn size(&self) -> u64;

    /// Opaque fingerprint of the source content (ETag, Last-Modified, ...).
    fn validator(&self) -> Option<String> {
        None
    }

    /// Fill `buf` completely from `offset`, failing if the source ends early.
    async fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .read_at(offset + filled as u64, &mut buf[filled..])
                .await?;
            if n == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "source ended at {} while reading {} bytes at {}",
                        offset + filled as u64,
                        buf.len(),
                        offset
                    ),
                )));
            }
            filled += n;
        }
        Ok(())
    }

    /// Fetch `[start, end)` into memory through one ranged stream.
    async fn read_range(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        let mut stream = self.open_range(start, end).await?;
        let mut data = Vec::with_capacity((end - start) as usize);
        stream.read_to_end(&mut data).await?;
        if data.len() as u64 != end - start {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "range {start}..{end} returned {} bytes",
                    data.len()
                ),
            )));
        }
        Ok(data)
    }
}

/// Validate a requested range against the source size.
pub(crate) fn check_range(start: u64, end: u64, size: u64) -> Result<()> {
    if start > end || end > size {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("range {start}..{end} outside of source of {size} bytes"),
        )));
    }
    Ok(())
}

/// Copy `src` into `dst` until end of stream, handing every chunk to
/// `inspect` before it is written.
///
/// The token is checked between chunks; a cancelled copy returns
/// [`Error::Cancelled`] and leaves whatever was written so far.
pub async fn copy_cancellable<R, W, F>(
    src: &mut R,
    dst: &mut W,
    cancel: &CancellationToken,
    mut inspect: F,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
    F: FnMut(&[u8]),
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            n = src.read(&mut buf) => n?,
        };
        if n == 0 {
            break;
        }
        inspect(&buf[..n]);
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    dst.flush().await?;
    Ok(total)
}
