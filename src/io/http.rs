use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{
    ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, ETAG, HeaderMap, IF_RANGE, LAST_MODIFIED, RANGE,
};
use reqwest::{Client, Response, StatusCode};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;

use super::{RangeStream, ReadAt, check_range};
use crate::error::{Error, Result};

/// HTTP Range reader for remote ZIP files
///
/// Every ranged request is pinned to the content seen by the initial HEAD
/// probe: the validator is sent as `If-Range`, and a full-body reply, a
/// different total length or a different validator is reported as
/// [`Error::RemoteContentChanged`].
pub struct HttpRangeReader {
    client: Client,
    url: String,
    size: u64,
    etag: Option<String>,
    last_modified: Option<String>,
    transferred_bytes: Arc<AtomicU64>,
    max_retry: u32,
}

impl HttpRangeReader {
    /// Create a new HTTP Range reader
    ///
    /// This will send a HEAD request to verify Range support and get file size
    pub async fn new(url: String) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(60))
            .build()?;
        Self::with_client(client, url).await
    }

    /// Create a reader that shares an existing client.
    pub async fn with_client(client: Client, url: String) -> Result<Self> {
        let resp = client.head(&url).send().await?;

        if !resp.status().is_success() {
            return Err(Error::HttpStatus(resp.status().as_u16()));
        }

        let headers = resp.headers();

        let accept_ranges = header_str(headers, ACCEPT_RANGES.as_str()).unwrap_or("none");
        if !accept_ranges.contains("bytes") {
            return Err(Error::RangeNotSupported(format!(
                "server answered Accept-Ranges: {accept_ranges}"
            )));
        }

        let size = header_str(headers, CONTENT_LENGTH.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                Error::RangeNotSupported("server did not return Content-Length".to_string())
            })?;

        let etag = header_str(headers, ETAG.as_str())
            .filter(|v| !v.starts_with("W/"))
            .map(str::to_string);
        let last_modified = header_str(headers, LAST_MODIFIED.as_str()).map(str::to_string);

        tracing::debug!(%url, size, etag = ?etag, "probed remote archive");

        Ok(Self {
            client,
            url,
            size,
            etag,
            last_modified,
            transferred_bytes: Arc::new(AtomicU64::new(0)),
            max_retry: 10,
        })
    }

    /// Get total bytes transferred from network
    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }

    /// Send one ranged GET for `[start, end)`, retrying connection failures.
    async fn send_range(&self, start: u64, end: u64) -> Result<Response> {
        let range = format!("bytes={}-{}", start, end - 1);
        let mut retry_count = 0;

        loop {
            let mut request = self.client.get(&self.url).header(RANGE, &range);
            if let Some(validator) = self.etag.as_ref().or(self.last_modified.as_ref()) {
                request = request.header(IF_RANGE, validator);
            }

            match request.send().await {
                Ok(resp) => {
                    self.check_response(&resp, start, end)?;
                    return Ok(resp);
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    retry_count += 1;
                    if retry_count >= self.max_retry {
                        return Err(e.into());
                    }
                    tracing::warn!(
                        error = %e,
                        retry = retry_count,
                        max_retry = self.max_retry,
                        "connection error on range request, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(500 * retry_count as u64)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn check_response(&self, resp: &Response, start: u64, end: u64) -> Result<()> {
        let status = resp.status();
        if status == StatusCode::OK {
            // A full body in reply to If-Range means the validator no longer matches
            if self.etag.is_some() || self.last_modified.is_some() {
                return Err(Error::RemoteContentChanged);
            }
            return Err(Error::RangeNotSupported(
                "server ignored the Range header".to_string(),
            ));
        }
        if status != StatusCode::PARTIAL_CONTENT {
            return Err(Error::HttpStatus(status.as_u16()));
        }

        let headers = resp.headers();
        let content_range = header_str(headers, CONTENT_RANGE.as_str()).ok_or_else(|| {
            Error::RangeNotSupported("206 response without Content-Range".to_string())
        })?;
        let (from, to, total) = parse_content_range(content_range).ok_or_else(|| {
            Error::RangeNotSupported(format!("malformed Content-Range: {content_range}"))
        })?;
        if let Some(total) = total
            && total != self.size
        {
            return Err(Error::RemoteContentChanged);
        }
        if from != start || to + 1 != end {
            return Err(Error::RangeNotSupported(format!(
                "requested bytes {}-{}, server sent {}-{}",
                start,
                end - 1,
                from,
                to
            )));
        }

        if let (Some(expected), Some(actual)) = (&self.etag, header_str(headers, ETAG.as_str()))
            && expected != actual
        {
            return Err(Error::RemoteContentChanged);
        }
        if let (Some(expected), Some(actual)) = (
            &self.last_modified,
            header_str(headers, LAST_MODIFIED.as_str()),
        ) && expected != actual
        {
            return Err(Error::RemoteContentChanged);
        }
        Ok(())
    }
}

#[async_trait]
impl ReadAt for HttpRangeReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || offset >= self.size {
            return Ok(0);
        }

        let end = (offset + buf.len() as u64).min(self.size);
        let expected_size = (end - offset) as usize;

        let resp = self.send_range(offset, end).await?;
        let bytes = resp.bytes().await?;
        let chunk_len = bytes.len().min(expected_size);
        buf[..chunk_len].copy_from_slice(&bytes[..chunk_len]);

        self.transferred_bytes
            .fetch_add(chunk_len as u64, Ordering::Relaxed);

        Ok(chunk_len)
    }

    async fn open_range(&self, start: u64, end: u64) -> Result<RangeStream> {
        check_range(start, end, self.size)?;
        if start == end {
            return Ok(Box::new(tokio::io::empty()));
        }

        let resp = self.send_range(start, end).await?;
        let counter = Arc::clone(&self.transferred_bytes);
        let stream = resp.bytes_stream().map(move |chunk| {
            let chunk = chunk.map_err(std::io::Error::other)?;
            counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            Ok::<_, std::io::Error>(chunk)
        });

        Ok(Box::new(StreamReader::new(Box::pin(stream)).take(end - start)))
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn validator(&self) -> Option<String> {
        self.etag.clone().or_else(|| self.last_modified.clone())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Parse `bytes <from>-<to>/<total|*>`.
fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let (from, to) = range.split_once('-')?;
    let from = from.trim().parse().ok()?;
    let to = to.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    if to < from {
        return None;
    }
    Some((from, to, total))
}
