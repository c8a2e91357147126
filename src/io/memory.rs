use super::{RangeStream, ReadAt, check_range};
use crate::error::Result;
use async_trait::async_trait;
use std::io::Cursor;
use std::sync::Arc;

/// In-memory source, handy for archives that are already buffered.
#[derive(Clone)]
pub struct MemoryReader {
    data: Arc<Vec<u8>>,
    validator: Option<String>,
}

impl MemoryReader {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
            validator: None,
        }
    }

    /// Attach a content fingerprint, reported through [`ReadAt::validator`].
    pub fn with_validator(mut self, validator: impl Into<String>) -> Self {
        self.validator = Some(validator.into());
        self
    }
}

#[async_trait]
impl ReadAt for MemoryReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let len = self.data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }

    async fn open_range(&self, start: u64, end: u64) -> Result<RangeStream> {
        check_range(start, end, self.size())?;
        let slice = self.data[start as usize..end as usize].to_vec();
        Ok(Box::new(Cursor::new(slice)))
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn validator(&self) -> Option<String> {
        self.validator.clone()
    }
}
