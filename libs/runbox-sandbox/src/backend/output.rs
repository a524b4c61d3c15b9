//! Bounded capture of process output
//!
//! Bytes past the limit are read and discarded, so a chatty process never
//! blocks on a full pipe and host memory stays bounded.

use tokio::io::{AsyncRead, AsyncReadExt};

const CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug)]
pub(crate) struct CappedOutput {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CappedOutput {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    pub(crate) fn truncated(&self) -> bool {
        self.truncated
    }

    pub(crate) fn into_string(self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

/// Drain `reader` to EOF keeping at most `limit` bytes.
pub(crate) async fn read_capped<R>(mut reader: R, limit: usize) -> std::io::Result<CappedOutput>
where
    R: AsyncRead + Unpin,
{
    let mut output = CappedOutput::new(limit);
    let mut chunk = vec![0u8; CHUNK_SIZE];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(output);
        }
        output.push(&chunk[..n]);
    }
}
