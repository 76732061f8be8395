//! Wire framing: `[length:u32 big-endian][payload:length bytes]`

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BusError, Result};

pub(crate) const HEADER_SIZE: usize = 4;

/// Reads length-prefixed frames from one half of a connection
pub struct FrameReader<R> {
    inner: R,
    max_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_size: usize) -> Self {
        Self { inner, max_size }
    }

    /// Read the next frame
    ///
    /// Returns `Ok(None)` on a clean end of stream (between frames).
    /// An end of stream inside a frame is an error.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut header = [0u8; HEADER_SIZE];
        match self.inner.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let length = u32::from_be_bytes(header) as usize;
        if length > self.max_size {
            return Err(BusError::Frame(format!(
                "message too large: {} bytes (max {})",
                length, self.max_size
            )));
        }

        let mut payload = vec![0u8; length];
        self.inner.read_exact(&mut payload).await?;
        Ok(Some(payload))
    }
}

/// Writes length-prefixed frames to one half of a connection
pub struct FrameWriter<W> {
    inner: W,
    max_size: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, max_size: usize) -> Self {
        Self { inner, max_size }
    }

    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_size {
            return Err(BusError::Frame(format!(
                "message too large: {} bytes (max {})",
                payload.len(),
                self.max_size
            )));
        }
        let length = payload.len() as u32;
        self.inner.write_all(&length.to_be_bytes()).await?;
        self.inner.write_all(payload).await?;
        self.inner.flush().await?;
        Ok(())
    }
}
