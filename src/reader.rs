//! Frame reader for upcalls.
//!
//! Owned by the dispatcher, the only reader of the stream.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{EnsembleError, Result};
use crate::protocol::{Frame, FrameBuffer, WireFormat};

/// Reads whole frames from the read half of the stream.
pub(crate) struct FrameReader<R> {
    reader: R,
    buffer: FrameBuffer,
    chunk: Vec<u8>,
    eof: bool,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub(crate) fn new(reader: R, format: WireFormat, max_header: usize, read_size: usize) -> Self {
        let read_size = read_size.max(1);
        Self {
            reader,
            buffer: FrameBuffer::with_capacity(format, max_header, read_size),
            chunk: vec![0u8; read_size],
            eof: false,
        }
    }

    /// Read the next complete frame.
    ///
    /// Returns `None` on end of stream at a frame boundary. End of stream
    /// inside a frame is an `UnexpectedEof` I/O error.
    pub(crate) async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.buffer.next_frame()? {
                return Ok(Some(frame));
            }
            if self.eof {
                if self.buffer.at_boundary() {
                    return Ok(None);
                }
                return Err(EnsembleError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("stream ended inside a frame ({} bytes buffered)", self.buffer.len()),
                )));
            }
            self.fill().await?;
        }
    }

    /// Report whether a complete frame is buffered, reading at most once
    /// and only if data is ready.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` once the stream has ended and no complete frame
    /// is left.
    pub(crate) async fn poll(&mut self) -> Result<bool> {
        if self.buffer.has_frame()? {
            return Ok(true);
        }
        if !self.eof {
            // A zero timeout polls the read exactly once. Reads are
            // cancel-safe, so nothing is lost when it is not ready.
            match tokio::time::timeout(Duration::ZERO, self.fill()).await {
                Ok(result) => {
                    result?;
                }
                Err(_) => return Ok(false),
            }
            if self.buffer.has_frame()? {
                return Ok(true);
            }
        }
        if self.eof {
            return Err(EnsembleError::ConnectionClosed);
        }
        Ok(false)
    }

    async fn fill(&mut self) -> Result<usize> {
        let n = self.reader.read(&mut self.chunk).await?;
        if n == 0 {
            self.eof = true;
        } else {
            self.buffer.extend(&self.chunk[..n]);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_frame, DEFAULT_MAX_HEADER_SIZE};
    use tokio::io::AsyncWriteExt;

    fn reader<R: AsyncRead + Unpin>(r: R) -> FrameReader<R> {
        FrameReader::new(r, WireFormat::Socket, DEFAULT_MAX_HEADER_SIZE, 16)
    }

    #[tokio::test]
    async fn test_read_frames_across_small_reads() {
        let mut bytes = build_frame(WireFormat::Socket, &[0, 0, 0, 1, 0, 0, 0, 2], b"payload-bytes");
        bytes.extend(build_frame(WireFormat::Socket, &[0, 0, 0, 3], b""));
        let mut r = reader(&bytes[..]);

        let first = r.read_frame().await.unwrap().unwrap();
        assert_eq!(&first.data[..], b"payload-bytes");
        let second = r.read_frame().await.unwrap().unwrap();
        assert_eq!(&second.header[..], &[0, 0, 0, 3]);
        assert!(r.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_inside_frame() {
        let bytes = build_frame(WireFormat::Socket, &[0, 0, 0, 1], b"truncated");
        let mut r = reader(&bytes[..bytes.len() - 2]);
        match r.read_frame().await {
            Err(EnsembleError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("expected eof error, got {:?}", other.map(|f| f.is_some())),
        }
    }

    #[tokio::test]
    async fn test_poll_without_data() {
        let (client, _engine) = tokio::io::duplex(1024);
        let mut r = reader(client);
        assert!(!r.poll().await.unwrap());
        assert!(!r.poll().await.unwrap());
    }

    #[tokio::test]
    async fn test_poll_sees_complete_frame() {
        let (client, mut engine) = tokio::io::duplex(1024);
        let mut r = reader(client);
        let bytes = build_frame(WireFormat::Socket, &[0, 0, 0, 9], b"");

        engine.write_all(&bytes[..5]).await.unwrap();
        assert!(!r.poll().await.unwrap());

        engine.write_all(&bytes[5..]).await.unwrap();
        assert!(r.poll().await.unwrap());
        // Still buffered until read
        assert!(r.poll().await.unwrap());

        let frame = r.read_frame().await.unwrap().unwrap();
        assert_eq!(&frame.header[..], &[0, 0, 0, 9]);
        assert!(!r.poll().await.unwrap());
    }

    #[tokio::test]
    async fn test_poll_after_close() {
        let (client, engine) = tokio::io::duplex(1024);
        let mut r = reader(client);
        drop(engine);
        assert!(matches!(r.poll().await, Err(EnsembleError::ConnectionClosed)));
    }
}
