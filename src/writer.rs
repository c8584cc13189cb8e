//! Frame writer for downcalls.
//!
//! One [`FrameWriter`] owns the write half of the engine stream and is
//! shared behind the connection's write lock, so frames from concurrent
//! callers are serialized whole.
//!
//! # Write path
//!
//! ```text
//! begin() ─► Encoder (reused header buffer) ─► end(bulk)
//!                                                │
//!                        precursor ─ header ─ bulk ─► write_vectored ─► flush
//! ```
//!
//! The header buffer grows by doubling and is replaced with a small one
//! after a frame pushes it past [`SHRINK_THRESHOLD`].

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::codec::Encoder;
use crate::error::{EnsembleError, Result};
use crate::protocol::{Precursor, WireFormat};

/// Default initial header buffer capacity.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 512;

/// Header buffer capacity above which it is shrunk after a write.
pub const SHRINK_THRESHOLD: usize = 64 * 1024;

/// Header buffer capacity after shrinking.
pub const SHRUNK_SIZE: usize = 4 * 1024;

/// Serializes frames onto the write half of the stream.
pub struct FrameWriter<W> {
    writer: W,
    encoder: Encoder,
    /// Set while a frame is being flushed. If a write fails or is abandoned
    /// midway the stream holds a partial frame and must not be reused.
    poisoned: bool,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    /// Create a writer with the default header buffer capacity.
    #[cfg(test)]
    pub fn new(writer: W, format: WireFormat) -> Self {
        Self::with_capacity(writer, format, DEFAULT_WRITE_BUFFER_SIZE)
    }

    /// Create a writer with a custom header buffer capacity.
    pub fn with_capacity(writer: W, format: WireFormat, capacity: usize) -> Self {
        Self {
            writer,
            encoder: Encoder::with_capacity(format, capacity),
            poisoned: false,
        }
    }

    /// Wire format in use.
    #[inline]
    pub fn format(&self) -> WireFormat {
        self.encoder.format()
    }

    /// Check if an earlier frame was left incomplete on the stream.
    #[cfg(test)]
    #[inline]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Current header buffer capacity.
    #[cfg(test)]
    pub fn buffer_capacity(&self) -> usize {
        self.encoder.capacity()
    }

    /// Start a new frame and return the header encoder.
    ///
    /// Anything left from an abandoned frame is discarded.
    pub fn begin(&mut self) -> Result<&mut Encoder> {
        if self.poisoned {
            return Err(EnsembleError::ConnectionClosed);
        }
        self.encoder.clear();
        Ok(&mut self.encoder)
    }

    /// Finish the frame: precursor, header, then `data`, flushed.
    pub async fn end(&mut self, data: Bytes) -> Result<()> {
        if self.poisoned {
            return Err(EnsembleError::ConnectionClosed);
        }
        let format = self.encoder.format();
        let precursor = Precursor {
            header_len: self.encoder.len(),
            data_len: data.len(),
        };
        let (pre, n) = precursor.encode(format);

        self.poisoned = true;
        write_all_vectored(&mut self.writer, &[&pre[..n], self.encoder.as_slice(), &data[..]])
            .await?;
        self.poisoned = false;

        self.encoder.clear();
        if self.encoder.shrink_above(SHRINK_THRESHOLD, SHRUNK_SIZE) {
            tracing::debug!("Shrunk write buffer to {} bytes", SHRUNK_SIZE);
        }
        Ok(())
    }

    /// Shut down the write half.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    /// Get a reference to the underlying writer.
    #[cfg(test)]
    pub fn get_ref(&self) -> &W {
        &self.writer
    }
}

/// Write all parts using scatter/gather I/O, continuing after partial writes.
async fn write_all_vectored<W>(writer: &mut W, parts: &[&[u8]]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = parts.iter().map(|p| p.len()).sum();
    if total_size == 0 {
        return Ok(());
    }

    let slices: Vec<IoSlice<'_>> = parts
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| IoSlice::new(p))
        .collect();

    // Fast path: the whole frame in one call
    let written = writer.write_vectored(&slices).await?;
    if written == 0 {
        return Err(write_zero());
    }

    let mut total_written = written;
    while total_written < total_size {
        let remaining_slices = build_remaining_slices(parts, total_written);
        if remaining_slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&remaining_slices).await?;
        if written == 0 {
            return Err(write_zero());
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

fn write_zero() -> EnsembleError {
    EnsembleError::Io(std::io::Error::new(
        std::io::ErrorKind::WriteZero,
        "write_vectored returned 0",
    ))
}

/// Build IoSlice array for remaining data after partial write.
fn build_remaining_slices<'a>(parts: &[&'a [u8]], skip_bytes: usize) -> Vec<IoSlice<'a>> {
    let mut slices = Vec::with_capacity(parts.len());
    let mut skipped = 0;

    for part in parts {
        let start = skipped;
        let end = skipped + part.len();
        if skip_bytes < end {
            let offset = skip_bytes.saturating_sub(start);
            slices.push(IoSlice::new(&part[offset..]));
        }
        skipped = end;
    }

    slices
}
