//! Streams to the engine.
//!
//! - TCP to a running engine (`connect_tcp`)
//! - Unix domain socket (`connect_unix`, unix only)
//! - stdio of a spawned engine process (`ChildStdio`)
//!
//! # Example
//!
//! ```ignore
//! use ensemble_client::transport::{connect_tcp, DEFAULT_PORT};
//! use ensemble_client::ConnectionBuilder;
//!
//! let stream = connect_tcp("localhost", DEFAULT_PORT).await?;
//! let (conn, dispatcher) = ConnectionBuilder::new().open(stream);
//! ```

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, ChildStdout};

use crate::error::{EnsembleError, Result};

/// Port the engine listens on by default.
pub const DEFAULT_PORT: u16 = 5002;

/// Connect to an engine over TCP.
///
/// Frames are small and latency-bound, so Nagle is disabled.
pub async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    tracing::debug!("Connected to engine at {}:{}", host, port);
    Ok(stream)
}

/// Connect to an engine over a Unix domain socket.
#[cfg(unix)]
pub async fn connect_unix(
    path: impl AsRef<std::path::Path>,
) -> Result<tokio::net::UnixStream> {
    let path = path.as_ref();
    let stream = tokio::net::UnixStream::connect(path).await?;
    tracing::debug!("Connected to engine at {}", path.display());
    Ok(stream)
}

/// Duplex stream over a child process: reads its stdout, writes its stdin.
///
/// The child must be spawned with both piped. Spawning and reaping it stay
/// with the caller.
pub struct ChildStdio {
    stdout: ChildStdout,
    stdin: ChildStdin,
}

impl ChildStdio {
    pub fn new(stdout: ChildStdout, stdin: ChildStdin) -> Self {
        Self { stdout, stdin }
    }

    /// Take stdout and stdin from a spawned child.
    pub fn from_child(child: &mut Child) -> Result<Self> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EnsembleError::InvalidArgument("child stdout is not piped".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EnsembleError::InvalidArgument("child stdin is not piped".into()))?;
        Ok(Self::new(stdout, stdin))
    }

    /// Split back into the two pipes.
    pub fn into_inner(self) -> (ChildStdout, ChildStdin) {
        (self.stdout, self.stdin)
    }
}

impl AsyncRead for ChildStdio {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChildStdio {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stdin.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_connect_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut stream = connect_tcp("127.0.0.1", port).await.unwrap();
        assert!(stream.nodelay().unwrap());
        stream.write_all(b"ping").await.unwrap();
        assert_eq!(&accept.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_connect_tcp_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect_tcp("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, EnsembleError::Io(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_unix() {
        let path = std::env::temp_dir().join(format!("ensemble-test-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.is_ok() });
        let _stream = connect_unix(&path).await.unwrap();
        assert!(accept.await.unwrap());
        let _ = std::fs::remove_file(&path);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_stdio_echo() {
        let mut child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let mut stdio = ChildStdio::from_child(&mut child).unwrap();

        stdio.write_all(b"hello").await.unwrap();
        stdio.flush().await.unwrap();
        let mut buf = [0u8; 5];
        stdio.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        stdio.shutdown().await.unwrap();
        drop(stdio);
        child.wait().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_stdio_requires_pipes() {
        let mut child = Command::new("true").spawn().unwrap();
        assert!(matches!(
            ChildStdio::from_child(&mut child),
            Err(EnsembleError::InvalidArgument(_))
        ));
        child.wait().await.unwrap();
    }
}
