//! Connection builder, connection handle and dispatcher.
//!
//! The [`ConnectionBuilder`] configures the wire format and buffers and
//! opens a stream. Opening splits it in two:
//! 1. [`Connection`] owns the write half and creates members
//! 2. [`Dispatcher`] owns the read half, decodes upcalls and runs callbacks
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use ensemble_client::{transport, ConnectionBuilder, JoinOps};
//!
//! #[tokio::main]
//! async fn main() -> ensemble_client::Result<()> {
//!     let stream = transport::connect_tcp("localhost", transport::DEFAULT_PORT).await?;
//!     let (conn, dispatcher) = ConnectionBuilder::new().open(stream);
//!     let dispatch = dispatcher.spawn();
//!
//!     let member = conn.member(MyCallbacks, Arc::new(()));
//!     member.join(JoinOps::new("chat")).await?;
//!
//!     dispatch.await.ok();
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::{BlockPolicy, ConnectionConfig};
use crate::error::{EnsembleError, Result};
use crate::member::{Env, Member, MemberCallbacks, MemberRegistry};
use crate::protocol::{Event, UpcallKind, WireFormat};
use crate::reader::FrameReader;
use crate::writer::FrameWriter;

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Builder for configuring and opening an engine connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionBuilder {
    config: ConnectionConfig,
}

impl ConnectionBuilder {
    /// Create a builder with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a loaded configuration.
    pub fn from_config(config: ConnectionConfig) -> Self {
        Self { config }
    }

    /// Set the wire format.
    ///
    /// Default: socket
    pub fn wire_format(mut self, format: WireFormat) -> Self {
        self.config.wire_format = format;
        self
    }

    /// Set who answers Block upcalls.
    ///
    /// Default: automatic for spawned, manual for socket
    pub fn block_policy(mut self, policy: BlockPolicy) -> Self {
        self.config.block_policy = Some(policy);
        self
    }

    /// Set the largest accepted upcall header section.
    ///
    /// Default: 1 MiB
    pub fn max_header_size(mut self, size: usize) -> Self {
        self.config.max_header_size = size;
        self
    }

    /// Set the initial downcall header buffer capacity.
    ///
    /// Default: 512 bytes
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size;
        self
    }

    /// Set the size of each read from the stream.
    ///
    /// Default: 64 KiB
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Configuration built so far.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Open a connection over a duplex stream.
    pub fn open<S>(self, stream: S) -> (Connection, Dispatcher)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        self.open_split(reader, writer)
    }

    /// Open a connection over separate read and write halves.
    pub fn open_split<R, W>(self, reader: R, writer: W) -> (Connection, Dispatcher)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let config = self.config;
        let format = config.wire_format;
        let writer: BoxedWrite = Box::new(writer);
        let reader: BoxedRead = Box::new(reader);

        let shared = Arc::new(Shared {
            format,
            registry: MemberRegistry::new(),
            writer: Mutex::new(FrameWriter::with_capacity(
                writer,
                format,
                config.write_buffer_size,
            )),
            closed: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        });

        let dispatcher = Dispatcher {
            reader: FrameReader::new(
                reader,
                format,
                config.max_header_size,
                config.read_buffer_size,
            ),
            shared: shared.clone(),
            block_policy: config.effective_block_policy(),
        };
        tracing::debug!("Opened {} connection", format);

        (Connection { shared }, dispatcher)
    }

    /// Connect to an engine over TCP and open a connection.
    pub async fn connect_tcp(self, host: &str, port: u16) -> Result<(Connection, Dispatcher)> {
        let stream = crate::transport::connect_tcp(host, port).await?;
        Ok(self.open(stream))
    }
}

/// State shared by a connection, its members and its dispatcher.
pub(crate) struct Shared {
    pub(crate) format: WireFormat,
    pub(crate) registry: MemberRegistry,
    /// Write lock: one frame at a time.
    pub(crate) writer: Mutex<FrameWriter<BoxedWrite>>,
    closed: AtomicBool,
    /// Set by `Connection::close`, always before `closed`.
    closing: AtomicBool,
}

impl Shared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// True once the application closed the connection.
    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(EnsembleError::ConnectionClosed);
        }
        Ok(())
    }

    /// Fail the connection if `err` is fatal, and hand the error back.
    pub(crate) fn check_fatal(&self, err: EnsembleError) -> EnsembleError {
        if err.is_fatal() {
            self.fail(&err);
        }
        err
    }

    /// Mark the connection failed and drop every member.
    pub(crate) fn fail(&self, err: &EnsembleError) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::error!("Connection failed: {}", err);
        }
        self.drain();
    }

    /// Mark the connection closed after a clean end of stream.
    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("Connection closed by engine");
        }
        self.drain();
    }

    /// Mark the connection closed by the application. The dispatcher keeps
    /// reading until the engine closes its side.
    fn close_local(&self) {
        self.closing.store(true, Ordering::Release);
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("Connection closed locally");
        }
        self.drain();
    }

    fn drain(&self) {
        let members = self.registry.drain();
        if !members.is_empty() {
            tracing::debug!("Dropped {} members on close", members.len());
        }
    }
}

/// Handle for an open connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Create a builder.
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    /// Create a member in `Pre`, bound to `callbacks` and `env`.
    pub fn member<C: MemberCallbacks>(&self, callbacks: C, env: Env) -> Member {
        Member::new(Arc::downgrade(&self.shared), Arc::new(callbacks), env)
    }

    /// Wire format of this connection.
    pub fn wire_format(&self) -> WireFormat {
        self.shared.format
    }

    /// True once the stream ended, failed, or was closed locally.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Number of members that have joined and not yet left.
    pub fn member_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Shut down the write half. The engine sees end of stream and the
    /// dispatcher stops once the engine closes its side. Upcalls still in
    /// flight are dropped.
    ///
    /// Later downcalls fail with `ConnectionClosed`.
    pub async fn close(&self) -> Result<()> {
        let mut writer = self.shared.writer.lock().await;
        self.shared.close_local();
        writer.shutdown().await
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("format", &self.shared.format)
            .field("closed", &self.is_closed())
            .field("members", &self.member_count())
            .finish()
    }
}

/// Reads upcalls and runs member callbacks.
///
/// There is one dispatcher per connection. It awaits each callback before
/// reading the next frame.
pub struct Dispatcher {
    reader: FrameReader<BoxedRead>,
    shared: Arc<Shared>,
    block_policy: BlockPolicy,
}

impl Dispatcher {
    /// Report whether an upcall can be dispatched without waiting.
    ///
    /// Reads at most once, and only if data is already available.
    pub async fn poll(&mut self) -> Result<bool> {
        self.check_open()?;
        match self.reader.poll().await {
            Ok(ready) => Ok(ready),
            Err(EnsembleError::ConnectionClosed) => {
                self.shared.close();
                Err(EnsembleError::ConnectionClosed)
            }
            Err(e) => Err(self.shared.check_fatal(e)),
        }
    }

    /// Dispatch one upcall, waiting for it if needed.
    ///
    /// Returns the upcall type, or `None` when the engine closed the stream
    /// at a frame boundary. Any error is fatal: the connection is closed
    /// and all members are dropped.
    ///
    /// After [`Connection::close`], upcalls are decoded and dropped until
    /// the engine closes its side.
    pub async fn dispatch_next(&mut self) -> Result<Option<UpcallKind>> {
        if self.check_open()? {
            return self.discard_frame().await;
        }
        match self.dispatch_frame().await {
            Ok(Some(kind)) => Ok(Some(kind)),
            Ok(None) => {
                self.shared.close();
                Ok(None)
            }
            Err(e) => Err(self.shared.check_fatal(e)),
        }
    }

    /// Dispatch until the stream ends or fails.
    pub async fn run(mut self) -> Result<()> {
        while self.dispatch_next().await?.is_some() {}
        Ok(())
    }

    /// Run the dispatcher on a new task.
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    /// Fail if the connection is closed, unless it was closed locally.
    /// Returns true in the latter case.
    fn check_open(&self) -> Result<bool> {
        if !self.shared.is_closed() {
            return Ok(false);
        }
        if self.shared.is_closing() {
            return Ok(true);
        }
        Err(EnsembleError::ConnectionClosed)
    }

    async fn discard_frame(&mut self) -> Result<Option<UpcallKind>> {
        let frame = match self.reader.read_frame().await? {
            Some(frame) => frame,
            None => return Ok(None),
        };
        let mut dec = frame.decoder(self.shared.format);
        let (id, kind) = Event::decode_header(&mut dec)?;
        tracing::debug!(member = id, "Dropping {:?} upcall after close", kind);
        Ok(Some(kind))
    }

    async fn dispatch_frame(&mut self) -> Result<Option<UpcallKind>> {
        let frame = match self.reader.read_frame().await? {
            Some(frame) => frame,
            None => return Ok(None),
        };

        let mut dec = frame.decoder(self.shared.format);
        let (id, kind) = Event::decode_header(&mut dec)?;
        let event = Event::decode_body(kind, &mut dec, &frame.data)?;
        tracing::debug!(member = id, "Received {:?} upcall", kind);

        let member = match self.shared.registry.apply_upcall(id, &event)? {
            Some(member) => member,
            None => {
                dec.finish()?;
                return Ok(Some(kind));
            }
        };

        let callbacks = member.callbacks();
        let env = member.env();
        let result = match event {
            Event::View(view) => callbacks.on_view(&member, env, view).await,
            Event::Cast { origin, data } => callbacks.on_cast(&member, env, origin, data).await,
            Event::Send { origin, data } => callbacks.on_send(&member, env, origin, data).await,
            Event::Heartbeat(time) => callbacks.on_heartbeat(&member, env, time).await,
            Event::Block => callbacks.on_block(&member, env).await,
            Event::Exit => callbacks.on_exit(&member, env).await,
        };
        if let Err(e) = result {
            tracing::warn!(member = id, "{:?} callback failed: {}", kind, e);
        }
        dec.finish()?;

        if kind == UpcallKind::Block
            && self.block_policy == BlockPolicy::Auto
            && self.shared.registry.needs_block_ok(id)
        {
            match member.block_ok().await {
                Ok(()) => tracing::debug!(member = id, "Sent automatic block_ok"),
                Err(e) if e.is_fatal() && !self.shared.is_closing() => return Err(e),
                Err(e) => tracing::debug!(member = id, "Skipped automatic block_ok: {}", e),
            }
        }

        Ok(Some(kind))
    }
}
