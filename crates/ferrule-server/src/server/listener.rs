//! Listener selection.
//!
//! A server listens either on a TCP socket or on an in-memory listener. The
//! in-memory listener hands out bounded `tokio::io::duplex` pipes, so calls
//! can be made without opening any socket. The choice is made once, from the
//! explicit test-mode flag, and never changes for the life of a server.

use ferrule_core::{Error, Result};
use futures::Stream;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::future::Ready;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::transport::server::Connected;
use tower::Service;

/// Default per-direction capacity of an in-memory connection, in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// In-process listener.
///
/// Cloning is cheap; every clone dials the same acceptor.
#[derive(Clone)]
pub struct InMemoryListener {
    inner: Arc<Shared>,
}

struct Shared {
    buffer_size: usize,
    sender: mpsc::UnboundedSender<DuplexStream>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<DuplexStream>>>,
}

impl InMemoryListener {
    /// A zero `buffer_size` falls back to [`DEFAULT_BUFFER_SIZE`].
    pub fn new(buffer_size: usize) -> Self {
        let buffer_size = if buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            buffer_size
        };
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Shared {
                buffer_size,
                sender,
                receiver: Mutex::new(Some(receiver)),
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Opens a connection and returns the client half.
    ///
    /// Fails with `ConnectionRefused` once the accepting server is gone.
    pub fn dial(&self) -> io::Result<DuplexStream> {
        let (client, server) = tokio::io::duplex(self.inner.buffer_size);
        self.inner.sender.send(server).map_err(|_| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "in-memory listener is closed",
            )
        })?;
        Ok(client)
    }

    /// A connector for `tonic::transport::Endpoint::connect_with_connector`.
    /// The endpoint URI is ignored.
    pub fn connector(&self) -> InMemoryConnector {
        InMemoryConnector {
            listener: self.clone(),
        }
    }

    /// Takes the accepting side. There is only one.
    pub fn acceptor(&self) -> Result<InMemoryAcceptor> {
        self.inner
            .receiver
            .lock()
            .take()
            .map(|receiver| InMemoryAcceptor { receiver })
            .ok_or(Error::ListenerConsumed)
    }
}

impl Default for InMemoryListener {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl fmt::Debug for InMemoryListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryListener")
            .field("buffer_size", &self.inner.buffer_size)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    listener: InMemoryListener,
}

impl<R> Service<R> for InMemoryConnector {
    type Response = TokioIo<DuplexStream>;
    type Error = io::Error;
    type Future = Ready<io::Result<Self::Response>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _request: R) -> Self::Future {
        std::future::ready(self.listener.dial().map(TokioIo::new))
    }
}

/// Server half of an in-memory connection.
#[derive(Debug)]
pub struct InMemoryStream(DuplexStream);

impl AsyncRead for InMemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for InMemoryStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

impl Connected for InMemoryStream {
    type ConnectInfo = ();

    fn connect_info(&self) -> Self::ConnectInfo {}
}

/// Address reported for in-memory connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InMemoryAddr;

impl fmt::Display for InMemoryAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("in-memory")
    }
}

/// Accepting side of an [`InMemoryListener`].
#[derive(Debug)]
pub struct InMemoryAcceptor {
    receiver: mpsc::UnboundedReceiver<DuplexStream>,
}

impl InMemoryAcceptor {
    /// Incoming connections for `tonic`'s `serve_with_incoming*`.
    pub fn into_incoming(self) -> impl Stream<Item = io::Result<InMemoryStream>> + Send {
        UnboundedReceiverStream::new(self.receiver).map(|stream| Ok(InMemoryStream(stream)))
    }
}

impl axum::serve::Listener for InMemoryAcceptor {
    type Io = InMemoryStream;
    type Addr = InMemoryAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.receiver.recv().await {
            Some(stream) => (InMemoryStream(stream), InMemoryAddr),
            // The listener keeps a sender alive, so this only happens while
            // the process tears everything down.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(InMemoryAddr)
    }
}

/// Where a server accepts connections.
#[derive(Debug, Clone)]
pub enum ListenerMode {
    Network { addr: SocketAddr },
    InMemory(InMemoryListener),
}

impl ListenerMode {
    /// Picks the in-memory listener in test mode, the socket otherwise.
    pub fn select(test_mode: bool, addr: SocketAddr, buffer_size: usize) -> Self {
        if test_mode {
            Self::InMemory(InMemoryListener::new(buffer_size))
        } else {
            Self::Network { addr }
        }
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self, Self::InMemory(_))
    }

    pub fn kind(&self) -> ListenerKind {
        match self {
            Self::Network { .. } => ListenerKind::Network,
            Self::InMemory(_) => ListenerKind::InMemory,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerKind {
    Network,
    InMemory,
}
