//! Plain TCP [`Connection`] over a tokio socket.

use crate::connection::{Connection, Factory};
use async_trait::async_trait;
use std::future::Future;
use std::io;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(600);

/// Where and how to connect. Owned by the pool, shared by every connection it opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpOptions {
    pub host: String,
    pub port: u16,
    /// Age after which the connection reports itself expired
    pub lifetime: Duration,
    /// Bound on connect, send and recv
    pub timeout: Option<Duration>,
}

impl TcpOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            lifetime: DEFAULT_LIFETIME,
            timeout: None,
        }
    }

    pub fn lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Builds [`TcpConnection`]s from [`TcpOptions`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpFactory;

impl Factory for TcpFactory {
    type Connection = TcpConnection;
    type Options = TcpOptions;

    fn create(&self, options: &TcpOptions) -> io::Result<TcpConnection> {
        Ok(TcpConnection::new(options.clone()))
    }
}

#[derive(Debug)]
pub struct TcpConnection {
    options: TcpOptions,
    stream: Option<TcpStream>,
    created: Option<Instant>,
}

impl TcpConnection {
    pub fn new(options: TcpOptions) -> Self {
        Self {
            options,
            stream: None,
            created: None,
        }
    }

    pub fn options(&self) -> &TcpOptions {
        &self.options
    }

    /// Time since the last successful `open`.
    pub fn age(&self) -> Option<Duration> {
        self.created.map(|created| created.elapsed())
    }

    /// Write all of `data`.
    ///
    /// # Panics
    /// When the connection is not open.
    pub async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let timeout = self.options.timeout;
        let Some(stream) = self.stream.as_mut() else {
            panic!("send on a disconnected TcpConnection");
        };
        with_timeout(timeout, stream.write_all(data)).await
    }

    /// Read at most `max_size` bytes. An empty buffer means the peer closed.
    ///
    /// # Panics
    /// When the connection is not open.
    pub async fn recv(&mut self, max_size: usize) -> io::Result<Vec<u8>> {
        let timeout = self.options.timeout;
        let Some(stream) = self.stream.as_mut() else {
            panic!("recv on a disconnected TcpConnection");
        };
        let mut buf = vec![0u8; max_size];
        let n = with_timeout(timeout, stream.read(&mut buf)).await?;
        buf.truncate(n);
        Ok(buf)
    }
}

#[async_trait]
impl Connection for TcpConnection {
    type Raw = TcpStream;
    type Error = io::Error;

    async fn open(&mut self) -> io::Result<()> {
        let addr = (self.options.host.as_str(), self.options.port);
        let stream = with_timeout(self.options.timeout, TcpStream::connect(addr)).await?;
        self.stream = Some(stream);
        self.created = Some(Instant::now());
        tracing::trace!(host = %self.options.host, port = self.options.port, "tcp connection opened");
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        match stream.shutdown().await {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }

    fn get(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn is_expired(&self) -> bool {
        match self.created {
            Some(created) => created.elapsed() > self.options.lifetime,
            None => false,
        }
    }
}

async fn with_timeout<T>(
    timeout: Option<Duration>,
    f: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match timeout {
        Some(d) => tokio::time::timeout(d, f)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "tcp operation timed out"))?,
        None => f.await,
    }
}
