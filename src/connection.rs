use async_trait::async_trait;
use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// A reusable unit of transport managed by the pool.
///
/// The pool never looks inside a connection, it only drives this contract.
///
/// # Example
/// ```no_run
/// use async_trait::async_trait;
/// use sock_pool::Connection;
///
/// struct Noop {
///     connected: bool,
/// }
///
/// #[async_trait]
/// impl Connection for Noop {
///     type Raw = ();
///     type Error = std::io::Error;
///
///     async fn open(&mut self) -> Result<(), Self::Error> {
///         self.connected = true;
///         Ok(())
///     }
///
///     async fn close(&mut self) -> Result<(), Self::Error> {
///         self.connected = false;
///         Ok(())
///     }
///
///     fn get(&self) -> Option<&Self::Raw> {
///         None
///     }
///
///     fn is_connected(&self) -> bool {
///         self.connected
///     }
/// }
/// ```
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// The underlying transport handle
    type Raw;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Establish the underlying transport.
    async fn open(&mut self) -> Result<(), Self::Error>;

    /// Release the underlying transport. Must be a no-op when not connected.
    async fn close(&mut self) -> Result<(), Self::Error>;

    /// The raw handle, `None` while disconnected.
    fn get(&self) -> Option<&Self::Raw>;

    fn is_connected(&self) -> bool;

    /// Whether the connection outlived its lifetime. Never expires by default.
    fn is_expired(&self) -> bool {
        false
    }

    /// Close (when connected) and open again.
    ///
    /// Failures are logged and swallowed, callers can inspect
    /// [`is_connected`](Connection::is_connected) afterwards.
    async fn reconnect(&mut self) {
        if self.is_connected() {
            if let Err(e) = self.close().await {
                tracing::error!(error = %e, "failed to close connection before reconnect");
                return;
            }
        }
        if let Err(e) = self.open().await {
            tracing::error!(error = %e, "failed to reconnect");
        }
    }
}

/// Builds new, not yet opened, connections from a fixed set of options.
pub trait Factory: Send + Sync + 'static {
    type Connection: Connection;
    /// Per-pool immutable configuration handed to every `create` call
    type Options: Send + Sync + 'static;

    fn create(
        &self,
        options: &Self::Options,
    ) -> Result<Self::Connection, <Self::Connection as Connection>::Error>;
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        ConnectionId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Shared handle to a connection owned by a pool.
///
/// Two handles are equal only when they point at the same pooled connection,
/// whatever endpoint the connections talk to.
pub struct PooledConnection<C> {
    id: ConnectionId,
    conn: Arc<Mutex<C>>,
}

impl<C> PooledConnection<C> {
    pub(crate) fn new(conn: C) -> Self {
        Self {
            id: ConnectionId::next(),
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Exclusive access to the connection.
    pub async fn lock(&self) -> MutexGuard<'_, C> {
        self.conn.lock().await
    }

    /// Exclusive access if nobody else holds the connection right now.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, C>> {
        self.conn.try_lock().ok()
    }
}

impl<C> Clone for PooledConnection<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            conn: self.conn.clone(),
        }
    }
}

impl<C> PartialEq for PooledConnection<C> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<C> Eq for PooledConnection<C> {}

impl<C> Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .finish()
    }
}
