use crate::config::PoolConfig;
use crate::connection::{Connection, ConnectionId, Factory, PooledConnection};
use crate::duration::AtomicDuration;
use crate::error::Error;
use crate::guard::ConnectionGuard;
use crate::reaper::{Evict, Reaper};
use crate::state::State;
use async_trait::async_trait;
use futures_core::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

/// Error type of the connections built by `F`
pub type ConnectionError<F> = <<F as Factory>::Connection as Connection>::Error;

type PoolResult<T, F> = Result<T, Error<ConnectionError<F>>>;
type Conn<F> = PooledConnection<<F as Factory>::Connection>;

/// The two disjoint collections plus the capacity held by opens in flight.
struct Slots<C> {
    idle: VecDeque<PooledConnection<C>>,
    in_use: HashMap<ConnectionId, PooledConnection<C>>,
    connecting: usize,
    closed: bool,
}

impl<C> Slots<C> {
    fn size(&self) -> usize {
        self.idle.len() + self.in_use.len()
    }

    fn take_idle(&mut self, id: ConnectionId) -> Option<PooledConnection<C>> {
        let at = self.idle.iter().position(|c| c.id() == id)?;
        self.idle.remove(at)
    }
}

enum Checkout<'a, F: Factory> {
    Idle(Conn<F>),
    Create(Reservation<'a, F>),
    Saturated,
}

/// One unit of capacity taken for a connection that is still being opened.
///
/// Handed back on drop unless committed, so a failed or cancelled open never
/// leaks capacity nor leaves anything behind in `in_use`.
struct Reservation<'a, F: Factory> {
    inner: &'a PoolInner<F>,
    armed: bool,
}

impl<F: Factory> Reservation<'_, F> {
    /// Register `conn` as in use. Returns false when the pool was closed meanwhile.
    fn commit(mut self, conn: &Conn<F>) -> bool {
        self.armed = false;
        let mut slots = self.inner.lock();
        slots.connecting -= 1;
        if slots.closed {
            return false;
        }
        slots.in_use.insert(conn.id(), conn.clone());
        true
    }
}

impl<F: Factory> Drop for Reservation<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.lock().connecting -= 1;
        }
    }
}

pub(crate) struct PoolInner<F: Factory> {
    factory: F,
    options: F::Options,
    config: PoolConfig,
    slots: Mutex<Slots<F::Connection>>,
    retry_backoff: AtomicDuration,
    waits: AtomicU64,
    reaper: OnceLock<Reaper>,
}

impl<F: Factory> PoolInner<F> {
    fn lock(&self) -> MutexGuard<'_, Slots<F::Connection>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn open_new(&self) -> PoolResult<F::Connection, F> {
        let mut conn = self
            .factory
            .create(&self.options)
            .map_err(Error::Connection)?;
        conn.open().await.map_err(Error::Connection)?;
        Ok(conn)
    }

    fn checkout(&self) -> PoolResult<Checkout<'_, F>, F> {
        let mut slots = self.lock();
        if slots.closed {
            return Err(Error::PoolClosed);
        }
        if let Some(conn) = slots.idle.pop_front() {
            slots.in_use.insert(conn.id(), conn.clone());
            return Ok(Checkout::Idle(conn));
        }
        if slots.size() + slots.connecting < self.config.max_connections {
            slots.connecting += 1;
            return Ok(Checkout::Create(Reservation {
                inner: self,
                armed: true,
            }));
        }
        Ok(Checkout::Saturated)
    }

    async fn connect(&self, reservation: Reservation<'_, F>) -> PoolResult<Conn<F>, F> {
        let conn = PooledConnection::new(self.open_new().await?);
        if !reservation.commit(&conn) {
            close_quietly(&conn).await;
            return Err(Error::PoolClosed);
        }
        tracing::debug!(id = %conn.id(), "opened new connection");
        Ok(conn)
    }

    async fn acquire(&self, retry_limit: u32) -> PoolResult<Conn<F>, F> {
        let mut retried = 0;
        loop {
            match self.checkout()? {
                Checkout::Idle(conn) => {
                    tracing::trace!(id = %conn.id(), "checked out idle connection");
                    return Ok(conn);
                }
                Checkout::Create(reservation) => return self.connect(reservation).await,
                Checkout::Saturated => {}
            }
            if retried >= retry_limit {
                tracing::warn!(
                    retries = retried,
                    max_connections = self.config.max_connections,
                    "connection pool exhausted"
                );
                return Err(Error::PoolExhausted { retries: retried });
            }
            retried += 1;
            self.waits.fetch_add(1, Ordering::SeqCst);
            defer!(|| {
                self.waits.fetch_sub(1, Ordering::SeqCst);
            });
            tokio::time::sleep(self.retry_backoff.get()).await;
        }
    }

    fn release(&self, conn: &Conn<F>) -> PoolResult<(), F> {
        let mut slots = self.lock();
        let conn = slots
            .in_use
            .remove(&conn.id())
            .ok_or(Error::ConnectionNotFound)?;
        slots.idle.push_back(conn);
        Ok(())
    }

    async fn drop_idle(&self, conn: &Conn<F>) -> PoolResult<(), F> {
        let conn = self
            .lock()
            .take_idle(conn.id())
            .ok_or(Error::ConnectionNotFound)?;
        close_quietly(&conn).await;
        tracing::debug!(id = %conn.id(), "dropped connection");
        Ok(())
    }

    async fn evict_expired(&self) -> PoolResult<usize, F> {
        let snapshot: Vec<Conn<F>> = self.lock().idle.iter().cloned().collect();
        let mut dropped = 0;
        for conn in snapshot {
            // a locked connection has a holder, leave it for the next pass
            let expired = match conn.try_lock() {
                Some(c) => c.is_expired(),
                None => false,
            };
            if !expired {
                continue;
            }
            // only fails when the connection left the idle set meanwhile
            if self.drop_idle(&conn).await.is_ok() {
                dropped += 1;
            } else {
                tracing::trace!(id = %conn.id(), "expired connection left the idle set");
            }
        }
        Ok(dropped)
    }

    async fn close(&self) {
        if let Some(reaper) = self.reaper.get() {
            reaper.stop();
        }
        let (idle, in_use) = {
            let mut slots = self.lock();
            slots.closed = true;
            let idle: Vec<Conn<F>> = slots.idle.drain(..).collect();
            let in_use: Vec<Conn<F>> = slots.in_use.drain().map(|(_, c)| c).collect();
            (idle, in_use)
        };
        for conn in &idle {
            close_quietly(conn).await;
        }
        for conn in &in_use {
            match conn.try_lock() {
                Some(mut c) => {
                    if c.is_connected() {
                        if let Err(e) = c.close().await {
                            tracing::warn!(id = %conn.id(), error = %e, "failed to close connection");
                        }
                    }
                }
                None => {
                    // the holder has it locked, close once they let go
                    let conn = conn.clone();
                    tokio::spawn(async move { close_quietly(&conn).await });
                }
            }
        }
        tracing::debug!(idle = idle.len(), in_use = in_use.len(), "connection pool closed");
    }
}

impl<F: Factory> Drop for PoolInner<F> {
    fn drop(&mut self) {
        let slots = self.slots.get_mut().unwrap_or_else(PoisonError::into_inner);
        let mut conns: Vec<Conn<F>> = slots.idle.drain(..).collect();
        conns.extend(slots.in_use.drain().map(|(_, c)| c));
        if conns.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for conn in &conns {
                        close_quietly(conn).await;
                    }
                    tracing::debug!(closed = conns.len(), "closed connections of dropped pool");
                });
            }
            Err(_) => tracing::warn!(
                count = conns.len(),
                "connection pool dropped outside a tokio runtime, connections not closed"
            ),
        }
    }
}

#[async_trait]
impl<F: Factory> Evict for PoolInner<F> {
    type Error = Error<ConnectionError<F>>;

    async fn drop_expired(&self) -> Result<usize, Self::Error> {
        self.evict_expired().await
    }
}

/// Close a connection that left the pool. Close failures are only logged.
async fn close_quietly<C: Connection>(conn: &PooledConnection<C>) {
    let mut c = conn.lock().await;
    if c.is_connected() {
        if let Err(e) = c.close().await {
            tracing::warn!(id = %conn.id(), error = %e, "failed to close connection");
        }
    }
}

/// Bounded pool of connections built by a [`Factory`].
///
/// Connections are either idle (owned by the pool and ready for checkout) or in
/// use (checked out by a caller). Both collections sit behind a single mutex that
/// is never held across I/O, so `idle + in_use <= max_connections` and the two
/// collections stay disjoint whatever the interleaving.
///
/// A `Pool` is a cheap handle, clones share the same connections.
pub struct Pool<F: Factory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: Factory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: Factory> Debug for Pool<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        Debug::fmt(&state, f)
    }
}

impl<F: Factory> Pool<F> {
    /// Build a pool, open `initial_connections` and start the reaper when enabled.
    ///
    /// Must run inside a tokio runtime when the reaper is enabled.
    pub async fn new(factory: F, options: F::Options, config: PoolConfig) -> PoolResult<Self, F> {
        config.validate().map_err(Error::InvalidConfig)?;
        let inner = Arc::new(PoolInner {
            factory,
            options,
            slots: Mutex::new(Slots {
                idle: VecDeque::with_capacity(config.initial_connections),
                in_use: HashMap::new(),
                connecting: 0,
                closed: false,
            }),
            retry_backoff: AtomicDuration::new(config.retry_backoff),
            waits: AtomicU64::new(0),
            reaper: OnceLock::new(),
            config,
        });
        for _ in 0..inner.config.initial_connections {
            match inner.open_new().await {
                Ok(conn) => {
                    inner.lock().idle.push_back(PooledConnection::new(conn));
                }
                Err(e) => {
                    inner.close().await;
                    return Err(e);
                }
            }
        }
        if inner.config.reap_expired_connections {
            let reaper = Reaper::spawn(Arc::downgrade(&inner), inner.config.reap_interval);
            _ = inner.reaper.set(reaper);
        }
        tracing::debug!(
            max_connections = inner.config.max_connections,
            initial_connections = inner.config.initial_connections,
            reaper = inner.config.reap_expired_connections,
            "created connection pool"
        );
        Ok(Self { inner })
    }

    /// Check out a connection.
    ///
    /// Hands out an idle connection if there is one, otherwise opens a new one
    /// while below `max_connections`. A saturated pool is retried up to
    /// `retry_limit` times, sleeping the retry backoff in between; `0` fails at
    /// once with [`Error::PoolExhausted`].
    pub async fn acquire(&self, retry_limit: u32) -> PoolResult<Conn<F>, F> {
        self.inner.acquire(retry_limit).await
    }

    /// Return a checked out connection to the idle set.
    pub fn release(&self, conn: &Conn<F>) -> PoolResult<(), F> {
        self.inner.release(conn)
    }

    /// Remove an idle connection for good, closing it if still connected.
    ///
    /// In-use connections are not touched and yield [`Error::ConnectionNotFound`].
    pub async fn drop(&self, conn: &Conn<F>) -> PoolResult<(), F> {
        self.inner.drop_idle(conn).await
    }

    /// Drop every idle connection reporting itself expired.
    pub async fn drop_expired(&self) -> PoolResult<usize, F> {
        self.inner.evict_expired().await
    }

    /// idle + in use
    pub fn size(&self) -> usize {
        self.inner.lock().size()
    }

    pub fn is_idle(&self, conn: &Conn<F>) -> bool {
        self.inner.lock().idle.iter().any(|c| c == conn)
    }

    pub fn is_in_use(&self, conn: &Conn<F>) -> bool {
        self.inner.lock().in_use.contains_key(&conn.id())
    }

    /// Check out a connection that goes back to the pool when the guard drops.
    ///
    /// Uses the configured `acquire_retries` budget.
    pub async fn connection(&self) -> PoolResult<ConnectionGuard<F>, F> {
        let conn = self.acquire(self.inner.config.acquire_retries).await?;
        Ok(ConnectionGuard::new(conn, self.clone()))
    }

    /// Run `f` with a checked out connection, releasing it on every exit path.
    ///
    /// ```no_run
    /// # async fn demo(pool: sock_pool::Pool<sock_pool::tcp::TcpFactory>) -> Result<(), Box<dyn std::error::Error>> {
    /// let echoed = pool
    ///     .with_connection(|conn| {
    ///         Box::pin(async move {
    ///             let mut tcp = conn.lock().await;
    ///             tcp.send(b"hello").await?;
    ///             Ok::<_, Box<dyn std::error::Error>>(tcp.recv(1024).await?)
    ///         })
    ///     })
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_connection<T, E, Fun>(&self, f: Fun) -> Result<T, E>
    where
        Fun: for<'c> FnOnce(&'c Conn<F>) -> BoxFuture<'c, Result<T, E>>,
        E: From<Error<ConnectionError<F>>>,
    {
        let conn = self.acquire(self.inner.config.acquire_retries).await?;
        defer!(|| {
            if let Err(e) = self.release(&conn) {
                tracing::debug!(id = %conn.id(), error = %e, "scoped connection not released");
            }
        });
        let result = f(&conn).await;
        result
    }

    pub fn state(&self) -> State {
        let slots = self.inner.lock();
        State {
            max_connections: self.inner.config.max_connections,
            idle: slots.idle.len(),
            in_use: slots.in_use.len(),
            connecting: slots.connecting,
            waits: self.inner.waits.load(Ordering::SeqCst),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Change the sleep between two acquire attempts on a saturated pool.
    pub fn set_retry_backoff(&self, backoff: Duration) {
        self.inner.retry_backoff.store(backoff);
    }

    pub fn get_retry_backoff(&self) -> Duration {
        self.inner.retry_backoff.get()
    }

    /// The background reaper, when enabled.
    pub fn reaper(&self) -> Option<&Reaper> {
        self.inner.reaper.get()
    }

    /// Stop the reaper and close every idle and in-use connection.
    ///
    /// Afterwards `acquire` fails with [`Error::PoolClosed`]. In-use
    /// connections currently locked by their holder are closed in the
    /// background once the holder lets go of the lock.
    pub async fn close(&self) {
        self.inner.close().await
    }
}
