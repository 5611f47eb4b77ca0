use crate::connection::{Factory, PooledConnection};
use crate::Pool;
use std::fmt::{Debug, Formatter};
use std::ops::Deref;

/// ConnectionGuard hands a checked out connection back to its pool on drop
pub struct ConnectionGuard<F: Factory> {
    inner: Option<PooledConnection<F::Connection>>,
    pool: Pool<F>,
}

impl<F: Factory> ConnectionGuard<F> {
    pub(crate) fn new(conn: PooledConnection<F::Connection>, pool: Pool<F>) -> ConnectionGuard<F> {
        Self {
            inner: Some(conn),
            pool,
        }
    }

    /// Keep the connection checked out after the guard is gone.
    ///
    /// The caller becomes responsible for `release` or the connection stays in use.
    pub fn detach(mut self) -> PooledConnection<F::Connection> {
        match self.inner.take() {
            Some(conn) => conn,
            None => unreachable!("connection guard emptied before drop"),
        }
    }
}

impl<F: Factory> Debug for ConnectionGuard<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("conn", &self.inner)
            .field("pool", &self.pool)
            .finish()
    }
}

impl<F: Factory> Deref for ConnectionGuard<F> {
    type Target = PooledConnection<F::Connection>;

    fn deref(&self) -> &Self::Target {
        match self.inner.as_ref() {
            Some(conn) => conn,
            None => unreachable!("connection guard emptied before drop"),
        }
    }
}

impl<F: Factory> Drop for ConnectionGuard<F> {
    fn drop(&mut self) {
        if let Some(conn) = self.inner.take() {
            if let Err(e) = self.pool.release(&conn) {
                tracing::debug!(id = %conn.id(), error = %e, "guarded connection not released");
            }
        }
    }
}
