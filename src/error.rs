use thiserror::Error;

/// Errors surfaced by [`Pool`](crate::Pool) operations.
///
/// `E` is the error type of the pooled [`Connection`](crate::Connection).
#[derive(Debug, Error)]
pub enum Error<E> {
    /// No idle connection and no free capacity after `retries` backoff rounds.
    #[error("connection pool exhausted after {retries} retries")]
    PoolExhausted { retries: u32 },
    /// The connection is not in the collection the operation expects.
    #[error("connection not found in pool")]
    ConnectionNotFound,
    #[error("connection pool is closed")]
    PoolClosed,
    #[error("invalid pool config: {0}")]
    InvalidConfig(String),
    /// Creating or opening a connection failed.
    #[error("connection error: {0}")]
    Connection(#[source] E),
}

impl<E> Error<E> {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Error::PoolExhausted { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ConnectionNotFound)
    }
}
