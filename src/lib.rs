//! A bounded pool of reusable socket connections.
//!
//! [`Pool`] hands out connections built by a [`Factory`], takes them back on
//! release and runs a background [`Reaper`] evicting idle connections that
//! outlived their lifetime. [`tcp`] ships a plain TCP [`Connection`].

#[macro_use]
mod defer;
mod duration;
pub mod config;
pub mod connection;
pub mod error;
pub mod guard;
pub mod pool;
pub mod reaper;
pub mod state;
pub mod tcp;

pub use config::PoolConfig;
pub use connection::{Connection, ConnectionId, Factory, PooledConnection};
pub use error::Error;
pub use guard::ConnectionGuard;
pub use pool::Pool;
pub use reaper::{Evict, Reaper};
pub use state::State;
