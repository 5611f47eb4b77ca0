use std::fmt::{Display, Formatter};

/// Current state of the connection pool
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct State {
    /// Upper bound on idle + in_use
    pub max_connections: usize,
    /// Idle connections available for checkout
    pub idle: usize,
    /// Connections checked out by callers
    pub in_use: usize,
    /// Capacity reserved by connections being opened
    pub connecting: usize,
    /// Callers sleeping in acquire backoff
    pub waits: u64,
}

impl State {
    /// idle + in_use
    pub fn size(&self) -> usize {
        self.idle + self.in_use
    }
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{ max_connections: {}, idle: {}, in_use: {}, connecting: {}, waits: {} }}",
            self.max_connections, self.idle, self.in_use, self.connecting, self.waits
        )
    }
}
