//! Errors surfaced by the counter facade.

use crate::config::InvalidOptions;
use std::net::SocketAddr;

pub type Result<T> = std::result::Result<T, CounterError>;

#[derive(Debug)]
pub enum CounterError {
    /// Listener options rejected before binding.
    InvalidOptions(InvalidOptions),
    /// The listening socket could not be bound or registered.
    Bind(SocketAddr, std::io::Error),
    /// The listener thread could not be started.
    Spawn(std::io::Error),
    /// A datagram could not be handed to the transport.
    Send(SocketAddr, std::io::Error),
    /// The server's listener has stopped; local increments are refused.
    Closed,
}

impl std::fmt::Display for CounterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CounterError::InvalidOptions(e) => write!(f, "Rejected listener options: {}", e),
            CounterError::Bind(addr, e) => write!(f, "Failed to bind {}: {}", addr, e),
            CounterError::Spawn(e) => write!(f, "Failed to start listener thread: {}", e),
            CounterError::Send(addr, e) => write!(f, "Failed to send to {}: {}", addr, e),
            CounterError::Closed => write!(f, "Counter server is closed"),
        }
    }
}

impl std::error::Error for CounterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CounterError::Bind(_, e) | CounterError::Spawn(e) | CounterError::Send(_, e) => Some(e),
            CounterError::InvalidOptions(e) => Some(e),
            CounterError::Closed => None,
        }
    }
}

impl From<InvalidOptions> for CounterError {
    fn from(e: InvalidOptions) -> Self {
        CounterError::InvalidOptions(e)
    }
}
