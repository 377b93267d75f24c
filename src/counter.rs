//! Counter facade.
//!
//! Two concrete variants share the `Counter` capability:
//! - `CounterServer` owns the aggregate and the listening socket
//! - `CounterClient` only sends increments and always reads zero
//!
//! `CounterService` is the tagged union for callers that pick the mode at
//! runtime.

use crate::client::CounterClient;
use crate::config::Endpoint;
use crate::error::Result;
use crate::server::CounterServer;

/// Increment/read capability shared by every counter variant.
pub trait Counter {
    /// Add `amount` to the aggregate.
    fn increase(&self, amount: i64) -> Result<()>;

    /// Current aggregate as seen by this instance.
    fn value(&self) -> i64;
}

/// Which side of the protocol an instance plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server,
    Client,
}

#[derive(Debug)]
pub enum CounterService {
    Server(CounterServer),
    Client(CounterClient),
}

/// Create a counter in the given mode.
///
/// Server mode binds `endpoint` and starts listening; client mode never fails.
pub fn create(mode: Mode, endpoint: Endpoint) -> Result<CounterService> {
    match mode {
        Mode::Server => CounterServer::bind(endpoint).map(CounterService::Server),
        Mode::Client => Ok(CounterService::Client(CounterClient::new(endpoint))),
    }
}

impl CounterService {
    pub fn mode(&self) -> Mode {
        match self {
            CounterService::Server(_) => Mode::Server,
            CounterService::Client(_) => Mode::Client,
        }
    }

    /// Stop the listener of a server. Clients have nothing to close.
    pub fn close(&self) {
        if let CounterService::Server(server) = self {
            server.close();
        }
    }

    pub fn as_server(&self) -> Option<&CounterServer> {
        match self {
            CounterService::Server(server) => Some(server),
            CounterService::Client(_) => None,
        }
    }
}

impl Counter for CounterService {
    fn increase(&self, amount: i64) -> Result<()> {
        match self {
            CounterService::Server(server) => server.increase(amount),
            CounterService::Client(client) => client.increase(amount),
        }
    }

    fn value(&self) -> i64 {
        match self {
            CounterService::Server(server) => server.value(),
            CounterService::Client(client) => client.value(),
        }
    }
}
