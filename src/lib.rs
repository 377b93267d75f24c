//! udp-counter: a shared counter aggregated over UDP
//!
//! Worker processes report increments to one aggregating server without
//! shared memory:
//! - Clients fire `INC <amount>` datagrams and never wait for a reply
//! - The server applies them on a single listener thread
//! - Shutdown is cooperative and bounded by the listener's poll timeout
//!
//! ```no_run
//! use udp_counter::{Counter, CounterClient, CounterServer, Endpoint};
//!
//! let server = CounterServer::bind(Endpoint::default())?;
//! CounterClient::new(server.local_endpoint()).increase(10)?;
//! // ...
//! println!("{}", server.value());
//! server.close();
//! # Ok::<(), udp_counter::CounterError>(())
//! ```

pub mod client;
pub mod config;
pub mod counter;
pub mod error;
pub mod protocol;
mod runtime;
pub mod server;
pub mod storage;

pub use client::{send, send_async, CounterClient};
pub use config::{Config, Endpoint, InvalidOptions, ListenerOptions};
pub use counter::{create, Counter, CounterService, Mode};
pub use error::{CounterError, Result};
pub use protocol::{decode, decode_with_limit, encode, DecodeError, IncrementCommand};
pub use runtime::ListenerState;
pub use server::CounterServer;
pub use storage::{merge, LocalCounter, StatsSnapshot};
