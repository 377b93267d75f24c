//! Fire-and-forget client side of the counter protocol.
//!
//! Each send encodes one `INC <amount>` command and hands it to the kernel
//! from a fresh ephemeral socket. Nothing waits for an answer and nothing is
//! retried; a datagram may be lost or duplicated on the way.

use crate::config::Endpoint;
use crate::counter::Counter;
use crate::error::{CounterError, Result};
use crate::protocol;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use tracing::trace;

/// Unspecified local address of the same family as `target`.
fn ephemeral_addr(target: SocketAddr) -> SocketAddr {
    match target {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

/// Send one increment to `endpoint` without blocking.
pub fn send(endpoint: Endpoint, amount: i64) -> Result<()> {
    let target = endpoint.socket_addr();
    let send_err = |e: std::io::Error| CounterError::Send(target, e);

    let payload = protocol::encode(amount);
    let socket = UdpSocket::bind(ephemeral_addr(target)).map_err(send_err)?;
    socket.set_nonblocking(true).map_err(send_err)?;
    socket.send_to(&payload, target).map_err(send_err)?;

    trace!(endpoint = %target, amount, "Sent increment");
    Ok(())
}

/// Send one increment to `endpoint` from a tokio runtime.
pub async fn send_async(endpoint: Endpoint, amount: i64) -> Result<()> {
    let target = endpoint.socket_addr();
    let send_err = |e: std::io::Error| CounterError::Send(target, e);

    let payload = protocol::encode(amount);
    let socket = tokio::net::UdpSocket::bind(ephemeral_addr(target))
        .await
        .map_err(send_err)?;
    socket.send_to(&payload, target).await.map_err(send_err)?;

    trace!(endpoint = %target, amount, "Sent increment");
    Ok(())
}

/// Client-mode counter.
///
/// Holds no socket and no value. `value()` is always zero: a client has no
/// view of the aggregate kept by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterClient {
    endpoint: Endpoint,
}

impl CounterClient {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }
}

impl Counter for CounterClient {
    fn increase(&self, amount: i64) -> Result<()> {
        send(self.endpoint, amount)
    }

    fn value(&self) -> i64 {
        0
    }
}
