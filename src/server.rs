//! UDP server that aggregates increments from any number of clients.
//!
//! Binds the endpoint, starts the listener loop on its own thread, and exposes
//! the aggregate read-only. All mutation goes through the loop.

use crate::config::{Endpoint, ListenerOptions};
use crate::counter::Counter;
use crate::error::Result;
use crate::runtime::{self, ListenerHandle, ListenerState};
use crate::storage::StatsSnapshot;
use std::time::Duration;
use tracing::info;

/// Server-mode counter.
///
/// Dropping the server requests shutdown the same way `close` does.
#[derive(Debug)]
pub struct CounterServer {
    listener: ListenerHandle,
}

impl CounterServer {
    /// Bind `endpoint` with default listener options and start listening.
    pub fn bind(endpoint: Endpoint) -> Result<Self> {
        Self::with_options(endpoint, ListenerOptions::default())
    }

    /// Bind `endpoint` and start listening.
    ///
    /// Fails with `CounterError::InvalidOptions` if `options` do not validate,
    /// and with `CounterError::Bind` if the endpoint is already in use.
    pub fn with_options(endpoint: Endpoint, options: ListenerOptions) -> Result<Self> {
        let listener = runtime::start(endpoint, options)?;
        Ok(CounterServer { listener })
    }

    /// The endpoint actually bound (resolves port 0).
    pub fn local_endpoint(&self) -> Endpoint {
        Endpoint::from(self.listener.local_addr())
    }

    pub fn poll_timeout(&self) -> Duration {
        self.listener.options().poll_timeout
    }

    pub fn state(&self) -> ListenerState {
        self.listener.state()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.listener.stats()
    }

    /// Ask the listener to stop and return immediately.
    ///
    /// The loop releases the socket at its next wake, at most one poll
    /// timeout later. Calling this again is a no-op. Datagrams still queued
    /// in the kernel at that point are discarded.
    pub fn close(&self) {
        if self.listener.shutdown() {
            info!(endpoint = %self.listener.local_addr(), "Counter server shutdown requested");
        }
    }
}

impl Counter for CounterServer {
    /// Queue a local increment; the listener applies it shortly after.
    ///
    /// Fails with `Closed` once shutdown has begun. An increment racing with
    /// `close` may be reported `Closed` and still be applied by the final drain.
    fn increase(&self, amount: i64) -> Result<()> {
        self.listener.submit(amount)
    }

    fn value(&self) -> i64 {
        self.listener.value()
    }
}

impl Drop for CounterServer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{self, CounterClient};
    use crate::error::CounterError;
    use std::thread;
    use std::time::Instant;

    fn options(poll_timeout_ms: u64) -> ListenerOptions {
        ListenerOptions {
            poll_timeout: Duration::from_millis(poll_timeout_ms),
            ..Default::default()
        }
    }

    fn ephemeral_server() -> CounterServer {
        CounterServer::with_options(Endpoint::localhost(0), options(100)).unwrap()
    }

    fn wait_for_value(server: &CounterServer, expected: i64) -> i64 {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline && server.value() != expected {
            thread::sleep(Duration::from_millis(10));
        }
        server.value()
    }

    #[test]
    fn test_three_senders_sum() {
        let server =
            CounterServer::with_options(Endpoint::localhost(19999), options(100)).unwrap();
        let endpoint = server.local_endpoint();
        assert_eq!(endpoint.port(), 19999);

        let handles: Vec<_> = [10, 20, 5]
            .into_iter()
            .map(|amount| {
                thread::spawn(move || CounterClient::new(endpoint).increase(amount))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        assert_eq!(wait_for_value(&server, 35), 35);
        server.close();
    }

    #[test]
    fn test_bad_command_dropped_good_applied() {
        let server = ephemeral_server();
        let addr = server.local_endpoint().socket_addr();

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"INC notanumber", addr).unwrap();
        sender.send_to(b"INC 7", addr).unwrap();

        assert_eq!(wait_for_value(&server, 7), 7);
        server.close();
    }

    #[test]
    fn test_malformed_datagrams_do_not_stop_loop() {
        let server = ephemeral_server();
        let addr = server.local_endpoint().socket_addr();

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let payloads: [&[u8]; 5] = [b"FOO 5", b"INC abc", b"", b"INC 1 2", &[0xff, 0xfe]];
        for payload in payloads {
            sender.send_to(payload, addr).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline && server.stats().rejected < 5 {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(server.stats().rejected, 5);
        assert_eq!(server.value(), 0);
        assert_eq!(server.state(), ListenerState::Running);

        client::send(server.local_endpoint(), 3).unwrap();
        assert_eq!(wait_for_value(&server, 3), 3);
    }

    #[test]
    fn test_sum_independent_of_order() {
        let amounts = [5, -2, 40, 1, 13, -7, 100];
        let expected: i64 = amounts.iter().sum();

        for permutation in [amounts.to_vec(), amounts.iter().rev().copied().collect()] {
            let server = ephemeral_server();
            let endpoint = server.local_endpoint();

            let handles: Vec<_> = permutation
                .into_iter()
                .map(|amount| thread::spawn(move || client::send(endpoint, amount)))
                .collect();
            for handle in handles {
                handle.join().unwrap().unwrap();
            }

            assert_eq!(wait_for_value(&server, expected), expected);
        }
    }

    #[test]
    fn test_local_increase_routed_through_loop() {
        let server = ephemeral_server();

        server.increase(10).unwrap();
        client::send(server.local_endpoint(), 5).unwrap();
        server.increase(1).unwrap();

        assert_eq!(wait_for_value(&server, 16), 16);
    }

    #[test]
    fn test_bind_in_use_fails() {
        let server = ephemeral_server();

        match CounterServer::bind(server.local_endpoint()) {
            Err(CounterError::Bind(addr, _)) => {
                assert_eq!(addr, server.local_endpoint().socket_addr())
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_with_options_rejects_unusable_options() {
        let empty_buffer = ListenerOptions {
            max_datagram_size: 0,
            ..options(100)
        };
        assert!(matches!(
            CounterServer::with_options(Endpoint::localhost(0), empty_buffer),
            Err(CounterError::InvalidOptions(_))
        ));

        let busy_wait = ListenerOptions {
            poll_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            CounterServer::with_options(Endpoint::localhost(0), busy_wait),
            Err(CounterError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_close_twice_is_noop() {
        let server = ephemeral_server();

        server.close();
        server.close();

        assert!(matches!(server.increase(1), Err(CounterError::Closed)));
    }

    #[test]
    fn test_close_releases_endpoint_within_timeout() {
        let server = ephemeral_server();
        let endpoint = server.local_endpoint();
        let limit = server.poll_timeout().mul_f64(1.5);

        let closed_at = Instant::now();
        server.close();

        let rebound = loop {
            match CounterServer::with_options(endpoint, options(100)) {
                Ok(rebound) => break rebound,
                Err(CounterError::Bind(..)) if closed_at.elapsed() < limit => {
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("endpoint not released after {:?}: {}", limit, e),
            }
        };
        assert!(closed_at.elapsed() <= limit);
        assert!(matches!(
            server.state(),
            ListenerState::Stopping | ListenerState::Stopped
        ));
        assert_eq!(rebound.local_endpoint(), endpoint);
    }

    #[test]
    fn test_value_survives_close() {
        let server = ephemeral_server();
        server.increase(9).unwrap();
        assert_eq!(wait_for_value(&server, 9), 9);

        server.close();
        assert_eq!(server.value(), 9);
    }
}
