//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when the socket is readable, then we
//! perform non-blocking `recv_from` calls until the socket would block.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! ## Shutdown
//!
//! Every wait is bounded by `ListenerOptions::poll_timeout`, and the shutdown
//! flag is checked after every wake and before every datagram. `close` also
//! fires the waker, so in practice the loop stops right away; without the
//! wake-up it still stops within one timeout period.
//!
//! ## Local increments
//!
//! The aggregate has exactly one writer, this loop. Increments made through a
//! server handle in the same process are queued on a channel and applied here,
//! between socket reads.

use super::{ListenerState, SharedState};
use crate::config::{Endpoint, ListenerOptions};
use crate::error::{CounterError, Result};
use crate::protocol;
use crate::storage::{CounterHandle, CounterStore, ListenerStats, StatsSnapshot};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

const SOCKET_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

const EVENTS_CAPACITY: usize = 64;

/// Everything owned by the listener thread.
struct Listener {
    poll: Poll,
    socket: UdpSocket,
    local_addr: SocketAddr,
    store: CounterStore,
    stats: Arc<ListenerStats>,
    shared: Arc<SharedState>,
    local_rx: Receiver<i64>,
    options: ListenerOptions,
}

/// Caller-side view of a running listener.
#[derive(Debug)]
pub(crate) struct ListenerHandle {
    local_addr: SocketAddr,
    options: ListenerOptions,
    shared: Arc<SharedState>,
    value: CounterHandle,
    stats: Arc<ListenerStats>,
    local_tx: Sender<i64>,
    waker: Waker,
}

/// Bind the socket and start the listener thread.
///
/// Option validation, binding, poller setup and thread creation all happen
/// before this returns, so any failure reaches the caller.
pub(crate) fn start(endpoint: Endpoint, options: ListenerOptions) -> Result<ListenerHandle> {
    options.validate()?;

    let addr = endpoint.socket_addr();
    let bind_err = |e: io::Error| CounterError::Bind(addr, e);

    let shared = Arc::new(SharedState::new());

    let socket = bind_udp(addr).map_err(bind_err)?;
    let local_addr = socket.local_addr().map_err(bind_err)?;
    let mut socket = UdpSocket::from_std(socket);

    let poll = Poll::new().map_err(bind_err)?;
    poll.registry()
        .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)
        .map_err(bind_err)?;
    let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(bind_err)?;

    let (local_tx, local_rx) = mpsc::channel();
    let store = CounterStore::new();
    let value = store.handle();
    let stats = ListenerStats::new();

    let listener = Listener {
        poll,
        socket,
        local_addr,
        store,
        stats: Arc::clone(&stats),
        shared: Arc::clone(&shared),
        local_rx,
        options,
    };

    // The socket is bound, so datagrams already queue in the kernel.
    shared.set_state(ListenerState::Running);

    if let Err(e) = thread::Builder::new()
        .name("counter-listener".to_string())
        .spawn(move || listener.run())
    {
        shared.set_state(ListenerState::Stopped);
        return Err(CounterError::Spawn(e));
    }

    info!(
        endpoint = %local_addr,
        poll_timeout_ms = options.poll_timeout.as_millis() as u64,
        max_datagram_size = options.max_datagram_size,
        "Counter listener started"
    );

    Ok(ListenerHandle {
        local_addr,
        options,
        shared,
        value,
        stats,
        local_tx,
        waker,
    })
}

impl Listener {
    fn run(mut self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        // One spare byte so oversized datagrams show up as longer than the limit.
        let mut buf = vec![0u8; self.options.max_datagram_size + 1];

        while !self.shared.shutdown_requested() {
            if let Err(e) = self.poll.poll(&mut events, Some(self.options.poll_timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(endpoint = %self.local_addr, error = %e, "Poll failed, stopping listener");
                self.shared.request_shutdown();
                break;
            }

            if self.shared.shutdown_requested() {
                break;
            }

            for event in events.iter() {
                if event.token() == SOCKET_TOKEN {
                    self.drain_socket(&mut buf);
                }
            }

            // Woken or not, pick up anything queued locally.
            self.drain_local();
        }

        self.stop();
    }

    /// Read datagrams until the socket would block or shutdown is requested.
    fn drain_socket(&mut self, buf: &mut [u8]) {
        loop {
            if self.shared.shutdown_requested() {
                return;
            }

            match self.socket.recv_from(buf) {
                Ok((n, peer)) => {
                    self.stats.record_received();
                    self.handle_datagram(&buf[..n], peer);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Pending socket errors are consumed by the read.
                    debug!(error = %e, "Receive failed");
                }
            }
        }
    }

    fn handle_datagram(&mut self, payload: &[u8], peer: SocketAddr) {
        match protocol::decode_with_limit(payload, self.options.max_datagram_size) {
            Ok(command) => match self.store.apply(command.amount) {
                Ok(_) => self.stats.record_applied(),
                Err(e) => {
                    self.stats.record_rejected();
                    warn!(peer = %peer, error = %e, "Dropping increment");
                }
            },
            Err(e) => {
                self.stats.record_rejected();
                warn!(peer = %peer, len = payload.len(), error = %e, "Invalid command");
            }
        }
    }

    fn drain_local(&mut self) {
        while let Ok(amount) = self.local_rx.try_recv() {
            match self.store.apply(amount) {
                Ok(_) => self.stats.record_local(),
                Err(e) => {
                    self.stats.record_rejected();
                    warn!(error = %e, "Dropping local increment");
                }
            }
        }
    }

    fn stop(mut self) {
        // `submit` reports success only if it still saw `Running` after
        // queueing, so anything it accepted is drained here.
        self.shared.set_state(ListenerState::Stopping);
        self.drain_local();

        if let Err(e) = self.poll.registry().deregister(&mut self.socket) {
            debug!(error = %e, "Deregister failed");
        }

        let Listener {
            socket,
            local_addr,
            store,
            stats,
            shared,
            ..
        } = self;
        drop(socket);

        let snapshot = stats.snapshot();
        info!(
            endpoint = %local_addr,
            value = store.get(),
            received = snapshot.received,
            applied = snapshot.applied,
            local = snapshot.local,
            rejected = snapshot.rejected,
            "Counter listener stopped"
        );

        shared.set_state(ListenerState::Stopped);
    }
}

impl ListenerHandle {
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn options(&self) -> ListenerOptions {
        self.options
    }

    pub(crate) fn state(&self) -> ListenerState {
        self.shared.state()
    }

    pub(crate) fn value(&self) -> i64 {
        self.value.get()
    }

    pub(crate) fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Queue a local increment for the listener thread.
    ///
    /// `Ok` means the loop will apply the increment. An increment racing with
    /// shutdown may come back `Closed` even though the final drain applied it.
    pub(crate) fn submit(&self, amount: i64) -> Result<()> {
        if self.shared.shutdown_requested() {
            return Err(CounterError::Closed);
        }
        self.local_tx
            .send(amount)
            .map_err(|_| CounterError::Closed)?;
        if self.shared.state() != ListenerState::Running {
            return Err(CounterError::Closed);
        }
        self.wake();
        Ok(())
    }

    /// Raise the shutdown flag and wake the loop. Returns `false` if shutdown
    /// had already been requested.
    pub(crate) fn shutdown(&self) -> bool {
        if !self.shared.request_shutdown() {
            return false;
        }
        self.wake();
        true
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            debug!(error = %e, "Failed to wake listener");
        }
    }
}

/// Create a non-blocking UDP socket bound to `addr`.
///
/// No address or port reuse: an endpoint already bound elsewhere is an error.
fn bind_udp(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn fast_options() -> ListenerOptions {
        ListenerOptions {
            poll_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_bind_udp_rejects_busy_endpoint() {
        let first = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();

        let err = bind_udp(addr).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[test]
    fn test_listener_applies_datagrams() {
        let handle = start(Endpoint::localhost(0), fast_options()).unwrap();
        assert_eq!(handle.state(), ListenerState::Running);

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"INC 4", handle.local_addr()).unwrap();
        sender.send_to(b"bogus", handle.local_addr()).unwrap();
        sender.send_to(b"INC 6", handle.local_addr()).unwrap();

        assert!(wait_until(Duration::from_secs(2), || handle.value() == 10));
        assert!(wait_until(Duration::from_secs(2), || {
            let stats = handle.stats();
            stats.applied == 2 && stats.rejected == 1
        }));
        assert_eq!(handle.stats().received, 3);

        handle.shutdown();
    }

    #[test]
    fn test_local_submit_applied_by_loop() {
        let handle = start(Endpoint::localhost(0), fast_options()).unwrap();

        handle.submit(3).unwrap();
        handle.submit(-1).unwrap();

        assert!(wait_until(Duration::from_secs(2), || handle.value() == 2));
        assert!(wait_until(Duration::from_secs(2), || handle.stats().local == 2));

        handle.shutdown();
    }

    #[test]
    fn test_shutdown_stops_loop() {
        let handle = start(Endpoint::localhost(0), fast_options()).unwrap();

        assert!(handle.shutdown());
        assert!(!handle.shutdown());

        assert!(wait_until(Duration::from_secs(2), || {
            handle.state() == ListenerState::Stopped
        }));
        assert!(matches!(handle.submit(1), Err(CounterError::Closed)));
    }

    #[test]
    fn test_invalid_options_rejected_before_bind() {
        // A busy endpoint: options must be rejected before the bind is tried.
        let busy = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let endpoint = Endpoint::from(busy.local_addr().unwrap());

        let cases = [
            (
                ListenerOptions {
                    max_datagram_size: 0,
                    ..fast_options()
                },
                "max_datagram_size",
            ),
            (
                ListenerOptions {
                    max_datagram_size: protocol::MAX_DATAGRAM_SIZE + 1,
                    ..fast_options()
                },
                "max_datagram_size",
            ),
            (
                ListenerOptions {
                    poll_timeout: Duration::ZERO,
                    ..fast_options()
                },
                "poll_timeout",
            ),
        ];

        for (options, field) in cases {
            match start(endpoint, options) {
                Err(CounterError::InvalidOptions(e)) => assert_eq!(e.field, field),
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[test]
    fn test_smallest_datagram_limit_still_applies() {
        let options = ListenerOptions {
            max_datagram_size: 5,
            ..fast_options()
        };
        let handle = start(Endpoint::localhost(0), options).unwrap();

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"INC 5", handle.local_addr()).unwrap();
        sender.send_to(b"INC 10", handle.local_addr()).unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            let stats = handle.stats();
            stats.applied == 1 && stats.rejected == 1
        }));
        assert_eq!(handle.value(), 5);

        handle.shutdown();
    }

    #[test]
    fn test_oversized_datagram_rejected_whole() {
        let handle = start(Endpoint::localhost(0), fast_options()).unwrap();

        // Valid prefix, junk past the limit
        let mut payload = b"INC 5".to_vec();
        payload.extend(std::iter::repeat(b' ').take(1100));
        payload.extend_from_slice(b"junk");

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&payload, handle.local_addr()).unwrap();
        sender.send_to(b"INC 2", handle.local_addr()).unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            let stats = handle.stats();
            stats.applied == 1 && stats.rejected == 1
        }));
        assert_eq!(handle.value(), 2);

        handle.shutdown();
    }

    #[test]
    fn test_submit_refused_once_stopping() {
        let handle = start(Endpoint::localhost(0), fast_options()).unwrap();

        // Loop still running, but the state has left `Running`: the queued
        // increment may or may not be drained, so it is not reported as accepted.
        handle.shared.set_state(ListenerState::Stopping);
        assert!(matches!(handle.submit(1), Err(CounterError::Closed)));

        handle.shutdown();
        assert!(wait_until(Duration::from_secs(2), || {
            handle.state() == ListenerState::Stopped
        }));
    }

    #[test]
    fn test_flag_alone_stops_within_poll_timeout() {
        let options = ListenerOptions {
            poll_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let handle = start(Endpoint::localhost(0), options).unwrap();
        let limit = options.poll_timeout.mul_f64(1.5);

        // Raise the flag without firing the waker.
        let raised_at = Instant::now();
        assert!(handle.shared.request_shutdown());

        assert!(wait_until(limit, || handle.state() == ListenerState::Stopped));
        assert!(raised_at.elapsed() <= limit + Duration::from_millis(10));

        // The endpoint is free again.
        bind_udp(handle.local_addr()).unwrap();
    }

    #[test]
    fn test_overflowing_datagram_is_dropped() {
        let handle = start(Endpoint::localhost(0), fast_options()).unwrap();
        handle.submit(i64::MAX).unwrap();
        assert!(wait_until(Duration::from_secs(2), || handle.value() == i64::MAX));

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"INC 1", handle.local_addr()).unwrap();

        assert!(wait_until(Duration::from_secs(2), || handle.stats().rejected == 1));
        assert_eq!(handle.value(), i64::MAX);

        handle.shutdown();
    }
}
