//! Listener runtime for the counter server.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS). One
//! dedicated thread per server owns the UDP socket and the `CounterStore`;
//! everything else talks to it through:
//! - `ListenerHandle`: shutdown flag, local command channel, value reader
//! - `ListenerState`: observable lifecycle `Starting → Running → Stopping → Stopped`

mod event_loop;

pub(crate) use event_loop::{start, ListenerHandle};

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Lifecycle of a listener loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ListenerState {
    /// Binding the socket and creating the poller.
    Starting = 0,
    /// Accepting datagrams.
    Running = 1,
    /// Shutdown observed; the socket is being released.
    Stopping = 2,
    /// Socket closed, thread exited (or about to).
    Stopped = 3,
}

impl ListenerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ListenerState::Starting,
            1 => ListenerState::Running,
            2 => ListenerState::Stopping,
            _ => ListenerState::Stopped,
        }
    }
}

/// State shared between the listener thread and its handle.
#[derive(Debug)]
pub(crate) struct SharedState {
    state: AtomicU8,
    shutdown: AtomicBool,
}

impl SharedState {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(ListenerState::Starting as u8),
            shutdown: AtomicBool::new(false),
        }
    }

    // SeqCst: `submit` queues then reads the state, `stop` writes the state
    // then drains. Both orders must be observed the same way.
    pub(crate) fn state(&self) -> ListenerState {
        ListenerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: ListenerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Raise the shutdown flag. Returns `false` if it was already raised.
    pub(crate) fn request_shutdown(&self) -> bool {
        !self.shutdown.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}
