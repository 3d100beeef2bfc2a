//! Homogeneous connection handles.
//!
//! Worker and peer registries key their entries by [`SessionId`] and talk to
//! the underlying connection only through [`SessionHandle::send`]. Whether
//! the bytes end up on a server-accepted websocket or one we dialed out is a
//! detail of the writer task draining the channel.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier of one websocket session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        Self(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Outbound half of a session: frames queued here are written to the socket
/// by the connection's writer task, in order.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl SessionHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue one binary frame. Returns false if the connection is gone; the
    /// disconnect handler owns the cleanup, so callers only log.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        self.tx.send(frame).is_ok()
    }
}
