//! Server-side connection handles.
//!
//! A [`ConnectionHandle`] is the server's view of one downstream session: an
//! id, an open flag and an unbounded outbound queue. The task that owns the
//! socket drains the queue, so queuing a frame never waits on the peer.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tenvis_relay_transport::{ConnectionId, TransportError};
use tokio::sync::mpsc;
use tracing::trace;

/// A frame queued for a downstream connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// Text frame, shared between all recipients of a broadcast.
    Text(Arc<str>),
    /// Close the socket; nothing is queued after this.
    Close,
}

struct Inner {
    id: ConnectionId,
    sender: mpsc::UnboundedSender<Outgoing>,
    is_open: AtomicBool,
}

/// Cloneable handle to a downstream connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Inner>,
}

impl ConnectionHandle {
    /// Create a handle and the queue its socket task should drain.
    #[must_use]
    pub fn new(id: impl Into<ConnectionId>) -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = Self {
            inner: Arc::new(Inner {
                id: id.into(),
                sender,
                is_open: AtomicBool::new(true),
            }),
        };
        (handle, receiver)
    }

    /// Get the connection's identifier.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    /// Check if the connection is still open.
    ///
    /// A connection whose socket task has gone away counts as closed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.is_open.load(Ordering::SeqCst) && !self.inner.sender.is_closed()
    }

    /// Queue a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the connection is closed.
    pub fn send(&self, text: impl Into<Arc<str>>) -> Result<(), TransportError> {
        if !self.inner.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        self.inner
            .sender
            .send(Outgoing::Text(text.into()))
            .map_err(|_| {
                self.inner.is_open.store(false, Ordering::SeqCst);
                TransportError::ConnectionClosed
            })
    }

    /// Close the connection, asking the socket task to shut the socket.
    ///
    /// Returns `true` if this call closed it.
    pub fn close(&self) -> bool {
        if !self.inner.is_open.swap(false, Ordering::SeqCst) {
            return false;
        }
        trace!(connection = %self.inner.id, "Closing connection");
        let _ = self.inner.sender.send(Outgoing::Close);
        true
    }

    /// Record that the transport itself has closed.
    ///
    /// Unlike [`close`](Self::close) nothing is queued.
    pub fn mark_closed(&self) {
        self.inner.is_open.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("is_open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_and_close() {
        let (handle, mut rx) = ConnectionHandle::new("conn-1");
        assert_eq!(handle.id().as_str(), "conn-1");
        assert!(handle.is_open());

        handle.send("hello").unwrap();
        assert_eq!(rx.try_recv().unwrap(), Outgoing::Text(Arc::from("hello")));

        assert!(handle.close());
        assert!(!handle.close());
        assert_eq!(rx.try_recv().unwrap(), Outgoing::Close);
        assert!(!handle.is_open());
        assert!(matches!(
            handle.send("late"),
            Err(TransportError::ConnectionClosed)
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_receiver_counts_as_closed() {
        let (handle, rx) = ConnectionHandle::new("conn-1");
        drop(rx);
        assert!(!handle.is_open());
        assert!(handle.send("hello").is_err());
    }

    #[test]
    fn test_mark_closed_queues_nothing() {
        let (handle, mut rx) = ConnectionHandle::new("conn-1");
        handle.mark_closed();
        assert!(!handle.is_open());
        assert!(rx.try_recv().is_err());
    }
}
