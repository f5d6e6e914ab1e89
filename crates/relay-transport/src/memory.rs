//! In-memory transport.
//!
//! [`MemoryConnector`] hands out scripted connect outcomes and [`MemoryLink`]s
//! whose remote side is driven through a [`MemoryPeer`]. Used to exercise the
//! upstream reconnect logic without sockets.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use crate::traits::{Connector, Inbound, Link, TransportError};

/// Events the peer pushes towards the link.
#[derive(Debug)]
enum PeerEvent {
    Message(Inbound),
    Error(String),
    Close,
}

/// Create a connected link/peer pair.
#[must_use]
pub fn pair() -> (MemoryLink, MemoryPeer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    let link = MemoryLink {
        inbound: inbound_rx,
        outbound: outbound_tx,
        is_open: true,
    };
    let peer = MemoryPeer {
        inbound: inbound_tx,
        outbound: outbound_rx,
    };
    (link, peer)
}

/// Local end of an in-memory link.
#[derive(Debug)]
pub struct MemoryLink {
    inbound: mpsc::UnboundedReceiver<PeerEvent>,
    outbound: mpsc::UnboundedSender<String>,
    is_open: bool,
}

#[async_trait]
impl Link for MemoryLink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }
        self.outbound
            .send(text)
            .map_err(|_| TransportError::SendFailed("peer dropped".into()))
    }

    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        if !self.is_open {
            return Ok(None);
        }
        match self.inbound.recv().await {
            Some(PeerEvent::Message(msg)) => Ok(Some(msg)),
            Some(PeerEvent::Error(e)) => {
                self.is_open = false;
                Err(TransportError::ReceiveFailed(e))
            }
            Some(PeerEvent::Close) | None => {
                self.is_open = false;
                Ok(None)
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.is_open = false;
        self.inbound.close();
        Ok(())
    }
}

/// Remote end of an in-memory link.
#[derive(Debug)]
pub struct MemoryPeer {
    inbound: mpsc::UnboundedSender<PeerEvent>,
    outbound: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// Deliver a text frame to the link.
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self
            .inbound
            .send(PeerEvent::Message(Inbound::Text(text.into())));
    }

    /// Deliver a binary frame to the link.
    pub fn send_binary(&self, data: impl Into<Bytes>) {
        let _ = self
            .inbound
            .send(PeerEvent::Message(Inbound::Binary(data.into())));
    }

    /// Make the link's next `recv` fail.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.inbound.send(PeerEvent::Error(reason.into()));
    }

    /// Close the link from the remote side.
    pub fn close(&self) {
        let _ = self.inbound.send(PeerEvent::Close);
    }

    /// Wait for the next frame the link sent.
    ///
    /// Returns `None` once the link has been dropped.
    pub async fn next_sent(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    /// Take the next frame the link sent, if one is queued.
    pub fn try_next_sent(&mut self) -> Option<String> {
        self.outbound.try_recv().ok()
    }

    /// Check whether the local end has been dropped or closed.
    #[must_use]
    pub fn is_link_closed(&self) -> bool {
        self.inbound.is_closed()
    }
}

/// A [`Connector`] that replays scripted outcomes.
///
/// Once the script is exhausted every further attempt fails.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    script: Mutex<VecDeque<Result<MemoryLink, String>>>,
    urls: Mutex<Vec<String>>,
    attempts: AtomicUsize,
}

impl MemoryConnector {
    /// Create an empty connector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful connect, returning the peer that drives it.
    pub fn push_link(&self) -> MemoryPeer {
        let (link, peer) = pair();
        lock(&self.script).push_back(Ok(link));
        peer
    }

    /// Queue a failed connect.
    pub fn push_failure(&self, reason: impl Into<String>) {
        lock(&self.script).push_back(Err(reason.into()));
    }

    /// Number of connect attempts so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// URLs passed to `connect`, in order.
    #[must_use]
    pub fn urls(&self) -> Vec<String> {
        lock(&self.urls).clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Link>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        lock(&self.urls).push(url.to_string());

        match lock(&self.script).pop_front() {
            Some(Ok(link)) => Ok(Box::new(link)),
            Some(Err(reason)) => Err(TransportError::ConnectFailed(reason)),
            None => Err(TransportError::ConnectFailed("no scripted link".into())),
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
