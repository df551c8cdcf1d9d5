//! Point-to-point channels between two parties
//!
//! A [`Channel`] is either a [`LoopbackChannel`] (the party talking to
//! itself, no I/O) or a [`SocketChannel`] (two TCP streams, one per
//! direction). The [`Network`](crate::network::Network) owns exactly one
//! channel per party id.

mod loopback;
mod socket;

pub use loopback::LoopbackChannel;
pub use socket::SocketChannel;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::{NetworkConfig, PartyId};
use crate::error::Result;

/// Role of the local end for one stream of a pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelRole {
    /// Binds the pair port and accepts the remote initiator
    Listener,
    /// Connects to the remote listener, retrying while it is not up yet
    Initiator,
    /// Party talking to itself
    Loopback,
}

/// Everything needed to establish one stream of a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelEndpointInfo {
    pub local_id: PartyId,
    pub remote_id: PartyId,
    /// `None` for loopback channels
    pub port: Option<u16>,
    pub hostname: String,
    pub role: ChannelRole,
}

impl ChannelEndpointInfo {
    pub fn loopback(id: PartyId) -> Self {
        Self {
            local_id: id,
            remote_id: id,
            port: None,
            hostname: String::new(),
            role: ChannelRole::Loopback,
        }
    }
}

impl fmt::Display for ChannelEndpointInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            ChannelRole::Loopback => return write!(f, "<loopback (id={})>", self.local_id),
            ChannelRole::Listener => "listener",
            ChannelRole::Initiator => "initiator",
        };
        write!(
            f,
            "<{} (id={}, remote={}), port={}, hostname={}>",
            role,
            self.local_id,
            self.remote_id,
            self.port.unwrap_or_default(),
            self.hostname
        )
    }
}

/// Snapshot of the bytes moved over a channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub bytes_sent: usize,
    pub bytes_recv: usize,
}

impl std::ops::Add for ChannelStats {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            bytes_sent: self.bytes_sent + other.bytes_sent,
            bytes_recv: self.bytes_recv + other.bytes_recv,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct TrafficCounters {
    sent: AtomicUsize,
    recv: AtomicUsize,
}

impl TrafficCounters {
    pub(crate) fn record_sent(&self, n: usize) {
        self.sent.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_recv(&self, n: usize) {
        self.recv.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            bytes_sent: self.sent.load(Ordering::Relaxed),
            bytes_recv: self.recv.load(Ordering::Relaxed),
        }
    }
}

/// Full-duplex byte stream to one party.
#[derive(Debug)]
pub enum Channel {
    Loopback(LoopbackChannel),
    Socket(SocketChannel),
}

impl Channel {
    /// Establish the channel. A no-op when it is already alive.
    pub async fn connect(&mut self, config: &NetworkConfig) -> Result<()> {
        match self {
            Channel::Loopback(chl) => {
                chl.connect();
                Ok(())
            }
            Channel::Socket(chl) => chl.connect(config).await,
        }
    }

    /// Release the transport. Safe to call more than once.
    pub async fn close(&mut self) {
        match self {
            Channel::Loopback(chl) => chl.close(),
            Channel::Socket(chl) => chl.close().await,
        }
    }

    /// Hand all of `buf` to the remote end.
    pub async fn send(&self, buf: &[u8]) -> Result<()> {
        match self {
            Channel::Loopback(chl) => chl.send(buf),
            Channel::Socket(chl) => chl.send(buf).await,
        }
    }

    /// Receive exactly `len` bytes from the remote end.
    pub async fn recv(&self, len: usize) -> Result<Vec<u8>> {
        match self {
            Channel::Loopback(chl) => chl.recv(len),
            Channel::Socket(chl) => chl.recv(len).await,
        }
    }

    /// Send `sbuf`, then receive `rlen` bytes.
    ///
    /// Both ends calling this with large buffers can deadlock on full
    /// socket buffers; the network's collective operations overlap the two
    /// halves instead.
    pub async fn exchange(&self, sbuf: &[u8], rlen: usize) -> Result<Vec<u8>> {
        self.send(sbuf).await?;
        self.recv(rlen).await
    }

    pub fn is_alive(&self) -> bool {
        match self {
            Channel::Loopback(chl) => chl.is_alive(),
            Channel::Socket(chl) => chl.is_alive(),
        }
    }

    pub fn info(&self) -> &ChannelEndpointInfo {
        match self {
            Channel::Loopback(chl) => chl.info(),
            Channel::Socket(chl) => chl.outgoing_info(),
        }
    }

    pub fn local_id(&self) -> PartyId {
        self.info().local_id
    }

    pub fn remote_id(&self) -> PartyId {
        self.info().remote_id
    }

    pub fn stats(&self) -> ChannelStats {
        match self {
            Channel::Loopback(chl) => chl.stats(),
            Channel::Socket(chl) => chl.stats(),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.info(), f)
    }
}
