//! Group network: one channel per party plus the collective operations
//!
//! Every channel operation completes only once its bytes are handed off or
//! received, so collectives that both send and receive run the two halves
//! concurrently and join them before returning. Nothing is left running in
//! the background after a call returns.

use futures_util::future::try_join_all;
use tracing::{debug, info};

use crate::bootstrap::{endpoint_info, Direction};
use crate::channel::{Channel, ChannelStats, LoopbackChannel, SocketChannel};
use crate::config::{GroupDescriptor, NetworkConfig, PartyId};
use crate::error::{Error, Result};

/// Lifecycle of a [`Network`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkState {
    Unconnected,
    Connected,
    Closed,
}

/// Direction bytes travel around the ring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExchangeOrder {
    /// Send to the next party, receive from the previous one
    Increasing,
    /// Send to the previous party, receive from the next one
    #[default]
    Decreasing,
}

/// Connections from the local party to every party of the group.
#[derive(Debug)]
pub struct Network {
    descriptor: GroupDescriptor,
    config: NetworkConfig,
    channels: Vec<Channel>,
    state: NetworkState,
}

impl Network {
    /// Create an unconnected network for `descriptor`.
    pub fn new(descriptor: GroupDescriptor, config: NetworkConfig) -> Result<Self> {
        config.validate(descriptor.size())?;
        Ok(Self {
            descriptor,
            config,
            channels: Vec::new(),
            state: NetworkState::Unconnected,
        })
    }

    pub fn local_id(&self) -> PartyId {
        self.descriptor.local_id()
    }

    pub fn size(&self) -> usize {
        self.descriptor.size()
    }

    pub fn base_port(&self) -> u16 {
        self.config.base_port
    }

    pub fn descriptor(&self) -> &GroupDescriptor {
        &self.descriptor
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn state(&self) -> NetworkState {
        self.state
    }

    /// Id of the next party on the ring.
    pub fn next_id(&self) -> PartyId {
        (self.local_id() + 1) % self.size()
    }

    /// Id of the previous party on the ring.
    pub fn prev_id(&self) -> PartyId {
        (self.local_id() + self.size() - 1) % self.size()
    }

    /// Establish a channel to every party, in ascending id order.
    ///
    /// On failure the channels opened so far are closed and the network
    /// stays unconnected.
    pub async fn connect(&mut self) -> Result<()> {
        if self.state != NetworkState::Unconnected {
            return Err(Error::Misuse(format!(
                "connect called on a network in state {:?}",
                self.state
            )));
        }
        info!("{} connecting", self.descriptor);

        let mut channels = Vec::with_capacity(self.size());
        for remote in 0..self.size() {
            let result = async {
                let mut channel = self.make_channel(remote)?;
                channel.connect(&self.config).await?;
                Ok::<_, Error>(channel)
            }
            .await;

            match result {
                Ok(channel) => {
                    debug!("connected {}", channel);
                    channels.push(channel);
                }
                Err(e) => {
                    for channel in channels.iter_mut() {
                        channel.close().await;
                    }
                    return Err(e);
                }
            }
        }

        self.channels = channels;
        self.state = NetworkState::Connected;
        info!("{} connected", self.descriptor);
        Ok(())
    }

    /// Close every channel. Only the first call after `connect` does work.
    pub async fn close(&mut self) {
        if self.state != NetworkState::Connected {
            return;
        }
        for channel in self.channels.iter_mut() {
            channel.close().await;
        }
        self.channels.clear();
        self.state = NetworkState::Closed;
        debug!("{} closed", self.descriptor);
    }

    pub async fn send_to(&self, receiver: PartyId, buf: &[u8]) -> Result<()> {
        self.channel(receiver)?.send(buf).await
    }

    pub async fn recv_from(&self, sender: PartyId, len: usize) -> Result<Vec<u8>> {
        self.channel(sender)?.recv(len).await
    }

    /// Send `sbuf` to `other` while receiving `rlen` bytes from it.
    pub async fn exchange_with(
        &self,
        other: PartyId,
        sbuf: &[u8],
        rlen: usize,
    ) -> Result<Vec<u8>> {
        let channel = self.channel(other)?;
        if other == self.local_id() {
            return channel.exchange(sbuf, rlen).await;
        }
        let ((), received) = tokio::try_join!(channel.send(sbuf), channel.recv(rlen))?;
        Ok(received)
    }

    /// Send `sbufs[i]` to every party `i` and receive `rlens[i]` bytes from it.
    ///
    /// The result is indexed by sender. The self entry goes through the
    /// loopback channel like any other.
    pub async fn exchange_all<B: AsRef<[u8]>>(
        &self,
        sbufs: &[B],
        rlens: &[usize],
    ) -> Result<Vec<Vec<u8>>> {
        self.ensure_connected()?;
        if sbufs.len() != self.size() || rlens.len() != self.size() {
            return Err(Error::Misuse(format!(
                "exchange_all needs {} send buffers and lengths, got {} and {}",
                self.size(),
                sbufs.len(),
                rlens.len()
            )));
        }
        debug!("exchange_all()");

        // the loopback slot has to be filled before its receive runs
        let me = self.local_id();
        self.channels[me].send(sbufs[me].as_ref()).await?;

        let sends = try_join_all(
            self.channels
                .iter()
                .zip(sbufs)
                .filter(|(channel, _)| channel.remote_id() != me)
                .map(|(channel, buf)| channel.send(buf.as_ref())),
        );
        let recvs = try_join_all(
            self.channels
                .iter()
                .zip(rlens)
                .map(|(channel, &len)| channel.recv(len)),
        );

        let (_, received) = tokio::try_join!(sends, recvs)?;
        Ok(received)
    }

    /// Send `buf` to every party, the local one included.
    pub async fn broadcast_send(&self, buf: &[u8]) -> Result<()> {
        self.ensure_connected()?;
        debug!("broadcast_send()");
        try_join_all(self.channels.iter().map(|channel| channel.send(buf))).await?;
        Ok(())
    }

    /// Receive `len` bytes broadcast by `broadcaster`.
    pub async fn broadcast_recv(&self, broadcaster: PartyId, len: usize) -> Result<Vec<u8>> {
        debug!("broadcast_recv()");
        self.channel(broadcaster)?.recv(len).await
    }

    /// Pass `sbuf` one step around the ring and receive `rlen` bytes from
    /// the other side.
    pub async fn exchange_ring(
        &self,
        sbuf: &[u8],
        rlen: usize,
        order: ExchangeOrder,
    ) -> Result<Vec<u8>> {
        let (send_id, recv_id) = match order {
            ExchangeOrder::Increasing => (self.next_id(), self.prev_id()),
            ExchangeOrder::Decreasing => (self.prev_id(), self.next_id()),
        };
        let sender = self.channel(send_id)?;
        let receiver = self.channel(recv_id)?;
        debug!("exchange_ring() send to {} recv from {}", send_id, recv_id);

        if send_id == self.local_id() {
            // single party ring
            return sender.exchange(sbuf, rlen).await;
        }
        let ((), received) = tokio::try_join!(sender.send(sbuf), receiver.recv(rlen))?;
        Ok(received)
    }

    /// Total traffic over all channels.
    pub fn stats(&self) -> ChannelStats {
        self.channels
            .iter()
            .map(Channel::stats)
            .fold(ChannelStats::default(), |acc, s| acc + s)
    }

    /// Traffic exchanged with one party.
    pub fn peer_stats(&self, peer: PartyId) -> Result<ChannelStats> {
        Ok(self.channel(peer)?.stats())
    }

    fn make_channel(&self, remote: PartyId) -> Result<Channel> {
        if remote == self.local_id() {
            return Ok(Channel::Loopback(LoopbackChannel::new(remote)));
        }
        let base_port = self.config.base_port;
        let outgoing = endpoint_info(&self.descriptor, base_port, remote, Direction::Outgoing)?;
        let incoming = endpoint_info(&self.descriptor, base_port, remote, Direction::Incoming)?;
        Ok(Channel::Socket(SocketChannel::new(outgoing, incoming)?))
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.state == NetworkState::Connected {
            Ok(())
        } else {
            Err(Error::Misuse(format!(
                "network operation in state {:?}",
                self.state
            )))
        }
    }

    fn channel(&self, peer: PartyId) -> Result<&Channel> {
        self.ensure_connected()?;
        self.channels.get(peer).ok_or_else(|| {
            Error::Misuse(format!(
                "party {} out of range for group of size {}",
                peer,
                self.size()
            ))
        })
    }
}
