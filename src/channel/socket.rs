//! TCP channel built from two one-directional streams

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{ChannelEndpointInfo, ChannelStats, TrafficCounters};
use crate::bootstrap;
use crate::config::{NetworkConfig, PartyId};
use crate::error::{Error, Result};

/// Channel to a remote party over TCP.
///
/// Bytes to the peer travel on the outgoing stream (the local party
/// listened for it), bytes from the peer on the incoming stream (the local
/// party dialed it). Each stream sits behind its own lock, so concurrent
/// senders are serialized while a send and a receive can overlap.
///
/// A transfer that fails or is abandoned after moving some bytes leaves
/// the stream between message boundaries. The channel is then broken:
/// `is_alive` reports false and every later send or receive fails with
/// [`Error::ConnectionLost`] until it is closed and connected again.
#[derive(Debug)]
pub struct SocketChannel {
    outgoing_info: ChannelEndpointInfo,
    incoming_info: ChannelEndpointInfo,
    alive: bool,
    broken: AtomicBool,
    outgoing: Option<Mutex<TcpStream>>,
    incoming: Option<Mutex<TcpStream>>,
    io_timeout: Option<Duration>,
    counters: TrafficCounters,
}

impl SocketChannel {
    /// Create an unconnected channel from the endpoint info of both streams.
    pub fn new(
        outgoing_info: ChannelEndpointInfo,
        incoming_info: ChannelEndpointInfo,
    ) -> Result<Self> {
        bootstrap::validate_pair(&outgoing_info, &incoming_info)?;
        Ok(Self {
            outgoing_info,
            incoming_info,
            alive: false,
            broken: AtomicBool::new(false),
            outgoing: None,
            incoming: None,
            io_timeout: None,
            counters: TrafficCounters::default(),
        })
    }

    pub fn outgoing_info(&self) -> &ChannelEndpointInfo {
        &self.outgoing_info
    }

    pub fn incoming_info(&self) -> &ChannelEndpointInfo {
        &self.incoming_info
    }

    pub fn remote_id(&self) -> PartyId {
        self.outgoing_info.remote_id
    }

    pub fn is_alive(&self) -> bool {
        self.alive && !self.broken.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ChannelStats {
        self.counters.snapshot()
    }

    pub async fn connect(&mut self, config: &NetworkConfig) -> Result<()> {
        if self.alive {
            return Ok(());
        }
        let (outgoing, incoming) =
            bootstrap::establish(&self.outgoing_info, &self.incoming_info, config).await?;

        self.outgoing = Some(Mutex::new(outgoing));
        self.incoming = Some(Mutex::new(incoming));
        self.io_timeout = config.io_timeout;
        self.alive = true;
        debug!(
            "connected: {} / {}",
            self.outgoing_info, self.incoming_info
        );
        Ok(())
    }

    pub async fn close(&mut self) {
        self.alive = false;
        if let Some(outgoing) = self.outgoing.take() {
            let mut stream = outgoing.into_inner();
            if let Err(e) = stream.shutdown().await {
                debug!("shutdown of stream to {} failed: {}", self.remote_id(), e);
            }
        }
        self.incoming = None;
        self.broken.store(false, Ordering::Release);
    }

    /// Write all of `buf` to the outgoing stream.
    pub async fn send(&self, buf: &[u8]) -> Result<()> {
        let peer = self.remote_id();
        let outgoing = self.stream(&self.outgoing)?;
        let progress = AtomicUsize::new(0);

        self.with_deadline("send", &progress, async {
            let mut stream = outgoing.lock().await;
            let transfer = self.begin(buf.len(), &progress)?;
            // not write_all: a failure has to report how many bytes went out
            while transfer.done() < buf.len() {
                match stream.write(&buf[transfer.done()..]).await {
                    Ok(0) => return Err(transfer.fail(lost(peer, buf.len(), transfer.done()))),
                    Ok(n) => transfer.advance(n),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        return Err(transfer.fail(classify(peer, buf.len(), transfer.done(), e)))
                    }
                }
            }
            transfer.finish();
            Ok(())
        })
        .await?;

        self.counters.record_sent(buf.len());
        Ok(())
    }

    /// Read exactly `len` bytes from the incoming stream.
    pub async fn recv(&self, len: usize) -> Result<Vec<u8>> {
        let peer = self.remote_id();
        let incoming = self.stream(&self.incoming)?;
        let progress = AtomicUsize::new(0);
        let mut buf = vec![0u8; len];

        self.with_deadline("recv", &progress, async {
            let mut stream = incoming.lock().await;
            let transfer = self.begin(len, &progress)?;
            while transfer.done() < len {
                match stream.read(&mut buf[transfer.done()..]).await {
                    Ok(0) => return Err(transfer.fail(lost(peer, len, transfer.done()))),
                    Ok(n) => transfer.advance(n),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(transfer.fail(classify(peer, len, transfer.done(), e))),
                }
            }
            transfer.finish();
            Ok(())
        })
        .await?;

        self.counters.record_recv(len);
        Ok(buf)
    }

    fn stream<'a>(&self, half: &'a Option<Mutex<TcpStream>>) -> Result<&'a Mutex<TcpStream>> {
        match half {
            Some(stream) if self.alive => Ok(stream),
            _ => Err(Error::Misuse(format!(
                "channel {} is not connected",
                self.outgoing_info
            ))),
        }
    }

    /// Start a transfer of `expected` bytes; called with the stream lock held.
    fn begin<'a>(&'a self, expected: usize, progress: &'a AtomicUsize) -> Result<Transfer<'a>> {
        if self.broken.load(Ordering::Acquire) {
            return Err(lost(self.remote_id(), expected, 0));
        }
        Ok(Transfer {
            peer: self.remote_id(),
            broken: &self.broken,
            progress,
            finished: false,
        })
    }

    async fn with_deadline<F>(
        &self,
        operation: &'static str,
        progress: &AtomicUsize,
        fut: F,
    ) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        let Some(limit) = self.io_timeout else {
            return fut.await;
        };
        match tokio::time::timeout(limit, fut).await {
            Ok(res) => res,
            Err(_) => {
                let transferred = progress.load(Ordering::Relaxed);
                if transferred > 0 {
                    self.broken.store(true, Ordering::Release);
                }
                warn!(
                    "{} with peer {} exceeded {:?} after {} bytes",
                    operation,
                    self.remote_id(),
                    limit,
                    transferred
                );
                Err(Error::Timeout {
                    peer: self.remote_id(),
                    operation,
                    transferred,
                })
            }
        }
    }
}

/// Progress of one send or receive.
///
/// Dropped before `finish` once bytes have moved (deadline hit, or the
/// future abandoned by a join that failed elsewhere), it marks the channel
/// broken.
struct Transfer<'a> {
    peer: PartyId,
    broken: &'a AtomicBool,
    progress: &'a AtomicUsize,
    finished: bool,
}

impl Transfer<'_> {
    fn done(&self) -> usize {
        self.progress.load(Ordering::Relaxed)
    }

    fn advance(&self, n: usize) {
        self.progress.fetch_add(n, Ordering::Relaxed);
    }

    fn fail(&self, err: Error) -> Error {
        self.broken.store(true, Ordering::Release);
        err
    }

    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for Transfer<'_> {
    fn drop(&mut self) {
        if !self.finished && self.done() > 0 && !self.broken.swap(true, Ordering::AcqRel) {
            warn!(
                "transfer with peer {} abandoned after {} bytes, channel broken",
                self.peer,
                self.done()
            );
        }
    }
}

fn lost(peer: PartyId, expected: usize, transferred: usize) -> Error {
    Error::ConnectionLost {
        peer,
        expected,
        transferred,
    }
}

/// Map a stream error to `ConnectionLost` when the peer is gone.
fn classify(peer: PartyId, expected: usize, transferred: usize, err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::WriteZero => lost(peer, expected, transferred),
        _ => Error::Io { peer, source: err },
    }
}
