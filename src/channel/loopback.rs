use std::sync::Mutex;

use super::{ChannelEndpointInfo, ChannelStats, TrafficCounters};
use crate::config::PartyId;
use crate::error::{Error, Result};

/// In-process channel from a party to itself.
///
/// The channel is a one-slot mailbox: `send` overwrites whatever is stored
/// and `recv` returns the stored value without clearing it. Two sends
/// without a receive in between lose the first buffer.
#[derive(Debug)]
pub struct LoopbackChannel {
    info: ChannelEndpointInfo,
    alive: bool,
    slot: Mutex<Option<Vec<u8>>>,
    counters: TrafficCounters,
}

impl LoopbackChannel {
    pub fn new(id: PartyId) -> Self {
        Self {
            info: ChannelEndpointInfo::loopback(id),
            alive: false,
            slot: Mutex::new(None),
            counters: TrafficCounters::default(),
        }
    }

    pub fn info(&self) -> &ChannelEndpointInfo {
        &self.info
    }

    pub fn connect(&mut self) {
        self.alive = true;
    }

    pub fn close(&mut self) {
        self.alive = false;
        *self.slot.get_mut().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn send(&self, buf: &[u8]) -> Result<()> {
        self.ensure_alive()?;
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(buf.to_vec());
        self.counters.record_sent(buf.len());
        Ok(())
    }

    /// Return the stored buffer, cut down to `len` bytes.
    pub fn recv(&self, len: usize) -> Result<Vec<u8>> {
        self.ensure_alive()?;
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        let stored = slot.as_ref().ok_or_else(|| {
            Error::Misuse(format!(
                "loopback receive on party {} before any send",
                self.info.local_id
            ))
        })?;
        if stored.len() < len {
            return Err(Error::Misuse(format!(
                "loopback receive of {} bytes but only {} were sent",
                len,
                stored.len()
            )));
        }
        self.counters.record_recv(len);
        Ok(stored[..len].to_vec())
    }

    pub fn stats(&self) -> ChannelStats {
        self.counters.snapshot()
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.alive {
            Ok(())
        } else {
            Err(Error::Misuse(format!(
                "loopback channel of party {} is not connected",
                self.info.local_id
            )))
        }
    }
}
