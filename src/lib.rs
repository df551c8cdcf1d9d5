//! Group Communication for N-Party Protocols
//!
//! This library connects a fixed group of `n` parties with a full-duplex TCP
//! channel between every pair (and a loopback channel from each party to
//! itself), then offers the collective operations prototypes of multi-party
//! protocols keep needing.
//!
//! ## Overview
//!
//! Each process only knows its own party id and the ordered list of party
//! addresses. Listen/connect roles and ports are derived from the ids, so
//! all processes agree on them without talking first.
//!
//! ## Key Components
//!
//! - **Config**: the group descriptor (local id + addresses) and network settings
//! - **Channel**: loopback and socket byte streams to a single party
//! - **Bootstrap**: role assignment, port derivation and connect retry
//! - **Network**: point-to-point send/receive, all-to-all, broadcast and ring exchange
//!
//! Bytes are moved verbatim; framing and serialization are left to the caller.
//!
//! ## Example
//!
//! ```rust,no_run
//! use groupcomm::{ExchangeOrder, GroupDescriptor, Network, NetworkConfig};
//!
//! # async fn run(party_id: usize) -> groupcomm::Result<()> {
//! let group = GroupDescriptor::from_file(party_id, "network.txt")?;
//! let mut network = Network::new(group, NetworkConfig::default())?;
//! network.connect().await?;
//!
//! // every party passes its id to the previous party on the ring
//! let sbuf = vec![network.local_id() as u8; 10];
//! let rbuf = network
//!     .exchange_ring(&sbuf, sbuf.len(), ExchangeOrder::Decreasing)
//!     .await?;
//! assert_eq!(rbuf, vec![network.next_id() as u8; 10]);
//!
//! network.close().await;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod channel;
pub mod config;
pub mod error;
pub mod network;

pub use channel::{Channel, ChannelEndpointInfo, ChannelRole, ChannelStats};
pub use config::{GroupDescriptor, NetworkConfig, PartyId, RetryPolicy};
pub use error::{Error, Result};
pub use network::{ExchangeOrder, Network, NetworkState};
