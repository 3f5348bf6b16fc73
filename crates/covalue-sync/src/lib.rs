//! # CoValue Sync
//!
//! Peer-to-peer replication of CoValue logs.
//!
//! ## Overview
//!
//! Four symmetric messages (`load`, `known`, `content`, `done`) move log
//! diffs between peers. Every peer tracks what the others have, sends only
//! what they lack, and answers content that does not continue its own log
//! with a correction instead of applying it.
//!
//! ## Key Types
//!
//! - [`SyncManager`]: the sans-IO message handler over a `CoValueRegistry`
//! - [`PeerState`]: per-peer known states and outgoing priority lanes
//! - [`SyncDriver`]: runs a manager over a [`Transport`] on tokio
//! - [`SyncMessage`]: the wire messages, encoded with [`encode_message`]
//!
//! ## Usage
//!
//! ```rust,no_run
//! use covalue_core::PeerId;
//! use covalue_sync::{PeerRole, SyncDriver, SyncManager, MemoryNetwork};
//!
//! async fn example() {
//!     let network = MemoryNetwork::new();
//!     let transport = network.create_transport(PeerId::from("me")).await;
//!     let mut driver = SyncDriver::new(transport, SyncManager::default());
//!     driver.connect(PeerId::from("server"), PeerRole::Server, true).await;
//!     // driver.turn().await?;
//! }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Loader                          Holder
//!   |-------- load(known) --------->|
//!   |<------- known ----------------|
//!   |<------- content --------------|
//!   |-------- known(ack) ---------->|
//! ```
//!
//! ## Design Notes
//!
//! - **Sans-IO core**: the manager never awaits; the driver owns all I/O.
//! - **Optimistic state is a cache**: what we assume a peer has only picks
//!   the next diff. A correction throws it away.
//! - **Bounded retries**: a silent peer gets `RetryConfig::max_attempts`
//!   loads with growing delays before it counts as unavailable.

pub mod codec;
pub mod config;
pub mod driver;
pub mod error;
pub mod manager;
pub mod messages;
pub mod peer;
pub mod selection;
pub mod transport;

pub use codec::{decode_message, encode_message};
pub use config::{RetryConfig, SyncConfig};
pub use driver::{SyncDriver, TurnReport};
pub use error::{Result, SyncError};
pub use manager::{SyncManager, SyncStats};
pub use messages::{limits, DoneMessage, KnownMessage, LoadMessage, SyncMessage};
pub use peer::{PeerRole, PeerState};
pub use selection::{peer_weight, select_peers};
pub use transport::{memory::MemoryNetwork, memory::MemoryTransport, Transport};
