//! # Block Stream Publisher
//!
//! Streams produced blocks to remote Block Node peers over bidirectional
//! publish streams, keeps one peer publishing at a time, and frees buffered
//! blocks once a quorum of peers has verified them.
//!
//! ## Architecture Role
//!
//! ```text
//! [Block Producer] ──open/add/close──→ [BlockBufferService]
//!                                             │ read
//!                                             ↓
//!                     [BlockNodeConnectionManager] ──selects──→ [BlockNodeConnection] (ACTIVE)
//!                              │        ↑                            │  BlockItems / EndOfBlock
//!                              │        └──failover / reschedule─────┤
//!                              │                                     ↓
//!                              │                               [Block Node peer]
//!                              │                                     │  Acknowledgement
//!                              ↓                                     ↓
//!                     [AcknowledgementTracker] ──quorum──→ BlockBufferService::clean_up_block_state
//! ```
//!
//! ## Guarantees
//!
//! - Items of a block are sent in append order, never duplicated within one
//!   connection's active lifetime
//! - No request exceeds the peer's hard size limit
//! - At most one connection is `ACTIVE`
//! - Each block is released from the buffer at most once, only after quorum

pub mod adapters;
pub mod domain;
pub mod events;
pub mod ports;
pub mod service;

pub use domain::*;
pub use events::{BlockStreamError, ConfigError, TransportError};
pub use ports::inbound::{BlockBufferApi, PublisherControl};
pub use service::{
    AcknowledgementTracker, BlockBufferService, BlockNodeConnection, BlockNodeConnectionManager,
};
