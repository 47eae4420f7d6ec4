//! Inbound ports (API) for the block stream publisher.

use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::{BlockItem, BlockNodeConfiguration, BlockState};
use crate::events::BlockStreamError;

/// Producer-facing block buffer API.
///
/// Called by the block producer while a block is being built.
pub trait BlockBufferApi: Send + Sync {
    /// Creates an empty open block and makes it current.
    fn open_block(&self, block_number: u64);

    /// Appends an item to an open block. No-op if the block is unknown,
    /// already released or closed; returns whether the item was appended.
    fn add_item(&self, block_number: u64, item: BlockItem) -> bool;

    /// Marks a block closed once its proof has been appended.
    fn close_block(&self, block_number: u64);

    fn get_block_state(&self, block_number: u64) -> Option<Arc<BlockState>>;

    fn earliest_available_block_number(&self) -> Option<u64>;

    fn highest_acked_block_number(&self) -> Option<u64>;

    fn last_block_number_produced(&self) -> Option<u64>;
}

/// Node-lifecycle API of the publisher.
#[async_trait]
pub trait PublisherControl: Send + Sync {
    /// Connects to the configured peers and starts streaming.
    fn start(&self) -> Result<(), BlockStreamError>;

    /// Stops all streaming and waits for open streams to close. Idempotent.
    async fn shutdown(&self);

    /// Re-reads the peer list; restarts streaming if it changed.
    async fn reload_configuration(&self) -> Result<bool, BlockStreamError>;

    /// Moves the active connection to `block_number`.
    fn jump_to_block(&self, block_number: u64);

    /// Block the active connection is streaming, if any.
    fn current_streaming_block_number(&self) -> Option<u64>;

    /// Peer currently publishing, if any.
    fn active_connection_peer(&self) -> Option<BlockNodeConfiguration>;
}
