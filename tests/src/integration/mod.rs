//! # Integration Flows
//!
//! Each flow wires a full publisher: buffer, connection manager and
//! acknowledgement tracker, over the in-memory transport.

mod batching;
mod failover;
mod quorum;

use std::sync::Arc;
use std::time::Duration;

use block_stream::adapters::{InMemoryTransport, NoopStreamMetrics, StaticConfigProvider};
use block_stream::events::PublishStreamRequest;
use block_stream::ports::outbound::{ConfigProvider, StreamMetrics};
use block_stream::{
    BlockBufferApi, BlockBufferService, BlockItem, BlockItemKind, BlockNodeConfiguration,
    BlockNodeConnectionConfig, BlockNodeConnectionManager,
};

// =============================================================================
// TEST FIXTURES
// =============================================================================

pub(crate) fn node(address: &str, priority: u32) -> BlockNodeConfiguration {
    BlockNodeConfiguration::new(address, 8080, priority)
}

/// A publisher wired against in-memory peers.
pub(crate) struct Publisher {
    pub manager: Arc<BlockNodeConnectionManager>,
    pub buffer: Arc<BlockBufferService>,
    pub transport: Arc<InMemoryTransport>,
}

impl Publisher {
    pub fn new(nodes: Vec<BlockNodeConfiguration>, config: BlockNodeConnectionConfig) -> Self {
        let provider = StaticConfigProvider::new(nodes).with_connection_config(config);
        Self::with_provider(Arc::new(provider), Arc::new(NoopStreamMetrics))
    }

    pub fn with_provider(
        provider: Arc<dyn ConfigProvider>,
        metrics: Arc<dyn StreamMetrics>,
    ) -> Self {
        let buffer = Arc::new(BlockBufferService::new(
            provider.buffer_config(),
            Arc::clone(&metrics),
        ));
        let transport = Arc::new(InMemoryTransport::new());
        let manager = BlockNodeConnectionManager::new(
            provider,
            Arc::clone(&buffer),
            transport.clone(),
            metrics,
        );
        Self {
            manager,
            buffer,
            transport,
        }
    }

    /// Builds a closed block of transaction items with the given sizes.
    pub fn produce(&self, block_number: u64, sizes: &[usize]) {
        self.buffer.open_block(block_number);
        for size in sizes {
            self.buffer.add_item(
                block_number,
                BlockItem::with_size(BlockItemKind::TransactionItem, *size),
            );
        }
        self.buffer
            .add_item(block_number, BlockItem::with_size(BlockItemKind::Proof, 16));
        self.buffer.close_block(block_number);
    }

    pub fn active_peer(&self) -> Option<BlockNodeConfiguration> {
        self.manager.active_connection_peer()
    }

    pub fn requests(&self, node: &BlockNodeConfiguration) -> Vec<PublishStreamRequest> {
        self.transport.requests(&node.node_id())
    }

    /// Blocks `node` finished receiving, in send order.
    pub fn completed_blocks(&self, node: &BlockNodeConfiguration) -> Vec<u64> {
        self.requests(node)
            .into_iter()
            .filter_map(|request| match request {
                PublishStreamRequest::EndOfBlock { block_number } => Some(block_number),
                _ => None,
            })
            .collect()
    }

    /// Item sizes `node` received for `block_number`, in send order.
    pub fn item_sizes(&self, node: &BlockNodeConfiguration, block_number: u64) -> Vec<usize> {
        self.requests(node)
            .into_iter()
            .filter_map(|request| match request {
                PublishStreamRequest::BlockItems {
                    block_number: block,
                    items,
                } if block == block_number => Some(items),
                _ => None,
            })
            .flatten()
            .map(|item| item.size())
            .collect()
    }
}

pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not met in time");
}
