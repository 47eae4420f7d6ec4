//! # Core Domain Entities
//!
//! Defines the fundamental data structures for block streaming.
//!
//! ## Entities
//!
//! - [`BlockItem`]: Immutable, opaque payload unit with a semantic kind
//! - [`BlockState`]: Append-only item buffer for one block plus lifecycle flags
//! - [`BlockNodeConfiguration`]: Identity, priority and size limits of a remote Block Node

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::events::ConfigError;

/// Default soft limit for a single request (2 MiB).
pub const DEFAULT_MESSAGE_SIZE_SOFT_LIMIT_BYTES: usize = 2 * 1024 * 1024;

/// Default hard limit for a single request (6 MiB).
pub const DEFAULT_MESSAGE_SIZE_HARD_LIMIT_BYTES: usize = 6 * 1024 * 1024;

// =============================================================================
// BLOCK ITEMS
// =============================================================================

/// Semantic tag of a block item.
///
/// The payload itself is opaque; the kind only drives control flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockItemKind {
    /// First item of every block.
    Header,
    /// Transaction data.
    TransactionItem,
    /// State change produced while executing the block.
    StateChange,
    /// Block proof. Always the last item of a block.
    Proof,
}

impl BlockItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::TransactionItem => "transaction_item",
            Self::StateChange => "state_change",
            Self::Proof => "proof",
        }
    }
}

/// One opaque, independently sized payload unit of a block.
///
/// Cloning is cheap: the payload is shared.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockItem {
    kind: BlockItemKind,
    payload: Arc<[u8]>,
}

impl BlockItem {
    pub fn new(kind: BlockItemKind, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            payload: Arc::from(payload.into()),
        }
    }

    /// Creates an item with a zero-filled payload of `size` bytes.
    pub fn with_size(kind: BlockItemKind, size: usize) -> Self {
        Self::new(kind, vec![0u8; size])
    }

    pub fn kind(&self) -> BlockItemKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Encoded size of the item in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn is_header(&self) -> bool {
        self.kind == BlockItemKind::Header
    }

    pub fn is_proof(&self) -> bool {
        self.kind == BlockItemKind::Proof
    }
}

// =============================================================================
// BLOCK STATE
// =============================================================================

/// Mutable, append-only buffer for the items of one block.
///
/// Readers (connection workers) index into the item list while the producer
/// keeps appending; an index that was valid once stays valid and always yields
/// the same item.
#[derive(Debug)]
pub struct BlockState {
    block_number: u64,
    items: RwLock<Vec<Arc<BlockItem>>>,
    closed: AtomicBool,
    opened_at: Instant,
    closed_at: Mutex<Option<Instant>>,
}

impl BlockState {
    pub fn new(block_number: u64) -> Self {
        Self {
            block_number,
            items: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
            opened_at: Instant::now(),
            closed_at: Mutex::new(None),
        }
    }

    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    /// Appends an item. Returns `false` if the block is already closed.
    pub fn add_item(&self, item: BlockItem) -> bool {
        let mut items = self.items.write();
        // Checked under the write lock so an append cannot race a close.
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        items.push(Arc::new(item));
        true
    }

    /// Item at `index`, if it has been appended yet.
    pub fn item(&self, index: usize) -> Option<Arc<BlockItem>> {
        self.items.read().get(index).cloned()
    }

    pub fn item_count(&self) -> usize {
        self.items.read().len()
    }

    /// Snapshot of all items in append order.
    pub fn items(&self) -> Vec<Arc<BlockItem>> {
        self.items.read().clone()
    }

    /// Marks the block closed. Idempotent.
    pub fn close(&self) {
        let _items = self.items.write();
        if !self.closed.swap(true, Ordering::AcqRel) {
            *self.closed_at.lock() = Some(Instant::now());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// True once the proof item has been appended.
    pub fn has_proof(&self) -> bool {
        self.items.read().iter().any(|item| item.is_proof())
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn closed_at(&self) -> Option<Instant> {
        *self.closed_at.lock()
    }
}

// =============================================================================
// BLOCK NODE CONFIGURATION
// =============================================================================

/// Identity and limits of one remote Block Node.
///
/// Two configurations are the same peer if every field matches, so a changed
/// limit or priority in the config file yields a new peer identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockNodeConfiguration {
    /// Host name or IP address.
    pub address: String,
    /// Port of the block streaming service.
    pub streaming_port: u16,
    /// Port of the control/status service.
    #[serde(default)]
    pub service_port: u16,
    /// Lower value = preferred.
    #[serde(default)]
    pub priority: u32,
    /// Target request size; exceeding it triggers request splitting.
    #[serde(default = "default_soft_limit")]
    pub message_size_soft_limit_bytes: usize,
    /// Absolute request cap; an item above it can never be sent.
    #[serde(default = "default_hard_limit")]
    pub message_size_hard_limit_bytes: usize,
}

fn default_soft_limit() -> usize {
    DEFAULT_MESSAGE_SIZE_SOFT_LIMIT_BYTES
}

fn default_hard_limit() -> usize {
    DEFAULT_MESSAGE_SIZE_HARD_LIMIT_BYTES
}

impl BlockNodeConfiguration {
    /// Creates a configuration with default size limits. The control port
    /// defaults to the streaming port.
    #[must_use]
    pub fn new(address: impl Into<String>, streaming_port: u16, priority: u32) -> Self {
        Self {
            address: address.into(),
            streaming_port,
            service_port: streaming_port,
            priority,
            message_size_soft_limit_bytes: DEFAULT_MESSAGE_SIZE_SOFT_LIMIT_BYTES,
            message_size_hard_limit_bytes: DEFAULT_MESSAGE_SIZE_HARD_LIMIT_BYTES,
        }
    }

    #[must_use]
    pub fn with_service_port(mut self, port: u16) -> Self {
        self.service_port = port;
        self
    }

    #[must_use]
    pub fn with_size_limits(mut self, soft_limit_bytes: usize, hard_limit_bytes: usize) -> Self {
        self.message_size_soft_limit_bytes = soft_limit_bytes;
        self.message_size_hard_limit_bytes = hard_limit_bytes;
        self
    }

    /// Fills in fields that config files may omit.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.service_port == 0 {
            self.service_port = self.streaming_port;
        }
        self
    }

    /// Stable textual key of this peer (`address:streaming_port`).
    pub fn node_id(&self) -> String {
        format!("{}:{}", self.address, self.streaming_port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::Invalid("block node address is empty".into()));
        }
        if self.streaming_port == 0 {
            return Err(ConfigError::Invalid(format!(
                "{}: streaming port must be non-zero",
                self.address
            )));
        }
        if self.service_port == 0 {
            return Err(ConfigError::Invalid(format!(
                "{}: service port must be non-zero",
                self.address
            )));
        }
        if self.message_size_soft_limit_bytes == 0 || self.message_size_hard_limit_bytes == 0 {
            return Err(ConfigError::Invalid(format!(
                "{}: message size limits must be positive",
                self.node_id()
            )));
        }
        if self.message_size_soft_limit_bytes > self.message_size_hard_limit_bytes {
            return Err(ConfigError::Invalid(format!(
                "{}: soft limit {} exceeds hard limit {}",
                self.node_id(),
                self.message_size_soft_limit_bytes,
                self.message_size_hard_limit_bytes
            )));
        }
        Ok(())
    }
}

impl fmt::Display for BlockNodeConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} (priority={})",
            self.address, self.streaming_port, self.priority
        )
    }
}

/// Normalizes and validates a peer list. Duplicate `address:port` pairs are
/// rejected.
pub fn validate_block_nodes(
    nodes: Vec<BlockNodeConfiguration>,
) -> Result<Vec<BlockNodeConfiguration>, ConfigError> {
    let mut seen = HashSet::new();
    let mut normalized = Vec::with_capacity(nodes.len());
    for node in nodes {
        let node = node.normalized();
        node.validate()?;
        if !seen.insert(node.node_id()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate block node {}",
                node.node_id()
            )));
        }
        normalized.push(node);
    }
    Ok(normalized)
}
