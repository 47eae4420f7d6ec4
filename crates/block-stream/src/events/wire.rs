//! Wire messages exchanged with a Block Node over the publish stream.
//!
//! The transport owns the actual serialization. Sizes are computed here with
//! length-delimited framing (`tag + varint(len) + len` per field) so request
//! splitting can be decided before anything is handed to the transport.

use std::sync::Arc;

use crate::domain::BlockItem;

/// `lastVerifiedBlockNumber` value meaning "no block verified yet".
pub const NO_VERIFIED_BLOCK: u64 = u64::MAX;

/// Bytes needed to varint-encode `value`.
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// Size of one length-delimited field carrying `len` bytes.
pub fn delimited_field_len(len: usize) -> usize {
    1 + varint_len(len as u64) + len
}

/// Size of a varint field carrying `value`.
fn varint_field_len(value: u64) -> usize {
    1 + varint_len(value)
}

// =============================================================================
// OUTBOUND
// =============================================================================

/// Code carried by an outbound `EndStream`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EndStreamCode {
    /// Periodic or boundary reset; the publisher will reconnect.
    Reset,
    /// Publisher-side failure.
    Error,
    /// The peer needs a block that is no longer buffered.
    TooFarBehind,
    /// The peer acknowledges too slowly; the publisher switches away.
    Timeout,
}

impl EndStreamCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reset => "reset",
            Self::Error => "error",
            Self::TooFarBehind => "too_far_behind",
            Self::Timeout => "timeout",
        }
    }

    fn wire_value(&self) -> u64 {
        match self {
            Self::Reset => 1,
            Self::Timeout => 2,
            Self::Error => 3,
            Self::TooFarBehind => 4,
        }
    }
}

/// Requests sent from the publisher to a Block Node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishStreamRequest {
    /// A batch of items, all belonging to `block_number`.
    BlockItems {
        block_number: u64,
        items: Vec<Arc<BlockItem>>,
    },
    /// Marks that every item of `block_number` has been sent.
    EndOfBlock { block_number: u64 },
    /// Terminates the stream from the publisher side.
    EndStream {
        code: EndStreamCode,
        earliest_block_number: Option<u64>,
        latest_block_number: Option<u64>,
    },
}

impl PublishStreamRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BlockItems { .. } => "block_items",
            Self::EndOfBlock { .. } => "end_of_block",
            Self::EndStream { .. } => "end_stream",
        }
    }

    pub fn item_count(&self) -> usize {
        match self {
            Self::BlockItems { items, .. } => items.len(),
            _ => 0,
        }
    }

    pub fn contains_proof(&self) -> bool {
        match self {
            Self::BlockItems { items, .. } => items.iter().any(|item| item.is_proof()),
            _ => false,
        }
    }

    /// Actual encoded size of the request in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::BlockItems { items, .. } => {
                let item_set: usize = items
                    .iter()
                    .map(|item| delimited_field_len(item.size()))
                    .sum();
                delimited_field_len(item_set)
            }
            Self::EndOfBlock { block_number } => {
                delimited_field_len(varint_field_len(*block_number))
            }
            Self::EndStream {
                code,
                earliest_block_number,
                latest_block_number,
            } => {
                let body = varint_field_len(code.wire_value())
                    + earliest_block_number.map_or(0, varint_field_len)
                    + latest_block_number.map_or(0, varint_field_len);
                delimited_field_len(body)
            }
        }
    }
}

// =============================================================================
// INBOUND
// =============================================================================

/// Code carried by an inbound `EndOfStream`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EndOfStreamCode {
    Success,
    Error,
    PersistenceFailed,
    Timeout,
    DuplicateBlock,
    BadBlockProof,
    InvalidRequest,
    Behind,
    Unknown,
}

impl EndOfStreamCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::PersistenceFailed => "persistence_failed",
            Self::Timeout => "timeout",
            Self::DuplicateBlock => "duplicate_block",
            Self::BadBlockProof => "bad_block_proof",
            Self::InvalidRequest => "invalid_request",
            Self::Behind => "behind",
            Self::Unknown => "unknown",
        }
    }
}

/// Responses received from a Block Node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishStreamResponse {
    /// The peer has verified and persisted every block up to `block_number`.
    Acknowledgement { block_number: u64 },
    /// The peer already has `block_number`; stop sending it.
    SkipBlock { block_number: u64 },
    /// The peer wants `block_number` sent again from the start.
    ResendBlock { block_number: u64 },
    /// The peer lags; its last verified block is `block_number`.
    NodeBehindPublisher { block_number: u64 },
    /// The peer is ending the stream.
    EndOfStream {
        code: EndOfStreamCode,
        last_verified_block_number: u64,
    },
    /// No recognized response body.
    Unset,
}

impl PublishStreamResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Acknowledgement { .. } => "acknowledgement",
            Self::SkipBlock { .. } => "skip_block",
            Self::ResendBlock { .. } => "resend_block",
            Self::NodeBehindPublisher { .. } => "node_behind_publisher",
            Self::EndOfStream { .. } => "end_of_stream",
            Self::Unset => "unset",
        }
    }
}

/// Status reported by a Block Node's control service.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockNodeStatus {
    /// Latest block the peer has stored, if any.
    pub latest_block_available: Option<u64>,
}

impl BlockNodeStatus {
    /// Next block the peer wants to receive.
    pub fn wanted_block(&self) -> u64 {
        match self.latest_block_available {
            Some(NO_VERIFIED_BLOCK) | None => 0,
            Some(latest) => latest + 1,
        }
    }
}
