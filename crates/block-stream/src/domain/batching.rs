//! # Request Batching
//!
//! Size accounting for packing block items into publish requests.
//!
//! Items are accumulated while the *estimated* request size (padding plus
//! item sizes) stays within the soft limit. Right before sending, the
//! *actual* encoded size is computed; if framing overhead pushed a
//! multi-item request over the soft limit, the last item is taken back and
//! carried into the next request.

use std::sync::Arc;

use super::{BlockItem, BlockNodeConfiguration};
use crate::events::PublishStreamRequest;

/// Byte budget for the requests sent to one peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestBudget {
    pub soft_limit_bytes: usize,
    pub hard_limit_bytes: usize,
    /// Base estimate of an empty request.
    pub request_padding_bytes: usize,
    /// Added to every item's size when estimating.
    pub item_padding_bytes: usize,
}

impl RequestBudget {
    pub fn new(soft_limit_bytes: usize, hard_limit_bytes: usize) -> Self {
        Self {
            soft_limit_bytes,
            hard_limit_bytes,
            request_padding_bytes: 0,
            item_padding_bytes: 0,
        }
    }

    pub fn for_node(
        node: &BlockNodeConfiguration,
        request_padding_bytes: usize,
        item_padding_bytes: usize,
    ) -> Self {
        Self {
            soft_limit_bytes: node.message_size_soft_limit_bytes,
            hard_limit_bytes: node.message_size_hard_limit_bytes,
            request_padding_bytes,
            item_padding_bytes,
        }
    }

    /// Estimated contribution of `item` to a request.
    pub fn estimate_item(&self, item: &BlockItem) -> usize {
        item.size() + self.item_padding_bytes
    }
}

/// Where the next item goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemPlacement {
    /// Add to the pending request.
    Append,
    /// Send the pending request first, then place the item again.
    FlushFirst,
    /// The item fills a request on its own.
    SendAlone,
    /// The item can never be sent.
    ExceedsHardLimit,
}

/// Decides how an item of estimated size `item_bytes` is placed.
pub fn place_item(
    pending_bytes: usize,
    pending_items: usize,
    item_bytes: usize,
    budget: &RequestBudget,
) -> ItemPlacement {
    if item_bytes > budget.hard_limit_bytes {
        ItemPlacement::ExceedsHardLimit
    } else if item_bytes >= budget.soft_limit_bytes {
        ItemPlacement::SendAlone
    } else if pending_items > 0 && pending_bytes + item_bytes > budget.soft_limit_bytes {
        ItemPlacement::FlushFirst
    } else {
        ItemPlacement::Append
    }
}

/// Verdict on a fully built request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeCheck {
    WithinLimits,
    /// Drop the last item and retry.
    TrimLast,
    ExceedsHardLimit,
}

/// Checks the actual encoded size of a request holding `item_count` items.
pub fn check_request_size(
    actual_bytes: usize,
    item_count: usize,
    budget: &RequestBudget,
) -> SizeCheck {
    if actual_bytes > budget.soft_limit_bytes && item_count > 1 {
        SizeCheck::TrimLast
    } else if actual_bytes > budget.hard_limit_bytes {
        SizeCheck::ExceedsHardLimit
    } else {
        SizeCheck::WithinLimits
    }
}

// =============================================================================
// PENDING REQUEST
// =============================================================================

/// Items accumulated for the next request of one block.
#[derive(Clone, Debug)]
pub struct PendingRequest {
    block_number: u64,
    items: Vec<Arc<BlockItem>>,
    estimated_bytes: usize,
    padding_bytes: usize,
}

impl PendingRequest {
    pub fn new(block_number: u64, budget: &RequestBudget) -> Self {
        Self {
            block_number,
            items: Vec::new(),
            estimated_bytes: budget.request_padding_bytes,
            padding_bytes: budget.request_padding_bytes,
        }
    }

    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    pub fn push(&mut self, item: Arc<BlockItem>, estimated_bytes: usize) {
        self.items.push(item);
        self.estimated_bytes += estimated_bytes;
    }

    /// Takes back the most recently pushed item.
    pub fn pop_last(&mut self, budget: &RequestBudget) -> Option<Arc<BlockItem>> {
        let item = self.items.pop()?;
        self.estimated_bytes = self
            .estimated_bytes
            .saturating_sub(budget.estimate_item(&item));
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn estimated_bytes(&self) -> usize {
        self.estimated_bytes
    }

    pub fn contains_proof(&self) -> bool {
        self.items.iter().any(|item| item.is_proof())
    }

    /// Builds the wire request without consuming the pending items.
    pub fn to_request(&self) -> PublishStreamRequest {
        PublishStreamRequest::BlockItems {
            block_number: self.block_number,
            items: self.items.clone(),
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.estimated_bytes = self.padding_bytes;
    }
}

// =============================================================================
// OFFLINE PLANNER
// =============================================================================

/// Item index that can never be sent under the budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OversizedItem {
    pub index: usize,
}

/// Splits a complete block into requests the way the connection worker
/// would, returning the item indices of each request in send order.
///
/// A PROOF item flushes the request it lands in.
pub fn plan_requests(
    block_number: u64,
    items: &[Arc<BlockItem>],
    budget: &RequestBudget,
) -> Result<Vec<Vec<usize>>, OversizedItem> {
    let mut planned = Vec::new();
    let mut pending = PendingRequest::new(block_number, budget);
    let mut pending_indices: Vec<usize> = Vec::new();
    let mut index = 0;

    while index < items.len() {
        let item = &items[index];
        let estimate = budget.estimate_item(item);
        match place_item(pending.estimated_bytes(), pending.len(), estimate, budget) {
            ItemPlacement::Append => {
                pending.push(Arc::clone(item), estimate);
                pending_indices.push(index);
                index += 1;
                if item.is_proof() {
                    flush(&mut pending, &mut pending_indices, &mut index, &mut planned, budget)?;
                }
            }
            ItemPlacement::FlushFirst => {
                flush(&mut pending, &mut pending_indices, &mut index, &mut planned, budget)?;
            }
            ItemPlacement::SendAlone => {
                if !pending.is_empty() {
                    flush(&mut pending, &mut pending_indices, &mut index, &mut planned, budget)?;
                    continue;
                }
                pending.push(Arc::clone(item), estimate);
                pending_indices.push(index);
                index += 1;
                flush(&mut pending, &mut pending_indices, &mut index, &mut planned, budget)?;
            }
            ItemPlacement::ExceedsHardLimit => return Err(OversizedItem { index }),
        }
    }

    flush(&mut pending, &mut pending_indices, &mut index, &mut planned, budget)?;
    Ok(planned)
}

fn flush(
    pending: &mut PendingRequest,
    pending_indices: &mut Vec<usize>,
    index: &mut usize,
    planned: &mut Vec<Vec<usize>>,
    budget: &RequestBudget,
) -> Result<(), OversizedItem> {
    loop {
        if pending.is_empty() {
            return Ok(());
        }
        let actual = pending.to_request().encoded_len();
        match check_request_size(actual, pending.len(), budget) {
            SizeCheck::TrimLast => {
                pending.pop_last(budget);
                pending_indices.pop();
                *index -= 1;
            }
            SizeCheck::ExceedsHardLimit => {
                return Err(OversizedItem {
                    index: pending_indices.first().copied().unwrap_or(*index),
                });
            }
            SizeCheck::WithinLimits => {
                planned.push(std::mem::take(pending_indices));
                pending.clear();
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BlockItemKind;
    use rand::Rng;

    fn items(sizes: &[usize]) -> Vec<Arc<BlockItem>> {
        sizes
            .iter()
            .map(|size| Arc::new(BlockItem::with_size(BlockItemKind::TransactionItem, *size)))
            .collect()
    }

    fn request_len(items: &[Arc<BlockItem>], indices: &[usize]) -> usize {
        PublishStreamRequest::BlockItems {
            block_number: 0,
            items: indices.iter().map(|i| Arc::clone(&items[*i])).collect(),
        }
        .encoded_len()
    }

    #[test]
    fn test_encoding_overhead_moves_third_item_to_next_request() {
        let block = items(&[2_095_148, 997, 997, 1_500]);
        let budget = RequestBudget::new(2_097_152, 6 * 1024 * 1024);

        let plan = plan_requests(1, &block, &budget).unwrap();

        assert_eq!(plan, vec![vec![0, 1], vec![2, 3]]);
    }

    #[test]
    fn test_place_item_decisions() {
        let budget = RequestBudget::new(1_000, 5_000);
        assert_eq!(place_item(0, 0, 5_001, &budget), ItemPlacement::ExceedsHardLimit);
        assert_eq!(place_item(0, 0, 1_000, &budget), ItemPlacement::SendAlone);
        assert_eq!(place_item(900, 3, 200, &budget), ItemPlacement::FlushFirst);
        assert_eq!(place_item(800, 3, 200, &budget), ItemPlacement::Append);
        // Padding alone never forces a flush of an empty request.
        assert_eq!(place_item(990, 0, 200, &budget), ItemPlacement::Append);
    }

    #[test]
    fn test_check_request_size() {
        let budget = RequestBudget::new(1_000, 5_000);
        assert_eq!(check_request_size(1_001, 2, &budget), SizeCheck::TrimLast);
        assert_eq!(check_request_size(1_001, 1, &budget), SizeCheck::WithinLimits);
        assert_eq!(check_request_size(5_001, 1, &budget), SizeCheck::ExceedsHardLimit);
        assert_eq!(check_request_size(999, 4, &budget), SizeCheck::WithinLimits);
    }

    #[test]
    fn test_item_over_hard_limit_is_rejected() {
        let block = items(&[100, 6_000, 100]);
        let budget = RequestBudget::new(1_000, 5_000);
        assert_eq!(plan_requests(1, &block, &budget), Err(OversizedItem { index: 1 }));
    }

    #[test]
    fn test_framing_overhead_past_hard_limit_is_rejected() {
        // Estimated exactly at the hard limit, but framing pushes it over.
        let block = items(&[5_000]);
        let budget = RequestBudget::new(1_000, 5_000);
        assert_eq!(plan_requests(1, &block, &budget), Err(OversizedItem { index: 0 }));
    }

    #[test]
    fn test_proof_flushes_request() {
        let block = vec![
            Arc::new(BlockItem::with_size(BlockItemKind::Header, 10)),
            Arc::new(BlockItem::with_size(BlockItemKind::Proof, 10)),
        ];
        let budget = RequestBudget::new(1_000, 5_000);
        assert_eq!(plan_requests(1, &block, &budget).unwrap(), vec![vec![0, 1]]);
    }

    #[test]
    fn test_pending_request_tracks_estimate() {
        let budget = RequestBudget {
            request_padding_bytes: 8,
            item_padding_bytes: 2,
            ..RequestBudget::new(1_000, 5_000)
        };
        let mut pending = PendingRequest::new(4, &budget);
        let item = Arc::new(BlockItem::with_size(BlockItemKind::StateChange, 10));

        pending.push(Arc::clone(&item), budget.estimate_item(&item));
        assert_eq!(pending.estimated_bytes(), 20);

        assert!(pending.pop_last(&budget).is_some());
        assert_eq!(pending.estimated_bytes(), 8);

        pending.push(item, 12);
        pending.clear();
        assert!(pending.is_empty());
        assert_eq!(pending.estimated_bytes(), 8);
    }

    #[test]
    fn test_random_blocks_respect_soft_limit() {
        let mut rng = rand::thread_rng();
        let budget = RequestBudget::new(4_096, 16_384);

        for _ in 0..300 {
            let count = rng.gen_range(1..40);
            let sizes: Vec<usize> = (0..count).map(|_| rng.gen_range(1..6_000)).collect();
            let block = items(&sizes);

            let plan = plan_requests(9, &block, &budget).unwrap();

            // Every item sent exactly once, in order.
            let flattened: Vec<usize> = plan.iter().flatten().copied().collect();
            assert_eq!(flattened, (0..count).collect::<Vec<_>>());

            for request in &plan {
                let len = request_len(&block, request);
                if request.len() > 1 {
                    assert!(len <= budget.soft_limit_bytes, "request {request:?} is {len} bytes");
                }
                assert!(len <= budget.hard_limit_bytes);
            }

            let all: Vec<usize> = (0..count).collect();
            if count > 1 && request_len(&block, &all) > budget.soft_limit_bytes {
                assert!(plan.len() >= 2);
            }
        }
    }
}
