//! # Batching Flows
//!
//! Request sizing as observed by a peer on a live stream.

use block_stream::events::PublishStreamRequest;
use block_stream::{BlockBufferApi, BlockItem, BlockItemKind, BlockNodeConnectionConfig};

use super::{node, wait_until, Publisher};

#[tokio::test]
async fn test_requests_respect_limits_and_keep_item_order() {
    let limited = node("node-a", 1).with_size_limits(1_000, 4_000);
    let publisher = Publisher::new(
        vec![limited.clone()],
        BlockNodeConnectionConfig::for_testing(),
    );
    let sizes = [300, 310, 320, 330, 340, 2_000, 350];
    publisher.produce(1, &sizes);

    publisher.manager.start().unwrap();
    wait_until(|| publisher.completed_blocks(&limited) == vec![1]).await;

    let requests = publisher.requests(&limited);
    let batches: Vec<_> = requests
        .iter()
        .filter(|request| matches!(request, PublishStreamRequest::BlockItems { .. }))
        .collect();
    assert!(batches.len() >= 4);
    for request in &batches {
        assert!(request.encoded_len() <= 4_000);
        if request.item_count() > 1 {
            assert!(request.encoded_len() <= 1_000);
        }
    }
    let oversized = batches
        .iter()
        .find(|request| match request {
            PublishStreamRequest::BlockItems { items, .. } => {
                items.iter().any(|item| item.size() == 2_000)
            }
            _ => false,
        })
        .unwrap();
    assert_eq!(oversized.item_count(), 1);

    let mut expected = sizes.to_vec();
    expected.push(16);
    assert_eq!(publisher.item_sizes(&limited, 1), expected);
    assert!(matches!(
        requests.last(),
        Some(PublishStreamRequest::EndOfBlock { block_number: 1 })
    ));

    publisher.manager.shutdown().await;
}

#[tokio::test]
async fn test_open_block_is_streamed_as_items_arrive() {
    let a = node("node-a", 1);
    let publisher = Publisher::new(vec![a.clone()], BlockNodeConnectionConfig::for_testing());
    publisher.buffer.open_block(1);
    publisher
        .buffer
        .add_item(1, BlockItem::with_size(BlockItemKind::TransactionItem, 40));
    publisher
        .buffer
        .add_item(1, BlockItem::with_size(BlockItemKind::TransactionItem, 50));

    publisher.manager.start().unwrap();
    wait_until(|| publisher.item_sizes(&a, 1) == vec![40, 50]).await;
    assert!(publisher.completed_blocks(&a).is_empty());

    publisher
        .buffer
        .add_item(1, BlockItem::with_size(BlockItemKind::Proof, 16));
    publisher.buffer.close_block(1);

    wait_until(|| publisher.completed_blocks(&a) == vec![1]).await;
    assert_eq!(publisher.item_sizes(&a, 1), vec![40, 50, 16]);

    publisher.manager.shutdown().await;
}
