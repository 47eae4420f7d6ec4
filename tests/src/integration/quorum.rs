//! # Quorum Flows
//!
//! Acknowledgements from several peers release buffered blocks once a quorum
//! of them has verified each block.

use block_stream::events::PublishStreamResponse;
use block_stream::{BlockBufferApi, BlockNodeConfiguration, BlockNodeConnectionConfig};

use super::{node, wait_until, Publisher};

async fn acknowledge(publisher: &Publisher, peer: &BlockNodeConfiguration, block_number: u64) {
    publisher
        .transport
        .latest_stream(&peer.node_id())
        .unwrap()
        .respond(PublishStreamResponse::Acknowledgement { block_number })
        .await;
}

fn buffered(publisher: &Publisher) -> Vec<u64> {
    (1..=3)
        .filter(|block| publisher.buffer.get_block_state(*block).is_some())
        .collect()
}

#[tokio::test]
async fn test_quorum_of_two_out_of_three_peers() {
    let (a, b, c) = (node("node-a", 1), node("node-b", 2), node("node-c", 3));
    let config = BlockNodeConnectionConfig {
        quorum_threshold: 2,
        ..BlockNodeConnectionConfig::for_testing()
    };
    let publisher = Publisher::new(vec![a.clone(), b.clone(), c.clone()], config);
    for block in 1..=3 {
        publisher.produce(block, &[48]);
    }
    publisher.manager.start().unwrap();
    wait_until(|| publisher.manager.connections().len() == 3).await;
    wait_until(|| publisher.completed_blocks(&a) == vec![1, 2, 3]).await;

    acknowledge(&publisher, &a, 3).await;
    assert_eq!(buffered(&publisher), vec![1, 2, 3]);

    acknowledge(&publisher, &b, 1).await;
    assert_eq!(buffered(&publisher), vec![2, 3]);

    acknowledge(&publisher, &c, 2).await;
    assert_eq!(buffered(&publisher), vec![3]);
    assert_eq!(publisher.manager.ack_tracker().released_through(), Some(2));

    acknowledge(&publisher, &b, 3).await;
    assert!(buffered(&publisher).is_empty());
    assert_eq!(publisher.manager.ack_tracker().released_through(), Some(3));

    publisher.manager.shutdown().await;
}

#[tokio::test]
async fn test_repeated_and_stale_acknowledgements_release_nothing_new() {
    let a = node("node-a", 1);
    let publisher = Publisher::new(vec![a.clone()], BlockNodeConnectionConfig::for_testing());
    for block in 1..=3 {
        publisher.produce(block, &[48]);
    }
    publisher.manager.start().unwrap();
    wait_until(|| publisher.completed_blocks(&a) == vec![1, 2, 3]).await;

    acknowledge(&publisher, &a, 2).await;
    assert_eq!(buffered(&publisher), vec![3]);

    acknowledge(&publisher, &a, 2).await;
    acknowledge(&publisher, &a, 1).await;
    assert_eq!(buffered(&publisher), vec![3]);
    assert_eq!(publisher.manager.ack_tracker().released_through(), Some(2));
    assert_eq!(publisher.manager.ack_tracker().last_verified_block(&a.node_id()), Some(2));

    publisher.manager.shutdown().await;
}

#[tokio::test]
async fn test_blocks_stay_buffered_without_quorum() {
    let (a, b) = (node("node-a", 1), node("node-b", 2));
    let config = BlockNodeConnectionConfig {
        quorum_threshold: 3,
        ..BlockNodeConnectionConfig::for_testing()
    };
    let publisher = Publisher::new(vec![a.clone(), b.clone()], config);
    publisher.produce(1, &[48]);
    publisher.manager.start().unwrap();
    wait_until(|| publisher.manager.connections().len() == 2).await;
    wait_until(|| publisher.completed_blocks(&a) == vec![1]).await;

    acknowledge(&publisher, &a, 1).await;
    acknowledge(&publisher, &b, 1).await;

    assert_eq!(buffered(&publisher), vec![1]);
    assert!(publisher.manager.ack_tracker().released_through().is_none());

    publisher.manager.shutdown().await;
}
