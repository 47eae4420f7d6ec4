//! # Failover Flows
//!
//! Peer loss, recovery after every peer was down, and a configuration reload
//! read from `block-nodes.json`.

use std::sync::Arc;
use std::time::Duration;

use block_stream::adapters::{
    JsonFileConfigProvider, PrometheusStreamMetrics, BLOCK_NODES_FILE_NAME,
};
use block_stream::events::TransportError;
use block_stream::{BlockNodeConnectionConfig, PublisherControl};
use tempfile::TempDir;

use super::{node, wait_until, Publisher};

fn slow_retry_config() -> BlockNodeConnectionConfig {
    BlockNodeConnectionConfig {
        failure_reschedule_delay: Duration::from_secs(5),
        ..BlockNodeConnectionConfig::for_testing()
    }
}

#[tokio::test]
async fn test_each_block_is_streamed_once_across_two_failovers() {
    let (a, b, c) = (node("node-a", 1), node("node-b", 2), node("node-c", 3));
    let publisher = Publisher::new(
        vec![a.clone(), b.clone(), c.clone()],
        slow_retry_config(),
    );
    let control: Arc<dyn PublisherControl> = publisher.manager.clone();

    publisher.produce(1, &[64, 64]);
    control.start().unwrap();
    wait_until(|| publisher.manager.connections().len() == 3).await;
    wait_until(|| publisher.completed_blocks(&a) == vec![1]).await;

    publisher
        .transport
        .latest_stream(&a.node_id())
        .unwrap()
        .fail(TransportError::StreamClosed)
        .await;
    wait_until(|| control.active_connection_peer() == Some(b.clone())).await;
    assert_eq!(control.current_streaming_block_number(), Some(2));

    publisher.produce(2, &[64]);
    wait_until(|| publisher.completed_blocks(&b) == vec![2]).await;

    publisher
        .transport
        .latest_stream(&b.node_id())
        .unwrap()
        .fail(TransportError::StreamClosed)
        .await;
    wait_until(|| control.active_connection_peer() == Some(c.clone())).await;

    publisher.produce(3, &[64]);
    wait_until(|| publisher.completed_blocks(&c) == vec![3]).await;

    assert_eq!(publisher.completed_blocks(&a), vec![1]);
    assert_eq!(publisher.completed_blocks(&b), vec![2]);
    assert_eq!(publisher.item_sizes(&c, 3), vec![64, 16]);

    control.shutdown().await;
    assert!(control.active_connection_peer().is_none());
}

#[tokio::test]
async fn test_publisher_recovers_after_every_peer_refused() {
    let (a, b) = (node("node-a", 1), node("node-b", 2));
    let publisher = Publisher::new(
        vec![a.clone(), b.clone()],
        BlockNodeConnectionConfig::for_testing(),
    );
    publisher.transport.set_open_failure(&a.node_id(), true);
    publisher.transport.set_open_failure(&b.node_id(), true);
    publisher.produce(1, &[32]);

    publisher.manager.start().unwrap();
    wait_until(|| publisher.transport.open_attempts(&b.node_id()) >= 2).await;
    assert!(publisher.active_peer().is_none());

    publisher.transport.set_open_failure(&b.node_id(), false);

    wait_until(|| publisher.active_peer() == Some(b.clone())).await;
    wait_until(|| publisher.completed_blocks(&b) == vec![1]).await;
    assert!(publisher.transport.requests(&a.node_id()).is_empty());

    publisher.manager.shutdown().await;
}

#[tokio::test]
async fn test_reload_from_file_moves_streaming_to_new_peer() {
    let dir = TempDir::new().unwrap();
    let write = |address: &str| {
        let contents = format!(
            r#"{{
                "nodes": [ {{ "address": "{address}", "streamingPort": 8080, "priority": 1 }} ],
                "connection": {{
                    "connectionTimeoutMs": 200,
                    "pipelineOperationTimeoutMs": 200,
                    "workerLoopSleepMs": 1,
                    "maxRequestDelayMs": 20,
                    "maxBackoffDelayMs": 100
                }}
            }}"#
        );
        std::fs::write(dir.path().join(BLOCK_NODES_FILE_NAME), contents).unwrap();
    };
    write("node-a");

    stream_telemetry::register_metrics().unwrap();
    let provider = Arc::new(JsonFileConfigProvider::load(dir.path()).unwrap());
    let publisher =
        Publisher::with_provider(provider.clone(), Arc::new(PrometheusStreamMetrics::new()));
    let (a, b) = (node("node-a", 1), node("node-b", 1));

    publisher.produce(1, &[32]);
    publisher.manager.start().unwrap();
    wait_until(|| publisher.completed_blocks(&a) == vec![1]).await;

    write("node-b");
    assert!(provider.reload().unwrap());
    assert!(publisher.manager.reload_configuration().await.unwrap());

    wait_until(|| publisher.active_peer() == Some(b.clone())).await;
    assert!(publisher.manager.connection(&a).is_none());
    let old_stream = publisher.transport.latest_stream(&a.node_id()).unwrap();
    assert_eq!(old_stream.close_calls(), 1);

    let exposition = stream_telemetry::encode_metrics().unwrap();
    assert!(exposition.contains("bs_connections_opened_total"));

    publisher.manager.shutdown().await;
}
