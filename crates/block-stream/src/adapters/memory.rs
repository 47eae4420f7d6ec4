//! In-process transport.
//!
//! Records every request a connection sends and lets the caller inject peer
//! responses, stream failures and slow or failing operations. Used by the
//! unit and integration tests in place of a network transport.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

use crate::domain::BlockNodeConfiguration;
use crate::events::{BlockNodeStatus, PublishStreamRequest, PublishStreamResponse, TransportError};
use crate::ports::outbound::{RequestPipeline, StreamObserver, StreamTransport};

/// Fault switches of one peer. Read on every operation.
#[derive(Debug, Default)]
struct PeerFaults {
    fail_open: AtomicBool,
    hang_open: AtomicBool,
    fail_sends: AtomicBool,
    hang_sends: AtomicBool,
}

#[derive(Default)]
struct PeerEndpoint {
    faults: Arc<PeerFaults>,
    streams: Vec<Arc<InMemoryStream>>,
    status: Option<Result<BlockNodeStatus, TransportError>>,
    open_attempts: usize,
}

/// Transport whose peers live in memory, keyed by node id (`address:port`).
#[derive(Default)]
pub struct InMemoryTransport {
    peers: Mutex<HashMap<String, PeerEndpoint>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_peer<R>(&self, node_id: &str, f: impl FnOnce(&mut PeerEndpoint) -> R) -> R {
        let mut peers = self.peers.lock();
        f(peers.entry(node_id.to_string()).or_default())
    }

    /// Opening a stream to `node_id` fails while set.
    pub fn set_open_failure(&self, node_id: &str, fail: bool) {
        self.with_peer(node_id, |peer| peer.faults.fail_open.store(fail, Ordering::SeqCst));
    }

    /// Opening a stream to `node_id` never completes while set.
    pub fn set_hang_open(&self, node_id: &str, hang: bool) {
        self.with_peer(node_id, |peer| peer.faults.hang_open.store(hang, Ordering::SeqCst));
    }

    /// Sends to `node_id` fail while set.
    pub fn set_send_failure(&self, node_id: &str, fail: bool) {
        self.with_peer(node_id, |peer| peer.faults.fail_sends.store(fail, Ordering::SeqCst));
    }

    /// Sends to `node_id` never complete while set.
    pub fn set_hang_sends(&self, node_id: &str, hang: bool) {
        self.with_peer(node_id, |peer| peer.faults.hang_sends.store(hang, Ordering::SeqCst));
    }

    /// Status reported by the peer's control service.
    pub fn set_status(&self, node_id: &str, status: BlockNodeStatus) {
        self.with_peer(node_id, |peer| peer.status = Some(Ok(status)));
    }

    pub fn set_status_failure(&self, node_id: &str, reason: &str) {
        let error = TransportError::Status(reason.to_string());
        self.with_peer(node_id, |peer| peer.status = Some(Err(error)));
    }

    pub fn open_attempts(&self, node_id: &str) -> usize {
        self.with_peer(node_id, |peer| peer.open_attempts)
    }

    /// Streams successfully opened to `node_id`.
    pub fn open_count(&self, node_id: &str) -> usize {
        self.with_peer(node_id, |peer| peer.streams.len())
    }

    pub fn streams(&self, node_id: &str) -> Vec<Arc<InMemoryStream>> {
        self.with_peer(node_id, |peer| peer.streams.clone())
    }

    pub fn latest_stream(&self, node_id: &str) -> Option<Arc<InMemoryStream>> {
        self.with_peer(node_id, |peer| peer.streams.last().cloned())
    }

    /// Every request sent to `node_id`, across all of its streams.
    pub fn requests(&self, node_id: &str) -> Vec<PublishStreamRequest> {
        self.streams(node_id)
            .iter()
            .flat_map(|stream| stream.requests())
            .collect()
    }
}

#[async_trait]
impl StreamTransport for InMemoryTransport {
    async fn open(
        &self,
        node: &BlockNodeConfiguration,
        observer: Arc<dyn StreamObserver>,
    ) -> Result<Arc<dyn RequestPipeline>, TransportError> {
        let node_id = node.node_id();
        let faults = self.with_peer(&node_id, |peer| {
            peer.open_attempts += 1;
            Arc::clone(&peer.faults)
        });

        if faults.hang_open.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if faults.fail_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(format!(
                "{node_id} refused the connection"
            )));
        }

        let stream = Arc::new(InMemoryStream {
            node_id: node_id.clone(),
            observer: Arc::downgrade(&observer),
            faults,
            requests: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
        });
        self.with_peer(&node_id, |peer| peer.streams.push(Arc::clone(&stream)));
        trace!(node = %node_id, "In-memory stream opened");
        Ok(stream)
    }

    async fn query_status(
        &self,
        node: &BlockNodeConfiguration,
    ) -> Result<Option<BlockNodeStatus>, TransportError> {
        self.with_peer(&node.node_id(), |peer| peer.status.clone())
            .transpose()
    }
}

/// One in-memory publish stream.
pub struct InMemoryStream {
    node_id: String,
    observer: Weak<dyn StreamObserver>,
    faults: Arc<PeerFaults>,
    requests: Mutex<Vec<PublishStreamRequest>>,
    close_calls: AtomicUsize,
}

impl InMemoryStream {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn requests(&self) -> Vec<PublishStreamRequest> {
        self.requests.lock().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.close_calls() > 0
    }

    /// Delivers a response as if the peer had sent it.
    pub async fn respond(&self, response: PublishStreamResponse) {
        if let Some(observer) = self.observer.upgrade() {
            observer.on_next(response).await;
        }
    }

    /// Fails the stream from the peer side.
    pub async fn fail(&self, error: TransportError) {
        if let Some(observer) = self.observer.upgrade() {
            observer.on_error(error).await;
        }
    }

    /// Completes the stream from the peer side.
    pub async fn complete(&self) {
        if let Some(observer) = self.observer.upgrade() {
            observer.on_completed().await;
        }
    }
}

#[async_trait]
impl RequestPipeline for InMemoryStream {
    async fn send(&self, request: PublishStreamRequest) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::StreamClosed);
        }
        if self.faults.hang_sends.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.faults.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed(format!(
                "{} dropped the request",
                self.node_id
            )));
        }
        self.requests.lock().push(request);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingObserver {
        responses: Mutex<Vec<PublishStreamResponse>>,
        completed: AtomicBool,
    }

    #[async_trait]
    impl StreamObserver for RecordingObserver {
        async fn on_next(&self, response: PublishStreamResponse) {
            self.responses.lock().push(response);
        }

        async fn on_error(&self, _error: TransportError) {}

        async fn on_completed(&self) {
            self.completed.store(true, Ordering::SeqCst);
        }
    }

    fn node() -> BlockNodeConfiguration {
        BlockNodeConfiguration::new("peer-a", 9000, 1)
    }

    #[tokio::test]
    async fn test_records_requests_and_delivers_responses() {
        let transport = InMemoryTransport::new();
        let observer = Arc::new(RecordingObserver::default());

        let pipeline = transport.open(&node(), observer.clone()).await.unwrap();
        pipeline
            .send(PublishStreamRequest::EndOfBlock { block_number: 4 })
            .await
            .unwrap();

        let stream = transport.latest_stream("peer-a:9000").unwrap();
        stream
            .respond(PublishStreamResponse::Acknowledgement { block_number: 4 })
            .await;
        stream.complete().await;

        assert_eq!(
            transport.requests("peer-a:9000"),
            vec![PublishStreamRequest::EndOfBlock { block_number: 4 }]
        );
        assert_eq!(observer.responses.lock().len(), 1);
        assert!(observer.completed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_open_failure() {
        let transport = InMemoryTransport::new();
        transport.set_open_failure("peer-a:9000", true);

        let result = transport
            .open(&node(), Arc::new(RecordingObserver::default()))
            .await;

        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
        assert_eq!(transport.open_attempts("peer-a:9000"), 1);
        assert_eq!(transport.open_count("peer-a:9000"), 0);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let transport = InMemoryTransport::new();
        let pipeline = transport
            .open(&node(), Arc::new(RecordingObserver::default()))
            .await
            .unwrap();

        pipeline.close().await.unwrap();
        let result = pipeline
            .send(PublishStreamRequest::EndOfBlock { block_number: 1 })
            .await;

        assert_eq!(result, Err(TransportError::StreamClosed));
    }

    #[tokio::test]
    async fn test_status_defaults_to_unknown() {
        let transport = InMemoryTransport::new();
        assert_eq!(transport.query_status(&node()).await, Ok(None));

        transport.set_status(
            "peer-a:9000",
            BlockNodeStatus {
                latest_block_available: Some(9),
            },
        );
        let status = transport.query_status(&node()).await.unwrap().unwrap();
        assert_eq!(status.wanted_block(), 10);
    }
}
