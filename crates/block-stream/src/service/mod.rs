//! # Service Layer
//!
//! - **buffer**: `BlockBufferService`, the shared block store
//! - **connection**: `BlockNodeConnection`, one publish stream and its worker
//! - **manager**: `BlockNodeConnectionManager`, selection and failover
//! - **ack_tracker**: `AcknowledgementTracker`, quorum-based block release
//! - **task_runner**: `PipelineTaskRunner`, timeout-guarded pipeline calls

mod ack_tracker;
mod buffer;
mod connection;
mod manager;
mod task_runner;

pub use ack_tracker::AcknowledgementTracker;
pub use buffer::BlockBufferService;
pub use connection::{BlockNodeConnection, ConnectionContext};
pub use manager::BlockNodeConnectionManager;
pub use task_runner::PipelineTaskRunner;
