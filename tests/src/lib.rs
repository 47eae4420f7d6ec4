//! # Block Stream Test Suite
//!
//! End-to-end flows through `BlockNodeConnectionManager` with the in-memory
//! transport standing in for Block Node peers.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── batching.rs   # Request sizing over a live stream
//!     ├── failover.rs   # Peer loss, preemption, reload from file
//!     └── quorum.rs     # Multi-peer acknowledgements and buffer release
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p block-stream-tests
//! cargo test -p block-stream-tests integration::failover
//! ```

#[cfg(test)]
mod integration;
