//! # Adapters
//!
//! Concrete implementations of the outbound ports.
//!
//! - **config**: Static and `block-nodes.json` configuration providers
//! - **memory**: In-process transport for tests and local wiring
//! - **metrics**: Prometheus and no-op metrics sinks

pub mod config;
pub mod memory;
pub mod metrics;

pub use config::*;
pub use memory::*;
pub use metrics::*;
