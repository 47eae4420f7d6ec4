//! # Domain Layer for Block Streaming
//!
//! Pure logic with no I/O. This is the innermost layer of the hexagonal
//! architecture.
//!
//! ## Contents
//!
//! - **entities**: `BlockItem`, `BlockState`, `BlockNodeConfiguration`
//! - **value_objects**: Configuration, per-peer statistics and retry state
//! - **state_machine**: Connection lifecycle states and the transition function
//! - **batching**: Request size accounting and splitting
//! - **invariants**: Pipeline invariant checks

mod batching;
mod entities;
pub mod invariants;
mod state_machine;
mod value_objects;

pub use batching::*;
pub use entities::*;
pub use invariants::*;
pub use state_machine::*;
pub use value_objects::*;
