//! Hexagonal ports: the API this crate exposes and the SPI it consumes.

pub mod inbound;
pub mod outbound;
