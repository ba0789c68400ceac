//! Common types for the team device daemon.
//!
//! This crate provides type-safe representations of the small value types
//! shared between the daemon core, its kernel backend and its tests:
//!
//! - [`HwAddr`]: variable-length hardware (link-layer) address
//! - [`Duplex`]: link duplex as reported by the kernel

mod hwaddr;
mod link;

pub use hwaddr::HwAddr;
pub use link::Duplex;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid hardware address format: {0}")]
    InvalidHwAddr(String),

    #[error("invalid duplex: {0}")]
    InvalidDuplex(String),
}
