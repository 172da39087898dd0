//! Address management for container networks
//!
//! Provides:
//! - Subnet range parsing
//! - IP address allocation against the shared lease table

pub mod ip;
pub mod range;

pub use ip::IpAllocator;
