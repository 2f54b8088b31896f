//! Common types for the overlay L3VPN control plane.
//!
//! This crate provides type-safe representations of the network primitives
//! shared by the orchestration crates:
//!
//! - [`SwitchId`]: numeric identifier of a forwarding element
//! - [`IpPrefix`]: IPv4/IPv6 network prefixes (CIDR notation)
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses

mod ip;
mod mac;
mod switch;

pub use ip::IpPrefix;
pub use mac::MacAddress;
pub use switch::SwitchId;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),

    #[error("invalid switch id: {0}")]
    InvalidSwitchId(String),
}
