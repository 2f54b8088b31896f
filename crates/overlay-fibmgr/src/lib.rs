//! Overlay L3VPN FIB manager
//!
//! Turns the VRF entries of a software-defined L3VPN into per-switch
//! forwarding rules: FIB rules that steer IP traffic, LFIB rules that pop
//! MPLS labels, tunnel termination rules keyed by VNI or label, and the
//! next-hop groups those rules point at.
//!
//! # Architecture
//!
//! ```text
//! route / switch / tunnel events
//!            │
//!            ↓
//!      [FibDaemon] ── BGP batch ──> [JobCoordinator] ──> [FibManager]
//!                                                            │
//!               ┌──────────────┬──────────────┬──────────────┤
//!               ↓              ↓              ↓              ↓
//!        [RoutingStore] [FlowProgrammer] [IdManager] [EgressResolver]
//! ```
//!
//! # Key Components
//!
//! - [`daemon::FibDaemon`]: Event intake, batching and job scheduling
//! - [`route::FibManager`]: Route classification and the install paths
//! - [`nhg::NextHopGroupBuilder`]: Shared and load-balance group lifecycle
//! - [`label::LabelManager`]: Label route info bookkeeping
//! - [`southbound`]: Collaborator traits and their in-process versions

pub mod adjacency;
pub mod audit;
pub mod config;
pub mod daemon;
pub mod encap;
pub mod error;
pub mod flow;
mod intervpn;
pub mod label;
pub mod nhg;
mod reconcile;
pub mod route;
pub mod southbound;
mod subnet;
pub mod vpn;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, FibConfig};
pub use daemon::{FibDaemon, JobKey, RouteEvent};
pub use error::{FibError, Result};
pub use route::FibManager;
pub use southbound::{Southbound, TunnelDestination, TunnelKind};
