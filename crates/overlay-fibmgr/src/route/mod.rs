//! Route dispatch and the generic install path.
//!
//! A route event is classified once ([`classify`]) and handed to the subnet,
//! inter-VPN or generic handler. The generic handler installs local copies
//! on the switches owning the destination, then a remote copy on every other
//! active switch of the VPN, through a load-balance group for ECMP
//! destinations.

mod classify;
mod local;
mod manager;
mod remote;
pub(crate) mod rules;

pub use classify::{classify, RouteHandler};
pub use manager::{FibManager, PendingKey, PendingRoute};
pub(crate) use manager::InstallMode;
