//! Event intake and job scheduling around the engine.
//!
//! [`FibDaemon`] turns route, switch and tunnel events into jobs on a
//! [`JobCoordinator`](overlay_orch_common::JobCoordinator). Jobs touching
//! the same route, the same (VPN, switch) pair or the same tunnel source run
//! one after the other. BGP route events are batched first by
//! [`BgpRouteOrch`]; parked remote installs are retried by
//! [`PendingRouteOrch`].

mod events;
mod fibdaemon;
mod orchs;

pub use events::{JobKey, RouteEvent};
pub use fibdaemon::FibDaemon;
pub use orchs::{BgpRouteOrch, PendingRouteOrch};
