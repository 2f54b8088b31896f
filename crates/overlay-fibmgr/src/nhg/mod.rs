//! Next-hop groups: shared single-destination groups with flow reference
//! counting, and load-balance groups for ECMP destinations.

mod builder;
mod changes;

pub use builder::{NextHopGroupBuilder, SingleGroup, SingleGroupKey};
pub use changes::GroupChanges;
