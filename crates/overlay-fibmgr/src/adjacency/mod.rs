//! Resolution of a route to the egress adjacencies that reach it from a
//! given switch.

mod resolver;

pub use resolver::{AdjacencyKind, AdjacencyResolver, AdjacencyResult};
