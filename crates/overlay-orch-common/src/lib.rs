//! Common orchestration machinery for the overlay L3VPN control plane.
//!
//! This crate provides the building blocks the FIB manager is assembled
//! from:
//!
//! - [`Orch`]: Trait for periodically driven orchestration agents
//! - [`JobCoordinator`]: Fixed worker pool with per-key serialization
//! - [`KeyedLock`]: On-demand async mutex per key
//! - [`RefCountTable`]: Refcounted map that never auto-vivifies entries
//! - [`RetryCache`]: Work parked until a dependency is satisfied
//! - [`Batcher`]: Coalescing batching stage (intents per key are merged)
//! - [`TaskError`]/[`TaskStatus`]: Job outcome taxonomy
//!
//! # Architecture
//!
//! ```text
//! events ──> [Batcher] ──> [JobCoordinator] ──> workers ──> job closure
//!                                 │                              │
//!                           per-key FIFO                 [KeyedLock] sections
//! ```
//!
//! Jobs sharing a key run strictly in submission order, one at a time;
//! jobs with different keys run concurrently on the worker pool.

mod batch;
mod job;
mod keyed_lock;
mod orch;
mod ref_table;
mod retry;
mod task;

pub use batch::Batcher;
pub use job::{Job, JobCoordinator, JobCoordinatorConfig, JobFuture};
pub use keyed_lock::{KeyedLock, KeyedLockGuard};
pub use orch::Orch;
pub use ref_table::{RefCountTable, RefTableError, Released};
pub use retry::{Dependency, RetryCache};
pub use task::{TaskError, TaskResult, TaskStatus};
