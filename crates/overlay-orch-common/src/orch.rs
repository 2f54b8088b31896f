//! Base Orch trait.

use async_trait::async_trait;

/// Base trait for periodically driven orchestration agents.
///
/// The daemon calls `do_task()` on every registered Orch that reports
/// pending work, in priority order, once per tick.
///
/// # Thread Safety
///
/// Orchs are shared between the daemon loop and the event entry points,
/// so implementations keep their state behind interior mutability and
/// must be `Send + Sync`.
#[async_trait]
pub trait Orch: Send + Sync {
    /// Returns the name of this Orch (for logging and debugging).
    fn name(&self) -> &str;

    /// Processes pending work.
    async fn do_task(&self);

    /// Returns the priority of this Orch (lower = higher priority).
    fn priority(&self) -> i32 {
        0
    }

    /// Returns true if this Orch has pending work.
    fn has_pending_tasks(&self) -> bool {
        false
    }

    /// Dumps pending work for debugging.
    fn dump_pending_tasks(&self) -> Vec<String> {
        vec![]
    }
}
