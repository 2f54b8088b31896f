use async_trait::async_trait;
use log::debug;
use overlay_orch_common::{Batcher, JobCoordinator, Orch};
use overlay_types::IpPrefix;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use super::events::{submit_job, submit_route_event, JobKey, RouteEvent};
use crate::route::FibManager;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Batching stage for BGP route events.
///
/// Events for the same route are folded together until the batch is
/// flushed, either because it is full or on the next tick.
pub struct BgpRouteOrch {
    batcher: Mutex<Batcher<(String, IpPrefix), RouteEvent>>,
    jobs: JobCoordinator<JobKey>,
    manager: Arc<FibManager>,
}

impl BgpRouteOrch {
    pub fn new(batch_size: usize, jobs: JobCoordinator<JobKey>, manager: Arc<FibManager>) -> Self {
        Self {
            batcher: Mutex::new(Batcher::new("bgp-routes", batch_size)),
            jobs,
            manager,
        }
    }

    /// Queues an event; returns true when the batch is full.
    pub fn push(&self, rd: &str, event: RouteEvent) -> bool {
        let key = (rd.to_string(), event.prefix());
        locked(&self.batcher).push_merge(key, event, RouteEvent::merge)
    }

    /// Submits every queued event as a job. Returns how many were submitted.
    pub fn flush(&self) -> usize {
        let batch = locked(&self.batcher).drain();
        let count = batch.len();
        for ((rd, _), event) in batch {
            submit_route_event(&self.jobs, &self.manager, rd, event);
        }
        if count > 0 {
            debug!("BgpRouteOrch: flushed {} route events", count);
        }
        count
    }

    pub fn len(&self) -> usize {
        locked(&self.batcher).len()
    }

    pub fn is_empty(&self) -> bool {
        locked(&self.batcher).is_empty()
    }
}

#[async_trait]
impl Orch for BgpRouteOrch {
    fn name(&self) -> &str {
        "BgpRouteOrch"
    }

    async fn do_task(&self) {
        self.flush();
    }

    fn has_pending_tasks(&self) -> bool {
        !self.is_empty()
    }

    fn dump_pending_tasks(&self) -> Vec<String> {
        locked(&self.batcher).dump()
    }
}

/// Periodic retry of parked remote installs.
pub struct PendingRouteOrch {
    jobs: JobCoordinator<JobKey>,
    manager: Arc<FibManager>,
    interval: Duration,
    last_run: Mutex<Instant>,
}

impl PendingRouteOrch {
    pub fn new(interval: Duration, jobs: JobCoordinator<JobKey>, manager: Arc<FibManager>) -> Self {
        Self {
            jobs,
            manager,
            interval,
            last_run: Mutex::new(Instant::now()),
        }
    }

    /// Submits a retry job for every parked route. Each retry runs under
    /// the key of its route so it stays ordered with route events.
    pub fn retry_all(&self) -> usize {
        let parked = self.manager.take_pending();
        let count = parked.len();
        for route in parked {
            let key = JobKey::Route {
                rd: route.rd.clone(),
                prefix: route.entry.prefix,
            };
            let label = format!("retry {} on switch {}", route.entry.prefix, route.switch);
            submit_job(&self.jobs, &self.manager, key, label, move |manager| {
                let route = route.clone();
                async move { manager.retry_pending(route).await.map(|_| ()) }
            });
        }
        count
    }
}

#[async_trait]
impl Orch for PendingRouteOrch {
    fn name(&self) -> &str {
        "PendingRouteOrch"
    }

    async fn do_task(&self) {
        {
            let mut last_run = locked(&self.last_run);
            if last_run.elapsed() < self.interval {
                return;
            }
            *last_run = Instant::now();
        }
        let count = self.retry_all();
        debug!("PendingRouteOrch: retrying {} parked routes", count);
    }

    /// Runs after the BGP batch of the same tick.
    fn priority(&self) -> i32 {
        10
    }

    fn has_pending_tasks(&self) -> bool {
        self.manager.pending_count() > 0
    }

    fn dump_pending_tasks(&self) -> Vec<String> {
        vec![format!("{} parked routes", self.manager.pending_count())]
    }
}
