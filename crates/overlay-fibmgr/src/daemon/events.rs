use overlay_orch_common::{JobCoordinator, TaskError};
use overlay_types::{IpPrefix, SwitchId};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::error::Result;
use crate::route::FibManager;
use crate::vpn::VrfEntry;

/// Serialization domain of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobKey {
    Route { rd: String, prefix: IpPrefix },
    /// Switch join/leave and external route population for one VPN.
    Switch { vpn_id: u32, switch: SwitchId },
    Tunnel { source: SwitchId },
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKey::Route { rd, prefix } => write!(f, "route:{}:{}", rd, prefix),
            JobKey::Switch { vpn_id, switch } => write!(f, "switch:{}:{}", vpn_id, switch),
            JobKey::Tunnel { source } => write!(f, "tunnel:{}", source),
        }
    }
}

/// A change of one VRF entry.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteEvent {
    Added(VrfEntry),
    Updated { old: VrfEntry, new: VrfEntry },
    Removed(VrfEntry),
}

impl RouteEvent {
    pub fn prefix(&self) -> IpPrefix {
        match self {
            RouteEvent::Added(entry) | RouteEvent::Removed(entry) => entry.prefix,
            RouteEvent::Updated { new, .. } => new.prefix,
        }
    }

    pub fn is_bgp(&self) -> bool {
        match self {
            RouteEvent::Added(entry) | RouteEvent::Removed(entry) => entry.is_bgp(),
            RouteEvent::Updated { old, new } => old.is_bgp() || new.is_bgp(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            RouteEvent::Added(_) => "add",
            RouteEvent::Updated { .. } => "update",
            RouteEvent::Removed(_) => "remove",
        }
    }

    /// What is programmed before the event applies.
    fn installed(self) -> Option<VrfEntry> {
        match self {
            RouteEvent::Added(_) => None,
            RouteEvent::Updated { old, .. } | RouteEvent::Removed(old) => Some(old),
        }
    }

    /// Folds two consecutive events of the same route into one that goes
    /// from the state before `self` to the state after `next`.
    pub fn merge(self, next: RouteEvent) -> RouteEvent {
        let before = self.installed();
        match (before, next) {
            (None, RouteEvent::Added(new) | RouteEvent::Updated { new, .. }) => RouteEvent::Added(new),
            (Some(old), RouteEvent::Added(new) | RouteEvent::Updated { new, .. }) => {
                RouteEvent::Updated { old, new }
            }
            (Some(old), RouteEvent::Removed(_)) => RouteEvent::Removed(old),
            // Added then removed: the remove is a harmless no-op.
            (None, removed @ RouteEvent::Removed(_)) => removed,
        }
    }

    pub(crate) async fn apply(&self, manager: &FibManager, rd: &str) -> Result<()> {
        match self {
            RouteEvent::Added(entry) => manager.on_route_added(rd, entry).await,
            RouteEvent::Updated { old, new } => manager.on_route_updated(rd, old, new).await,
            RouteEvent::Removed(entry) => manager.on_route_removed(rd, entry).await,
        }
    }
}

/// Submits engine work to the coordinator. `work` is called again on every
/// retry.
pub(crate) fn submit_job<F, Fut>(
    jobs: &JobCoordinator<JobKey>,
    manager: &Arc<FibManager>,
    key: JobKey,
    label: String,
    work: F,
) where
    F: Fn(Arc<FibManager>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let manager = Arc::clone(manager);
    jobs.submit(key, label, move || {
        let run = work(Arc::clone(&manager));
        Box::pin(async move { run.await.map_err(TaskError::from) })
    });
}

pub(crate) fn submit_route_event(
    jobs: &JobCoordinator<JobKey>,
    manager: &Arc<FibManager>,
    rd: String,
    event: RouteEvent,
) {
    let key = JobKey::Route {
        rd: rd.clone(),
        prefix: event.prefix(),
    };
    let label = format!("{} {} in {}", event.kind(), event.prefix(), rd);
    submit_job(jobs, manager, key, label, move |manager| {
        let rd = rd.clone();
        let event = event.clone();
        async move { event.apply(&manager, &rd).await }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpn::RouteOrigin;
    use pretty_assertions::assert_eq;

    fn entry(label: u32) -> VrfEntry {
        VrfEntry::new("203.0.113.0/24".parse().unwrap(), RouteOrigin::Bgp)
            .with_route_path("198.51.100.1".parse().unwrap(), Some(label))
    }

    #[test]
    fn test_merge_spans_first_and_last_state() {
        let merged = RouteEvent::Removed(entry(1)).merge(RouteEvent::Added(entry(2)));
        assert_eq!(
            merged,
            RouteEvent::Updated {
                old: entry(1),
                new: entry(2)
            }
        );

        let merged = RouteEvent::Added(entry(1)).merge(RouteEvent::Updated {
            old: entry(1),
            new: entry(2),
        });
        assert_eq!(merged, RouteEvent::Added(entry(2)));

        let merged = RouteEvent::Updated {
            old: entry(1),
            new: entry(2),
        }
        .merge(RouteEvent::Removed(entry(2)));
        assert_eq!(merged, RouteEvent::Removed(entry(1)));
    }

    #[test]
    fn test_job_key_display() {
        let key = JobKey::Route {
            rd: "A1".into(),
            prefix: "10.0.0.0/24".parse().unwrap(),
        };
        assert_eq!(key.to_string(), "route:A1:10.0.0.0/24");
        assert_eq!(
            JobKey::Tunnel {
                source: SwitchId::new(3)
            }
            .to_string(),
            "tunnel:3"
        );
    }
}
