//! FibDaemon implementation.
//!
//! The FibDaemon is the entry point for every event the FIB manager
//! consumes. It owns:
//! - the engine ([`FibManager`]) shared by all jobs
//! - the job coordinator that serializes work per route, switch or tunnel
//! - the Orchs driven once per tick (BGP batching, pending retries)

use log::{debug, info};
use overlay_orch_common::{JobCoordinator, JobCoordinatorConfig, Orch};
use overlay_types::SwitchId;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;

use super::events::{submit_job, submit_route_event, JobKey, RouteEvent};
use super::orchs::{BgpRouteOrch, PendingRouteOrch};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::config::{ConfigError, FibConfig};
use crate::route::FibManager;
use crate::southbound::{Southbound, TunnelDestination};
use crate::vpn::VrfEntry;

/// The FIB manager daemon.
pub struct FibDaemon {
    config: FibConfig,
    manager: Arc<FibManager>,
    jobs: JobCoordinator<JobKey>,
    bgp: Arc<BgpRouteOrch>,
    /// Registered Orchs sorted by priority
    orchs: BTreeMap<i32, Vec<Arc<dyn Orch>>>,
}

impl FibDaemon {
    /// Builds the engine over `southbound` and registers the built-in Orchs.
    pub fn new(config: FibConfig, southbound: Southbound) -> Result<Self, ConfigError> {
        config.validate()?;

        let manager = Arc::new(FibManager::new(config.clone(), southbound));
        let jobs = JobCoordinator::new(JobCoordinatorConfig {
            worker_count: config.worker_count,
            max_retries: config.job_max_retries,
            retry_backoff: config.retry_backoff(),
        });
        let bgp = Arc::new(BgpRouteOrch::new(
            config.bgp_batch_size,
            jobs.clone(),
            Arc::clone(&manager),
        ));
        let pending = Arc::new(PendingRouteOrch::new(
            config.pending_retry_interval(),
            jobs.clone(),
            Arc::clone(&manager),
        ));

        let mut daemon = Self {
            config,
            manager,
            jobs,
            bgp: Arc::clone(&bgp),
            orchs: BTreeMap::new(),
        };
        daemon.register_orch(bgp);
        daemon.register_orch(pending);
        Ok(daemon)
    }

    /// Registers an Orch with the daemon.
    ///
    /// Orchs are ordered by priority (lower = higher priority).
    pub fn register_orch(&mut self, orch: Arc<dyn Orch>) {
        let priority = orch.priority();
        let orch_name = orch.name().to_string();
        info!("Registering {} with priority {}", orch_name, priority);

        audit_log!(AuditRecord::new(
            AuditCategory::ResourceCreate,
            "FibDaemon",
            format!("register_orch: {}", orch_name),
        )
        .with_outcome(AuditOutcome::Success)
        .with_object_id(&orch_name)
        .with_object_type("orch_module")
        .with_details(serde_json::json!({
            "priority": priority,
        })));

        self.orchs.entry(priority).or_default().push(orch);
    }

    pub fn config(&self) -> &FibConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<FibManager> {
        &self.manager
    }

    pub fn jobs(&self) -> &JobCoordinator<JobKey> {
        &self.jobs
    }

    /// BGP events wait in the batch; everything else is submitted at once.
    fn dispatch(&self, rd: &str, event: RouteEvent) {
        if event.is_bgp() {
            if self.bgp.push(rd, event) {
                self.bgp.flush();
            }
        } else {
            submit_route_event(&self.jobs, &self.manager, rd.to_string(), event);
        }
    }

    pub fn on_route_added(&self, rd: &str, entry: VrfEntry) {
        self.dispatch(rd, RouteEvent::Added(entry));
    }

    pub fn on_route_updated(&self, rd: &str, old: VrfEntry, new: VrfEntry) {
        self.dispatch(rd, RouteEvent::Updated { old, new });
    }

    pub fn on_route_removed(&self, rd: &str, entry: VrfEntry) {
        self.dispatch(rd, RouteEvent::Removed(entry));
    }

    pub fn on_switch_join(&self, switch: SwitchId, vpn_id: u32, rd: &str) {
        let rd = rd.to_string();
        let key = JobKey::Switch { vpn_id, switch };
        let label = format!("join of switch {} to {}", switch, rd);
        submit_job(&self.jobs, &self.manager, key, label, move |manager| {
            let rd = rd.clone();
            async move { manager.on_switch_join(switch, vpn_id, &rd).await.map(|_| ()) }
        });
    }

    pub fn on_switch_leave(&self, switch: SwitchId, vpn_id: u32, rd: &str) {
        let rd = rd.to_string();
        let key = JobKey::Switch { vpn_id, switch };
        let label = format!("leave of switch {} from {}", switch, rd);
        submit_job(&self.jobs, &self.manager, key, label, move |manager| {
            let rd = rd.clone();
            async move { manager.on_switch_leave(switch, vpn_id, &rd).await.map(|_| ()) }
        });
    }

    pub fn on_tunnel_endpoint_up(&self, source: SwitchId, destination: TunnelDestination) {
        let key = JobKey::Tunnel { source };
        let label = format!("tunnel up {} -> {}", source, destination);
        submit_job(&self.jobs, &self.manager, key, label, move |manager| async move {
            manager
                .on_tunnel_endpoint_up(source, destination)
                .await
                .map(|_| ())
        });
    }

    pub fn on_tunnel_endpoint_down(&self, source: SwitchId, destination: TunnelDestination) {
        let key = JobKey::Tunnel { source };
        let label = format!("tunnel down {} -> {}", source, destination);
        submit_job(&self.jobs, &self.manager, key, label, move |manager| async move {
            manager
                .on_tunnel_endpoint_down(source, destination)
                .await
                .map(|_| ())
        });
    }

    pub fn populate_external_routes(
        &self,
        switch: SwitchId,
        vpn_id: u32,
        rd: &str,
        local_ip: IpAddr,
        remote_ip: IpAddr,
    ) {
        let rd = rd.to_string();
        let key = JobKey::Switch { vpn_id, switch };
        let label = format!("populate {} routes via {} on switch {}", rd, remote_ip, switch);
        submit_job(&self.jobs, &self.manager, key, label, move |manager| {
            let rd = rd.clone();
            async move {
                manager
                    .populate_external_routes(switch, vpn_id, &rd, local_ip, remote_ip)
                    .await
                    .map(|_| ())
            }
        });
    }

    pub fn cleanup_external_routes(
        &self,
        switch: SwitchId,
        vpn_id: u32,
        rd: &str,
        local_ip: IpAddr,
        remote_ip: IpAddr,
    ) {
        let rd = rd.to_string();
        let key = JobKey::Switch { vpn_id, switch };
        let label = format!("cleanup {} routes via {} on switch {}", rd, remote_ip, switch);
        submit_job(&self.jobs, &self.manager, key, label, move |manager| {
            let rd = rd.clone();
            async move {
                manager
                    .cleanup_external_routes(switch, vpn_id, &rd, local_ip, remote_ip)
                    .await
                    .map(|_| ())
            }
        });
    }

    /// Runs every Orch with pending work once, in priority order.
    pub async fn tick(&self) {
        for orchs in self.orchs.values() {
            for orch in orchs {
                if orch.has_pending_tasks() {
                    debug!("Processing tasks for {}", orch.name());
                    orch.do_task().await;
                }
            }
        }
    }

    /// Submits the queued BGP batch without waiting for the window.
    pub fn flush(&self) -> usize {
        self.bgp.flush()
    }

    /// Flushes the BGP batch and waits for every submitted job.
    pub async fn wait_idle(&self) {
        self.flush();
        self.jobs.wait_idle().await;
    }

    /// Drives the Orchs every batch window until `shutdown` resolves, then
    /// drains the outstanding work.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        info!("Starting FibDaemon event loop");
        audit_log!(AuditRecord::new(
            AuditCategory::SystemLifecycle,
            "FibDaemon",
            "event_loop_started",
        )
        .with_outcome(AuditOutcome::Success)
        .with_details(serde_json::json!({
            "worker_count": self.config.worker_count,
            "bgp_batch_size": self.config.bgp_batch_size,
            "bgp_batch_interval_ms": self.config.bgp_batch_interval_ms,
            "orch_count": self.orchs.values().map(Vec::len).sum::<usize>(),
        })));

        let mut ticker = tokio::time::interval(self.config.batch_interval());
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        info!("FibDaemon draining {} jobs", self.jobs.pending());
        self.wait_idle().await;

        audit_log!(AuditRecord::new(
            AuditCategory::SystemLifecycle,
            "FibDaemon",
            "event_loop_stopped",
        )
        .with_outcome(AuditOutcome::Success)
        .with_details(serde_json::json!({
            "completed_jobs": self.jobs.completed(),
            "failed_jobs": self.jobs.failed(),
            "parked_routes": self.manager.pending_count(),
        })));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{fib_flow_ref, FIB_TABLE};
    use crate::southbound::RoutingStore;
    use crate::testing::{config, s, tunnel_ip, Harness};
    use crate::vpn::{PrefixBinding, RouteOrigin};
    use pretty_assertions::assert_eq;

    fn daemon(h: &Harness, config: FibConfig) -> FibDaemon {
        FibDaemon::new(config, h.southbound()).unwrap()
    }

    fn bgp_route(label: u32) -> VrfEntry {
        VrfEntry::new("203.0.113.0/24".parse().unwrap(), RouteOrigin::Bgp)
            .with_route_path(tunnel_ip(1), Some(label))
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let h = Harness::new();
        let result = FibDaemon::new(
            FibConfig {
                worker_count: 0,
                ..config()
            },
            h.southbound(),
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_orchs_registered_by_priority() {
        let h = Harness::new();
        let d = daemon(&h, config());
        let names: Vec<&str> = d
            .orchs
            .values()
            .flatten()
            .map(|orch| orch.name())
            .collect();
        assert_eq!(names, vec!["BgpRouteOrch", "PendingRouteOrch"]);
    }

    #[tokio::test]
    async fn test_bgp_events_wait_for_the_batch() {
        let h = Harness::new();
        let d = daemon(&h, config());
        let entry = bgp_route(7001);

        d.on_route_added("A1", entry.clone());
        d.jobs().wait_idle().await;
        assert_eq!(h.flows.commit_count(), 0);
        assert!(d.bgp.has_pending_tasks());

        d.tick().await;
        d.wait_idle().await;
        assert!(h
            .flows
            .flow(s(2), FIB_TABLE, &fib_flow_ref(s(2), 100, &entry.prefix))
            .is_some());
        assert!(h
            .flows
            .flow(s(3), FIB_TABLE, &fib_flow_ref(s(3), 100, &entry.prefix))
            .is_some());
        assert_eq!(d.jobs().completed(), 1);
    }

    #[tokio::test]
    async fn test_full_batch_flushes_immediately() {
        let h = Harness::new();
        let d = daemon(
            &h,
            FibConfig {
                bgp_batch_size: 1,
                ..config()
            },
        );
        d.on_route_added("A1", bgp_route(7001));
        assert!(!d.bgp.has_pending_tasks());
        d.jobs().wait_idle().await;
        assert_eq!(h.flows.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_add_then_remove_in_one_batch_leaves_nothing() {
        let h = Harness::new();
        let d = daemon(&h, config());
        d.on_route_added("A1", bgp_route(7001));
        d.on_route_removed("A1", bgp_route(7001));
        assert_eq!(d.bgp.len(), 1);

        d.wait_idle().await;
        assert_eq!(h.flows.flow_count(), 0);
    }

    #[tokio::test]
    async fn test_local_route_bypasses_batch() {
        let h = Harness::new();
        let prefix = "10.0.0.5/32".parse().unwrap();
        h.store
            .put_prefix_binding(PrefixBinding::new(100, prefix, s(1), "tap1"));
        let d = daemon(&h, config());
        d.on_route_added(
            "A1",
            VrfEntry::new(prefix, RouteOrigin::Local).with_route_path(tunnel_ip(1), Some(5001)),
        );
        assert!(!d.bgp.has_pending_tasks());
        d.jobs().wait_idle().await;
        assert_eq!(h.flows.flow_count(), 5);
    }

    #[tokio::test]
    async fn test_switch_leave_through_jobs() {
        let h = Harness::new();
        let prefix = "10.0.0.5/32".parse().unwrap();
        h.store
            .put_prefix_binding(PrefixBinding::new(100, prefix, s(1), "tap1"));
        let entry =
            VrfEntry::new(prefix, RouteOrigin::Local).with_route_path(tunnel_ip(1), Some(5001));
        h.store.put_vrf_entry("A1", entry.clone()).await.unwrap();
        let d = daemon(&h, config());
        d.on_route_added("A1", entry);
        d.wait_idle().await;
        assert!(!h.flows.flows_on(s(2)).is_empty());

        d.on_switch_leave(s(2), 100, "A1");
        d.wait_idle().await;

        assert!(h.flows.flows_on(s(2)).is_empty());
        assert_eq!(d.jobs().failed(), 0);
    }

    #[tokio::test]
    async fn test_run_drains_on_shutdown() {
        let h = Harness::new();
        let d = daemon(&h, config());
        d.on_route_added("A1", bgp_route(7001));
        d.run(async {}).await;

        assert!(!d.bgp.has_pending_tasks());
        assert_eq!(d.jobs().pending(), 0);
        assert_eq!(h.flows.commit_count(), 1);
    }
}
