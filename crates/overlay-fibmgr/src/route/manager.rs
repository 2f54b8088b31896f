use log::{debug, error, info, warn};
use overlay_orch_common::{Dependency, RetryCache};
use overlay_types::{IpPrefix, SwitchId};
use std::sync::{Arc, Mutex, MutexGuard};

use super::classify::{classify, RouteHandler};
use crate::adjacency::AdjacencyResolver;
use crate::audit::{AuditCategory, AuditRecord};
use crate::audit_log;
use crate::config::FibConfig;
use crate::error::{FibError, Result};
use crate::flow::FlowBatch;
use crate::label::LabelManager;
use crate::nhg::NextHopGroupBuilder;
use crate::southbound::{EgressResolver, FlowProgrammer, RoutingStore, Southbound};
use crate::vpn::{VpnInstance, VrfEntry};

/// Whether an install adds references to shared groups or only makes sure
/// they exist. Reconciliation replays use the latter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InstallMode {
    Fresh,
    Replay,
}

/// A remote install waiting for its switch to get an egress.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub switch: SwitchId,
    pub rd: String,
    pub prefix: IpPrefix,
}

#[derive(Debug, Clone)]
pub struct PendingRoute {
    pub switch: SwitchId,
    pub rd: String,
    pub entry: VrfEntry,
    pub dependency: Dependency,
}

impl PendingRoute {
    pub fn key(&self) -> PendingKey {
        PendingKey {
            switch: self.switch,
            rd: self.rd.clone(),
            prefix: self.entry.prefix,
        }
    }
}

/// Turns VRF entries into per-switch forwarding rules.
///
/// Every public operation collects its rule and group writes into one
/// [`FlowBatch`] and commits it once. Callers serialize operations on the
/// same route; label and group sections are locked internally.
pub struct FibManager {
    pub(crate) config: FibConfig,
    pub(crate) store: Arc<dyn RoutingStore>,
    pub(crate) flows: Arc<dyn FlowProgrammer>,
    pub(crate) egress: Arc<dyn EgressResolver>,
    pub(crate) labels: LabelManager,
    pub(crate) groups: NextHopGroupBuilder,
    pub(crate) adjacency: AdjacencyResolver,
    pending: Mutex<RetryCache<PendingKey, PendingRoute>>,
}

impl FibManager {
    pub fn new(config: FibConfig, southbound: Southbound) -> Self {
        let labels = LabelManager::new(
            Arc::clone(&southbound.store),
            Arc::clone(&southbound.ids),
            config.label_pool.clone(),
        );
        let groups = NextHopGroupBuilder::new(
            Arc::clone(&southbound.store),
            Arc::clone(&southbound.ids),
            Arc::clone(&southbound.egress),
            config.group_pool.clone(),
        );
        let adjacency =
            AdjacencyResolver::new(Arc::clone(&southbound.store), Arc::clone(&southbound.egress));
        Self {
            config,
            store: southbound.store,
            flows: southbound.flows,
            egress: southbound.egress,
            labels,
            groups,
            adjacency,
            pending: Mutex::new(RetryCache::new()),
        }
    }

    pub fn config(&self) -> &FibConfig {
        &self.config
    }

    pub fn labels(&self) -> &LabelManager {
        &self.labels
    }

    pub fn groups(&self) -> &NextHopGroupBuilder {
        &self.groups
    }

    pub async fn on_route_added(&self, rd: &str, entry: &VrfEntry) -> Result<()> {
        self.check_entry(entry)?;
        let vpn = self.vpn(rd).await?;
        debug!("FibManager: add {} in {} ({})", entry.prefix, vpn.name, entry.origin);

        let mut batch = FlowBatch::new();
        self.add_route(&vpn, rd, entry, None, InstallMode::Fresh, &mut batch)
            .await?;
        self.commit(batch).await
    }

    /// Replaces `old` by `new` in one transaction. Labels carried by both
    /// versions keep their references.
    pub async fn on_route_updated(&self, rd: &str, old: &VrfEntry, new: &VrfEntry) -> Result<()> {
        self.check_entry(new)?;
        let vpn = self.vpn(rd).await?;
        debug!("FibManager: update {} in {}", new.prefix, vpn.name);

        let mut batch = FlowBatch::new();
        self.remove_route(&vpn, rd, old, None, &mut batch).await?;
        self.add_route(&vpn, rd, new, None, InstallMode::Fresh, &mut batch)
            .await?;
        self.commit(batch).await?;

        if !old.is_bgp() {
            self.release_labels(&vpn, old, &new.labels()).await;
        }
        Ok(())
    }

    pub async fn on_route_removed(&self, rd: &str, entry: &VrfEntry) -> Result<()> {
        let Some(vpn) = self.store.vpn_instance_by_rd(rd).await? else {
            info!(
                "FibManager: no VPN for rd {}, treating removal of {} as done",
                rd, entry.prefix
            );
            return Ok(());
        };
        debug!("FibManager: remove {} from {}", entry.prefix, vpn.name);

        let mut batch = FlowBatch::new();
        self.remove_route(&vpn, rd, entry, None, &mut batch).await?;
        self.drop_pending(|key| key.rd == rd && key.prefix == entry.prefix);
        self.commit(batch).await?;

        if !entry.is_bgp() {
            self.release_labels(&vpn, entry, &[]).await;
        }
        Ok(())
    }

    pub(crate) async fn vpn(&self, rd: &str) -> Result<VpnInstance> {
        self.store
            .vpn_instance_by_rd(rd)
            .await?
            .ok_or_else(|| FibError::VpnNotFound(rd.to_string()))
    }

    fn check_entry(&self, entry: &VrfEntry) -> Result<()> {
        if entry.is_bgp() && entry.route_paths.is_empty() {
            return Err(FibError::invalid_entry(entry.prefix, "BGP route without next hop"));
        }
        let max = self.config.max_bgp_ecmp_paths;
        if entry.is_bgp() && entry.route_paths.len() > max {
            error!(
                "FibManager: dropping {}: {} route paths, at most {} can be load balanced",
                entry.prefix,
                entry.route_paths.len(),
                max
            );
            return Err(FibError::EcmpConstraint {
                prefix: entry.prefix,
                paths: entry.route_paths.len(),
                max,
            });
        }
        Ok(())
    }

    /// Dispatches an install. `scope` restricts every write to one switch.
    pub(crate) async fn add_route(
        &self,
        vpn: &VpnInstance,
        rd: &str,
        entry: &VrfEntry,
        scope: Option<SwitchId>,
        mode: InstallMode,
        batch: &mut FlowBatch,
    ) -> Result<()> {
        let links = self.store.inter_vpn_links().await?;
        match classify(vpn, entry, &links) {
            RouteHandler::Subnet(subnet) => {
                self.install_subnet_route(vpn, rd, entry, subnet, scope, batch)
                    .await
            }
            RouteHandler::RouterInterface => {
                debug!(
                    "FibManager: {} in {} is a router interface, nothing to program",
                    entry.prefix, vpn.name
                );
                Ok(())
            }
            RouteHandler::InterVpn(link) => {
                self.install_inter_vpn_route(vpn, rd, entry, &link, scope, batch)
                    .await
            }
            RouteHandler::Generic => {
                self.install_generic(vpn, rd, entry, scope, mode, batch)
                    .await?;
                if entry.is_bgp() && scope.is_none() {
                    self.leak_bgp_route(vpn, rd, entry, &links, batch).await?;
                }
                Ok(())
            }
        }
    }

    pub(crate) async fn remove_route(
        &self,
        vpn: &VpnInstance,
        rd: &str,
        entry: &VrfEntry,
        scope: Option<SwitchId>,
        batch: &mut FlowBatch,
    ) -> Result<()> {
        let links = self.store.inter_vpn_links().await?;
        match classify(vpn, entry, &links) {
            RouteHandler::Subnet(_) => self.remove_subnet_route(vpn, entry, scope, batch),
            RouteHandler::RouterInterface => Ok(()),
            RouteHandler::InterVpn(link) => {
                self.remove_inter_vpn_route(vpn, rd, entry, &link, scope, batch)
                    .await
            }
            RouteHandler::Generic => {
                self.remove_generic(vpn, entry, scope, batch).await?;
                if entry.is_bgp() && scope.is_none() {
                    self.unleak_bgp_route(vpn, rd, entry, &links, batch).await?;
                }
                Ok(())
            }
        }
    }

    /// Local install on the owning switches, then a remote install on every
    /// other active switch of the VPN.
    async fn install_generic(
        &self,
        vpn: &VpnInstance,
        rd: &str,
        entry: &VrfEntry,
        scope: Option<SwitchId>,
        mode: InstallMode,
        batch: &mut FlowBatch,
    ) -> Result<()> {
        let footprint = self
            .install_local(vpn, rd, entry, scope, mode, batch)
            .await?;

        let targets: Vec<SwitchId> = match scope {
            Some(switch) => vec![switch],
            None => vpn.active_switches(),
        };
        for switch in targets {
            if footprint.contains(&switch) {
                continue;
            }
            self.install_remote_or_park(vpn, rd, entry, switch, Dependency::TunnelFrom(switch), batch)
                .await?;
        }
        Ok(())
    }

    async fn remove_generic(
        &self,
        vpn: &VpnInstance,
        entry: &VrfEntry,
        scope: Option<SwitchId>,
        batch: &mut FlowBatch,
    ) -> Result<()> {
        let footprint = self.remove_local(vpn, entry, scope, batch).await?;

        let targets: Vec<SwitchId> = match scope {
            Some(switch) => vec![switch],
            None => vpn.all_switches(),
        };
        for switch in targets {
            if footprint.contains(&switch) {
                continue;
            }
            self.remove_remote(vpn, entry, switch, batch).await?;
        }
        Ok(())
    }

    /// Remote install on one switch. An unresolvable adjacency is logged
    /// and parked without failing the operation.
    pub(crate) async fn install_remote_or_park(
        &self,
        vpn: &VpnInstance,
        rd: &str,
        entry: &VrfEntry,
        switch: SwitchId,
        dependency: Dependency,
        batch: &mut FlowBatch,
    ) -> Result<bool> {
        match self.install_remote(vpn, rd, entry, switch, batch).await {
            Ok(()) => {
                self.drop_pending(|key| {
                    key.switch == switch && key.rd == rd && key.prefix == entry.prefix
                });
                Ok(true)
            }
            Err(err) if err.is_soft() => {
                warn!("FibManager: {}; parked until {}", err, dependency);
                self.park(PendingRoute {
                    switch,
                    rd: rd.to_string(),
                    entry: entry.clone(),
                    dependency,
                });
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Drops the VPN's references on the labels of `entry` once its rules
    /// are committed. Store failures are retried in place and then only
    /// reported: running the job again would release its groups twice.
    async fn release_labels(&self, vpn: &VpnInstance, entry: &VrfEntry, keep: &[u32]) {
        for label in entry.labels() {
            if keep.contains(&label) {
                continue;
            }
            let mut attempt = 0;
            loop {
                match self.labels.release_and_free(label, &vpn.name).await {
                    Ok(released) => {
                        if released {
                            debug!("FibManager: label {} of {} released", label, entry.prefix);
                        }
                        break;
                    }
                    Err(err) if attempt < self.config.job_max_retries => {
                        attempt += 1;
                        warn!(
                            "FibManager: release of label {} failed ({}), retry {}/{}",
                            label, err, attempt, self.config.job_max_retries
                        );
                        tokio::time::sleep(self.config.retry_backoff()).await;
                    }
                    Err(err) => {
                        error!("FibManager: label {} of {} left behind: {}", label, entry.prefix, err);
                        audit_log!(AuditRecord::new(
                            AuditCategory::ErrorCondition,
                            "FibManager",
                            "label_release_abandoned"
                        )
                        .with_error(err.to_string())
                        .with_object_id(label.to_string())
                        .with_object_type("label")
                        .with_details(serde_json::json!({
                            "vpn": vpn.name,
                            "prefix": entry.prefix.to_string(),
                        })));
                        break;
                    }
                }
            }
        }
    }

    /// Commits a batch, retrying the backend in place, then folds its group
    /// table changes in.
    ///
    /// A batch that never commits leaves the group tables untouched, so a
    /// failed job can run again from scratch.
    pub(crate) async fn commit(&self, mut batch: FlowBatch) -> Result<()> {
        let changes = batch.take_group_changes();
        if batch.is_empty() {
            self.groups.apply(changes).await;
            return Ok(());
        }
        let ops = batch.len();
        let mut attempt = 0;
        loop {
            match self.flows.commit(batch.clone()).await {
                Ok(()) => {
                    debug!("FibManager: committed {} operations", ops);
                    self.groups.apply(changes).await;
                    return Ok(());
                }
                Err(err) if attempt < self.config.job_max_retries => {
                    attempt += 1;
                    warn!(
                        "FibManager: commit of {} operations failed ({}), retry {}/{}",
                        ops, err, attempt, self.config.job_max_retries
                    );
                    tokio::time::sleep(self.config.retry_backoff()).await;
                }
                Err(err) => {
                    error!("FibManager: giving up on commit of {} operations: {}", ops, err);
                    audit_log!(AuditRecord::new(
                        AuditCategory::ErrorCondition,
                        "FibManager",
                        "commit_abandoned"
                    )
                    .with_error(err.to_string())
                    .with_object_type("flow_batch")
                    .with_details(serde_json::json!({
                        "operations": ops,
                        "attempts": attempt + 1,
                    })));
                    return Err(FibError::CommitFailed {
                        attempts: attempt + 1,
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    fn pending(&self) -> MutexGuard<'_, RetryCache<PendingKey, PendingRoute>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn park(&self, route: PendingRoute) {
        let dependency = route.dependency.clone();
        self.pending().park(route.key(), route, [dependency]);
    }

    pub(crate) fn drop_pending<F>(&self, pred: F) -> usize
    where
        F: Fn(&PendingKey) -> bool,
    {
        let mut pending = self.pending();
        let keys: Vec<PendingKey> = pending.keys().filter(|key| pred(*key)).cloned().collect();
        for key in &keys {
            pending.remove(key);
        }
        keys.len()
    }

    /// Pending routes whose dependency is now met; they leave the cache.
    pub(crate) fn satisfy(&self, dependency: &Dependency) -> Vec<PendingRoute> {
        self.pending()
            .satisfy(dependency)
            .into_iter()
            .map(|(_, route)| route)
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    pub fn is_pending(&self, switch: SwitchId, rd: &str, prefix: &IpPrefix) -> bool {
        self.pending().contains(&PendingKey {
            switch,
            rd: rd.to_string(),
            prefix: *prefix,
        })
    }

    /// Takes every parked route out of the cache for a retry.
    pub fn take_pending(&self) -> Vec<PendingRoute> {
        let mut pending = self.pending();
        let keys: Vec<PendingKey> = pending.keys().cloned().collect();
        keys.iter().filter_map(|key| pending.remove(key)).collect()
    }

    /// Retries one parked remote install; it is parked again if the switch
    /// still has no egress.
    pub async fn retry_pending(&self, route: PendingRoute) -> Result<bool> {
        let Some(vpn) = self.store.vpn_instance_by_rd(&route.rd).await? else {
            debug!("FibManager: VPN {} is gone, dropping parked {}", route.rd, route.entry.prefix);
            return Ok(false);
        };
        let mut batch = FlowBatch::new();
        let installed = self
            .install_remote_or_park(
                &vpn,
                &route.rd,
                &route.entry,
                route.switch,
                route.dependency.clone(),
                &mut batch,
            )
            .await?;
        self.commit(batch).await?;
        Ok(installed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{
        fib_flow_ref, lfib_flow_ref, tunnel_flow_ref, Action, Instruction, FIB_TABLE,
        INTERNAL_TUNNEL_TABLE, LFIB_TABLE,
    };
    use crate::southbound::TunnelDestination;
    use crate::testing::{config, ip, s, tunnel_ip, Harness};
    use crate::vpn::{EncapType, ExtraRoute, PrefixBinding, PrefixCue, RouteOrigin, SwitchState};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    fn vm_prefix() -> IpPrefix {
        "10.0.0.5/32".parse().unwrap()
    }

    fn bind_vm(h: &Harness) {
        h.store.put_prefix_binding(
            PrefixBinding::new(100, vm_prefix(), s(1), "tap1")
                .with_mac("fa:16:3e:00:00:05".parse().unwrap()),
        );
    }

    fn vm_route() -> VrfEntry {
        VrfEntry::new(vm_prefix(), RouteOrigin::Local).with_route_path(tunnel_ip(1), Some(5001))
    }

    #[tokio::test]
    async fn test_local_and_remote_install() {
        let h = Harness::new();
        bind_vm(&h);
        let entry = vm_route();
        h.manager.on_route_added("A1", &entry).await.unwrap();

        let group = h.manager.groups().single_group_id(100, ip("10.0.0.5")).unwrap();
        let local = h
            .flows
            .flow(s(1), FIB_TABLE, &fib_flow_ref(s(1), 100, &entry.prefix))
            .unwrap();
        assert_eq!(local.target_group(), Some(group));
        assert!(h.flows.flow(s(1), LFIB_TABLE, &lfib_flow_ref(s(1), 5001)).is_some());
        assert!(h
            .flows
            .flow(s(1), INTERNAL_TUNNEL_TABLE, &tunnel_flow_ref(s(1), 5001))
            .is_some());

        let remote = h
            .flows
            .flow(s(2), FIB_TABLE, &fib_flow_ref(s(2), 100, &entry.prefix))
            .unwrap();
        assert_eq!(
            remote.instructions,
            vec![Instruction::ApplyActions(vec![
                Action::SetTunnelId(5001),
                Action::Output("tun2-1".into())
            ])]
        );
        assert_eq!(h.flows.flow_count(), 5);
        assert_eq!(h.flows.group_count(), 1);

        let info = h.manager.labels().route_info(5001).await.unwrap().unwrap();
        assert_eq!(info.switch, Some(s(1)));
        assert_eq!(h.flows.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_is_symmetric() {
        let h = Harness::new();
        bind_vm(&h);
        let entry = vm_route();
        h.manager.on_route_added("A1", &entry).await.unwrap();
        h.manager.on_route_removed("A1", &entry).await.unwrap();

        assert_eq!(h.flows.flow_count(), 0);
        assert_eq!(h.flows.group_count(), 0);
        assert_eq!(h.ids.allocated("groups"), 0);
        assert!(h.manager.labels().route_info(5001).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_extra_route_shares_single_group() {
        let h = Harness::new();
        bind_vm(&h);
        h.manager.on_route_added("A1", &vm_route()).await.unwrap();

        let anycast: IpPrefix = "10.0.0.100/32".parse().unwrap();
        h.store
            .put_extra_route(ExtraRoute::new("vpnA", "A1", anycast, vec![ip("10.0.0.5")]));
        let extra = VrfEntry::new(anycast, RouteOrigin::Static).with_route_path(tunnel_ip(1), Some(5002));
        h.manager.on_route_added("A1", &extra).await.unwrap();

        assert_eq!(h.manager.groups().single_ref_count(100, ip("10.0.0.5")), Some(2));
        assert_eq!(h.flows.group_count(), 1);

        h.manager.on_route_removed("A1", &extra).await.unwrap();
        assert_eq!(h.manager.groups().single_ref_count(100, ip("10.0.0.5")), Some(1));
        assert_eq!(h.flows.group_count(), 1);
    }

    #[tokio::test]
    async fn test_owned_elsewhere_gets_no_rules_anywhere_local() {
        let h = Harness::new();
        h.store.put_prefix_binding(
            PrefixBinding::new(100, vm_prefix(), s(1), "tap1").with_cue(PrefixCue::Nat),
        );
        h.manager.on_route_added("A1", &vm_route()).await.unwrap();

        assert!(h.flows.flows_on(s(1)).is_empty());
        assert_eq!(h.flows.flows_on(s(2)).len(), 1);
        assert_eq!(h.flows.group_count(), 0);
    }

    #[tokio::test]
    async fn test_bgp_ecmp_constraint() {
        let h = Harness::new();
        let entry = VrfEntry::new("203.0.113.0/24".parse().unwrap(), RouteOrigin::Bgp)
            .with_route_path(ip("198.51.100.1"), Some(1))
            .with_route_path(ip("198.51.100.2"), Some(2))
            .with_route_path(ip("198.51.100.3"), Some(3));
        let err = h.manager.on_route_added("A1", &entry).await.unwrap_err();
        assert!(matches!(err, FibError::EcmpConstraint { paths: 3, max: 2, .. }));
        assert_eq!(h.flows.commit_count(), 0);

        let empty = VrfEntry::new("203.0.113.0/24".parse().unwrap(), RouteOrigin::Bgp);
        assert!(matches!(
            h.manager.on_route_added("A1", &empty).await,
            Err(FibError::InvalidEntry { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_vpn() {
        let h = Harness::new();
        assert!(matches!(
            h.manager.on_route_added("Z9", &vm_route()).await,
            Err(FibError::VpnNotFound(_))
        ));
        h.manager.on_route_removed("Z9", &vm_route()).await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_is_retried_in_place() {
        let h = Harness::new();
        bind_vm(&h);
        h.flows.fail_next_commits(2);
        h.manager.on_route_added("A1", &vm_route()).await.unwrap();
        assert_eq!(h.flows.flow_count(), 5);
        assert_eq!(h.manager.groups().single_ref_count(100, ip("10.0.0.5")), Some(1));

        let h = Harness::with_config(FibConfig {
            job_max_retries: 1,
            ..config()
        });
        bind_vm(&h);
        h.flows.fail_next_commits(2);
        assert!(matches!(
            h.manager.on_route_added("A1", &vm_route()).await,
            Err(FibError::CommitFailed { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_unresolvable_switch_is_parked() {
        let h = Harness::new();
        bind_vm(&h);
        h.egress.remove_tunnel(s(3), &TunnelDestination::Ip(tunnel_ip(1)));
        h.manager.on_route_added("A1", &vm_route()).await.unwrap();

        assert!(h.flows.flows_on(s(3)).is_empty());
        assert!(h.manager.is_pending(s(3), "A1", &vm_prefix()));
        assert_eq!(h.manager.pending_count(), 1);

        h.manager.on_route_removed("A1", &vm_route()).await.unwrap();
        assert_eq!(h.manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_update_keeps_shared_labels() {
        let h = Harness::new();
        bind_vm(&h);
        let old = vm_route();
        h.manager.on_route_added("A1", &old).await.unwrap();

        let new = VrfEntry::new(vm_prefix(), RouteOrigin::Local)
            .with_route_path(tunnel_ip(1), Some(5001))
            .with_encap(EncapType::Vxlan, None);
        h.manager.on_route_updated("A1", &old, &new).await.unwrap();

        assert!(h.manager.labels().route_info(5001).await.unwrap().is_some());
        assert_eq!(h.manager.groups().single_ref_count(100, ip("10.0.0.5")), Some(1));
        assert_eq!(h.flows.flow_count(), 5);
    }

    #[tokio::test]
    async fn test_failed_label_write_leaves_groups_untouched() {
        let h = Harness::new();
        bind_vm(&h);
        h.store.fail_next_writes(1);
        assert!(matches!(
            h.manager.on_route_added("A1", &vm_route()).await,
            Err(FibError::Store(_))
        ));
        assert_eq!(h.flows.commit_count(), 0);
        assert_eq!(h.manager.groups().single_ref_count(100, ip("10.0.0.5")), None);

        // The job queue runs the whole job again.
        h.manager.on_route_added("A1", &vm_route()).await.unwrap();
        let group = h.manager.groups().single_group_id(100, ip("10.0.0.5")).unwrap();
        assert_eq!(h.manager.groups().single_ref_count(100, ip("10.0.0.5")), Some(1));
        assert!(h.flows.group(s(1), group).is_some());
        let fib = h
            .flows
            .flow(s(1), FIB_TABLE, &fib_flow_ref(s(1), 100, &vm_prefix()))
            .unwrap();
        assert_eq!(fib.target_group(), Some(group));
    }

    #[tokio::test]
    async fn test_failed_removal_keeps_group_and_id() {
        let h = Harness::with_config(FibConfig {
            job_max_retries: 0,
            ..config()
        });
        bind_vm(&h);
        h.manager.on_route_added("A1", &vm_route()).await.unwrap();
        let group = h.manager.groups().single_group_id(100, ip("10.0.0.5")).unwrap();

        h.flows.fail_next_commits(1);
        assert!(matches!(
            h.manager.on_route_removed("A1", &vm_route()).await,
            Err(FibError::CommitFailed { attempts: 1, .. })
        ));
        assert_eq!(h.manager.groups().single_ref_count(100, ip("10.0.0.5")), Some(1));
        assert!(h.manager.labels().route_info(5001).await.unwrap().is_some());

        // A second endpoint gets its own group, the first one is left alone.
        let other_prefix: IpPrefix = "10.0.0.6/32".parse().unwrap();
        h.store
            .put_prefix_binding(PrefixBinding::new(100, other_prefix, s(1), "tap2"));
        let other = VrfEntry::new(other_prefix, RouteOrigin::Local)
            .with_route_path(tunnel_ip(1), Some(5002));
        h.manager.on_route_added("A1", &other).await.unwrap();
        let other_group = h.manager.groups().single_group_id(100, ip("10.0.0.6")).unwrap();
        assert_ne!(other_group, group);
        assert_eq!(
            h.flows.group(s(1), group).unwrap().buckets[0].actions.last(),
            Some(&Action::Output("tap1".into()))
        );

        h.manager.on_route_removed("A1", &vm_route()).await.unwrap();
        assert_eq!(h.manager.groups().single_ref_count(100, ip("10.0.0.5")), None);
        assert!(h.flows.group(s(1), group).is_none());
        assert_eq!(h.manager.groups().single_ref_count(100, ip("10.0.0.6")), Some(1));
        assert!(h.flows.group(s(1), other_group).is_some());
    }

    #[tokio::test]
    async fn test_label_release_is_retried_after_commit() {
        let h = Harness::new();
        bind_vm(&h);
        h.manager.on_route_added("A1", &vm_route()).await.unwrap();

        h.store.fail_next_writes(1);
        h.manager.on_route_removed("A1", &vm_route()).await.unwrap();
        assert!(h.manager.labels().route_info(5001).await.unwrap().is_none());
        assert_eq!(h.flows.group_count(), 0);
        assert_eq!(h.ids.allocated("groups"), 0);
    }

    #[tokio::test]
    async fn test_self_imported_route_follows_its_label() {
        let h = Harness::new();
        h.store.put_vpn_instance(
            VpnInstance::new(200, "vpnB", "B1").with_switch(s(1), SwitchState::Active),
        );
        bind_vm(&h);
        h.manager.on_route_added("A1", &vm_route()).await.unwrap();

        // vpnB has no binding of its own for the prefix.
        let imported = VrfEntry::new(vm_prefix(), RouteOrigin::SelfImported)
            .with_route_path(tunnel_ip(1), Some(5001))
            .with_parent_rd("A1");
        h.manager.on_route_added("B1", &imported).await.unwrap();

        let group = h.manager.groups().single_group_id(100, ip("10.0.0.5")).unwrap();
        assert_eq!(h.manager.groups().single_ref_count(100, ip("10.0.0.5")), Some(2));
        let fib = h
            .flows
            .flow(s(1), FIB_TABLE, &fib_flow_ref(s(1), 200, &vm_prefix()))
            .unwrap();
        assert_eq!(fib.target_group(), Some(group));
        let info = h.manager.labels().route_info(5001).await.unwrap().unwrap();
        assert_eq!(
            info.referencing_vpns,
            BTreeSet::from(["vpnA".to_string(), "vpnB".to_string()])
        );
        assert_eq!(info.parent_vpn_rd, "A1");

        // The original goes away, the import keeps the label and the group.
        h.manager.on_route_removed("A1", &vm_route()).await.unwrap();
        let info = h.manager.labels().route_info(5001).await.unwrap().unwrap();
        assert_eq!(info.referencing_vpns, BTreeSet::from(["vpnB".to_string()]));
        assert_eq!(h.manager.groups().single_ref_count(100, ip("10.0.0.5")), Some(1));
        assert!(h.flows.group(s(1), group).is_some());
        assert_eq!(h.flows.flow_count(), 1);

        h.manager.on_route_removed("B1", &imported).await.unwrap();
        assert!(h.manager.labels().route_info(5001).await.unwrap().is_none());
        assert_eq!(h.flows.group_count(), 0);
        assert_eq!(h.flows.flow_count(), 0);
    }
}
