use itertools::Itertools;
use log::{debug, warn};
use overlay_types::{IpPrefix, SwitchId};
use std::net::IpAddr;

use super::manager::{FibManager, InstallMode};
use super::rules::{fib_group_rule, lfib_rule, tunnel_termination_rule};
use crate::error::Result;
use crate::flow::{
    fib_flow_ref, lfib_flow_ref, tunnel_flow_ref, Action, FlowBatch, Instruction, FIB_TABLE,
    INTERNAL_TUNNEL_TABLE, LFIB_TABLE,
};
use crate::label::LabelClaim;
use crate::vpn::{ExtraRoute, PrefixBinding, VpnInstance, VrfEntry};

/// One switch that carries a local copy of a route.
#[derive(Debug, Clone)]
pub(crate) struct LocalTarget {
    pub switch: SwitchId,
    /// Single groups are keyed by VPN and destination address.
    pub group_vpn_id: u32,
    pub group_next_hop: IpAddr,
    pub binding: Option<PrefixBinding>,
    pub owned_elsewhere: bool,
    pub self_import: bool,
    /// Next hops registered with the label.
    pub next_hops: Vec<IpAddr>,
}

impl LocalTarget {
    fn bound(vpn_id: u32, binding: PrefixBinding, entry: &VrfEntry) -> Self {
        Self {
            switch: binding.switch,
            group_vpn_id: vpn_id,
            group_next_hop: binding.prefix.address(),
            owned_elsewhere: binding.is_owned_elsewhere(),
            binding: Some(binding),
            self_import: false,
            next_hops: entry.next_hops(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct LocalPlan {
    pub targets: Vec<LocalTarget>,
    /// Extra routes of a load-balanced destination, empty otherwise.
    pub ecmp_routes: Vec<ExtraRoute>,
}

impl LocalPlan {
    pub fn switches(&self) -> Vec<SwitchId> {
        self.targets.iter().map(|target| target.switch).unique().collect()
    }
}

impl FibManager {
    /// Finds where `entry` has a local footprint.
    ///
    /// The prefix binding wins; otherwise each extra-route next hop with a
    /// binding is a target; otherwise a self-imported route follows its
    /// label to the switch of the original install. BGP routes never have a
    /// local footprint.
    pub(crate) async fn plan_local(&self, vpn: &VpnInstance, entry: &VrfEntry) -> Result<LocalPlan> {
        if entry.is_bgp() {
            return Ok(LocalPlan::default());
        }

        if let Some(binding) = self.store.prefix_binding(vpn.vpn_id, &entry.prefix).await? {
            return Ok(LocalPlan {
                targets: vec![LocalTarget::bound(vpn.vpn_id, binding, entry)],
                ecmp_routes: Vec::new(),
            });
        }

        let routes = self.store.extra_routes(&vpn.name, &entry.prefix).await?;
        if !routes.is_empty() {
            let next_hops: Vec<IpAddr> = routes
                .iter()
                .flat_map(|route| route.next_hops.iter().copied())
                .unique()
                .collect();
            let mut targets = Vec::new();
            for next_hop in &next_hops {
                match self
                    .store
                    .prefix_binding(vpn.vpn_id, &IpPrefix::host(*next_hop))
                    .await?
                {
                    Some(binding) => targets.push(LocalTarget::bound(vpn.vpn_id, binding, entry)),
                    None => debug!(
                        "FibManager: extra route next hop {} of {} is not bound",
                        next_hop, entry.prefix
                    ),
                }
            }
            let ecmp_routes = if next_hops.len() > 1 { routes } else { Vec::new() };
            return Ok(LocalPlan { targets, ecmp_routes });
        }

        if entry.is_self_imported() {
            if let Some(target) = self.label_target(entry).await? {
                return Ok(LocalPlan {
                    targets: vec![target],
                    ecmp_routes: Vec::new(),
                });
            }
        }

        debug!("FibManager: {} in {} has no local footprint", entry.prefix, vpn.name);
        Ok(LocalPlan::default())
    }

    /// Local install recorded behind the route's label, if any.
    async fn label_target(&self, entry: &VrfEntry) -> Result<Option<LocalTarget>> {
        let Some(label) = entry.first_label() else {
            return Ok(None);
        };
        let Some(info) = self.labels.route_info(label).await? else {
            return Ok(None);
        };
        if info.prefix != entry.prefix {
            warn!(
                "FibManager: label {} belongs to {}, not {}",
                label, info.prefix, entry.prefix
            );
            return Ok(None);
        }
        let Some(switch) = info.switch else {
            return Ok(None);
        };
        let binding = self
            .store
            .prefix_binding(info.parent_vpn_id, &info.prefix)
            .await?;
        Ok(Some(LocalTarget {
            switch,
            group_vpn_id: info.parent_vpn_id,
            group_next_hop: info.prefix.address(),
            binding,
            owned_elsewhere: false,
            self_import: entry.is_self_imported(),
            next_hops: info.next_hops,
        }))
    }

    /// Installs the local copies of `entry` and returns its footprint.
    ///
    /// Targets owned by other services are part of the footprint but get
    /// nothing installed, so they are also excluded from remote installs.
    pub(crate) async fn install_local(
        &self,
        vpn: &VpnInstance,
        rd: &str,
        entry: &VrfEntry,
        scope: Option<SwitchId>,
        mode: InstallMode,
        batch: &mut FlowBatch,
    ) -> Result<Vec<SwitchId>> {
        let plan = self.plan_local(vpn, entry).await?;

        for target in &plan.targets {
            if target.owned_elsewhere {
                debug!(
                    "FibManager: {} on switch {} is programmed by another service",
                    entry.prefix, target.switch
                );
                continue;
            }
            if scope.is_some_and(|switch| switch != target.switch) {
                continue;
            }
            let Some(binding) = &target.binding else {
                warn!(
                    "FibManager: no binding behind the local install of {} on switch {}",
                    entry.prefix, target.switch
                );
                continue;
            };
            self.install_local_target(vpn, rd, entry, target, binding, &plan.ecmp_routes, mode, batch)
                .await?;
        }

        Ok(plan.switches())
    }

    #[allow(clippy::too_many_arguments)]
    async fn install_local_target(
        &self,
        vpn: &VpnInstance,
        rd: &str,
        entry: &VrfEntry,
        target: &LocalTarget,
        binding: &PrefixBinding,
        ecmp_routes: &[ExtraRoute],
        mode: InstallMode,
        batch: &mut FlowBatch,
    ) -> Result<()> {
        let single = match mode {
            InstallMode::Fresh => {
                self.groups
                    .get_or_create_single(target.group_vpn_id, binding, batch)
                    .await?
            }
            InstallMode::Replay => {
                self.groups
                    .ensure_single(target.group_vpn_id, binding, batch)
                    .await?
            }
        };
        let fib_group = if ecmp_routes.is_empty() {
            single
        } else {
            self.groups
                .build_load_balance(vpn, target.switch, entry, ecmp_routes, batch)
                .await?
        };

        batch.install_flow(fib_group_rule(
            target.switch,
            vpn.vpn_id,
            &entry.prefix,
            self.config.fib_priority(entry.prefix.prefix_len()),
            fib_group,
        ));

        let label = entry.label_for(Some(target.group_next_hop));
        if !target.self_import && !entry.is_vni_enforced() {
            if let Some(label) = label {
                self.install_termination(target.switch, entry, label, single, batch);
            }
        }

        if let Some(label) = label {
            let claim = LabelClaim {
                label,
                prefix: entry.prefix,
                next_hops: target.next_hops.clone(),
                switch: Some(target.switch),
                vpn_id: target.group_vpn_id,
                vpn_name: vpn.name.clone(),
                rd: entry
                    .parent_vpn_rd
                    .clone()
                    .filter(|_| target.self_import)
                    .unwrap_or_else(|| rd.to_string()),
                self_import: target.self_import,
            };
            self.labels.allocate_or_update_reference(&claim).await?;
        }
        Ok(())
    }

    /// LFIB and tunnel-termination rules delivering labelled traffic to the
    /// single group of the local endpoint.
    fn install_termination(
        &self,
        switch: SwitchId,
        entry: &VrfEntry,
        label: u32,
        group_id: u64,
        batch: &mut FlowBatch,
    ) {
        batch.install_flow(lfib_rule(
            switch,
            label,
            &entry.prefix,
            self.config.lfib_priority,
            vec![Action::Group(group_id)],
            Vec::new(),
        ));
        batch.install_flow(tunnel_termination_rule(
            switch,
            u64::from(label),
            self.config.tunnel_termination_priority,
            vec![Instruction::ApplyActions(vec![Action::Group(group_id)])],
        ));
    }

    /// Removes the local copies of `entry` and returns its footprint.
    ///
    /// When the binding is already gone the label record still tells where
    /// the route was installed.
    pub(crate) async fn remove_local(
        &self,
        vpn: &VpnInstance,
        entry: &VrfEntry,
        scope: Option<SwitchId>,
        batch: &mut FlowBatch,
    ) -> Result<Vec<SwitchId>> {
        let mut plan = self.plan_local(vpn, entry).await?;
        if plan.targets.is_empty() && !entry.is_bgp() {
            if let Some(target) = self.label_target(entry).await? {
                plan.targets.push(target);
            }
        }

        for target in &plan.targets {
            if target.owned_elsewhere || scope.is_some_and(|switch| switch != target.switch) {
                continue;
            }
            let switch = target.switch;
            batch.remove_flow(switch, FIB_TABLE, fib_flow_ref(switch, vpn.vpn_id, &entry.prefix));
            if !target.self_import && !entry.is_vni_enforced() {
                if let Some(label) = entry.label_for(Some(target.group_next_hop)) {
                    batch.remove_flow(switch, LFIB_TABLE, lfib_flow_ref(switch, label));
                    batch.remove_flow(
                        switch,
                        INTERNAL_TUNNEL_TABLE,
                        tunnel_flow_ref(switch, u64::from(label)),
                    );
                }
            }
            self.groups
                .remove_load_balance(switch, vpn.vpn_id, &entry.prefix, batch)
                .await?;
            self.groups
                .release_single(target.group_vpn_id, target.group_next_hop, batch)
                .await?;
        }

        Ok(plan.switches())
    }
}
