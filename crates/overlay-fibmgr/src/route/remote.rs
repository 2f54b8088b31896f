use itertools::Itertools;
use log::{debug, warn};
use overlay_types::SwitchId;

use super::manager::FibManager;
use super::rules::{fib_group_rule, fib_rule};
use crate::adjacency::{AdjacencyKind, AdjacencyResult};
use crate::encap::{default_tunnel_kind, mac_rewrite, tunnel_encap, EgressCache};
use crate::error::{FibError, Result};
use crate::flow::{fib_flow_ref, Action, Bucket, FlowBatch, Instruction, COOKIE_VM_FIB, FIB_TABLE};
use crate::vpn::{VpnInstance, VrfEntry};

impl FibManager {
    /// Installs the FIB rule of `entry` on a switch without a local copy.
    ///
    /// Extra routes with more than one next hop and BGP routes resolving to
    /// several adjacencies go through a load-balance group. Otherwise one
    /// rule per adjacency is written under the same flow reference.
    /// Returns [`FibError::Unresolvable`] when the switch has no usable
    /// egress; nothing is written in that case.
    pub(crate) async fn install_remote(
        &self,
        vpn: &VpnInstance,
        rd: &str,
        entry: &VrfEntry,
        switch: SwitchId,
        batch: &mut FlowBatch,
    ) -> Result<()> {
        let priority = self.config.fib_priority(entry.prefix.prefix_len());

        if !entry.is_bgp() {
            let routes = self.store.extra_routes(&vpn.name, &entry.prefix).await?;
            let next_hops = routes
                .iter()
                .flat_map(|route| route.next_hops.iter())
                .unique()
                .count();
            if next_hops > 1 {
                let group = self
                    .groups
                    .build_load_balance(vpn, switch, entry, &routes, batch)
                    .await?;
                batch.install_flow(fib_group_rule(switch, vpn.vpn_id, &entry.prefix, priority, group));
                return Ok(());
            }
        }

        let adjacencies = self.adjacency.resolve(switch, vpn, entry).await?;
        let mut egress = EgressCache::new(self.egress.as_ref());
        let mut chains = Vec::with_capacity(adjacencies.len());
        for adjacency in &adjacencies {
            if let Some(actions) = self.adjacency_actions(entry, adjacency, &mut egress).await? {
                chains.push(actions);
            }
        }
        if chains.is_empty() {
            return Err(FibError::Unresolvable {
                switch,
                prefix: entry.prefix,
            });
        }

        if entry.is_bgp() && chains.len() > 1 {
            let buckets = chains.into_iter().map(Bucket::new).collect();
            let group = self
                .groups
                .install_load_balance(vpn.vpn_id, switch, &entry.prefix, buckets, batch)
                .await?;
            batch.install_flow(fib_group_rule(switch, vpn.vpn_id, &entry.prefix, priority, group));
            return Ok(());
        }

        for actions in chains {
            batch.install_flow(fib_rule(
                switch,
                vpn.vpn_id,
                &entry.prefix,
                priority,
                COOKIE_VM_FIB,
                vec![Instruction::ApplyActions(actions)],
            ));
        }
        // A previous multipath version may have left a group behind.
        if self
            .groups
            .remove_load_balance(switch, vpn.vpn_id, &entry.prefix, batch)
            .await?
        {
            debug!(
                "FibManager: {} in {} on switch {} no longer load balanced (rd {})",
                entry.prefix, vpn.name, switch, rd
            );
        }
        Ok(())
    }

    /// Action chain towards one adjacency, `None` when it cannot carry the
    /// route right now.
    async fn adjacency_actions(
        &self,
        entry: &VrfEntry,
        adjacency: &AdjacencyResult,
        egress: &mut EgressCache<'_>,
    ) -> Result<Option<Vec<Action>>> {
        let interface = adjacency.interface_name.as_str();
        match adjacency.kind {
            AdjacencyKind::L2 => {
                let mut actions = mac_rewrite(adjacency.mac);
                actions.extend(egress.actions_for(interface).await?);
                Ok(Some(actions))
            }
            AdjacencyKind::Tunnel => {
                if !self.egress.is_tunnel_up(interface).await? {
                    debug!("FibManager: tunnel {} towards {} is down", interface, adjacency.prefix);
                    return Ok(None);
                }
                let kind = self
                    .egress
                    .tunnel_kind(interface)
                    .await?
                    .unwrap_or_else(|| default_tunnel_kind(entry));
                let label = entry.label_for(adjacency.next_hop);
                let Some(mut actions) = tunnel_encap(kind, entry, label) else {
                    warn!(
                        "FibManager: {} has no label or VNI usable over {} ({:?})",
                        entry.prefix, interface, kind
                    );
                    return Ok(None);
                };
                actions.extend(egress.actions_for(interface).await?);
                Ok(Some(actions))
            }
        }
    }

    pub(crate) async fn remove_remote(
        &self,
        vpn: &VpnInstance,
        entry: &VrfEntry,
        switch: SwitchId,
        batch: &mut FlowBatch,
    ) -> Result<()> {
        batch.remove_flow(switch, FIB_TABLE, fib_flow_ref(switch, vpn.vpn_id, &entry.prefix));
        self.groups
            .remove_load_balance(switch, vpn.vpn_id, &entry.prefix, batch)
            .await?;
        Ok(())
    }
}
