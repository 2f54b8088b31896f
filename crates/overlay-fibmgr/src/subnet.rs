//! Aggregate subnet routes.
//!
//! A subnet route hands matching traffic to flood-domain processing: the
//! FIB rule writes the ELAN tag and VPN id into metadata and continues in
//! the subnet-route table. Labelled traffic for the subnet gets the same
//! treatment from the LFIB, and the directed broadcast address is dropped.
//! Nothing here is stateful beyond the label record.

use log::debug;
use overlay_types::{IpPrefix, SwitchId};
use std::net::IpAddr;

use crate::error::Result;
use crate::flow::{
    broadcast_drop_flow_ref, fib_flow_ref, lfib_flow_ref, subnet_metadata, Action, FlowBatch,
    FlowEntity, Instruction, COOKIE_SUBNET_ROUTE, FIB_TABLE, LFIB_TABLE, SUBNET_ROUTE_TABLE,
};
use crate::label::LabelClaim;
use crate::route::rules::{fib_rule, lfib_rule};
use crate::route::FibManager;
use crate::vpn::{SubnetRoute, VpnInstance, VrfEntry};

fn subnet_instructions(subnet: SubnetRoute, vpn_id: u32) -> Vec<Instruction> {
    let (value, mask) = subnet_metadata(subnet.elan_tag, vpn_id);
    vec![
        Instruction::WriteMetadata { value, mask },
        Instruction::GotoTable(SUBNET_ROUTE_TABLE),
    ]
}

fn scoped(switches: Vec<SwitchId>, scope: Option<SwitchId>) -> Vec<SwitchId> {
    match scope {
        Some(only) => switches.into_iter().filter(|switch| *switch == only).collect(),
        None => switches,
    }
}

impl FibManager {
    fn broadcast_drop_rule(&self, switch: SwitchId, vpn_id: u32, broadcast: IpAddr) -> FlowEntity {
        let host = IpPrefix::host(broadcast);
        FlowEntity {
            flow_ref: broadcast_drop_flow_ref(switch, vpn_id, &broadcast),
            ..fib_rule(
                switch,
                vpn_id,
                &host,
                self.config.subnet_broadcast_drop_priority,
                COOKIE_SUBNET_ROUTE,
                vec![Instruction::ApplyActions(vec![Action::Drop])],
            )
        }
    }

    /// Installs the subnet rules on every active switch of the VPN, or only
    /// on `scope`.
    pub(crate) async fn install_subnet_route(
        &self,
        vpn: &VpnInstance,
        rd: &str,
        entry: &VrfEntry,
        subnet: SubnetRoute,
        scope: Option<SwitchId>,
        batch: &mut FlowBatch,
    ) -> Result<()> {
        let labels = if entry.is_self_imported() {
            Vec::new()
        } else {
            entry.labels()
        };
        let broadcast = entry.prefix.broadcast().map(IpAddr::V4);

        for switch in scoped(vpn.active_switches(), scope) {
            batch.install_flow(fib_rule(
                switch,
                vpn.vpn_id,
                &entry.prefix,
                self.config.fib_priority(entry.prefix.prefix_len()),
                COOKIE_SUBNET_ROUTE,
                subnet_instructions(subnet, vpn.vpn_id),
            ));
            for label in &labels {
                batch.install_flow(lfib_rule(
                    switch,
                    *label,
                    &entry.prefix,
                    self.config.lfib_priority,
                    Vec::new(),
                    subnet_instructions(subnet, vpn.vpn_id),
                ));
            }
            if let Some(broadcast) = broadcast {
                batch.install_flow(self.broadcast_drop_rule(switch, vpn.vpn_id, broadcast));
            }
        }
        debug!(
            "FibManager: subnet route {} of {} redirected to ELAN {}",
            entry.prefix, vpn.name, subnet.elan_tag
        );

        for label in entry.labels() {
            let claim = LabelClaim {
                label,
                prefix: entry.prefix,
                next_hops: entry.next_hops(),
                switch: None,
                vpn_id: vpn.vpn_id,
                vpn_name: vpn.name.clone(),
                rd: entry
                    .parent_vpn_rd
                    .clone()
                    .filter(|_| entry.is_self_imported())
                    .unwrap_or_else(|| rd.to_string()),
                self_import: entry.is_self_imported(),
            };
            self.labels.allocate_or_update_reference(&claim).await?;
        }
        Ok(())
    }

    /// Removes the three rule families from every switch of the VPN. The
    /// label is released by the caller once the batch is committed.
    pub(crate) fn remove_subnet_route(
        &self,
        vpn: &VpnInstance,
        entry: &VrfEntry,
        scope: Option<SwitchId>,
        batch: &mut FlowBatch,
    ) -> Result<()> {
        let broadcast = entry.prefix.broadcast().map(IpAddr::V4);
        for switch in scoped(vpn.all_switches(), scope) {
            batch.remove_flow(switch, FIB_TABLE, fib_flow_ref(switch, vpn.vpn_id, &entry.prefix));
            if !entry.is_self_imported() {
                for label in entry.labels() {
                    batch.remove_flow(switch, LFIB_TABLE, lfib_flow_ref(switch, label));
                }
            }
            if let Some(broadcast) = broadcast {
                batch.remove_flow(
                    switch,
                    FIB_TABLE,
                    broadcast_drop_flow_ref(switch, vpn.vpn_id, &broadcast),
                );
            }
        }
        Ok(())
    }
}
