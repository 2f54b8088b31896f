//! Route exchange over inter-VPN links.
//!
//! Traffic crosses a link by switching VPN context: the FIB (and LFIB, for
//! labelled traffic) rule writes the dispatch tag of the endpoint to enter
//! and resumes in the dispatcher table, on the switches hosting that
//! endpoint. BGP routes of a VPN are additionally leaked into the sibling
//! VPN as shadow entries pointing back across the link.

use log::{debug, warn};
use overlay_types::{IpPrefix, SwitchId};

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::error::Result;
use crate::flow::{
    fib_flow_ref, lfib_flow_ref, lport_tag_metadata, FlowBatch, Instruction, COOKIE_VM_FIB,
    DISPATCHER_TABLE, FIB_TABLE, LFIB_TABLE, LPORT_TAG_MASK,
};
use crate::route::rules::{fib_rule, lfib_rule};
use crate::route::FibManager;
use crate::vpn::{InterVpnLink, LinkEndpoint, RouteOrigin, VpnInstance, VrfEntry};

fn switching_instructions(endpoint: &LinkEndpoint) -> Vec<Instruction> {
    vec![
        Instruction::WriteMetadata {
            value: lport_tag_metadata(endpoint.lport_tag),
            mask: LPORT_TAG_MASK,
        },
        Instruction::GotoTable(DISPATCHER_TABLE),
    ]
}

fn endpoint_switches(endpoint: &LinkEndpoint, scope: Option<SwitchId>) -> Vec<SwitchId> {
    endpoint
        .switches
        .iter()
        .copied()
        .filter(|switch| scope.map_or(true, |only| only == *switch))
        .collect()
}

impl FibManager {
    /// Programs a route whose next hop is the far endpoint of `link` on the
    /// switches hosting that endpoint.
    pub(crate) async fn install_inter_vpn_route(
        &self,
        vpn: &VpnInstance,
        rd: &str,
        entry: &VrfEntry,
        link: &InterVpnLink,
        scope: Option<SwitchId>,
        batch: &mut FlowBatch,
    ) -> Result<()> {
        if !link.is_active() {
            debug!(
                "FibManager: link {} is {:?}, {} in {} not programmed",
                link.name, link.state, entry.prefix, vpn.name
            );
            return Ok(());
        }
        if entry.is_bgp() && !link.leak_bgp_routes {
            debug!(
                "FibManager: link {} does not carry BGP routes, skipping {} (rd {})",
                link.name, entry.prefix, rd
            );
            return Ok(());
        }
        let Some(sibling) = link.sibling_of(&vpn.name) else {
            return Ok(());
        };

        self.install_link_switching(vpn.vpn_id, &entry.prefix, entry.first_label(), sibling, scope, batch);
        Ok(())
    }

    pub(crate) async fn remove_inter_vpn_route(
        &self,
        vpn: &VpnInstance,
        _rd: &str,
        entry: &VrfEntry,
        link: &InterVpnLink,
        scope: Option<SwitchId>,
        batch: &mut FlowBatch,
    ) -> Result<()> {
        if let Some(sibling) = link.sibling_of(&vpn.name) {
            self.remove_link_switching(vpn.vpn_id, &entry.prefix, entry.first_label(), sibling, scope, batch);
        }
        Ok(())
    }

    /// Context switch into `endpoint` for `prefix` of VPN `vpn_id`.
    fn install_link_switching(
        &self,
        vpn_id: u32,
        prefix: &IpPrefix,
        label: Option<u32>,
        endpoint: &LinkEndpoint,
        scope: Option<SwitchId>,
        batch: &mut FlowBatch,
    ) {
        for switch in endpoint_switches(endpoint, scope) {
            batch.install_flow(fib_rule(
                switch,
                vpn_id,
                prefix,
                self.config.fib_priority(prefix.prefix_len()),
                COOKIE_VM_FIB,
                switching_instructions(endpoint),
            ));
            if let Some(label) = label {
                batch.install_flow(lfib_rule(
                    switch,
                    label,
                    prefix,
                    self.config.lfib_priority,
                    Vec::new(),
                    switching_instructions(endpoint),
                ));
            }
        }
    }

    fn remove_link_switching(
        &self,
        vpn_id: u32,
        prefix: &IpPrefix,
        label: Option<u32>,
        endpoint: &LinkEndpoint,
        scope: Option<SwitchId>,
        batch: &mut FlowBatch,
    ) {
        for switch in endpoint_switches(endpoint, scope) {
            batch.remove_flow(switch, FIB_TABLE, fib_flow_ref(switch, vpn_id, prefix));
            if let Some(label) = label {
                batch.remove_flow(switch, LFIB_TABLE, lfib_flow_ref(switch, label));
            }
        }
    }

    /// Leaks a BGP route of `vpn` into the sibling VPN of every active link
    /// that allows it.
    ///
    /// The shadow entry gets a label of its own, allocated under the
    /// sibling's rd, and points at this VPN's endpoint.
    pub(crate) async fn leak_bgp_route(
        &self,
        vpn: &VpnInstance,
        rd: &str,
        entry: &VrfEntry,
        links: &[InterVpnLink],
        batch: &mut FlowBatch,
    ) -> Result<()> {
        for link in links.iter().filter(|link| link.is_active() && link.leak_bgp_routes) {
            let (Some(own), Some(sibling)) = (link.endpoint_of(&vpn.name), link.sibling_of(&vpn.name))
            else {
                continue;
            };
            let Some(sibling_vpn) = self.store.vpn_instance_by_name(&sibling.vpn_name).await? else {
                warn!(
                    "FibManager: VPN {} of link {} is unknown, {} not leaked",
                    sibling.vpn_name, link.name, entry.prefix
                );
                continue;
            };

            let label = self.labels.allocate(&sibling_vpn.rd, &entry.prefix).await?;
            let shadow = VrfEntry::new(entry.prefix, RouteOrigin::InterVpn)
                .with_route_path(own.ip, Some(label))
                .with_parent_rd(rd);
            self.store.put_vrf_entry(&sibling_vpn.rd, shadow).await?;
            self.install_link_switching(sibling_vpn.vpn_id, &entry.prefix, Some(label), own, None, batch);

            audit_log!(AuditRecord::new(AuditCategory::RouteLeak, "FibManager", "leak_route")
                .with_outcome(AuditOutcome::Success)
                .with_object_id(format!("{}:{}", sibling_vpn.rd, entry.prefix))
                .with_object_type("vrf_entry")
                .with_details(serde_json::json!({
                    "link": link.name,
                    "from": vpn.name,
                    "into": sibling_vpn.name,
                    "label": label,
                })));
        }
        Ok(())
    }

    /// Withdraws the shadow entries leaked for `entry`. Shadows not created
    /// from this rd are left alone.
    pub(crate) async fn unleak_bgp_route(
        &self,
        vpn: &VpnInstance,
        rd: &str,
        entry: &VrfEntry,
        links: &[InterVpnLink],
        batch: &mut FlowBatch,
    ) -> Result<()> {
        for link in links {
            let (Some(own), Some(sibling)) = (link.endpoint_of(&vpn.name), link.sibling_of(&vpn.name))
            else {
                continue;
            };
            let Some(sibling_vpn) = self.store.vpn_instance_by_name(&sibling.vpn_name).await? else {
                continue;
            };
            let Some(shadow) = self.store.vrf_entry(&sibling_vpn.rd, &entry.prefix).await? else {
                continue;
            };
            if shadow.origin != RouteOrigin::InterVpn || shadow.parent_vpn_rd.as_deref() != Some(rd) {
                continue;
            }

            self.remove_link_switching(
                sibling_vpn.vpn_id,
                &entry.prefix,
                shadow.first_label(),
                own,
                None,
                batch,
            );
            self.store.delete_vrf_entry(&sibling_vpn.rd, &entry.prefix).await?;
            self.labels.free(&sibling_vpn.rd, &entry.prefix).await?;

            audit_log!(AuditRecord::new(AuditCategory::RouteLeak, "FibManager", "withdraw_leak")
                .with_outcome(AuditOutcome::Success)
                .with_object_id(format!("{}:{}", sibling_vpn.rd, entry.prefix))
                .with_object_type("vrf_entry")
                .with_details(serde_json::json!({
                    "link": link.name,
                    "from": vpn.name,
                    "into": sibling_vpn.name,
                })));
        }
        Ok(())
    }
}
