//! Action chains shared by group buckets and remote FIB rules.

use overlay_types::MacAddress;
use std::collections::HashMap;

use crate::error::Result;
use crate::flow::Action;
use crate::southbound::{EgressResolver, TunnelKind};
use crate::vpn::{EncapType, VrfEntry};

/// Tunnel kind to assume when the resolver does not know the interface.
pub fn default_tunnel_kind(entry: &VrfEntry) -> TunnelKind {
    match entry.encap_type {
        Some(EncapType::Vxlan) => TunnelKind::Vxlan,
        _ => TunnelKind::MplsOverGre,
    }
}

/// Encapsulation part of a tunnel action chain.
///
/// MPLS-over-GRE pushes the label. VXLAN rewrites the destination MAC to the
/// gateway when one is known and carries either the L3VNI or the label as
/// tunnel id. Returns `None` when the route has no usable label or VNI.
pub fn tunnel_encap(kind: TunnelKind, entry: &VrfEntry, label: Option<u32>) -> Option<Vec<Action>> {
    match kind {
        TunnelKind::MplsOverGre => {
            let label = label?;
            Some(vec![Action::PushMpls, Action::SetMplsLabel(label)])
        }
        TunnelKind::Vxlan => {
            let tunnel_id = if entry.is_vni_enforced() {
                entry.l3vni
            } else {
                label
            }?;
            let mut actions = Vec::with_capacity(2);
            if let Some(mac) = entry.gateway_mac {
                actions.push(Action::SetDestinationMac(mac));
            }
            actions.push(Action::SetTunnelId(u64::from(tunnel_id)));
            Some(actions)
        }
    }
}

pub fn mac_rewrite(mac: Option<MacAddress>) -> Vec<Action> {
    mac.map(Action::SetDestinationMac).into_iter().collect()
}

/// Egress action lookups, one per distinct interface.
pub struct EgressCache<'a> {
    resolver: &'a dyn EgressResolver,
    cache: HashMap<String, Vec<Action>>,
}

impl<'a> EgressCache<'a> {
    pub fn new(resolver: &'a dyn EgressResolver) -> Self {
        Self {
            resolver,
            cache: HashMap::new(),
        }
    }

    pub async fn actions_for(&mut self, interface: &str) -> Result<Vec<Action>> {
        if let Some(actions) = self.cache.get(interface) {
            return Ok(actions.clone());
        }
        let actions = self.resolver.egress_actions_for(interface).await?;
        self.cache.insert(interface.to_string(), actions.clone());
        Ok(actions)
    }
}
